//! Record of what the agent did during a session.
//!
//! [`TrajectoryRecorder`] collects steps and timing marks while a session
//! runs; [`TrajectoryRecorder::finish`] freezes them into a [`Trajectory`]
//! that is written once as JSON next to the patch.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::agent::{AgentMessage, Part, TokenCounts};
use crate::controller::retry::AttemptRecord;
use crate::errors::LifecycleError;

/// Facts about the run known before the agent starts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunMetadata {
    pub session_id: Option<String>,
    pub workspace: String,
    pub workspace_name: String,
    pub agent: String,
    pub server_url: String,
    pub server_version: Option<String>,
    pub model: Option<String>,
    pub model_source: Option<String>,
    pub hostname: String,
    pub platform: String,
    pub harness_version: String,
    pub timestamp_utc: String,
    pub branch: Option<String>,
    pub ground_truth_patch: Option<String>,
    pub baseline_commit: Option<String>,
    pub sanitized: bool,
}

impl RunMetadata {
    pub fn new(workspace: &Path, agent: &str, server_url: &str) -> Self {
        Self {
            workspace: workspace.display().to_string(),
            workspace_name: workspace
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            agent: agent.to_string(),
            server_url: server_url.to_string(),
            hostname: whoami::hostname().unwrap_or_else(|_| "unknown".to_string()),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            harness_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp_utc: rfc3339(Utc::now()),
            sanitized: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InputSection {
    pub prompt: String,
    pub prompt_length: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutputSection {
    pub patch: String,
    pub patch_length: usize,
    pub patch_lines: usize,
    pub has_patch: bool,
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

impl OutputSection {
    pub fn new(patch: Option<&str>, error: Option<&LifecycleError>) -> Self {
        let patch = patch.unwrap_or_default().to_string();
        Self {
            patch_length: patch.len(),
            patch_lines: patch.lines().count(),
            has_patch: !patch.is_empty(),
            patch,
            error: error.map(ToString::to_string),
            error_kind: error.map(|e| e.kind().to_string()),
        }
    }
}

/// Durations in seconds, rounded to milliseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimingSection {
    pub total_duration: f64,
    pub session_creation: f64,
    pub task_execution: f64,
    pub diff_retrieval: f64,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenUsage {
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub total_tool_calls: usize,
    pub tool_call_breakdown: BTreeMap<String, usize>,
    pub failed_tool_calls: usize,
    pub reasoning_steps: usize,
}

impl Stats {
    pub fn from_steps(steps: &[AgentMessage]) -> Self {
        let mut stats = Self {
            total_messages: steps.len(),
            ..Self::default()
        };
        for step in steps {
            match step.role.as_str() {
                "user" => stats.user_messages += 1,
                "assistant" => stats.assistant_messages += 1,
                _ => {}
            }
            for part in &step.parts {
                match part {
                    Part::ToolCall { name, state, .. } => {
                        stats.total_tool_calls += 1;
                        *stats.tool_call_breakdown.entry(name.clone()).or_default() += 1;
                        if state == "error" {
                            stats.failed_tool_calls += 1;
                        }
                    }
                    Part::Reasoning { .. } => stats.reasoning_steps += 1,
                    _ => {}
                }
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub total_attempts: u32,
    pub attempts: Vec<AttemptRecord>,
}

/// The finished record. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Trajectory {
    pub metadata: RunMetadata,
    pub input: InputSection,
    pub output: OutputSection,
    pub timing: TimingSection,
    pub token_usage: TokenUsage,
    pub stats: Stats,
    pub trajectory: Vec<AgentMessage>,
    pub session_raw: Value,
    pub file_status: Value,
    pub diff_raw: Value,
    pub retry: RetrySection,
}

impl Trajectory {
    /// A record for a run in which no session data could be collected.
    pub fn minimal(metadata: RunMetadata, prompt: &str, error: Option<&LifecycleError>) -> Self {
        let now = rfc3339(Utc::now());
        Self {
            metadata,
            input: InputSection {
                prompt: prompt.to_string(),
                prompt_length: prompt.len(),
            },
            output: OutputSection::new(None, error),
            timing: TimingSection {
                started_at: now.clone(),
                finished_at: now,
                ..TimingSection::default()
            },
            token_usage: TokenUsage::default(),
            stats: Stats::default(),
            trajectory: Vec::new(),
            session_raw: Value::Null,
            file_status: Value::Null,
            diff_raw: Value::Null,
            retry: RetrySection::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetrySection) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the output section (the patch is only known after the
    /// session's own record was frozen).
    pub fn with_output(mut self, patch: Option<&str>, error: Option<&LifecycleError>) -> Self {
        self.output = OutputSection::new(patch, error);
        self
    }

    pub fn write_to(&self, dir: &Path, stem: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.trajectory.json", stem));
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        fs::write(&path, json)?;
        info!(
            path = %path.display(),
            messages = self.stats.total_messages,
            tool_calls = self.stats.total_tool_calls,
            "trajectory written"
        );
        Ok(path)
    }
}

/// Collects one session's steps and timing marks.
#[derive(Debug)]
pub struct TrajectoryRecorder {
    metadata: RunMetadata,
    prompt: String,
    started: Instant,
    started_at: DateTime<Utc>,
    session_created: Option<Instant>,
    task_sent: Option<Instant>,
    task_done: Option<Instant>,
    steps: Vec<AgentMessage>,
    session_raw: Value,
    file_status: Value,
    diff_raw: Value,
}

impl TrajectoryRecorder {
    pub fn new(metadata: RunMetadata, prompt: &str) -> Self {
        Self {
            metadata,
            prompt: prompt.to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            session_created: None,
            task_sent: None,
            task_done: None,
            steps: Vec::new(),
            session_raw: Value::Null,
            file_status: Value::Null,
            diff_raw: Value::Null,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut RunMetadata {
        &mut self.metadata
    }

    pub fn session_created(&mut self, session_id: &str) {
        self.metadata.session_id = Some(session_id.to_string());
        self.session_created = Some(Instant::now());
    }

    pub fn task_sent(&mut self) {
        self.task_sent = Some(Instant::now());
    }

    pub fn task_done(&mut self) {
        self.task_done = Some(Instant::now());
    }

    pub fn push_step(&mut self, message: AgentMessage) {
        self.steps.push(message);
    }

    /// Append one step per raw message; entries that are not objects still
    /// produce a (mostly empty) step.
    pub fn push_raw_messages(&mut self, raw: &[Value]) {
        self.steps.extend(raw.iter().map(AgentMessage::from_value));
    }

    pub fn has_steps(&self) -> bool {
        !self.steps.is_empty()
    }

    pub fn set_server_data(&mut self, session_raw: Option<Value>, file_status: Option<Value>, diff_raw: Option<Value>) {
        self.session_raw = session_raw.unwrap_or(Value::Null);
        self.file_status = file_status.unwrap_or(Value::Null);
        self.diff_raw = diff_raw.unwrap_or(Value::Null);
        if self.metadata.model.is_none()
            && let Some(model) = self.session_raw.get("model").filter(|m| !m.is_null())
        {
            self.metadata.model = Some(match model {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
    }

    pub fn finish(self, patch: Option<&str>, error: Option<&LifecycleError>) -> Trajectory {
        let end = Instant::now();
        let secs = |a: Instant, b: Instant| round3(b.saturating_duration_since(a));
        let created = self.session_created.unwrap_or(self.started);
        let sent = self.task_sent.unwrap_or(created);
        let done = self.task_done.unwrap_or(sent);
        let finished_at = self.started_at
            + chrono::Duration::from_std(end - self.started).unwrap_or_else(|_| chrono::Duration::zero());

        let mut tokens = TokenCounts::default();
        for step in &self.steps {
            tokens += step.tokens();
        }

        Trajectory {
            input: InputSection {
                prompt_length: self.prompt.len(),
                prompt: self.prompt,
            },
            output: OutputSection::new(patch, error),
            timing: TimingSection {
                total_duration: secs(self.started, end),
                session_creation: secs(self.started, created),
                task_execution: secs(sent, done),
                diff_retrieval: secs(done, end),
                started_at: rfc3339(self.started_at),
                finished_at: rfc3339(finished_at),
            },
            token_usage: TokenUsage {
                total_tokens: tokens.total,
                prompt_tokens: tokens.prompt,
                completion_tokens: tokens.completion,
                cost: tokens.cost,
            },
            stats: Stats::from_steps(&self.steps),
            trajectory: self.steps,
            metadata: self.metadata,
            session_raw: self.session_raw,
            file_status: self.file_status,
            diff_raw: self.diff_raw,
            retry: RetrySection::default(),
        }
    }
}

fn round3(d: Duration) -> f64 {
    (d.as_secs_f64() * 1000.0).round() / 1000.0
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PatchValidationError;
    use serde_json::json;

    #[test]
    fn test_recorder_collects_stats_and_tokens() {
        let meta = RunMetadata::new(Path::new("/work/repo"), "build", "http://h");
        assert_eq!(meta.workspace_name, "repo");
        let mut rec = TrajectoryRecorder::new(meta, "do the thing");
        rec.session_created("ses_1");
        rec.task_sent();
        rec.push_raw_messages(&[
            json!({"role": "user", "parts": [{"type": "text", "text": "do the thing"}]}),
            json!({"info": {"role": "assistant", "totalTokens": 30, "promptTokens": 20, "completionTokens": 10},
                   "parts": [
                       {"type": "tool", "name": "bash", "state": "completed"},
                       {"type": "tool", "name": "bash", "state": "error"},
                       {"type": "tool", "name": "edit", "state": "completed"},
                       {"type": "reasoning", "text": "hmm"}
                   ]}),
            json!("garbage"),
        ]);
        rec.task_done();
        rec.set_server_data(Some(json!({"id": "ses_1", "model": "p/m"})), None, Some(json!([])));
        let t = rec.finish(Some("diff --git a/x b/x\n"), None);

        assert_eq!(t.metadata.session_id.as_deref(), Some("ses_1"));
        assert_eq!(t.metadata.model.as_deref(), Some("p/m"));
        assert!(t.metadata.sanitized);
        assert_eq!(t.stats.total_messages, 3);
        assert_eq!(t.stats.user_messages, 1);
        assert_eq!(t.stats.assistant_messages, 1);
        assert_eq!(t.stats.total_tool_calls, 3);
        assert_eq!(t.stats.tool_call_breakdown["bash"], 2);
        assert_eq!(t.stats.failed_tool_calls, 1);
        assert_eq!(t.stats.reasoning_steps, 1);
        assert_eq!(t.token_usage.total_tokens, 30);
        assert!(t.output.has_patch);
        assert_eq!(t.trajectory[2].role, "?");
    }

    #[test]
    fn test_minimal_record_and_json_sections() {
        let err = LifecycleError::PatchValidation(PatchValidationError::Empty);
        let t = Trajectory::minimal(RunMetadata::default(), "p", Some(&err)).with_retry(RetrySection {
            max_attempts: 3,
            total_attempts: 3,
            attempts: Vec::new(),
        });
        let v = serde_json::to_value(&t).unwrap();
        for key in [
            "metadata", "input", "output", "timing", "token_usage", "stats", "trajectory",
            "session_raw", "file_status", "diff_raw", "retry",
        ] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        assert_eq!(v["output"]["error_kind"], "patch_validation");
        assert_eq!(v["output"]["has_patch"], false);
        assert_eq!(v["retry"]["total_attempts"], 3);
    }

    #[test]
    fn test_write_to() {
        let dir = tempfile::TempDir::new().unwrap();
        let t = Trajectory::minimal(RunMetadata::default(), "p", None);
        let path = t.write_to(&dir.path().join("out"), "repo_1").unwrap();
        assert!(path.ends_with("repo_1.trajectory.json"));
        let back: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(back["input"]["prompt"], "p");
    }
}
