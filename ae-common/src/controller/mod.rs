//! End-to-end lifecycle of one workspace.
//!
//! ```text
//! Unprepared ─▶ Prepared ─▶ AgentRunning ─▶ PatchExtracted ─▶ Restored
//!      │            │             │                │
//!      └────────────┴─────────────┴────────────────┴──▶ Failed
//! ```
//!
//! Restore runs on every path out of `run`, including failures and
//! cancellation. The [`OriginalRef`] produced by setup stays inside the
//! controller and is handed to the vault explicitly.
//!
//! [`OriginalRef`]: crate::vault::OriginalRef

pub mod retry;
pub mod setup;

pub use retry::{Attempt, AttemptRecord, RetryOutcome, StopReason, run_attempts};
pub use setup::{GroundTruthPatch, PrepareRequest, Prepared, is_url, repo_url_from_patch_url};

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::agent::{AgentMessage, AgentSessionClient, ModelSpec, SessionHandle};
use crate::cancel::CancelToken;
use crate::config::HarnessConfig;
use crate::errors::{GitOperationError, LifecycleError, ValidationError};
use crate::git::Git;
use crate::patch::{self, PatchArtifact};
use crate::path_guard;
use crate::prompt;
use crate::sanitizer::{GitSanitizer, RestoreTarget, short};
use crate::state_file::{StateStore, WorkspaceState, WorkspaceStatus, is_safe_ref};
use crate::trajectory::{RetrySection, RunMetadata, Trajectory, TrajectoryRecorder};
use crate::vault::{BackupVault, HINT_FILE, RestoreReport, WORKSPACE_SIDECAR};
use setup::SetupProgress;

/// Clones get at least this long regardless of the git timeout.
const CLONE_TIMEOUT: Duration = Duration::from_secs(600);

// ── State machine ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unprepared,
    Prepared,
    AgentRunning,
    PatchExtracted,
    Restored,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unprepared => write!(f, "unprepared"),
            Self::Prepared => write!(f, "prepared"),
            Self::AgentRunning => write!(f, "agent_running"),
            Self::PatchExtracted => write!(f, "patch_extracted"),
            Self::Restored => write!(f, "restored"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Record of a lifecycle transition with reason code and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: LifecycleState,
    pub to_state: LifecycleState,
    pub reason_code: String,
    pub transitioned_at_unix_ms: i64,
}

// ── Requests and reports ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub max_attempts: u32,
    pub git_timeout: Duration,
    pub state_dir: PathBuf,
    pub vault: BackupVault,
}

impl ControllerOptions {
    pub fn from_config(harness: &HarnessConfig) -> Self {
        Self {
            max_attempts: harness.max_attempts.value,
            git_timeout: harness.git_timeout(),
            state_dir: harness.state_dir.value.clone(),
            vault: BackupVault::new(),
        }
    }
}

/// Everything `run` needs besides the agent client.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prepare: PrepareRequest,
    pub prompt: String,
    pub output_dir: PathBuf,
    /// File stem for `<stem>.patch` and `<stem>.trajectory.json`.
    pub artifact_stem: String,
    pub model_override: Option<String>,
    /// The agent server's own config file, consulted for a default model.
    pub agent_config_path: PathBuf,
}

#[derive(Debug)]
pub struct RunReport {
    pub final_state: LifecycleState,
    pub baseline_commit: Option<String>,
    pub patch: Option<PatchArtifact>,
    pub patch_path: Option<PathBuf>,
    pub trajectory_path: Option<PathBuf>,
    pub attempts: Vec<AttemptRecord>,
    pub stop: Option<StopReason>,
    /// Why no valid patch was produced.
    pub error: Option<LifecycleError>,
    /// Set when the workspace could not be put back.
    pub restore_error: Option<LifecycleError>,
    pub restored: bool,
    pub transitions: Vec<StateTransition>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            final_state: LifecycleState::Unprepared,
            baseline_commit: None,
            patch: None,
            patch_path: None,
            trajectory_path: None,
            attempts: Vec::new(),
            stop: None,
            error: None,
            restore_error: None,
            restored: false,
            transitions: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.patch.is_some() && self.error.is_none() && self.restore_error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
    pub head: String,
    /// Whether sanitized history had to be swapped back first.
    pub restored_history: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub head: Option<String>,
    pub removed_workspace: bool,
}

/// Per-attempt values the trajectory needs even when the attempt fails.
#[derive(Default)]
struct AttemptScratch {
    session: Option<SessionHandle>,
    reply: Option<AgentMessage>,
}

// ── Controller ─────────────────────────────────────────────────────────────

pub struct WorkspaceController {
    workspace: PathBuf,
    git: Git,
    sanitizer: GitSanitizer,
    store: StateStore,
    cancel: CancelToken,
    max_attempts: u32,
    state: LifecycleState,
    transitions: Vec<StateTransition>,
    mutated: bool,
    workspace_created: bool,
    prepared: Option<Prepared>,
}

impl WorkspaceController {
    pub fn new(workspace: &Path, options: ControllerOptions, cancel: CancelToken) -> Self {
        let workspace = std::path::absolute(workspace).unwrap_or_else(|_| workspace.to_path_buf());
        Self {
            git: Git::new(&workspace, options.git_timeout),
            workspace,
            sanitizer: GitSanitizer::new(options.vault),
            store: StateStore::new(options.state_dir),
            cancel,
            max_attempts: options.max_attempts,
            state: LifecycleState::Unprepared,
            transitions: Vec::new(),
            mutated: false,
            workspace_created: false,
            prepared: None,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Whether any destructive step ran against the workspace.
    pub fn is_mutated(&self) -> bool {
        self.mutated
    }

    pub fn state_store(&self) -> &StateStore {
        &self.store
    }

    pub fn load_state(&self) -> Result<Option<WorkspaceState>, LifecycleError> {
        Ok(self.store.load(&self.workspace)?)
    }

    fn transition(&mut self, to: LifecycleState, reason: &str) {
        let from = self.state;
        info!(
            workspace = %self.workspace.display(),
            "lifecycle transition: {} -> {} ({})", from, to, reason
        );
        self.transitions.push(StateTransition {
            from_state: from,
            to_state: to,
            reason_code: reason.to_string(),
            transitioned_at_unix_ms: Utc::now().timestamp_millis(),
        });
        self.state = to;
    }

    fn mark_manual_intervention(&self) {
        if let Err(e) = self
            .store
            .set_status(&self.workspace, WorkspaceStatus::NeedsManualIntervention)
        {
            warn!(error = %e, "could not update state file");
        }
    }

    // ── Prepare ───────────────────────────────────────────────────────────

    /// Clone `source` into the workspace path when nothing is there yet.
    fn provision(&mut self, source: Option<&str>) -> Result<(), LifecycleError> {
        if self.workspace.exists() {
            return Ok(());
        }
        let Some(source) = source else {
            return Err(ValidationError::WorkspaceNotFound {
                path: self.workspace.clone(),
            }
            .into());
        };
        info!(source, workspace = %self.workspace.display(), "cloning workspace");
        Git::clone_into(source, &self.workspace, self.git.timeout().max(CLONE_TIMEOUT))?;
        self.workspace_created = true;
        Ok(())
    }

    /// Unprepared → Prepared. On failure the partial setup is rolled back
    /// and a workspace this call cloned is removed again.
    pub fn prepare(&mut self, req: &PrepareRequest) -> Result<&Prepared, LifecycleError> {
        if self.state != LifecycleState::Unprepared {
            return Err(ValidationError::Invalid(format!("cannot prepare from state {}", self.state)).into());
        }
        if let Err(e) = self.try_prepare(req) {
            self.transition(LifecycleState::Failed, "setup_failed");
            return Err(e);
        }
        self.transition(LifecycleState::Prepared, "starting_point_ready");
        self.prepared.as_ref().ok_or_else(|| {
            LifecycleError::from(ValidationError::Invalid("prepare produced no result".to_string()))
        })
    }

    fn try_prepare(&mut self, req: &PrepareRequest) -> Result<(), LifecycleError> {
        self.cancel.check()?;
        self.provision(req.source.as_deref())?;

        // A state file left over from an earlier checkout says nothing about a fresh clone.
        let prior = if self.workspace_created {
            None
        } else {
            self.store.load(&self.workspace)?
        };
        let mut progress = SetupProgress::default();
        let result = setup::setup_starting_point(
            &self.workspace,
            &self.git,
            &self.sanitizer,
            req,
            prior.as_ref(),
            &mut progress,
        )
            .and_then(|prepared| {
                self.cancel.check()?;
                self.save_state(&prepared)?;
                Ok(prepared)
            });
        self.mutated |= progress.mutated;

        match result {
            Ok(prepared) => {
                self.prepared = Some(prepared);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "setup failed");
                setup::rollback(&self.workspace, &self.git, &self.sanitizer, &progress);
                if self.workspace_created {
                    match fs::remove_dir_all(&self.workspace) {
                        Ok(()) => self.workspace_created = false,
                        Err(rm) => warn!(error = %rm, "could not remove cloned workspace"),
                    }
                }
                Err(e)
            }
        }
    }

    fn save_state(&self, prepared: &Prepared) -> Result<(), LifecycleError> {
        let state = WorkspaceState {
            workspace: Some(StateStore::workspace_key(&self.workspace)),
            clean_commit: prepared.clean_commit.clone(),
            base_commit: Some(prepared.baseline_commit.clone()),
            source_url: prepared.source_url.clone(),
            created_at: Some(Utc::now()),
            original_ref: Some(prepared.saved_ref.clone()),
            workspace_created: self.workspace_created,
            status: WorkspaceStatus::Prepared,
        };
        let path = self.store.save(&self.workspace, &state)?;
        info!(path = %path.display(), "state file written");
        Ok(())
    }

    // ── Run ───────────────────────────────────────────────────────────────

    /// Full lifecycle. Never returns without attempting restore.
    pub fn run(&mut self, req: &RunRequest, client: &AgentSessionClient) -> RunReport {
        let mut report = RunReport::new();
        let result = self.drive(req, client, &mut report);

        match self.restore() {
            Ok(Some(_)) => report.restored = true,
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "restore failed; workspace needs manual intervention");
                report.restore_error = Some(e);
            }
        }

        match result {
            Ok(()) if report.restore_error.is_none() => self.transition(LifecycleState::Restored, "restored"),
            Ok(()) => self.transition(LifecycleState::Failed, "restore_failed"),
            Err(e) => {
                if self.state != LifecycleState::Failed {
                    let reason = e.kind().to_string();
                    self.transition(LifecycleState::Failed, &reason);
                }
                report.error = Some(e);
            }
        }
        report.final_state = self.state;
        report.transitions = self.transitions.clone();
        report
    }

    fn drive(&mut self, req: &RunRequest, client: &AgentSessionClient, report: &mut RunReport) -> Result<(), LifecycleError> {
        let prompt = prompt::sanitize_prompt(&req.prompt)?;
        if prompt.is_empty() {
            return Err(ValidationError::EmptyPrompt.into());
        }
        self.cancel.check()?;
        let health = client.check_health()?;
        let choice = client.resolve_model(req.model_override.as_deref(), &req.agent_config_path);

        let prepared = self.prepare(&req.prepare)?.clone();
        report.baseline_commit = Some(prepared.baseline_commit.clone());

        let mut meta = RunMetadata::new(&self.workspace, &client.settings().agent, client.base_url());
        meta.server_version = health.version.clone();
        meta.model = choice.model.as_ref().map(ToString::to_string);
        meta.model_source = Some(choice.source.to_string());
        meta.branch = req.prepare.branch.clone();
        meta.ground_truth_patch = req.prepare.gt_patch.as_ref().map(|p| p.origin().to_string());
        meta.baseline_commit = Some(prepared.baseline_commit.clone());

        self.transition(LifecycleState::AgentRunning, "agent_started");
        let cancel = self.cancel.clone();
        let mut last_trajectory: Option<Trajectory> = None;
        let mut winning_session: Option<String> = None;
        let outcome = run_attempts(self.max_attempts, &cancel, |attempt| {
            let (attempt, trajectory, session_id) =
                self.run_attempt(attempt, client, &prompt, choice.model.as_ref(), &prepared, &meta);
            if attempt.result.is_ok() {
                winning_session = session_id;
            }
            if trajectory.is_some() {
                last_trajectory = trajectory;
            }
            attempt
        });

        report.attempts = outcome.attempts.clone();
        report.stop = Some(outcome.stop);
        let retry_section = RetrySection {
            max_attempts: self.max_attempts,
            total_attempts: outcome.attempts.len() as u32,
            attempts: outcome.attempts,
        };

        let result = outcome.result.and_then(|patch| {
            let path = patch.write_to(&req.output_dir, &req.artifact_stem)?;
            Ok((patch, path))
        });

        let (final_diff, final_error) = match &result {
            Ok((patch, _)) => (Some(patch.diff()), None),
            Err(e) => (None, Some(e)),
        };
        let trajectory = last_trajectory
            .unwrap_or_else(|| Trajectory::minimal(meta.clone(), &prompt, final_error))
            .with_output(final_diff, final_error)
            .with_retry(retry_section);
        match trajectory.write_to(&req.output_dir, &req.artifact_stem) {
            Ok(path) => report.trajectory_path = Some(path),
            Err(e) => warn!(error = %e, "could not write trajectory"),
        }
        if let Some(id) = &winning_session {
            client.delete_session(id);
        }

        match result {
            Ok((patch, path)) => {
                self.transition(LifecycleState::PatchExtracted, "patch_extracted");
                report.patch_path = Some(path);
                report.patch = Some(patch);
                Ok(())
            }
            Err(e) => {
                self.transition(LifecycleState::Failed, outcome.stop.as_str());
                Err(e)
            }
        }
    }

    /// One attempt: fresh session, task, patch. Failed sessions are deleted.
    fn run_attempt(
        &self,
        attempt: u32,
        client: &AgentSessionClient,
        prompt: &str,
        model: Option<&ModelSpec>,
        prepared: &Prepared,
        meta: &RunMetadata,
    ) -> (Attempt<PatchArtifact>, Option<Trajectory>, Option<String>) {
        let start = Instant::now();
        let mut recorder = TrajectoryRecorder::new(meta.clone(), prompt);
        let mut scratch = AttemptScratch::default();
        let result = self.attempt_body(attempt, client, prompt, model, prepared, &mut recorder, &mut scratch);
        let session_id = scratch.session.map(|s| s.id);

        let trajectory = session_id.as_deref().map(|id| {
            match client.messages(id) {
                Ok(list) => recorder.push_raw_messages(&list),
                Err(e) => {
                    warn!(session_id = id, error = %e, "could not list session messages");
                    if let Some(reply) = scratch.reply.take() {
                        recorder.push_step(reply);
                    }
                }
            }
            recorder.set_server_data(client.session_info(id), client.file_status(), client.session_diff(id));
            recorder.finish(result.as_ref().ok().map(PatchArtifact::diff), result.as_ref().err())
        });

        let mut record = AttemptRecord::new(attempt);
        record.session_id = session_id.clone();
        let mut record = match &result {
            Ok(patch) => {
                record.patch_valid = true;
                record.patch_validation_reason = format!("valid ({} files)", patch.file_count());
                record.patch_length = patch.diff().len();
                record
            }
            Err(e) => {
                if let Some(id) = &session_id {
                    client.delete_session(id);
                }
                record.failed(e)
            }
        };
        record.duration = (start.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
        (Attempt { result, record }, trajectory, session_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn attempt_body(
        &self,
        attempt: u32,
        client: &AgentSessionClient,
        prompt: &str,
        model: Option<&ModelSpec>,
        prepared: &Prepared,
        recorder: &mut TrajectoryRecorder,
        scratch: &mut AttemptScratch,
    ) -> Result<PatchArtifact, LifecycleError> {
        if attempt > 1 {
            self.reset_to_baseline(prepared)?;
        }
        self.cancel.check()?;

        let session = client.create_session()?;
        recorder.session_created(&session.id);
        scratch.session = Some(session.clone());

        recorder.task_sent();
        let run = client.send_task(&session, prompt, model)?;
        recorder.task_done();
        scratch.reply = Some(run.reply);

        self.cancel.check()?;
        patch::extract_patch(&self.git, &prepared.baseline_commit)
    }

    /// Between attempts: back to the sanitized commit, ignored files from
    /// the vault (resolved through the in-memory ref).
    fn reset_to_baseline(&self, prepared: &Prepared) -> Result<(), LifecycleError> {
        self.git.reset_hard_and_clean(&prepared.baseline_commit)?;
        let vault = self.sanitizer.vault();
        let resolved = vault.resolve(&self.workspace, Some(&prepared.original))?;
        vault.restore_ignored(&self.workspace, &self.git, &resolved);
        info!(baseline = %short(&prepared.baseline_commit), "workspace reset to baseline");
        Ok(())
    }

    // ── Restore / reset / cleanup ─────────────────────────────────────────

    /// Undo `prepare` within the same process. `Ok(None)` when nothing was
    /// prepared. Attempted at most once per preparation.
    pub fn restore(&mut self) -> Result<Option<RestoreReport>, LifecycleError> {
        let Some(prepared) = self.prepared.take() else {
            return Ok(None);
        };
        let vault = self.sanitizer.vault();
        let result = vault
            .resolve(&self.workspace, Some(&prepared.original))
            .map_err(LifecycleError::from)
            .and_then(|resolved| {
                self.sanitizer
                    .restore(&self.workspace, &self.git, &resolved, &RestoreTarget::from(&prepared.original))
            });
        match result {
            Ok(report) => {
                if let Err(e) = self.store.set_status(&self.workspace, WorkspaceStatus::Restored) {
                    warn!(error = %e, "could not update state file");
                }
                Ok(Some(report))
            }
            Err(e) => {
                self.mark_manual_intervention();
                Err(e)
            }
        }
    }

    /// Return the workspace to its pre-`prepare` state from a fresh process,
    /// using the state file and the hint file. Idempotent.
    pub fn reset(&mut self) -> Result<ResetOutcome, LifecycleError> {
        if !self.workspace.exists() {
            return Err(ValidationError::WorkspaceNotFound {
                path: self.workspace.clone(),
            }
            .into());
        }
        if !self.git.is_repository() {
            return Err(ValidationError::NotARepository {
                path: self.workspace.clone(),
            }
            .into());
        }
        let state = self.store.load(&self.workspace)?;

        let mut restored_history = false;
        if GitSanitizer::is_sanitized(&self.workspace, &self.git, state.as_ref()) {
            let Some(state) = &state else {
                return Err(ValidationError::StateFile {
                    path: self.store.path_for(&self.workspace),
                    detail: "workspace is sanitized but no state file exists".to_string(),
                }
                .into());
            };
            let target = RestoreTarget {
                branch_head: state.clean_commit.clone(),
                saved_ref: state.original_ref.clone().unwrap_or_default(),
                saved_head: None,
            };
            let result = self
                .sanitizer
                .vault()
                .resolve(&self.workspace, None)
                .map_err(LifecycleError::from)
                .and_then(|resolved| self.sanitizer.restore(&self.workspace, &self.git, &resolved, &target));
            if let Err(e) = result {
                return Err(self.reset_failed(e));
            }
            restored_history = true;
            self.prepared = None;
        }

        match &state {
            Some(state) => {
                let original = state.original_ref.as_deref().filter(|r| is_safe_ref(r));
                let current = self.git.current_ref()?;
                match original {
                    Some(r) if r != current => {
                        self.git.reset_hard_and_clean(&state.clean_commit)?;
                        self.git.run(&["checkout", "-q", r, "--"])?;
                    }
                    _ => self.git.reset_hard_and_clean("HEAD")?,
                }
                if let Err(e) = self.verify_reset(state) {
                    return Err(self.reset_failed(e));
                }
                self.store.set_status(&self.workspace, WorkspaceStatus::Restored)?;
            }
            None => self.git.reset_hard_and_clean("HEAD")?,
        }
        if let Err(e) = path_guard::remove_entry(&self.workspace.join(WORKSPACE_SIDECAR)) {
            warn!(error = %e, "could not remove workspace sidecar");
        }

        let head = self.git.head()?;
        info!(head = %short(&head), restored_history, "workspace reset");
        self.transition(LifecycleState::Restored, "reset");
        Ok(ResetOutcome { head, restored_history })
    }

    /// After a reset the real history must be back: the recorded clean
    /// commit exists, HEAD is it or the recorded original ref, and no hint
    /// file is left over.
    fn verify_reset(&self, state: &WorkspaceState) -> Result<(), LifecycleError> {
        let head = self.git.head()?;
        let mismatch = |expected: &str| GitOperationError::HeadMismatch {
            expected: expected.to_string(),
            actual: head.clone(),
        };
        if !self.git.has_commit(&state.clean_commit)? || self.workspace.join(HINT_FILE).exists() {
            return Err(mismatch(&state.clean_commit).into());
        }
        match state.original_ref.as_deref().filter(|r| is_safe_ref(r)) {
            Some(r) if self.git.current_ref()? != r && head != state.clean_commit => Err(mismatch(r).into()),
            None if head != state.clean_commit => Err(mismatch(&state.clean_commit).into()),
            _ => Ok(()),
        }
    }

    fn reset_failed(&mut self, e: LifecycleError) -> LifecycleError {
        error!(error = %e, "reset could not bring back the original history");
        self.mark_manual_intervention();
        self.transition(LifecycleState::Failed, "restore_failed");
        e
    }

    /// `reset`, then delete what `prepare` created: the state file and, when
    /// the harness cloned it, the workspace itself.
    pub fn cleanup(&mut self) -> Result<CleanupOutcome, LifecycleError> {
        let state = self.store.load(&self.workspace)?;
        let head = if self.workspace.exists() {
            Some(self.reset()?.head)
        } else {
            None
        };
        let created = state.as_ref().is_some_and(|s| s.workspace_created);
        self.store.remove(&self.workspace)?;

        let mut removed_workspace = false;
        if created && self.workspace.exists() {
            fs::remove_dir_all(&self.workspace).map_err(|source| GitOperationError::Io {
                context: format!("remove {}", self.workspace.display()),
                source,
            })?;
            removed_workspace = true;
            info!(workspace = %self.workspace.display(), "workspace removed");
        }
        Ok(CleanupOutcome {
            head,
            removed_workspace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitizer::HistorySummary;
    use crate::testing::{commit_all, init_repo, init_test_logging};
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        workspace: PathBuf,
        state_dir: PathBuf,
        temp_root: PathBuf,
        commit_a: String,
        commit_b: String,
        gt: GroundTruthPatch,
    }

    /// Repo at B, where B fixes A; the ground truth is `A..B`.
    fn fixture() -> Fixture {
        init_test_logging();
        let root = TempDir::new().unwrap();
        let workspace = root.path().join("ws");
        let temp_root = root.path().join("tmp");
        fs::create_dir_all(&workspace).unwrap();
        fs::create_dir_all(&temp_root).unwrap();
        let git = init_repo(&workspace).unwrap();
        fs::write(workspace.join("lib.rs"), "fn f() -> u8 { 1 }\n").unwrap();
        fs::write(workspace.join(".gitignore"), ".env\n").unwrap();
        let commit_a = commit_all(&git, "a").unwrap();
        fs::write(workspace.join("lib.rs"), "fn f() -> u8 { 2 }\n").unwrap();
        let commit_b = commit_all(&git, "b").unwrap();
        fs::write(workspace.join(".env"), "SECRET=1\n").unwrap();
        let diff = git.stdout(&["diff", &commit_a, &commit_b]).unwrap();
        let gt = GroundTruthPatch::new("fix.patch", format!("{}\n", diff).into_bytes()).unwrap();
        Fixture {
            state_dir: root.path().join("state"),
            _root: root,
            workspace,
            temp_root,
            commit_a,
            commit_b,
            gt,
        }
    }

    fn controller(fx: &Fixture) -> WorkspaceController {
        let options = ControllerOptions {
            max_attempts: 3,
            git_timeout: Duration::from_secs(30),
            state_dir: fx.state_dir.clone(),
            vault: BackupVault::with_temp_root(&fx.temp_root),
        };
        WorkspaceController::new(&fx.workspace, options, CancelToken::new())
    }

    fn request(fx: &Fixture) -> PrepareRequest {
        PrepareRequest {
            workspace: fx.workspace.clone(),
            gt_patch: Some(fx.gt.clone()),
            ..PrepareRequest::default()
        }
    }

    #[test]
    fn test_prepare_sanitizes_and_restore_puts_history_back() {
        let fx = fixture();
        let mut ctl = controller(&fx);
        let baseline = ctl.prepare(&request(&fx)).unwrap().baseline_commit.clone();

        let git = Git::new(&fx.workspace, Duration::from_secs(30));
        assert_eq!(git.head().unwrap(), baseline);
        assert!(HistorySummary::collect(&git).unwrap().is_single_commit());
        assert_eq!(fs::read_to_string(fx.workspace.join("lib.rs")).unwrap(), "fn f() -> u8 { 1 }\n");
        assert_ne!(baseline, fx.commit_a);
        let state = ctl.load_state().unwrap().unwrap();
        assert_eq!(state.clean_commit, fx.commit_b);
        assert_eq!(state.status, WorkspaceStatus::Prepared);

        let report = ctl.restore().unwrap().unwrap();
        assert!(report.skipped.is_empty());
        assert_eq!(git.head().unwrap(), fx.commit_b);
        assert_eq!(fs::read_to_string(fx.workspace.join("lib.rs")).unwrap(), "fn f() -> u8 { 2 }\n");
        assert_eq!(fs::read_to_string(fx.workspace.join(".env")).unwrap(), "SECRET=1\n");
        assert!(!fx.workspace.join(WORKSPACE_SIDECAR).exists());
        assert_eq!(ctl.load_state().unwrap().unwrap().status, WorkspaceStatus::Restored);
        assert!(ctl.restore().unwrap().is_none());
    }

    #[test]
    fn test_failed_setup_rolls_back() {
        let fx = fixture();
        let mut ctl = controller(&fx);
        let bogus = GroundTruthPatch::new(
            "bad.patch",
            b"diff --git a/nope.rs b/nope.rs\n--- a/nope.rs\n+++ b/nope.rs\n@@ -1 +1 @@\n-x\n+y\n".to_vec(),
        )
        .unwrap();
        let req = PrepareRequest {
            gt_patch: Some(bogus),
            ..request(&fx)
        };
        let err = ctl.prepare(&req).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::GitOperation(GitOperationError::ReverseApply { .. })
        ));
        assert_eq!(ctl.state(), LifecycleState::Failed);
        assert!(ctl.is_mutated());
        let git = Git::new(&fx.workspace, Duration::from_secs(30));
        assert_eq!(git.head().unwrap(), fx.commit_b);
        assert!(ctl.load_state().unwrap().is_none());
        assert_eq!(fs::read_dir(&fx.temp_root).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_branch_fails_before_mutation() {
        let fx = fixture();
        let mut ctl = controller(&fx);
        let req = PrepareRequest {
            branch: Some("pr_99".to_string()),
            ..request(&fx)
        };
        let err = ctl.prepare(&req).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::GitOperation(GitOperationError::BranchNotFound { .. })
        ));
        let git = Git::new(&fx.workspace, Duration::from_secs(30));
        assert_eq!(git.current_ref().unwrap(), "main");
    }

    #[test]
    fn test_transitions_are_recorded() {
        let fx = fixture();
        let mut ctl = controller(&fx);
        ctl.prepare(&request(&fx)).unwrap();
        assert!(ctl.prepare(&request(&fx)).is_err());
        ctl.reset().unwrap();
        let t = ctl.transitions();
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].from_state, LifecycleState::Unprepared);
        assert_eq!(t[0].to_state, LifecycleState::Prepared);
        assert_eq!(t[1].to_state, LifecycleState::Restored);
        assert_eq!(t[1].reason_code, "reset");
        assert!(t.iter().all(|x| x.transitioned_at_unix_ms > 0));
        let json = serde_json::to_value(&t[0]).unwrap();
        assert_eq!(json["to_state"], "prepared");
    }

    #[test]
    fn test_prepare_requires_existing_workspace_or_source() {
        let fx = fixture();
        let options = ControllerOptions {
            max_attempts: 3,
            git_timeout: Duration::from_secs(30),
            state_dir: fx.state_dir.clone(),
            vault: BackupVault::with_temp_root(&fx.temp_root),
        };
        let missing = fx.workspace.with_file_name("missing");
        let mut ctl = WorkspaceController::new(&missing, options, CancelToken::new());
        let err = ctl
            .prepare(&PrepareRequest {
                workspace: missing.clone(),
                ..PrepareRequest::default()
            })
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Validation(ValidationError::WorkspaceNotFound { .. })
        ));
        assert!(!ctl.is_mutated());
    }
}
