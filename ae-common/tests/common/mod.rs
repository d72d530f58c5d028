//! Shared fixtures for the lifecycle end-to-end tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ae_common::agent::{
    AgentSessionClient, AgentTransport, ClientSettings, HttpRequest, HttpResponse, Method, TransportError,
};
use ae_common::controller::{ControllerOptions, GroundTruthPatch, PrepareRequest, RunRequest, WorkspaceController};
use ae_common::git::Git;
use ae_common::testing::{Reply, ScriptedTransport, commit_all, init_repo, init_test_logging};
use ae_common::vault::BackupVault;
use ae_common::CancelToken;
use serde_json::{Value, json};
use tempfile::TempDir;

pub const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// A repository sitting at commit B, where B fixes A. The ground truth is
/// the diff `A..B`. Two ignored files exist: `.env` and an executable
/// `tool.sh`.
pub struct Fixture {
    pub root: TempDir,
    pub workspace: PathBuf,
    pub state_dir: PathBuf,
    pub temp_root: PathBuf,
    pub output_dir: PathBuf,
    pub commit_a: String,
    pub commit_b: String,
    pub gt: GroundTruthPatch,
}

pub fn fixture() -> Fixture {
    init_test_logging();
    let root = TempDir::new().unwrap();
    let workspace = root.path().join("widget");
    let temp_root = root.path().join("tmp");
    fs::create_dir_all(&workspace).unwrap();
    fs::create_dir_all(&temp_root).unwrap();

    let git = init_repo(&workspace).unwrap();
    fs::write(workspace.join(".gitignore"), ".env\ntool.sh\n").unwrap();
    fs::write(workspace.join("lib.rs"), "pub fn answer() -> u32 {\n    41\n}\n").unwrap();
    fs::write(workspace.join("README.md"), "widget\n").unwrap();
    let commit_a = commit_all(&git, "initial widget").unwrap();
    fs::write(workspace.join("lib.rs"), "pub fn answer() -> u32 {\n    42\n}\n").unwrap();
    let commit_b = commit_all(&git, "fix the answer").unwrap();

    fs::write(workspace.join(".env"), "SECRET=hunter2\n").unwrap();
    fs::write(workspace.join("tool.sh"), "#!/bin/sh\necho tool\n").unwrap();
    fs::set_permissions(workspace.join("tool.sh"), fs::Permissions::from_mode(0o755)).unwrap();

    let diff = git.stdout(&["diff", &commit_a, &commit_b]).unwrap();
    let gt = GroundTruthPatch::new("fix.patch", format!("{}\n", diff).into_bytes()).unwrap();

    Fixture {
        state_dir: root.path().join("state"),
        output_dir: root.path().join("out"),
        workspace,
        temp_root,
        commit_a,
        commit_b,
        gt,
        root,
    }
}

impl Fixture {
    pub fn git(&self) -> Git {
        Git::new(&self.workspace, GIT_TIMEOUT)
    }

    pub fn options(&self) -> ControllerOptions {
        ControllerOptions {
            max_attempts: 3,
            git_timeout: GIT_TIMEOUT,
            state_dir: self.state_dir.clone(),
            vault: BackupVault::with_temp_root(&self.temp_root),
        }
    }

    pub fn controller(&self) -> WorkspaceController {
        WorkspaceController::new(&self.workspace, self.options(), CancelToken::new())
    }

    pub fn prepare_request(&self) -> PrepareRequest {
        PrepareRequest {
            workspace: self.workspace.clone(),
            source: None,
            branch: None,
            gt_patch: Some(self.gt.clone()),
        }
    }

    pub fn run_request(&self) -> RunRequest {
        RunRequest {
            prepare: self.prepare_request(),
            prompt: "Make `answer` return the right value.".to_string(),
            output_dir: self.output_dir.clone(),
            artifact_stem: "widget_run".to_string(),
            model_override: None,
            agent_config_path: self.root.path().join("no-agent-config.json"),
        }
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.workspace.join(rel)).unwrap()
    }

    /// Entries left in the vault's temp root.
    pub fn backups_left(&self) -> usize {
        fs::read_dir(&self.temp_root).unwrap().count()
    }
}

pub fn client(transport: Arc<dyn AgentTransport>) -> AgentSessionClient {
    let settings = ClientSettings {
        request_timeout: Duration::from_secs(5),
        task_timeout: Duration::from_secs(10),
        poll_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        progress_interval: Duration::from_secs(60),
        ..ClientSettings::default()
    };
    AgentSessionClient::new(transport, settings, CancelToken::new())
}

pub fn assistant_message(session: &str, text: &str) -> Value {
    json!({
        "info": {"id": format!("msg_{}", session), "role": "assistant", "sessionID": session},
        "parts": [{"type": "text", "text": text}],
    })
}

/// A healthy server whose sessions `ses_1..=ses_n` each answer the task
/// with a short assistant reply.
pub fn scripted_agent(sessions: u32) -> ScriptedTransport {
    let t = ScriptedTransport::healthy();
    for i in 1..=sessions {
        let id = format!("ses_{}", i);
        let reply = assistant_message(&id, "done");
        t.on(Method::Post, &format!("/session/{}/message", id), Reply::json(reply.clone()));
        t.on(Method::Get, &format!("/session/{}/message", id), Reply::json(json!([reply])));
    }
    t
}

type Edit = Box<dyn Fn(&Path, u32) + Send + Sync>;

/// Wraps a scripted server and edits the workspace whenever a task is
/// submitted, like a real agent would. The edit gets the 1-based task
/// number.
pub struct EditingAgent {
    inner: ScriptedTransport,
    workspace: PathBuf,
    tasks: AtomicU32,
    edit: Edit,
}

impl EditingAgent {
    pub fn new(inner: ScriptedTransport, workspace: &Path, edit: impl Fn(&Path, u32) + Send + Sync + 'static) -> Self {
        Self {
            inner,
            workspace: workspace.to_path_buf(),
            tasks: AtomicU32::new(0),
            edit: Box::new(edit),
        }
    }

    pub fn scripted(&self) -> &ScriptedTransport {
        &self.inner
    }
}

impl AgentTransport for EditingAgent {
    fn base_url(&self) -> &str {
        self.inner.base_url()
    }

    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        if request.method == Method::Post && request.path.ends_with("/message") {
            let n = self.tasks.fetch_add(1, Ordering::SeqCst) + 1;
            (self.edit)(&self.workspace, n);
        }
        self.inner.send(request)
    }
}
