//! Shared helpers for the subcommands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ae_common::agent::{AgentSessionClient, ClientSettings, HttpTransport};
use ae_common::config::AppConfig;
use ae_common::controller::{ControllerOptions, GroundTruthPatch, PrepareRequest, WorkspaceController, is_url};
use ae_common::errors::ValidationError;
use ae_common::{CancelToken, LifecycleError};
use anyhow::Result;
use tracing::info;

use crate::SetupArgs;

const PATCH_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

pub fn controller_for(workspace: &Path, config: &AppConfig, cancel: CancelToken) -> WorkspaceController {
    WorkspaceController::new(workspace, ControllerOptions::from_config(&config.harness), cancel)
}

pub fn client_for(workspace: &Path, config: &AppConfig, cancel: CancelToken) -> AgentSessionClient {
    let server = &config.server;
    let transport = HttpTransport::new(
        &server.base_url.value,
        &server.username.value,
        server.password.value.as_ref(),
    );
    let directory = std::path::absolute(workspace).unwrap_or_else(|_| workspace.to_path_buf());
    let settings = ClientSettings {
        agent: server.agent.value.clone(),
        directory: Some(directory.display().to_string()),
        task_timeout: config.harness.task_timeout(),
        poll_timeout: config.harness.poll_timeout(),
        poll_interval: config.harness.poll_interval(),
        ..ClientSettings::default()
    };
    AgentSessionClient::new(Arc::new(transport), settings, cancel)
}

/// Build the prepare request, fetching a URL ground-truth patch if needed.
/// A missing `--source` falls back to the repository the patch URL names.
pub fn prepare_request(setup: &SetupArgs) -> Result<PrepareRequest> {
    let gt_patch = setup.gt_patch.as_deref().map(load_gt_patch).transpose()?;
    let source = setup
        .source
        .clone()
        .or_else(|| gt_patch.as_ref().and_then(GroundTruthPatch::repo_url));
    Ok(PrepareRequest {
        workspace: setup.workspace.clone(),
        source,
        branch: setup.branch.clone(),
        gt_patch,
    })
}

fn load_gt_patch(spec: &str) -> Result<GroundTruthPatch, LifecycleError> {
    if is_url(spec) {
        info!(url = spec, "downloading ground-truth patch");
        Ok(GroundTruthPatch::new(spec, fetch(spec)?)?)
    } else {
        Ok(GroundTruthPatch::load(Path::new(spec))?)
    }
}

fn fetch(url: &str) -> Result<Vec<u8>, ValidationError> {
    let source_error = |detail: String| ValidationError::PatchSource {
        origin: url.to_string(),
        detail,
    };
    let mut response = ureq::get(url)
        .config()
        .timeout_global(Some(PATCH_FETCH_TIMEOUT))
        .build()
        .call()
        .map_err(|e| source_error(e.to_string()))?;
    response
        .body_mut()
        .read_to_vec()
        .map_err(|e| source_error(e.to_string()))
}

/// `<workspace name>_<UTC timestamp>`, used for the patch and trajectory files.
pub fn artifact_stem(workspace: &Path) -> String {
    let name = workspace
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "workspace".to_string());
    format!("{}_{}", name, chrono::Utc::now().format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_artifact_stem_uses_workspace_name() {
        let stem = artifact_stem(Path::new("/tmp/repos/widget"));
        assert!(stem.starts_with("widget_"));
        assert_eq!(stem.len(), "widget_".len() + "YYYYmmdd_HHMMSS".len());
    }

    #[test]
    fn test_artifact_stem_for_root() {
        assert!(artifact_stem(Path::new("/")).starts_with("workspace_"));
    }

    #[test]
    fn test_prepare_request_reads_patch_file() {
        let dir = tempfile::tempdir().unwrap();
        let patch = dir.path().join("fix.patch");
        std::fs::write(&patch, "diff --git a/x b/x\n").unwrap();
        let setup = SetupArgs {
            workspace: PathBuf::from("/tmp/ws"),
            source: None,
            branch: Some("pr_7".to_string()),
            gt_patch: Some(patch.display().to_string()),
        };
        let req = prepare_request(&setup).unwrap();
        assert_eq!(req.branch.as_deref(), Some("pr_7"));
        assert!(req.source.is_none());
        assert_eq!(req.gt_patch.unwrap().bytes(), b"diff --git a/x b/x\n");
    }

    #[test]
    fn test_prepare_request_rejects_blank_patch() {
        let dir = tempfile::tempdir().unwrap();
        let patch = dir.path().join("empty.patch");
        std::fs::write(&patch, "  \n").unwrap();
        let setup = SetupArgs {
            workspace: PathBuf::from("/tmp/ws"),
            source: None,
            branch: None,
            gt_patch: Some(patch.display().to_string()),
        };
        let err = prepare_request(&setup).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LifecycleError>(),
            Some(LifecycleError::Validation(ValidationError::EmptyGroundTruthPatch))
        ));
    }
}
