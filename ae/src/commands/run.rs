//! `ae run`: the full lifecycle in one process.

use std::path::Path;

use ae_common::config::AppConfig;
use ae_common::controller::{RunReport, RunRequest, StopReason};
use ae_common::prompt::load_prompt;
use ae_common::{CancelToken, LifecycleError};
use anyhow::Result;
use tracing::{error, info, warn};

use super::helpers::{artifact_stem, client_for, controller_for, prepare_request};
use crate::{EXIT_CANCELLED, EXIT_NO_PATCH, EXIT_OK, EXIT_RESTORE_FAILED, SetupArgs};

pub fn run(setup: &SetupArgs, prompt_path: &Path, config: &AppConfig, cancel: CancelToken) -> Result<u8> {
    let prompt = load_prompt(prompt_path).map_err(LifecycleError::from)?;
    let prepare = prepare_request(setup)?;

    let client = client_for(&setup.workspace, config, cancel.clone());
    let mut controller = controller_for(&setup.workspace, config, cancel);
    info!(
        workspace = %controller.workspace().display(),
        server = client.base_url(),
        max_attempts = config.harness.max_attempts.value,
        "starting run"
    );

    let request = RunRequest {
        prepare,
        prompt,
        output_dir: config.harness.output_dir.value.clone(),
        artifact_stem: artifact_stem(controller.workspace()),
        model_override: config.server.model.value.clone(),
        agent_config_path: config.server.config_path.value.clone(),
    };
    let report = controller.run(&request, &client);
    print_summary(&report);
    Ok(exit_code(&report))
}

fn print_summary(report: &RunReport) {
    if let Some(path) = &report.patch_path {
        println!("patch: {}", path.display());
    }
    if let Some(path) = &report.trajectory_path {
        println!("trajectory: {}", path.display());
    }
    if let Some(patch) = &report.patch {
        println!(
            "files changed: {} ({} lines)",
            patch.file_count(),
            patch.line_count()
        );
    }
    println!(
        "attempts: {} ({})",
        report.attempts.len(),
        report.stop.map(|s| s.as_str()).unwrap_or("not started")
    );
    if let Some(e) = &report.error {
        let entry = e.code().entry();
        warn!(code = %entry.code, error = %e, "no valid patch");
        eprintln!("error[{}]: {}", entry.code, e);
    }
    if let Some(e) = &report.restore_error {
        let entry = e.code().entry();
        error!(code = %entry.code, error = %e, "workspace was not restored");
        eprintln!("error[{}]: {}", entry.code, e);
        for step in &entry.remediation {
            eprintln!("  - {}", step);
        }
    }
    println!("final state: {}", report.final_state);
}

fn exit_code(report: &RunReport) -> u8 {
    if report.restore_error.is_some() {
        EXIT_RESTORE_FAILED
    } else if matches!(report.error, Some(LifecycleError::Cancelled)) || report.stop == Some(StopReason::Cancelled) {
        EXIT_CANCELLED
    } else if report.succeeded() {
        EXIT_OK
    } else {
        EXIT_NO_PATCH
    }
}
