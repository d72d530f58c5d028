//! `ae prepare`, `ae reset`, `ae cleanup` and `ae status`.

use std::path::Path;

use ae_common::{CancelToken, LifecycleError};
use ae_common::config::AppConfig;
use ae_common::state_file::StateStore;
use anyhow::Result;
use tracing::info;

use super::helpers::{controller_for, prepare_request};
use crate::{EXIT_OK, SetupArgs};

pub fn prepare(setup: &SetupArgs, config: &AppConfig, cancel: CancelToken) -> Result<u8> {
    let req = prepare_request(setup)?;
    let mut controller = controller_for(&setup.workspace, config, cancel);
    let prepared = controller.prepare(&req)?;
    info!(
        clean_commit = %prepared.clean_commit,
        saved_ref = %prepared.saved_ref,
        "workspace prepared; run `ae reset` to restore it"
    );
    println!("{}", prepared.baseline_commit);
    Ok(EXIT_OK)
}

pub fn reset(workspace: &Path, config: &AppConfig, cancel: CancelToken) -> Result<u8> {
    let mut controller = controller_for(workspace, config, cancel);
    let outcome = controller.reset()?;
    if outcome.restored_history {
        info!("original history restored from backup");
    }
    println!("{}", outcome.head);
    Ok(EXIT_OK)
}

pub fn cleanup(workspace: &Path, config: &AppConfig, cancel: CancelToken) -> Result<u8> {
    let mut controller = controller_for(workspace, config, cancel);
    let outcome = controller.cleanup()?;
    if outcome.removed_workspace {
        println!("removed {}", controller.workspace().display());
    } else if let Some(head) = outcome.head {
        println!("{}", head);
    }
    Ok(EXIT_OK)
}

pub fn status(workspace: &Path, config: &AppConfig) -> Result<u8> {
    let store = StateStore::new(config.harness.state_dir.value.clone());
    match store.load(workspace).map_err(LifecycleError::from)? {
        Some(state) => {
            println!("# {}", store.path_for(workspace).display());
            print!("{}", state.render());
        }
        None => println!("no state recorded for {}", workspace.display()),
    }
    Ok(EXIT_OK)
}
