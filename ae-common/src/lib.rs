//! Agent Eval core: prepare a workspace for an untrusted coding agent, run
//! the agent against it, extract its patch, and put the workspace back.

#[cfg(not(unix))]
compile_error!("ae-common relies on Unix permission bits and is only supported on Unix platforms");

pub mod agent;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod errors;
pub mod git;
pub mod logging;
pub mod patch;
pub mod path_guard;
pub mod prompt;
pub mod sanitizer;
pub mod state_file;
pub mod testing;
pub mod trajectory;
pub mod vault;

pub use cancel::CancelToken;
pub use controller::{ControllerOptions, LifecycleState, RunReport, RunRequest, WorkspaceController};
pub use errors::{ErrorCode, ErrorKind, LifecycleError};
