//! Test support shared by unit and integration tests.
//!
//! - [`ScriptedTransport`]: an in-memory agent server answering from a
//!   script and counting requests per endpoint.
//! - [`init_test_logging`]: compact tracing output through the test writer.
//! - [`init_repo`] / [`commit_all`]: throwaway git repositories.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, Once};
use std::time::Duration;

use serde_json::Value;
use tracing_subscriber::prelude::*;

use crate::agent::{AgentTransport, HttpRequest, HttpResponse, Method, TransportError};
use crate::errors::GitOperationError;
use crate::git::Git;

static TEST_LOGGING_INIT: Once = Once::new();

/// Install a compact subscriber writing through the test harness. Safe to
/// call from every test; level comes from `AE_TEST_LOG_LEVEL` (default
/// `debug`).
pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let level = std::env::var("AE_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!("ae_common={level},ae={level}"))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry().with(filter).with(layer));
    });
}

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum Reply {
    Body { status: u16, body: String },
    Timeout,
    Error(String),
    /// Sleep, then answer with an empty 200.
    Delay(Duration),
}

impl Reply {
    pub fn json(value: Value) -> Self {
        Self::Body {
            status: 200,
            body: value.to_string(),
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Body {
            status,
            body: body.into(),
        }
    }
}

type Route = (Method, String);

/// Programmable agent server.
///
/// Each route holds a queue of replies; the last one repeats once the rest
/// are used up. Unscripted routes answer 404.
#[derive(Debug)]
pub struct ScriptedTransport {
    base_url: String,
    routes: Mutex<HashMap<Route, VecDeque<Reply>>>,
    log: Mutex<Vec<HttpRequest>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            base_url: "scripted://agent".to_string(),
            routes: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request to `path` with `reply`.
    pub fn on(&self, method: Method, path: &str, reply: Reply) {
        self.on_sequence(method, path, vec![reply]);
    }

    pub fn on_sequence(&self, method: Method, path: &str, replies: Vec<Reply>) {
        lock(&self.routes).insert((method, path.to_string()), replies.into());
    }

    /// A healthy server that creates sessions `ses_1`, `ses_2`, … and
    /// reports an empty provider catalog.
    pub fn healthy() -> Self {
        let t = Self::new();
        t.on(
            Method::Get,
            "/global/health",
            Reply::json(serde_json::json!({"healthy": true, "version": "scripted"})),
        );
        t.on(Method::Get, "/config/providers", Reply::json(serde_json::json!({})));
        t
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.log).clone()
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<HttpRequest> {
        lock(&self.log)
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        lock(&self.log)
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    fn next_reply(&self, request: &HttpRequest) -> Option<Reply> {
        let mut routes = lock(&self.routes);
        let queue = routes.get_mut(&(request.method, request.path.clone()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl AgentTransport for ScriptedTransport {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        lock(&self.log).push(request.clone());

        let reply = if request.method == Method::Post && request.path == "/session" {
            self.next_reply(request).unwrap_or_else(|| {
                let n = self.count(Method::Post, "/session");
                Reply::json(serde_json::json!({"id": format!("ses_{}", n)}))
            })
        } else {
            self.next_reply(request)
                .unwrap_or_else(|| Reply::status(404, format!("no route for {}", request.endpoint())))
        };

        match reply {
            Reply::Body { status, body } => Ok(HttpResponse { status, body }),
            Reply::Timeout => Err(TransportError::Timeout),
            Reply::Error(detail) => Err(TransportError::Other(detail)),
            Reply::Delay(d) => {
                std::thread::sleep(d);
                Ok(HttpResponse::ok(""))
            }
        }
    }
}

/// `git init` on branch `main` with a local identity.
pub fn init_repo(dir: &Path) -> Result<Git, GitOperationError> {
    let git = Git::new(dir, Duration::from_secs(30));
    git.run(&["init", "-q", "-b", "main"])?;
    git.run(&["config", "user.email", "dev@example.com"])?;
    git.run(&["config", "user.name", "dev"])?;
    git.run(&["config", "commit.gpgsign", "false"])?;
    Ok(git)
}

/// Stage everything and commit; returns the new HEAD.
pub fn commit_all(git: &Git, message: &str) -> Result<String, GitOperationError> {
    git.run(&["add", "-A"])?;
    git.run(&["commit", "-q", "--allow-empty", "-m", message])?;
    git.head()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_then_repeat_last() {
        let t = ScriptedTransport::new();
        t.on_sequence(Method::Get, "/x", vec![Reply::status(500, "a"), Reply::status(200, "b")]);
        let req = HttpRequest::new(Method::Get, "/x", Duration::from_secs(1));
        assert_eq!(t.send(&req).unwrap().status, 500);
        assert_eq!(t.send(&req).unwrap().body, "b");
        assert_eq!(t.send(&req).unwrap().body, "b");
        assert_eq!(t.count(Method::Get, "/x"), 3);
    }

    #[test]
    fn test_default_session_ids_and_404() {
        let t = ScriptedTransport::new();
        let create = HttpRequest::new(Method::Post, "/session", Duration::from_secs(1));
        assert!(t.send(&create).unwrap().body.contains("ses_1"));
        assert!(t.send(&create).unwrap().body.contains("ses_2"));
        let other = HttpRequest::new(Method::Get, "/nope", Duration::from_secs(1));
        assert_eq!(t.send(&other).unwrap().status, 404);
    }
}
