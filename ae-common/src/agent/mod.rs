//! Client for the external coding-agent server.
//!
//! Every response is untrusted input: bodies are parsed into explicit
//! types (see [`message`]) and a wrong shape becomes
//! [`ValidationError::ResponseShape`] rather than a panic.
//!
//! Endpoints used:
//!
//! | Call                 | Endpoint                          |
//! |----------------------|-----------------------------------|
//! | health               | `GET /global/health`              |
//! | create session       | `POST /session`                   |
//! | submit task          | `POST /session/{id}/message`      |
//! | list messages        | `GET /session/{id}/message`       |
//! | session info / diff  | `GET /session/{id}`, `/diff`      |
//! | file status          | `GET /file/status`                |
//! | delete session       | `DELETE /session/{id}`            |
//! | provider catalog     | `GET /config/providers`           |

pub mod message;
pub mod model;
pub mod transport;

pub use message::{AgentMessage, HealthInfo, Part, SessionHandle, ShapeError, TokenCounts};
pub use model::{ModelChoice, ModelSource, ModelSpec, ProviderCatalog};
pub use transport::{AgentTransport, HttpRequest, HttpResponse, HttpTransport, Method, TransportError};

use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::errors::{AgentCommunicationError, LifecycleError, ValidationError};
use message::TaskReply;

/// Session title shown in the agent server's UI.
const SESSION_TITLE: &str = "agent-eval";
/// How often a blocked call checks for cancellation.
const WATCH_TICK: Duration = Duration::from_millis(250);
/// Response bodies quoted in errors are cut to this many bytes.
const MAX_ERROR_BODY: usize = 500;

/// Timeouts and identity for one client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Agent name sent with each task (e.g. `build`).
    pub agent: String,
    /// Workspace directory, passed as `?directory=` on session calls.
    pub directory: Option<String>,
    /// Timeout for short calls (health, session create, listing).
    pub request_timeout: Duration,
    /// Timeout for the blocking task submission.
    pub task_timeout: Duration,
    /// How long to poll for an assistant reply.
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    /// Interval of "still waiting" log lines.
    pub progress_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            agent: crate::config::DEFAULT_AGENT.to_string(),
            directory: None,
            request_timeout: Duration::from_secs(30),
            task_timeout: Duration::from_secs(600),
            poll_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(1500),
            progress_interval: Duration::from_secs(15),
        }
    }
}

/// Outcome of one submitted task.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub reply: AgentMessage,
    pub elapsed: Duration,
    /// Whether the reply had to be polled for.
    pub polled: bool,
    /// `info.error.data.message` of the reply, if the server set it.
    pub error_message: Option<String>,
}

pub struct AgentSessionClient {
    transport: Arc<dyn AgentTransport>,
    settings: ClientSettings,
    cancel: CancelToken,
}

impl AgentSessionClient {
    pub fn new(transport: Arc<dyn AgentTransport>, settings: ClientSettings, cancel: CancelToken) -> Self {
        Self {
            transport,
            settings,
            cancel,
        }
    }

    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn request(&self, method: Method, path: impl Into<String>, timeout: Duration) -> HttpRequest {
        let req = HttpRequest::new(method, path, timeout);
        match &self.settings.directory {
            Some(dir) => req.query("directory", dir.clone()),
            None => req,
        }
    }

    /// Send and decode the body. Transport failures and non-2xx statuses
    /// become [`AgentCommunicationError`]s.
    fn call(&self, req: &HttpRequest) -> Result<Value, LifecycleError> {
        let response = self.transport.send(req);
        decode(req, response)
    }

    /// Like [`call`](Self::call), but runs the request on a helper thread so
    /// the caller can log progress and honour cancellation meanwhile.
    fn call_watched(&self, req: HttpRequest) -> Result<Value, LifecycleError> {
        let (tx, rx) = mpsc::channel();
        let transport = Arc::clone(&self.transport);
        let sent = req.clone();
        thread::spawn(move || {
            let _ = tx.send(transport.send(&sent));
        });

        let start = Instant::now();
        let mut next_report = self.settings.progress_interval;
        loop {
            match rx.recv_timeout(WATCH_TICK) {
                Ok(response) => return decode(&req, response),
                Err(RecvTimeoutError::Timeout) => {
                    self.cancel.check()?;
                    if start.elapsed() >= next_report {
                        info!(elapsed = %fmt_elapsed(start.elapsed()), "waiting for agent");
                        next_report += self.settings.progress_interval;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AgentCommunicationError::Transport {
                        endpoint: req.endpoint(),
                        detail: "request thread exited".to_string(),
                    }
                    .into());
                }
            }
        }
    }

    // ── Health / sessions ─────────────────────────────────────────────────

    pub fn check_health(&self) -> Result<HealthInfo, LifecycleError> {
        let req = self.request(Method::Get, "/global/health", self.settings.request_timeout);
        let body = self.call(&req).map_err(|e| match e {
            LifecycleError::AgentCommunication(inner) => AgentCommunicationError::Unhealthy {
                url: self.base_url().to_string(),
                detail: inner.to_string(),
            }
            .into(),
            other => other,
        })?;
        let health = message::parse_health(&body).map_err(|e| shape(&req, e))?;
        if !health.healthy {
            return Err(AgentCommunicationError::Unhealthy {
                url: self.base_url().to_string(),
                detail: "server reports healthy=false".to_string(),
            }
            .into());
        }
        info!(version = health.version.as_deref().unwrap_or("?"), "agent server is up");
        Ok(health)
    }

    /// `true` when [`check_health`](Self::check_health) succeeds.
    pub fn is_healthy(&self) -> bool {
        self.check_health().is_ok()
    }

    pub fn create_session(&self) -> Result<SessionHandle, LifecycleError> {
        let req = self
            .request(Method::Post, "/session", self.settings.request_timeout)
            .json(json!({"title": SESSION_TITLE}));
        let body = self.call(&req).map_err(|e| match e {
            LifecycleError::AgentCommunication(inner) => AgentCommunicationError::SessionCreate {
                detail: inner.to_string(),
            }
            .into(),
            other => other,
        })?;
        let session = message::parse_session(&body).map_err(|e| shape(&req, e))?;
        info!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// Best effort; errors are logged at debug level.
    pub fn delete_session(&self, session_id: &str) {
        let req = self.request(
            Method::Delete,
            format!("/session/{}", session_id),
            self.settings.request_timeout,
        );
        match self.call(&req) {
            Ok(_) => debug!(session_id, "session deleted"),
            Err(e) => debug!(session_id, error = %e, "session delete failed"),
        }
    }

    // ── Task ──────────────────────────────────────────────────────────────

    /// Submit `prompt` and wait for the assistant reply.
    ///
    /// The submit call may return the reply, a list of messages, or nothing;
    /// in the last two cases the message list is polled.
    pub fn send_task(
        &self,
        session: &SessionHandle,
        prompt: &str,
        model: Option<&ModelSpec>,
    ) -> Result<RunResult, LifecycleError> {
        let mut body = json!({
            "agent": self.settings.agent,
            "parts": [{"type": "text", "text": prompt}],
        });
        if let Some(m) = model {
            body["model"] = m.to_json();
        }
        info!(
            session_id = %session.id,
            agent = %self.settings.agent,
            model = %model.map_or_else(|| "server default".to_string(), ToString::to_string),
            "sending task"
        );

        let start = Instant::now();
        let req = self
            .request(
                Method::Post,
                format!("/session/{}/message", session.id),
                self.settings.task_timeout,
            )
            .json(body);
        let response = self.call_watched(req)?;

        let (reply, polled) = match message::interpret_task_response(&response) {
            TaskReply::Assistant(reply) => (reply, false),
            TaskReply::Poll(reason) => {
                info!(session_id = %session.id, reason, "polling for assistant reply");
                (self.wait_for_assistant(&session.id)?, true)
            }
        };

        let error_message = reply.error_message();
        if let Some(msg) = &error_message {
            warn!(session_id = %session.id, error = %msg, "agent reported an error");
        }
        let elapsed = start.elapsed();
        info!(
            session_id = %session.id,
            elapsed = %fmt_elapsed(elapsed),
            tool_calls = reply.tool_calls().count(),
            "agent finished"
        );
        Ok(RunResult {
            reply,
            elapsed,
            polled,
            error_message,
        })
    }

    /// Poll the message list until an assistant message appears.
    pub fn wait_for_assistant(&self, session_id: &str) -> Result<AgentMessage, LifecycleError> {
        let start = Instant::now();
        let mut next_report = self.settings.progress_interval;
        let mut polls = 0u32;
        while start.elapsed() < self.settings.poll_timeout {
            self.cancel.check()?;
            let messages = self.messages(session_id)?;
            polls += 1;
            if let Some(found) = messages.iter().rev().find(|m| message::is_assistant(m)) {
                debug!(session_id, polls, "assistant reply found");
                return Ok(AgentMessage::from_value(found));
            }
            if start.elapsed() >= next_report {
                info!(
                    session_id,
                    messages = messages.len(),
                    elapsed = %fmt_elapsed(start.elapsed()),
                    "still waiting for assistant reply"
                );
                next_report += self.settings.progress_interval;
            }
            thread::sleep(self.settings.poll_interval);
        }
        Err(AgentCommunicationError::NoAssistantReply {
            session_id: session_id.to_string(),
            waited_secs: self.settings.poll_timeout.as_secs(),
        }
        .into())
    }

    /// Raw message list of a session.
    pub fn messages(&self, session_id: &str) -> Result<Vec<Value>, LifecycleError> {
        let req = self.request(
            Method::Get,
            format!("/session/{}/message", session_id),
            self.settings.request_timeout,
        );
        let body = self.call(&req)?;
        message::parse_message_list(&body).map_err(|e| shape(&req, e))
    }

    // ── Best-effort extras for the trajectory ─────────────────────────────

    fn fetch_optional(&self, path: String) -> Option<Value> {
        let req = self.request(Method::Get, path, self.settings.request_timeout);
        match self.call(&req) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(endpoint = %req.endpoint(), error = %e, "optional fetch failed");
                None
            }
        }
    }

    pub fn session_info(&self, session_id: &str) -> Option<Value> {
        self.fetch_optional(format!("/session/{}", session_id))
            .filter(Value::is_object)
    }

    pub fn session_diff(&self, session_id: &str) -> Option<Value> {
        self.fetch_optional(format!("/session/{}/diff", session_id))
    }

    pub fn file_status(&self) -> Option<Value> {
        self.fetch_optional("/file/status".to_string())
    }

    // ── Models ────────────────────────────────────────────────────────────

    pub fn fetch_catalog(&self) -> Result<ProviderCatalog, LifecycleError> {
        let req = self.request(Method::Get, "/config/providers", self.settings.request_timeout);
        let body = self.call(&req)?;
        Ok(ProviderCatalog::parse(&body))
    }

    /// Override, then the agent config file, then the server catalog, then
    /// the server default.
    pub fn resolve_model(&self, override_spec: Option<&str>, config_path: &Path) -> ModelChoice {
        let from_file = model::model_from_config_file(config_path, &self.settings.agent);
        let catalog = match self.fetch_catalog() {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, "provider catalog unavailable; using configured model unchecked");
                None
            }
        };
        let choice = model::resolve_model(override_spec, from_file, catalog.as_ref());
        info!(model = %choice.describe(), "model resolved");
        choice
    }
}

fn decode(req: &HttpRequest, response: Result<HttpResponse, TransportError>) -> Result<Value, LifecycleError> {
    let endpoint = req.endpoint();
    let response = response.map_err(|e| match e {
        TransportError::Timeout => AgentCommunicationError::Timeout {
            endpoint: endpoint.clone(),
        },
        TransportError::Other(detail) => AgentCommunicationError::Transport {
            endpoint: endpoint.clone(),
            detail,
        },
    })?;
    if !response.is_success() {
        return Err(AgentCommunicationError::Status {
            endpoint,
            status: response.status,
            body: truncate(&response.body, MAX_ERROR_BODY),
        }
        .into());
    }
    Ok(message::parse_body(&response.body))
}

fn shape(req: &HttpRequest, e: ShapeError) -> LifecycleError {
    ValidationError::ResponseShape {
        endpoint: req.endpoint(),
        detail: e.0,
    }
    .into()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// `15s` or `2m 30s`.
pub fn fmt_elapsed(d: Duration) -> String {
    let s = d.as_secs();
    if s < 60 {
        format!("{}s", s)
    } else {
        format!("{}m {}s", s / 60, s % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedTransport};

    fn client(transport: &Arc<ScriptedTransport>) -> AgentSessionClient {
        let settings = ClientSettings {
            poll_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(10),
            directory: Some("/work/repo".to_string()),
            ..ClientSettings::default()
        };
        AgentSessionClient::new(transport.clone(), settings, CancelToken::new())
    }

    #[test]
    fn test_health_ok_and_shape_error() {
        let t = Arc::new(ScriptedTransport::new());
        t.on(Method::Get, "/global/health", Reply::json(json!({"healthy": true, "version": "1.2"})));
        assert_eq!(client(&t).check_health().unwrap().version.as_deref(), Some("1.2"));

        let t = Arc::new(ScriptedTransport::new());
        t.on(Method::Get, "/global/health", Reply::json(json!(["not", "an", "object"])));
        let err = client(&t).check_health().unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(ValidationError::ResponseShape { .. })));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unreachable_server_is_unhealthy() {
        let t = Arc::new(ScriptedTransport::new());
        t.on(Method::Get, "/global/health", Reply::Error("connection refused".into()));
        let c = client(&t);
        assert!(!c.is_healthy());
        assert!(matches!(
            c.check_health().unwrap_err(),
            LifecycleError::AgentCommunication(AgentCommunicationError::Unhealthy { .. })
        ));
    }

    #[test]
    fn test_send_task_direct_reply_carries_model_and_directory() {
        let t = Arc::new(ScriptedTransport::new());
        t.on(
            Method::Post,
            "/session/s1/message",
            Reply::json(json!({"info": {"role": "assistant"}, "parts": [{"type": "text", "text": "ok"}]})),
        );
        let c = client(&t);
        let session = SessionHandle { id: "s1".into(), raw: json!({"id": "s1"}) };
        let model = ModelSpec::new("p", "m");
        let result = c.send_task(&session, "fix it", Some(&model)).unwrap();
        assert!(!result.polled);
        assert_eq!(result.reply.text(), "ok");

        let sent = t.requests_to(Method::Post, "/session/s1/message");
        assert_eq!(sent.len(), 1);
        let body = sent[0].body.clone().unwrap();
        assert_eq!(body["model"]["providerID"], "p");
        assert_eq!(body["parts"][0]["text"], "fix it");
        assert_eq!(sent[0].query, vec![("directory".to_string(), "/work/repo".to_string())]);
    }

    #[test]
    fn test_send_task_empty_body_polls() {
        let t = Arc::new(ScriptedTransport::new());
        t.on(Method::Post, "/session/s1/message", Reply::json(Value::Null));
        t.on_sequence(
            Method::Get,
            "/session/s1/message",
            vec![
                Reply::json(json!([{"role": "user"}])),
                Reply::json(json!([{"role": "user"}, {"role": "assistant", "id": "a1"}])),
            ],
        );
        let c = client(&t);
        let session = SessionHandle { id: "s1".into(), raw: Value::Null };
        let result = c.send_task(&session, "p", None).unwrap();
        assert!(result.polled);
        assert_eq!(result.reply.message_id, "a1");
        assert_eq!(t.count(Method::Get, "/session/s1/message"), 2);
    }

    #[test]
    fn test_poll_gives_up() {
        let t = Arc::new(ScriptedTransport::new());
        t.on(Method::Get, "/session/s1/message", Reply::json(json!([])));
        let err = client(&t).wait_for_assistant("s1").unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::AgentCommunication(AgentCommunicationError::NoAssistantReply { .. })
        ));
    }

    #[test]
    fn test_timeout_and_status_errors() {
        let t = Arc::new(ScriptedTransport::new());
        t.on(Method::Post, "/session", Reply::Timeout);
        let err = client(&t).create_session().unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::AgentCommunication(AgentCommunicationError::SessionCreate { .. })
        ));

        let t = Arc::new(ScriptedTransport::new());
        t.on(Method::Get, "/session/s1/message", Reply::status(500, "boom"));
        let err = client(&t).messages("s1").unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::AgentCommunication(AgentCommunicationError::Status { status: 500, .. })
        ));
    }

    #[test]
    fn test_cancel_interrupts_blocked_submit() {
        let t = Arc::new(ScriptedTransport::new());
        t.on(Method::Post, "/session/s1/message", Reply::Delay(Duration::from_secs(5)));
        let cancel = CancelToken::new();
        let c = AgentSessionClient::new(t.clone(), ClientSettings::default(), cancel.clone());
        cancel.cancel();
        let session = SessionHandle { id: "s1".into(), raw: Value::Null };
        let start = Instant::now();
        assert!(matches!(c.send_task(&session, "p", None), Err(LifecycleError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_fmt_elapsed_and_truncate() {
        assert_eq!(fmt_elapsed(Duration::from_secs(15)), "15s");
        assert_eq!(fmt_elapsed(Duration::from_secs(150)), "2m 30s");
        assert_eq!(truncate("héllo", 2), "h…");
    }
}
