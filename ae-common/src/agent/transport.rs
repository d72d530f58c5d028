//! HTTP transport seam between the session client and the agent server.
//!
//! [`AgentTransport`] is the only thing the client needs from the network.
//! [`HttpTransport`] is the real implementation; tests use
//! [`ScriptedTransport`](crate::testing::ScriptedTransport).

use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::trace;

use crate::config::Secret;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// One request to the agent server.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Path without query string, e.g. `/session/abc/message`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout,
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// `"POST /session"` for logs and errors.
    pub fn endpoint(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Raw response: status and body text, not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::Other(detail) => write!(f, "{}", detail),
        }
    }
}

pub trait AgentTransport: Send + Sync {
    /// Server base URL, for logs and trajectory metadata.
    fn base_url(&self) -> &str;

    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Blocking HTTP transport on `ureq`, with optional basic auth.
pub struct HttpTransport {
    base_url: String,
    authorization: Option<String>,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(base_url: &str, username: &str, password: Option<&Secret>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        let authorization = password.map(|p| {
            let raw = format!("{}:{}", username, p.expose());
            format!("Basic {}", STANDARD.encode(raw))
        });
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization,
            agent,
        }
    }

    fn url(&self, request: &HttpRequest) -> String {
        let mut url = format!("{}{}", self.base_url, request.path);
        for (i, (k, v)) in request.query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(&percent_encode(k));
            url.push('=');
            url.push_str(&percent_encode(v));
        }
        url
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("basic_auth", &self.authorization.is_some())
            .finish()
    }
}

impl AgentTransport for HttpTransport {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = self.url(request);
        trace!(endpoint = %request.endpoint(), "agent request");

        let result = match request.method {
            Method::Get | Method::Delete => {
                let mut builder = if request.method == Method::Get {
                    self.agent.get(&url)
                } else {
                    self.agent.delete(&url)
                };
                builder = builder
                    .config()
                    .timeout_global(Some(request.timeout))
                    .build();
                if let Some(auth) = &self.authorization {
                    builder = builder.header("Authorization", auth);
                }
                builder.call()
            }
            Method::Post => {
                let mut builder = self
                    .agent
                    .post(&url)
                    .config()
                    .timeout_global(Some(request.timeout))
                    .build()
                    .header("Content-Type", "application/json");
                if let Some(auth) = &self.authorization {
                    builder = builder.header("Authorization", auth);
                }
                let body = request
                    .body
                    .as_ref()
                    .map(Value::to_string)
                    .unwrap_or_else(|| "{}".to_string());
                builder.send(body)
            }
        };

        let mut response = result.map_err(map_ureq_error)?;
        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(map_ureq_error)?;
        Ok(HttpResponse { status, body })
    }
}

fn map_ureq_error(e: ureq::Error) -> TransportError {
    match e {
        ureq::Error::Timeout(_) => TransportError::Timeout,
        other => TransportError::Other(other.to_string()),
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_with_query_is_encoded() {
        let t = HttpTransport::new("http://127.0.0.1:4096/", "opencode", None);
        let req = HttpRequest::new(Method::Get, "/session", Duration::from_secs(1))
            .query("directory", "/work/my repo&x");
        assert_eq!(
            t.url(&req),
            "http://127.0.0.1:4096/session?directory=/work/my%20repo%26x"
        );
    }

    #[test]
    fn test_basic_auth_only_with_password() {
        let anon = HttpTransport::new("http://h", "opencode", None);
        assert!(anon.authorization.is_none());

        let secret = Secret::new("pw");
        let authed = HttpTransport::new("http://h", "opencode", Some(&secret));
        assert_eq!(
            authed.authorization.as_deref(),
            Some("Basic b3BlbmNvZGU6cHc=")
        );
        assert!(!format!("{:?}", authed).contains("b3Blb"));
    }

    #[test]
    fn test_endpoint_label() {
        let req = HttpRequest::new(Method::Delete, "/session/s1", Duration::from_secs(1));
        assert_eq!(req.endpoint(), "DELETE /session/s1");
    }
}
