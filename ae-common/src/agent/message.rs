//! Typed views of agent-server payloads.
//!
//! Two parsing modes:
//! - endpoint results the lifecycle depends on (health, session, message
//!   list) are checked field by field and fail with a [`ShapeError`];
//! - message contents recorded in the trajectory are parsed best-effort:
//!   a bad field degrades to an empty value instead of failing the record.

use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};

/// A response did not have the shape we expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeError(pub String);

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type Shaped<T> = Result<T, ShapeError>;

pub fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn expect_object<'a>(v: &'a Value, what: &str) -> Shaped<&'a Map<String, Value>> {
    v.as_object()
        .ok_or_else(|| ShapeError(format!("{}: expected object, got {}", what, type_name(v))))
}

/// Parse a response body. Empty → `Null`; non-JSON → the text as a string.
pub fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

// ── Endpoint results ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct HealthInfo {
    pub healthy: bool,
    pub version: Option<String>,
    pub raw: Value,
}

pub fn parse_health(v: &Value) -> Shaped<HealthInfo> {
    let obj = expect_object(v, "health")?;
    let healthy = match obj.get("healthy") {
        None => true,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(ShapeError(format!(
                "health.healthy: expected bool, got {}",
                type_name(other)
            )));
        }
    };
    let version = match obj.get("version") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    Ok(HealthInfo {
        healthy,
        version,
        raw: v.clone(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    pub id: String,
    pub raw: Value,
}

pub fn parse_session(v: &Value) -> Shaped<SessionHandle> {
    let obj = expect_object(v, "session")?;
    match obj.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(SessionHandle {
            id: id.clone(),
            raw: v.clone(),
        }),
        Some(Value::String(_)) => Err(ShapeError("session.id is empty".to_string())),
        Some(other) => Err(ShapeError(format!(
            "session.id: expected string, got {}",
            type_name(other)
        ))),
        None => Err(ShapeError("session: missing id".to_string())),
    }
}

/// Message list from `GET /session/{id}/message`. A lone object counts as a
/// one-element list and an empty body as an empty list.
pub fn parse_message_list(v: &Value) -> Shaped<Vec<Value>> {
    match v {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items.clone()),
        Value::Object(_) => Ok(vec![v.clone()]),
        other => Err(ShapeError(format!(
            "message list: expected list, got {}",
            type_name(other)
        ))),
    }
}

/// How to interpret the body returned by the task-submit endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskReply {
    Assistant(AgentMessage),
    /// No assistant message yet; the reason is logged.
    Poll(&'static str),
}

pub fn interpret_task_response(v: &Value) -> TaskReply {
    match v {
        Value::Null => TaskReply::Poll("empty response body"),
        Value::String(s) if s.trim().is_empty() => TaskReply::Poll("empty response body"),
        Value::Array(items) => items
            .iter()
            .rev()
            .find(|m| is_assistant(m))
            .map(|m| TaskReply::Assistant(AgentMessage::from_value(m)))
            .unwrap_or(TaskReply::Poll("no assistant message in list")),
        Value::Object(_) if is_assistant(v) => TaskReply::Assistant(AgentMessage::from_value(v)),
        Value::Object(_) => TaskReply::Poll("non-assistant message"),
        _ => TaskReply::Poll("unexpected response shape"),
    }
}

/// `role == "assistant"` at the top level or under `info`.
pub fn is_assistant(v: &Value) -> bool {
    role_of(v).as_deref() == Some("assistant")
}

fn role_of(v: &Value) -> Option<String> {
    let obj = v.as_object()?;
    if let Some(Value::String(role)) = obj.get("role") {
        return Some(role.clone());
    }
    match obj.get("info")?.get("role")? {
        Value::String(role) => Some(role.clone()),
        _ => None,
    }
}

// ── Trajectory records ─────────────────────────────────────────────────────

/// One message, parsed best-effort.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentMessage {
    pub message_id: String,
    pub role: String,
    pub created_at: Value,
    pub model: Value,
    pub info: Map<String, Value>,
    pub metadata: Value,
    pub parts: Vec<Part>,
}

impl AgentMessage {
    pub fn from_value(v: &Value) -> Self {
        let Some(obj) = v.as_object() else {
            return Self {
                message_id: String::new(),
                role: "?".to_string(),
                created_at: Value::Null,
                model: Value::Null,
                info: Map::new(),
                metadata: json!({}),
                parts: Vec::new(),
            };
        };
        let info = match obj.get("info") {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        };
        let parts = match obj.get("parts") {
            Some(Value::Array(items)) => items.iter().map(Part::from_value).collect(),
            _ => Vec::new(),
        };
        let metadata = match obj.get("metadata") {
            Some(m @ Value::Object(_)) => m.clone(),
            _ => json!({}),
        };
        let pick = |keys: &[&str]| -> Value {
            keys.iter()
                .find_map(|k| obj.get(*k).or_else(|| info.get(*k)))
                .cloned()
                .unwrap_or(Value::Null)
        };
        Self {
            message_id: str_field(obj, &["id"]).or_else(|| str_field(&info, &["id"])).unwrap_or_default(),
            role: role_of(v).unwrap_or_else(|| "?".to_string()),
            created_at: pick(&["createdAt", "created_at", "time"]),
            model: pick(&["model", "modelID"]),
            info,
            metadata,
            parts,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }

    /// `info.error.data.message`, set when the server reports a failed turn.
    pub fn error_message(&self) -> Option<String> {
        match self.info.get("error")?.get("data")?.get("message")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|p| matches!(p, Part::ToolCall { .. }))
    }

    /// Token counts from `info`, accepting flat camelCase / snake_case keys
    /// and the nested `tokens {input, output}` form.
    pub fn tokens(&self) -> TokenCounts {
        let num = |keys: &[&str]| -> u64 {
            keys.iter()
                .find_map(|k| self.info.get(*k).and_then(Value::as_u64))
                .unwrap_or(0)
        };
        let mut counts = TokenCounts {
            total: num(&["totalTokens", "total_tokens"]),
            prompt: num(&["promptTokens", "prompt_tokens"]),
            completion: num(&["completionTokens", "completion_tokens"]),
            cost: self.info.get("cost").and_then(Value::as_f64).unwrap_or(0.0),
        };
        if let Some(Value::Object(tokens)) = self.info.get("tokens") {
            let get = |k: &str| tokens.get(k).and_then(Value::as_u64).unwrap_or(0);
            if counts.prompt == 0 {
                counts.prompt = get("input");
            }
            if counts.completion == 0 {
                counts.completion = get("output");
            }
        }
        if counts.total == 0 {
            counts.total = counts.prompt + counts.completion;
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TokenCounts {
    pub total: u64,
    pub prompt: u64,
    pub completion: u64,
    pub cost: f64,
}

impl std::ops::AddAssign for TokenCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.total += rhs.total;
        self.prompt += rhs.prompt;
        self.completion += rhs.completion;
        self.cost += rhs.cost;
    }
}

/// One part of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text {
        text: String,
    },
    ToolCall {
        name: String,
        id: String,
        state: String,
        input: Value,
        output: Value,
        error: Value,
        started_at: Value,
        finished_at: Value,
    },
    Reasoning {
        text: String,
    },
    StepStart {
        name: String,
    },
    StepFinish {
        name: String,
    },
    Snapshot {
        data: Value,
    },
    /// Anything else, kept verbatim.
    Unknown {
        kind: String,
        raw: Value,
    },
}

fn str_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    })
}

fn value_field(obj: &Map<String, Value>, keys: &[&str]) -> Value {
    keys.iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or(Value::Null)
}

impl Part {
    pub fn from_value(v: &Value) -> Self {
        let Some(obj) = v.as_object() else {
            return Self::Unknown {
                kind: "unknown".to_string(),
                raw: v.clone(),
            };
        };
        let kind = str_field(obj, &["type"]).unwrap_or_else(|| "unknown".to_string());
        match kind.as_str() {
            "text" => Self::Text {
                text: str_field(obj, &["text"]).unwrap_or_default(),
            },
            "tool" | "tool-invocation" => Self::tool_call(obj),
            "reasoning" => Self::Reasoning {
                text: str_field(obj, &["text", "reasoning"]).unwrap_or_default(),
            },
            "step-start" => Self::StepStart {
                name: str_field(obj, &["name"]).unwrap_or_default(),
            },
            "step-finish" => Self::StepFinish {
                name: str_field(obj, &["name", "reason"]).unwrap_or_default(),
            },
            "snapshot" => Self::Snapshot {
                data: value_field(obj, &["data", "snapshot"]),
            },
            _ => Self::Unknown {
                kind,
                raw: v.clone(),
            },
        }
    }

    /// Tool parts come either flat (`state: "completed"`, `input`, `output`)
    /// or with a nested state object (`state: {status, input, output, time}`).
    fn tool_call(obj: &Map<String, Value>) -> Self {
        let name = str_field(obj, &["tool", "name", "toolName"]).unwrap_or_else(|| "?".to_string());
        let id = str_field(obj, &["callID", "id", "toolCallId"]).unwrap_or_default();
        match obj.get("state") {
            Some(Value::Object(state)) => {
                let time = state.get("time").and_then(Value::as_object);
                let time_field = |k: &str| time.and_then(|t| t.get(k)).cloned().unwrap_or(Value::Null);
                Self::ToolCall {
                    name,
                    id,
                    state: str_field(state, &["status"]).unwrap_or_else(|| "?".to_string()),
                    input: value_field(state, &["input"]),
                    output: value_field(state, &["output"]),
                    error: value_field(state, &["error"]),
                    started_at: time_field("start"),
                    finished_at: time_field("end"),
                }
            }
            other => Self::ToolCall {
                name,
                id,
                state: match other {
                    Some(Value::String(s)) => s.clone(),
                    _ => "?".to_string(),
                },
                input: value_field(obj, &["input", "args"]),
                output: value_field(obj, &["output", "result"]),
                error: value_field(obj, &["error"]),
                started_at: value_field(obj, &["startedAt"]),
                finished_at: value_field(obj, &["finishedAt"]),
            },
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Text { text } => json!({"type": "text", "text": text}),
            Self::ToolCall {
                name,
                id,
                state,
                input,
                output,
                error,
                started_at,
                finished_at,
            } => json!({
                "type": "tool_call",
                "tool_name": name,
                "tool_id": id,
                "state": state,
                "input": input,
                "output": output,
                "error": error,
                "started_at": started_at,
                "finished_at": finished_at,
            }),
            Self::Reasoning { text } => json!({"type": "reasoning", "text": text}),
            Self::StepStart { name } => json!({"type": "step_start", "name": name}),
            Self::StepFinish { name } => json!({"type": "step_finish", "name": name}),
            Self::Snapshot { data } => json!({"type": "snapshot", "data": data}),
            Self::Unknown { kind, raw } => json!({"type": kind, "raw": raw}),
        }
    }
}

impl Serialize for Part {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_shapes() {
        let h = parse_health(&json!({"healthy": true, "version": "0.9.1"})).unwrap();
        assert!(h.healthy);
        assert_eq!(h.version.as_deref(), Some("0.9.1"));
        assert!(parse_health(&json!([])).is_err());
        assert!(parse_health(&json!({"healthy": "yes"})).is_err());
        assert!(parse_health(&Value::String("<html>".into())).is_err());
    }

    #[test]
    fn test_session_requires_string_id() {
        assert_eq!(parse_session(&json!({"id": "ses_1"})).unwrap().id, "ses_1");
        for bad in [json!({}), json!({"id": 7}), json!({"id": ""}), json!(null), json!(["ses"])] {
            assert!(parse_session(&bad).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn test_message_list_shapes() {
        assert!(parse_message_list(&Value::Null).unwrap().is_empty());
        assert_eq!(parse_message_list(&json!({"role": "user"})).unwrap().len(), 1);
        assert_eq!(parse_message_list(&json!([1, 2])).unwrap().len(), 2);
        let err = parse_message_list(&json!("oops")).unwrap_err();
        assert!(err.0.contains("string"));
    }

    #[test]
    fn test_task_response_interpretation() {
        let assistant = json!({"info": {"role": "assistant"}, "parts": [{"type": "text", "text": "done"}]});
        match interpret_task_response(&assistant) {
            TaskReply::Assistant(m) => assert_eq!(m.text(), "done"),
            other => panic!("unexpected {other:?}"),
        }
        let list = json!([{"role": "user"}, {"role": "assistant", "id": "m2"}, {"role": "user"}]);
        match interpret_task_response(&list) {
            TaskReply::Assistant(m) => assert_eq!(m.message_id, "m2"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(interpret_task_response(&Value::Null), TaskReply::Poll(_)));
        assert!(matches!(interpret_task_response(&json!({"role": "user"})), TaskReply::Poll(_)));
        assert!(matches!(interpret_task_response(&json!(42)), TaskReply::Poll(_)));
    }

    #[test]
    fn test_message_degrades_on_bad_fields() {
        let m = AgentMessage::from_value(&json!({"id": 5, "info": "x", "parts": "nope", "metadata": []}));
        assert_eq!(m.role, "?");
        assert!(m.parts.is_empty());
        assert!(m.info.is_empty());
        assert_eq!(m.metadata, json!({}));

        let m = AgentMessage::from_value(&json!("not an object"));
        assert_eq!(m.role, "?");
    }

    #[test]
    fn test_parts_typed_and_unknown_kept() {
        let m = AgentMessage::from_value(&json!({
            "info": {"role": "assistant", "tokens": {"input": 10, "output": 5}, "cost": 0.25,
                     "error": {"data": {"message": "rate limited"}}},
            "parts": [
                {"type": "tool", "tool": "bash", "callID": "c1",
                 "state": {"status": "error", "input": {"cmd": "ls"}, "error": "boom", "time": {"start": 1, "end": 2}}},
                {"type": "tool", "name": "edit", "state": "completed", "args": {"f": "a"}},
                {"type": "reasoning", "text": "think"},
                {"type": "patch", "hash": "abc"},
                7
            ]
        }));
        assert_eq!(m.error_message().as_deref(), Some("rate limited"));
        assert_eq!(m.tool_calls().count(), 2);
        match &m.parts[0] {
            Part::ToolCall { name, id, state, started_at, .. } => {
                assert_eq!(name, "bash");
                assert_eq!(id, "c1");
                assert_eq!(state, "error");
                assert_eq!(started_at, &json!(1));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.parts[3].to_json()["type"], "patch");
        assert_eq!(m.parts[3].to_json()["raw"]["hash"], "abc");
        assert_eq!(m.parts[4].to_json()["type"], "unknown");

        let t = m.tokens();
        assert_eq!((t.prompt, t.completion, t.total), (10, 5, 15));
        assert!((t.cost - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body("  "), Value::Null);
        assert_eq!(parse_body("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_body("plain"), Value::String("plain".into()));
    }
}
