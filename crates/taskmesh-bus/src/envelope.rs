use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use taskmesh_core::{TaskmeshError, TaskmeshResult};

/// Kind of envelope on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Publish,
    Request,
    Response,
    Heartbeat,
    Error,
}

/// One bus message. Serialised as a single line of JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// What this message is.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Topic without the bus prefix.
    pub topic: String,
    /// Message body.
    #[serde(default)]
    pub payload: Value,
    /// Unique id, echoed in `reply_to` by responses.
    pub message_id: String,
    /// Id of the request this answers.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// A fresh envelope with a new id and the current time.
    pub fn new(kind: MessageType, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            topic: topic.into(),
            payload,
            message_id: uuid::Uuid::new_v4().to_string(),
            reply_to: None,
            timestamp: Utc::now(),
        }
    }

    /// A broadcast message.
    pub fn publish(topic: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::Publish, topic, payload)
    }

    /// A request that expects one response.
    pub fn request(topic: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::Request, topic, payload)
    }

    /// Successful reply to `request`.
    pub fn response_to(request: &Envelope, payload: Value) -> Self {
        let mut env = Self::new(MessageType::Response, request.topic.clone(), payload);
        env.reply_to = Some(request.message_id.clone());
        env
    }

    /// Error reply to `request`, payload `{"error": message}`.
    pub fn error_to(request: &Envelope, message: impl Into<String>) -> Self {
        let mut env = Self::new(
            MessageType::Error,
            request.topic.clone(),
            json!({ "error": message.into() }),
        );
        env.reply_to = Some(request.message_id.clone());
        env
    }

    /// Error text carried by an error envelope.
    pub fn error_message(&self) -> Option<&str> {
        if self.kind != MessageType::Error {
            return None;
        }
        Some(
            self.payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error"),
        )
    }

    /// Encode as one newline-terminated line.
    pub fn to_line(&self) -> TaskmeshResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line of the wire stream.
    pub fn from_line(line: &str) -> TaskmeshResult<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| TaskmeshError::Bus(format!("Malformed envelope: {e}")))
    }
}

/// Topic pattern match: empty matches everything, a trailing `*` is a
/// prefix match, anything else must be equal.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => topic == pattern,
    }
}
