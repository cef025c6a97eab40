use std::fmt;

use crate::errors::RemoteFailure;

/// Classification of a decoded stream event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Incremental content fragment.
    MessageDelta,
    /// A message the agent marked as finished.
    MessageCompleted,
    /// The whole chat turn is finished.
    ChatCompleted,
    /// The agent reported a failure.
    Error,
    /// Anything else; carries the wire name for logging.
    Unknown(String),
}

impl EventKind {
    /// Maps a wire event name to a kind.
    pub fn from_wire(name: &str) -> Self {
        match name.trim() {
            "conversation.message.delta" | "message_delta" | "delta" => Self::MessageDelta,
            "conversation.message.completed" | "message_completed" => Self::MessageCompleted,
            "conversation.chat.completed" | "chat_completed" | "done" => Self::ChatCompleted,
            "error" | "conversation.chat.failed" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageDelta => f.write_str("message_delta"),
            Self::MessageCompleted => f.write_str("message_completed"),
            Self::ChatCompleted => f.write_str("chat_completed"),
            Self::Error => f.write_str("error"),
            Self::Unknown(name) => write!(f, "unknown({name})"),
        }
    }
}

/// Originator of message content.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Role {
    User,
    /// Delta frames frequently omit the role, so this is the default.
    #[default]
    Assistant,
    Other(String),
}

impl Role {
    pub fn from_wire(role: &str) -> Self {
        match role {
            "assistant" => Self::Assistant,
            "user" => Self::User,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Token accounting reported with `chat_completed`.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub token_count: Option<u64>,
    #[serde(default)]
    pub input_count: Option<u64>,
    #[serde(default)]
    pub output_count: Option<u64>,
}

/// One decoded unit of the remote event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub role: Role,
    pub content: Option<String>,
    /// Vendor message type (`answer`, `follow_up`, `verbose`, ...).
    pub message_type: Option<String>,
    pub error: Option<RemoteFailure>,
    pub usage: Option<Usage>,
}

impl StreamEvent {
    /// Builds an event of `kind` from the decoded payload.
    ///
    /// `envelope` is the whole decoded object and `data` the event payload;
    /// they are the same object when the event name arrived on an `event:`
    /// line.
    pub fn from_payload(
        kind: EventKind,
        envelope: &serde_json::Value,
        data: &serde_json::Value,
    ) -> Self {
        let mut event = Self {
            kind,
            role: Role::default(),
            content: None,
            message_type: None,
            error: None,
            usage: None,
        };
        match event.kind {
            EventKind::MessageDelta | EventKind::MessageCompleted => {
                event.role = data
                    .get("role")
                    .and_then(|v| v.as_str())
                    .map(Role::from_wire)
                    .unwrap_or_default();
                event.content = data
                    .get("content")
                    .and_then(|v| v.as_str())
                    .map(ToOwned::to_owned);
                event.message_type = data
                    .get("type")
                    .and_then(|v| v.as_str())
                    .map(ToOwned::to_owned);
            }
            EventKind::ChatCompleted => {
                event.usage = data
                    .get("usage")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
            }
            EventKind::Error => {
                event.error = Some(extract_failure(envelope, data));
            }
            EventKind::Unknown(_) => {}
        }
        event
    }

    /// Returns `true` when the event carries reply text from the assistant.
    pub fn is_assistant_answer(&self) -> bool {
        self.role == Role::Assistant
            && self
                .message_type
                .as_deref()
                .is_none_or(|kind| kind == "answer")
    }

    /// Content if non-empty.
    pub fn text(&self) -> Option<&str> {
        self.content.as_deref().filter(|text| !text.is_empty())
    }
}

/// Reads an error code and message from the usual locations: the envelope,
/// the payload, or the payload's `last_error` object.
pub(crate) fn extract_failure(
    envelope: &serde_json::Value,
    data: &serde_json::Value,
) -> RemoteFailure {
    let candidates = [Some(envelope), Some(data), data.get("last_error")];
    let mut code = None;
    let mut message = None;
    for candidate in candidates.into_iter().flatten() {
        if code.is_none() {
            code = candidate
                .get("code")
                .and_then(|v| v.as_i64())
                .filter(|code| *code != 0);
        }
        if message.is_none() {
            message = candidate
                .get("msg")
                .or_else(|| candidate.get("message"))
                .and_then(|v| v.as_str())
                .filter(|msg| !msg.is_empty())
                .map(ToOwned::to_owned);
        }
    }
    RemoteFailure::new(
        code,
        message.unwrap_or_else(|| "agent reported an unspecified error".to_string()),
    )
}

/// Application-level failure carried by a plain JSON response body: a
/// non-zero top-level `code`.
pub(crate) fn body_failure(body: &serde_json::Value) -> Option<RemoteFailure> {
    let code = body.get("code").and_then(|v| v.as_i64())?;
    if code == 0 {
        return None;
    }
    let data = body.get("data").unwrap_or(&serde_json::Value::Null);
    Some(extract_failure(body, data))
}
