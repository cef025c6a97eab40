//! Reply extraction for non-streaming agent responses.

use std::fmt;
use std::str::FromStr;

use crate::errors::RelayError;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(i64),
}

/// A dotted JSON path with bracketed indices, e.g. `data.messages[-1].content`.
///
/// Negative indices count from the end of the array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Resolves the path against `value`.
    pub fn lookup<'a>(&self, value: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        let mut current = value;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(key) => current.get(key)?,
                Segment::Index(index) => {
                    let items = current.as_array()?;
                    let len = i64::try_from(items.len()).ok()?;
                    let resolved = if *index < 0 { len + index } else { *index };
                    items.get(usize::try_from(resolved).ok()?)?
                }
            };
        }
        Some(current)
    }
}

impl FromStr for JsonPath {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| RelayError::Config(format!("invalid reply path `{raw}`: {why}"));
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("path is empty"));
        }

        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(idx) => (&part[..idx], &part[idx..]),
                None => (part, ""),
            };
            if key.is_empty() && rest.is_empty() {
                return Err(invalid("empty segment"));
            }
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(|| invalid("unclosed `[`"))?;
                let index = rest[1..close]
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| invalid("index must be an integer"))?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(invalid("unexpected text after `]`"));
                }
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// How the reply text is located in a non-streaming response body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyExtraction {
    /// Read a string at a fixed path.
    Path(JsonPath),
    /// First `data.messages` entry from the assistant with non-empty answer
    /// content.
    FirstAssistant,
}

impl Default for ReplyExtraction {
    fn default() -> Self {
        Self::Path(JsonPath {
            raw: "data.messages[-1].content".to_string(),
            segments: vec![
                Segment::Key("data".into()),
                Segment::Key("messages".into()),
                Segment::Index(-1),
                Segment::Key("content".into()),
            ],
        })
    }
}

impl FromStr for ReplyExtraction {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "first_assistant" | "assistant" => Ok(Self::FirstAssistant),
            path => Ok(Self::Path(path.parse()?)),
        }
    }
}

impl fmt::Display for ReplyExtraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => fmt::Display::fmt(path, f),
            Self::FirstAssistant => f.write_str("first_assistant"),
        }
    }
}

impl ReplyExtraction {
    /// Extracts the reply text, or `None` when the response carries none.
    pub fn extract(&self, body: &serde_json::Value) -> Option<String> {
        let text = match self {
            Self::Path(path) => path.lookup(body).and_then(|v| v.as_str()),
            Self::FirstAssistant => body
                .pointer("/data/messages")
                .and_then(|v| v.as_array())
                .and_then(|messages| first_assistant_content(messages)),
        };
        text.filter(|text| !text.is_empty()).map(ToOwned::to_owned)
    }
}

/// First assistant answer with non-empty content in a message list.
pub(crate) fn first_assistant_content(messages: &[serde_json::Value]) -> Option<&str> {
    messages.iter().find_map(|message| {
        let is_assistant = message.get("role").and_then(|v| v.as_str()) == Some("assistant");
        let is_answer = message
            .get("type")
            .and_then(|v| v.as_str())
            .is_none_or(|kind| kind == "answer");
        if !(is_assistant && is_answer) {
            return None;
        }
        message
            .get("content")
            .and_then(|v| v.as_str())
            .filter(|text| !text.is_empty())
    })
}
