use std::fmt;

/// Failure reported by the remote agent API, either through an `error` stream
/// event or a failed job status.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteFailure {
    /// Vendor error code when one was supplied (for example `4001`).
    pub code: Option<i64>,
    /// Human-readable message from the remote side.
    pub message: String,
}

impl RemoteFailure {
    /// Creates a remote failure.
    pub fn new(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Errors produced while relaying one command to the agent API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// A required credential is absent; raised before any network call.
    #[error("missing config: {0}")]
    ConfigMissing(String),
    /// A config value is present but unusable.
    #[error("config error: {0}")]
    Config(String),
    /// Transport-level failure (connect, DNS, timeout, broken body stream).
    #[error("network error: {0}")]
    Network(String),
    /// The agent API answered with a non-2xx status.
    #[error("agent API returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    /// A stream line or response body could not be decoded.
    ///
    /// Per-line decode failures are swallowed by the decoder; this variant only
    /// surfaces for whole-body decoding.
    #[error("decode error: {0}")]
    Decode(String),
    /// The agent reported an explicit failure.
    #[error("agent error: {0}")]
    Remote(RemoteFailure),
    /// The exchange finished without any usable reply content.
    #[error("agent returned no reply content")]
    EmptyReply,
    /// The polling budget ran out before the job completed.
    #[error("job did not complete after {attempts} poll attempts")]
    PollTimeout { attempts: u32 },
    /// The invocation was cancelled by the host.
    #[error("cancelled")]
    Cancelled,
}

impl RelayError {
    pub(crate) fn remote(code: Option<i64>, message: impl Into<String>) -> Self {
        Self::Remote(RemoteFailure::new(code, message))
    }

    /// Returns `true` for failures that abort an invocation before any reply
    /// handling starts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigMissing(_) | Self::Config(_) | Self::HttpStatus { .. }
        )
    }

    /// Text relayed to the chat user in place of a reply.
    pub fn user_message(&self) -> String {
        match self {
            Self::ConfigMissing(what) => {
                format!("Agent relay is not configured: {what} is missing.")
            }
            Self::Config(message) => format!("Agent relay config error: {message}"),
            Self::Network(message) => format!("Error: could not reach the agent API ({message})."),
            Self::HttpStatus { status, .. } => {
                format!("Error: agent API request failed with HTTP {status}.")
            }
            Self::Decode(message) => format!("Error: unreadable agent response ({message})."),
            Self::Remote(failure) => format!("Agent error: {failure}"),
            Self::EmptyReply => "No reply received from the agent.".to_string(),
            Self::PollTimeout { attempts } => {
                format!("The agent did not answer in time ({attempts} status checks).")
            }
            Self::Cancelled => "Request cancelled.".to_string(),
        }
    }
}

impl From<RemoteFailure> for RelayError {
    fn from(value: RemoteFailure) -> Self {
        RelayError::Remote(value)
    }
}

pub(crate) fn network_error(context: &str, err: &reqwest::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::Network(format!("{context}: timed out"))
    } else {
        RelayError::Network(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_failure_display_includes_code() {
        let failure = RemoteFailure::new(Some(4001), "bot not found");
        assert_eq!(failure.to_string(), "bot not found (code 4001)");
        assert_eq!(RemoteFailure::new(None, "boom").to_string(), "boom");
    }

    #[test]
    fn only_config_and_status_errors_are_fatal() {
        assert!(RelayError::ConfigMissing("token".into()).is_fatal());
        assert!(
            RelayError::HttpStatus {
                status: 401,
                body: String::new()
            }
            .is_fatal()
        );
        assert!(!RelayError::EmptyReply.is_fatal());
        assert!(!RelayError::PollTimeout { attempts: 3 }.is_fatal());
    }

    #[test]
    fn user_messages_are_distinct_for_empty_and_remote() {
        let empty = RelayError::EmptyReply.user_message();
        let remote = RelayError::remote(Some(1), "bad").user_message();
        assert_ne!(empty, remote);
        assert!(remote.contains("bad"));
    }
}
