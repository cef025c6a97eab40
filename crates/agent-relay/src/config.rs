use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::RelayError;
use crate::extract::ReplyExtraction;
use crate::poll::PollPolicy;

const DEFAULT_BASE_URL: &str = "https://api.coze.cn/v3/chat";

/// Request body layout expected by the agent API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestShape {
    /// `bot_id` + `additional_messages` list (Coze v3).
    #[default]
    Coze,
    /// `bot_id` + `messages` list.
    Messages,
    /// `agent_id` + single `message` string.
    Agent,
    /// `bot_id` + single `query` string.
    Query,
}

impl FromStr for RequestShape {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "coze" | "additional_messages" => Ok(Self::Coze),
            "messages" => Ok(Self::Messages),
            "agent" | "message" => Ok(Self::Agent),
            "query" => Ok(Self::Query),
            other => Err(RelayError::Config(format!("unknown request shape `{other}`"))),
        }
    }
}

/// How replies are delivered back to the chat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplyMode {
    /// Relay each delta as it arrives.
    #[default]
    Stream,
    /// Stream from the API but relay one final reply.
    Buffered,
    /// Non-streaming request, polling a job handle when the API queues it.
    Poll,
}

impl FromStr for ReplyMode {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stream" | "streaming" => Ok(Self::Stream),
            "buffered" | "buffer" => Ok(Self::Buffered),
            "poll" | "polling" | "blocking" => Ok(Self::Poll),
            other => Err(RelayError::Config(format!("unknown reply mode `{other}`"))),
        }
    }
}

impl fmt::Display for ReplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stream => "stream",
            Self::Buffered => "buffered",
            Self::Poll => "poll",
        })
    }
}

/// Immutable relay configuration, validated once.
#[derive(Clone)]
pub struct RelayConfig {
    /// Bot / agent id sent as `bot_id` or `agent_id`.
    pub agent_id: String,
    /// Bearer token. Never logged.
    pub token: String,
    /// Chat endpoint URL.
    pub base_url: String,
    /// Status endpoint prefix; `<poll_url>/<job_id>` is fetched.
    pub poll_url: Option<String>,
    pub request_shape: RequestShape,
    pub reply_mode: ReplyMode,
    pub reply_extraction: ReplyExtraction,
    pub auto_save_history: bool,
    /// Whole-request timeout for non-streaming calls and status fetches.
    pub request_timeout: Duration,
    /// Longest gap between body chunks before a stream counts as stalled.
    /// `None` waits forever.
    pub stream_idle_timeout: Option<Duration>,
    pub poll: PollPolicy,
    /// Chat command keyword (without the leading `/`).
    pub command_keyword: String,
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("agent_id", &self.agent_id)
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("poll_url", &self.poll_url)
            .field("request_shape", &self.request_shape)
            .field("reply_mode", &self.reply_mode)
            .field("reply_extraction", &self.reply_extraction)
            .field("auto_save_history", &self.auto_save_history)
            .field("request_timeout", &self.request_timeout)
            .field("stream_idle_timeout", &self.stream_idle_timeout)
            .field("poll", &self.poll)
            .field("command_keyword", &self.command_keyword)
            .finish()
    }
}

impl RelayConfig {
    /// Creates a config with defaults for everything but the credentials.
    pub fn new(agent_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            token: token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_url: None,
            request_shape: RequestShape::default(),
            reply_mode: ReplyMode::default(),
            reply_extraction: ReplyExtraction::default(),
            auto_save_history: false,
            request_timeout: Duration::from_secs(30),
            stream_idle_timeout: Some(Duration::from_secs(120)),
            poll: PollPolicy::default(),
            command_keyword: "coze".to_string(),
        }
    }

    /// Builds a config from `AGENT_RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, RelayError> {
        let mut map = HashMap::new();
        for (field, keys) in ENV_KEYS {
            if let Some(value) = keys
                .iter()
                .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
            {
                map.insert(field.to_string(), value);
            }
        }
        Self::from_map(&map)
    }

    /// Builds a config from a flat string mapping keyed by field name, as
    /// handed over by host frameworks.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, RelayError> {
        let get = |key: &str| {
            map.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let agent_id = get("agent_id")
            .or_else(|| get("bot_id"))
            .ok_or_else(|| RelayError::ConfigMissing("agent_id".into()))?;
        let token = get("token")
            .or_else(|| get("access_token"))
            .ok_or_else(|| RelayError::ConfigMissing("token".into()))?;

        let mut config = Self::new(agent_id, token);
        if let Some(url) = get("base_url").or_else(|| get("api_url")) {
            config.base_url = url.to_string();
        }
        config.poll_url = get("poll_url").map(ToOwned::to_owned);
        if let Some(shape) = get("request_shape") {
            config.request_shape = shape.parse()?;
        }
        if let Some(mode) = get("reply_mode") {
            config.reply_mode = mode.parse()?;
        }
        if let Some(path) = get("reply_path") {
            config.reply_extraction = path.parse()?;
        }
        if let Some(flag) = get("auto_save_history") {
            config.auto_save_history = parse_bool(flag)
                .ok_or_else(|| invalid("auto_save_history", flag))?;
        }
        if let Some(secs) = get("request_timeout_secs") {
            config.request_timeout = Duration::from_secs(parse_num("request_timeout_secs", secs)?);
        }
        if let Some(secs) = get("stream_idle_timeout_secs") {
            let secs = parse_num("stream_idle_timeout_secs", secs)?;
            config.stream_idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(attempts) = get("poll_max_attempts") {
            config.poll.max_attempts = parse_num("poll_max_attempts", attempts)?;
        }
        if let Some(secs) = get("poll_delay_secs") {
            config.poll.delay = Duration::from_secs(parse_num("poll_delay_secs", secs)?);
        }
        if let Some(keyword) = get("command_keyword") {
            config.command_keyword = keyword.trim_start_matches('/').to_string();
        }
        config.validate()?;
        Ok(config)
    }

    /// Overrides the chat endpoint URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the status endpoint prefix.
    pub fn poll_url(mut self, poll_url: impl Into<String>) -> Self {
        self.poll_url = Some(poll_url.into());
        self
    }

    pub fn request_shape(mut self, shape: RequestShape) -> Self {
        self.request_shape = shape;
        self
    }

    pub fn reply_mode(mut self, mode: ReplyMode) -> Self {
        self.reply_mode = mode;
        self
    }

    pub fn reply_extraction(mut self, extraction: ReplyExtraction) -> Self {
        self.reply_extraction = extraction;
        self
    }

    pub fn auto_save_history(mut self, enabled: bool) -> Self {
        self.auto_save_history = enabled;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn stream_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    pub fn poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll = policy;
        self
    }

    pub fn command_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.command_keyword = keyword.into();
        self
    }

    /// Checks required credentials and value ranges.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.agent_id.trim().is_empty() {
            return Err(RelayError::ConfigMissing("agent_id".into()));
        }
        if self.token.trim().is_empty() {
            return Err(RelayError::ConfigMissing("token".into()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(invalid("base_url", &self.base_url));
        }
        if self.request_timeout.is_zero() {
            return Err(RelayError::Config(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.poll.max_attempts == 0 {
            return Err(RelayError::Config(
                "poll_max_attempts must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn status_url(&self, job_id: &str) -> String {
        let prefix = self.poll_url.as_deref().unwrap_or(&self.base_url);
        format!("{}/{job_id}", prefix.trim_end_matches('/'))
    }
}

const ENV_KEYS: &[(&str, &[&str])] = &[
    ("agent_id", &["AGENT_RELAY_AGENT_ID", "COZE_BOT_ID"]),
    ("token", &["AGENT_RELAY_TOKEN", "COZE_ACCESS_TOKEN"]),
    ("base_url", &["AGENT_RELAY_BASE_URL"]),
    ("poll_url", &["AGENT_RELAY_POLL_URL"]),
    ("request_shape", &["AGENT_RELAY_REQUEST_SHAPE"]),
    ("reply_mode", &["AGENT_RELAY_REPLY_MODE"]),
    ("reply_path", &["AGENT_RELAY_REPLY_PATH"]),
    ("auto_save_history", &["AGENT_RELAY_AUTO_SAVE_HISTORY"]),
    ("request_timeout_secs", &["AGENT_RELAY_TIMEOUT_SECS"]),
    ("stream_idle_timeout_secs", &["AGENT_RELAY_STREAM_IDLE_SECS"]),
    ("poll_max_attempts", &["AGENT_RELAY_POLL_ATTEMPTS"]),
    ("poll_delay_secs", &["AGENT_RELAY_POLL_DELAY_SECS"]),
    ("command_keyword", &["AGENT_RELAY_COMMAND"]),
];

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, RelayError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> RelayError {
    RelayError::Config(format!("invalid value for {key}: `{value}`"))
}
