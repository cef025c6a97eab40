use tracing::debug;

use crate::command::ChatCommand;
use crate::config::{RelayConfig, RequestShape};
use crate::decoder::{EventStream, decode_byte_stream};
use crate::errors::{RelayError, network_error};
use crate::event::body_failure;
use crate::poll::{JobSnapshot, JobStatusSource};

/// HTTP client for one configured agent endpoint.
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    config: RelayConfig,
}

impl AgentClient {
    /// Creates a client from validated configuration.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// Outbound calls a relay invocation makes. Implemented by [`AgentClient`];
/// tests substitute fakes.
#[async_trait::async_trait]
pub trait AgentTransport: JobStatusSource {
    /// Sends the command with `stream: true` and returns the decoded event
    /// stream. Dropping the stream closes the connection.
    async fn open_stream(&self, command: &ChatCommand) -> Result<EventStream, RelayError>;

    /// Sends the command with `stream: false` and returns the HTTP status and
    /// JSON body.
    async fn send_buffered(
        &self,
        command: &ChatCommand,
    ) -> Result<(u16, serde_json::Value), RelayError>;
}

#[async_trait::async_trait]
impl AgentTransport for AgentClient {
    async fn open_stream(&self, command: &ChatCommand) -> Result<EventStream, RelayError> {
        let body = build_request_body(&self.config, command, true);
        debug!(url = %self.config.base_url, user_id = %command.user_id, "opening agent stream");
        let response = self
            .http
            .post(&self.config.base_url)
            .bearer_auth(&self.config.token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| network_error("agent request failed", &e))?;
        let response = check_status(response).await?;
        if is_json(&response) {
            let body = read_json(response).await?;
            return Err(match body_failure(&body) {
                Some(failure) => RelayError::Remote(failure),
                None => RelayError::Decode("expected an event stream, got a JSON body".into()),
            });
        }
        Ok(decode_byte_stream(
            response.bytes_stream(),
            self.config.stream_idle_timeout,
        ))
    }

    async fn send_buffered(
        &self,
        command: &ChatCommand,
    ) -> Result<(u16, serde_json::Value), RelayError> {
        let body = build_request_body(&self.config, command, false);
        debug!(url = %self.config.base_url, user_id = %command.user_id, "sending agent request");
        let response = self
            .http
            .post(&self.config.base_url)
            .bearer_auth(&self.config.token)
            .json(&body)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| network_error("agent request failed", &e))?;
        let response = check_status(response).await?;
        let status = response.status().as_u16();
        let value = read_json(response).await?;
        Ok((status, value))
    }
}

#[async_trait::async_trait]
impl JobStatusSource for AgentClient {
    async fn fetch_status(&self, job_id: &str) -> Result<JobSnapshot, RelayError> {
        let response = self
            .http
            .get(self.config.status_url(job_id))
            .bearer_auth(&self.config.token)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| network_error("status request failed", &e))?;
        let response = check_status(response).await?;
        JobSnapshot::from_body(&read_json(response).await?)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(RelayError::HttpStatus {
        status: status.as_u16(),
        body,
    })
}

/// Agents answer some rejected requests with a plain JSON body instead of an
/// event stream.
fn is_json(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().starts_with("application/json"))
}

async fn read_json(response: reqwest::Response) -> Result<serde_json::Value, RelayError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| network_error("reading response body failed", &e))?;
    serde_json::from_slice(&bytes).map_err(|e| RelayError::Decode(format!("invalid JSON body: {e}")))
}

/// Builds the JSON request body for the configured shape.
pub fn build_request_body(
    config: &RelayConfig,
    command: &ChatCommand,
    stream: bool,
) -> serde_json::Value {
    let user_message = || {
        serde_json::json!([{
            "role": "user",
            "content": command.text,
            "content_type": "text",
        }])
    };

    let mut body = match config.request_shape {
        RequestShape::Coze => serde_json::json!({
            "bot_id": config.agent_id,
            "additional_messages": user_message(),
        }),
        RequestShape::Messages => serde_json::json!({
            "bot_id": config.agent_id,
            "messages": user_message(),
        }),
        RequestShape::Agent => serde_json::json!({
            "agent_id": config.agent_id,
            "message": command.text,
        }),
        RequestShape::Query => serde_json::json!({
            "bot_id": config.agent_id,
            "query": command.text,
        }),
    };
    body["user_id"] = serde_json::json!(command.user_id);
    body["stream"] = serde_json::json!(stream);
    body["auto_save_history"] = serde_json::json!(config.auto_save_history);
    if let Some(conversation_id) = &command.conversation_id {
        body["conversation_id"] = serde_json::json!(conversation_id);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> ChatCommand {
        ChatCommand::new("hello there", "user-42")
    }

    #[test]
    fn coze_body_uses_additional_messages() {
        let config = RelayConfig::new("bot-1", "t");
        let body = build_request_body(&config, &command(), true);
        assert_eq!(body["bot_id"], "bot-1");
        assert_eq!(body["user_id"], "user-42");
        assert_eq!(body["stream"], true);
        assert_eq!(body["auto_save_history"], false);
        assert_eq!(body["additional_messages"][0]["role"], "user");
        assert_eq!(body["additional_messages"][0]["content"], "hello there");
        assert_eq!(body["additional_messages"][0]["content_type"], "text");
        assert!(body.get("conversation_id").is_none());
    }

    #[test]
    fn single_string_shapes() {
        let agent = RelayConfig::new("a-1", "t").request_shape(RequestShape::Agent);
        let body = build_request_body(&agent, &command(), false);
        assert_eq!(body["agent_id"], "a-1");
        assert_eq!(body["message"], "hello there");
        assert_eq!(body["stream"], false);
        assert!(body.get("bot_id").is_none());

        let query = RelayConfig::new("b-1", "t").request_shape(RequestShape::Query);
        let body = build_request_body(&query, &command(), false);
        assert_eq!(body["query"], "hello there");
    }

    #[test]
    fn conversation_id_is_forwarded() {
        let config = RelayConfig::new("bot-1", "t").request_shape(RequestShape::Messages);
        let body = build_request_body(
            &config,
            &command().conversation_id("conv-7"),
            false,
        );
        assert_eq!(body["conversation_id"], "conv-7");
        assert_eq!(body["messages"][0]["content"], "hello there");
    }

    #[test]
    fn client_rejects_invalid_config() {
        let result = AgentClient::new(RelayConfig::new("", "t"));
        assert!(matches!(result, Err(RelayError::ConfigMissing(_))));
    }
}
