//! Relay chat commands to conversational-agent HTTP APIs (Coze, YuanQi and
//! compatible endpoints) and aggregate their replies.
//!
//! The agent's response arrives either as a `data:` line event stream, which
//! is decoded and folded into reply fragments, or as a JSON body that may
//! hand back a job handle to poll.
//!
//! # Usage
//!
//! ```no_run
//! use agent_relay::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), RelayError> {
//! let relay = Relay::new(RelayConfig::from_env()?)?;
//!
//! let mut stream = relay.handle(ChatCommand::new("Say hello", "user-1"));
//! while let Some(fragment) = stream.next_fragment().await {
//!     print!("{fragment}");
//! }
//! println!();
//! # Ok(())
//! # }
//! ```

/// Stream event aggregation into a final reply.
pub mod aggregator;
/// HTTP transport to the agent API.
pub mod client;
/// Chat command parsing.
pub mod command;
/// Relay configuration.
pub mod config;
/// Line splitting and event decoding.
pub mod decoder;
/// Error types.
pub mod errors;
/// Decoded stream event types.
pub mod event;
/// Reply extraction for non-streaming responses.
pub mod extract;
/// Logging setup.
pub mod observability;
/// Job status polling.
pub mod poll;
/// Common imports for typical usage.
pub mod prelude;
/// Per-invocation relay task and fragment stream.
pub mod relay;

pub use aggregator::AggregationState;
pub use client::{AgentClient, AgentTransport};
pub use command::ChatCommand;
pub use config::{RelayConfig, ReplyMode, RequestShape};
pub use decoder::{EventDecoder, EventStream, LineSplitter, decode_byte_stream};
pub use errors::{RelayError, RemoteFailure};
pub use event::{EventKind, Role, StreamEvent, Usage};
pub use extract::{JsonPath, ReplyExtraction};
pub use observability::init_observability;
pub use poll::{JobSnapshot, JobStatus, JobStatusSource, PollJob, PollPolicy};
pub use relay::{AbortHandle, Relay, RelayStream, Reply};
