//! Common imports for typical relay usage.
pub use crate::{
    AbortHandle, AgentTransport, ChatCommand, Relay, RelayConfig, RelayError, RelayStream, Reply,
    ReplyExtraction, ReplyMode, RequestShape,
};
