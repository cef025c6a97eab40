use std::sync::Arc;

use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument as _, debug, error, info};

use crate::aggregator::AggregationState;
use crate::client::{AgentClient, AgentTransport};
use crate::command::{ChatCommand, usage_hint};
use crate::config::{RelayConfig, ReplyMode};
use crate::errors::RelayError;
use crate::event::body_failure;
use crate::poll::{JobStatus, PollJob};

const FRAGMENT_BUFFER: usize = 128;

/// Handle used to cancel an in-flight invocation.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Requests cancellation. The open connection is dropped and the
    /// invocation finishes with [`RelayError::Cancelled`].
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Final outcome of a successful invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub invocation_id: uuid::Uuid,
    /// Resolved reply text. When the agent sent a completed message it wins
    /// over the concatenated deltas, so with `streamed` set this can differ
    /// from what the host already displayed.
    pub text: String,
    /// `true` when the reply already reached the host as streamed deltas.
    /// Hosts that edit the displayed message in place can replace it with
    /// `text`; append-only hosts keep the deltas.
    pub streamed: bool,
}

/// Relays chat commands to the configured agent API.
#[derive(Clone)]
pub struct Relay {
    transport: Arc<dyn AgentTransport>,
    config: Arc<RelayConfig>,
}

impl Relay {
    /// Validates `config` and builds the HTTP client.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let client = AgentClient::new(config.clone())?;
        Ok(Self::with_transport(config, Arc::new(client)))
    }

    /// Uses a custom transport, e.g. a fake in tests.
    pub fn with_transport(config: RelayConfig, transport: Arc<dyn AgentTransport>) -> Self {
        Self {
            transport,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Starts relaying `command` and returns the fragment stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn handle(&self, command: ChatCommand) -> RelayStream {
        let invocation_id = uuid::Uuid::new_v4();
        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        let (final_tx, final_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = watch::channel(false);

        let span = tracing::info_span!(
            "relay",
            invocation_id = %invocation_id,
            mode = %self.config.reply_mode,
            user_id = %command.user_id,
        );
        tokio::spawn(
            relay_task(
                self.transport.clone(),
                self.config.clone(),
                command,
                invocation_id,
                tx,
                final_tx,
                abort_rx,
            )
            .instrument(span),
        );

        RelayStream {
            invocation_id,
            rx,
            final_rx,
            abort_handle: AbortHandle {
                tx: Arc::new(abort_tx),
            },
        }
    }

    /// Relays `command` and collects every fragment for the host.
    pub async fn reply(&self, command: ChatCommand) -> Vec<String> {
        self.handle(command).collect_fragments().await
    }

    /// Full host entry point: parses raw chat input and relays it, or returns
    /// the usage hint when the message is empty.
    pub async fn respond(&self, raw: &str, user_id: &str) -> Vec<String> {
        match ChatCommand::parse(raw, &self.config.command_keyword, user_id) {
            Some(command) => self.reply(command).await,
            None => vec![usage_hint(&self.config.command_keyword)],
        }
    }
}

/// Fragment stream for one invocation.
///
/// Fragments are plain text ready for the chat; failures arrive as one
/// descriptive fragment. `finish()` returns the typed result.
pub struct RelayStream {
    invocation_id: uuid::Uuid,
    rx: mpsc::Receiver<String>,
    final_rx: oneshot::Receiver<Result<Reply, RelayError>>,
    abort_handle: AbortHandle,
}

impl RelayStream {
    pub fn invocation_id(&self) -> uuid::Uuid {
        self.invocation_id
    }

    /// Returns a handle that can cancel the invocation.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Waits for the next reply fragment. Returns `None` once the invocation
    /// has finished.
    pub async fn next_fragment(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drains remaining fragments and returns the invocation result.
    pub async fn finish(mut self) -> Result<Reply, RelayError> {
        while self.rx.recv().await.is_some() {}
        self.final_rx.await.unwrap_or_else(|_| {
            Err(RelayError::Network(
                "relay task ended without a result".into(),
            ))
        })
    }

    /// Collects every fragment, discarding the typed result.
    pub async fn collect_fragments(mut self) -> Vec<String> {
        let mut fragments = Vec::new();
        while let Some(fragment) = self.rx.recv().await {
            fragments.push(fragment);
        }
        fragments
    }
}

async fn relay_task(
    transport: Arc<dyn AgentTransport>,
    config: Arc<RelayConfig>,
    command: ChatCommand,
    invocation_id: uuid::Uuid,
    tx: mpsc::Sender<String>,
    final_tx: oneshot::Sender<Result<Reply, RelayError>>,
    mut abort_rx: watch::Receiver<bool>,
) {
    info!("relaying command");
    let work = execute(&*transport, &config, &command, &tx);
    tokio::pin!(work);

    let outcome = tokio::select! {
        outcome = &mut work => outcome,
        _ = wait_for_abort(&mut abort_rx) => Err(RelayError::Cancelled),
    };

    let result = match outcome {
        Ok((text, streamed)) => {
            info!(streamed, chars = text.chars().count(), "relay completed");
            if !streamed {
                let _ = tx.send(text.clone()).await;
            }
            Ok(Reply {
                invocation_id,
                text,
                streamed,
            })
        }
        Err(RelayError::Cancelled) => {
            info!("relay cancelled");
            Err(RelayError::Cancelled)
        }
        Err(err) => {
            error!(error = %err, "relay failed");
            let _ = tx.send(err.user_message()).await;
            Err(err)
        }
    };
    let _ = final_tx.send(result);
}

/// Resolves once cancellation was requested or every abort handle is gone.
async fn wait_for_abort(abort_rx: &mut watch::Receiver<bool>) {
    loop {
        if *abort_rx.borrow_and_update() {
            return;
        }
        if abort_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Runs one invocation. Returns the reply text and whether it was already
/// streamed to the host.
async fn execute(
    transport: &dyn AgentTransport,
    config: &RelayConfig,
    command: &ChatCommand,
    tx: &mpsc::Sender<String>,
) -> Result<(String, bool), RelayError> {
    match config.reply_mode {
        ReplyMode::Stream => execute_stream(transport, command, Some(tx)).await,
        ReplyMode::Buffered => execute_stream(transport, command, None).await,
        ReplyMode::Poll => execute_poll(transport, config, command)
            .await
            .map(|text| (text, false)),
    }
}

async fn execute_stream(
    transport: &dyn AgentTransport,
    command: &ChatCommand,
    relay: Option<&mpsc::Sender<String>>,
) -> Result<(String, bool), RelayError> {
    let mut events = transport.open_stream(command).await?;
    let mut state = AggregationState::new();
    let mut streamed = false;

    while let Some(event) = events.next().await {
        let event = event?;
        debug!(kind = %event.kind, "stream event");
        if let Some(delta) = state.apply(&event)
            && let Some(tx) = relay
        {
            tx.send(delta).await.map_err(|_| RelayError::Cancelled)?;
            streamed = true;
        }
        if state.is_terminated() {
            break;
        }
    }
    drop(events);
    state.finish_stream();

    let text = state.resolve()?;
    Ok((text, streamed))
}

async fn execute_poll(
    transport: &dyn AgentTransport,
    config: &RelayConfig,
    command: &ChatCommand,
) -> Result<String, RelayError> {
    let (status, body) = transport.send_buffered(command).await?;
    if let Some(failure) = body_failure(&body) {
        return Err(RelayError::Remote(failure));
    }
    if let Some(job_id) = job_handle(status, &body) {
        info!(job_id = %job_id, "agent queued the request, polling for completion");
        let mut job = PollJob::new(job_id);
        return job.run(transport, config.poll).await;
    }
    config
        .reply_extraction
        .extract(&body)
        .ok_or(RelayError::EmptyReply)
}

/// Job handle of an acknowledgment response: a pending `data.status` (or
/// HTTP 202) with an id.
fn job_handle(status: u16, body: &serde_json::Value) -> Option<String> {
    let data = body.get("data").unwrap_or(body);
    let pending = data
        .get("status")
        .and_then(|v| v.as_str())
        .is_some_and(|s| JobStatus::from_wire(s) == JobStatus::Pending);
    if !pending && status != 202 {
        return None;
    }
    data.get("id")
        .or_else(|| data.get("job_id"))
        .or_else(|| body.get("job_id"))
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned)
}
