//! Provider adapters stream model output as [`OutputDelta`]s.
//!
//! An adapter runs on its own task (see [`spawn_completion`]) and pushes
//! deltas into a [`DeltaSink`]. The sink is bounded, so a slow consumer
//! applies backpressure to the adapter, and it carries the turn's
//! cancellation token: once the turn is cancelled every `send` fails with
//! [`ProviderError::Cancelled`] and the adapter is expected to return.

pub mod openai;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use crate::core::message::Message;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use openai::OpenAiCompatibleProvider;

/// A tool the model may call, by qualified `<server>.<tool>` name.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    /// Persisted session history, oldest first.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    /// Bot parameters merged into the provider request body.
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputDelta {
    TextChunk(String),
    /// One fragment of a tool call. Fragments sharing an `index` belong to
    /// the same call; `arguments_fragment`s are concatenated in order.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_fragment: Option<String>,
    },
    TurnComplete {
        finish_reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("{message}")]
    Api { status: Option<u16>, message: String },

    #[error("malformed provider payload: {0}")]
    MalformedPayload(String),

    #[error("completion cancelled")]
    Cancelled,

    #[error("provider stream ended before the response was complete")]
    StreamEnded,
}

pub type DeltaItem = Result<OutputDelta, ProviderError>;
pub type DeltaReceiver = mpsc::Receiver<DeltaItem>;

/// Where an adapter writes its output.
pub struct DeltaSink {
    tx: mpsc::Sender<DeltaItem>,
    cancel: CancellationToken,
    completed: AtomicBool,
}

impl DeltaSink {
    pub fn new(tx: mpsc::Sender<DeltaItem>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            completed: AtomicBool::new(false),
        }
    }

    /// Delivers one delta, waiting for buffer space. Fails with
    /// `Cancelled` once the turn is cancelled or the receiver is gone.
    pub async fn send(&self, delta: OutputDelta) -> Result<(), ProviderError> {
        if self.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let is_complete = matches!(delta, OutputDelta::TurnComplete { .. });
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProviderError::Cancelled),
            sent = self.tx.send(Ok(delta)) => {
                sent.map_err(|_| ProviderError::Cancelled)?;
                if is_complete {
                    self.completed.store(true, Ordering::SeqCst);
                }
                Ok(())
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the turn is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    async fn fail(&self, error: ProviderError) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.tx.send(Err(error)).await.is_err() {
            debug!("Provider error dropped, receiver gone");
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Model used when the bot does not name one.
    fn default_model(&self) -> &str;

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        sink: &DeltaSink,
    ) -> Result<(), ProviderError>;
}

/// Runs `provider` on its own task and returns the receiving end of its
/// deltas. A failure arrives as a final `Err` item; an adapter that returns
/// `Ok` without completing gets a `TurnComplete` appended. Cancelling
/// `cancel` stops the task.
pub fn spawn_completion(
    provider: Arc<dyn ProviderAdapter>,
    request: CompletionRequest,
    buffer: usize,
    cancel: CancellationToken,
) -> DeltaReceiver {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    tokio::spawn(async move {
        let sink = DeltaSink::new(tx, cancel.clone());
        let outcome = tokio::select! {
            outcome = provider.stream_completion(request, &sink) => outcome,
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        };
        match outcome {
            Ok(()) if !sink.completed() => {
                let _ = sink
                    .send(OutputDelta::TurnComplete {
                        finish_reason: None,
                    })
                    .await;
            }
            Ok(()) | Err(ProviderError::Cancelled) => {}
            Err(err) => sink.fail(err).await,
        }
    });
    rx
}
