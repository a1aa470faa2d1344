//! A provider that replays canned rounds, for tests.

use crate::provider::{CompletionRequest, DeltaSink, OutputDelta, ProviderAdapter, ProviderError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// How a scripted round ends after its deltas have been sent.
#[derive(Debug, Clone)]
pub enum RoundEnd {
    /// Return `Ok` (the deltas normally include `TurnComplete`).
    Finish,
    Fail(ProviderError),
    /// Wait until the turn is cancelled.
    Hang,
}

#[derive(Debug, Clone)]
pub struct ScriptedRound {
    pub deltas: Vec<OutputDelta>,
    pub end: RoundEnd,
}

impl ScriptedRound {
    pub fn text(text: &str) -> Self {
        Self {
            deltas: vec![
                OutputDelta::TextChunk(text.to_string()),
                OutputDelta::TurnComplete {
                    finish_reason: Some("stop".to_string()),
                },
            ],
            end: RoundEnd::Finish,
        }
    }

    /// Text followed by tool calls given as `(id, name, arguments)`. Each
    /// call's arguments are sent in two fragments.
    pub fn tool_calls(text: &str, calls: &[(&str, &str, Value)]) -> Self {
        let mut deltas = Vec::new();
        if !text.is_empty() {
            deltas.push(OutputDelta::TextChunk(text.to_string()));
        }
        for (index, (id, name, arguments)) in calls.iter().enumerate() {
            let raw = arguments.to_string();
            let split = raw.len() / 2;
            let split = (split..=raw.len())
                .find(|at| raw.is_char_boundary(*at))
                .unwrap_or(raw.len());
            deltas.push(OutputDelta::ToolCallDelta {
                index,
                id: (!id.is_empty()).then(|| id.to_string()),
                name: Some(name.to_string()),
                arguments_fragment: Some(raw[..split].to_string()),
            });
            deltas.push(OutputDelta::ToolCallDelta {
                index,
                id: None,
                name: None,
                arguments_fragment: Some(raw[split..].to_string()),
            });
        }
        deltas.push(OutputDelta::TurnComplete {
            finish_reason: Some("tool_calls".to_string()),
        });
        Self {
            deltas,
            end: RoundEnd::Finish,
        }
    }

    pub fn raw(deltas: Vec<OutputDelta>) -> Self {
        Self {
            deltas,
            end: RoundEnd::Finish,
        }
    }

    pub fn failing(partial_text: &str, error: ProviderError) -> Self {
        Self {
            deltas: partial(partial_text),
            end: RoundEnd::Fail(error),
        }
    }

    pub fn hanging(partial_text: &str) -> Self {
        Self {
            deltas: partial(partial_text),
            end: RoundEnd::Hang,
        }
    }
}

fn partial(text: &str) -> Vec<OutputDelta> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![OutputDelta::TextChunk(text.to_string())]
    }
}

/// Replays one [`ScriptedRound`] per `stream_completion` call and records
/// every request it receives.
#[derive(Default)]
pub struct ScriptedProvider {
    rounds: Mutex<VecDeque<ScriptedRound>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(rounds: impl IntoIterator<Item = ScriptedRound>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn remaining_rounds(&self) -> usize {
        lock(&self.rounds).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        sink: &DeltaSink,
    ) -> Result<(), ProviderError> {
        lock(&self.requests).push(request);
        let round = lock(&self.rounds)
            .pop_front()
            .ok_or_else(|| ProviderError::MalformedPayload("script exhausted".to_string()))?;

        for delta in round.deltas {
            sink.send(delta).await?;
        }
        match round.end {
            RoundEnd::Finish => Ok(()),
            RoundEnd::Fail(error) => Err(error),
            RoundEnd::Hang => {
                sink.cancelled().await;
                Err(ProviderError::Cancelled)
            }
        }
    }
}
