//! The turn orchestrator.
//!
//! A turn starts with one user message and alternates between streaming a
//! provider completion and dispatching the tool calls it asked for, until
//! the model answers without calling tools. Every step is appended to the
//! session as it happens, so a failed turn leaves the session exactly as it
//! stood after the last successful append.
//!
//! ```text
//! Idle → AwaitingProvider → DispatchingTools → AwaitingProvider → … → Done
//!                      ↘ Failed (from any state)
//! ```

pub mod accumulator;
pub mod prompt;

use crate::core::bot::Bot;
use crate::core::config::TurnSettings;
use crate::core::message::{NewMessage, ToolCallRequest, ToolCallResult, ToolFailureKind};
use crate::core::session::Session;
use crate::core::store::{SessionStore, StoreError};
use crate::mcp::ToolRegistry;
use crate::provider::{
    spawn_completion, CompletionRequest, OutputDelta, ProviderAdapter, ProviderError, ToolSpec,
};
use accumulator::{AccumulatedCall, ToolCallAccumulator};
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub struct TurnPolicy {
    pub max_tool_rounds: u32,
    pub provider_retries: u32,
    /// Delay before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,
    pub delta_buffer: usize,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self::from(&TurnSettings::default())
    }
}

impl From<&TurnSettings> for TurnPolicy {
    fn from(settings: &TurnSettings) -> Self {
        Self {
            max_tool_rounds: settings.max_tool_rounds(),
            provider_retries: settings.provider_retries(),
            retry_backoff: RETRY_BACKOFF,
            delta_buffer: settings.delta_buffer(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_text: String,
    pub bot: Option<Bot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingProvider,
    DispatchingTools,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    State(TurnState),
    /// Assistant text in provider emission order.
    Text(String),
    /// The provider call failed and is being retried; text received since
    /// the last `AwaitingProvider` is void.
    Retry { attempt: u32, error: String },
    ToolCall(ToolCallRequest),
    ToolResult(ToolCallResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub session_id: String,
    /// Text of the final assistant message.
    pub final_text: String,
    /// Tool rounds dispatched.
    pub rounds: u32,
    /// Messages appended to the session, the user message included.
    pub appended: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("session '{0}' already has a turn in progress")]
    SessionBusy(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("tool-call round limit of {limit} exceeded")]
    TurnLimitExceeded { limit: u32 },

    #[error("turn cancelled")]
    Cancelled,
}

/// Asked before a tool call runs. Calls to tools their server lists in
/// `auto_confirm` skip the question, as do calls that fail before reaching
/// a server.
#[async_trait]
pub trait ToolApprover: Send + Sync {
    async fn approve(&self, call: &ToolCallRequest) -> bool;
}

/// Marks a session busy for as long as it lives.
struct SessionGuard {
    busy: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        lock(&self.busy).remove(&self.session_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What one provider round produced.
struct Completion {
    text: String,
    calls: ToolCallAccumulator,
}

/// Per-turn context threaded through the helpers.
struct TurnContext<'a> {
    session: Session,
    model: String,
    bot: Option<&'a Bot>,
    events: &'a mpsc::UnboundedSender<TurnEvent>,
    cancel: &'a CancellationToken,
    appended: usize,
}

impl TurnContext<'_> {
    fn emit(&self, event: TurnEvent) {
        let _ = self.events.send(event);
    }
}

pub struct TurnOrchestrator {
    store: Arc<dyn SessionStore>,
    registry: ToolRegistry,
    provider: Arc<dyn ProviderAdapter>,
    policy: TurnPolicy,
    approver: Option<Arc<dyn ToolApprover>>,
    busy: Arc<Mutex<HashSet<String>>>,
}

impl TurnOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: ToolRegistry,
        provider: Arc<dyn ProviderAdapter>,
        policy: TurnPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            provider,
            policy,
            approver: None,
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Every tool call not auto-confirmed is put to `approver` first.
    pub fn with_approver(mut self, approver: Arc<dyn ToolApprover>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    fn acquire(&self, session_id: &str) -> Result<SessionGuard, TurnError> {
        let mut busy = lock(&self.busy);
        if !busy.insert(session_id.to_string()) {
            return Err(TurnError::SessionBusy(session_id.to_string()));
        }
        Ok(SessionGuard {
            busy: Arc::clone(&self.busy),
            session_id: session_id.to_string(),
        })
    }

    /// Runs one turn to completion, cancellation or failure. Events are
    /// best effort: a dropped receiver does not stop the turn.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        events: mpsc::UnboundedSender<TurnEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        let _guard = self.acquire(&request.session_id)?;
        let _ = events.send(TurnEvent::State(TurnState::Idle));

        let result = self.drive(&request, &events, &cancel).await;
        let final_state = match &result {
            Ok(_) => TurnState::Done,
            Err(err) => {
                warn!(session_id = %request.session_id, error = %err, "Turn failed");
                TurnState::Failed
            }
        };
        let _ = events.send(TurnEvent::State(final_state));
        result
    }

    async fn drive(
        &self,
        request: &TurnRequest,
        events: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        if cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }
        let session = self.store.load(&request.session_id).await?;
        let bot = request.bot.as_ref();
        let model = bot
            .and_then(|bot| bot.model.clone())
            .unwrap_or_else(|| self.provider.default_model().to_string());
        let limit = bot
            .and_then(|bot| bot.max_tool_rounds)
            .unwrap_or(self.policy.max_tool_rounds);

        let mut turn = TurnContext {
            session,
            model,
            bot,
            events,
            cancel,
            appended: 0,
        };
        self.answer_orphaned_calls(&mut turn).await?;
        self.append(&mut turn, NewMessage::user(request.user_text.clone()))
            .await?;

        let mut rounds = 0u32;
        loop {
            turn.emit(TurnEvent::State(TurnState::AwaitingProvider));
            let completion = self.complete_with_retry(&turn).await?;
            let calls = completion
                .calls
                .finish(&turn.session.requested_call_ids());
            let requests: Vec<ToolCallRequest> =
                calls.iter().map(|call| call.request.clone()).collect();

            let assistant = NewMessage::assistant(
                completion.text.clone(),
                requests.clone(),
                Some(turn.model.clone()),
            );
            self.append(&mut turn, assistant).await?;

            if calls.is_empty() {
                info!(
                    session_id = %request.session_id,
                    rounds,
                    appended = turn.appended,
                    "Turn complete"
                );
                return Ok(TurnOutcome {
                    session_id: request.session_id.clone(),
                    final_text: completion.text,
                    rounds,
                    appended: turn.appended,
                });
            }

            if rounds >= limit {
                for call in &requests {
                    let result = ToolCallResult::failure(
                        call.id.clone(),
                        ToolFailureKind::TurnLimitExceeded,
                        format!("tool-call round limit of {limit} reached"),
                    );
                    self.append_result(&mut turn, result).await?;
                }
                return Err(TurnError::TurnLimitExceeded { limit });
            }

            rounds += 1;
            turn.emit(TurnEvent::State(TurnState::DispatchingTools));
            self.dispatch(&mut turn, calls).await?;
        }
    }

    async fn append(&self, turn: &mut TurnContext<'_>, draft: NewMessage) -> Result<(), TurnError> {
        let message = self.store.append(&turn.session.id, draft).await?;
        turn.session.updated_at = message.timestamp;
        turn.session.messages.push(message);
        turn.appended += 1;
        Ok(())
    }

    /// A turn that failed mid-dispatch can leave calls without results,
    /// which providers reject. They are closed out as cancelled.
    async fn answer_orphaned_calls(&self, turn: &mut TurnContext<'_>) -> Result<(), TurnError> {
        let orphaned = turn.session.unanswered_call_ids();
        if orphaned.is_empty() {
            return Ok(());
        }
        warn!(
            session_id = %turn.session.id,
            count = orphaned.len(),
            "Closing tool calls left unanswered by an earlier turn"
        );
        for call_id in orphaned {
            let result = ToolCallResult::failure(
                call_id,
                ToolFailureKind::Cancelled,
                "no result was recorded for this call",
            );
            self.append(turn, NewMessage::tool(result)).await?;
        }
        Ok(())
    }

    async fn append_result(
        &self,
        turn: &mut TurnContext<'_>,
        result: ToolCallResult,
    ) -> Result<(), TurnError> {
        self.append(turn, NewMessage::tool(result.clone())).await?;
        turn.emit(TurnEvent::ToolResult(result));
        Ok(())
    }

    fn completion_request(&self, turn: &TurnContext<'_>) -> CompletionRequest {
        let mcp_section = self.registry.prompt_section();
        CompletionRequest {
            model: turn.model.clone(),
            system_prompt: prompt::build_system_prompt(
                turn.bot,
                mcp_section.as_deref(),
                chrono::Local::now(),
            ),
            messages: turn.session.messages.clone(),
            tools: self
                .registry
                .tools()
                .into_iter()
                .map(|tool| ToolSpec {
                    name: tool.qualified_name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                })
                .collect(),
            params: turn
                .bot
                .map(|bot| bot.params.clone())
                .unwrap_or_default(),
        }
    }

    async fn complete_with_retry(&self, turn: &TurnContext<'_>) -> Result<Completion, TurnError> {
        let request = self.completion_request(turn);
        let mut attempt = 0u32;
        loop {
            match self.stream_round(request.clone(), turn).await {
                Err(TurnError::Provider(err)) if attempt < self.policy.provider_retries => {
                    attempt += 1;
                    warn!(
                        session_id = %turn.session.id,
                        attempt,
                        error = %err,
                        "Provider call failed, retrying"
                    );
                    turn.emit(TurnEvent::Retry {
                        attempt,
                        error: err.to_string(),
                    });
                    tokio::select! {
                        biased;
                        _ = turn.cancel.cancelled() => return Err(TurnError::Cancelled),
                        _ = tokio::time::sleep(self.policy.retry_backoff * attempt) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Streams one provider call. Text is forwarded as it arrives; tool
    /// calls are accumulated until `TurnComplete`.
    async fn stream_round(
        &self,
        request: CompletionRequest,
        turn: &TurnContext<'_>,
    ) -> Result<Completion, TurnError> {
        let round_cancel = turn.cancel.child_token();
        let _stop_provider = round_cancel.clone().drop_guard();
        let mut deltas = spawn_completion(
            Arc::clone(&self.provider),
            request,
            self.policy.delta_buffer,
            round_cancel,
        );

        let mut text = String::new();
        let mut calls = ToolCallAccumulator::default();
        loop {
            let item = tokio::select! {
                biased;
                _ = turn.cancel.cancelled() => return Err(TurnError::Cancelled),
                item = deltas.recv() => item,
            };
            match item {
                None => return Err(ProviderError::StreamEnded.into()),
                Some(Err(ProviderError::Cancelled)) if turn.cancel.is_cancelled() => {
                    return Err(TurnError::Cancelled)
                }
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(OutputDelta::TextChunk(chunk))) => {
                    text.push_str(&chunk);
                    turn.emit(TurnEvent::Text(chunk));
                }
                Some(Ok(OutputDelta::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments_fragment,
                })) => calls.push(index, id, name, arguments_fragment),
                Some(Ok(OutputDelta::TurnComplete { finish_reason })) => {
                    debug!(
                        session_id = %turn.session.id,
                        finish_reason = ?finish_reason,
                        has_tool_calls = !calls.is_empty(),
                        "Provider round complete"
                    );
                    return Ok(Completion { text, calls });
                }
            }
        }
    }

    /// Puts each call needing approval to the approver, then runs the
    /// approved calls concurrently and appends each result as it completes.
    /// Declined calls are answered with `denied` results. On cancellation
    /// the outstanding calls are dropped and answered with `cancelled`
    /// results.
    async fn dispatch(
        &self,
        turn: &mut TurnContext<'_>,
        calls: Vec<AccumulatedCall>,
    ) -> Result<(), TurnError> {
        for call in &calls {
            turn.emit(TurnEvent::ToolCall(call.request.clone()));
        }
        let mut unanswered: Vec<String> = calls
            .iter()
            .map(|call| call.request.id.clone())
            .collect();

        let cancel = turn.cancel.clone();
        let mut approved = Vec::with_capacity(calls.len());
        for call in calls {
            let Some(approver) = self.approver_for(&call) else {
                approved.push(call);
                continue;
            };
            let decision = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                decision = approver.approve(&call.request) => Some(decision),
            };
            match decision {
                None => return self.cancel_outstanding(turn, unanswered).await,
                Some(true) => approved.push(call),
                Some(false) => {
                    debug!(call_id = %call.request.id, tool = %call.request.name, "Tool call declined");
                    unanswered.retain(|id| id != &call.request.id);
                    let result = ToolCallResult::failure(
                        call.request.id,
                        ToolFailureKind::Denied,
                        "the user declined to run this tool",
                    );
                    self.append_result(turn, result).await?;
                }
            }
        }

        let mut running: FuturesUnordered<_> = approved
            .into_iter()
            .map(|call| run_tool(self.registry.clone(), call))
            .collect();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = running.next() => match next {
                    Some(result) => Some(result),
                    None => return Ok(()),
                },
            };
            let Some(result) = next else {
                break;
            };
            unanswered.retain(|id| id != &result.call_id);
            self.append_result(turn, result).await?;
        }

        drop(running);
        self.cancel_outstanding(turn, unanswered).await
    }

    /// The approver to consult for `call`, if it needs one. Calls that
    /// cannot reach a server fail without asking.
    fn approver_for(&self, call: &AccumulatedCall) -> Option<&Arc<dyn ToolApprover>> {
        let approver = self.approver.as_ref()?;
        if call.parse_error.is_some() {
            return None;
        }
        match self.registry.resolve(&call.request.name) {
            Ok(descriptor) if !descriptor.auto_confirm => Some(approver),
            _ => None,
        }
    }

    async fn cancel_outstanding(
        &self,
        turn: &mut TurnContext<'_>,
        unanswered: Vec<String>,
    ) -> Result<(), TurnError> {
        debug!(
            session_id = %turn.session.id,
            outstanding = unanswered.len(),
            "Cancelling tool dispatch"
        );
        for call_id in unanswered {
            let result = ToolCallResult::failure(
                call_id,
                ToolFailureKind::Cancelled,
                "turn cancelled before the tool answered",
            );
            self.append_result(turn, result).await?;
        }
        Err(TurnError::Cancelled)
    }
}

async fn run_tool(registry: ToolRegistry, call: AccumulatedCall) -> ToolCallResult {
    let AccumulatedCall {
        request,
        parse_error,
    } = call;
    if let Some(err) = parse_error {
        return ToolCallResult::failure(
            request.id,
            ToolFailureKind::InvalidArguments,
            format!("arguments are not valid JSON: {err}"),
        );
    }

    debug!(call_id = %request.id, tool = %request.name, "Dispatching tool call");
    match registry.invoke(&request.name, request.arguments).await {
        Ok(output) if output.is_error => {
            ToolCallResult::failure(request.id, ToolFailureKind::ToolError, output.content)
        }
        Ok(output) => ToolCallResult::success(request.id, output.content),
        Err(err) => {
            debug!(call_id = %request.id, error = %err, "Tool call failed");
            ToolCallResult::failure(request.id, err.failure_kind(), err.to_string())
        }
    }
}
