//! Streaming chat transcript assembler for Weft.
//!
//! [`ChatSession`] consumes the ordered event stream of an agent execution
//! engine and incrementally reconstructs one assistant turn: ordered text
//! segments and tool invocations, with best-effort argument previews while
//! tool-call JSON is still streaming, cooperative cancellation, and
//! post-processing of completed tool results.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use weft_engine::{
    rewrite_engine_failure, AgentEngine, Attachment, EngineConfig, EngineError, EngineEvent,
    EngineFactory, EventStream, HistoryEntry, HistoryRole, ResourceFetcher, TelemetrySink,
    TurnRequest, TurnTelemetry,
};

mod checkpoint;
mod fragment_recovery;
mod result_enrichment;

pub use checkpoint::{
    CheckpointScheduler, CooperativeCancellationToken, SnapshotHandler, TranscriptSnapshot,
};
pub use fragment_recovery::FragmentBuffer;

use result_enrichment::post_process_parts;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `Role` values.
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Lifecycle of one tool invocation part.
///
/// Transitions move strictly forward: `Streaming → Pending → Result |
/// Error`, with `Cancelled` reachable only from `Pending` on abort.
pub enum ToolInvocationState {
    Streaming,
    Pending,
    Result,
    Error,
    Cancelled,
}

impl ToolInvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Result | Self::Error | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Enumerates supported `Part` values.
pub enum Part {
    Text {
        text: String,
    },
    ToolInvocation {
        tool_name: String,
        args: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        partial_args: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        state: ToolInvocationState,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `ChatMessage` used across Weft components.
pub struct ChatMessage {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<Part>>,
}

/// Enumerates supported `TranscriptError` values.
#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("a send is already in flight for this session")]
    SendInFlight,
}

/// Terminal state of one `send` call.
///
/// Engine-level failures are surfaced through the transcript (a synthetic
/// assistant message) and reported here as `Failed`, not as an `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Failed { message: String },
}

/// Public struct `SessionConfig` used across Weft components.
///
/// # Examples
///
/// ```
/// use weft_transcript::SessionConfig;
///
/// let config = SessionConfig {
///     checkpoint_interval_ms: 40,
///     ..SessionConfig::default()
/// };
///
/// assert_eq!(config.checkpoint_interval_ms, 40);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub engine: EngineConfig,
    pub checkpoint_interval_ms: u64,
    pub history_limit: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            checkpoint_interval_ms: 80,
            history_limit: Some(64),
        }
    }
}

/// Per-turn reconciliation state: fragment buffers and the part slot each
/// streaming call index occupies. Never shared across turns.
#[derive(Default)]
struct TurnAssembler {
    buffers: HashMap<u64, FragmentBuffer>,
    slots: HashMap<u64, usize>,
}

struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One user-facing conversation: the transcript plus the machinery that
/// assembles assistant turns from engine event streams.
pub struct ChatSession {
    factory: Arc<dyn EngineFactory>,
    config: SessionConfig,
    messages: Vec<ChatMessage>,
    next_message_id: u64,
    in_flight: Arc<AtomicBool>,
    engine_cache: Option<(EngineConfig, Arc<dyn AgentEngine>)>,
    cancellation_token: Option<CooperativeCancellationToken>,
    snapshot_handler: Option<SnapshotHandler>,
    resource_fetcher: Option<Arc<dyn ResourceFetcher>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl ChatSession {
    pub fn new(factory: Arc<dyn EngineFactory>, config: SessionConfig) -> Self {
        Self {
            factory,
            config,
            messages: Vec::new(),
            next_message_id: 1,
            in_flight: Arc::new(AtomicBool::new(false)),
            engine_cache: None,
            cancellation_token: None,
            snapshot_handler: None,
            resource_fetcher: None,
            telemetry: None,
        }
    }

    /// Installs or clears a cooperative cancellation token for subsequent
    /// sends. Callers keep a clone to cancel from another task.
    pub fn set_cancellation_token(&mut self, token: Option<CooperativeCancellationToken>) {
        self.cancellation_token = token;
    }

    /// Installs or clears the UI snapshot handler.
    pub fn set_snapshot_handler(&mut self, handler: Option<SnapshotHandler>) {
        self.snapshot_handler = handler;
    }

    /// Installs or clears the resource fetcher used for result enrichment.
    pub fn set_resource_fetcher(&mut self, fetcher: Option<Arc<dyn ResourceFetcher>>) {
        self.resource_fetcher = fetcher;
    }

    /// Installs or clears the fire-and-forget telemetry sink.
    pub fn set_telemetry_sink(&mut self, sink: Option<Arc<dyn TelemetrySink>>) {
        self.telemetry = sink;
    }

    /// Replaces the engine configuration. The cached engine handle is
    /// invalidated by equality on the next send.
    pub fn set_engine_config(&mut self, engine: EngineConfig) {
        self.config.engine = engine;
    }

    /// Current transcript, ordered oldest first.
    pub fn transcript(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Sends user input and assembles the assistant's turn from the engine's
    /// event stream.
    ///
    /// Returns `Err(SendInFlight)` if another send has not finished yet.
    /// Engine failures do not produce an `Err`: the transcript gains a
    /// synthetic assistant message and the outcome is `Failed`.
    pub async fn send(
        &mut self,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<TurnOutcome, TranscriptError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(TranscriptError::SendInFlight);
        }
        let _guard = InFlightGuard(Arc::clone(&self.in_flight));
        let started = Instant::now();
        let text = text.into();

        let history = self.history_entries();
        let user = self.new_message(Role::User, text.clone(), attachments.clone(), None);
        self.messages.push(user);
        let assistant = self.new_message(Role::Assistant, String::new(), Vec::new(), Some(Vec::new()));
        self.messages.push(assistant);
        let assistant_index = self.messages.len() - 1;

        let mut scheduler =
            CheckpointScheduler::new(Duration::from_millis(self.config.checkpoint_interval_ms));
        // The initial (empty assistant) snapshot is never throttled.
        self.publish(&mut scheduler, true, true);

        if self.is_cancelled() {
            return Ok(self.conclude(&mut scheduler, assistant_index, true, None, started));
        }

        let engine = match self.engine().await {
            Ok(engine) => engine,
            Err(error) => {
                let failure = Some(error.to_string());
                return Ok(self.conclude(&mut scheduler, assistant_index, false, failure, started));
            }
        };
        let request = TurnRequest {
            text,
            history,
            attachments,
        };
        let mut stream = match engine.stream(request).await {
            Ok(stream) => stream,
            Err(error) => {
                let failure = Some(error.to_string());
                return Ok(self.conclude(&mut scheduler, assistant_index, false, failure, started));
            }
        };

        let mut assembler = TurnAssembler::default();
        let (cancelled, failure) = self
            .consume_stream(assistant_index, stream.as_mut(), &mut assembler, &mut scheduler)
            .await;

        self.finish_stream(assistant_index, cancelled);

        let fetcher = self.resource_fetcher.clone();
        if let Some(parts) = self
            .messages
            .get_mut(assistant_index)
            .and_then(|message| message.parts.as_mut())
        {
            post_process_parts(parts, fetcher.as_deref()).await;
        }

        Ok(self.conclude(&mut scheduler, assistant_index, cancelled, failure, started))
    }

    /// Empties the transcript and instructs the engine to drop server-held
    /// conversation memory.
    ///
    /// The engine reset happens first: if it fails, the transcript and the
    /// snapshot sink both keep the old messages.
    pub async fn clear(&mut self) -> Result<(), TranscriptError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(TranscriptError::SendInFlight);
        }
        let _guard = InFlightGuard(Arc::clone(&self.in_flight));

        let engine = self.engine().await?;
        engine.reset().await?;
        self.messages.clear();
        if let Some(handler) = &self.snapshot_handler {
            handler(TranscriptSnapshot {
                messages: Vec::new(),
                is_streaming: false,
            });
        }
        Ok(())
    }

    /// Returns the cached engine handle, rebuilding it through the factory
    /// when the configuration no longer matches the cached one.
    async fn engine(&mut self) -> Result<Arc<dyn AgentEngine>, EngineError> {
        if let Some((config, handle)) = &self.engine_cache {
            if *config == self.config.engine {
                return Ok(Arc::clone(handle));
            }
        }
        let handle = self.factory.build(&self.config.engine).await?;
        self.engine_cache = Some((self.config.engine.clone(), Arc::clone(&handle)));
        Ok(handle)
    }

    /// Consumes the event stream one event at a time, checking cancellation
    /// before each pull. Returns whether the turn was cancelled and any
    /// engine failure that terminated it.
    async fn consume_stream(
        &mut self,
        assistant_index: usize,
        stream: &mut dyn EventStream,
        assembler: &mut TurnAssembler,
        scheduler: &mut CheckpointScheduler,
    ) -> (bool, Option<String>) {
        loop {
            if self.is_cancelled() {
                return (true, None);
            }
            let next = match self.cancellation_token.clone() {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return (true, None),
                        next = stream.next() => next,
                    }
                }
                None => stream.next().await,
            };
            match next {
                None | Some(Ok(EngineEvent::StreamEnd)) => break,
                Some(Ok(event)) => {
                    self.apply_event(assistant_index, assembler, event);
                    self.publish(scheduler, false, true);
                }
                Some(Err(error)) => return (self.is_cancelled(), Some(error.to_string())),
            }
        }
        (self.is_cancelled(), None)
    }

    /// Applies one classified event to the assistant message's parts.
    fn apply_event(
        &mut self,
        assistant_index: usize,
        assembler: &mut TurnAssembler,
        event: EngineEvent,
    ) {
        match event {
            EngineEvent::Token { text } => {
                let Some(message) = self.messages.get_mut(assistant_index) else {
                    return;
                };
                message.content.push_str(&text);
                let parts = message.parts.get_or_insert_with(Vec::new);
                if let Some(Part::Text { text: last }) = parts.last_mut() {
                    last.push_str(&text);
                } else {
                    parts.push(Part::Text { text });
                }
            }
            EngineEvent::ToolArgsFragment {
                index,
                name,
                fragment,
            } => {
                let buffer = assembler.buffers.entry(index).or_default();
                if let Some(hint) = &name {
                    if buffer.name.as_deref().is_some_and(|current| current != hint) {
                        // A different tool started streaming on this index.
                        *buffer = FragmentBuffer::default();
                        assembler.slots.remove(&index);
                    }
                    if buffer.name.is_none() {
                        buffer.name = Some(hint.clone());
                    }
                }
                let candidate = buffer.push(&fragment);
                let tool_name = buffer.name.clone().unwrap_or_default();

                let Some(message) = self.messages.get_mut(assistant_index) else {
                    return;
                };
                let parts = message.parts.get_or_insert_with(Vec::new);
                match assembler.slots.get(&index).copied() {
                    Some(slot) => {
                        if let Some(Part::ToolInvocation {
                            tool_name: existing_name,
                            partial_args,
                            state,
                            ..
                        }) = parts.get_mut(slot)
                        {
                            if *state == ToolInvocationState::Streaming {
                                if existing_name.is_empty() && !tool_name.is_empty() {
                                    *existing_name = tool_name;
                                }
                                if candidate.is_some() {
                                    *partial_args = candidate;
                                }
                            }
                        }
                    }
                    None => {
                        // Appending the invocation part implicitly closes any
                        // trailing text part.
                        parts.push(Part::ToolInvocation {
                            tool_name,
                            args: Value::Null,
                            partial_args: candidate,
                            result: None,
                            state: ToolInvocationState::Streaming,
                        });
                        assembler.slots.insert(index, parts.len() - 1);
                    }
                }
            }
            EngineEvent::ToolInvocationStart { name, args } => {
                let Some(message) = self.messages.get_mut(assistant_index) else {
                    return;
                };
                let parts = message.parts.get_or_insert_with(Vec::new);
                let streaming = parts.iter_mut().find_map(|part| match part {
                    Part::ToolInvocation {
                        tool_name,
                        args: part_args,
                        state,
                        ..
                    } if *state == ToolInvocationState::Streaming
                        && (*tool_name == name || tool_name.is_empty()) =>
                    {
                        Some((tool_name, part_args, state))
                    }
                    _ => None,
                });
                match streaming {
                    Some((tool_name, part_args, state)) => {
                        // partial_args stays: a renderer may still use it as
                        // a placeholder until the next checkpoint.
                        *tool_name = name;
                        *part_args = args;
                        *state = ToolInvocationState::Pending;
                    }
                    None => parts.push(Part::ToolInvocation {
                        tool_name: name,
                        args,
                        partial_args: None,
                        result: None,
                        state: ToolInvocationState::Pending,
                    }),
                }
                // An authoritative invocation start invalidates stale
                // partial state for every in-flight fragment buffer.
                assembler.buffers.clear();
                assembler.slots.clear();
            }
            EngineEvent::ToolInvocationEnd { name, output } => {
                let Some(message) = self.messages.get_mut(assistant_index) else {
                    return;
                };
                let parts = message.parts.get_or_insert_with(Vec::new);
                for part in parts.iter_mut() {
                    if let Part::ToolInvocation {
                        tool_name,
                        result,
                        state,
                        ..
                    } = part
                    {
                        // First-pending, name-matched: concurrent same-named
                        // calls resolve in arrival order.
                        if *tool_name == name
                            && result.is_none()
                            && *state == ToolInvocationState::Pending
                        {
                            *result = Some(output.content);
                            *state = if output.is_error {
                                ToolInvocationState::Error
                            } else {
                                ToolInvocationState::Result
                            };
                            return;
                        }
                    }
                }
                warn!(tool = %name, "tool invocation end without a matching pending part");
            }
            // Stream termination is handled by the consume loop.
            EngineEvent::StreamEnd => {}
        }
    }

    /// Applies the stream-end transition: on cancellation every still-pending
    /// invocation becomes `Cancelled`; a normal end leaves pending parts
    /// as-is but makes the stuck state operator-visible.
    fn finish_stream(&mut self, assistant_index: usize, cancelled: bool) {
        let Some(parts) = self
            .messages
            .get_mut(assistant_index)
            .and_then(|message| message.parts.as_mut())
        else {
            return;
        };
        for part in parts.iter_mut() {
            let Part::ToolInvocation {
                tool_name,
                result,
                state,
                ..
            } = part
            else {
                continue;
            };
            if *state != ToolInvocationState::Pending {
                continue;
            }
            if cancelled {
                *result = Some(Value::String("Cancelled by user".to_string()));
                *state = ToolInvocationState::Cancelled;
            } else {
                warn!(tool = %tool_name, "stream ended with tool invocation still pending");
            }
        }
    }

    /// Finishes the turn: synthetic failure message, final forced publish,
    /// telemetry, outcome.
    fn conclude(
        &mut self,
        scheduler: &mut CheckpointScheduler,
        assistant_index: usize,
        cancelled: bool,
        failure: Option<String>,
        started: Instant,
    ) -> TurnOutcome {
        let outcome = match failure {
            Some(raw) => {
                let message = rewrite_engine_failure(&raw);
                let synthetic =
                    self.new_message(Role::Assistant, message.clone(), Vec::new(), None);
                self.messages.push(synthetic);
                TurnOutcome::Failed { message }
            }
            None if cancelled => TurnOutcome::Cancelled,
            None => TurnOutcome::Completed,
        };

        // The final snapshot is never throttled.
        self.publish(scheduler, true, false);

        let tool_call_count = self
            .messages
            .get(assistant_index)
            .and_then(|message| message.parts.as_ref())
            .map(|parts| {
                parts
                    .iter()
                    .filter(|part| matches!(part, Part::ToolInvocation { .. }))
                    .count()
            })
            .unwrap_or(0);
        let error = match &outcome {
            TurnOutcome::Failed { message } => Some(message.clone()),
            _ => None,
        };
        self.record_telemetry(TurnTelemetry {
            provider: self.config.engine.provider.clone(),
            model: self.config.engine.model.clone(),
            tool_call_count,
            success: outcome == TurnOutcome::Completed,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        });

        outcome
    }

    fn record_telemetry(&self, telemetry: TurnTelemetry) {
        let Some(sink) = &self.telemetry else {
            return;
        };
        let sink = Arc::clone(sink);
        if catch_unwind(AssertUnwindSafe(move || sink.record_turn(telemetry))).is_err() {
            warn!("telemetry sink panicked; turn record dropped");
        }
    }

    fn publish(&self, scheduler: &mut CheckpointScheduler, force: bool, is_streaming: bool) {
        let Some(handler) = &self.snapshot_handler else {
            return;
        };
        if !scheduler.should_publish(force) {
            return;
        }
        handler(TranscriptSnapshot {
            messages: self.messages.clone(),
            is_streaming,
        });
    }

    fn history_entries(&self) -> Vec<HistoryEntry> {
        let entries = self.messages.iter().map(|message| HistoryEntry {
            role: match message.role {
                Role::User => HistoryRole::User,
                Role::Assistant => HistoryRole::Assistant,
            },
            text: message.content.clone(),
        });
        match self.config.history_limit {
            Some(limit) => {
                let skip = self.messages.len().saturating_sub(limit);
                entries.skip(skip).collect()
            }
            None => entries.collect(),
        }
    }

    fn new_message(
        &mut self,
        role: Role,
        content: String,
        attachments: Vec<Attachment>,
        parts: Option<Vec<Part>>,
    ) -> ChatMessage {
        let id = self.next_message_id;
        self.next_message_id += 1;
        ChatMessage {
            id,
            role,
            content,
            timestamp_ms: unix_time_ms(),
            attachments,
            parts,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token
            .as_ref()
            .map(CooperativeCancellationToken::is_cancelled)
            .unwrap_or(false)
    }
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
