//! Engine-facing contracts for the Weft transcript assembler: the event
//! taxonomy emitted by an agent execution engine, the pull-based stream and
//! engine traits, and the optional resource-fetch and telemetry collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `HistoryRole` values.
pub enum HistoryRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `HistoryEntry` used across Weft components.
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Image attachment carried alongside a user message. Immutable once built.
pub struct Attachment {
    pub data: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Attachment {
    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
            name: None,
            size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `TurnRequest` used across Weft components.
///
/// # Examples
///
/// ```
/// use weft_engine::TurnRequest;
///
/// let request = TurnRequest::text("hello");
/// assert_eq!(request.text, "hello");
/// assert!(request.history.is_empty());
/// ```
pub struct TurnRequest {
    pub text: String,
    pub history: Vec<HistoryEntry>,
    pub attachments: Vec<Attachment>,
}

impl TurnRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            history: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Completed output of one tool invocation as reported by the engine.
pub struct ToolOutput {
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(content: Value) -> Self {
        Self {
            content,
            is_error: true,
        }
    }
}

/// Enumerates supported `EngineEvent` values.
///
/// The engine's wire taxonomy is third-party; [`EngineEvent::classify`] maps
/// raw tagged payloads into this closed set and skips kinds it does not know.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Token {
        text: String,
    },
    ToolArgsFragment {
        index: u64,
        name: Option<String>,
        fragment: Value,
    },
    ToolInvocationStart {
        name: String,
        args: Value,
    },
    ToolInvocationEnd {
        name: String,
        output: ToolOutput,
    },
    StreamEnd,
}

impl EngineEvent {
    /// Classifies a raw engine event payload keyed by its `type` field.
    ///
    /// Returns `None` for unknown kinds and for known kinds missing their
    /// required fields, so consumers stay forward-compatible with taxonomy
    /// growth.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde_json::json;
    /// use weft_engine::EngineEvent;
    ///
    /// let event = EngineEvent::classify(&json!({ "type": "token", "text": "Hi" }));
    /// assert_eq!(event, Some(EngineEvent::Token { text: "Hi".to_string() }));
    ///
    /// assert_eq!(EngineEvent::classify(&json!({ "type": "heartbeat" })), None);
    /// ```
    pub fn classify(payload: &Value) -> Option<EngineEvent> {
        match payload.get("type").and_then(Value::as_str)? {
            "token" => {
                let text = payload.get("text").and_then(Value::as_str)?;
                Some(EngineEvent::Token {
                    text: text.to_string(),
                })
            }
            "tool_args_fragment" => {
                let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0);
                let name = payload
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let fragment = payload.get("args_fragment")?.clone();
                Some(EngineEvent::ToolArgsFragment {
                    index,
                    name,
                    fragment,
                })
            }
            "tool_invocation_start" => {
                let name = payload.get("name").and_then(Value::as_str)?;
                let args = payload
                    .get("args")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                Some(EngineEvent::ToolInvocationStart {
                    name: name.to_string(),
                    args,
                })
            }
            "tool_invocation_end" => {
                let name = payload.get("name").and_then(Value::as_str)?;
                let content = payload.get("output").cloned().unwrap_or(Value::Null);
                let is_error = payload
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Some(EngineEvent::ToolInvocationEnd {
                    name: name.to_string(),
                    output: ToolOutput { content, is_error },
                })
            }
            "stream_end" => Some(EngineEvent::StreamEnd),
            _ => None,
        }
    }
}

/// Enumerates supported `EngineError` values.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine provider error: {message}")]
    Provider { message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("resource endpoint returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Rewrites a recognized authentication failure into a clearer diagnostic.
///
/// Unrecognized failure text passes through unchanged.
pub fn rewrite_engine_failure(message: &str) -> String {
    let lowered = message.to_ascii_lowercase();
    let auth_failure = lowered.contains("401")
        || lowered.contains("unauthorized")
        || lowered.contains("authentication")
        || lowered.contains("invalid api key")
        || lowered.contains("invalid_api_key");
    if auth_failure {
        format!(
            "Authentication with the agent engine failed ({message}). \
Check that the configured API key or server credentials are still valid."
        )
    } else {
        message.to_string()
    }
}

/// Pull-based iterator over one turn's engine events.
///
/// Implementations yield events strictly in arrival order, one at a time;
/// `None` marks the end of the stream.
#[async_trait]
pub trait EventStream: Send {
    async fn next(&mut self) -> Option<Result<EngineEvent, EngineError>>;
}

/// Trait contract for `AgentEngine` behavior.
///
/// The assembler treats the engine purely as an ordered event source plus a
/// reset operation for server-held conversation memory.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn stream(&self, request: TurnRequest) -> Result<Box<dyn EventStream>, EngineError>;

    async fn reset(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `EngineConfig` used across Weft components.
///
/// Equality drives the session's engine-handle cache: a changed config
/// invalidates the cached handle and forces a rebuild.
pub struct EngineConfig {
    pub provider: String,
    pub model: String,
    pub server_url: Option<String>,
    pub temperature: Option<f32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            server_url: None,
            temperature: None,
        }
    }
}

/// Builds engine handles from configuration.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn build(
        &self,
        config: &EngineConfig,
    ) -> Result<std::sync::Arc<dyn AgentEngine>, EngineError>;
}

/// Channel-backed [`EventStream`] for scripted engines and harnesses.
pub struct ChannelEventStream {
    receiver: mpsc::Receiver<Result<EngineEvent, EngineError>>,
}

impl ChannelEventStream {
    /// Creates a stream plus the sender half that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<EngineEvent, EngineError>>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, Self { receiver })
    }

    /// Wraps a pre-scripted event sequence.
    pub fn scripted(events: Vec<Result<EngineEvent, EngineError>>) -> Self {
        let (sender, stream) = Self::channel(events.len().max(1));
        for event in events {
            // Capacity covers the whole script, so try_send cannot fail here.
            let _ = sender.try_send(event);
        }
        stream
    }
}

#[async_trait]
impl EventStream for ChannelEventStream {
    async fn next(&mut self) -> Option<Result<EngineEvent, EngineError>> {
        self.receiver.recv().await
    }
}

/// Trait contract for `ResourceFetcher` behavior.
///
/// Optional collaborator used to enrich tool results that reference external
/// resources; absence disables enrichment.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Value, EngineError>;
}

/// HTTP-backed [`ResourceFetcher`] over the shared reqwest client.
pub struct HttpResourceFetcher {
    client: reqwest::Client,
}

impl HttpResourceFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpResourceFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceFetcher for HttpResourceFetcher {
    async fn fetch(&self, uri: &str) -> Result<Value, EngineError> {
        let response = self.client.get(uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.text().await?;
        match serde_json::from_str::<Value>(&body) {
            Ok(value) => Ok(value),
            Err(error) => {
                tracing::debug!(uri = %uri, error = %error, "resource body is not JSON; wrapping as text");
                Ok(serde_json::json!({
                    "type": "text",
                    "text": body,
                    "uri": uri,
                }))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Turn-completion record delivered to the telemetry sink.
pub struct TurnTelemetry {
    pub provider: String,
    pub model: String,
    pub tool_call_count: usize,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Fire-and-forget sink for turn-completion telemetry.
///
/// The contract is infallible by design: implementations log and swallow
/// their own failures rather than surfacing them to the caller.
pub trait TelemetrySink: Send + Sync {
    fn record_turn(&self, telemetry: TurnTelemetry);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ChannelEventStream, EngineEvent, EventStream, ToolOutput};

    #[test]
    fn unit_classify_maps_token_events() {
        let event = EngineEvent::classify(&json!({ "type": "token", "text": "Hel" }));
        assert_eq!(
            event,
            Some(EngineEvent::Token {
                text: "Hel".to_string()
            })
        );
    }

    #[test]
    fn unit_classify_maps_tool_args_fragment_with_optional_name() {
        let event = EngineEvent::classify(&json!({
            "type": "tool_args_fragment",
            "index": 2,
            "args_fragment": "{\"q\":\"ca",
        }));
        assert_eq!(
            event,
            Some(EngineEvent::ToolArgsFragment {
                index: 2,
                name: None,
                fragment: json!("{\"q\":\"ca"),
            })
        );
    }

    #[test]
    fn unit_classify_maps_invocation_end_error_flag() {
        let event = EngineEvent::classify(&json!({
            "type": "tool_invocation_end",
            "name": "search",
            "output": { "content": [] },
            "is_error": true,
        }));
        assert_eq!(
            event,
            Some(EngineEvent::ToolInvocationEnd {
                name: "search".to_string(),
                output: ToolOutput::error(json!({ "content": [] })),
            })
        );
    }

    #[test]
    fn unit_classify_skips_unknown_kinds_and_malformed_payloads() {
        assert_eq!(EngineEvent::classify(&json!({ "type": "heartbeat" })), None);
        assert_eq!(EngineEvent::classify(&json!({ "type": "token" })), None);
        assert_eq!(EngineEvent::classify(&json!({ "text": "no type tag" })), None);
    }

    #[test]
    fn unit_rewrite_engine_failure_targets_auth_patterns() {
        let rewritten = super::rewrite_engine_failure("provider returned 401 Unauthorized");
        assert!(rewritten.contains("Authentication with the agent engine failed"));
        assert!(rewritten.contains("401 Unauthorized"));

        let untouched = super::rewrite_engine_failure("connection reset by peer");
        assert_eq!(untouched, "connection reset by peer");
    }

    #[tokio::test]
    async fn functional_scripted_stream_preserves_event_order() {
        let mut stream = ChannelEventStream::scripted(vec![
            Ok(EngineEvent::Token {
                text: "a".to_string(),
            }),
            Ok(EngineEvent::StreamEnd),
        ]);

        assert_eq!(
            stream.next().await.map(Result::unwrap),
            Some(EngineEvent::Token {
                text: "a".to_string()
            })
        );
        assert_eq!(
            stream.next().await.map(Result::unwrap),
            Some(EngineEvent::StreamEnd)
        );
        assert!(stream.next().await.is_none());
    }
}
