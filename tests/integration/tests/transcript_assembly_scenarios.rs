//! End-to-end assembly scenarios driven by raw engine event payloads, the
//! way a live engine delivers them: classified per event, unknown kinds
//! skipped, results post-processed after stream end.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::{json, Value};
use weft_engine::{
    AgentEngine, ChannelEventStream, EngineConfig, EngineError, EngineEvent, EngineFactory,
    EventStream, ResourceFetcher, TurnRequest,
};
use weft_transcript::{ChatSession, Part, Role, SessionConfig, ToolInvocationState, TurnOutcome};

/// Engine fed with raw JSON payloads; classification happens per event, so
/// unknown kinds drop out exactly as they would against a live engine.
struct RawScriptEngine {
    scripts: Mutex<VecDeque<Vec<Value>>>,
}

impl RawScriptEngine {
    fn new(scripts: Vec<Vec<Value>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::from(scripts)),
        })
    }
}

#[async_trait]
impl AgentEngine for RawScriptEngine {
    async fn stream(&self, _request: TurnRequest) -> Result<Box<dyn EventStream>, EngineError> {
        let script = match self.scripts.lock() {
            Ok(mut scripts) => scripts.pop_front().unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        let events = script
            .iter()
            .filter_map(EngineEvent::classify)
            .map(Ok)
            .collect::<Vec<_>>();
        Ok(Box::new(ChannelEventStream::scripted(events)))
    }

    async fn reset(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

struct RawScriptFactory {
    engine: Arc<RawScriptEngine>,
}

#[async_trait]
impl EngineFactory for RawScriptFactory {
    async fn build(&self, _config: &EngineConfig) -> Result<Arc<dyn AgentEngine>, EngineError> {
        Ok(Arc::clone(&self.engine) as Arc<dyn AgentEngine>)
    }
}

struct StaticFetcher {
    response: Value,
    requested: Mutex<Vec<String>>,
}

#[async_trait]
impl ResourceFetcher for StaticFetcher {
    async fn fetch(&self, uri: &str) -> Result<Value, EngineError> {
        if let Ok(mut requested) = self.requested.lock() {
            requested.push(uri.to_string());
        }
        Ok(self.response.clone())
    }
}

fn raw_session(scripts: Vec<Vec<Value>>) -> ChatSession {
    let engine = RawScriptEngine::new(scripts);
    let factory = Arc::new(RawScriptFactory { engine });
    ChatSession::new(factory as Arc<dyn EngineFactory>, SessionConfig::default())
}

fn assistant_parts(session: &ChatSession) -> Vec<Part> {
    session
        .transcript()
        .iter()
        .rev()
        .find(|message| message.role == Role::Assistant && message.parts.is_some())
        .and_then(|message| message.parts.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn functional_raw_event_script_assembles_full_turn() {
    let mut session = raw_session(vec![vec![
        json!({ "type": "token", "text": "Searching" }),
        json!({ "type": "heartbeat" }),
        json!({
            "type": "tool_args_fragment",
            "index": 0,
            "name": "search",
            "args_fragment": r#"{"q":"ca"#,
        }),
        json!({
            "type": "tool_args_fragment",
            "index": 0,
            "args_fragment": r#"t"}"#,
        }),
        json!({
            "type": "tool_invocation_start",
            "name": "search",
            "args": { "q": "cat" },
        }),
        json!({ "type": "usage", "input_tokens": 12 }),
        json!({
            "type": "tool_invocation_end",
            "name": "search",
            "output": r#"{"ok":true}"#,
        }),
        json!({ "type": "token", "text": " done." }),
        json!({ "type": "stream_end" }),
    ]]);

    let outcome = session
        .send("find cats", Vec::new())
        .await
        .unwrap_or_else(|error| panic!("send failed: {error}"));

    assert_eq!(outcome, TurnOutcome::Completed);
    let parts = assistant_parts(&session);
    assert_eq!(parts.len(), 3);
    assert!(matches!(&parts[0], Part::Text { text } if text == "Searching"));
    let Part::ToolInvocation {
        tool_name,
        args,
        partial_args,
        result,
        state,
    } = &parts[1]
    else {
        panic!("invocation part expected");
    };
    assert_eq!(tool_name, "search");
    assert_eq!(args, &json!({ "q": "cat" }));
    assert_eq!(partial_args, &Some(json!({ "q": "cat" })));
    // The serialized-string wrapper is unwrapped during post-processing.
    assert_eq!(result, &Some(json!({ "ok": true })));
    assert_eq!(*state, ToolInvocationState::Result);
    assert!(matches!(&parts[2], Part::Text { text } if text == " done."));
}

#[tokio::test]
async fn regression_unknown_event_kinds_do_not_disturb_assembly() {
    let base = vec![
        json!({ "type": "token", "text": "Hel" }),
        json!({ "type": "token", "text": "lo" }),
        json!({ "type": "stream_end" }),
    ];
    let mut noisy = vec![
        json!({ "type": "reasoning_delta", "text": "thinking" }),
        json!({ "kind": "untagged" }),
    ];
    noisy.splice(1..1, base.clone());

    let mut plain_session = raw_session(vec![base]);
    let mut noisy_session = raw_session(vec![noisy]);

    plain_session
        .send("hi", Vec::new())
        .await
        .unwrap_or_else(|error| panic!("send failed: {error}"));
    noisy_session
        .send("hi", Vec::new())
        .await
        .unwrap_or_else(|error| panic!("send failed: {error}"));

    assert_eq!(
        assistant_parts(&plain_session),
        assistant_parts(&noisy_session)
    );
    assert_eq!(noisy_session.transcript()[1].content, "Hello");
}

#[tokio::test]
async fn functional_resource_link_results_gain_fetched_content() {
    let mut session = raw_session(vec![vec![
        json!({
            "type": "tool_invocation_start",
            "name": "open_report",
            "args": { "id": 7 },
        }),
        json!({
            "type": "tool_invocation_end",
            "name": "open_report",
            "output": {
                "content": [
                    { "type": "text", "text": "summary" },
                    { "type": "resource_link", "uri": "resource://reports/7" },
                ]
            },
        }),
        json!({ "type": "stream_end" }),
    ]]);
    let fetcher = Arc::new(StaticFetcher {
        response: json!({
            "contents": [{ "type": "text", "text": "full report body" }]
        }),
        requested: Mutex::new(Vec::new()),
    });
    session.set_resource_fetcher(Some(Arc::clone(&fetcher) as Arc<dyn ResourceFetcher>));

    session
        .send("open report 7", Vec::new())
        .await
        .unwrap_or_else(|error| panic!("send failed: {error}"));

    let requested = fetcher
        .requested
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    assert_eq!(requested.as_slice(), ["resource://reports/7"]);

    let parts = assistant_parts(&session);
    let Part::ToolInvocation {
        result: Some(result),
        ..
    } = &parts[0]
    else {
        panic!("invocation part expected");
    };
    let items = result["content"]
        .as_array()
        .unwrap_or_else(|| panic!("content array expected"));
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["text"], "summary");
    assert_eq!(items[2]["text"], "full report body");
}

#[tokio::test]
async fn functional_interleaved_same_named_calls_resolve_in_arrival_order() {
    let mut session = raw_session(vec![vec![
        json!({
            "type": "tool_invocation_start",
            "name": "search",
            "args": { "q": "alpha" },
        }),
        json!({
            "type": "tool_invocation_start",
            "name": "search",
            "args": { "q": "beta" },
        }),
        json!({
            "type": "tool_invocation_end",
            "name": "search",
            "output": "alpha result",
        }),
        json!({
            "type": "tool_invocation_end",
            "name": "search",
            "output": "beta result",
            "is_error": true,
        }),
        json!({ "type": "stream_end" }),
    ]]);

    session
        .send("both searches", Vec::new())
        .await
        .unwrap_or_else(|error| panic!("send failed: {error}"));

    let parts = assistant_parts(&session);
    assert_eq!(parts.len(), 2);
    let Part::ToolInvocation {
        args,
        result,
        state,
        ..
    } = &parts[0]
    else {
        panic!("invocation part expected");
    };
    assert_eq!(args, &json!({ "q": "alpha" }));
    assert_eq!(result, &Some(json!("alpha result")));
    assert_eq!(*state, ToolInvocationState::Result);
    let Part::ToolInvocation { result, state, .. } = &parts[1] else {
        panic!("invocation part expected");
    };
    assert_eq!(result, &Some(json!("beta result")));
    assert_eq!(*state, ToolInvocationState::Error);
}
