//! Replays a JSONL script of raw engine events through the transcript
//! assembler and prints every published checkpoint.
//!
//! Each input line is one raw event payload, e.g.
//! `{"type":"token","text":"Hi"}`. Unknown kinds are skipped, matching the
//! live classification path.

use std::{collections::VecDeque, env, fs, path::PathBuf, process::ExitCode, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use weft_engine::{
    AgentEngine, ChannelEventStream, EngineConfig, EngineError, EngineEvent, EngineFactory,
    EventStream, TelemetrySink, TurnRequest, TurnTelemetry,
};
use weft_transcript::{ChatSession, SessionConfig, TranscriptSnapshot};

#[derive(Debug, Clone)]
struct CliArgs {
    input: PathBuf,
    prompt: String,
    interval_ms: u64,
}

impl CliArgs {
    fn parse() -> Result<Self, String> {
        let mut input: Option<PathBuf> = None;
        let mut prompt = "replay".to_string();
        let mut interval_ms = 80u64;

        let args = env::args().skip(1).collect::<Vec<_>>();
        let mut index = 0usize;
        while index < args.len() {
            match args[index].as_str() {
                "--input" => {
                    index += 1;
                    let value = args
                        .get(index)
                        .ok_or_else(|| "--input requires a path".to_string())?;
                    input = Some(PathBuf::from(value));
                }
                "--prompt" => {
                    index += 1;
                    let value = args
                        .get(index)
                        .ok_or_else(|| "--prompt requires a value".to_string())?;
                    prompt = value.clone();
                }
                "--interval-ms" => {
                    index += 1;
                    let value = args
                        .get(index)
                        .ok_or_else(|| "--interval-ms requires a value".to_string())?;
                    interval_ms = value
                        .parse::<u64>()
                        .map_err(|error| format!("invalid --interval-ms: {error}"))?;
                }
                other => return Err(format!("unknown argument: {other}")),
            }
            index += 1;
        }

        Ok(Self {
            input: input.ok_or_else(|| "--input <events.jsonl> is required".to_string())?,
            prompt,
            interval_ms,
        })
    }
}

struct ReplayEngine {
    events: std::sync::Mutex<VecDeque<EngineEvent>>,
}

#[async_trait]
impl AgentEngine for ReplayEngine {
    async fn stream(&self, _request: TurnRequest) -> Result<Box<dyn EventStream>, EngineError> {
        let events = match self.events.lock() {
            Ok(mut queue) => queue.drain(..).map(Ok).collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        Ok(Box::new(ChannelEventStream::scripted(events)))
    }

    async fn reset(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

struct ReplayFactory {
    engine: Arc<ReplayEngine>,
}

#[async_trait]
impl EngineFactory for ReplayFactory {
    async fn build(&self, _config: &EngineConfig) -> Result<Arc<dyn AgentEngine>, EngineError> {
        Ok(Arc::clone(&self.engine) as Arc<dyn AgentEngine>)
    }
}

struct LoggingTelemetry;

impl TelemetrySink for LoggingTelemetry {
    fn record_turn(&self, telemetry: TurnTelemetry) {
        tracing::info!(
            provider = %telemetry.provider,
            model = %telemetry.model,
            tool_calls = telemetry.tool_call_count,
            success = telemetry.success,
            duration_ms = telemetry.duration_ms,
            "turn finished"
        );
    }
}

fn load_events(path: &PathBuf) -> Result<VecDeque<EngineEvent>, String> {
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed to read {}: {error}", path.display()))?;
    let mut events = VecDeque::new();
    for (line_number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let payload = serde_json::from_str::<Value>(line)
            .map_err(|error| format!("line {}: invalid JSON: {error}", line_number + 1))?;
        match EngineEvent::classify(&payload) {
            Some(event) => events.push_back(event),
            None => tracing::debug!(line = line_number + 1, "skipped unknown event kind"),
        }
    }
    Ok(events)
}

fn print_snapshot(snapshot: TranscriptSnapshot) {
    let rendered = serde_json::json!({
        "is_streaming": snapshot.is_streaming,
        "messages": snapshot.messages,
    });
    println!(
        "{}",
        serde_json::to_string(&rendered).unwrap_or_else(|_| "{}".to_string())
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();

    let args = match CliArgs::parse() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("replay: {message}");
            eprintln!("usage: replay --input <events.jsonl> [--prompt <text>] [--interval-ms <n>]");
            return ExitCode::FAILURE;
        }
    };

    let events = match load_events(&args.input) {
        Ok(events) => events,
        Err(message) => {
            eprintln!("replay: {message}");
            return ExitCode::FAILURE;
        }
    };

    let engine = Arc::new(ReplayEngine {
        events: std::sync::Mutex::new(events),
    });
    let factory = Arc::new(ReplayFactory { engine });
    let mut session = ChatSession::new(
        factory as Arc<dyn EngineFactory>,
        SessionConfig {
            checkpoint_interval_ms: args.interval_ms,
            ..SessionConfig::default()
        },
    );
    session.set_snapshot_handler(Some(Arc::new(print_snapshot)));
    session.set_telemetry_sink(Some(Arc::new(LoggingTelemetry)));

    match session.send(args.prompt, Vec::new()).await {
        Ok(outcome) => {
            tracing::info!(?outcome, "replay complete");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("replay: {error}");
            ExitCode::FAILURE
        }
    }
}
