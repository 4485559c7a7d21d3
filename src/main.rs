//! Memorychain replay runner
//!
//! Feeds a JSONL transcript of chat events through the memory pipeline and
//! prints what the pipeline did for each event. Useful for tuning
//! thresholds against real conversations.
//!
//! Each input line looks like:
//! `{"scope": "group", "id": "42", "role": "user", "speaker": "alice", "text": "..."}`

use clap::Parser;
use memorychain::{
    HttpTextGenerator, InMemoryStore, MemoryChain, MemoryChainConfig, RequestContext, ScopeKind,
    SessionKey, Summarizer,
};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often idle sessions are swept when `idle_ttl_secs` is set
const IDLE_EVICTION_PERIOD: Duration = Duration::from_secs(30);

/// Replay a chat transcript through Memorychain
#[derive(Parser, Debug)]
#[command(name = "memorychain")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config.toml (default: <config dir>/memorychain/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transcript file in JSONL format; reads stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Override the compression threshold
    #[arg(long)]
    threshold: Option<usize>,

    /// Embedding provider ids the local store should offer
    #[arg(long, default_value = "local")]
    embedding_provider: Vec<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    User,
    Assistant,
}

#[derive(Debug, Deserialize)]
struct ChatEvent {
    scope: ScopeKind,
    id: String,
    role: Role,
    #[serde(default)]
    speaker: Option<String>,
    text: String,
}

#[derive(Debug, Serialize)]
struct ReplayLine {
    line: usize,
    session: String,
    #[serde(flatten)]
    result: serde_json::Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => MemoryChainConfig::default_path()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?,
    };
    let mut config = MemoryChainConfig::load(&config_path).await?;
    if let Some(threshold) = cli.threshold {
        config = config.with_compress_threshold(threshold);
    }

    let summarizer = match HttpTextGenerator::from_config(&config.generator) {
        Ok(generator) => Summarizer::new(Arc::new(generator)),
        Err(e) => {
            warn!("Text generator unavailable ({}); summaries will not be produced", e);
            Summarizer::unconfigured()
        }
    };
    let store = Arc::new(InMemoryStore::new().with_embedding_providers(cli.embedding_provider));
    let chain = Arc::new(MemoryChain::start(config, summarizer, store).await?);
    let eviction = chain.spawn_idle_eviction(IDLE_EVICTION_PERIOD);

    let reader: Box<dyn tokio::io::AsyncRead + Unpin> = match &cli.input {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(reader).lines();

    let mut line_no = 0;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: ChatEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                error!("Line {}: invalid event: {}", line_no, e);
                continue;
            }
        };

        let key = SessionKey {
            scope: event.scope,
            id: event.id,
        };
        let result = replay_event(&chain, &key, event.role, event.speaker, event.text).await;
        let out = ReplayLine {
            line: line_no,
            session: key.to_string(),
            result,
        };
        writeln!(std::io::stdout(), "{}", serde_json::to_string(&out)?)?;
    }

    if let Some(task) = eviction {
        task.abort();
    }
    chain.shutdown().await?;
    info!("Replayed {} lines", line_no);
    Ok(())
}

async fn replay_event(
    chain: &MemoryChain,
    key: &SessionKey,
    role: Role,
    speaker: Option<String>,
    text: String,
) -> serde_json::Value {
    match role {
        Role::User => {
            let speaker = speaker.unwrap_or_else(|| "user".to_string());
            let mut request = RequestContext::new("", text);
            let augmentation = chain.on_user_turn(key, &speaker, &mut request).await;
            serde_json::json!({
                "event": "user",
                "retrieved": augmentation.hits.len(),
                "system_prompt": request.system_prompt,
            })
        }
        Role::Assistant => match chain.on_assistant_turn(key, &text).await {
            Ok(outcome) => serde_json::json!({
                "event": "assistant",
                "outcome": format!("{:?}", outcome),
            }),
            Err(e) => serde_json::json!({
                "event": "assistant",
                "error": e.to_string(),
            }),
        },
    }
}
