use anyhow::{Context, Result};
use live_topics_lib::init_logging;
use live_topics_lib::services::{
    parse_transcript, ConfigStore, EventSink, JsonLinesSink, LlmOracle, RetryPolicy,
    RetryingOracle, TopicOracle, TopicSession,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn parse_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || has_flag(&args, "--help") {
        eprintln!(
            "Usage:\n  cargo run --bin segment_transcript -- <transcript.txt> [--out <jsonl_path>] [--pace-ms <n>] [--chunk-secs <n>] [--model <name>] [--config-dir <dir>]\n\nNotes:\n  - Lines are \"<timestamp> <text>\"; bare lines are stamped every --chunk-secs (default 20).\n  - Events are written as JSON lines to stdout unless --out is given.\n  - The API key is read from OPENAI_API_KEY (or .env) or the config file."
        );
        return Ok(());
    }

    let _ = dotenvy::dotenv();
    init_logging();

    let path = args[1].clone();
    let out_path = parse_arg_value(&args, "--out");
    let pace_ms: u64 = parse_arg_value(&args, "--pace-ms")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let chunk_secs: u64 = parse_arg_value(&args, "--chunk-secs")
        .and_then(|s| s.parse().ok())
        .unwrap_or(20);

    let config_dir = parse_arg_value(&args, "--config-dir")
        .map(PathBuf::from)
        .or_else(ConfigStore::default_config_dir)
        .context("no config directory available")?;
    let config = ConfigStore::new(config_dir)
        .load()
        .map_err(anyhow::Error::msg)?;

    let mut llm = LlmOracle::from_config(&config).context("failed to build LLM oracle")?;
    if let Some(model) = parse_arg_value(&args, "--model") {
        llm = llm.with_model(model);
    }
    info!("[REPLAY] model={} file={}", llm.model(), path);
    let oracle: Arc<dyn TopicOracle> =
        Arc::new(RetryingOracle::new(llm, RetryPolicy::from(&config.oracle)));

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read transcript {}", path))?;
    let lines = parse_transcript(&content, chunk_secs);
    info!("[REPLAY] {} transcript lines", lines.len());

    let sink: Arc<dyn EventSink> = match &out_path {
        Some(out) => {
            let file = std::fs::File::create(out)
                .with_context(|| format!("failed to create {}", out))?;
            Arc::new(JsonLinesSink::new(file))
        }
        None => Arc::new(JsonLinesSink::new(std::io::stdout())),
    };

    let mut session = TopicSession::new(config.detection.clone(), oracle);
    session.start(sink).await?;

    for line in lines {
        session.submit(line.timestamp, line.text);
        if pace_ms > 0 {
            tokio::time::sleep(Duration::from_millis(pace_ms)).await;
        }
    }

    // Let both detectors catch up before the final flush
    session.wait_idle(Duration::from_millis(100)).await;
    session.stop().await?;

    if let Some(out) = out_path {
        eprintln!("Wrote events: {}", out);
    }
    Ok(())
}
