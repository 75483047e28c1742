use anyhow::Context;
use cohort_engine::{Engine, EngineConfig, Occasion};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Reads one JSON occasion per stdin line, feeds the engine, prints the current snapshot on EOF.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging/tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    tracing::info!("Cohort engine booting...");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("cohort_engine.json"));
    let config = EngineConfig::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?;

    let engine = Engine::start(config).await.context("starting engine")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Occasion>(&line) {
                    // Rejections are already logged by the engine.
                    Ok(occasion) => { let _ = engine.record_occasion(occasion).await; }
                    Err(e) => tracing::warn!("line {}: not an occasion: {}", line_no, e),
                }
            }
        }
    }

    engine.flush().await;
    let current = engine.get_current_snapshot().await;
    println!("{}", serde_json::to_string_pretty(&current)?);
    tracing::info!("stats: {:?}", engine.stats().await);

    engine.shutdown().await;
    Ok(())
}
