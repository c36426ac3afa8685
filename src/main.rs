use std::io::BufRead;

use anyhow::Context;
use nexus_stream::{Record, Settings, Stream};
use tracing_subscriber::EnvFilter;

/// Usage: nexus-stream [settings.json] [records.jsonl]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let settings = match args.next() {
        Some(path) => Settings::from_file(&path).with_context(|| format!("loading settings from {}", path))?,
        None => Settings::default(),
    }
    .with_env_overrides();

    let stream = Stream::start(settings).context("starting stream")?;
    tracing::info!(id = stream.id(), "Nexus stream running");

    if let Some(path) = args.next() {
        let file = std::fs::File::open(&path).with_context(|| format!("opening {}", path))?;
        let mut submitted = 0usize;
        for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading {}", path))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line)
                .with_context(|| format!("{}:{}: not a record", path, lineno + 1))?;
            stream.submit(record).await?;
            submitted += 1;
        }
        tracing::info!(submitted, "records submitted");
    }

    let run = stream.finish_and_close(0).await?;
    tracing::info!(records = run.records_seen, "Nexus stream finished");
    Ok(())
}
