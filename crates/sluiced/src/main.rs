//! sluiced: run one end of a sluice pipeline.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;

use sluice_channels::{InputChannel, InputEvent, OutputChannel};
use sluice_core::config::{ConnectionInfo, SluiceConfig};
use sluice_core::{BufferSet, DataToken, MemoryLocation, MetaData, Timestamp};
use sluice_pool::MemoryPool;

const DEFAULT_CHUNKS: u64 = 10;
const DEFAULT_TOKENS: u64 = 4;
const TOKEN_BYTES: usize = 64 * 1024;

/// Time given to writer tasks to flush end-of-stream before exiting.
const LINGER: Duration = Duration::from_secs(1);

// ── Producer ──────────────────────────────────────────────────────────────────

fn synthetic_token(train_id: u64, index: u64) -> DataToken {
    let mut buffers = BufferSet::new();
    buffers.push_borrowed(Bytes::from(vec![(index % 251) as u8; TOKEN_BYTES]));
    DataToken::new(buffers, MetaData::new("sluiced/synthetic", Timestamp::now(train_id)))
}

async fn stream_chunks(output: &OutputChannel, chunks: u64, tokens: u64) -> Result<()> {
    for train_id in 0..chunks {
        for index in 0..tokens {
            output.write(synthetic_token(train_id, index))?;
        }
        output
            .update()
            .await
            .with_context(|| format!("failed to distribute chunk {train_id}"))?;
        tracing::info!(train_id, tokens, "chunk sent");
    }
    output.signal_end_of_stream().await?;
    tracing::info!(chunks, "end-of-stream signalled");
    Ok(())
}

async fn cmd_produce(config: SluiceConfig, chunks: u64, tokens: u64) -> Result<()> {
    let pool = MemoryPool::global();
    let output = OutputChannel::bind("sluiced", config.output, pool)
        .await
        .context("failed to bind output channel")?;
    println!("{}", serde_json::to_string(&output.information())?);

    tracing::info!("waiting for a consumer");
    let mut ready = output.subscribe_ready();
    ready.changed().await?;

    stream_chunks(&output, chunks, tokens).await?;
    tokio::time::sleep(LINGER).await;
    Ok(())
}

// ── Consumer ──────────────────────────────────────────────────────────────────

async fn drain(input: &InputChannel) -> Result<u64> {
    let mut received = 0;
    while let Some(event) = input.next_event().await {
        match event {
            InputEvent::Data => {
                let size = input.size()?;
                let mut bytes = 0;
                for i in 0..size {
                    bytes += input.read(i)?.buffers.byte_len();
                }
                let first = input.read(0)?;
                tracing::info!(
                    tokens = size,
                    bytes,
                    source = %first.meta.source,
                    train_id = first.meta.timestamp.train_id,
                    "chunk received"
                );
                received += 1;
                input.update()?;
            }
            InputEvent::EndOfStream => {
                tracing::info!(received, "end-of-stream");
                break;
            }
        }
    }
    Ok(received)
}

fn parse_endpoint(addr: &str, location: Option<&str>) -> Result<ConnectionInfo> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("expected host:port, got {addr:?}"))?;
    let port = port.parse().context("port must be a number")?;
    let location: MemoryLocation = location.unwrap_or("remote").parse()?;
    Ok(ConnectionInfo::tcp(host, port, location))
}

async fn cmd_consume(config: SluiceConfig, target: Option<ConnectionInfo>) -> Result<()> {
    let mut endpoints: Vec<ConnectionInfo> = config
        .resolve_connected()?
        .into_iter()
        .map(|(_, info)| info)
        .collect();
    endpoints.extend(target);
    anyhow::ensure!(!endpoints.is_empty(), "no output channel to connect to");

    let instance_id = format!("sluiced-{}", std::process::id());
    let input = InputChannel::new(instance_id, config.input, MemoryPool::global())?;
    for info in endpoints {
        input
            .connect(info.clone())
            .await
            .with_context(|| format!("failed to connect to {}", info.addr()))?;
    }
    drain(&input).await?;
    Ok(())
}

// ── Demo ──────────────────────────────────────────────────────────────────────

/// Producer and a local consumer in one process, sharing the global pool.
async fn cmd_demo(mut config: SluiceConfig, chunks: u64, tokens: u64) -> Result<()> {
    config.output.hostname = "127.0.0.1".to_string();
    let output = OutputChannel::bind("sluiced-demo-out", config.output, MemoryPool::global()).await?;
    let input = InputChannel::new("sluiced-demo-in", config.input, MemoryPool::global())?;

    let mut info = output.information();
    info.memory_location = MemoryLocation::Local;
    let mut ready = output.subscribe_ready();
    input.connect(info).await?;
    ready.changed().await?;

    let (sent, received) = tokio::join!(stream_chunks(&output, chunks, tokens), drain(&input));
    sent?;
    let received = received?;
    tracing::info!(received, pool = ?MemoryPool::global().stats(), "demo finished");
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  sluiced produce [chunks] [tokens-per-chunk]");
    eprintln!("  sluiced consume [host:port] [local|remote]");
    eprintln!("  sluiced demo [chunks] [tokens-per-chunk]");
}

fn count(arg: Option<&&str>, default: u64) -> Result<u64> {
    arg.map(|s| s.parse().context("counts must be numbers"))
        .transpose()
        .map(|n| n.unwrap_or(default))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = SluiceConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SluiceConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SluiceConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["produce", rest @ ..] if rest.len() <= 2 => {
            cmd_produce(config, count(rest.first(), DEFAULT_CHUNKS)?, count(rest.get(1), DEFAULT_TOKENS)?).await
        }
        ["consume"] => cmd_consume(config, None).await,
        ["consume", addr] => cmd_consume(config, Some(parse_endpoint(addr, None)?)).await,
        ["consume", addr, location] => cmd_consume(config, Some(parse_endpoint(addr, Some(*location))?)).await,
        ["demo", rest @ ..] if rest.len() <= 2 => {
            cmd_demo(config, count(rest.first(), DEFAULT_CHUNKS)?, count(rest.get(1), DEFAULT_TOKENS)?).await
        }
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
