//! sluice integration test harness.
//!
//! Every test runs producers and consumers in this process over loopback
//! TCP. Channels that should use the local path share one `MemoryPool`;
//! each test builds its own pool so tests cannot see each other's chunks.
//!
//!   cargo test --test integration

use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use sluice_channels::{InputChannel, InputEvent, OutputChannel};
use sluice_core::config::{InputConfig, OutputConfig, PoolConfig};
use sluice_core::{
    BufferSet, DataDistribution, DataToken, DistributionMode, MemoryLocation, MetaData, MinData,
    SlownessPolicy, Timestamp,
};
use sluice_pool::MemoryPool;

mod backpressure;
mod distribution;
mod end_of_stream;
mod memory;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(5);

pub fn pool() -> MemoryPool {
    MemoryPool::new(PoolConfig::default())
}

pub fn output_config(mode: DistributionMode, no_input_shared: SlownessPolicy) -> OutputConfig {
    OutputConfig {
        hostname: "127.0.0.1".to_string(),
        distribution_mode: mode,
        no_input_shared,
        ..OutputConfig::default()
    }
}

pub fn input_config(distribution: DataDistribution, on_slowness: SlownessPolicy) -> InputConfig {
    InputConfig {
        data_distribution: distribution,
        on_slowness,
        min_data: MinData::Count(1),
        ..InputConfig::default()
    }
}

pub async fn producer(pool: &MemoryPool, config: OutputConfig) -> Result<OutputChannel> {
    OutputChannel::bind("producer", config, pool.clone())
        .await
        .context("failed to bind output channel")
}

/// Connect a new input channel to `output` and wait until the producer has
/// registered it, so registration order is the call order.
pub async fn consumer(
    pool: &MemoryPool,
    id: &str,
    config: InputConfig,
    output: &OutputChannel,
    location: MemoryLocation,
) -> Result<InputChannel> {
    let before = registered(output).await;
    let input = InputChannel::new(id, config, pool.clone())?;
    let mut info = output.information();
    info.memory_location = location;
    input.connect(info).await?;
    wait_for_consumers(output, before + 1).await?;
    Ok(input)
}

pub async fn registered(output: &OutputChannel) -> usize {
    let s = output.consumers().await;
    s.shared.len() + s.copies.len()
}

pub async fn wait_for_consumers(output: &OutputChannel, n: usize) -> Result<()> {
    wait_until(|| async move { registered(output).await >= n })
        .await
        .with_context(|| format!("{n} consumers never registered"))
}

/// Poll `cond` until it holds or `PATIENCE` runs out.
pub async fn wait_until<F, Fut>(mut cond: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    bail!("condition not met within {PATIENCE:?}")
}

/// One token whose train id identifies the chunk it was sent in.
pub fn token(train_id: u64) -> DataToken {
    let mut buffers = BufferSet::new();
    buffers.push_borrowed(Bytes::from(train_id.to_le_bytes().repeat(16)));
    buffers.push_copy(b"trailer");
    DataToken::new(buffers, MetaData::new("detector", Timestamp::now(train_id)))
}

/// Write `train_ids` as one-token chunks.
pub async fn send(output: &OutputChannel, train_ids: impl IntoIterator<Item = u64>) -> Result<()> {
    for id in train_ids {
        output.write(token(id))?;
        output.update().await?;
    }
    Ok(())
}

pub async fn next_event(input: &InputChannel) -> Result<InputEvent> {
    tokio::time::timeout(PATIENCE, input.next_event())
        .await
        .context("timed out waiting for an input event")?
        .context("input channel closed")
}

/// Read `chunks` chunks, releasing each one, and return the train ids of
/// every token in arrival order.
pub async fn collect(input: InputChannel, chunks: usize) -> Result<(InputChannel, Vec<u64>)> {
    let mut ids = Vec::new();
    let mut seen = 0;
    while seen < chunks {
        match next_event(&input).await? {
            InputEvent::Data => {
                for i in 0..input.size()? {
                    ids.push(input.read(i)?.meta.timestamp.train_id);
                }
                input.update()?;
                seen += 1;
            }
            InputEvent::EndOfStream => bail!("end-of-stream after {seen} of {chunks} chunks"),
        }
    }
    Ok((input, ids))
}

/// Assert that nothing else shows up for a while.
pub async fn assert_quiet(input: &InputChannel) {
    let extra = tokio::time::timeout(Duration::from_millis(200), input.next_event()).await;
    assert!(extra.is_err(), "unexpected event {:?}", extra.ok().flatten());
}

/// Read and release chunks until end-of-stream; returns every train id.
pub async fn collect_until_end(input: InputChannel) -> Result<(InputChannel, Vec<u64>)> {
    let mut ids = Vec::new();
    loop {
        match next_event(&input).await? {
            InputEvent::Data => {
                for i in 0..input.size()? {
                    ids.push(input.read(i)?.meta.timestamp.train_id);
                }
                input.update()?;
            }
            InputEvent::EndOfStream => return Ok((input, ids)),
        }
    }
}
