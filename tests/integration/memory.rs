use std::sync::Arc;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Local and remote memory paths
// ══════════════════════════════════════════════════════════════════════════════

async fn collect_tokens(input: InputChannel, chunks: usize) -> Result<Vec<Arc<DataToken>>> {
    let mut tokens = Vec::new();
    for _ in 0..chunks {
        match next_event(&input).await? {
            InputEvent::Data => {
                for i in 0..input.size()? {
                    tokens.push(input.read(i)?);
                }
                input.update()?;
            }
            InputEvent::EndOfStream => bail!("stream ended early"),
        }
    }
    Ok(tokens)
}

/// A local consumer (shared pool reference) and a remote consumer
/// (serialized payload) end up with identical tokens.
#[tokio::test]
async fn test_local_and_remote_agree() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;
    let local = consumer(&pool, "near", input_config(DataDistribution::Copy, SlownessPolicy::Wait), &out, MemoryLocation::Local).await?;
    let remote = consumer(&pool, "far", input_config(DataDistribution::Copy, SlownessPolicy::Wait), &out, MemoryLocation::Remote).await?;
    let local = tokio::spawn(collect_tokens(local, 4));
    let remote = tokio::spawn(collect_tokens(remote, 4));

    for chunk in 0..4u64 {
        for n in 0..3 {
            out.write(token(chunk * 10 + n))?;
        }
        out.update().await?;
    }

    let local = local.await??;
    let remote = remote.await??;
    assert_eq!(local.len(), 12);
    assert_eq!(local, remote);
    for token in local.iter().chain(&remote) {
        assert!(token.buffers.segments().iter().all(|s| s.is_copy()));
    }
    Ok(())
}

/// Data arriving in the inactive buffer never disturbs the one the owner
/// is reading.
#[tokio::test]
async fn test_double_buffer_isolation() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;
    let input = consumer(&pool, "reader", input_config(DataDistribution::Copy, SlownessPolicy::Wait), &out, MemoryLocation::Local).await?;

    send(&out, [1]).await?;
    assert_eq!(next_event(&input).await?, InputEvent::Data);
    let before = input.read(0)?;

    send(&out, [2]).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(input.size()?, 1);
    assert_eq!(input.read(0)?, before);
    assert_eq!(before.meta.timestamp.train_id, 1);

    input.update()?;
    assert_eq!(next_event(&input).await?, InputEvent::Data);
    assert_eq!(input.read(0)?.meta.timestamp.train_id, 2);
    Ok(())
}

/// Every pool slot comes back once both ends are gone.
#[tokio::test]
async fn test_pool_released_after_teardown() -> Result<()> {
    let pool = pool();
    {
        let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Wait)).await?;
        let local = consumer(&pool, "near", input_config(DataDistribution::Shared, SlownessPolicy::Wait), &out, MemoryLocation::Local).await?;
        let remote = consumer(&pool, "far", input_config(DataDistribution::Shared, SlownessPolicy::Wait), &out, MemoryLocation::Remote).await?;
        let local = tokio::spawn(collect_until_end(local));
        let remote = tokio::spawn(collect_until_end(remote));

        send(&out, 0..10).await?;
        out.signal_end_of_stream().await?;
        let (_, a) = local.await??;
        let (_, b) = remote.await??;
        assert_eq!(a.len() + b.len(), 10);
    }
    let shared_pool = &pool;
    wait_until(|| async move {
        let stats = shared_pool.stats();
        stats.channels_in_use == 0 && stats.chunks_in_use == 0
    })
    .await
    .with_context(|| format!("pool still busy: {:?}", pool.stats()))?;
    assert_eq!(pool.stats().serialized_cached, 0);
    Ok(())
}

async fn wait_for_empty(pool: &MemoryPool) -> Result<()> {
    wait_until(|| async move {
        let stats = pool.stats();
        stats.channels_in_use == 0 && stats.chunks_in_use == 0
    })
    .await
    .with_context(|| format!("pool still busy: {:?}", pool.stats()))
}

/// A consumer that claims to be local but lives on another pool is served
/// payloads, and neither pool keeps anything afterwards.
#[tokio::test]
async fn test_local_consumer_on_another_pool_gets_payloads() -> Result<()> {
    let producer_pool = pool();
    let consumer_pool = pool();
    {
        let out = producer(&producer_pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;
        let input = consumer(&consumer_pool, "elsewhere", input_config(DataDistribution::Copy, SlownessPolicy::Wait), &out, MemoryLocation::Local).await?;
        assert_eq!(out.consumers().await.copies[0].memory_location, MemoryLocation::Remote);
        let input = tokio::spawn(collect_until_end(input));

        send(&out, 0..5).await?;
        out.signal_end_of_stream().await?;
        let (_, ids) = input.await??;
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }
    wait_for_empty(&producer_pool).await?;
    wait_for_empty(&consumer_pool).await?;
    Ok(())
}

/// Chunks a local consumer was handed but never finished are released when
/// it goes away.
#[tokio::test]
async fn test_unfinished_local_chunks_released_on_teardown() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;
    let input = consumer(&pool, "idle", input_config(DataDistribution::Copy, SlownessPolicy::Drop), &out, MemoryLocation::Local).await?;

    send(&out, 0..2).await?;
    assert_eq!(next_event(&input).await?, InputEvent::Data);
    drop(input);
    let output = &out;
    wait_until(|| async move { registered(output).await == 0 }).await?;
    drop(out);
    wait_for_empty(&pool).await?;
    assert_eq!(pool.stats().tokens, 0);
    Ok(())
}
