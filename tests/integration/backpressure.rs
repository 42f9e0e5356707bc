use sluice_channels::ChannelError;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Slowness policies
// ══════════════════════════════════════════════════════════════════════════════

/// Chunks written before anyone connects are parked under `queue` and go,
/// in order, to the first shared consumer.
#[tokio::test]
async fn test_queue_before_first_consumer() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Queue)).await?;

    send(&out, 0..5).await?;
    assert_eq!(out.consumers().await.backlog, 5);

    let input = consumer(&pool, "late", input_config(DataDistribution::Shared, SlownessPolicy::Wait), &out, MemoryLocation::Remote).await?;
    let (_, ids) = collect(input, 5).await?;
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    assert_eq!(out.consumers().await.backlog, 0);
    Ok(())
}

/// Under `drop` with nobody connected the pool never grows, and a consumer
/// connecting later only sees what was written after it joined.
#[tokio::test]
async fn test_drop_without_consumers_is_bounded() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;

    send(&out, 0..100).await?;
    let stats = pool.stats();
    assert_eq!(stats.chunks_in_use, 1, "only the chunk being filled");
    assert_eq!(stats.tokens, 0);

    let input = consumer(&pool, "joiner", input_config(DataDistribution::Copy, SlownessPolicy::Drop), &out, MemoryLocation::Remote).await?;
    send(&out, 100..101).await?;
    let (input, ids) = collect(input, 1).await?;
    assert_eq!(ids, vec![100]);
    assert_quiet(&input).await;
    Ok(())
}

/// `wait` holds the producer until the consumer asks for more.
#[tokio::test]
async fn test_wait_blocks_producer() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;
    let input = consumer(&pool, "slow", input_config(DataDistribution::Copy, SlownessPolicy::Wait), &out, MemoryLocation::Remote).await?;

    // Fills both buffers of the consumer.
    send(&out, 0..2).await?;

    let third = send(&out, 2..3);
    tokio::pin!(third);
    let blocked = tokio::time::timeout(Duration::from_millis(200), &mut third).await;
    assert!(blocked.is_err(), "producer should wait for the consumer");

    let (sent, received) = tokio::join!(third, collect(input, 3));
    sent?;
    assert_eq!(received?.1, vec![0, 1, 2]);
    Ok(())
}

/// `queue` parks chunks per consumer and flushes them in order.
#[tokio::test]
async fn test_copy_queue_preserves_order() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;
    let input = consumer(&pool, "queued", input_config(DataDistribution::Copy, SlownessPolicy::Queue), &out, MemoryLocation::Local).await?;

    send(&out, 0..6).await?;
    assert!(out.consumers().await.copies[0].queued > 0);

    let (_input, ids) = collect(input, 6).await?;
    assert_eq!(ids, (0..6).collect::<Vec<_>>());
    assert_eq!(out.consumers().await.copies[0].queued, 0);
    Ok(())
}

/// `throw` on a copy consumer fails the update when that consumer is late.
#[tokio::test]
async fn test_throw_when_copy_consumer_is_late() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;
    let _input = consumer(&pool, "strict", input_config(DataDistribution::Copy, SlownessPolicy::Throw), &out, MemoryLocation::Remote).await?;

    send(&out, 0..1).await?;
    let output = &out;
    wait_until(|| async move { output.consumers().await.copies[0].ready }).await?;
    send(&out, 1..2).await?;

    // Both buffers are now full and nobody reads them.
    tokio::time::sleep(Duration::from_millis(100)).await;
    out.write(token(2))?;
    match out.update().await {
        Err(ChannelError::CopyInputNotReady(id)) => assert_eq!(id, "strict"),
        other => panic!("expected CopyInputNotReady, got {other:?}"),
    }
    Ok(())
}

/// With `min_data` above one, a slow owner still sees every chunk: a
/// partly filled buffer is never promoted behind its back.
#[tokio::test]
async fn test_min_data_with_slow_owner() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;
    let config = InputConfig {
        min_data: MinData::Count(2),
        ..input_config(DataDistribution::Copy, SlownessPolicy::Wait)
    };
    let input = consumer(&pool, "batched", config, &out, MemoryLocation::Remote).await?;

    let owner = tokio::spawn(async move {
        let mut ids = Vec::new();
        loop {
            match next_event(&input).await? {
                InputEvent::Data => {
                    for i in 0..input.size()? {
                        ids.push(input.read(i)?.meta.timestamp.train_id);
                    }
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    input.update()?;
                }
                InputEvent::EndOfStream => return Ok::<_, anyhow::Error>(ids),
            }
        }
    });

    send(&out, 0..9).await?;
    out.signal_end_of_stream().await?;
    let ids = owner.await??;
    assert_eq!(ids, (0..9).collect::<Vec<_>>());
    Ok(())
}
