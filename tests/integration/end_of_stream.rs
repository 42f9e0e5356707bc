use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  End-of-stream
// ══════════════════════════════════════════════════════════════════════════════

/// One input fed by two producers reports end-of-stream once, after both
/// producers finished and after all of their data.
#[tokio::test]
async fn test_end_of_stream_aggregates_producers() -> Result<()> {
    let pool = pool();
    let first = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;
    let second = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;

    let input = InputChannel::new("merger", input_config(DataDistribution::Copy, SlownessPolicy::Wait), pool.clone())?;
    input.connect(first.information()).await?;
    input.connect(second.information()).await?;
    wait_for_consumers(&first, 1).await?;
    wait_for_consumers(&second, 1).await?;
    assert_eq!(input.connection_count(), 2);

    send(&first, [1]).await?;
    first.signal_end_of_stream().await?;
    send(&second, [2]).await?;
    second.signal_end_of_stream().await?;

    let (input, mut ids) = collect_until_end(input).await?;
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);
    assert!(input.is_end_of_stream());
    assert_quiet(&input).await;
    Ok(())
}

/// Aggregation resets after each stream.
#[tokio::test]
async fn test_consecutive_streams() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Wait)).await?;
    let input = consumer(&pool, "repeat", input_config(DataDistribution::Shared, SlownessPolicy::Wait), &out, MemoryLocation::Remote).await?;

    let reader = tokio::spawn(async move {
        let (input, first) = collect_until_end(input).await?;
        let (_, second) = collect_until_end(input).await?;
        anyhow::Ok((first, second))
    });

    send(&out, 0..3).await?;
    out.signal_end_of_stream().await?;
    assert!(out.is_end_of_stream());
    send(&out, 3..5).await?;
    assert!(!out.is_end_of_stream());
    out.signal_end_of_stream().await?;

    let (first, second) = reader.await??;
    assert_eq!(first, vec![0, 1, 2]);
    assert_eq!(second, vec![3, 4]);
    Ok(())
}

/// End-of-stream is only sent once consumer queues have drained.
#[tokio::test]
async fn test_end_of_stream_after_queued_data() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;
    let input = consumer(&pool, "backlogged", input_config(DataDistribution::Copy, SlownessPolicy::Queue), &out, MemoryLocation::Remote).await?;

    send(&out, 0..8).await?;
    let (eos, received) = tokio::join!(out.signal_end_of_stream(), collect_until_end(input));
    eos?;
    assert_eq!(received?.1, (0..8).collect::<Vec<_>>());
    Ok(())
}

/// Pending data is flushed by `signal_end_of_stream` itself.
#[tokio::test]
async fn test_end_of_stream_flushes_current_chunk() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;
    let input = consumer(&pool, "tail", input_config(DataDistribution::Copy, SlownessPolicy::Wait), &out, MemoryLocation::Local).await?;

    out.write(token(41))?;
    out.write(token(42))?;
    out.signal_end_of_stream().await?;

    let (_, ids) = collect_until_end(input).await?;
    assert_eq!(ids, vec![41, 42]);
    Ok(())
}
