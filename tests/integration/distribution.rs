use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Shared and copy distribution
// ══════════════════════════════════════════════════════════════════════════════

/// Three shared consumers under round-robin receive chunks in rotation,
/// in registration order.
#[tokio::test]
async fn test_round_robin_rotation() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::RoundRobin, SlownessPolicy::Wait)).await?;

    let mut tasks = Vec::new();
    for name in ["rr-a", "rr-b", "rr-c"] {
        let config = input_config(DataDistribution::Shared, SlownessPolicy::Wait);
        let input = consumer(&pool, name, config, &out, MemoryLocation::Remote).await?;
        tasks.push(tokio::spawn(collect(input, 3)));
    }

    send(&out, 0..9).await?;

    let mut got = Vec::new();
    for task in tasks {
        let (_, ids) = task.await??;
        got.push(ids);
    }
    assert_eq!(got, vec![vec![0, 3, 6], vec![1, 4, 7], vec![2, 5, 8]]);
    Ok(())
}

/// Load-balanced shared consumers split the stream without duplicates.
#[tokio::test]
async fn test_load_balanced_partition() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Wait)).await?;

    let a = consumer(&pool, "lb-a", input_config(DataDistribution::Shared, SlownessPolicy::Wait), &out, MemoryLocation::Remote).await?;
    let b = consumer(&pool, "lb-b", input_config(DataDistribution::Shared, SlownessPolicy::Wait), &out, MemoryLocation::Local).await?;

    let a = tokio::spawn(collect_until_end(a));
    let b = tokio::spawn(collect_until_end(b));

    send(&out, 0..20).await?;
    out.signal_end_of_stream().await?;

    let mut all = a.await??.1;
    all.extend(b.await??.1);
    all.sort_unstable();
    assert_eq!(all, (0..20).collect::<Vec<_>>());
    Ok(())
}

/// Every copy consumer sees every chunk, in creation order.
#[tokio::test]
async fn test_copy_fan_out() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::LoadBalanced, SlownessPolicy::Drop)).await?;

    let mut tasks = Vec::new();
    for (name, location) in [
        ("copy-a", MemoryLocation::Remote),
        ("copy-b", MemoryLocation::Local),
        ("copy-c", MemoryLocation::Remote),
    ] {
        let config = input_config(DataDistribution::Copy, SlownessPolicy::Wait);
        let input = consumer(&pool, name, config, &out, location).await?;
        tasks.push(tokio::spawn(collect(input, 9)));
    }

    send(&out, 0..9).await?;

    for task in tasks {
        let (_, ids) = task.await??;
        assert_eq!(ids, (0..9).collect::<Vec<_>>());
    }
    Ok(())
}

/// Shared and copy consumers side by side: the copy consumer sees all,
/// the shared one sees its share.
#[tokio::test]
async fn test_shared_and_copy_together() -> Result<()> {
    let pool = pool();
    let out = producer(&pool, output_config(DistributionMode::RoundRobin, SlownessPolicy::Wait)).await?;

    let shared = consumer(&pool, "mixed-shared", input_config(DataDistribution::Shared, SlownessPolicy::Wait), &out, MemoryLocation::Remote).await?;
    let copy = consumer(&pool, "mixed-copy", input_config(DataDistribution::Copy, SlownessPolicy::Wait), &out, MemoryLocation::Remote).await?;
    let shared = tokio::spawn(collect(shared, 4));
    let copy = tokio::spawn(collect(copy, 4));

    send(&out, 10..14).await?;

    let (_shared, shared_ids) = shared.await??;
    let (_copy, copy_ids) = copy.await??;
    assert_eq!(shared_ids, vec![10, 11, 12, 13]);
    assert_eq!(copy_ids, vec![10, 11, 12, 13]);

    let snapshot = out.consumers().await;
    assert_eq!(snapshot.shared[0].instance_id, "mixed-shared");
    assert_eq!(snapshot.copies[0].instance_id, "mixed-copy");
    Ok(())
}
