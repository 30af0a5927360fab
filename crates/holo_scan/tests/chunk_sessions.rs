//! Chunked batch sessions: bounded fan-out, resource exclusivity, speculative
//! races, time slicing, location backoff and checkpoints.

mod common;

use std::time::Duration;

use anyhow::{Context, Result};
use holo_scan::{
    Authorizations, InjectedFailure, KeyRange, MemoryStore, ScanConfig, ScanOptions, ScanStrategy,
};

use common::{
    assert_exactly_once, drain, lettered_rows, orchestrator, take, test_config, wait_until,
};

fn split_rows() -> Vec<String> {
    ('b'..='z').map(|letter| letter.to_string()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_stays_within_worker_and_pool_bounds() -> Result<()> {
    let entries = lettered_rows('a'..='z', 20);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .tablets("t", split_rows(), ["ts-1", "ts-2", "ts-3"])
        .page_size(5)
        .latency(Duration::from_millis(1))
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            thread_count: 2,
            range_multiplier: 1,
            queue_multiplier: 2,
            max_results: 16,
            ..test_config()
        },
    )?;
    let locator = store.locator("t")?;
    let session = orchestrator.new_tablet_session(
        &locator,
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
        1,
    )?;

    let received = drain(&session).await?;
    assert_exactly_once(&received, &entries);

    let stats = session.get_statistics().context("statistics enabled")?;
    assert!(stats.peak_in_flight <= 2, "peak in flight {}", stats.peak_in_flight);
    assert_eq!(stats.chunks_completed, 26);
    let gauges = store.gauges();
    assert!(gauges.peak_active_scans <= 2, "peak active {}", gauges.peak_active_scans);
    assert_eq!(gauges.exclusivity_violations, 0);
    let pool = orchestrator.pools().pools();
    assert_eq!(pool.len(), 1);
    assert!(pool[0].snapshot().created <= 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn speculative_scans_keep_the_faster_strategy() -> Result<()> {
    let entries = lettered_rows('a'..='h', 12);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .tablets("t", ["c", "e", "g"], ["ts-1", "ts-2"])
        .page_size(4)
        .strategy_latency(ScanStrategy::Sequential, Duration::from_millis(30))
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            thread_count: 2,
            pool_capacity: Some(4),
            speculative_scanning: true,
            ..test_config()
        },
    )?;
    let locator = store.locator("t")?;
    let session = orchestrator.new_tablet_session(
        &locator,
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
        4,
    )?;

    let received = drain(&session).await?;
    assert_exactly_once(&received, &entries);

    let stats = session.get_statistics().context("statistics enabled")?;
    assert_eq!(stats.speculative_wins(), 4);
    assert!(stats.speculative_batch_wins > 0);
    assert_eq!(store.gauges().exclusivity_violations, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losing_strategy_releases_its_resource_before_delivery() -> Result<()> {
    let entries = lettered_rows('a'..='c', 20);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .page_size(5)
        .strategy_latency(ScanStrategy::Sequential, Duration::from_millis(20))
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            thread_count: 1,
            pool_capacity: Some(2),
            speculative_scanning: true,
            max_results: 2,
            ..test_config()
        },
    )?;
    let locator = store.locator("t")?;
    let session = orchestrator.new_tablet_session(
        &locator,
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
        1,
    )?;

    // The winner is now blocked on the full queue.
    let mut received = take(&session, 1).await?;
    wait_until("both strategies to give back their resources", || {
        store.gauges().active_scans == 0
            && orchestrator
                .pools()
                .pools()
                .iter()
                .all(|pool| pool.snapshot().leased == 0)
    })
    .await?;
    assert!(session.queue_len() <= 2);

    received.extend(drain(&session).await?);
    assert_exactly_once(&received, &entries);
    let stats = session.get_statistics().context("statistics enabled")?;
    assert_eq!(stats.speculative_batch_wins, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn speculative_race_on_a_full_pool_retries_transient_failures() -> Result<()> {
    let entries = lettered_rows('a'..='b', 10);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .tablets("t", ["b"], ["ts-1", "ts-2"])
        .latency(Duration::from_millis(10))
        .fail_seek(2, InjectedFailure::Transient)
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            thread_count: 2,
            pool_capacity: Some(1),
            speculative_scanning: true,
            acquire_timeout: Duration::from_millis(20),
            ..test_config()
        },
    )?;
    let locator = store.locator("t")?;
    let session = orchestrator.new_tablet_session(
        &locator,
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
        1,
    )?;

    let received = drain(&session).await?;
    assert_exactly_once(&received, &entries);
    let stats = session.get_statistics().context("statistics enabled")?;
    assert_eq!(stats.chunks_completed, 2);
    assert_eq!(stats.speculative_wins(), 2);
    assert_eq!(store.gauges().exclusivity_violations, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn time_budget_slices_chunks_without_losing_results() -> Result<()> {
    let entries = lettered_rows('a'..='b', 30);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .page_size(2)
        .latency(Duration::from_millis(5))
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            thread_count: 1,
            scan_limit: Some(Duration::from_millis(30)),
            ..test_config()
        },
    )?;
    let locator = store.locator("t")?;
    let session = orchestrator.new_tablet_session(
        &locator,
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
        1,
    )?;

    let received = drain(&session).await?;
    assert_exactly_once(&received, &entries);

    let stats = session.get_statistics().context("statistics enabled")?;
    assert!(stats.time_slices > 0);
    assert!(stats.resubmissions >= stats.time_slices);
    assert_eq!(stats.chunks_completed, 1);
    let local = stats.by_location.get("local").context("local location stats")?;
    assert_eq!(local.time_sliced, stats.time_slices);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backoff_still_finishes_every_location() -> Result<()> {
    let entries = lettered_rows('a'..='p', 10);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .tablets("t", ["e", "i", "m"], ["ts-1", "ts-2"])
        .page_size(2)
        .latency(Duration::from_millis(3))
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            thread_count: 2,
            backoff_enabled: true,
            scan_limit: Some(Duration::from_millis(15)),
            ..test_config()
        },
    )?;
    let locator = store.locator("t")?;
    let session = orchestrator.new_tablet_session(
        &locator,
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
        1,
    )?;

    let received = drain(&session).await?;
    assert_exactly_once(&received, &entries);

    let stats = session.get_statistics().context("statistics enabled")?;
    assert_eq!(stats.chunks_completed, 4);
    let ts1 = stats.by_location.get("ts-1").context("ts-1 stats")?;
    let ts2 = stats.by_location.get("ts-2").context("ts-2 stats")?;
    assert_eq!(ts1.completed, 2);
    assert_eq!(ts2.completed, 2);
    assert!(stats.time_slices > 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_chunk_failures_are_resubmitted() -> Result<()> {
    let entries = lettered_rows('a'..='f', 10);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .tablets("t", ["c", "e"], ["ts-1"])
        .fail_seeks(1, 2, InjectedFailure::Transient)
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            thread_count: 2,
            ..test_config()
        },
    )?;
    let locator = store.locator("t")?;
    let session = orchestrator.new_tablet_session(
        &locator,
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
        3,
    )?;

    let received = drain(&session).await?;
    assert_exactly_once(&received, &entries);
    let stats = session.get_statistics().context("statistics enabled")?;
    assert_eq!(stats.retries, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_open_failures_resubmit_the_chunk() -> Result<()> {
    let entries = lettered_rows('a'..='d', 10);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .tablets("t", ["c"], ["ts-1", "ts-2"])
        .fail_open(1, InjectedFailure::Transient)
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            thread_count: 2,
            ..test_config()
        },
    )?;
    let locator = store.locator("t")?;
    let session = orchestrator.new_tablet_session(
        &locator,
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
        1,
    )?;

    let received = drain(&session).await?;
    assert_exactly_once(&received, &entries);
    let stats = session.get_statistics().context("statistics enabled")?;
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.chunks_completed, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_checkpoint_covers_unpulled_batches() -> Result<()> {
    let entries = lettered_rows('a'..='z', 8);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .tablets("t", split_rows(), ["ts-1", "ts-2"])
        .page_size(3)
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            thread_count: 2,
            range_multiplier: 1,
            queue_multiplier: 1,
            max_results: 4,
            ..test_config()
        },
    )?;
    let locator = store.locator("t")?;
    let ranges = (b'a'..=b'z')
        .map(|letter| KeyRange::row_span([letter], [letter + 1]))
        .collect::<Result<Vec<_>, _>>()?;
    let session = orchestrator.new_tablet_session(
        &locator,
        Authorizations::empty(),
        ranges,
        ScanOptions::default(),
        1,
    )?;

    let mut received = take(&session, 10).await?;
    let checkpoint = session.checkpoint().await?;
    assert!(!checkpoint.is_complete());
    assert!(checkpoint.ranges.is_empty());
    received.extend(drain(&session).await?);

    let resumed = orchestrator.resume_session(checkpoint)?;
    received.extend(drain(&resumed).await?);
    assert_exactly_once(&received, &entries);
    Ok(())
}
