//! Sequential scanner sessions against the in-memory store: ordering,
//! backpressure, cancellation, failure propagation and checkpoints.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use holo_scan::{
    Authorizations, InjectedFailure, KeyRange, MemoryStore, ScanConfig, ScanError, ScanOptions,
    SessionCheckpoint, SessionState,
};

use common::{
    assert_exactly_once, cell, drain, numbered_rows, orchestrator, take, test_config, wait_until,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ranges_are_scanned_in_start_key_order() -> Result<()> {
    let store = MemoryStore::builder()
        .table(
            "t",
            vec![
                cell("d", "f", "1", "d1"),
                cell("a", "f", "2", "a2"),
                cell("b", "f", "1", "b1"),
                cell("e", "f", "1", "e1"),
                cell("a", "f", "1", "a1"),
                cell("c", "f", "1", "c1"),
            ],
        )
        .page_size(1)
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            max_results: 2,
            ..test_config()
        },
    )?;

    let ranges = vec![KeyRange::row_span("c", "e")?, KeyRange::row_span("a", "c")?];
    let session = orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        ranges,
        ScanOptions::default(),
    )?;
    let values = drain(&session)
        .await?
        .into_iter()
        .map(|entry| String::from_utf8(entry.value).context("utf8 value"))
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(values, ["a1", "a2", "b1", "c1", "d1"]);
    assert!(session.queue_peak() <= 2);
    assert_eq!(session.state(), SessionState::Terminated);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_consumer_bounds_the_result_queue() -> Result<()> {
    let entries = numbered_rows("r", 10_000);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .page_size(50)
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            max_results: 10,
            ..test_config()
        },
    )?;
    let session = orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
    )?;

    let mut received = take(&session, 20).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.queue_len() <= 10);
    received.extend(drain(&session).await?);

    assert!(session.queue_peak() <= 10, "peak {}", session.queue_peak());
    assert_eq!(received.len(), entries.len());
    assert_exactly_once(&received, &entries);

    let stats = session.get_statistics().context("statistics enabled")?;
    assert_eq!(stats.results_delivered, 10_000);
    // Fairness yields the resource every 15 results.
    assert!(stats.time_slices > 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_stops_a_running_scan_promptly() -> Result<()> {
    let store = MemoryStore::builder()
        .table("t", numbered_rows("r", 5_000))
        .page_size(10)
        .latency(Duration::from_millis(2))
        .build();
    let orchestrator = orchestrator(&store, test_config())?;
    let session = orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
    )?;
    assert_eq!(take(&session, 5).await?.len(), 5);
    assert_eq!(orchestrator.current_sessions().len(), 1);

    tokio::time::timeout(Duration::from_secs(1), session.close())
        .await
        .context("close should not block")?;
    assert!(!session.has_next().await?);
    assert_eq!(session.state(), SessionState::Terminated);
    session.close().await;

    wait_until("resources to be released", || store.gauges().active_scans == 0).await?;
    wait_until("session to be deregistered", || {
        orchestrator.current_sessions().is_empty()
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_unblocks_a_consumer_waiting_in_has_next() -> Result<()> {
    let store = MemoryStore::builder()
        .table("t", numbered_rows("r", 10))
        .latency(Duration::from_secs(5))
        .build();
    let orchestrator = orchestrator(&store, test_config())?;
    let session = Arc::new(orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
    )?);

    let waiter = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.has_next().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "has_next returned before the first page");

    let closed_at = Instant::now();
    tokio::time::timeout(Duration::from_secs(1), session.close())
        .await
        .context("close should not block")?;
    let has_next = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .context("has_next should return once the session is closed")??;
    assert!(!has_next?);
    assert!(closed_at.elapsed() < Duration::from_secs(1));
    assert_eq!(session.state(), SessionState::Terminated);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fatal_storage_failure_is_raised_to_the_consumer() -> Result<()> {
    let store = MemoryStore::builder()
        .table("t", numbered_rows("r", 100))
        .fail_seek(1, InjectedFailure::Fatal)
        .build();
    let orchestrator = orchestrator(&store, test_config())?;
    let session = orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
    )?;

    let first = session.has_next().await;
    assert!(matches!(first, Err(ScanError::Producer(_))), "{first:?}");
    let again = session.has_next().await;
    assert!(matches!(again, Err(ScanError::Producer(_))), "{again:?}");
    assert!(matches!(session.next(), Err(ScanError::Producer(_))));
    assert_eq!(session.state(), SessionState::Failed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_table_and_rejected_labels_fail_resource_init() -> Result<()> {
    let store = MemoryStore::builder()
        .table("t", numbered_rows("r", 10))
        .reject_label("secret")
        .build();
    let orchestrator = orchestrator(&store, test_config())?;

    let missing = orchestrator.new_scanner_session(
        "missing",
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
    )?;
    match missing.has_next().await {
        Err(ScanError::ResourceInit { table, .. }) => assert_eq!(table, "missing"),
        other => panic!("expected a resource init failure, got {other:?}"),
    }

    let rejected = orchestrator.new_scanner_session(
        "t",
        Authorizations::new(["public", "secret"]),
        vec![KeyRange::all()],
        ScanOptions::default(),
    )?;
    let result = rejected.has_next().await;
    assert!(matches!(result, Err(ScanError::ResourceInit { .. })), "{result:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_seek_failures_are_retried() -> Result<()> {
    let entries = numbered_rows("r", 200);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .fail_seeks(1, 2, InjectedFailure::Transient)
        .build();
    let orchestrator = orchestrator(&store, test_config())?;
    let session = orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
    )?;

    let received = drain(&session).await?;
    assert_exactly_once(&received, &entries);
    let stats = session.get_statistics().context("statistics enabled")?;
    assert_eq!(stats.retries, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_open_failures_are_retried() -> Result<()> {
    let entries = numbered_rows("r", 50);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .fail_open(1, InjectedFailure::Transient)
        .build();
    let orchestrator = orchestrator(&store, test_config())?;
    let session = orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
    )?;

    let received = drain(&session).await?;
    assert_exactly_once(&received, &entries);
    let stats = session.get_statistics().context("statistics enabled")?;
    assert_eq!(stats.retries, 1);
    assert_eq!(store.gauges().opened, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_surface_the_failure() -> Result<()> {
    let store = MemoryStore::builder()
        .table("t", numbered_rows("r", 20))
        .fail_seeks(1, 10, InjectedFailure::Transient)
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            scan_retry_limit: 3,
            ..test_config()
        },
    )?;
    let session = orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
    )?;
    let result = session.has_next().await;
    assert!(matches!(result, Err(ScanError::Producer(_))), "{result:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpoint_resumes_without_gaps_or_duplicates() -> Result<()> {
    let entries = numbered_rows("r", 500);
    let store = MemoryStore::builder()
        .table("t", entries.clone())
        .page_size(7)
        .build();
    let orchestrator = orchestrator(
        &store,
        ScanConfig {
            max_results: 5,
            ..test_config()
        },
    )?;
    let ranges = vec![
        KeyRange::row_span("r00000", "r00250")?,
        KeyRange::row_span("r00250", "r99999")?,
    ];
    let session = orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        ranges,
        ScanOptions::default(),
    )?;

    let mut received = take(&session, 37).await?;
    let checkpoint = session.checkpoint().await?;
    assert!(!checkpoint.is_complete());
    // Results enqueued before the checkpoint stay with the old session.
    received.extend(drain(&session).await?);

    let restored = SessionCheckpoint::from_json(&checkpoint.to_json()?)?;
    assert_eq!(restored, checkpoint);
    let resumed = orchestrator.resume_session(restored)?;
    received.extend(drain(&resumed).await?);

    assert_exactly_once(&received, &entries);
    let resumed_rows = common::rows(&received);
    let mut sorted = resumed_rows.clone();
    sorted.sort();
    assert_eq!(resumed_rows, sorted, "scanner results stay in key order");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lockdown_refuses_new_sessions_and_closes_pools() -> Result<()> {
    let store = MemoryStore::builder()
        .table("t", numbered_rows("r", 50))
        .build();
    let orchestrator = orchestrator(&store, test_config())?;
    let session = orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
    )?;

    orchestrator.lockdown();
    let refused = orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        vec![KeyRange::all()],
        ScanOptions::default(),
    );
    assert!(matches!(refused, Err(ScanError::FactoryLocked)));

    // The live session still completes.
    assert_eq!(drain(&session).await?.len(), 50);
    wait_until("pools to close", || orchestrator.pools().is_closed()).await?;
    Ok(())
}
