//! Range-stream sessions over shard index entries, and duplicate
//! suppression on top of sessions.

mod common;

use std::collections::HashSet;

use anyhow::{Context, Result};
use holo_scan::{
    dedup_key, Authorizations, IndexInfo, Key, KeyRange, MemoryStore, ResultEntry, ScanConfig,
    ScanOptions,
};

use common::{drain, orchestrator, test_config};

fn shard(term: &str, day: &str, shard: usize, count: i64) -> ResultEntry {
    ResultEntry::new(
        Key::new(term, "fi\0text", format!("{day}_{shard}"), "", 1),
        IndexInfo::with_count(count).encode(),
    )
}

fn index_config() -> ScanConfig {
    ScanConfig {
        shards_per_day_threshold: 10,
        max_median: 20,
        max_results: 100,
        ..test_config()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dense_days_collapse_into_one_entry() -> Result<()> {
    let entries = (0..25).map(|idx| shard("term", "20240101", idx, 50)).collect();
    let store = MemoryStore::builder().table("idx", entries).page_size(4).build();
    let orchestrator = orchestrator(&store, index_config())?;
    let session = orchestrator.new_range_stream_session(
        "idx",
        Authorizations::empty(),
        vec![KeyRange::exact_row("term")],
        ScanOptions::default(),
    )?;

    let received = drain(&session).await?;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].key.qualifier, b"20240101".to_vec());
    assert_eq!(IndexInfo::decode(&received[0].value)?.count, -1);

    let stats = session.get_statistics().context("statistics enabled")?;
    assert_eq!(stats.compacted_days, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sparse_days_are_listed_shard_by_shard() -> Result<()> {
    let mut entries = (0..25)
        .map(|idx| shard("term", "20240101", idx, 1))
        .collect::<Vec<_>>();
    entries.extend((0..3).map(|idx| shard("term", "20240102", idx, 90)));
    let store = MemoryStore::builder().table("idx", entries).page_size(4).build();
    let orchestrator = orchestrator(&store, index_config())?;
    let session = orchestrator.new_range_stream_session(
        "idx",
        Authorizations::empty(),
        vec![KeyRange::exact_row("term")],
        ScanOptions::default(),
    )?;

    let received = drain(&session).await?;
    assert_eq!(received.len(), 28);
    assert!(received
        .iter()
        .all(|entry| IndexInfo::decode(&entry.value).is_ok_and(|info| info.count > 0)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dedup_session_drops_overlapping_results() -> Result<()> {
    let entries = (b'a'..=b'z')
        .flat_map(|row| {
            (1..=2).map(move |uid| {
                ResultEntry::new(
                    Key::new([row], format!("shard\0A\0{uid}"), "", "", 1),
                    format!("{}-{uid}", row as char),
                )
            })
        })
        .collect::<Vec<_>>();
    let store = MemoryStore::builder().table("t", entries.clone()).build();
    let orchestrator = orchestrator(&store, test_config())?;
    let ranges = vec![KeyRange::row_span("a", "n")?, KeyRange::row_span("f", "{")?];
    let session = orchestrator.new_scanner_session(
        "t",
        Authorizations::empty(),
        ranges,
        ScanOptions::default(),
    )?;
    let dedup = orchestrator.dedup(session)?;

    let mut received = Vec::new();
    while let Some(entry) = dedup.next_entry().await? {
        received.push(entry);
    }

    let identities = received
        .iter()
        .map(|entry| dedup_key(entry).context("identity"))
        .collect::<Result<HashSet<_>>>()?;
    assert_eq!(identities.len(), received.len(), "duplicate identity emitted");
    assert_eq!(received.len(), entries.len());
    // Rows f..m were read by both ranges.
    assert_eq!(dedup.dropped(), 8 * 2);

    let stats = dedup
        .session()
        .get_statistics()
        .context("statistics enabled")?;
    assert_eq!(stats.dedup_drops, 16);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn model_cache_is_shared_per_orchestrator() -> Result<()> {
    use holo_scan::{CacheKey, QueryModel};

    let store = MemoryStore::builder().build();
    let orchestrator = orchestrator(&store, test_config())?;
    let key = CacheKey::new("events", ["A", "B"]);
    let built = orchestrator
        .model_cache()
        .get_or_try_insert_with(key.clone(), || {
            Ok::<_, anyhow::Error>(QueryModel::new("events").with_mapping("user", "USER_ID"))
        })?;
    assert_eq!(built.stored_field("user"), "USER_ID");

    let cached = orchestrator
        .model_cache()
        .get(&CacheKey::new("events", ["B", "A"]))
        .context("cached model")?;
    assert_eq!(cached.name, "events");
    assert_eq!(orchestrator.model_cache().stats().hits, 1);
    Ok(())
}
