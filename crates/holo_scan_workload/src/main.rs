//! Workload driver for exercising HoloScan against the in-memory store.
//!
//! This binary seeds a tablet-split table, runs concurrent scan sessions in
//! one of the session modes, checks that every expected entry arrived
//! exactly once and writes a JSON report with per-session statistics.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use holo_scan::{
    Authorizations, Deduplicator, IndexInfo, InjectedFailure, Key, KeyRange, MemoryStore,
    ResultEntry, ScanConfig, ScanOptions, ScanOrchestrator, ScanSession, ScanStatsSnapshot,
    ScanStrategy, SessionCheckpoint, StorageClient, StoreGauges,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TABLE: &str = "workload";
const INDEX_TABLE: &str = "workload_index";

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-scan-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// Session flavour driven by the workload.
#[derive(ValueEnum, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum Mode {
    /// Sequential scanner sessions.
    Ranges,
    /// Tablet-binned batch sessions.
    Chunks,
    /// Range-stream sessions over shard index entries.
    Index,
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    #[arg(long, value_enum, default_value_t = Mode::Chunks)]
    mode: Mode,

    /// Rows in the seeded table.
    #[arg(long, default_value_t = 20_000)]
    rows: usize,

    /// Cells per row.
    #[arg(long, default_value_t = 2)]
    cells: usize,

    /// Tablets the table is split into.
    #[arg(long, default_value_t = 16)]
    tablets: usize,

    /// Distinct tablet locations, assigned round-robin.
    #[arg(long, default_value_t = 4)]
    locations: usize,

    /// Concurrent sessions.
    #[arg(long, default_value_t = 4)]
    sessions: usize,

    /// Disjoint ranges per session.
    #[arg(long, default_value_t = 12)]
    ranges: usize,

    /// Ranges binned per chunk batch (chunks mode).
    #[arg(long, default_value_t = 4)]
    batch_size: usize,

    /// Chunk workers per session.
    #[arg(long, default_value_t = 5)]
    threads: usize,

    /// Result queue capacity per session.
    #[arg(long, default_value_t = 1000)]
    max_results: usize,

    /// Entries per storage page.
    #[arg(long, default_value_t = 64)]
    page_size: usize,

    /// Delay before every storage page.
    #[arg(long, default_value = "0s")]
    latency: humantime::Duration,

    /// Extra page delay for the sequential strategy.
    #[arg(long)]
    sequential_latency: Option<humantime::Duration>,

    /// Per-chunk time budget.
    #[arg(long)]
    scan_limit: Option<humantime::Duration>,

    #[arg(long, default_value_t = false)]
    speculative: bool,

    #[arg(long, default_value_t = false)]
    backoff: bool,

    /// Wrap sessions with the duplicate filter.
    #[arg(long, default_value_t = false)]
    dedup: bool,

    /// Inject transient failures into the first N seeks.
    #[arg(long, default_value_t = 0)]
    transient_failures: u64,

    /// Checkpoint and resume every session after this many results.
    #[arg(long)]
    checkpoint_after: Option<usize>,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the JSON report to this path.
    #[arg(long, default_value = ".tmp/holo_scan/report.json")]
    out: PathBuf,
}

/// Metadata embedded in the report for reproducibility.
#[derive(serde::Serialize, Debug, Clone)]
struct ReportMeta {
    mode: Mode,
    rows: usize,
    cells: usize,
    tablets: usize,
    locations: usize,
    sessions: usize,
    ranges: usize,
    threads: usize,
    max_results: usize,
    speculative: bool,
    backoff: bool,
    dedup: bool,
    transient_failures: u64,
    checkpoint_after: Option<usize>,
    seed: u64,
}

/// Outcome of one session.
#[derive(serde::Serialize, Debug, Clone)]
struct SessionReport {
    session: usize,
    expected: Option<usize>,
    received: usize,
    duplicates: usize,
    resumed: bool,
    elapsed_ms: u64,
    queue_peak: usize,
    stats: Option<ScanStatsSnapshot>,
    error: Option<String>,
}

/// Full run report.
#[derive(serde::Serialize, Debug, Clone)]
struct Report {
    meta: ReportMeta,
    elapsed_ms: u64,
    store: StoreGauges,
    sessions: Vec<SessionReport>,
}

#[tokio::main]
/// Parse CLI args and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("holo_scan=info,holo_scan_workload=info,warn")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

/// Run the workload and write the report.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.rows > 0, "--rows must be > 0");
    anyhow::ensure!(args.cells > 0, "--cells must be > 0");
    anyhow::ensure!(args.tablets > 0, "--tablets must be > 0");
    anyhow::ensure!(args.locations > 0, "--locations must be > 0");
    anyhow::ensure!(args.sessions > 0, "--sessions must be > 0");
    anyhow::ensure!(args.ranges > 0, "--ranges must be > 0");
    anyhow::ensure!(
        args.ranges * 2 <= args.rows,
        "--ranges must be at most half of --rows"
    );

    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let mut rng = SmallRng::seed_from_u64(seed);

    let table = seed_table(args.rows, args.cells);
    let index = seed_index(&mut rng, args.ranges);
    let store = build_store(&args, table.clone(), index);
    let config = scan_config(&args)?;
    let client: Arc<dyn StorageClient> = Arc::new(store.clone());
    let orchestrator = Arc::new(ScanOrchestrator::new(client, config)?);
    info!(
        mode = ?args.mode,
        rows = args.rows,
        tablets = args.tablets,
        sessions = args.sessions,
        seed,
        "starting scan workload"
    );

    let table = Arc::new(table);
    let start = Instant::now();
    let mut tasks = Vec::with_capacity(args.sessions);
    for session_id in 0..args.sessions {
        // Mix the base seed with the session id for deterministic per-session ranges.
        let session_seed = seed ^ (session_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        let plan = SessionPlan {
            id: session_id,
            ranges: match args.mode {
                Mode::Index => index_ranges(args.ranges),
                Mode::Ranges | Mode::Chunks => {
                    let mut rng = SmallRng::seed_from_u64(session_seed);
                    random_ranges(&mut rng, args.rows, args.ranges)?
                }
            },
        };
        let orchestrator = Arc::clone(&orchestrator);
        let store = store.clone();
        let table = Arc::clone(&table);
        let args = args.clone();
        tasks.push(tokio::spawn(async move {
            run_session(&orchestrator, &store, &table, &args, plan).await
        }));
    }

    let mut sessions = Vec::with_capacity(tasks.len());
    for task in tasks {
        sessions.push(task.await.context("session task panicked")?);
    }
    orchestrator.shutdown().await;

    let report = Report {
        meta: ReportMeta {
            mode: args.mode,
            rows: args.rows,
            cells: args.cells,
            tablets: args.tablets,
            locations: args.locations,
            sessions: args.sessions,
            ranges: args.ranges,
            threads: args.threads,
            max_results: args.max_results,
            speculative: args.speculative,
            backoff: args.backoff,
            dedup: args.dedup,
            transient_failures: args.transient_failures,
            checkpoint_after: args.checkpoint_after,
            seed,
        },
        elapsed_ms: start.elapsed().as_millis() as u64,
        store: store.gauges(),
        sessions,
    };
    write_report(&args.out, &report).context("write report")?;
    eprintln!("wrote report: {}", args.out.display());

    let failed = report
        .sessions
        .iter()
        .filter(|session| {
            session.error.is_some()
                || session.duplicates > 0
                || session.expected.is_some_and(|expected| expected != session.received)
        })
        .count();
    anyhow::ensure!(
        failed == 0,
        "{failed} of {} sessions failed verification",
        report.sessions.len()
    );
    anyhow::ensure!(
        report.store.exclusivity_violations == 0,
        "{} scan resources were used concurrently",
        report.store.exclusivity_violations
    );
    Ok(())
}

/// Ranges assigned to one session.
struct SessionPlan {
    id: usize,
    ranges: Vec<KeyRange>,
}

async fn run_session(
    orchestrator: &ScanOrchestrator,
    store: &MemoryStore,
    table: &[ResultEntry],
    args: &RunArgs,
    plan: SessionPlan,
) -> SessionReport {
    let started = Instant::now();
    let expected = match args.mode {
        Mode::Index => None,
        Mode::Ranges | Mode::Chunks => Some(
            table
                .iter()
                .filter(|entry| plan.ranges.iter().any(|range| range.contains(&entry.key)))
                .count(),
        ),
    };
    let mut report = SessionReport {
        session: plan.id,
        expected,
        received: 0,
        duplicates: 0,
        resumed: false,
        elapsed_ms: 0,
        queue_peak: 0,
        stats: None,
        error: None,
    };

    let mut seen = HashSet::new();
    let mut record = |entries: Vec<ResultEntry>, report: &mut SessionReport| {
        for entry in entries {
            report.received += 1;
            if !seen.insert(entry.key) {
                report.duplicates += 1;
            }
        }
    };

    let outcome = async {
        let session = open_session(orchestrator, store, args, plan.ranges.clone())?;
        let session = match args.checkpoint_after {
            Some(limit) => {
                record(pull(orchestrator, &session, args.dedup, Some(limit)).await?, &mut report);
                let checkpoint = session.checkpoint().await?;
                record(pull(orchestrator, &session, false, None).await?, &mut report);
                report.queue_peak = session.queue_peak();
                if checkpoint.is_complete() {
                    info!(session = plan.id, "checkpoint taken after the scan finished");
                    return Ok::<_, anyhow::Error>(session);
                }
                report.resumed = true;
                let restored = SessionCheckpoint::from_json(&checkpoint.to_json()?)?;
                orchestrator.resume_session(restored)?
            }
            None => session,
        };
        record(pull(orchestrator, &session, args.dedup, None).await?, &mut report);
        Ok(session)
    }
    .await;

    match outcome {
        Ok(session) => {
            report.queue_peak = report.queue_peak.max(session.queue_peak());
            report.stats = session.get_statistics();
        }
        Err(err) => {
            warn!(session = plan.id, error = %err, "scan session failed");
            report.error = Some(format!("{err:#}"));
        }
    }
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        session = plan.id,
        received = report.received,
        expected = ?report.expected,
        duplicates = report.duplicates,
        elapsed_ms = report.elapsed_ms,
        "scan session finished"
    );
    report
}

fn open_session(
    orchestrator: &ScanOrchestrator,
    store: &MemoryStore,
    args: &RunArgs,
    ranges: Vec<KeyRange>,
) -> anyhow::Result<ScanSession> {
    let auths = Authorizations::empty();
    let options = ScanOptions::default();
    let session = match args.mode {
        Mode::Ranges => orchestrator.new_scanner_session(TABLE, auths, ranges, options)?,
        Mode::Chunks => {
            let locator = store.locator(TABLE)?;
            orchestrator.new_tablet_session(&locator, auths, ranges, options, args.batch_size)?
        }
        Mode::Index => orchestrator.new_range_stream_session(INDEX_TABLE, auths, ranges, options)?,
    };
    Ok(session)
}

/// Drains up to `limit` results, optionally through the duplicate filter.
///
/// A dedup wrapper takes ownership of the session, so filtering only runs
/// for whole-session drains.
async fn pull(
    orchestrator: &ScanOrchestrator,
    session: &ScanSession,
    dedup: bool,
    limit: Option<usize>,
) -> anyhow::Result<Vec<ResultEntry>> {
    let mut filter = match (dedup, limit) {
        (true, None) => Some(Deduplicator::from_config(orchestrator.config())?),
        _ => None,
    };
    let mut out = Vec::new();
    while limit.map_or(true, |limit| out.len() < limit) {
        let Some(entry) = session.next_entry().await? else {
            break;
        };
        match filter.as_mut() {
            Some(filter) => out.extend(filter.admit(entry)),
            None => out.push(entry),
        }
    }
    Ok(out)
}

fn scan_config(args: &RunArgs) -> anyhow::Result<ScanConfig> {
    let mut config = ScanConfig::from_env().context("load HOLO_SCAN_* configuration")?;
    config.thread_count = args.threads;
    config.max_results = args.max_results;
    config.speculative_scanning = args.speculative;
    config.backoff_enabled = args.backoff;
    config.accrue_stats = true;
    if let Some(limit) = args.scan_limit {
        config.scan_limit = Some(limit.into());
    }
    config.validate()?;
    Ok(config)
}

fn build_store(args: &RunArgs, table: Vec<ResultEntry>, index: Vec<ResultEntry>) -> MemoryStore {
    let splits = (1..args.tablets)
        .map(|idx| row_name(idx * args.rows / args.tablets))
        .collect::<Vec<_>>();
    let locations = (0..args.locations)
        .map(|idx| format!("ts-{}", idx + 1))
        .collect::<Vec<_>>();
    let mut builder = MemoryStore::builder()
        .table(TABLE, table)
        .table(INDEX_TABLE, index)
        .tablets(TABLE, splits, locations)
        .page_size(args.page_size)
        .latency(args.latency.into());
    if let Some(latency) = args.sequential_latency {
        builder = builder.strategy_latency(ScanStrategy::Sequential, latency.into());
    }
    if args.transient_failures > 0 {
        builder = builder.fail_seeks(1, args.transient_failures, InjectedFailure::Transient);
    }
    builder.build()
}

fn row_name(idx: usize) -> String {
    format!("row{idx:08}")
}

fn seed_table(rows: usize, cells: usize) -> Vec<ResultEntry> {
    (0..rows)
        .flat_map(|row| {
            let name = row_name(row);
            (0..cells).map(move |cell| {
                ResultEntry::new(
                    Key::new(
                        name.clone(),
                        format!("shard\0doc\0{row}.{cell}"),
                        format!("c{cell}"),
                        "",
                        1,
                    ),
                    format!("{row}:{cell}"),
                )
            })
        })
        .collect()
}

/// One term per range; each term spans a handful of days with random shard
/// counts, so some days compact and others are listed.
fn seed_index(rng: &mut SmallRng, terms: usize) -> Vec<ResultEntry> {
    let mut entries = Vec::new();
    for term in 0..terms {
        for day in 1..=5u32 {
            let shards = rng.gen_range(1..40usize);
            let dense = rng.gen_bool(0.5);
            for shard in 0..shards {
                let count = if dense { rng.gen_range(25..200) } else { rng.gen_range(1..10) };
                entries.push(ResultEntry::new(
                    Key::new(
                        format!("term{term:04}"),
                        "fi\0text",
                        format!("202401{day:02}_{shard}"),
                        "",
                        1,
                    ),
                    IndexInfo::with_count(count).encode(),
                ));
            }
        }
    }
    entries
}

fn index_ranges(terms: usize) -> Vec<KeyRange> {
    (0..terms)
        .map(|term| KeyRange::exact_row(format!("term{term:04}")))
        .collect()
}

/// `count` disjoint row spans with random boundaries.
fn random_ranges(rng: &mut SmallRng, rows: usize, count: usize) -> anyhow::Result<Vec<KeyRange>> {
    let mut bounds = HashSet::new();
    while bounds.len() < count * 2 {
        bounds.insert(rng.gen_range(0..=rows));
    }
    let mut bounds = bounds.into_iter().collect::<Vec<_>>();
    bounds.sort_unstable();
    bounds
        .chunks(2)
        .map(|pair| {
            KeyRange::row_span(row_name(pair[0]), row_name(pair[1]))
                .context("build random range")
        })
        .collect()
}

/// Write the report as pretty JSON to the provided path.
fn write_report(path: &Path, report: &Report) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let body = serde_json::to_vec_pretty(report).context("serialize report")?;
    std::fs::write(path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn random_ranges_are_disjoint_and_sorted() {
        let mut rng = SmallRng::seed_from_u64(7);
        let ranges = random_ranges(&mut rng, 1_000, 10).expect("ranges");
        assert_eq!(ranges.len(), 10);
        for pair in ranges.windows(2) {
            assert!(pair[0].end() <= pair[1].start());
        }
    }

    #[test]
    fn seeded_table_is_row_major() {
        let table = seed_table(3, 2);
        assert_eq!(table.len(), 6);
        assert_eq!(table[0].key.row, b"row00000000".to_vec());
        assert_eq!(table[5].key.qualifier, b"c1".to_vec());
    }

    #[test]
    fn run_args_parse_durations() {
        let args = Args::try_parse_from([
            "holo-scan-workload",
            "run",
            "--mode",
            "ranges",
            "--latency",
            "2ms",
            "--scan-limit",
            "50ms",
        ])
        .expect("parse");
        let Command::Run(run) = args.cmd;
        assert_eq!(run.mode, Mode::Ranges);
        assert_eq!(Duration::from(run.latency), Duration::from_millis(2));
        assert_eq!(
            run.scan_limit.map(Duration::from),
            Some(Duration::from_millis(50))
        );
    }
}
