use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use serde::Serialize;
use tracing::{debug, warn};

use crate::address::{BlobAddress, cluster_address_prefix};
use crate::bitmap::BlobBitmap;
use crate::config::BlobtrackConfig;
use crate::error::StoreError;
use crate::maintenance::{PrimaryPosWait, ProgressSink, ReplicaBarrier, throttle_sleep};
use crate::runtime::ResolvedPaths;
use crate::store;

/// Serialized-stub signature the integrity precheck looks for in the first
/// 22 bytes of a text row.
const LEGACY_STUB_SIGNATURE: &str = "o:15:\"historyblobstub\"";

#[derive(Debug, Clone)]
pub struct TrackOptions {
    pub clusters: Vec<String>,
    pub batch_size: usize,
    pub report_interval: usize,
    pub replica_wait_timeout: Duration,
    pub throttle_ms: u64,
    pub scan_orphans: bool,
}

impl TrackOptions {
    pub fn from_config(config: &BlobtrackConfig, clusters: Vec<String>) -> Self {
        Self {
            clusters,
            batch_size: config.batch_size(),
            report_interval: config.report_interval(),
            replica_wait_timeout: Duration::from_millis(config.replica_wait_timeout_ms()),
            throttle_ms: 0,
            scan_orphans: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackReport {
    pub clusters: Vec<String>,
    pub revisions_tracked: usize,
    pub orphan_text_tracked: usize,
    pub parse_failures: usize,
    pub orphan_scan: Vec<ClusterOrphanReport>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrphanScanStatus {
    Scanned,
    Unavailable,
    MissingBlobsTable,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterOrphanReport {
    pub cluster: String,
    pub status: OrphanScanStatus,
    pub orphans: usize,
    pub detail: Option<String>,
}

/// One stored orphan blob, as listed by the CLI.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OrphanBlobRecord {
    pub cluster: String,
    pub blob_id: u64,
}

/// Per-run scratch: one tracked-blob bitmap per requested cluster plus the
/// row counters the report carries.
struct TrackState {
    tracked: HashMap<String, BlobBitmap>,
    revisions_tracked: usize,
    orphan_text_tracked: usize,
    parse_failures: usize,
}

impl TrackState {
    fn new(clusters: &[String]) -> Self {
        Self {
            tracked: clusters
                .iter()
                .map(|name| (name.clone(), BlobBitmap::new()))
                .collect(),
            revisions_tracked: 0,
            orphan_text_tracked: 0,
            parse_failures: 0,
        }
    }
}

/// Rebuild the blob tracking index for the requested clusters, then scan
/// each cluster for orphan blobs.
///
/// The tracking tables are a derived cache: they are dropped and recreated
/// at the start of every run, and rerunning after a crash is the documented
/// recovery path.
pub fn track_clusters(
    paths: &ResolvedPaths,
    config: &BlobtrackConfig,
    options: &TrackOptions,
    barrier: &mut dyn ReplicaBarrier,
    progress: &mut dyn ProgressSink,
) -> Result<TrackReport> {
    if options.clusters.is_empty() {
        bail!("no clusters requested");
    }
    config.ensure_known_clusters(&options.clusters)?;

    let mut connection = store::open_local(&paths.db_path)?;
    store::init_local_schema(&connection)?;

    progress.line("Doing integrity check...");
    check_integrity(&connection)?;
    progress.line("Integrity check OK");

    store::reset_tracking_tables(&connection)?;

    let mut state = TrackState::new(&options.clusters);
    track_revisions(&mut connection, options, &mut state, barrier, progress)?;

    // The orphan-text anti-join reads rows the revision pass just wrote, so
    // replicas must reach the primary's position first. On timeout we
    // proceed anyway and accept a possibly incomplete orphan-text pass.
    if barrier.wait_for_primary_pos(options.replica_wait_timeout)? == PrimaryPosWait::TimedOut {
        warn!("timed out waiting for replicas; orphan text scan may miss rows");
        progress.line("Warning: timed out waiting for replicas to catch up");
    }
    track_orphan_text(&mut connection, options, &mut state, barrier, progress)?;

    let orphan_scan = if options.scan_orphans {
        scan_orphan_blobs(paths, config, &mut connection, options, &state, progress)?
    } else {
        options
            .clusters
            .iter()
            .map(|cluster| ClusterOrphanReport {
                cluster: cluster.clone(),
                status: OrphanScanStatus::Skipped,
                orphans: 0,
                detail: None,
            })
            .collect()
    };

    Ok(TrackReport {
        clusters: options.clusters.clone(),
        revisions_tracked: state.revisions_tracked,
        orphan_text_tracked: state.orphan_text_tracked,
        parse_failures: state.parse_failures,
        orphan_scan,
    })
}

/// Fail fast when legacy serialized-object stubs are still present: a
/// retracking run would treat their text rows as plain content and destroy
/// them downstream.
fn check_integrity(connection: &Connection) -> Result<()> {
    let sql = format!(
        "SELECT EXISTS(
            SELECT 1 FROM text
            WHERE old_flags LIKE '%object%'
              AND old_flags NOT LIKE '%external%'
              AND lower(substr(old_text, 1, 22)) = '{LEGACY_STUB_SIGNATURE}'
            LIMIT 1)"
    );
    let stub_found: i64 = connection
        .query_row(&sql, [], |row| row.get(0))
        .context("failed to run integrity precheck")?;
    if stub_found == 1 {
        return Err(StoreError::Integrity(
            "legacy serialized blob stubs are present in the text table; resolve them before retracking"
                .to_string(),
        )
        .into());
    }
    Ok(())
}

struct RevisionRow {
    rev_id: i64,
    rev_page: i64,
    text_id: i64,
    old_text: String,
}

fn track_revisions(
    connection: &mut Connection,
    options: &TrackOptions,
    state: &mut TrackState,
    barrier: &mut dyn ReplicaBarrier,
    progress: &mut dyn ProgressSink,
) -> Result<()> {
    let role_id = store::main_role_id(connection)?;
    let max_rev: i64 = connection
        .query_row("SELECT IFNULL(MAX(rev_id), 0) FROM revision", [], |row| {
            row.get(0)
        })
        .context("failed to read revision high watermark")?;

    progress.line("Finding revisions...");

    let report_interval = options.report_interval.max(1);
    let mut cursor = 0i64;
    let mut batches = 0usize;
    loop {
        let rows = fetch_revision_batch(connection, role_id, options, cursor)?;
        let Some(last) = rows.last() else {
            break;
        };
        cursor = last.rev_id;

        let transaction = connection
            .transaction()
            .context("failed to start tracking transaction")?;
        {
            let mut insert = transaction
                .prepare(
                    "INSERT INTO blob_tracking
                        (bt_page, bt_rev_id, bt_text_id, bt_cluster, bt_blob_id, bt_cgz_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .context("failed to prepare blob_tracking insert")?;
            for row in &rows {
                let Some(address) = parse_tracked_address(state, row.text_id, &row.old_text)
                else {
                    continue;
                };
                let blob_id =
                    i64::try_from(address.blob_id).context("blob id does not fit into i64")?;
                insert
                    .execute(params![
                        row.rev_page,
                        row.rev_id,
                        row.text_id,
                        address.cluster,
                        blob_id,
                        address.hash,
                    ])
                    .with_context(|| format!("failed to track revision {}", row.rev_id))?;
                state.revisions_tracked += 1;
            }
        }
        transaction
            .commit()
            .context("failed to commit tracking transaction")?;

        batches += 1;
        if batches % report_interval == 0 {
            progress.line(&format!("{cursor} / {max_rev}"));
            barrier.wait_for_replication()?;
        }
        throttle_sleep(options.throttle_ms);
    }

    progress.line(&format!("Found {} revisions", state.revisions_tracked));
    Ok(())
}

struct TextRow {
    text_id: i64,
    old_text: String,
}

fn track_orphan_text(
    connection: &mut Connection,
    options: &TrackOptions,
    state: &mut TrackState,
    barrier: &mut dyn ReplicaBarrier,
    progress: &mut dyn ProgressSink,
) -> Result<()> {
    let max_text: i64 = connection
        .query_row("SELECT IFNULL(MAX(old_id), 0) FROM text", [], |row| {
            row.get(0)
        })
        .context("failed to read text high watermark")?;

    progress.line("Finding orphan text...");

    let report_interval = options.report_interval.max(1);
    let mut cursor = 0i64;
    let mut batches = 0usize;
    loop {
        let rows = fetch_orphan_text_batch(connection, options, cursor)?;
        let Some(last) = rows.last() else {
            break;
        };
        cursor = last.text_id;

        let transaction = connection
            .transaction()
            .context("failed to start orphan text transaction")?;
        {
            let mut insert = transaction
                .prepare(
                    "INSERT INTO blob_tracking
                        (bt_page, bt_rev_id, bt_text_id, bt_cluster, bt_blob_id, bt_cgz_hash)
                     VALUES (0, 0, ?1, ?2, ?3, ?4)",
                )
                .context("failed to prepare orphan text insert")?;
            for row in &rows {
                let Some(address) = parse_tracked_address(state, row.text_id, &row.old_text)
                else {
                    continue;
                };
                let blob_id =
                    i64::try_from(address.blob_id).context("blob id does not fit into i64")?;
                insert
                    .execute(params![row.text_id, address.cluster, blob_id, address.hash])
                    .with_context(|| format!("failed to track text row {}", row.text_id))?;
                state.orphan_text_tracked += 1;
            }
        }
        transaction
            .commit()
            .context("failed to commit orphan text transaction")?;

        batches += 1;
        if batches % report_interval == 0 {
            progress.line(&format!("{cursor} / {max_text}"));
            barrier.wait_for_replication()?;
        }
        throttle_sleep(options.throttle_ms);
    }

    progress.line(&format!(
        "Found {} orphan text rows",
        state.orphan_text_tracked
    ));
    Ok(())
}

/// Parse one scanned text pointer, enforcing the requested-cluster set.
/// Returns `None` (after logging and counting) for anything that cannot be
/// tracked; per-row failures never abort the scan.
fn parse_tracked_address(
    state: &mut TrackState,
    text_id: i64,
    old_text: &str,
) -> Option<BlobAddress> {
    let Some(address) = BlobAddress::parse(old_text) else {
        state.parse_failures += 1;
        warn!(text_id, "malformed blob address in text row");
        return None;
    };
    match state.tracked.get_mut(&address.cluster) {
        Some(bitmap) => {
            bitmap.set(address.blob_id);
            Some(address)
        }
        None => {
            state.parse_failures += 1;
            warn!(
                text_id,
                cluster = address.cluster,
                "blob address names a cluster outside the requested set"
            );
            None
        }
    }
}

fn fetch_revision_batch(
    connection: &Connection,
    role_id: i64,
    options: &TrackOptions,
    cursor: i64,
) -> Result<Vec<RevisionRow>> {
    let sql = format!(
        "SELECT rev_id, rev_page, old_id, old_text
         FROM revision
         JOIN slots ON slot_revision_id = rev_id
         JOIN content ON content_id = slot_content_id
         JOIN text ON old_id = CAST(substr(content_address, 4) AS INTEGER)
         WHERE rev_id > ?
           AND slot_role_id = ?
           AND substr(content_address, 1, 3) = 'tt:'
           AND old_flags LIKE '%external%'
           AND ({})
         ORDER BY rev_id
         LIMIT ?",
        cluster_like_clause(options.clusters.len())
    );
    let mut statement = connection
        .prepare(&sql)
        .context("failed to prepare revision tracking query")?;

    let mut values: Vec<Value> = vec![Value::from(cursor), Value::from(role_id)];
    values.extend(cluster_like_patterns(&options.clusters));
    values.push(batch_limit(options.batch_size)?);

    let rows = statement
        .query_map(params_from_iter(values), |row| {
            Ok(RevisionRow {
                rev_id: row.get(0)?,
                rev_page: row.get(1)?,
                text_id: row.get(2)?,
                old_text: row.get(3)?,
            })
        })
        .context("failed to run revision tracking query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode revision tracking row")?);
    }
    Ok(out)
}

fn fetch_orphan_text_batch(
    connection: &Connection,
    options: &TrackOptions,
    cursor: i64,
) -> Result<Vec<TextRow>> {
    let sql = format!(
        "SELECT old_id, old_text
         FROM text
         LEFT JOIN blob_tracking ON bt_text_id = old_id
         WHERE old_id > ?
           AND old_flags LIKE '%external%'
           AND ({})
           AND bt_text_id IS NULL
         ORDER BY old_id
         LIMIT ?",
        cluster_like_clause(options.clusters.len())
    );
    let mut statement = connection
        .prepare(&sql)
        .context("failed to prepare orphan text query")?;

    let mut values: Vec<Value> = vec![Value::from(cursor)];
    values.extend(cluster_like_patterns(&options.clusters));
    values.push(batch_limit(options.batch_size)?);

    let rows = statement
        .query_map(params_from_iter(values), |row| {
            Ok(TextRow {
                text_id: row.get(0)?,
                old_text: row.get(1)?,
            })
        })
        .context("failed to run orphan text query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode orphan text row")?);
    }
    Ok(out)
}

/// `old_text LIKE ? OR old_text LIKE ?` with one arm per requested cluster.
/// The LIKE is only a prefilter; the parsed address decides membership.
fn cluster_like_clause(clusters: usize) -> String {
    vec!["old_text LIKE ?"; clusters].join(" OR ")
}

fn cluster_like_patterns(clusters: &[String]) -> Vec<Value> {
    clusters
        .iter()
        .map(|cluster| Value::from(format!("{}%", cluster_address_prefix(cluster))))
        .collect()
}

fn batch_limit(batch_size: usize) -> Result<Value> {
    let limit = i64::try_from(batch_size).context("batch size does not fit into i64")?;
    Ok(Value::from(limit))
}

/// Compare each cluster's physical blob table against the tracked bitmap and
/// persist every blob present but unreferenced. One unreachable cluster is
/// reported and skipped, never fatal.
fn scan_orphan_blobs(
    paths: &ResolvedPaths,
    config: &BlobtrackConfig,
    connection: &mut Connection,
    options: &TrackOptions,
    state: &TrackState,
    progress: &mut dyn ProgressSink,
) -> Result<Vec<ClusterOrphanReport>> {
    let mut out = Vec::new();
    for cluster in &options.clusters {
        progress.line(&format!("Searching for orphan blobs in {cluster}..."));
        let db_path = config.cluster_db_path(paths, cluster)?;

        let actual = match scan_cluster_blob_ids(cluster, &db_path, options.batch_size) {
            Ok(Some(actual)) => actual,
            Ok(None) => {
                progress.line(&format!("Cluster {cluster} has no blobs table, skipping"));
                out.push(ClusterOrphanReport {
                    cluster: cluster.clone(),
                    status: OrphanScanStatus::MissingBlobsTable,
                    orphans: 0,
                    detail: None,
                });
                continue;
            }
            Err(error) => {
                let reason = match error.downcast_ref::<StoreError>() {
                    Some(StoreError::ClusterUnavailable { reason, .. }) => reason.clone(),
                    _ => format!("{error:#}"),
                };
                warn!(cluster, reason, "skipping unreachable cluster");
                progress.line(&format!("Unable to scan cluster {cluster}, skipping"));
                out.push(ClusterOrphanReport {
                    cluster: cluster.clone(),
                    status: OrphanScanStatus::Unavailable,
                    orphans: 0,
                    detail: Some(reason),
                });
                continue;
            }
        };

        let tracked = state
            .tracked
            .get(cluster)
            .with_context(|| format!("no tracked bitmap for cluster {cluster}"))?;
        let orphans = actual.and_not(tracked);

        let transaction = connection
            .transaction()
            .context("failed to start orphan insert transaction")?;
        let mut inserted = 0usize;
        {
            let mut insert = transaction
                .prepare(
                    "INSERT OR IGNORE INTO blob_orphans (bo_cluster, bo_blob_id) VALUES (?1, ?2)",
                )
                .context("failed to prepare blob_orphans insert")?;
            for blob_id in orphans.iter_set_bits() {
                let blob_id = i64::try_from(blob_id).context("blob id does not fit into i64")?;
                insert
                    .execute(params![cluster, blob_id])
                    .with_context(|| format!("failed to record orphan blob {blob_id}"))?;
                inserted += 1;
            }
        }
        transaction
            .commit()
            .context("failed to commit orphan insert transaction")?;

        debug!(cluster, orphans = inserted, "orphan scan finished");
        progress.line(&format!("Found {inserted} orphan blob(s) in {cluster}"));
        out.push(ClusterOrphanReport {
            cluster: cluster.clone(),
            status: OrphanScanStatus::Scanned,
            orphans: inserted,
            detail: None,
        });
    }
    Ok(out)
}

/// Batch-scan a cluster's blobs table into a bitmap of observed ids.
/// `Ok(None)` means the cluster is reachable but carries no blobs table.
fn scan_cluster_blob_ids(
    cluster: &str,
    db_path: &Path,
    batch_size: usize,
) -> Result<Option<BlobBitmap>> {
    let cluster_connection = store::open_cluster(cluster, db_path)?;
    match store::table_exists(&cluster_connection, "blobs") {
        Ok(true) => {}
        Ok(false) => return Ok(None),
        Err(error) => {
            return Err(StoreError::cluster_unavailable(cluster, format!("{error:#}")).into());
        }
    }

    let mut actual = BlobBitmap::new();
    let mut cursor = 0i64;
    let limit = i64::try_from(batch_size).context("batch size does not fit into i64")?;
    loop {
        let mut statement = cluster_connection
            .prepare("SELECT blob_id FROM blobs WHERE blob_id > ?1 ORDER BY blob_id LIMIT ?2")
            .context("failed to prepare cluster blob scan")?;
        let ids = statement
            .query_map(params![cursor, limit], |row| row.get::<_, i64>(0))
            .context("failed to run cluster blob scan")?
            .collect::<Result<Vec<i64>, _>>()
            .context("failed to decode cluster blob row")?;
        let Some(last) = ids.last() else {
            break;
        };
        cursor = *last;
        for id in ids {
            match u64::try_from(id) {
                Ok(id) => {
                    actual.set(id);
                }
                Err(_) => warn!(cluster, blob_id = id, "negative blob id ignored"),
            }
        }
    }
    Ok(Some(actual))
}

/// Stored orphan records from the last completed scan, optionally filtered
/// by cluster.
pub fn list_orphans(paths: &ResolvedPaths, cluster: Option<&str>) -> Result<Vec<OrphanBlobRecord>> {
    let connection = store::open_local(&paths.db_path)?;
    if !store::table_exists(&connection, "blob_orphans")? {
        return Ok(Vec::new());
    }

    let (sql, filter): (&str, Vec<Value>) = match cluster {
        Some(cluster) => (
            "SELECT bo_cluster, bo_blob_id FROM blob_orphans
             WHERE bo_cluster = ? ORDER BY bo_cluster, bo_blob_id",
            vec![Value::from(cluster.to_string())],
        ),
        None => (
            "SELECT bo_cluster, bo_blob_id FROM blob_orphans ORDER BY bo_cluster, bo_blob_id",
            Vec::new(),
        ),
    };

    let mut statement = connection
        .prepare(sql)
        .context("failed to prepare orphan listing query")?;
    let rows = statement
        .query_map(params_from_iter(filter), |row| {
            let cluster: String = row.get(0)?;
            let blob_id: i64 = row.get(1)?;
            Ok((cluster, blob_id))
        })
        .context("failed to run orphan listing query")?;

    let mut out = Vec::new();
    for row in rows {
        let (cluster, blob_id) = row.context("failed to decode orphan row")?;
        out.push(OrphanBlobRecord {
            cluster,
            blob_id: u64::try_from(blob_id).context("orphan blob id is negative")?,
        });
    }
    Ok(out)
}
