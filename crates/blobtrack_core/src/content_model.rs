use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use serde::Serialize;
use tracing::debug;

use crate::cache;
use crate::config::BlobtrackConfig;
use crate::maintenance::{ProgressSink, ReplicaBarrier, throttle_sleep};
use crate::runtime::ResolvedPaths;
use crate::store;

pub const MODEL_WIKITEXT: &str = "wikitext";
pub const MODEL_JAVASCRIPT: &str = "javascript";
pub const MODEL_CSS: &str = "css";
pub const MODEL_JSON: &str = "json";

pub const FORMAT_WIKITEXT: &str = "text/x-wiki";
pub const FORMAT_JAVASCRIPT: &str = "text/javascript";
pub const FORMAT_CSS: &str = "text/css";
pub const FORMAT_JSON: &str = "application/json";

pub const NS_MAIN: i32 = 0;
pub const NS_USER: i32 = 2;
pub const NS_MEDIAWIKI: i32 = 8;

/// Default content model for a title, from namespace and page-name suffix.
/// Site and user scripts only count in the interface namespace or on user
/// subpages; everywhere else the suffix is just part of the name.
pub fn default_model_for(namespace: i32, dbkey: &str) -> &'static str {
    let script_page = namespace == NS_MEDIAWIKI || (namespace == NS_USER && dbkey.contains('/'));
    if script_page {
        if dbkey.ends_with(".js") {
            return MODEL_JAVASCRIPT;
        }
        if dbkey.ends_with(".css") {
            return MODEL_CSS;
        }
        if dbkey.ends_with(".json") {
            return MODEL_JSON;
        }
    }
    MODEL_WIKITEXT
}

pub fn default_format_for(model: &str) -> &'static str {
    match model {
        MODEL_JAVASCRIPT => FORMAT_JAVASCRIPT,
        MODEL_CSS => FORMAT_CSS,
        MODEL_JSON => FORMAT_JSON,
        _ => FORMAT_WIKITEXT,
    }
}

/// Which table a backfill run walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillTable {
    Page,
    Revision,
    Archive,
}

impl BackfillTable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Revision => "revision",
            Self::Archive => "archive",
        }
    }
}

/// Column names for the two revision-shaped targets. Selected once per run;
/// no SQL is assembled from user input.
struct RevisionColumns {
    table: &'static str,
    cursor: &'static str,
    rev_id: &'static str,
    page_id: &'static str,
    namespace: &'static str,
    title: &'static str,
    model: &'static str,
    format: &'static str,
    from_clause: &'static str,
}

const REVISION_COLUMNS: RevisionColumns = RevisionColumns {
    table: "revision",
    cursor: "rev_id",
    rev_id: "rev_id",
    page_id: "rev_page",
    namespace: "page_namespace",
    title: "page_title",
    model: "rev_content_model",
    format: "rev_content_format",
    from_clause: "revision JOIN page ON rev_page = page_id",
};

const ARCHIVE_COLUMNS: RevisionColumns = RevisionColumns {
    table: "archive",
    cursor: "ar_id",
    rev_id: "ar_rev_id",
    page_id: "ar_page_id",
    namespace: "ar_namespace",
    title: "ar_title",
    model: "ar_content_model",
    format: "ar_content_format",
    from_clause: "archive",
};

/// Restrict a backfill run to one namespace, or walk them all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamespaceFilter {
    #[default]
    All,
    Only(i32),
}

impl FromStr for NamespaceFilter {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        value
            .parse::<i32>()
            .map(Self::Only)
            .map_err(|_| format!("expected a namespace number or \"all\", got {value:?}"))
    }
}

impl fmt::Display for NamespaceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Only(namespace) => write!(f, "{namespace}"),
        }
    }
}

/// Opaque resume cursor handed back to the caller; the walk restarts
/// strictly after the id it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeToken(pub u64);

impl FromStr for ResumeToken {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .parse::<u64>()
            .map(Self)
            .map_err(|_| format!("expected a numeric resume token, got {value:?}"))
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub table: BackfillTable,
    pub namespace: NamespaceFilter,
    pub batch_size: usize,
    pub throttle_ms: u64,
    pub resume: Option<ResumeToken>,
}

impl BackfillOptions {
    pub fn from_config(config: &BlobtrackConfig, table: BackfillTable) -> Self {
        Self {
            table,
            namespace: NamespaceFilter::All,
            batch_size: config.batch_size(),
            throttle_ms: 0,
            resume: None,
        }
    }

    fn start_cursor(&self) -> Result<i64> {
        match self.resume {
            Some(token) => i64::try_from(token.0).context("resume token does not fit into i64"),
            None => Ok(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub table: String,
    pub rows_updated: usize,
    pub immediate_updates: usize,
    pub batches_flushed: usize,
    pub caches_cleared: usize,
}

impl BackfillReport {
    fn new(table: BackfillTable) -> Self {
        Self {
            table: table.as_str().to_string(),
            rows_updated: 0,
            immediate_updates: 0,
            batches_flushed: 0,
            caches_cleared: 0,
        }
    }
}

/// Fill default content models (and formats, where safe) on legacy rows
/// that predate per-row model storage. Only rows whose model column is
/// NULL are ever touched.
pub fn backfill_content_model(
    paths: &ResolvedPaths,
    config: &BlobtrackConfig,
    options: &BackfillOptions,
    barrier: &mut dyn ReplicaBarrier,
    progress: &mut dyn ProgressSink,
) -> Result<BackfillReport> {
    let connection = store::open_local(&paths.db_path)?;
    store::init_local_schema(&connection)?;
    match options.table {
        BackfillTable::Page => backfill_pages(&connection, options, barrier, progress),
        BackfillTable::Revision => backfill_revision_rows(
            &connection,
            config,
            options,
            &REVISION_COLUMNS,
            barrier,
            progress,
        ),
        BackfillTable::Archive => backfill_revision_rows(
            &connection,
            config,
            options,
            &ARCHIVE_COLUMNS,
            barrier,
            progress,
        ),
    }
}

struct PageRow {
    page_id: i64,
    namespace: i32,
    title: String,
}

fn backfill_pages(
    connection: &Connection,
    options: &BackfillOptions,
    barrier: &mut dyn ReplicaBarrier,
    progress: &mut dyn ProgressSink,
) -> Result<BackfillReport> {
    progress.line("Finding pages without a content model...");
    let mut report = BackfillReport::new(BackfillTable::Page);
    let mut cursor = options.start_cursor()?;
    let mut to_save: BTreeMap<&'static str, Vec<i64>> = BTreeMap::new();

    loop {
        let rows = fetch_page_batch(connection, options, cursor)?;
        let Some(last) = rows.last() else {
            break;
        };
        cursor = last.page_id;

        for row in &rows {
            let model = default_model_for(row.namespace, &row.title);
            let ids = to_save.entry(model).or_default();
            ids.push(row.page_id);
            if ids.len() >= options.batch_size {
                let batch = std::mem::take(ids);
                flush_page_batch(connection, model, &batch, &mut report, barrier, progress)?;
            }
        }
        throttle_sleep(options.throttle_ms);
    }

    for (model, ids) in to_save {
        flush_page_batch(connection, model, &ids, &mut report, barrier, progress)?;
    }

    progress.line(&format!("Done: updated {} page rows", report.rows_updated));
    Ok(report)
}

fn fetch_page_batch(
    connection: &Connection,
    options: &BackfillOptions,
    cursor: i64,
) -> Result<Vec<PageRow>> {
    let mut sql = String::from(
        "SELECT page_id, page_namespace, page_title FROM page
         WHERE page_content_model IS NULL AND page_id > ?",
    );
    let mut values: Vec<Value> = vec![Value::from(cursor)];
    if let NamespaceFilter::Only(namespace) = options.namespace {
        sql.push_str(" AND page_namespace = ?");
        values.push(Value::from(i64::from(namespace)));
    }
    sql.push_str(" ORDER BY page_id LIMIT ?");
    values.push(Value::from(
        i64::try_from(options.batch_size).context("batch size does not fit into i64")?,
    ));

    let mut statement = connection
        .prepare(&sql)
        .context("failed to prepare page backfill query")?;
    let rows = statement
        .query_map(params_from_iter(values), |row| {
            Ok(PageRow {
                page_id: row.get(0)?,
                namespace: row.get(1)?,
                title: row.get(2)?,
            })
        })
        .context("failed to run page backfill query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode page backfill row")?);
    }
    Ok(out)
}

fn flush_page_batch(
    connection: &Connection,
    model: &str,
    ids: &[i64],
    report: &mut BackfillReport,
    barrier: &mut dyn ReplicaBarrier,
    progress: &mut dyn ProgressSink,
) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE page SET page_content_model = ?
         WHERE page_id IN ({}) AND page_content_model IS NULL",
        placeholders(ids.len())
    );
    let mut values: Vec<Value> = vec![Value::from(model.to_string())];
    values.extend(ids.iter().map(|id| Value::from(*id)));
    let updated = connection
        .execute(&sql, params_from_iter(values))
        .context("failed to update page content models")?;

    report.rows_updated += updated;
    report.batches_flushed += 1;
    progress.line(&format!("page: updated {updated} rows to model {model}"));
    barrier.wait_for_replication()?;
    Ok(updated)
}

struct TargetRow {
    cursor_id: i64,
    rev_id: Option<i64>,
    page_id: Option<i64>,
    namespace: i32,
    title: String,
    format: Option<String>,
}

fn backfill_revision_rows(
    connection: &Connection,
    config: &BlobtrackConfig,
    options: &BackfillOptions,
    columns: &RevisionColumns,
    barrier: &mut dyn ReplicaBarrier,
    progress: &mut dyn ProgressSink,
) -> Result<BackfillReport> {
    progress.line(&format!(
        "Finding {} rows without a content model...",
        columns.table
    ));
    let wiki_id = config.wiki_id();
    let mut report = BackfillReport::new(options.table);
    let mut cursor = options.start_cursor()?;
    let mut to_save: BTreeMap<&'static str, Vec<i64>> = BTreeMap::new();
    let mut pending_purges: Vec<(i64, i64)> = Vec::new();

    loop {
        let rows = fetch_revision_batch(connection, options, columns, cursor)?;
        let Some(last) = rows.last() else {
            break;
        };
        cursor = last.cursor_id;

        for row in &rows {
            let model = default_model_for(row.namespace, &row.title);
            let default_format = default_format_for(model);
            let page_id = row.page_id.unwrap_or(0);
            let rev_id = row.rev_id.unwrap_or(0);

            match row.format.as_deref() {
                Some(format) if format != default_format => {
                    // The stored format contradicts the model we would pick,
                    // so setting the format too could corrupt rendering.
                    // Fill the model alone and leave the format for a human.
                    let sql = format!(
                        "UPDATE {} SET {} = ?1 WHERE {} = ?2 AND {} IS NULL",
                        columns.table, columns.model, columns.cursor, columns.model
                    );
                    let updated = connection
                        .execute(&sql, params![model, row.cursor_id])
                        .with_context(|| {
                            format!("failed to update {} row {}", columns.table, row.cursor_id)
                        })?;
                    report.rows_updated += updated;
                    report.immediate_updates += updated;
                    barrier.wait_for_replication()?;
                    cache::clear_revision_caches(connection, &wiki_id, page_id, rev_id)?;
                    report.caches_cleared += 1;
                    progress.line(&format!(
                        "{} row {}: format {} is not the default for {}, updated model only",
                        columns.table, row.cursor_id, format, model
                    ));
                }
                _ => {
                    let ids = to_save.entry(model).or_default();
                    ids.push(row.cursor_id);
                    pending_purges.push((page_id, rev_id));
                    if ids.len() >= options.batch_size {
                        let batch = std::mem::take(ids);
                        flush_revision_batch(
                            connection,
                            columns,
                            model,
                            &batch,
                            &mut report,
                            barrier,
                            progress,
                        )?;
                    }
                }
            }
        }
        throttle_sleep(options.throttle_ms);
    }

    for (model, ids) in to_save {
        flush_revision_batch(connection, columns, model, &ids, &mut report, barrier, progress)?;
    }

    // Batched rows get their caches dropped together, once everything is
    // flushed; the immediate path above already cleared its own.
    for (page_id, rev_id) in pending_purges {
        cache::clear_revision_caches(connection, &wiki_id, page_id, rev_id)?;
        report.caches_cleared += 1;
    }

    debug!(
        table = columns.table,
        rows = report.rows_updated,
        "content model backfill finished"
    );
    progress.line(&format!(
        "Done: updated {} {} rows",
        report.rows_updated, columns.table
    ));
    Ok(report)
}

fn fetch_revision_batch(
    connection: &Connection,
    options: &BackfillOptions,
    columns: &RevisionColumns,
    cursor: i64,
) -> Result<Vec<TargetRow>> {
    let mut sql = format!(
        "SELECT {}, {}, {}, {}, {}, {} FROM {}
         WHERE {} IS NULL AND {} > ?",
        columns.cursor,
        columns.rev_id,
        columns.page_id,
        columns.namespace,
        columns.title,
        columns.format,
        columns.from_clause,
        columns.model,
        columns.cursor,
    );
    let mut values: Vec<Value> = vec![Value::from(cursor)];
    if let NamespaceFilter::Only(namespace) = options.namespace {
        sql.push_str(&format!(" AND {} = ?", columns.namespace));
        values.push(Value::from(i64::from(namespace)));
    }
    sql.push_str(&format!(" ORDER BY {} LIMIT ?", columns.cursor));
    values.push(Value::from(
        i64::try_from(options.batch_size).context("batch size does not fit into i64")?,
    ));

    let mut statement = connection
        .prepare(&sql)
        .with_context(|| format!("failed to prepare {} backfill query", columns.table))?;
    let rows = statement
        .query_map(params_from_iter(values), |row| {
            Ok(TargetRow {
                cursor_id: row.get(0)?,
                rev_id: row.get(1)?,
                page_id: row.get(2)?,
                namespace: row.get(3)?,
                title: row.get(4)?,
                format: row.get(5)?,
            })
        })
        .with_context(|| format!("failed to run {} backfill query", columns.table))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.with_context(|| format!("failed to decode {} backfill row", columns.table))?);
    }
    Ok(out)
}

fn flush_revision_batch(
    connection: &Connection,
    columns: &RevisionColumns,
    model: &str,
    ids: &[i64],
    report: &mut BackfillReport,
    barrier: &mut dyn ReplicaBarrier,
    progress: &mut dyn ProgressSink,
) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE {} SET {} = ?, {} = ? WHERE {} IN ({}) AND {} IS NULL",
        columns.table,
        columns.model,
        columns.format,
        columns.cursor,
        placeholders(ids.len()),
        columns.model,
    );
    let mut values: Vec<Value> = vec![
        Value::from(model.to_string()),
        Value::from(default_format_for(model).to_string()),
    ];
    values.extend(ids.iter().map(|id| Value::from(*id)));
    let updated = connection
        .execute(&sql, params_from_iter(values))
        .with_context(|| format!("failed to update {} content models", columns.table))?;

    report.rows_updated += updated;
    report.batches_flushed += 1;
    progress.line(&format!(
        "{}: updated {updated} rows to model {model}",
        columns.table
    ));
    barrier.wait_for_replication()?;
    Ok(updated)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use rusqlite::{Connection, OptionalExtension};
    use tempfile::tempdir;

    use super::*;
    use crate::cache;
    use crate::config::BlobtrackConfig;
    use crate::maintenance::test_support::{CollectedProgress, CountingBarrier};
    use crate::runtime::{ResolvedPaths, test_paths};
    use crate::store::{init_local_schema, open_local};

    fn fixture(temp: &Path) -> (ResolvedPaths, BlobtrackConfig, Connection) {
        let paths = test_paths(temp);
        let connection = open_local(&paths.db_path).expect("open local");
        init_local_schema(&connection).expect("init schema");
        (paths, BlobtrackConfig::default(), connection)
    }

    fn insert_page(connection: &Connection, page_id: i64, namespace: i32, title: &str) {
        connection
            .execute(
                "INSERT INTO page (page_id, page_namespace, page_title) VALUES (?1, ?2, ?3)",
                params![page_id, namespace, title],
            )
            .expect("insert page");
    }

    fn insert_revision(
        connection: &Connection,
        rev_id: i64,
        page_id: i64,
        model: Option<&str>,
        format: Option<&str>,
    ) {
        connection
            .execute(
                "INSERT INTO revision (rev_id, rev_page, rev_content_model, rev_content_format)
                 VALUES (?1, ?2, ?3, ?4)",
                params![rev_id, page_id, model, format],
            )
            .expect("insert revision");
    }

    fn run_backfill(
        paths: &ResolvedPaths,
        config: &BlobtrackConfig,
        options: &BackfillOptions,
    ) -> (BackfillReport, CountingBarrier, CollectedProgress) {
        let mut barrier = CountingBarrier::default();
        let mut progress = CollectedProgress::default();
        let report = backfill_content_model(paths, config, options, &mut barrier, &mut progress)
            .expect("backfill");
        (report, barrier, progress)
    }

    #[test]
    fn model_defaults_follow_namespace_and_suffix() {
        assert_eq!(default_model_for(NS_MEDIAWIKI, "Common.js"), MODEL_JAVASCRIPT);
        assert_eq!(default_model_for(NS_MEDIAWIKI, "Vector.css"), MODEL_CSS);
        assert_eq!(default_model_for(NS_MEDIAWIKI, "Map.json"), MODEL_JSON);
        assert_eq!(default_model_for(NS_USER, "Alice/vector.js"), MODEL_JAVASCRIPT);
        // A user page that merely ends in .js is not a script subpage.
        assert_eq!(default_model_for(NS_USER, "Alice.js"), MODEL_WIKITEXT);
        assert_eq!(default_model_for(NS_MAIN, "Common.js"), MODEL_WIKITEXT);
        assert_eq!(default_model_for(NS_MAIN, "Ordinary page"), MODEL_WIKITEXT);
    }

    #[test]
    fn format_defaults_follow_the_model() {
        assert_eq!(default_format_for(MODEL_WIKITEXT), FORMAT_WIKITEXT);
        assert_eq!(default_format_for(MODEL_JAVASCRIPT), FORMAT_JAVASCRIPT);
        assert_eq!(default_format_for(MODEL_CSS), FORMAT_CSS);
        assert_eq!(default_format_for(MODEL_JSON), FORMAT_JSON);
    }

    #[test]
    fn namespace_filter_parses_all_and_numbers() {
        assert_eq!("all".parse::<NamespaceFilter>(), Ok(NamespaceFilter::All));
        assert_eq!("8".parse::<NamespaceFilter>(), Ok(NamespaceFilter::Only(8)));
        assert_eq!("-1".parse::<NamespaceFilter>(), Ok(NamespaceFilter::Only(-1)));
        assert!("eight".parse::<NamespaceFilter>().is_err());
    }

    #[test]
    fn page_backfill_groups_rows_by_model() {
        let temp = tempdir().expect("tempdir");
        let (paths, config, connection) = fixture(temp.path());
        insert_page(&connection, 1, NS_MEDIAWIKI, "Common.js");
        insert_page(&connection, 2, NS_MEDIAWIKI, "Vector.css");
        insert_page(&connection, 3, NS_MAIN, "Main_Page");
        insert_page(&connection, 4, NS_MAIN, "Other_Page");
        // Already has a model; must never be rewritten.
        connection
            .execute(
                "INSERT INTO page (page_id, page_namespace, page_title, page_content_model)
                 VALUES (5, 0, 'Typed', 'flow-board')",
                [],
            )
            .expect("insert typed page");

        let options = BackfillOptions::from_config(&config, BackfillTable::Page);
        let (report, _, _) = run_backfill(&paths, &config, &options);

        assert_eq!(report.rows_updated, 4);
        let model_of = |id: i64| -> Option<String> {
            connection
                .query_row(
                    "SELECT page_content_model FROM page WHERE page_id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .expect("model")
        };
        assert_eq!(model_of(1).as_deref(), Some(MODEL_JAVASCRIPT));
        assert_eq!(model_of(2).as_deref(), Some(MODEL_CSS));
        assert_eq!(model_of(3).as_deref(), Some(MODEL_WIKITEXT));
        assert_eq!(model_of(4).as_deref(), Some(MODEL_WIKITEXT));
        assert_eq!(model_of(5).as_deref(), Some("flow-board"));
    }

    #[test]
    fn revision_backfill_splits_on_stored_format() {
        let temp = tempdir().expect("tempdir");
        let (paths, config, connection) = fixture(temp.path());
        insert_page(&connection, 1, NS_MEDIAWIKI, "Common.js");
        insert_page(&connection, 2, NS_MAIN, "Ordinary");
        // Null model, null format: batched, both columns filled.
        insert_revision(&connection, 10, 2, None, None);
        // Null model, format matching the default: batched as well.
        insert_revision(&connection, 11, 2, None, Some(FORMAT_WIKITEXT));
        // Null model, format contradicting the default for a script page:
        // immediate single-row update that leaves the format alone.
        insert_revision(&connection, 12, 1, None, Some(FORMAT_WIKITEXT));
        for rev in [10i64, 11, 12] {
            let page = if rev == 12 { 1 } else { 2 };
            cache::put_cache_entry(
                &connection,
                &cache::revision_key("main", page, rev),
                b"cached",
            )
            .expect("seed cache");
        }

        let options = BackfillOptions::from_config(&config, BackfillTable::Revision);
        let (report, barrier, progress) = run_backfill(&paths, &config, &options);

        assert_eq!(report.rows_updated, 3);
        assert_eq!(report.immediate_updates, 1);
        assert_eq!(report.caches_cleared, 3);
        assert!(barrier.replication_waits >= 2);

        let row = |id: i64| -> (Option<String>, Option<String>) {
            connection
                .query_row(
                    "SELECT rev_content_model, rev_content_format FROM revision WHERE rev_id = ?1",
                    [id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .expect("row")
        };
        assert_eq!(
            row(10),
            (
                Some(MODEL_WIKITEXT.to_string()),
                Some(FORMAT_WIKITEXT.to_string())
            )
        );
        assert_eq!(
            row(11),
            (
                Some(MODEL_WIKITEXT.to_string()),
                Some(FORMAT_WIKITEXT.to_string())
            )
        );
        // Model filled, conflicting format untouched.
        assert_eq!(
            row(12),
            (
                Some(MODEL_JAVASCRIPT.to_string()),
                Some(FORMAT_WIKITEXT.to_string())
            )
        );
        assert!(
            progress
                .lines
                .iter()
                .any(|l| l.contains("updated model only"))
        );

        // Every seeded cache entry is gone afterwards.
        for rev in [10i64, 11, 12] {
            let page = if rev == 12 { 1 } else { 2 };
            let cached: Option<i64> = connection
                .query_row(
                    "SELECT 1 FROM objectcache WHERE keyname = ?1",
                    [cache::revision_key("main", page, rev)],
                    |row| row.get(0),
                )
                .optional()
                .expect("cache probe");
            assert_eq!(cached, None, "cache for revision {rev} must be cleared");
        }
    }

    #[test]
    fn archive_backfill_uses_archive_columns() {
        let temp = tempdir().expect("tempdir");
        let (paths, config, connection) = fixture(temp.path());
        connection
            .execute(
                "INSERT INTO archive (ar_id, ar_namespace, ar_title, ar_page_id, ar_rev_id)
                 VALUES (1, 8, 'Gadget.css', 40, 400)",
                [],
            )
            .expect("insert archive");
        // Deleted long ago; no page or revision id survives.
        connection
            .execute(
                "INSERT INTO archive (ar_id, ar_namespace, ar_title, ar_page_id, ar_rev_id)
                 VALUES (2, 0, 'Old_Article', NULL, NULL)",
                [],
            )
            .expect("insert bare archive");

        let options = BackfillOptions::from_config(&config, BackfillTable::Archive);
        let (report, _, _) = run_backfill(&paths, &config, &options);

        assert_eq!(report.rows_updated, 2);
        let model: Option<String> = connection
            .query_row(
                "SELECT ar_content_model FROM archive WHERE ar_id = 1",
                [],
                |row| row.get(0),
            )
            .expect("model");
        assert_eq!(model.as_deref(), Some(MODEL_CSS));
        let format: Option<String> = connection
            .query_row(
                "SELECT ar_content_format FROM archive WHERE ar_id = 2",
                [],
                |row| row.get(0),
            )
            .expect("format");
        assert_eq!(format.as_deref(), Some(FORMAT_WIKITEXT));
    }

    #[test]
    fn resume_token_skips_rows_at_or_below_the_cursor() {
        let temp = tempdir().expect("tempdir");
        let (paths, config, connection) = fixture(temp.path());
        insert_page(&connection, 1, NS_MAIN, "First");
        insert_page(&connection, 2, NS_MAIN, "Second");

        let mut options = BackfillOptions::from_config(&config, BackfillTable::Page);
        options.resume = Some(ResumeToken(1));
        let (report, _, _) = run_backfill(&paths, &config, &options);

        assert_eq!(report.rows_updated, 1);
        let first: Option<String> = connection
            .query_row(
                "SELECT page_content_model FROM page WHERE page_id = 1",
                [],
                |row| row.get(0),
            )
            .expect("first");
        assert_eq!(first, None);
    }

    #[test]
    fn namespace_filter_limits_the_walk() {
        let temp = tempdir().expect("tempdir");
        let (paths, config, connection) = fixture(temp.path());
        insert_page(&connection, 1, NS_MEDIAWIKI, "Common.js");
        insert_page(&connection, 2, NS_MAIN, "Untouched");

        let mut options = BackfillOptions::from_config(&config, BackfillTable::Page);
        options.namespace = NamespaceFilter::Only(NS_MEDIAWIKI);
        let (report, _, _) = run_backfill(&paths, &config, &options);

        assert_eq!(report.rows_updated, 1);
        let untouched: Option<String> = connection
            .query_row(
                "SELECT page_content_model FROM page WHERE page_id = 2",
                [],
                |row| row.get(0),
            )
            .expect("untouched");
        assert_eq!(untouched, None);
    }

    #[test]
    fn rerun_finds_nothing_left_to_do() {
        let temp = tempdir().expect("tempdir");
        let (paths, config, connection) = fixture(temp.path());
        insert_page(&connection, 1, NS_MAIN, "Page");

        let options = BackfillOptions::from_config(&config, BackfillTable::Page);
        let (first, _, _) = run_backfill(&paths, &config, &options);
        let (second, _, _) = run_backfill(&paths, &config, &options);

        assert_eq!(first.rows_updated, 1);
        assert_eq!(second.rows_updated, 0);
        assert_eq!(second.batches_flushed, 0);
    }
}
