use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

use crate::maintenance::{ProgressSink, ReplicaBarrier, throttle_sleep};
use crate::runtime::ResolvedPaths;
use crate::store;

/// Updatelog key recording that a full populate run finished.
pub const CATEGORY_UPDATE_KEY: &str = "populate category";

pub const DEFAULT_CATEGORY_REPORT_INTERVAL: usize = 1000;

#[derive(Debug, Clone)]
pub struct CategoryPopulateOptions {
    /// Resume strictly after this category name.
    pub begin: Option<String>,
    pub report_interval: usize,
    pub throttle_ms: u64,
    /// Rerun even when the updatelog says the populate already finished.
    pub force: bool,
}

impl Default for CategoryPopulateOptions {
    fn default() -> Self {
        Self {
            begin: None,
            report_interval: DEFAULT_CATEGORY_REPORT_INTERVAL,
            throttle_ms: 0,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub refreshed: usize,
    pub already_done: bool,
}

/// Walk every distinct category name referenced from categorylinks and
/// recount its members. The walk holds no long-lived cursor: each step
/// fetches the next name strictly above the previous one, so concurrent
/// inserts and deletes cannot derail it.
pub fn populate_categories(
    paths: &ResolvedPaths,
    options: &CategoryPopulateOptions,
    barrier: &mut dyn ReplicaBarrier,
    progress: &mut dyn ProgressSink,
) -> Result<CategoryReport> {
    let connection = store::open_local(&paths.db_path)?;
    store::init_local_schema(&connection)?;

    if !options.force && store::update_logged(&connection, CATEGORY_UPDATE_KEY)? {
        progress.line("Category table already populated; use --force to rerun");
        return Ok(CategoryReport {
            refreshed: 0,
            already_done: true,
        });
    }

    let report_interval = options.report_interval.max(1);
    let mut cursor = options.begin.clone().unwrap_or_default();
    let mut refreshed = 0usize;
    loop {
        let next: Option<String> = connection
            .query_row(
                "SELECT cl_to FROM categorylinks WHERE cl_to > ?1 ORDER BY cl_to LIMIT 1",
                params![cursor],
                |row| row.get(0),
            )
            .optional()
            .context("failed to fetch next category name")?;
        let Some(name) = next else {
            break;
        };

        refresh_category_counts(&connection, &name)?;
        refreshed += 1;
        cursor = name;

        if refreshed % report_interval == 0 {
            progress.line(&format!("{refreshed} categories processed (up to {cursor})"));
            barrier.wait_for_replication()?;
        }
        throttle_sleep(options.throttle_ms);
    }

    store::log_update(&connection, CATEGORY_UPDATE_KEY)?;
    debug!(refreshed, "category populate finished");
    progress.line(&format!("Done: refreshed {refreshed} categories"));
    Ok(CategoryReport {
        refreshed,
        already_done: false,
    })
}

/// Recount one category from its membership rows and upsert the totals.
/// `cat_pages` counts every member, subcategories and files included.
pub fn refresh_category_counts(connection: &Connection, name: &str) -> Result<()> {
    let (total, subcats, files): (i64, i64, i64) = connection
        .query_row(
            "SELECT COUNT(*),
                    IFNULL(SUM(cl_type = 'subcat'), 0),
                    IFNULL(SUM(cl_type = 'file'), 0)
             FROM categorylinks WHERE cl_to = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .with_context(|| format!("failed to count members of category {name}"))?;

    connection
        .execute(
            "INSERT INTO category (cat_title, cat_pages, cat_subcats, cat_files)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cat_title) DO UPDATE SET
                 cat_pages = excluded.cat_pages,
                 cat_subcats = excluded.cat_subcats,
                 cat_files = excluded.cat_files",
            params![name, total, subcats, files],
        )
        .with_context(|| format!("failed to upsert category {name}"))?;
    Ok(())
}
