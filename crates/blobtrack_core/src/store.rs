use std::fs;
use std::path::Path;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};

use crate::error::StoreError;

/// Slot role every tracked revision stores its content under.
pub const MAIN_SLOT_ROLE: &str = "main";

/// Source-of-truth and maintenance tables of the local wiki database.
const LOCAL_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS page (
    page_id INTEGER PRIMARY KEY,
    page_namespace INTEGER NOT NULL,
    page_title TEXT NOT NULL,
    page_is_redirect INTEGER NOT NULL DEFAULT 0,
    page_latest INTEGER NOT NULL DEFAULT 0,
    page_touched INTEGER NOT NULL DEFAULT 0,
    page_content_model TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_page_namespace_title ON page(page_namespace, page_title);

CREATE TABLE IF NOT EXISTS revision (
    rev_id INTEGER PRIMARY KEY,
    rev_page INTEGER NOT NULL,
    rev_timestamp INTEGER NOT NULL DEFAULT 0,
    rev_content_model TEXT,
    rev_content_format TEXT
);
CREATE INDEX IF NOT EXISTS idx_revision_page ON revision(rev_page);

CREATE TABLE IF NOT EXISTS slot_roles (
    role_id INTEGER PRIMARY KEY,
    role_name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS slots (
    slot_revision_id INTEGER NOT NULL,
    slot_role_id INTEGER NOT NULL,
    slot_content_id INTEGER NOT NULL,
    PRIMARY KEY (slot_revision_id, slot_role_id)
);

CREATE TABLE IF NOT EXISTS content (
    content_id INTEGER PRIMARY KEY,
    content_address TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS text (
    old_id INTEGER PRIMARY KEY,
    old_text TEXT NOT NULL,
    old_flags TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS redirect (
    rd_from INTEGER PRIMARY KEY,
    rd_namespace INTEGER NOT NULL,
    rd_title TEXT NOT NULL,
    rd_interwiki TEXT,
    rd_fragment TEXT
);
CREATE INDEX IF NOT EXISTS idx_redirect_target ON redirect(rd_namespace, rd_title);

CREATE TABLE IF NOT EXISTS archive (
    ar_id INTEGER PRIMARY KEY,
    ar_namespace INTEGER NOT NULL,
    ar_title TEXT NOT NULL,
    ar_page_id INTEGER,
    ar_rev_id INTEGER,
    ar_content_model TEXT,
    ar_content_format TEXT
);

CREATE TABLE IF NOT EXISTS categorylinks (
    cl_from INTEGER NOT NULL,
    cl_to TEXT NOT NULL,
    cl_type TEXT NOT NULL DEFAULT 'page',
    PRIMARY KEY (cl_from, cl_to)
);
CREATE INDEX IF NOT EXISTS idx_categorylinks_to ON categorylinks(cl_to);

CREATE TABLE IF NOT EXISTS category (
    cat_id INTEGER PRIMARY KEY AUTOINCREMENT,
    cat_title TEXT NOT NULL UNIQUE,
    cat_pages INTEGER NOT NULL DEFAULT 0,
    cat_subcats INTEGER NOT NULL DEFAULT 0,
    cat_files INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS updatelog (
    ul_key TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS objectcache (
    keyname TEXT PRIMARY KEY,
    value BLOB,
    exptime INTEGER
);
"#;

/// Derived tracking index tables. Dropped and recreated by every tracking
/// run; nothing here is authoritative.
const TRACKING_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS blob_tracking (
    bt_page INTEGER NOT NULL,
    bt_rev_id INTEGER NOT NULL,
    bt_text_id INTEGER NOT NULL,
    bt_cluster TEXT NOT NULL,
    bt_blob_id INTEGER NOT NULL,
    bt_cgz_hash TEXT,
    PRIMARY KEY (bt_rev_id, bt_text_id)
);
CREATE INDEX IF NOT EXISTS idx_blob_tracking_text ON blob_tracking(bt_text_id);
CREATE INDEX IF NOT EXISTS idx_blob_tracking_cluster ON blob_tracking(bt_cluster, bt_blob_id);

CREATE TABLE IF NOT EXISTS blob_orphans (
    bo_cluster TEXT NOT NULL,
    bo_blob_id INTEGER NOT NULL,
    PRIMARY KEY (bo_cluster, bo_blob_id)
);
"#;

/// Physical blob table of one external storage cluster.
const CLUSTER_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS blobs (
    blob_id INTEGER PRIMARY KEY,
    blob_text BLOB
);
"#;

/// Open (creating if needed) the local wiki database with the standard
/// pragmas.
pub fn open_local(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    apply_pragmas(&connection)?;
    Ok(connection)
}

/// Open a cluster database read-only. The create flag is deliberately left
/// out: a cluster file that is not there is an unavailable cluster, and the
/// scan must not conjure an empty one.
pub fn open_cluster(cluster: &str, db_path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let connection = Connection::open_with_flags(db_path, flags)
        .map_err(|error| StoreError::cluster_unavailable(cluster, error.to_string()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    Ok(connection)
}

fn apply_pragmas(connection: &Connection) -> Result<()> {
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(())
}

/// Apply the local schema and register the main slot role. Idempotent.
pub fn init_local_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(LOCAL_SCHEMA_SQL)
        .context("failed to apply local schema")?;
    connection
        .execute_batch(TRACKING_SCHEMA_SQL)
        .context("failed to apply tracking schema")?;
    connection
        .execute(
            "INSERT OR IGNORE INTO slot_roles (role_id, role_name) VALUES (1, ?1)",
            [MAIN_SLOT_ROLE],
        )
        .context("failed to register main slot role")?;
    Ok(())
}

/// Drop and recreate the derived tracking tables.
pub fn reset_tracking_tables(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "DROP TABLE IF EXISTS blob_tracking;\nDROP TABLE IF EXISTS blob_orphans;",
        )
        .context("failed to drop tracking tables")?;
    connection
        .execute_batch(TRACKING_SCHEMA_SQL)
        .context("failed to recreate tracking tables")?;
    Ok(())
}

/// Create an empty cluster database with its blobs table. Used by `init` for
/// configured clusters that do not exist yet, and by tests building fixtures.
pub fn create_cluster_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .execute_batch(CLUSTER_SCHEMA_SQL)
        .context("failed to apply cluster schema")?;
    Ok(connection)
}

pub fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

pub fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}

/// Numeric id of the main slot role.
pub fn main_role_id(connection: &Connection) -> Result<i64> {
    connection
        .query_row(
            "SELECT role_id FROM slot_roles WHERE role_name = ?1",
            [MAIN_SLOT_ROLE],
            |row| row.get(0),
        )
        .context("main slot role is not registered; run `blobtrack init`")
}

/// Whether a one-shot maintenance update already ran to completion.
pub fn update_logged(connection: &Connection, update_key: &str) -> Result<bool> {
    let logged: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM updatelog WHERE ul_key = ?1)",
            [update_key],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check updatelog for {update_key}"))?;
    Ok(logged == 1)
}

/// Record a completed one-shot maintenance update.
pub fn log_update(connection: &Connection, update_key: &str) -> Result<()> {
    connection
        .execute(
            "INSERT OR IGNORE INTO updatelog (ul_key) VALUES (?1)",
            [update_key],
        )
        .with_context(|| format!("failed to record updatelog entry {update_key}"))?;
    Ok(())
}

pub fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}
