use anyhow::{Context, Result};
use rusqlite::{Connection, params};

/// Cache key for the resolved content model of one revision.
pub fn content_model_key(rev_id: i64) -> String {
    format!("page-content-model:{rev_id}")
}

/// Cache key for a materialized revision object.
pub fn revision_key(wiki_id: &str, page_id: i64, rev_id: i64) -> String {
    format!("revision:{wiki_id}:{page_id}:{rev_id}")
}

/// Drop one key from the object cache. Missing keys are a no-op.
pub fn invalidate_key(connection: &Connection, key: &str) -> Result<()> {
    connection
        .execute("DELETE FROM objectcache WHERE keyname = ?1", [key])
        .with_context(|| format!("failed to invalidate cache key {key}"))?;
    Ok(())
}

/// Invalidate both derived keys for a revision after its content-model or
/// format changed.
pub fn clear_revision_caches(
    connection: &Connection,
    wiki_id: &str,
    page_id: i64,
    rev_id: i64,
) -> Result<()> {
    invalidate_key(connection, &content_model_key(rev_id))?;
    invalidate_key(connection, &revision_key(wiki_id, page_id, rev_id))?;
    Ok(())
}

/// Seed a cache entry. Only maintenance fixtures and tests write the cache;
/// production code here only invalidates.
pub fn put_cache_entry(connection: &Connection, key: &str, value: &[u8]) -> Result<()> {
    connection
        .execute(
            "INSERT INTO objectcache (keyname, value, exptime) VALUES (?1, ?2, 0)
             ON CONFLICT(keyname) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("failed to store cache key {key}"))?;
    Ok(())
}
