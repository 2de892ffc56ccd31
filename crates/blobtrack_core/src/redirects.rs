use std::collections::HashSet;

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, warn};

use crate::content_model::default_model_for;
use crate::error::StoreError;
use crate::maintenance::{ProgressSink, ReplicaBarrier};
use crate::runtime::ResolvedPaths;
use crate::store;

/// Marker that pins a redirect in place even when its target is moved.
pub const STATIC_REDIRECT_MARKER: &str = "__STATICREDIRECT__";

/// Canonical names for the built-in namespaces, dbkey form.
const NAMESPACE_NAMES: &[(i32, &str)] = &[
    (0, ""),
    (1, "Talk"),
    (2, "User"),
    (3, "User_talk"),
    (4, "Project"),
    (5, "Project_talk"),
    (6, "File"),
    (7, "File_talk"),
    (8, "MediaWiki"),
    (9, "MediaWiki_talk"),
    (10, "Template"),
    (11, "Template_talk"),
    (12, "Help"),
    (13, "Help_talk"),
    (14, "Category"),
    (15, "Category_talk"),
];

fn namespace_name(namespace: i32) -> Option<&'static str> {
    NAMESPACE_NAMES
        .iter()
        .find(|(id, _)| *id == namespace)
        .map(|(_, name)| *name)
}

fn namespace_by_name(name: &str) -> Option<i32> {
    let wanted = name.trim().replace(' ', "_");
    NAMESPACE_NAMES
        .iter()
        .find(|(_, candidate)| !candidate.is_empty() && candidate.eq_ignore_ascii_case(&wanted))
        .map(|(id, _)| *id)
}

/// A wiki page title in storage form: numeric namespace plus an
/// underscore-separated dbkey, optionally carrying a fragment and an
/// interwiki prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Title {
    pub namespace: i32,
    pub dbkey: String,
    pub fragment: Option<String>,
    pub interwiki: Option<String>,
}

impl Title {
    pub fn new(namespace: i32, text: &str) -> Self {
        Self {
            namespace,
            dbkey: normalize_dbkey(text),
            fragment: None,
            interwiki: None,
        }
    }

    pub fn is_external(&self) -> bool {
        self.interwiki.as_deref().is_some_and(|iw| !iw.is_empty())
    }

    /// Identity of the page this title names, fragment excluded. Used for
    /// visited sets and same-page comparisons.
    pub fn page_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.interwiki.as_deref().unwrap_or(""),
            self.namespace,
            self.dbkey
        )
    }

    fn same_page(&self, other: &Title) -> bool {
        self.page_key() == other.page_key()
    }

    /// Human form used in wikitext links and progress output.
    pub fn prefixed_text(&self) -> String {
        let mut out = String::new();
        if let Some(interwiki) = self.interwiki.as_deref()
            && !interwiki.is_empty()
        {
            out.push_str(interwiki);
            out.push(':');
        }
        if let Some(name) = namespace_name(self.namespace)
            && !name.is_empty()
        {
            out.push_str(&name.replace('_', " "));
            out.push(':');
        }
        out.push_str(&self.dbkey.replace('_', " "));
        if let Some(fragment) = self.fragment.as_deref()
            && !fragment.is_empty()
        {
            out.push('#');
            out.push_str(fragment);
        }
        out
    }
}

/// Title text to dbkey: trimmed, spaces collapsed to underscores, first
/// letter capitalized.
fn normalize_dbkey(text: &str) -> String {
    let collapsed = text.trim().replace(' ', "_");
    let mut chars = collapsed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Parse link-target text (`User:Foo bar#Section`) into a `Title`. Unknown
/// prefixes stay part of the page name, as they would on a wiki without
/// that namespace.
pub fn parse_title(text: &str) -> Title {
    let (body, fragment) = match text.split_once('#') {
        Some((body, fragment)) => (body, non_empty(fragment.trim())),
        None => (text, None),
    };
    let body = body.trim();
    let body = body.strip_prefix(':').unwrap_or(body).trim();
    if let Some((prefix, rest)) = body.split_once(':')
        && let Some(namespace) = namespace_by_name(prefix)
    {
        let mut title = Title::new(namespace, rest);
        title.fragment = fragment;
        return title;
    }
    let mut title = Title::new(0, body);
    title.fragment = fragment;
    title
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Extract the target of redirect wikitext, or `None` when the content is
/// not a redirect at all.
pub fn parse_redirect_content(content: &str) -> Option<Title> {
    let trimmed = content.trim_start();
    if !trimmed.to_ascii_lowercase().starts_with("#redirect") {
        return None;
    }
    let open = trimmed.find("[[")?;
    let close = trimmed[open..].find("]]")? + open;
    let inner = &trimmed[open + 2..close];
    let target = inner.split('|').next().unwrap_or(inner);
    if target.trim().is_empty() {
        return None;
    }
    Some(parse_title(target))
}

pub fn is_static_redirect(content: &str) -> bool {
    content.contains(STATIC_REDIRECT_MARKER)
}

/// Rewrite the first link of redirect content to point at `new_target`,
/// keeping any pipe label and everything after the link.
pub fn update_redirect_content(content: &str, new_target: &str) -> Option<String> {
    let open = content.find("[[")?;
    let close = content[open..].find("]]")? + open;
    let inner = &content[open + 2..close];
    let replacement = match inner.split_once('|') {
        Some((_, label)) => format!("{new_target}|{label}"),
        None => new_target.to_string(),
    };
    Some(format!(
        "{}[[{}]]{}",
        &content[..open],
        replacement,
        &content[close + 2..]
    ))
}

/// Walk the redirect chain starting at `start` and return the final
/// destination, or `None` when `start` is not a redirect. A revisited page
/// means the chain is circular and fails with `StoreError::CircularRedirect`.
///
/// Each page is looked up exactly once, so a chain of length N costs N
/// queries.
pub fn resolve_final_destination(connection: &Connection, start: &Title) -> Result<Option<Title>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut current = start.clone();
    let mut destination: Option<Title> = None;
    loop {
        if !seen.insert(current.page_key()) {
            return Err(StoreError::CircularRedirect(start.prefixed_text()).into());
        }
        if current.is_external() {
            // An interwiki target cannot be followed locally; assume it is
            // the end of the chain.
            break;
        }
        match lookup_redirect_row(connection, &current)? {
            Some(next) => {
                destination = Some(next.clone());
                current = next;
            }
            None => break,
        }
    }
    Ok(destination)
}

/// Resolve a redirect chain by title, for the CLI.
pub fn resolve_redirect(
    paths: &ResolvedPaths,
    namespace: i32,
    title: &str,
) -> Result<Option<Title>> {
    let connection = store::open_local(&paths.db_path)?;
    store::init_local_schema(&connection)?;
    resolve_final_destination(&connection, &Title::new(namespace, title))
}

fn lookup_redirect_row(connection: &Connection, title: &Title) -> Result<Option<Title>> {
    connection
        .query_row(
            "SELECT rd_namespace, rd_title, rd_interwiki
             FROM redirect JOIN page ON rd_from = page_id
             WHERE page_namespace = ?1 AND page_title = ?2",
            params![title.namespace, title.dbkey],
            |row| {
                Ok(Title {
                    namespace: row.get(0)?,
                    dbkey: row.get(1)?,
                    fragment: None,
                    interwiki: row.get::<_, Option<String>>(2)?.filter(|iw| !iw.is_empty()),
                })
            },
        )
        .optional()
        .context("failed to look up redirect row")
}

#[derive(Debug, Clone)]
pub struct FixRedirectOptions {
    /// The moved page: every redirect whose stored target is this title is
    /// a retarget candidate.
    pub namespace: i32,
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedirectFixReport {
    pub target: String,
    pub candidates: usize,
    pub fixed: usize,
    pub already_correct: usize,
    pub skipped: usize,
    pub failed: Vec<String>,
}

enum FixOutcome {
    Fixed { destination: String },
    AlreadyCorrect,
    Skipped { reason: String },
}

struct RedirectSource {
    page_id: i64,
    namespace: i32,
    title: String,
}

impl RedirectSource {
    fn display(&self) -> String {
        Title::new(self.namespace, &self.title).prefixed_text()
    }
}

/// Retarget every redirect pointing at the moved page so it skips the
/// intermediate hop. One broken source never aborts the rest.
pub fn fix_double_redirects(
    paths: &ResolvedPaths,
    options: &FixRedirectOptions,
    barrier: &mut dyn ReplicaBarrier,
    progress: &mut dyn ProgressSink,
) -> Result<RedirectFixReport> {
    let mut connection = store::open_local(&paths.db_path)?;
    store::init_local_schema(&connection)?;

    let moved = Title::new(options.namespace, &options.title);
    let sources = fetch_redirect_sources(&connection, &moved)?;
    progress.line(&format!(
        "Fixing double redirects through {}",
        moved.prefixed_text()
    ));

    let mut report = RedirectFixReport {
        target: moved.prefixed_text(),
        candidates: sources.len(),
        fixed: 0,
        already_correct: 0,
        skipped: 0,
        failed: Vec::new(),
    };

    for source in sources {
        match fix_one(&mut connection, &moved, &source) {
            Ok(FixOutcome::Fixed { destination }) => {
                report.fixed += 1;
                progress.line(&format!("{}: retargeted to {destination}", source.display()));
                barrier.wait_for_replication()?;
            }
            Ok(FixOutcome::AlreadyCorrect) => {
                report.already_correct += 1;
                progress.line(&format!(
                    "{}: already points at the final destination",
                    source.display()
                ));
            }
            Ok(FixOutcome::Skipped { reason }) => {
                report.skipped += 1;
                progress.line(&format!("{}: skipped, {reason}", source.display()));
            }
            Err(error) => {
                warn!(source = source.display(), "failed to fix redirect: {error:#}");
                report.failed.push(format!("{}: {error:#}", source.display()));
            }
        }
    }

    progress.line(&format!(
        "Fixed {} of {} double redirects",
        report.fixed, report.candidates
    ));
    Ok(report)
}

fn fetch_redirect_sources(connection: &Connection, moved: &Title) -> Result<Vec<RedirectSource>> {
    let mut statement = connection
        .prepare(
            "SELECT page_id, page_namespace, page_title
             FROM redirect JOIN page ON rd_from = page_id
             WHERE rd_namespace = ?1 AND rd_title = ?2
               AND (rd_interwiki IS NULL OR rd_interwiki = '')
             ORDER BY page_id",
        )
        .context("failed to prepare redirect source query")?;
    let rows = statement
        .query_map(params![moved.namespace, moved.dbkey], |row| {
            Ok(RedirectSource {
                page_id: row.get(0)?,
                namespace: row.get(1)?,
                title: row.get(2)?,
            })
        })
        .context("failed to run redirect source query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode redirect source row")?);
    }
    Ok(out)
}

fn fix_one(
    connection: &mut Connection,
    moved: &Title,
    source: &RedirectSource,
) -> Result<FixOutcome> {
    let Some(content) = load_latest_content(connection, source.page_id)? else {
        return Ok(FixOutcome::Skipped {
            reason: "no loadable content".to_string(),
        });
    };
    let Some(current_target) = parse_redirect_content(&content) else {
        return Ok(FixOutcome::Skipped {
            reason: "content is no longer a redirect".to_string(),
        });
    };
    if is_static_redirect(&content) {
        return Ok(FixOutcome::Skipped {
            reason: "marked as a static redirect".to_string(),
        });
    }

    let destination = resolve_final_destination(connection, moved)?;
    let Some(destination) = destination else {
        return Ok(FixOutcome::Skipped {
            reason: "no longer a double redirect".to_string(),
        });
    };

    if destination.same_page(&current_target) {
        // The content was fixed out from under the stale redirect row; the
        // next page save will freshen the row, nothing to do here.
        return Ok(FixOutcome::AlreadyCorrect);
    }
    if !current_target.same_page(moved) {
        // The content points somewhere else entirely; rewriting it to our
        // destination would clobber a legitimate retarget.
        return Ok(FixOutcome::Skipped {
            reason: format!(
                "content points at {}, not {}",
                current_target.prefixed_text(),
                moved.prefixed_text()
            ),
        });
    }

    // Keep the fragment the old content carried; the chain itself never
    // contributes one.
    let new_target = Title {
        namespace: destination.namespace,
        dbkey: destination.dbkey.clone(),
        fragment: current_target.fragment.clone(),
        interwiki: destination.interwiki.clone(),
    };
    let new_content = build_rewritten_content(&content, &new_target)?;
    let rev_id = save_redirect_edit(connection, source, &new_content, &new_target)?;
    debug!(
        source = source.display(),
        destination = new_target.prefixed_text(),
        rev_id,
        "retargeted double redirect"
    );
    Ok(FixOutcome::Fixed {
        destination: new_target.prefixed_text(),
    })
}

fn build_rewritten_content(content: &str, new_target: &Title) -> Result<String> {
    let rendered = new_target.prefixed_text();
    let new_content = update_redirect_content(content, &rendered)
        .ok_or_else(|| anyhow!("redirect content has no link to rewrite"))?;
    if new_content == content {
        return Err(StoreError::ConcurrentModification(format!(
            "rewrite to {rendered} left the content unchanged"
        ))
        .into());
    }
    Ok(new_content)
}

fn load_latest_content(connection: &Connection, page_id: i64) -> Result<Option<String>> {
    let role_id = store::main_role_id(connection)?;
    let row = connection
        .query_row(
            "SELECT old_text, old_flags FROM page
             JOIN revision ON rev_id = page_latest
             JOIN slots ON slot_revision_id = rev_id AND slot_role_id = ?2
             JOIN content ON content_id = slot_content_id
                 AND substr(content_address, 1, 3) = 'tt:'
             JOIN text ON old_id = CAST(substr(content_address, 4) AS INTEGER)
             WHERE page_id = ?1",
            params![page_id, role_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                ))
            },
        )
        .optional()
        .context("failed to load latest page content")?;
    match row {
        Some((_, flags)) if flags.contains("external") => Err(anyhow!(
            "externally stored redirect content cannot be rewritten in place"
        )),
        Some((text, _)) => Ok(Some(text)),
        None => Ok(None),
    }
}

/// Persist the retargeted redirect as a regular edit: new text, content and
/// revision rows, page head moved forward, redirect row refreshed. One
/// transaction, so a failure leaves the page untouched.
fn save_redirect_edit(
    connection: &mut Connection,
    source: &RedirectSource,
    new_content: &str,
    new_target: &Title,
) -> Result<i64> {
    let role_id = store::main_role_id(connection)?;
    let now = store::unix_timestamp()?;
    let model = default_model_for(source.namespace, &source.title);

    let transaction = connection
        .transaction()
        .context("failed to start redirect edit transaction")?;
    transaction
        .execute(
            "INSERT INTO text (old_text, old_flags) VALUES (?1, 'utf-8')",
            params![new_content],
        )
        .context("failed to insert text row")?;
    let text_id = transaction.last_insert_rowid();
    transaction
        .execute(
            "INSERT INTO content (content_address) VALUES (?1)",
            params![format!("tt:{text_id}")],
        )
        .context("failed to insert content row")?;
    let content_id = transaction.last_insert_rowid();
    transaction
        .execute(
            "INSERT INTO revision (rev_page, rev_timestamp, rev_content_model)
             VALUES (?1, ?2, ?3)",
            params![source.page_id, now, model],
        )
        .context("failed to insert revision row")?;
    let rev_id = transaction.last_insert_rowid();
    transaction
        .execute(
            "INSERT INTO slots (slot_revision_id, slot_role_id, slot_content_id)
             VALUES (?1, ?2, ?3)",
            params![rev_id, role_id, content_id],
        )
        .context("failed to insert slot row")?;
    transaction
        .execute(
            "UPDATE page SET page_latest = ?1, page_touched = ?2, page_is_redirect = 1
             WHERE page_id = ?3",
            params![rev_id, now, source.page_id],
        )
        .context("failed to advance page head")?;
    transaction
        .execute(
            "INSERT INTO redirect (rd_from, rd_namespace, rd_title, rd_interwiki, rd_fragment)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(rd_from) DO UPDATE SET
                 rd_namespace = excluded.rd_namespace,
                 rd_title = excluded.rd_title,
                 rd_interwiki = excluded.rd_interwiki,
                 rd_fragment = excluded.rd_fragment",
            params![
                source.page_id,
                new_target.namespace,
                new_target.dbkey,
                new_target.interwiki,
                new_target.fragment,
            ],
        )
        .context("failed to refresh redirect row")?;
    transaction
        .commit()
        .context("failed to commit redirect edit")?;
    Ok(rev_id)
}
