//! Keeps a path's ancestor chain present and linked.
//!
//! [`ensure_ancestors`] is the only place that writes `parent_id` for
//! ancestors; [`prune_empty_ancestors`] is its counterpart that removes
//! placeholders once nothing hangs below them.
//!
//! Every function here works on whatever connection or transaction it is
//! handed and never opens its own transaction. Only attached pages (see
//! [`PageQueryBuilder::attached`]) count as tree nodes.

use rusqlite::Connection;
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::error::is_constraint_violation;
use crate::core::grant::GRANT_RESTRICTED;
use crate::core::path_utils::{self, ROOT_PATH};
use crate::core::query::{self, PageQueryBuilder};
use crate::{Grant, PageStatus, PageTreeError, Result};

/// Returns the id of `path`'s direct parent, creating empty placeholders for
/// every missing ancestor and wiring their `parent_id` links root-to-leaf.
///
/// The common case (parent already present and linked) is a single lookup.
///
/// # Errors
///
/// Returns [`PageTreeError::InvalidOperation`] for the root path,
/// [`PageTreeError::NotFound`] if the root page itself is missing, or
/// [`PageTreeError::Database`] for any SQLite failure other than a
/// duplicate-path race, which is absorbed.
pub fn ensure_ancestors(conn: &Connection, path: &str, now: i64) -> Result<String> {
    let parent_path = path_utils::parent_of(path)?;

    let parent = PageQueryBuilder::new()
        .attached()
        .with_path(&parent_path)
        .fetch_one(conn)?;
    if let Some(parent) = parent {
        // an unlinked placeholder left by an interrupted fill is repaired below
        if path_utils::is_root(&parent.path) || parent.parent_id.is_some() {
            return Ok(parent.id);
        }
        log::debug!("ancestor {} has no parent link, re-linking chain", parent.path);
    }

    let ancestor_paths = path_utils::ancestor_chain(path);
    create_empty_pages(conn, &ancestor_paths, now)?;

    let ancestors = PageQueryBuilder::new()
        .attached()
        .by_paths(&ancestor_paths)
        .sort_ancestors()
        .fetch(conn)?;

    let ids: HashMap<&str, &str> = ancestors
        .iter()
        .map(|page| (page.path.as_str(), page.id.as_str()))
        .collect();

    let mut link = conn.prepare(&format!(
        "UPDATE pages SET parent_id = ?1 WHERE path = ?2 AND status = 'published' AND grant_code <> {GRANT_RESTRICTED}"
    ))?;
    for page in ancestors.iter().filter(|p| !path_utils::is_root(&p.path)) {
        let page_parent = path_utils::parent_of(&page.path)?;
        let parent_id = ids
            .get(page_parent.as_str())
            .ok_or_else(|| PageTreeError::NotFound(format!("ancestor {page_parent}")))?;
        link.execute(rusqlite::params![parent_id, page.path])?;
    }

    ids.get(parent_path.as_str())
        .map(|id| id.to_string())
        .ok_or_else(|| PageTreeError::NotFound(format!("ancestor {parent_path}")))
}

/// Inserts empty placeholder pages for those of `paths` that do not exist yet.
///
/// Existing paths are found with one query. A unique-path violation means a
/// concurrent writer created the same ancestor first; it is logged and skipped.
fn create_empty_pages(conn: &Connection, paths: &[String], now: i64) -> Result<usize> {
    let existing: Vec<String> = PageQueryBuilder::new()
        .attached()
        .by_paths(paths)
        .fetch(conn)?
        .into_iter()
        .map(|page| page.path)
        .collect();

    if !existing.iter().any(|p| p == ROOT_PATH) {
        return Err(PageTreeError::NotFound("root page".to_string()));
    }

    let mut insert = conn.prepare(
        "INSERT INTO pages (id, path, parent_id, is_empty, grant_code, status, created_at, updated_at)
         VALUES (?1, ?2, NULL, 1, ?3, ?4, ?5, ?5)",
    )?;
    let mut created = 0;
    for path in paths.iter().filter(|p| !existing.contains(p)) {
        let id = Uuid::new_v4().to_string();
        match insert.execute(rusqlite::params![
            id,
            path,
            Grant::Public.code(),
            PageStatus::Published.as_str(),
            now
        ]) {
            Ok(_) => created += 1,
            Err(e) if is_constraint_violation(&e) => {
                log::warn!("placeholder {path} was created concurrently, reusing it");
            }
            Err(e) => return Err(e.into()),
        }
    }
    if created > 0 {
        log::debug!("created {created} empty ancestor page(s)");
    }
    Ok(created)
}

/// Inserts a single empty page at `path` under `parent_id` and returns its id.
///
/// Used where a page leaves its path but its children stay behind.
pub(crate) fn insert_placeholder(conn: &Connection, path: &str, parent_id: &str, now: i64) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO pages (id, path, parent_id, is_empty, grant_code, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?6)",
        rusqlite::params![id, path, parent_id, Grant::Public.code(), PageStatus::Published.as_str(), now],
    )?;
    log::debug!("left placeholder at {path}");
    Ok(id)
}

/// Re-parents every child of `from_id` onto `to_id`. `to_id` itself is never
/// made its own child.
pub(crate) fn adopt_children(conn: &Connection, from_id: &str, to_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE pages SET parent_id = ?1 WHERE parent_id = ?2 AND status = 'published' AND id <> ?1",
        rusqlite::params![to_id, from_id],
    )?)
}

/// Like [`adopt_children`], limited to children whose path lies below `prefix`.
pub(crate) fn adopt_children_below(conn: &Connection, from_id: &str, to_id: &str, prefix: &str) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE pages SET parent_id = ?1
          WHERE parent_id = ?2 AND status = 'published' AND id <> ?1 AND path LIKE ?3 ESCAPE '\\'",
        rusqlite::params![to_id, from_id, query::descendant_pattern(prefix)],
    )?)
}

/// Returns true when any live page has `page_id` as its parent.
pub fn has_children(conn: &Connection, page_id: &str) -> Result<bool> {
    PageQueryBuilder::new().published().children_of(page_id).exists(conn)
}

/// Removes `page_id` if it is an empty, childless placeholder, then repeats
/// for its parent. Stops at the first page that is real, has children, or is
/// the root. Returns the removed paths, deepest first.
///
/// # Errors
///
/// Returns [`PageTreeError::Database`] for any SQLite failure.
pub fn prune_empty_ancestors(conn: &Connection, page_id: Option<&str>) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    let mut current = page_id.map(str::to_string);

    while let Some(id) = current.take() {
        let Some(page) = PageQueryBuilder::new().published().with_id(&id).fetch_one(conn)? else {
            break;
        };
        if path_utils::is_root(&page.path) || !page.is_empty || has_children(conn, &page.id)? {
            break;
        }
        delete_page_row(conn, &page.id)?;
        log::debug!("pruned empty page {}", page.path);
        removed.push(page.path);
        current = page.parent_id;
    }
    Ok(removed)
}

/// Hard-removes a page row together with its grantee rows.
pub(crate) fn delete_page_row(conn: &Connection, page_id: &str) -> Result<()> {
    conn.execute("DELETE FROM page_grantees WHERE page_id = ?1", [page_id])?;
    conn.execute("DELETE FROM pages WHERE id = ?1", [page_id])?;
    Ok(())
}
