//! Persisted, chunked subtree rewrites.
//!
//! A rename or delete that touches descendants is recorded as a row in
//! `page_operations`. The pages it will process are captured in
//! `page_operation_members` when it starts; pages created under the subtree
//! afterwards are never swept along. The cascade is then driven forward one
//! chunk at a time. Each chunk is its own immediate transaction that handles
//! up to `batch_size` members and records its progress, so a crash or a
//! [`CancelToken`] leaves a row that
//! [`PageTree::resume_pending_operations`](super::page_tree::PageTree::resume_pending_operations)
//! can pick up again.
//!
//! Every committed chunk leaves a well-formed tree. A page with content that
//! leaves its path while pages still hang below it is replaced by an empty
//! placeholder holding them; placeholders are pruned or moved once nothing
//! below them is left behind.
//!
//! Renames walk members in ascending path order, so every ancestor moves
//! before its descendants. Deletes walk them in descending order.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::error::is_constraint_violation;
use crate::core::materializer::{self, delete_page_row, has_children};
use crate::core::path_utils;
use crate::core::query::{self, PageQueryBuilder, PathOrder};
use crate::{PageNode, PageTreeError, Result};

/// Cooperative cancellation flag shared between a caller and a running cascade.
///
/// The flag is checked between chunks; a chunk that has started always commits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    chunk_budget: Option<Arc<AtomicUsize>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that lets `chunks` chunks commit and then cancels itself.
    ///
    /// Useful for spreading a large cascade over several calls.
    pub fn after_chunks(chunks: usize) -> Self {
        let token = Self {
            cancelled: Arc::default(),
            chunk_budget: Some(Arc::new(AtomicUsize::new(chunks))),
        };
        if chunks == 0 {
            token.cancel();
        }
        token
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Takes one chunk from the budget; false once the token is cancelled.
    fn admit_chunk(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let Some(budget) = &self.chunk_budget else {
            return true;
        };
        if budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_err()
        {
            self.cancel();
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeKind {
    Rename,
    Delete,
}

impl CascadeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rename => "rename",
            Self::Delete => "delete",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "rename" => Ok(Self::Rename),
            "delete" => Ok(Self::Delete),
            other => Err(PageTreeError::NotFound(format!("cascade kind {other}"))),
        }
    }
}

/// Options and running totals carried with a pending cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CascadeState {
    /// Rename only: stamp `last_update_user`/`updated_at` on rewritten pages.
    pub update_metadata: bool,
    /// Delete only: whether descendants were requested to go too.
    pub recursive: bool,
    /// Descendants rewritten (rename) or pages trashed (delete) so far.
    pub processed: usize,
    /// Delete only: empty placeholders hard-removed so far.
    pub removed_empty: usize,
    /// Placeholders outside the subtree that were pruned because the cascade emptied them.
    pub pruned_paths: Vec<String>,
}

/// A cascade that has started but not yet finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: String,
    pub kind: CascadeKind,
    /// The page whose subtree is being rewritten.
    pub page_id: String,
    /// Subtree prefix before the cascade.
    pub from_path: String,
    /// Subtree prefix after the cascade; the trash path for deletes.
    pub to_path: String,
    /// Old path of the last member that was processed.
    pub cursor: Option<String>,
    pub actor: Option<String>,
    pub state: CascadeState,
    pub created_at: i64,
}

impl PendingOperation {
    /// True when `path` lies in, or is an ancestor of, the subtree this
    /// cascade reads from or writes to.
    pub fn touches(&self, path: &str) -> bool {
        [&self.from_path, &self.to_path]
            .into_iter()
            .any(|prefix| same_lineage(path, prefix))
    }

    /// True when `path` is `from_path` or below it.
    fn covers_source(&self, path: &str) -> bool {
        path == self.from_path || path_utils::is_descendant_of(path, &self.from_path)
    }
}

fn same_lineage(a: &str, b: &str) -> bool {
    a == b || path_utils::is_descendant_of(a, b) || path_utils::is_descendant_of(b, a)
}

pub(crate) fn insert(conn: &Connection, op: &PendingOperation) -> Result<()> {
    conn.execute(
        "INSERT INTO page_operations (id, kind, page_id, from_path, to_path, cursor, actor, state_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            op.id,
            op.kind.as_str(),
            op.page_id,
            op.from_path,
            op.to_path,
            op.cursor,
            op.actor,
            serde_json::to_string(&op.state)?,
            op.created_at,
        ],
    )?;
    Ok(())
}

pub(crate) fn save_progress(conn: &Connection, op: &PendingOperation) -> Result<()> {
    conn.execute(
        "UPDATE page_operations SET cursor = ?1, state_json = ?2 WHERE id = ?3",
        rusqlite::params![op.cursor, serde_json::to_string(&op.state)?, op.id],
    )?;
    Ok(())
}

/// Drops the pending row and its member list.
pub(crate) fn remove(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM page_operation_members WHERE operation_id = ?1", [id])?;
    conn.execute("DELETE FROM page_operations WHERE id = ?1", [id])?;
    Ok(())
}

/// Adds a single page to the cascade's member list.
pub(crate) fn enqueue_page(conn: &Connection, op: &PendingOperation, page: &PageNode) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO page_operation_members (operation_id, page_id, old_path) VALUES (?1, ?2, ?3)",
        [&op.id, &page.id, &page.path],
    )?;
    Ok(())
}

/// Adds every live page below `from_path` to the member list and returns how many there were.
pub(crate) fn enqueue_descendants(conn: &Connection, op: &PendingOperation) -> Result<usize> {
    Ok(conn.execute(
        "INSERT OR IGNORE INTO page_operation_members (operation_id, page_id, old_path)
         SELECT ?1, id, path FROM pages
          WHERE status = 'published' AND path LIKE ?2 ESCAPE '\\'",
        rusqlite::params![op.id, query::descendant_pattern(&op.from_path)],
    )?)
}

struct Member {
    page_id: String,
    old_path: String,
}

fn next_members(conn: &Connection, op: &PendingOperation, order: PathOrder, limit: usize) -> Result<Vec<Member>> {
    let direction = match order {
        PathOrder::Ascending => "ASC",
        PathOrder::Descending => "DESC",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT page_id, old_path FROM page_operation_members
          WHERE operation_id = ?1 AND done = 0
          ORDER BY old_path {direction}, page_id LIMIT ?2"
    ))?;
    let members = stmt
        .query_map(rusqlite::params![op.id, limit as i64], |row| {
            Ok(Member {
                page_id: row.get(0)?,
                old_path: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(members)
}

fn mark_done(conn: &Connection, op: &PendingOperation, page_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE page_operation_members SET done = 1 WHERE operation_id = ?1 AND page_id = ?2",
        [&op.id, page_id],
    )?;
    Ok(())
}

/// The member's page, if it is still live at the path it had when the cascade started.
fn member_page(conn: &Connection, page_id: &str, old_path: &str) -> Result<Option<PageNode>> {
    PageQueryBuilder::new()
        .published()
        .with_id(page_id)
        .with_path(old_path)
        .fetch_one(conn)
}

/// True for a rename's own pages that have not moved yet.
fn is_unmoved(conn: &Connection, op: &PendingOperation, page: &PageNode) -> Result<bool> {
    if page.id == op.page_id {
        return Ok(page.path == op.from_path);
    }
    let member: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM page_operation_members
                         WHERE operation_id = ?1 AND page_id = ?2 AND old_path = ?3)",
        [&op.id, &page.id, &page.path],
        |row| row.get(0),
    )?;
    Ok(member)
}

pub fn load(conn: &Connection, id: &str) -> Result<Option<PendingOperation>> {
    let row = conn
        .query_row(&format!("{PENDING_SELECT} WHERE id = ?1"), [id], map_pending_row)
        .optional()?;
    row.map(pending_from_row).transpose()
}

/// All unfinished cascades, oldest first.
pub fn list(conn: &Connection) -> Result<Vec<PendingOperation>> {
    let mut stmt = conn.prepare(&format!("{PENDING_SELECT} ORDER BY created_at, id"))?;
    let rows = stmt
        .query_map([], map_pending_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(pending_from_row).collect()
}

/// First unfinished cascade whose subtrees share a lineage with any of `paths`.
pub(crate) fn find_overlapping(conn: &Connection, paths: &[&str]) -> Result<Option<PendingOperation>> {
    Ok(list(conn)?
        .into_iter()
        .find(|op| paths.iter().any(|path| op.touches(path))))
}

const PENDING_SELECT: &str =
    "SELECT id, kind, page_id, from_path, to_path, cursor, actor, state_json, created_at FROM page_operations";

type PendingRow = (String, String, String, String, String, Option<String>, Option<String>, String, i64);

fn map_pending_row(row: &rusqlite::Row) -> rusqlite::Result<PendingRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn pending_from_row(row: PendingRow) -> Result<PendingOperation> {
    let (id, kind, page_id, from_path, to_path, cursor, actor, state_json, created_at) = row;
    Ok(PendingOperation {
        id,
        kind: CascadeKind::parse(&kind)?,
        page_id,
        from_path,
        to_path,
        cursor,
        actor,
        state: serde_json::from_str(&state_json)?,
        created_at,
    })
}

fn check_cancel(op: &PendingOperation, cancel: Option<&CancelToken>) -> Result<()> {
    if cancel.is_some_and(|token| !token.admit_chunk()) {
        log::info!(
            "{} cascade {} cancelled at {:?}",
            op.kind.as_str(),
            op.id,
            op.cursor
        );
        return Err(PageTreeError::Cancelled(op.id.clone()));
    }
    Ok(())
}

/// Fails with `NotFound` unless the renamed page is still live at either end of the move.
fn require_target(conn: &Connection, op: &PendingOperation) -> Result<()> {
    let present = PageQueryBuilder::new()
        .published()
        .with_id(&op.page_id)
        .by_paths(&[op.from_path.clone(), op.to_path.clone()])
        .exists(conn)?;
    if !present {
        return Err(PageTreeError::NotFound(format!(
            "page {} while cascading {}",
            op.page_id, op.id
        )));
    }
    Ok(())
}

/// Moves the remaining members of a rename from `from_path` to `to_path`.
///
/// An empty member stays behind as long as anything still hangs below it at
/// the old location and follows once its subtree has moved. When no members
/// are left, the renamed page itself is moved if it has not been yet.
///
/// # Errors
///
/// Returns [`PageTreeError::Cancelled`] when `cancel` fires between chunks,
/// [`PageTreeError::NotFound`] if the renamed page disappeared, or
/// [`PageTreeError::PathConflict`] if a destination path was taken meanwhile.
pub(crate) fn run_rename_chunks(
    conn: &mut Connection,
    op: &mut PendingOperation,
    batch_size: usize,
    cancel: Option<&CancelToken>,
    now: i64,
) -> Result<()> {
    loop {
        check_cancel(op, cancel)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        require_target(&tx, op)?;

        let chunk = next_members(&tx, op, PathOrder::Ascending, batch_size)?;
        if chunk.is_empty() {
            if let Some(target) = member_page(&tx, &op.page_id, &op.from_path)? {
                move_page(&tx, op, &target, now)?;
            }
            save_progress(&tx, op)?;
            tx.commit()?;
            return Ok(());
        }

        for member in &chunk {
            if let Some(page) = member_page(&tx, &member.page_id, &member.old_path)? {
                if !page.is_empty {
                    move_page(&tx, op, &page, now)?;
                } else if !has_children(&tx, &page.id)? {
                    delete_page_row(&tx, &page.id)?;
                    settle(&tx, op, page.parent_id.clone(), now)?;
                }
            }
            mark_done(&tx, op, &member.page_id)?;
            op.cursor = Some(member.old_path.clone());
        }

        save_progress(&tx, op)?;
        tx.commit()?;
        log::debug!(
            "rename {}: handled {} member(s) up to {:?}",
            op.id,
            chunk.len(),
            op.cursor
        );
    }
}

/// Moves one page of a rename to its rewritten path.
///
/// An empty placeholder at the destination is merged into the page. If the
/// page still has children at its old location, a placeholder takes its
/// place and adopts them; otherwise its old parent is settled.
pub(crate) fn move_page(conn: &Connection, op: &mut PendingOperation, page: &PageNode, now: i64) -> Result<()> {
    let new_path = rewritten_path(op, &page.path)?;
    if page.grant.detaches() {
        rewrite_row(conn, op, page, &new_path, None, now)?;
        count_moved(op, page);
        return Ok(());
    }

    let had_children = has_children(conn, &page.id)?;
    let parent_id = materializer::ensure_ancestors(conn, &new_path, now)?;
    if let Some(occupant) = PageQueryBuilder::new().attached().with_path(&new_path).fetch_one(conn)? {
        if !occupant.is_empty {
            return Err(PageTreeError::PathConflict(new_path));
        }
        materializer::adopt_children(conn, &occupant.id, &page.id)?;
        delete_page_row(conn, &occupant.id)?;
        log::debug!("merged placeholder {new_path} into page {}", page.id);
    }
    rewrite_row(conn, op, page, &new_path, Some(&parent_id), now)?;
    count_moved(op, page);

    if had_children {
        let anchor = materializer::ensure_ancestors(conn, &page.path, now)?;
        let placeholder = materializer::insert_placeholder(conn, &page.path, &anchor, now)?;
        materializer::adopt_children_below(conn, &page.id, &placeholder, &page.path)?;
        Ok(())
    } else {
        settle(conn, op, page.parent_id.clone(), now)
    }
}

fn count_moved(op: &mut PendingOperation, page: &PageNode) {
    if page.id != op.page_id {
        op.state.processed += 1;
    }
}

fn rewrite_row(
    conn: &Connection,
    op: &PendingOperation,
    page: &PageNode,
    new_path: &str,
    parent_id: Option<&str>,
    now: i64,
) -> Result<()> {
    let result = conn.execute(
        "UPDATE pages SET path = ?1, parent_id = ?2,
                last_update_user = CASE WHEN ?5 AND is_empty = 0 THEN ?6 ELSE last_update_user END,
                updated_at = CASE WHEN ?5 AND is_empty = 0 THEN ?7 ELSE updated_at END
          WHERE id = ?3 AND path = ?4 AND status = 'published'",
        rusqlite::params![
            new_path,
            parent_id,
            page.id,
            page.path,
            op.state.update_metadata,
            op.actor,
            now,
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => Err(PageTreeError::PathConflict(new_path.to_string())),
        Err(e) => Err(e.into()),
    }
}

fn rewritten_path(op: &PendingOperation, path: &str) -> Result<String> {
    path_utils::replace_prefix(path, &op.from_path, &op.to_path)
        .ok_or_else(|| PageTreeError::NotFound(format!("{path} is outside {}", op.from_path)))
}

/// Walks up from `start`, removing placeholders that were left empty and
/// childless. Stops at the first page with content or children, or the root.
///
/// During a rename, an empty page that belongs to the moving subtree is moved
/// instead of removed.
fn settle(conn: &Connection, op: &mut PendingOperation, start: Option<String>, now: i64) -> Result<()> {
    let mut current = start;
    while let Some(id) = current.take() {
        let Some(page) = PageQueryBuilder::new().attached().with_id(&id).fetch_one(conn)? else {
            break;
        };
        if path_utils::is_root(&page.path) || !page.is_empty || has_children(conn, &page.id)? {
            break;
        }
        if op.kind == CascadeKind::Rename && is_unmoved(conn, op, &page)? {
            mark_done(conn, op, &page.id)?;
            return move_page(conn, op, &page, now);
        }

        delete_page_row(conn, &page.id)?;
        if !op.covers_source(&page.path) {
            op.state.pruned_paths.push(page.path.clone());
        } else if op.kind == CascadeKind::Delete {
            op.state.removed_empty += 1;
        }
        log::debug!("pruned empty page {}", page.path);
        current = page.parent_id;
    }
    Ok(())
}

/// Trashes (or, for placeholders, removes) the remaining members of a delete,
/// deepest paths first. The target page is a member like any other.
///
/// A member that still has children when its turn comes (pages created below
/// it after the delete started) keeps them: an empty member stays, a member
/// with content is trashed and replaced by a placeholder.
///
/// # Errors
///
/// Returns [`PageTreeError::Cancelled`] when `cancel` fires between chunks.
pub(crate) fn run_delete_chunks(
    conn: &mut Connection,
    op: &mut PendingOperation,
    batch_size: usize,
    cancel: Option<&CancelToken>,
    now: i64,
) -> Result<()> {
    loop {
        check_cancel(op, cancel)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let chunk = next_members(&tx, op, PathOrder::Descending, batch_size)?;
        if chunk.is_empty() {
            tx.commit()?;
            return Ok(());
        }

        for member in &chunk {
            if let Some(page) = member_page(&tx, &member.page_id, &member.old_path)? {
                delete_member(&tx, op, &page, now)?;
            }
            mark_done(&tx, op, &member.page_id)?;
            op.cursor = Some(member.old_path.clone());
        }

        save_progress(&tx, op)?;
        tx.commit()?;
        log::debug!(
            "delete {}: handled {} member(s) down to {:?}",
            op.id,
            chunk.len(),
            op.cursor
        );
    }
}

fn delete_member(conn: &Connection, op: &mut PendingOperation, page: &PageNode, now: i64) -> Result<()> {
    let trash_path = rewritten_path(op, &page.path)?;
    if page.grant.detaches() {
        trash_page(conn, page, &trash_path, op.actor.as_deref(), now)?;
        op.state.processed += 1;
        return Ok(());
    }

    if has_children(conn, &page.id)? {
        if page.is_empty {
            return Ok(());
        }
        trash_page(conn, page, &trash_path, op.actor.as_deref(), now)?;
        op.state.processed += 1;
        let anchor = materializer::ensure_ancestors(conn, &page.path, now)?;
        let placeholder = materializer::insert_placeholder(conn, &page.path, &anchor, now)?;
        materializer::adopt_children(conn, &page.id, &placeholder)?;
        return Ok(());
    }

    if page.is_empty {
        delete_page_row(conn, &page.id)?;
        op.state.removed_empty += 1;
    } else {
        trash_page(conn, page, &trash_path, op.actor.as_deref(), now)?;
        op.state.processed += 1;
    }
    settle(conn, op, page.parent_id.clone(), now)
}

/// Detaches `page` from the tree and parks it at `trash_path`.
fn trash_page(
    conn: &Connection,
    page: &PageNode,
    trash_path: &str,
    actor: Option<&str>,
    now: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE pages SET path = ?1, parent_id = NULL, status = 'deleted',
                delete_user = ?2, deleted_at = ?3, updated_at = ?3
          WHERE id = ?4 AND status = 'published'",
        rusqlite::params![trash_path, actor, now, page.id],
    )?;
    Ok(())
}
