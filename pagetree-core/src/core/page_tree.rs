//! High-level page tree operations over a SQLite database.

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use uuid::Uuid;

use crate::core::cascade::{self, CascadeKind, CascadeState, PendingOperation};
use crate::core::error::is_constraint_violation;
use crate::core::integrity::{self, IntegrityReport};
use crate::core::materializer;
use crate::core::path_utils;
use crate::core::query::{self, PageQueryBuilder, Paginated, PathOrder};
use crate::core::storage::with_read_retries;
use crate::{
    resolve_viewer, CancelToken, DeleteOptions, DeleteResult, Grant, GroupMembership, Operation,
    OperationLog, OperationSummary, PageNode, PageTreeConfig, PageTreeError, Principal, Result,
    Revision, StaticGroupMembership, Storage, Viewer,
};

/// Options for [`PageTree::rename_page`].
#[derive(Debug, Clone, Default)]
pub struct RenameOptions {
    /// Stamp `last_update_user` and `updated_at` on every moved page with content.
    pub update_metadata: bool,
    /// Checked between cascade chunks.
    pub cancel: Option<CancelToken>,
}

/// An open page tree backed by a SQLite database.
///
/// `PageTree` is the entry point for every structural mutation. It combines a
/// [`Storage`] connection, the [`PageTreeConfig`] it was opened with, an
/// [`OperationLog`] for the audit trail, and the [`GroupMembership`]
/// collaborator used to resolve viewers.
///
/// Mutations that touch a subtree run as chunked cascades; see
/// [`crate::core::cascade`].
pub struct PageTree {
    storage: Storage,
    config: PageTreeConfig,
    operation_log: OperationLog,
    groups: Box<dyn GroupMembership + Send>,
}

impl PageTree {
    /// Creates a new page tree database at `path` and inserts the root page.
    ///
    /// # Errors
    ///
    /// Returns [`PageTreeError::StoreUnavailable`] if the file cannot be
    /// opened, or [`PageTreeError::Database`] for any other SQLite failure.
    pub fn create<P: AsRef<Path>>(path: P, config: PageTreeConfig) -> Result<Self> {
        Self::init(Storage::create(path)?, config)
    }

    /// Opens an existing page tree database.
    ///
    /// Unfinished cascades are left pending; call
    /// [`resume_pending_operations`](Self::resume_pending_operations) to finish them.
    ///
    /// # Errors
    ///
    /// Returns [`PageTreeError::NotFound`] if the file is not a page tree
    /// database, or [`PageTreeError::Database`] for any SQLite failure.
    pub fn open<P: AsRef<Path>>(path: P, config: PageTreeConfig) -> Result<Self> {
        Self::init(Storage::open(path)?, config)
    }

    pub fn create_in_memory(config: PageTreeConfig) -> Result<Self> {
        Self::init(Storage::create_in_memory()?, config)
    }

    fn init(mut storage: Storage, config: PageTreeConfig) -> Result<Self> {
        let config = config.sanitized();
        storage.set_busy_timeout(config.busy_timeout_ms)?;
        ensure_root(&mut storage)?;

        let pending = cascade::list(storage.connection())?.len();
        if pending > 0 {
            log::warn!("{pending} unfinished cascade(s) found, resume or abandon them");
        }

        Ok(Self {
            operation_log: OperationLog::new(config.purge_strategy.clone()),
            storage,
            config,
            groups: Box::new(StaticGroupMembership::new()),
        })
    }

    /// Replaces the group-membership collaborator used to resolve viewers.
    #[must_use]
    pub fn with_group_membership(mut self, groups: impl GroupMembership + Send + 'static) -> Self {
        self.groups = Box::new(groups);
        self
    }

    pub fn config(&self) -> &PageTreeConfig {
        &self.config
    }

    /// Returns a reference to the underlying SQLite connection.
    pub fn connection(&self) -> &Connection {
        self.storage.connection()
    }

    fn viewer(&self, principal: &Principal) -> Result<Viewer> {
        resolve_viewer(principal, self.groups.as_ref())
    }

    /// Runs an idempotent read with the configured busy retries.
    fn read<T>(&self, mut f: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.storage.connection();
        with_read_retries(self.config.read_retries, || f(conn))
    }

    // ── Structural mutations ─────────────────────────────────────────

    /// Authors a page at `path`, creating empty placeholders for any missing
    /// ancestors.
    ///
    /// If an empty placeholder already sits at `path` it is filled in place, so
    /// the `parent_id` of its existing children does not change. A page created
    /// with a [`Grant::Restricted`] grant is detached: it gets no parent and no
    /// placeholders are materialized for it.
    ///
    /// # Errors
    ///
    /// Returns [`PageTreeError::PathConflict`] if a page with content already
    /// exists at `path` (the root always does), and
    /// [`PageTreeError::InvalidOperation`] for paths under the trash prefix and
    /// paths an unfinished rename still has to fill.
    pub fn create_page(
        &mut self,
        path: &str,
        body: &str,
        principal: &Principal,
        grant: Grant,
    ) -> Result<PageNode> {
        let path = path_utils::normalize(path);
        if path_utils::is_root(&path) {
            return Err(PageTreeError::PathConflict(path));
        }
        if path_utils::is_trashed_path(&path, &self.config.trash_prefix) {
            return Err(PageTreeError::invalid(&path, "pages cannot be created in the trash"));
        }
        let actor = principal.user_id().map(str::to_string);
        let now = now();

        let tx = begin(&mut self.storage)?;
        let existing = if grant.detaches() {
            None
        } else {
            check_create_allowed(&tx, &path)?;
            PageQueryBuilder::new().attached().with_path(&path).fetch_one(&tx)?
        };
        let revision = Revision {
            id: Uuid::new_v4().to_string(),
            page_id: existing
                .as_ref()
                .map_or_else(|| Uuid::new_v4().to_string(), |page| page.id.clone()),
            body: body.to_string(),
            author: actor.clone(),
            created_at: now,
        };

        let (parent_id, filled_placeholder) = match existing {
            Some(page) if !page.is_empty => return Err(PageTreeError::PathConflict(path)),
            Some(page) => {
                let parent_id = match page.parent_id {
                    Some(id) => id,
                    None => materializer::ensure_ancestors(&tx, &path, now)?,
                };
                tx.execute(
                    "UPDATE pages SET is_empty = 0, parent_id = ?1, revision_id = ?2, grant_code = ?3,
                            creator = ?4, last_update_user = ?4, updated_at = ?5
                      WHERE id = ?6",
                    rusqlite::params![parent_id, revision.id, grant.code(), actor, now, page.id],
                )?;
                (Some(parent_id), true)
            }
            None => {
                let parent_id = if grant.detaches() {
                    None
                } else {
                    Some(materializer::ensure_ancestors(&tx, &path, now)?)
                };
                let inserted = tx.execute(
                    "INSERT INTO pages (id, path, parent_id, is_empty, grant_code, status, revision_id,
                                        creator, last_update_user, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 0, ?4, 'published', ?5, ?6, ?6, ?7, ?7)",
                    rusqlite::params![revision.page_id, path, parent_id, grant.code(), revision.id, actor, now],
                );
                match inserted {
                    Ok(_) => {}
                    Err(e) if is_constraint_violation(&e) => return Err(PageTreeError::PathConflict(path)),
                    Err(e) => return Err(e.into()),
                }
                (parent_id, false)
            }
        };

        insert_revision(&tx, &revision)?;
        write_grantees(&tx, &revision.page_id, &grant)?;

        let op = Operation::CreatePage {
            operation_id: Uuid::new_v4().to_string(),
            timestamp: now,
            actor,
            page_id: revision.page_id.clone(),
            path: path.clone(),
            parent_id,
            filled_placeholder,
        };
        self.operation_log.log(&tx, &op)?;
        self.operation_log.purge_if_needed(&tx)?;

        let page = load_page(&tx, &revision.page_id)?;
        tx.commit()?;
        log::info!("created page {path}");
        Ok(page)
    }

    /// Moves a page and its whole subtree to `new_path`.
    ///
    /// The pages below the old path are captured when the rename starts and
    /// then moved in chunks of `cascade_batch_size`, shallowest first. Missing
    /// ancestors at the destination are materialized and empty placeholders
    /// found there are merged into the arriving page. Until a page's subtree
    /// has moved, an empty placeholder holds its old path, so the tree is
    /// well-formed after every chunk. A page with content moves right away;
    /// an empty page follows once nothing is left below it.
    ///
    /// A restricted page is moved alone.
    ///
    /// # Errors
    ///
    /// Returns [`PageTreeError::InvalidOperation`] for the root, reserved or
    /// trashed pages, for targets that are the root, in the trash, reserved or
    /// above a reserved path, the current path, or inside the page's own
    /// subtree, and while another unfinished cascade touches either subtree.
    /// Returns [`PageTreeError::PathConflict`] if a page with content occupies
    /// `new_path` or any path the subtree would move onto.
    /// Returns [`PageTreeError::Cancelled`] if `options.cancel` fires; the
    /// cascade stays pending and can be resumed or abandoned.
    pub fn rename_page(
        &mut self,
        page_id: &str,
        new_path: &str,
        principal: &Principal,
        options: RenameOptions,
    ) -> Result<PageNode> {
        let new_path = path_utils::normalize(new_path);
        let actor = principal.user_id().map(str::to_string);
        let now = now();

        let tx = begin(&mut self.storage)?;
        let page = load_page(&tx, page_id)?;
        check_mutable(&self.config, &page, "renamed")?;
        check_rename_target(&self.config, &page.path, &new_path)?;
        check_no_overlap(&tx, &[&page.path, &new_path])?;

        let detached = page.grant.detaches();
        if !detached {
            let occupant = PageQueryBuilder::new().attached().with_path(&new_path).fetch_one(&tx)?;
            if occupant.is_some_and(|occupant| !occupant.is_empty) {
                return Err(PageTreeError::PathConflict(new_path));
            }
            if let Some(collision) = query::first_move_collision(&tx, &page.path, &new_path)? {
                return Err(PageTreeError::PathConflict(collision));
            }
        }

        let mut op = PendingOperation {
            id: Uuid::new_v4().to_string(),
            kind: CascadeKind::Rename,
            page_id: page.id.clone(),
            from_path: page.path.clone(),
            to_path: new_path.clone(),
            cursor: None,
            actor,
            state: CascadeState {
                update_metadata: options.update_metadata,
                ..CascadeState::default()
            },
            created_at: now,
        };
        cascade::insert(&tx, &op)?;
        let members = if detached { 0 } else { cascade::enqueue_descendants(&tx, &op)? };
        if !page.is_empty || members == 0 {
            cascade::move_page(&tx, &mut op, &page, now)?;
            cascade::save_progress(&tx, &op)?;
        }
        tx.commit()?;
        log::debug!("rename {}: {} to {} with {members} page(s) below", op.id, page.path, new_path);

        self.drive(&mut op, options.cancel.as_ref())?;
        log::info!(
            "renamed {} to {} ({} descendant(s))",
            page.path,
            new_path,
            op.state.processed
        );
        self.read(|conn| load_page(conn, page_id))
    }

    /// Moves a page to the trash, together with its descendants when
    /// `options.recursive` is set.
    ///
    /// Pages with content get status `Deleted`, a path under the trash prefix
    /// and no parent. Empty placeholders are removed outright. The pages to
    /// delete are captured up front and processed deepest first in chunks of
    /// `cascade_batch_size`; placeholders left empty and childless are pruned
    /// along the way. Pages created below the subtree after the delete
    /// started stay live, under a placeholder where needed.
    ///
    /// # Errors
    ///
    /// Returns [`PageTreeError::InvalidOperation`] for the root, reserved
    /// pages, pages already in the trash, non-recursive deletes of a page
    /// with children, and pages an unfinished cascade touches. Returns
    /// [`PageTreeError::NotFound`] if `page_id` does not exist, and
    /// [`PageTreeError::Cancelled`] if `options.cancel` fires.
    pub fn delete_page(
        &mut self,
        page_id: &str,
        principal: &Principal,
        options: DeleteOptions,
    ) -> Result<DeleteResult> {
        let actor = principal.user_id().map(str::to_string);
        let now = now();

        let tx = begin(&mut self.storage)?;
        let page = load_page(&tx, page_id)?;
        check_mutable(&self.config, &page, "deleted")?;
        check_no_overlap(&tx, &[&page.path])?;

        let detached = page.grant.detaches();
        if !detached && !options.recursive {
            let has_descendants = PageQueryBuilder::new()
                .attached()
                .descendants_of(&page.path)
                .exists(&tx)?;
            if has_descendants {
                return Err(PageTreeError::invalid(
                    &page.path,
                    "page has children, delete it recursively",
                ));
            }
        }

        let mut op = PendingOperation {
            id: Uuid::new_v4().to_string(),
            kind: CascadeKind::Delete,
            page_id: page.id.clone(),
            from_path: page.path.clone(),
            to_path: path_utils::to_trash_path(&page.path, &self.config.trash_prefix),
            cursor: None,
            actor,
            state: CascadeState {
                recursive: options.recursive,
                ..CascadeState::default()
            },
            created_at: now,
        };
        cascade::insert(&tx, &op)?;
        cascade::enqueue_page(&tx, &op, &page)?;
        if options.recursive && !detached {
            cascade::enqueue_descendants(&tx, &op)?;
        }
        tx.commit()?;

        self.drive(&mut op, options.cancel.as_ref())?;
        log::info!(
            "deleted {} ({} trashed, {} empty removed)",
            page.path,
            op.state.processed,
            op.state.removed_empty
        );

        Ok(DeleteResult {
            trash_path: (!page.is_empty).then(|| op.to_path.clone()),
            operation_id: op.id,
            page_id: page.id,
            trashed_count: op.state.processed,
            removed_empty_count: op.state.removed_empty,
            pruned_paths: op.state.pruned_paths,
        })
    }

    /// Replaces a page's grant and grantees.
    ///
    /// Switching to [`Grant::Restricted`] takes the page out of the tree: its
    /// children are handed to an empty placeholder at its path, or, when it
    /// has none, its old parent is pruned if that left it empty and childless.
    /// Switching back re-materializes the page's ancestors and merges an empty
    /// placeholder found at its path. A linked page whose parent pointer is
    /// unset is re-linked on the way.
    ///
    /// # Errors
    ///
    /// Returns [`PageTreeError::InvalidOperation`] for trashed pages, empty
    /// placeholders, restricting the root, and moving a page in or out of the
    /// tree while an unfinished cascade touches it. Returns
    /// [`PageTreeError::PathConflict`] if a page with content took the path of
    /// a restricted page that is switched back, and [`PageTreeError::NotFound`]
    /// if `page_id` does not exist.
    pub fn change_grant(&mut self, page_id: &str, grant: Grant, principal: &Principal) -> Result<PageNode> {
        let actor = principal.user_id().map(str::to_string);
        let now = now();

        let tx = begin(&mut self.storage)?;
        let page = load_page(&tx, page_id)?;
        if page.is_deleted() {
            return Err(PageTreeError::invalid(&page.path, "page is in the trash"));
        }
        if page.is_empty {
            return Err(PageTreeError::invalid(&page.path, "empty pages cannot carry a grant"));
        }

        let leaving = grant.detaches() && !page.grant.detaches();
        let joining = page.grant.detaches() && !grant.detaches();
        if leaving && path_utils::is_root(&page.path) {
            return Err(PageTreeError::invalid(&page.path, "the root page cannot be restricted"));
        }
        if leaving || joining {
            check_no_overlap(&tx, &[&page.path])?;
        }

        let mut pruned_paths = Vec::new();
        let parent_id = if leaving {
            pruned_paths = detach_from_tree(&tx, &page, &grant, now)?;
            None
        } else if joining {
            Some(attach_to_tree(&tx, &page, now)?)
        } else {
            match page.parent_id {
                None if !grant.detaches() && !path_utils::is_root(&page.path) => {
                    Some(materializer::ensure_ancestors(&tx, &page.path, now)?)
                }
                other => other,
            }
        };
        let updated = tx.execute(
            "UPDATE pages SET grant_code = ?1, parent_id = ?2, last_update_user = ?3, updated_at = ?4
              WHERE id = ?5",
            rusqlite::params![grant.code(), parent_id, actor, now, page.id],
        );
        match updated {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => return Err(PageTreeError::PathConflict(page.path)),
            Err(e) => return Err(e.into()),
        }
        write_grantees(&tx, &page.id, &grant)?;

        let op = Operation::ChangeGrant {
            operation_id: Uuid::new_v4().to_string(),
            timestamp: now,
            actor,
            page_id: page.id.clone(),
            path: page.path.clone(),
            grant,
            pruned_paths,
        };
        self.operation_log.log(&tx, &op)?;
        self.operation_log.purge_if_needed(&tx)?;

        let updated = load_page(&tx, &page.id)?;
        tx.commit()?;
        log::info!("changed grant of {} to {}", page.path, updated.grant.code());
        Ok(updated)
    }

    // ── Cascades ─────────────────────────────────────────────────────

    /// Runs the remaining chunks of `op`, then finishes it: the pending row
    /// is removed and the operation logged.
    fn drive(&mut self, op: &mut PendingOperation, cancel: Option<&CancelToken>) -> Result<()> {
        let now = now();
        let batch_size = self.config.cascade_batch_size;
        match op.kind {
            CascadeKind::Rename => {
                cascade::run_rename_chunks(self.storage.connection_mut(), op, batch_size, cancel, now)?
            }
            CascadeKind::Delete => {
                cascade::run_delete_chunks(self.storage.connection_mut(), op, batch_size, cancel, now)?
            }
        }

        let tx = begin(&mut self.storage)?;
        let logged = match op.kind {
            CascadeKind::Rename => Operation::RenamePage {
                operation_id: op.id.clone(),
                timestamp: now,
                actor: op.actor.clone(),
                page_id: op.page_id.clone(),
                from_path: op.from_path.clone(),
                to_path: op.to_path.clone(),
                descendant_count: op.state.processed,
                pruned_paths: op.state.pruned_paths.clone(),
            },
            CascadeKind::Delete => Operation::DeletePage {
                operation_id: op.id.clone(),
                timestamp: now,
                actor: op.actor.clone(),
                page_id: op.page_id.clone(),
                path: op.from_path.clone(),
                recursive: op.state.recursive,
                trashed_count: op.state.processed,
                removed_empty_count: op.state.removed_empty,
                pruned_paths: op.state.pruned_paths.clone(),
            },
        };
        cascade::remove(&tx, &op.id)?;
        self.operation_log.log(&tx, &logged)?;
        self.operation_log.purge_if_needed(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Finishes every unfinished cascade, oldest first, and returns their ids.
    ///
    /// # Errors
    ///
    /// Stops at the first cascade that fails; later ones stay pending.
    pub fn resume_pending_operations(&mut self) -> Result<Vec<String>> {
        let pending = self.read(cascade::list)?;
        let mut finished = Vec::with_capacity(pending.len());
        for mut op in pending {
            log::info!(
                "resuming {} cascade {} at {:?}",
                op.kind.as_str(),
                op.id,
                op.cursor
            );
            self.drive(&mut op, None)?;
            finished.push(op.id);
        }
        Ok(finished)
    }

    pub fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.read(cascade::list)
    }

    /// Discards an unfinished cascade.
    ///
    /// Every committed chunk already left a well-formed tree, so only the
    /// remaining work is forgotten: pages the cascade had not reached keep
    /// their old paths and the placeholders holding them stay in place.
    ///
    /// # Errors
    ///
    /// Returns [`PageTreeError::NotFound`] if no such cascade is pending.
    pub fn abandon_operation(&mut self, operation_id: &str) -> Result<PendingOperation> {
        let tx = begin(&mut self.storage)?;
        let op = cascade::load(&tx, operation_id)?
            .ok_or_else(|| PageTreeError::NotFound(format!("operation {operation_id}")))?;
        cascade::remove(&tx, &op.id)?;
        tx.commit()?;

        log::warn!(
            "abandoned {} cascade {} of {} at {:?}",
            op.kind.as_str(),
            op.id,
            op.from_path,
            op.cursor
        );
        Ok(op)
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Returns the page with `page_id`, whether published or trashed.
    ///
    /// # Errors
    ///
    /// Returns [`PageTreeError::NotFound`] if no such page exists.
    pub fn get_page(&self, page_id: &str) -> Result<PageNode> {
        self.read(|conn| load_page(conn, page_id))
    }

    /// Looks up the published page at `path` if `principal` may see it.
    ///
    /// The page in the tree wins over a restricted page at the same path.
    pub fn find_by_path(&self, path: &str, principal: &Principal) -> Result<Option<PageNode>> {
        let path = path_utils::normalize(path);
        let viewer = self.viewer(principal)?;
        let in_tree = PageQueryBuilder::new().attached().with_path(&path).viewer(&viewer);
        let restricted = PageQueryBuilder::new().detached().with_path(&path).viewer(&viewer);
        self.read(|conn| match in_tree.fetch_one(conn)? {
            Some(page) => Ok(Some(page)),
            None => restricted.fetch_one(conn),
        })
    }

    /// Returns the visible pages sharing `path`'s parent, `path` included,
    /// ordered by path.
    pub fn find_siblings(&self, path: &str, principal: &Principal) -> Result<Vec<PageNode>> {
        let pattern = path_utils::sibling_pattern(&path_utils::normalize(path))?;
        let query = PageQueryBuilder::new()
            .published()
            .matching(&pattern)
            .viewer(&self.viewer(principal)?)
            .sort_by_path(PathOrder::Ascending);
        self.read(|conn| query.fetch(conn))
    }

    /// Returns the ancestors of `path` in the tree, root first.
    pub fn find_ancestors(&self, path: &str) -> Result<Vec<PageNode>> {
        let chain = path_utils::ancestor_chain(&path_utils::normalize(path));
        let query = PageQueryBuilder::new().attached().by_paths(&chain).sort_ancestors();
        self.read(|conn| query.fetch(conn))
    }

    /// Returns one page of `page_id`'s visible children, ordered by path.
    pub fn find_children(
        &self,
        page_id: &str,
        principal: &Principal,
        offset: usize,
        limit: usize,
    ) -> Result<Paginated<PageNode>> {
        let query = PageQueryBuilder::new()
            .published()
            .children_of(page_id)
            .viewer(&self.viewer(principal)?)
            .sort_by_path(PathOrder::Ascending);
        self.read(|conn| query.paginate(conn, offset, limit))
    }

    /// Returns the body of the page's current revision; `None` for empty pages.
    pub fn get_revision_body(&self, page_id: &str) -> Result<Option<String>> {
        self.read(|conn| {
            let Some(revision_id) = load_page(conn, page_id)?.revision_id else {
                return Ok(None);
            };
            let body = conn
                .query_row("SELECT body FROM revisions WHERE id = ?1", [&revision_id], |row| row.get(0))
                .optional()?;
            Ok(body)
        })
    }

    // ── Operations log and maintenance ───────────────────────────────

    /// Returns operation summaries, newest first.
    pub fn list_operations(
        &self,
        type_filter: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<OperationSummary>> {
        self.read(|conn| self.operation_log.list(conn, type_filter, limit))
    }

    /// Deletes all operations from the log. Returns the number deleted.
    pub fn purge_all_operations(&self) -> Result<usize> {
        self.operation_log.purge_all(self.connection())
    }

    /// Checks every page against the tree's structural rules.
    pub fn check_integrity(&self) -> Result<IntegrityReport> {
        self.read(|conn| integrity::check_integrity(conn, &self.config.trash_prefix))
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn begin(storage: &mut Storage) -> Result<Transaction<'_>> {
    storage
        .connection_mut()
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| PageTreeError::from(e).classify())
}

fn load_page(conn: &Connection, page_id: &str) -> Result<PageNode> {
    PageQueryBuilder::new()
        .with_id(page_id)
        .fetch_one(conn)?
        .ok_or_else(|| PageTreeError::NotFound(format!("page {page_id}")))
}

/// Inserts the root page if this database does not have one yet.
fn ensure_root(storage: &mut Storage) -> Result<()> {
    let tx = begin(storage)?;
    let has_root = PageQueryBuilder::new()
        .attached()
        .with_path(path_utils::ROOT_PATH)
        .exists(&tx)?;
    if !has_root {
        let now = now();
        let revision = Revision {
            id: Uuid::new_v4().to_string(),
            page_id: Uuid::new_v4().to_string(),
            body: String::new(),
            author: None,
            created_at: now,
        };
        tx.execute(
            "INSERT INTO pages (id, path, parent_id, is_empty, grant_code, status, revision_id, created_at, updated_at)
             VALUES (?1, ?2, NULL, 0, ?3, 'published', ?4, ?5, ?5)",
            rusqlite::params![revision.page_id, path_utils::ROOT_PATH, Grant::Public.code(), revision.id, now],
        )?;
        insert_revision(&tx, &revision)?;
        log::info!("created root page {}", revision.page_id);
    }
    tx.commit()?;
    Ok(())
}

fn insert_revision(conn: &Connection, revision: &Revision) -> Result<()> {
    conn.execute(
        "INSERT INTO revisions (id, page_id, body, author, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![revision.id, revision.page_id, revision.body, revision.author, revision.created_at],
    )?;
    Ok(())
}

fn write_grantees(conn: &Connection, page_id: &str, grant: &Grant) -> Result<()> {
    conn.execute("DELETE FROM page_grantees WHERE page_id = ?1", [page_id])?;
    let mut insert = conn.prepare(
        "INSERT OR IGNORE INTO page_grantees (page_id, kind, target_id) VALUES (?1, ?2, ?3)",
    )?;
    for (kind, target) in grant.grantees() {
        insert.execute([page_id, kind.as_str(), target])?;
    }
    Ok(())
}

/// Rejects the root, reserved pages and pages that are already trashed.
fn check_mutable(config: &PageTreeConfig, page: &PageNode, verb: &str) -> Result<()> {
    if page.is_deleted() || path_utils::is_trashed_path(&page.path, &config.trash_prefix) {
        return Err(PageTreeError::invalid(&page.path, "page is in the trash"));
    }
    if path_utils::is_root(&page.path) {
        return Err(PageTreeError::invalid(&page.path, format!("the root page cannot be {verb}")));
    }
    if path_utils::covers_reserved_path(&page.path, &config.reserved_prefixes) {
        return Err(PageTreeError::invalid(&page.path, format!("reserved pages cannot be {verb}")));
    }
    Ok(())
}

fn check_rename_target(config: &PageTreeConfig, old_path: &str, new_path: &str) -> Result<()> {
    let reason = if path_utils::is_root(new_path) {
        "a page cannot become the root"
    } else if path_utils::is_trashed_path(new_path, &config.trash_prefix) {
        "pages are moved to the trash by deleting them"
    } else if path_utils::covers_reserved_path(new_path, &config.reserved_prefixes) {
        // a subtree path below new_path can only be reserved if new_path covers it
        "the target path is reserved or lies above a reserved path"
    } else if new_path == old_path {
        "the page is already at this path"
    } else if path_utils::is_descendant_of(new_path, old_path) {
        "a page cannot be moved into its own subtree"
    } else {
        return Ok(());
    };
    Err(PageTreeError::invalid(new_path, reason))
}

/// Rejects moving or deleting pages whose subtree an unfinished cascade still works on.
fn check_no_overlap(conn: &Connection, paths: &[&str]) -> Result<()> {
    match cascade::find_overlapping(conn, paths)? {
        Some(op) => Err(PageTreeError::invalid(
            &op.from_path,
            format!("unfinished {} cascade {} touches this subtree", op.kind.as_str(), op.id),
        )),
        None => Ok(()),
    }
}

/// Rejects adding a tree page where an unfinished cascade still has pages to place.
fn check_create_allowed(conn: &Connection, path: &str) -> Result<()> {
    for op in cascade::list(conn)? {
        let destination = op.kind == CascadeKind::Rename
            && (path == op.to_path || path_utils::is_descendant_of(path, &op.to_path));
        if path == op.from_path || destination {
            return Err(PageTreeError::invalid(
                path,
                format!("unfinished {} cascade {} covers this path", op.kind.as_str(), op.id),
            ));
        }
    }
    Ok(())
}

/// Takes `page` out of the hierarchy and returns the placeholders pruned behind it.
fn detach_from_tree(tx: &Transaction, page: &PageNode, grant: &Grant, now: i64) -> Result<Vec<String>> {
    tx.execute(
        "UPDATE pages SET grant_code = ?1, parent_id = NULL WHERE id = ?2",
        rusqlite::params![grant.code(), page.id],
    )?;
    if materializer::has_children(tx, &page.id)? {
        let anchor = materializer::ensure_ancestors(tx, &page.path, now)?;
        let placeholder = materializer::insert_placeholder(tx, &page.path, &anchor, now)?;
        let adopted = materializer::adopt_children(tx, &page.id, &placeholder)?;
        log::debug!("{} left the tree, {adopted} child(ren) kept under a placeholder", page.path);
        return Ok(Vec::new());
    }
    materializer::prune_empty_ancestors(tx, page.parent_id.as_deref())
}

/// Puts a restricted page back at its path and returns its new parent.
fn attach_to_tree(tx: &Transaction, page: &PageNode, now: i64) -> Result<String> {
    if let Some(occupant) = PageQueryBuilder::new().attached().with_path(&page.path).fetch_one(tx)? {
        if !occupant.is_empty {
            return Err(PageTreeError::PathConflict(page.path.clone()));
        }
        materializer::adopt_children(tx, &occupant.id, &page.id)?;
        materializer::delete_page_row(tx, &occupant.id)?;
        log::debug!("{} rejoined the tree in place of its placeholder", page.path);
    }
    materializer::ensure_ancestors(tx, &page.path, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PageStatus;
    use tempfile::NamedTempFile;

    fn tree() -> PageTree {
        PageTree::create_in_memory(PageTreeConfig::default()).unwrap()
    }

    fn alice() -> Principal {
        Principal::user("alice")
    }

    fn create(tree: &mut PageTree, path: &str) -> PageNode {
        tree.create_page(path, "body", &alice(), Grant::Public).unwrap()
    }

    fn at(tree: &PageTree, path: &str) -> Option<PageNode> {
        tree.find_by_path(path, &alice()).unwrap()
    }

    fn assert_clean(tree: &PageTree) {
        let report = tree.check_integrity().unwrap();
        assert!(report.is_clean(), "{:?}", report.violations);
    }

    #[test]
    fn test_create_tree_has_root() {
        let temp = NamedTempFile::new().unwrap();
        let tree = PageTree::create(temp.path(), PageTreeConfig::default()).unwrap();

        let root = at(&tree, "/").unwrap();
        assert!(!root.is_empty);
        assert!(root.parent_id.is_none());
        assert_eq!(tree.get_revision_body(&root.id).unwrap().as_deref(), Some(""));
    }

    #[test]
    fn test_open_existing_tree_keeps_pages() {
        let temp = NamedTempFile::new().unwrap();
        {
            let mut tree = PageTree::create(temp.path(), PageTreeConfig::default()).unwrap();
            create(&mut tree, "/a/b");
        }

        let tree = PageTree::open(temp.path(), PageTreeConfig::default()).unwrap();
        assert!(at(&tree, "/a/b").is_some());
        let roots: i64 = tree
            .connection()
            .query_row("SELECT COUNT(*) FROM pages WHERE path = '/'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(roots, 1);
    }

    #[test]
    fn test_create_fills_missing_ancestors() {
        let mut tree = tree();
        let c = create(&mut tree, "/a/b/c");

        let a = at(&tree, "/a").unwrap();
        let b = at(&tree, "/a/b").unwrap();
        let root = at(&tree, "/").unwrap();
        assert!(a.is_empty && b.is_empty && !c.is_empty);
        assert_eq!(a.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(b.parent_id.as_deref(), Some(a.id.as_str()));
        assert_eq!(c.parent_id.as_deref(), Some(b.id.as_str()));
        assert!(a.revision_id.is_none());
        assert_eq!(tree.get_revision_body(&c.id).unwrap().as_deref(), Some("body"));
        assert_clean(&tree);
    }

    #[test]
    fn test_create_on_empty_page_fills_it_in_place() {
        let mut tree = tree();
        let c = create(&mut tree, "/a/b/c");
        let placeholder = at(&tree, "/a/b").unwrap();

        let b = create(&mut tree, "/a/b");

        assert_eq!(b.id, placeholder.id);
        assert!(!b.is_empty);
        assert_eq!(b.creator.as_deref(), Some("alice"));
        assert_eq!(tree.get_page(&c.id).unwrap().parent_id, Some(b.id));
        assert_clean(&tree);
    }

    #[test]
    fn test_create_existing_path_conflicts() {
        let mut tree = tree();
        create(&mut tree, "/a");

        let err = tree.create_page("/a/", "again", &alice(), Grant::Public).unwrap_err();
        assert!(matches!(err, PageTreeError::PathConflict(ref p) if p == "/a"));
        assert!(matches!(
            tree.create_page("/", "root", &alice(), Grant::Public),
            Err(PageTreeError::PathConflict(_))
        ));
    }

    #[test]
    fn test_create_in_trash_is_invalid() {
        let mut tree = tree();
        let err = tree.create_page("/trash/a", "x", &alice(), Grant::Public).unwrap_err();
        assert!(matches!(err, PageTreeError::InvalidOperation { .. }));
    }

    #[test]
    fn test_rename_cascades_descendants() {
        let mut tree = tree();
        let x = create(&mut tree, "/x");
        let y = create(&mut tree, "/x/y");

        let z = tree.rename_page(&x.id, "/z", &alice(), RenameOptions::default()).unwrap();

        assert_eq!(z.path, "/z");
        assert!(at(&tree, "/x").is_none());
        assert!(at(&tree, "/x/y").is_none());
        let moved = at(&tree, "/z/y").unwrap();
        assert_eq!(moved.id, y.id);
        assert_eq!(moved.parent_id.as_deref(), Some(z.id.as_str()));
        assert!(tree.pending_operations().unwrap().is_empty());
        assert_clean(&tree);
    }

    #[test]
    fn test_rename_prunes_orphaned_empty_parent() {
        let mut tree = tree();
        let q = create(&mut tree, "/p/q");
        create(&mut tree, "/r");

        tree.rename_page(&q.id, "/r/q", &alice(), RenameOptions::default()).unwrap();

        assert!(at(&tree, "/p").is_none());
        let r = at(&tree, "/r").unwrap();
        assert_eq!(at(&tree, "/r/q").unwrap().parent_id, Some(r.id));
        let summary = &tree.list_operations(Some("RenamePage"), None).unwrap()[0];
        assert_eq!(summary.target_path, "/p/q");
        assert_clean(&tree);
    }

    #[test]
    fn test_rename_keeps_empty_page_empty() {
        let mut tree = tree();
        create(&mut tree, "/a/b");
        let a = at(&tree, "/a").unwrap();

        let moved = tree.rename_page(&a.id, "/c", &alice(), RenameOptions::default()).unwrap();

        assert!(moved.is_empty);
        assert!(at(&tree, "/c/b").is_some());
        assert_clean(&tree);
    }

    #[test]
    fn test_rename_updates_metadata_when_asked() {
        let mut tree = tree();
        let page = tree.create_page("/a", "x", &Principal::user("bob"), Grant::Public).unwrap();
        let child = tree.create_page("/a/b", "x", &Principal::user("bob"), Grant::Public).unwrap();

        let options = RenameOptions {
            update_metadata: true,
            ..RenameOptions::default()
        };
        let moved = tree.rename_page(&page.id, "/c", &alice(), options).unwrap();

        assert_eq!(moved.last_update_user.as_deref(), Some("alice"));
        assert!(moved.updated_at >= page.updated_at);
        assert_eq!(tree.get_page(&child.id).unwrap().last_update_user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_rename_without_metadata_keeps_last_update_user() {
        let mut tree = tree();
        let page = tree.create_page("/a", "x", &Principal::user("bob"), Grant::Public).unwrap();
        let moved = tree.rename_page(&page.id, "/c", &alice(), RenameOptions::default()).unwrap();
        assert_eq!(moved.last_update_user.as_deref(), Some("bob"));
    }

    #[test]
    fn test_rename_onto_existing_page_conflicts() {
        let mut tree = tree();
        let a = create(&mut tree, "/a");
        create(&mut tree, "/b");

        let err = tree.rename_page(&a.id, "/b", &alice(), RenameOptions::default()).unwrap_err();
        assert!(matches!(err, PageTreeError::PathConflict(ref p) if p == "/b"));
        assert_eq!(tree.get_page(&a.id).unwrap().path, "/a");
    }

    #[test]
    fn test_rename_merges_empty_target() {
        let mut tree = tree();
        let x = create(&mut tree, "/x");
        create(&mut tree, "/x/child");
        let w = create(&mut tree, "/z/w");

        let z = tree.rename_page(&x.id, "/z", &alice(), RenameOptions::default()).unwrap();

        assert_eq!(z.id, x.id);
        assert_eq!(tree.get_page(&w.id).unwrap().parent_id, Some(x.id.clone()));
        assert!(at(&tree, "/z/child").is_some());
        assert_clean(&tree);
    }

    #[test]
    fn test_rename_subtree_collision_conflicts_before_moving() {
        let mut tree = tree();
        let x = create(&mut tree, "/x");
        create(&mut tree, "/x/w");
        create(&mut tree, "/z/w");

        let err = tree.rename_page(&x.id, "/z", &alice(), RenameOptions::default()).unwrap_err();
        assert!(matches!(err, PageTreeError::PathConflict(ref p) if p == "/z/w"));
        assert!(at(&tree, "/x/w").is_some());
        assert_clean(&tree);
    }

    #[test]
    fn test_rename_structural_rejections() {
        let mut tree = tree();
        let root = at(&tree, "/").unwrap();
        let a = create(&mut tree, "/a");
        let home = create(&mut tree, "/user/alice");
        let memo = create(&mut tree, "/user/alice/memo");

        let invalid = |result: Result<PageNode>| matches!(result, Err(PageTreeError::InvalidOperation { .. }));
        let opts = RenameOptions::default;
        assert!(invalid(tree.rename_page(&root.id, "/x", &alice(), opts())));
        assert!(invalid(tree.rename_page(&home.id, "/x", &alice(), opts())));
        assert!(invalid(tree.rename_page(&a.id, "/a/b", &alice(), opts())));
        assert!(invalid(tree.rename_page(&a.id, "/trash/a", &alice(), opts())));
        assert!(invalid(tree.rename_page(&a.id, "/user/bob", &alice(), opts())));
        assert!(invalid(tree.rename_page(&a.id, "/a", &alice(), opts())));
        assert!(invalid(tree.rename_page(&a.id, "/", &alice(), opts())));

        let user = at(&tree, "/user").unwrap();
        assert!(invalid(tree.rename_page(&user.id, "/people", &alice(), opts())));
        assert!(tree.rename_page(&memo.id, "/user/alice/notes", &alice(), opts()).is_ok());
    }

    #[test]
    fn test_rename_in_small_chunks() {
        let config = PageTreeConfig {
            cascade_batch_size: 2,
            ..PageTreeConfig::default()
        };
        let mut tree = PageTree::create_in_memory(config).unwrap();
        let top = create(&mut tree, "/top");
        for path in ["/top/a", "/top/a/1", "/top/a/2", "/top/b", "/top/b/c/d"] {
            create(&mut tree, path);
        }

        tree.rename_page(&top.id, "/moved", &alice(), RenameOptions::default()).unwrap();

        for path in ["/moved/a/1", "/moved/a/2", "/moved/b/c", "/moved/b/c/d"] {
            assert!(at(&tree, path).is_some(), "{path} missing");
        }
        let ops = tree.list_operations(Some("RenamePage"), None).unwrap();
        assert_eq!(ops.len(), 1);
        assert_clean(&tree);
    }

    #[test]
    fn test_cancelled_rename_resumes() {
        let mut tree = tree();
        let x = create(&mut tree, "/x");
        create(&mut tree, "/x/y");

        let token = CancelToken::new();
        token.cancel();
        let options = RenameOptions {
            cancel: Some(token),
            ..RenameOptions::default()
        };
        let err = tree.rename_page(&x.id, "/z", &alice(), options).unwrap_err();
        let op_id = match err {
            PageTreeError::Cancelled(id) => id,
            other => panic!("expected cancellation, got {other:?}"),
        };

        assert_eq!(tree.get_page(&x.id).unwrap().path, "/z");
        assert!(at(&tree, "/x/y").is_some());
        assert_eq!(tree.pending_operations().unwrap()[0].id, op_id);
        assert_clean(&tree);

        assert_eq!(tree.resume_pending_operations().unwrap(), vec![op_id]);
        assert!(at(&tree, "/z/y").is_some());
        assert!(tree.pending_operations().unwrap().is_empty());
        assert_clean(&tree);
    }

    #[test]
    fn test_abandoned_rename_reattaches_remaining_descendants() {
        let mut tree = tree();
        let x = create(&mut tree, "/x");
        let y = create(&mut tree, "/x/y/deep");

        let token = CancelToken::new();
        token.cancel();
        let options = RenameOptions {
            cancel: Some(token),
            ..RenameOptions::default()
        };
        let Err(PageTreeError::Cancelled(op_id)) = tree.rename_page(&x.id, "/z", &alice(), options) else {
            panic!("expected cancellation");
        };

        tree.abandon_operation(&op_id).unwrap();

        let placeholder = at(&tree, "/x").unwrap();
        assert!(placeholder.is_empty);
        assert_ne!(placeholder.id, x.id);
        assert_eq!(tree.get_page(&y.id).unwrap().path, "/x/y/deep");
        assert!(tree.pending_operations().unwrap().is_empty());
        assert_clean(&tree);
    }

    #[test]
    fn test_cancelled_rename_keeps_pages_created_meanwhile() {
        let mut tree = tree();
        let x = create(&mut tree, "/x");
        let y = create(&mut tree, "/x/y");

        let options = RenameOptions {
            cancel: Some(CancelToken::after_chunks(0)),
            ..RenameOptions::default()
        };
        let Err(PageTreeError::Cancelled(op_id)) = tree.rename_page(&x.id, "/z", &alice(), options) else {
            panic!("expected cancellation");
        };

        let ancestors: Vec<String> = tree.find_ancestors("/x/y").unwrap().into_iter().map(|p| p.path).collect();
        assert_eq!(ancestors, vec!["/", "/x"]);
        let placeholder = at(&tree, "/x").unwrap();
        assert_eq!(tree.get_page(&y.id).unwrap().parent_id, Some(placeholder.id.clone()));
        assert_clean(&tree);

        let late = create(&mut tree, "/x/foo");
        assert_eq!(late.parent_id, Some(placeholder.id.clone()));
        let invalid = |result: Result<PageNode>| matches!(result, Err(PageTreeError::InvalidOperation { .. }));
        assert!(invalid(tree.create_page("/x", "x", &alice(), Grant::Public)));
        assert!(invalid(tree.create_page("/z/new", "x", &alice(), Grant::Public)));
        assert_clean(&tree);

        assert_eq!(tree.resume_pending_operations().unwrap(), vec![op_id]);
        assert_eq!(tree.get_page(&y.id).unwrap().path, "/z/y");
        let late = tree.get_page(&late.id).unwrap();
        assert_eq!(late.path, "/x/foo");
        assert_eq!(late.parent_id, Some(placeholder.id));
        assert!(at(&tree, "/z/foo").is_none());
        assert_clean(&tree);
    }

    #[test]
    fn test_pending_cascade_blocks_overlapping_mutations() {
        let mut tree = tree();
        let x = create(&mut tree, "/x");
        let y = create(&mut tree, "/x/y");
        let other = create(&mut tree, "/other");

        let options = RenameOptions {
            cancel: Some(CancelToken::after_chunks(0)),
            ..RenameOptions::default()
        };
        assert!(matches!(
            tree.rename_page(&x.id, "/z", &alice(), options),
            Err(PageTreeError::Cancelled(_))
        ));

        let invalid = |result: Result<PageNode>| matches!(result, Err(PageTreeError::InvalidOperation { .. }));
        let opts = RenameOptions::default;
        assert!(invalid(tree.rename_page(&y.id, "/y", &alice(), opts())));
        assert!(invalid(tree.rename_page(&other.id, "/z/other", &alice(), opts())));
        assert!(invalid(tree.rename_page(&other.id, "/x/other", &alice(), opts())));
        assert!(matches!(
            tree.delete_page(&x.id, &alice(), DeleteOptions::recursive()),
            Err(PageTreeError::InvalidOperation { .. })
        ));
        let restricted = Grant::Restricted {
            grantees: vec!["alice".to_string()],
        };
        assert!(invalid(tree.change_grant(&y.id, restricted, &alice())));
        assert!(tree.change_grant(&y.id, Grant::Owner, &alice()).is_ok());

        tree.rename_page(&other.id, "/elsewhere", &alice(), opts()).unwrap();
        tree.resume_pending_operations().unwrap();
        assert!(tree.rename_page(&y.id, "/y", &alice(), opts()).is_ok());
        assert_clean(&tree);
    }

    #[test]
    fn test_rename_merges_empty_destination_subtree() {
        let mut tree = tree();
        let x = create(&mut tree, "/x");
        let k = create(&mut tree, "/x/w/k");
        let m = create(&mut tree, "/z/w/m");

        let z = tree.rename_page(&x.id, "/z", &alice(), RenameOptions::default()).unwrap();

        assert_eq!(z.id, x.id);
        let w = at(&tree, "/z/w").unwrap();
        assert!(w.is_empty);
        assert_eq!(w.parent_id, Some(x.id.clone()));
        for id in [&k.id, &m.id] {
            assert_eq!(tree.get_page(id).unwrap().parent_id, Some(w.id.clone()));
        }
        assert_eq!(tree.get_page(&k.id).unwrap().path, "/z/w/k");
        assert!(at(&tree, "/x").is_none());
        assert!(at(&tree, "/x/w").is_none());
        assert_clean(&tree);
    }

    #[test]
    fn test_rename_rejects_target_above_reserved_path() {
        let config = PageTreeConfig {
            reserved_prefixes: vec!["/team/members".to_string()],
            ..PageTreeConfig::default()
        };
        let mut tree = PageTree::create_in_memory(config).unwrap();
        let a = create(&mut tree, "/a");
        let members = create(&mut tree, "/a/members");

        let err = tree.rename_page(&a.id, "/team", &alice(), RenameOptions::default()).unwrap_err();

        assert!(matches!(err, PageTreeError::InvalidOperation { .. }));
        assert_eq!(tree.get_page(&members.id).unwrap().path, "/a/members");
        assert!(tree.pending_operations().unwrap().is_empty());
        assert!(tree.rename_page(&a.id, "/teams", &alice(), RenameOptions::default()).is_ok());
    }

    #[test]
    fn test_delete_rejects_non_recursive_with_children() {
        let mut tree = tree();
        let a = create(&mut tree, "/a");
        let b = create(&mut tree, "/a/b");
        let c = create(&mut tree, "/a/b/c");

        let err = tree.delete_page(&a.id, &alice(), DeleteOptions::default()).unwrap_err();
        assert!(matches!(err, PageTreeError::InvalidOperation { .. }));
        assert!(tree.pending_operations().unwrap().is_empty());

        let result = tree.delete_page(&a.id, &alice(), DeleteOptions::recursive()).unwrap();

        assert_eq!(result.trashed_count, 3);
        assert_eq!(result.trash_path.as_deref(), Some("/trash/a"));
        for (id, path) in [(&a.id, "/trash/a"), (&b.id, "/trash/a/b"), (&c.id, "/trash/a/b/c")] {
            let page = tree.get_page(id).unwrap();
            assert_eq!(page.status, PageStatus::Deleted);
            assert_eq!(page.path, path);
            assert!(page.parent_id.is_none());
            assert_eq!(page.delete_user.as_deref(), Some("alice"));
        }
        assert!(at(&tree, "/a").is_none());
        assert_clean(&tree);
    }

    #[test]
    fn test_delete_leaf_non_recursively() {
        let mut tree = tree();
        let b = create(&mut tree, "/a/b");

        let result = tree.delete_page(&b.id, &alice(), DeleteOptions::default()).unwrap();

        assert_eq!(result.trashed_count, 1);
        assert_eq!(result.pruned_paths, vec!["/a".to_string()]);
        assert!(at(&tree, "/a").is_none());
        assert_clean(&tree);
    }

    #[test]
    fn test_delete_removes_empty_descendants() {
        let config = PageTreeConfig {
            cascade_batch_size: 1,
            ..PageTreeConfig::default()
        };
        let mut tree = PageTree::create_in_memory(config).unwrap();
        let a = create(&mut tree, "/a");
        create(&mut tree, "/a/b/c/d");

        let result = tree.delete_page(&a.id, &alice(), DeleteOptions::recursive()).unwrap();

        assert_eq!(result.trashed_count, 2);
        assert_eq!(result.removed_empty_count, 2);
        let remaining: i64 = tree
            .connection()
            .query_row("SELECT COUNT(*) FROM pages WHERE path LIKE '/a%' OR path LIKE '/trash/a/b%'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(remaining, 1, "only /trash/a/b/c/d is left");
        assert_clean(&tree);
    }

    #[test]
    fn test_delete_structural_rejections() {
        let mut tree = tree();
        let root = at(&tree, "/").unwrap();
        let home = create(&mut tree, "/user/hoge");
        let page = create(&mut tree, "/a");
        tree.delete_page(&page.id, &alice(), DeleteOptions::default()).unwrap();

        let invalid = |result: Result<DeleteResult>| matches!(result, Err(PageTreeError::InvalidOperation { .. }));
        assert!(invalid(tree.delete_page(&root.id, &alice(), DeleteOptions::recursive())));
        assert!(invalid(tree.delete_page(&home.id, &alice(), DeleteOptions::recursive())));
        assert!(invalid(tree.delete_page(&page.id, &alice(), DeleteOptions::recursive())));
        assert!(matches!(
            tree.delete_page("missing", &alice(), DeleteOptions::default()),
            Err(PageTreeError::NotFound(_))
        ));
    }

    #[test]
    fn test_trashed_path_can_be_reused() {
        let mut tree = tree();
        let first = create(&mut tree, "/a");
        tree.delete_page(&first.id, &alice(), DeleteOptions::default()).unwrap();
        let second = create(&mut tree, "/a");
        tree.delete_page(&second.id, &alice(), DeleteOptions::default()).unwrap();

        assert_eq!(tree.get_page(&first.id).unwrap().path, "/trash/a");
        assert_eq!(tree.get_page(&second.id).unwrap().path, "/trash/a");
        assert_clean(&tree);
    }

    #[test]
    fn test_cancelled_delete_can_be_abandoned() {
        let mut tree = tree();
        let a = create(&mut tree, "/a");
        create(&mut tree, "/a/b");

        let options = DeleteOptions::recursive().with_cancel({
            let token = CancelToken::new();
            token.cancel();
            token
        });
        let Err(PageTreeError::Cancelled(op_id)) = tree.delete_page(&a.id, &alice(), options) else {
            panic!("expected cancellation");
        };
        assert_eq!(tree.pending_operations().unwrap().len(), 1);

        let abandoned = tree.abandon_operation(&op_id).unwrap();

        assert_eq!(abandoned.kind, CascadeKind::Delete);
        assert!(at(&tree, "/a/b").is_some());
        assert!(matches!(tree.abandon_operation(&op_id), Err(PageTreeError::NotFound(_))));
        assert_clean(&tree);
    }

    #[test]
    fn test_restricted_page_visibility() {
        let mut tree = tree();
        let grant = Grant::Restricted {
            grantees: vec!["alice".to_string()],
        };
        tree.create_page("/secret", "x", &Principal::user("bob"), grant).unwrap();

        assert!(tree.find_by_path("/secret", &alice()).unwrap().is_some());
        assert!(tree.find_by_path("/secret", &Principal::user("carol")).unwrap().is_none());
        assert!(tree.find_by_path("/secret", &Principal::Anonymous).unwrap().is_none());
    }

    #[test]
    fn test_group_visibility_uses_membership_collaborator() {
        let mut groups = StaticGroupMembership::new();
        groups.add("carol", "editors");
        let mut tree = PageTree::create_in_memory(PageTreeConfig::default())
            .unwrap()
            .with_group_membership(groups);
        let grant = Grant::UserGroup {
            groups: vec!["editors".to_string()],
        };
        tree.create_page("/team", "x", &alice(), grant).unwrap();

        assert!(tree.find_by_path("/team", &Principal::user("carol")).unwrap().is_some());
        assert!(tree.find_by_path("/team", &alice()).unwrap().is_none());
    }

    #[test]
    fn test_change_grant_updates_visibility() {
        let mut tree = tree();
        let page = tree.create_page("/doc", "x", &Principal::user("bob"), Grant::Public).unwrap();

        let updated = tree.change_grant(&page.id, Grant::Owner, &Principal::user("bob")).unwrap();

        assert_eq!(updated.grant, Grant::Owner);
        assert!(tree.find_by_path("/doc", &alice()).unwrap().is_none());
        assert!(tree.find_by_path("/doc", &Principal::user("bob")).unwrap().is_some());
        assert_eq!(tree.list_operations(Some("ChangeGrant"), None).unwrap().len(), 1);

        let shared = Grant::SpecifiedUsers {
            users: vec!["alice".to_string(), "carol".to_string()],
        };
        let updated = tree.change_grant(&page.id, shared.clone(), &Principal::user("bob")).unwrap();
        assert_eq!(updated.grant, shared);
        assert!(tree.find_by_path("/doc", &alice()).unwrap().is_some());
    }

    #[test]
    fn test_change_grant_rejects_empty_and_trashed_pages() {
        let mut tree = tree();
        let leaf = create(&mut tree, "/a/b");
        let a = at(&tree, "/a").unwrap();
        assert!(matches!(
            tree.change_grant(&a.id, Grant::Owner, &alice()),
            Err(PageTreeError::InvalidOperation { .. })
        ));

        tree.delete_page(&leaf.id, &alice(), DeleteOptions::default()).unwrap();
        assert!(matches!(
            tree.change_grant(&leaf.id, Grant::Owner, &alice()),
            Err(PageTreeError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_change_grant_relinks_unlinked_page() {
        let mut tree = tree();
        let page = create(&mut tree, "/a/b");
        tree.connection()
            .execute("UPDATE pages SET parent_id = NULL WHERE id = ?1", [&page.id])
            .unwrap();

        let updated = tree.change_grant(&page.id, Grant::Public, &alice()).unwrap();

        assert_eq!(updated.parent_id, Some(at(&tree, "/a").unwrap().id));
        assert_clean(&tree);
    }

    fn restricted() -> Grant {
        Grant::Restricted {
            grantees: vec!["alice".to_string()],
        }
    }

    fn logged_grant_pruned_paths(tree: &PageTree) -> Vec<String> {
        let json: String = tree
            .connection()
            .query_row(
                "SELECT operation_data FROM operations WHERE operation_type = 'ChangeGrant' ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        match serde_json::from_str(&json).unwrap() {
            Operation::ChangeGrant { pruned_paths, .. } => pruned_paths,
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn test_restricting_only_child_prunes_empty_parent() {
        let mut tree = tree();
        let b = create(&mut tree, "/a/b");

        let updated = tree.change_grant(&b.id, restricted(), &alice()).unwrap();

        assert!(updated.parent_id.is_none());
        assert!(at(&tree, "/a").is_none());
        assert_eq!(at(&tree, "/a/b").unwrap().id, b.id);
        assert_eq!(logged_grant_pruned_paths(&tree), vec!["/a".to_string()]);
        assert_clean(&tree);

        let updated = tree.change_grant(&b.id, Grant::Public, &alice()).unwrap();

        let a = at(&tree, "/a").unwrap();
        assert!(a.is_empty);
        assert_eq!(updated.parent_id, Some(a.id));
        let ancestors: Vec<String> = tree.find_ancestors("/a/b").unwrap().into_iter().map(|p| p.path).collect();
        assert_eq!(ancestors, vec!["/", "/a"]);
        assert!(logged_grant_pruned_paths(&tree).is_empty());
        assert_clean(&tree);
    }

    #[test]
    fn test_restricting_page_with_children_leaves_placeholder() {
        let mut tree = tree();
        let p = create(&mut tree, "/p");
        let c = create(&mut tree, "/p/c");

        tree.change_grant(&p.id, restricted(), &alice()).unwrap();

        let placeholder = PageQueryBuilder::new()
            .attached()
            .with_path("/p")
            .fetch_one(tree.connection())
            .unwrap()
            .unwrap();
        assert!(placeholder.is_empty);
        assert_ne!(placeholder.id, p.id);
        assert_eq!(tree.get_page(&c.id).unwrap().parent_id, Some(placeholder.id.clone()));
        assert_eq!(at(&tree, "/p").unwrap().id, placeholder.id, "the tree page wins the lookup");
        assert_clean(&tree);

        tree.change_grant(&p.id, Grant::Public, &alice()).unwrap();

        assert_eq!(tree.get_page(&c.id).unwrap().parent_id, Some(p.id.clone()));
        assert!(matches!(tree.get_page(&placeholder.id), Err(PageTreeError::NotFound(_))));
        assert_clean(&tree);
    }

    #[test]
    fn test_unrestricting_onto_taken_path_conflicts() {
        let mut tree = tree();
        let hidden = tree.create_page("/q", "x", &alice(), restricted()).unwrap();
        create(&mut tree, "/q");

        let err = tree.change_grant(&hidden.id, Grant::Public, &alice()).unwrap_err();

        assert!(matches!(err, PageTreeError::PathConflict(ref p) if p == "/q"));
        assert!(tree.get_page(&hidden.id).unwrap().grant.detaches());
        assert_clean(&tree);
    }

    #[test]
    fn test_restricted_page_has_no_ancestors() {
        let mut tree = tree();
        let page = tree.create_page("/r/s", "x", &alice(), restricted()).unwrap();

        assert!(page.parent_id.is_none());
        assert!(at(&tree, "/r").is_none());
        assert!(matches!(
            tree.change_grant(&at(&tree, "/").unwrap().id, restricted(), &alice()),
            Err(PageTreeError::InvalidOperation { .. })
        ));
        assert_clean(&tree);
    }

    #[test]
    fn test_restricted_page_moves_and_deletes_alone() {
        let mut tree = tree();
        let page = tree.create_page("/r/s", "x", &alice(), restricted()).unwrap();

        let moved = tree.rename_page(&page.id, "/t/u", &alice(), RenameOptions::default()).unwrap();

        assert_eq!(moved.path, "/t/u");
        assert!(moved.parent_id.is_none());
        assert!(at(&tree, "/t").is_none());
        assert_clean(&tree);

        let result = tree.delete_page(&page.id, &alice(), DeleteOptions::default()).unwrap();

        assert_eq!(result.trashed_count, 1);
        assert!(result.pruned_paths.is_empty());
        assert_eq!(tree.get_page(&page.id).unwrap().path, "/trash/t/u");
        assert_clean(&tree);
    }

    #[test]
    fn test_find_siblings_and_ancestors() {
        let mut tree = tree();
        create(&mut tree, "/a/x");
        create(&mut tree, "/a/y");
        create(&mut tree, "/a/y/z");
        tree.create_page("/a/hidden", "x", &Principal::user("bob"), Grant::Owner).unwrap();

        let siblings: Vec<String> = tree
            .find_siblings("/a/x", &alice())
            .unwrap()
            .into_iter()
            .map(|p| p.path)
            .collect();
        assert_eq!(siblings, vec!["/a/x", "/a/y"]);

        let top: Vec<String> = tree.find_siblings("/a", &alice()).unwrap().into_iter().map(|p| p.path).collect();
        assert_eq!(top, vec!["/a"]);

        let ancestors: Vec<String> = tree.find_ancestors("/a/y/z").unwrap().into_iter().map(|p| p.path).collect();
        assert_eq!(ancestors, vec!["/", "/a", "/a/y"]);
        assert!(tree.find_ancestors("/").unwrap().is_empty());
    }

    #[test]
    fn test_find_children_is_paginated() {
        let mut tree = tree();
        let parent = create(&mut tree, "/list");
        for i in 0..5 {
            create(&mut tree, &format!("/list/item-{i}"));
        }

        let page = tree.find_children(&parent.id, &alice(), 1, 2).unwrap();

        assert_eq!(page.total, 5);
        let paths: Vec<&str> = page.items.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["/list/item-1", "/list/item-2"]);
    }

    #[test]
    fn test_every_mutation_is_logged() {
        let mut tree = tree();
        let a = create(&mut tree, "/a");
        tree.rename_page(&a.id, "/b", &alice(), RenameOptions::default()).unwrap();
        tree.change_grant(&a.id, Grant::Owner, &alice()).unwrap();
        tree.delete_page(&a.id, &alice(), DeleteOptions::default()).unwrap();

        let types: Vec<String> = tree
            .list_operations(None, None)
            .unwrap()
            .into_iter()
            .map(|s| s.operation_type)
            .collect();
        assert_eq!(types, vec!["DeletePage", "ChangeGrant", "RenamePage", "CreatePage"]);
        assert_eq!(tree.purge_all_operations().unwrap(), 4);
    }
}
