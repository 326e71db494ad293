//! Composable filters over the `pages` table.
//!
//! [`PageQueryBuilder`] is consumed and returned by every refinement, so a
//! builder that has been cloned or handed to another query is never changed
//! behind its back. Ordering is applied last: [`PageQueryBuilder::sort_ancestors`]
//! and [`PageQueryBuilder::sort_by_path`] return a [`SortedPageQuery`] which
//! only supports execution.

use rusqlite::types::Value;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::core::grant::{GRANT_OWNER, GRANT_PUBLIC, GRANT_RESTRICTED, GRANT_SPECIFIED, GRANT_USER_GROUP};
use crate::core::path_utils::{self, SiblingPattern};
use crate::{Grant, PageNode, PageStatus, Result, Viewer};

const NO_PARAMS: [Value; 0] = [];

/// Separator for grantee lists folded into a single column.
const GRANTEE_SEPARATOR: char = '\u{1f}';

const PAGE_SELECT: &str = "SELECT p.id, p.path, p.parent_id, p.is_empty, p.grant_code, p.status,
        p.revision_id, p.creator, p.last_update_user, p.created_at, p.updated_at,
        p.delete_user, p.deleted_at,
        (SELECT GROUP_CONCAT(g.target_id, char(31)) FROM page_grantees g
          WHERE g.page_id = p.id AND g.kind = 'user') AS users_csv,
        (SELECT GROUP_CONCAT(g.target_id, char(31)) FROM page_grantees g
          WHERE g.page_id = p.id AND g.kind = 'group') AS groups_csv
   FROM pages p";

/// Depth of a path in SQL, with the root sorted before its top-level children.
const ANCESTOR_ORDER: &str = "ORDER BY (CASE WHEN p.path = '/' THEN 0
        ELSE length(p.path) - length(replace(p.path, '/', '')) END), p.path";

/// Direction for [`PageQueryBuilder::sort_by_path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathOrder {
    Ascending,
    Descending,
}

/// One page of results plus the unpaginated total.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paginated<T> {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Default)]
pub struct PageQueryBuilder {
    conditions: Vec<String>,
    params: Vec<Value>,
}

impl PageQueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn and(mut self, condition: impl Into<String>, params: impl IntoIterator<Item = Value>) -> Self {
        self.conditions.push(condition.into());
        self.params.extend(params);
        self
    }

    /// Only live pages.
    pub fn published(self) -> Self {
        self.and("p.status = ?", [Value::Text(PageStatus::Published.as_str().to_string())])
    }

    /// Only live pages that take part in the hierarchy.
    ///
    /// A `Restricted` page is detached: it keeps its path but has no parent,
    /// no children and does not occupy its path in the tree.
    pub fn attached(self) -> Self {
        self.published().and(format!("p.grant_code <> {GRANT_RESTRICTED}"), NO_PARAMS)
    }

    pub fn detached(self) -> Self {
        self.published().and(format!("p.grant_code = {GRANT_RESTRICTED}"), NO_PARAMS)
    }

    pub fn with_id(self, id: &str) -> Self {
        self.and("p.id = ?", [Value::Text(id.to_string())])
    }

    pub fn with_path(self, path: &str) -> Self {
        self.and("p.path = ?", [Value::Text(path.to_string())])
    }

    /// Restricts results to exactly `paths`. An empty set matches nothing.
    pub fn by_paths(self, paths: &[String]) -> Self {
        if paths.is_empty() {
            return self.and("0", NO_PARAMS);
        }
        let placeholders = vec!["?"; paths.len()].join(", ");
        self.and(
            format!("p.path IN ({placeholders})"),
            paths.iter().map(|p| Value::Text(p.clone())),
        )
    }

    pub fn children_of(self, parent_id: &str) -> Self {
        self.and("p.parent_id = ?", [Value::Text(parent_id.to_string())])
    }

    /// Every page strictly below `prefix`.
    pub fn descendants_of(self, prefix: &str) -> Self {
        if path_utils::is_root(prefix) {
            return self.and("p.path <> '/'", NO_PARAMS);
        }
        self.and(
            "p.path LIKE ? ESCAPE '\\'",
            [Value::Text(descendant_pattern(prefix))],
        )
    }

    pub fn matching(self, pattern: &SiblingPattern) -> Self {
        self.and("p.path REGEXP ?", [Value::Text(pattern.as_str().to_string())])
    }

    /// Restricts results to pages `viewer` is allowed to see.
    ///
    /// Mirrors [`Grant::is_visible_to`] as a SQL predicate so that counts and
    /// pagination are computed over visible pages only.
    pub fn viewer(self, viewer: &Viewer) -> Self {
        let Some(user) = viewer.user_id() else {
            return self.and(format!("p.grant_code = {GRANT_PUBLIC}"), NO_PARAMS);
        };
        let mut clause = format!(
            "(p.grant_code = {GRANT_PUBLIC}
              OR (p.grant_code IN ({GRANT_RESTRICTED}, {GRANT_SPECIFIED}) AND EXISTS (
                    SELECT 1 FROM page_grantees g
                     WHERE g.page_id = p.id AND g.kind = 'user' AND g.target_id = ?))
              OR (p.grant_code = {GRANT_OWNER} AND p.creator = ?)"
        );
        let mut params = vec![Value::Text(user.to_string()), Value::Text(user.to_string())];

        let mut groups: Vec<&String> = viewer.group_ids.iter().collect();
        groups.sort();
        if !groups.is_empty() {
            let placeholders = vec!["?"; groups.len()].join(", ");
            clause.push_str(&format!(
                "
              OR (p.grant_code = {GRANT_USER_GROUP} AND EXISTS (
                    SELECT 1 FROM page_grantees g
                     WHERE g.page_id = p.id AND g.kind = 'group' AND g.target_id IN ({placeholders})))"
            ));
            params.extend(groups.into_iter().map(|g| Value::Text(g.clone())));
        }
        clause.push(')');
        self.and(clause, params)
    }

    /// Orders shallowest-first; must be the last refinement.
    pub fn sort_ancestors(self) -> SortedPageQuery {
        SortedPageQuery {
            builder: self,
            order: ANCESTOR_ORDER.to_string(),
        }
    }

    /// Orders lexicographically by path, which places every ancestor before its descendants.
    pub fn sort_by_path(self, order: PathOrder) -> SortedPageQuery {
        let direction = match order {
            PathOrder::Ascending => "ASC",
            PathOrder::Descending => "DESC",
        };
        SortedPageQuery {
            builder: self,
            order: format!("ORDER BY p.path {direction}"),
        }
    }

    fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }

    pub fn fetch(&self, conn: &Connection) -> Result<Vec<PageNode>> {
        self.clone().sort_by_path(PathOrder::Ascending).fetch(conn)
    }

    pub fn fetch_one(&self, conn: &Connection) -> Result<Option<PageNode>> {
        Ok(self
            .clone()
            .sort_by_path(PathOrder::Ascending)
            .fetch_limited(conn, 1)?
            .into_iter()
            .next())
    }

    pub fn count(&self, conn: &Connection) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM pages p{}", self.where_clause());
        let count: i64 = conn.query_row(&sql, rusqlite::params_from_iter(self.params.iter()), |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn exists(&self, conn: &Connection) -> Result<bool> {
        let sql = format!("SELECT EXISTS (SELECT 1 FROM pages p{})", self.where_clause());
        let exists: bool = conn.query_row(&sql, rusqlite::params_from_iter(self.params.iter()), |row| row.get(0))?;
        Ok(exists)
    }
}

/// A fully refined query with its ordering fixed.
#[derive(Debug, Clone)]
pub struct SortedPageQuery {
    builder: PageQueryBuilder,
    order: String,
}

impl SortedPageQuery {
    fn run(&self, conn: &Connection, suffix: &str, extra: &[Value]) -> Result<Vec<PageNode>> {
        let sql = format!("{PAGE_SELECT}{} {}{suffix}", self.builder.where_clause(), self.order);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(self.builder.params.iter().chain(extra.iter())),
                map_page_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(page_from_row).collect()
    }

    pub fn fetch(&self, conn: &Connection) -> Result<Vec<PageNode>> {
        self.run(conn, "", &[])
    }

    pub fn fetch_limited(&self, conn: &Connection, limit: usize) -> Result<Vec<PageNode>> {
        self.run(conn, " LIMIT ?", &[Value::Integer(limit as i64)])
    }

    /// Offset-based pagination; `total` counts every match, not just this page.
    pub fn paginate(&self, conn: &Connection, offset: usize, limit: usize) -> Result<Paginated<PageNode>> {
        let total = self.builder.count(conn)?;
        let items = self.run(
            conn,
            " LIMIT ? OFFSET ?",
            &[Value::Integer(limit as i64), Value::Integer(offset as i64)],
        )?;
        Ok(Paginated { total, offset, limit, items })
    }
}

/// First tree path under `new_prefix` that blocks moving the subtree below `old_prefix` there.
///
/// Empty placeholders at the destination do not block: they are merged into
/// the incoming page when it arrives. A destination inside the moving subtree
/// always blocks.
pub(crate) fn first_move_collision(conn: &Connection, old_prefix: &str, new_prefix: &str) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;

    // substr() counts characters, not bytes
    let suffix_start = old_prefix.chars().count() as i64 + 1;
    let collision = conn
        .query_row(
            &format!(
                "SELECT t.path FROM pages d
                   JOIN pages t ON t.path = ?2 || substr(d.path, ?3)
                    AND t.status = 'published' AND t.grant_code <> {GRANT_RESTRICTED}
                  WHERE d.status = 'published' AND d.grant_code <> {GRANT_RESTRICTED}
                    AND d.path LIKE ?1 ESCAPE '\\'
                    AND (t.is_empty = 0 OR t.path = ?4 OR t.path LIKE ?1 ESCAPE '\\')
                  ORDER BY t.path LIMIT 1"
            ),
            rusqlite::params![descendant_pattern(old_prefix), new_prefix, suffix_start, old_prefix],
            |row| row.get(0),
        )
        .optional()?;
    Ok(collision)
}

/// `LIKE` pattern matching every path strictly below `prefix`.
pub(crate) fn descendant_pattern(prefix: &str) -> String {
    format!("{}/%", escape_like(prefix))
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Raw `pages` row before grantee lists are parsed.
struct PageRow {
    id: String,
    path: String,
    parent_id: Option<String>,
    is_empty: bool,
    grant_code: i64,
    status: String,
    revision_id: Option<String>,
    creator: Option<String>,
    last_update_user: Option<String>,
    created_at: i64,
    updated_at: i64,
    delete_user: Option<String>,
    deleted_at: Option<i64>,
    users_csv: Option<String>,
    groups_csv: Option<String>,
}

fn map_page_row(row: &rusqlite::Row) -> rusqlite::Result<PageRow> {
    Ok(PageRow {
        id: row.get(0)?,
        path: row.get(1)?,
        parent_id: row.get(2)?,
        is_empty: row.get::<_, i64>(3)? != 0,
        grant_code: row.get(4)?,
        status: row.get(5)?,
        revision_id: row.get(6)?,
        creator: row.get(7)?,
        last_update_user: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        delete_user: row.get(11)?,
        deleted_at: row.get(12)?,
        users_csv: row.get(13)?,
        groups_csv: row.get(14)?,
    })
}

fn split_grantees(csv: Option<String>) -> Vec<String> {
    let mut ids: Vec<String> = csv
        .unwrap_or_default()
        .split(GRANTEE_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    ids.sort();
    ids
}

fn page_from_row(row: PageRow) -> Result<PageNode> {
    Ok(PageNode {
        grant: Grant::from_stored(row.grant_code, split_grantees(row.users_csv), split_grantees(row.groups_csv))?,
        status: PageStatus::parse(&row.status)?,
        id: row.id,
        path: row.path,
        parent_id: row.parent_id,
        is_empty: row.is_empty,
        revision_id: row.revision_id,
        creator: row.creator,
        last_update_user: row.last_update_user,
        created_at: row.created_at,
        updated_at: row.updated_at,
        delete_user: row.delete_user,
        deleted_at: row.deleted_at,
    })
}
