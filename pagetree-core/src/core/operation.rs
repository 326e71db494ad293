//! Structural operation records for the page tree operation log.

use crate::Grant;
use serde::{Deserialize, Serialize};

/// A single completed structural mutation recorded in the operation log.
///
/// Every variant carries a stable `operation_id`, a wall-clock `timestamp`
/// and the `actor` (user id, `None` for anonymous or system work).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    /// A page was authored, either as a new node or by filling a placeholder.
    CreatePage {
        operation_id: String,
        timestamp: i64,
        actor: Option<String>,
        page_id: String,
        path: String,
        parent_id: Option<String>,
        /// True when an existing empty placeholder was turned into a page.
        filled_placeholder: bool,
    },
    /// A page and its subtree moved to a new path.
    RenamePage {
        operation_id: String,
        timestamp: i64,
        actor: Option<String>,
        page_id: String,
        from_path: String,
        to_path: String,
        /// Number of descendants whose path was rewritten.
        descendant_count: usize,
        /// Empty placeholders removed after the move.
        pruned_paths: Vec<String>,
    },
    /// A page (and optionally its subtree) was moved to the trash.
    DeletePage {
        operation_id: String,
        timestamp: i64,
        actor: Option<String>,
        page_id: String,
        path: String,
        recursive: bool,
        /// Pages moved to the trash, including the target itself.
        trashed_count: usize,
        /// Empty placeholders hard-removed along the way.
        removed_empty_count: usize,
        pruned_paths: Vec<String>,
    },
    /// A page's visibility changed, possibly moving it in or out of the tree.
    ChangeGrant {
        operation_id: String,
        timestamp: i64,
        actor: Option<String>,
        page_id: String,
        path: String,
        grant: Grant,
        /// Placeholders pruned because the page left the tree.
        #[serde(default)]
        pruned_paths: Vec<String>,
    },
}

impl Operation {
    /// Returns the stable identifier for this operation.
    #[must_use]
    pub fn operation_id(&self) -> &str {
        match self {
            Self::CreatePage { operation_id, .. }
            | Self::RenamePage { operation_id, .. }
            | Self::DeletePage { operation_id, .. }
            | Self::ChangeGrant { operation_id, .. } => operation_id,
        }
    }

    /// Returns the Unix timestamp (seconds) when this operation completed.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::CreatePage { timestamp, .. }
            | Self::RenamePage { timestamp, .. }
            | Self::DeletePage { timestamp, .. }
            | Self::ChangeGrant { timestamp, .. } => *timestamp,
        }
    }

    /// Returns the user who performed the operation.
    #[must_use]
    pub fn actor(&self) -> Option<&str> {
        match self {
            Self::CreatePage { actor, .. }
            | Self::RenamePage { actor, .. }
            | Self::DeletePage { actor, .. }
            | Self::ChangeGrant { actor, .. } => actor.as_deref(),
        }
    }

    /// Returns the path the operation targeted (the source path for renames).
    #[must_use]
    pub fn target_path(&self) -> &str {
        match self {
            Self::CreatePage { path, .. }
            | Self::DeletePage { path, .. }
            | Self::ChangeGrant { path, .. } => path,
            Self::RenamePage { from_path, .. } => from_path,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CreatePage { .. } => "CreatePage",
            Self::RenamePage { .. } => "RenamePage",
            Self::DeletePage { .. } => "DeletePage",
            Self::ChangeGrant { .. } => "ChangeGrant",
        }
    }
}
