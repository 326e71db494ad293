//! Option and result types for page deletion.
//!
//! [`DeleteOptions`] is passed to
//! [`PageTree::delete_page`](super::page_tree::PageTree::delete_page);
//! [`DeleteResult`] reports what the cascade did.
//!
//! ## Serialization
//!
//! `DeleteResult` fields serialize in camelCase (`trashedCount`,
//! `removedEmptyCount`), consistent with all other return types in this crate.
//!
//! ## Examples
//!
//! ```rust
//! use pagetree_core::{DeleteOptions, DeleteResult};
//!
//! let options = DeleteOptions::recursive();
//! assert!(options.recursive);
//!
//! let result = DeleteResult {
//!     operation_id: "op-1".to_string(),
//!     page_id: "p-1".to_string(),
//!     trash_path: Some("/trash/a".to_string()),
//!     trashed_count: 3,
//!     removed_empty_count: 1,
//!     pruned_paths: vec![],
//! };
//! let json = serde_json::to_string(&result).unwrap();
//! assert!(json.contains("trashedCount"));
//! assert!(json.contains("removedEmptyCount"));
//! ```

use serde::{Deserialize, Serialize};

use crate::CancelToken;

/// How a delete treats the target's descendants.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Also trash every descendant. Without it, a page with children is rejected.
    pub recursive: bool,
    /// Checked between cascade chunks.
    pub cancel: Option<CancelToken>,
}

impl DeleteOptions {
    /// Options for deleting a page together with its whole subtree.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pagetree_core::DeleteOptions;
    ///
    /// assert!(DeleteOptions::recursive().recursive);
    /// assert!(!DeleteOptions::default().recursive);
    /// ```
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Outcome of a completed delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub operation_id: String,
    /// Id of the page the delete was requested for.
    pub page_id: String,
    /// Where the target now lives; `None` if it was an empty placeholder and was removed.
    pub trash_path: Option<String>,
    /// Pages moved to the trash, the target included.
    pub trashed_count: usize,
    /// Empty placeholders hard-removed, the target included.
    pub removed_empty_count: usize,
    /// Ancestors pruned because the delete left them empty and childless.
    pub pruned_paths: Vec<String>,
}
