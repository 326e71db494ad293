//! Core library for a wiki page tree: a materialized path hierarchy stored in SQLite.
//!
//! The primary entry point is [`PageTree`], which represents an open page
//! database. All structural mutations (create, rename, delete, grant change)
//! go through `PageTree` methods; subtree-wide changes run as chunked,
//! resumable cascades.
//!
//! Types are re-exported from their respective sub-modules for convenience;
//! consumers should import from the crate root rather than the `core` module.

pub mod core;

pub use core::path_utils;

// Re-export commonly used types.
#[doc(inline)]
pub use core::{
    cascade::{CancelToken, CascadeKind, CascadeState, PendingOperation},
    config::{load_config, save_config, PageTreeConfig},
    delete::{DeleteOptions, DeleteResult},
    error::{PageTreeError, Result},
    grant::{
        resolve_viewer, Grant, GranteeKind, GroupMembership, Principal, StaticGroupMembership,
        Viewer,
    },
    integrity::{IntegrityReport, Violation, ViolationKind},
    operation::Operation,
    operation_log::{OperationLog, OperationSummary, PurgeStrategy},
    page::{PageNode, PageStatus, Revision},
    page_tree::{PageTree, RenameOptions},
    query::{PageQueryBuilder, Paginated, PathOrder, SortedPageQuery},
    storage::Storage,
};
