//! Internal domain modules for the page tree core library.
//!
//! All public types from these modules are re-exported at the crate root
//! with `#[doc(inline)]`; import from there in preference to this module.

pub mod cascade;
pub mod config;
pub mod delete;
pub mod error;
pub mod grant;
pub mod integrity;
pub mod materializer;
pub mod operation;
pub mod operation_log;
pub mod page;
pub mod page_tree;
pub mod path_utils;
pub mod query;
pub mod storage;

#[doc(inline)]
pub use cascade::{CancelToken, CascadeKind, CascadeState, PendingOperation};
#[doc(inline)]
pub use config::{load_config, save_config, PageTreeConfig};
#[doc(inline)]
pub use delete::{DeleteOptions, DeleteResult};
#[doc(inline)]
pub use error::{PageTreeError, Result};
#[doc(inline)]
pub use grant::{
    resolve_viewer, Grant, GranteeKind, GroupMembership, Principal, StaticGroupMembership, Viewer,
};
#[doc(inline)]
pub use integrity::{IntegrityReport, Violation, ViolationKind};
#[doc(inline)]
pub use operation::Operation;
#[doc(inline)]
pub use operation_log::{OperationLog, OperationSummary, PurgeStrategy};
#[doc(inline)]
pub use page::{PageNode, PageStatus, Revision};
#[doc(inline)]
pub use page_tree::{PageTree, RenameOptions};
#[doc(inline)]
pub use query::{PageQueryBuilder, Paginated, PathOrder, SortedPageQuery};
#[doc(inline)]
pub use storage::Storage;
