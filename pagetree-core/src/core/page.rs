use serde::{Deserialize, Serialize};

use crate::{Grant, PageTreeError, Result};

/// Lifecycle marker of a page document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Published,
    Deleted,
}

impl PageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "published" => Ok(Self::Published),
            "deleted" => Ok(Self::Deleted),
            other => Err(PageTreeError::NotFound(format!("page status '{other}'"))),
        }
    }
}

/// A node of the materialized page tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageNode {
    pub id: String,
    pub path: String,
    pub parent_id: Option<String>,
    pub is_empty: bool,
    pub grant: Grant,
    pub status: PageStatus,
    pub revision_id: Option<String>,
    pub creator: Option<String>,
    pub last_update_user: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub delete_user: Option<String>,
    pub deleted_at: Option<i64>,
}

impl PageNode {
    pub fn is_deleted(&self) -> bool {
        self.status == PageStatus::Deleted
    }
}

/// A stored content revision. Only its id matters to the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub id: String,
    pub page_id: String,
    pub body: String,
    pub author: Option<String>,
    pub created_at: i64,
}
