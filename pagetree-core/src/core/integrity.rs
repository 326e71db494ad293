//! Whole-collection consistency check for the page tree.
//!
//! [`check_integrity`] loads every page and reports each broken structural
//! rule as a [`Violation`]. Every page is checked, including those an
//! unfinished cascade has yet to reach.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::path_utils::{self, ROOT_PATH};
use crate::core::query::PageQueryBuilder;
use crate::{PageNode, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ViolationKind {
    RootMissing,
    RootEmpty,
    /// No published page exists at the parent path.
    MissingParent { parent_path: String },
    /// A parent page exists but `parent_id` points elsewhere.
    WrongParentLink { expected: String, actual: Option<String> },
    DuplicatePath,
    EmptyWithoutChildren,
    EmptyWithRevision,
    DeletedStillLinked,
    DeletedOutsideTrash,
    /// A restricted page that still has a parent.
    DetachedStillLinked,
    /// A page has `parent_id` pointing at a restricted page.
    ChildOfDetached { parent_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub page_id: Option<String>,
    pub path: String,
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    /// Pages examined.
    pub checked: usize,
    pub violations: Vec<Violation>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Checks parent linkage, path uniqueness, placeholder lifecycle, root
/// presence and trash placement across every page.
///
/// # Errors
///
/// Returns [`crate::PageTreeError::Database`] if the pages cannot be read.
pub fn check_integrity(conn: &Connection, trash_prefix: &str) -> Result<IntegrityReport> {
    let pages = PageQueryBuilder::new().fetch(conn)?;
    let mut report = IntegrityReport {
        checked: pages.len(),
        ..IntegrityReport::default()
    };

    let (live, deleted): (Vec<&PageNode>, Vec<&PageNode>) =
        pages.iter().partition(|page| !page.is_deleted());
    let (detached, published): (Vec<&PageNode>, Vec<&PageNode>) =
        live.into_iter().partition(|page| page.grant.detaches());

    let mut by_path: HashMap<&str, &PageNode> = HashMap::new();
    let mut child_counts: HashMap<&str, usize> = HashMap::new();
    for page in &published {
        if by_path.insert(page.path.as_str(), page).is_some() {
            report.violations.push(violation(page, ViolationKind::DuplicatePath));
        }
        if let Some(parent_id) = &page.parent_id {
            *child_counts.entry(parent_id.as_str()).or_default() += 1;
        }
    }

    match by_path.get(ROOT_PATH) {
        None => report.violations.push(Violation {
            page_id: None,
            path: ROOT_PATH.to_string(),
            kind: ViolationKind::RootMissing,
        }),
        Some(root) if root.is_empty => report.violations.push(violation(root, ViolationKind::RootEmpty)),
        Some(_) => {}
    }

    for page in published.iter().filter(|p| !path_utils::is_root(&p.path)) {
        let parent_path = path_utils::parent_of(&page.path)?;
        match by_path.get(parent_path.as_str()) {
            None => report
                .violations
                .push(violation(page, ViolationKind::MissingParent { parent_path })),
            Some(parent) if page.parent_id.as_deref() != Some(parent.id.as_str()) => {
                report.violations.push(violation(
                    page,
                    ViolationKind::WrongParentLink {
                        expected: parent.id.clone(),
                        actual: page.parent_id.clone(),
                    },
                ));
            }
            Some(_) => {}
        }
        if page.is_empty {
            if page.revision_id.is_some() {
                report.violations.push(violation(page, ViolationKind::EmptyWithRevision));
            }
            if !child_counts.contains_key(page.id.as_str()) {
                report.violations.push(violation(page, ViolationKind::EmptyWithoutChildren));
            }
        }
    }

    for page in &detached {
        if page.parent_id.is_some() {
            report.violations.push(violation(page, ViolationKind::DetachedStillLinked));
        }
        if child_counts.contains_key(page.id.as_str()) {
            report.violations.push(violation(
                page,
                ViolationKind::ChildOfDetached { parent_id: page.id.clone() },
            ));
        }
    }

    for page in deleted {
        if page.parent_id.is_some() {
            report.violations.push(violation(page, ViolationKind::DeletedStillLinked));
        }
        if !path_utils::is_trashed_path(&page.path, trash_prefix) {
            report.violations.push(violation(page, ViolationKind::DeletedOutsideTrash));
        }
    }

    if !report.is_clean() {
        log::warn!("integrity check found {} violation(s)", report.violations.len());
    }
    Ok(report)
}

fn violation(page: &PageNode, kind: ViolationKind) -> Violation {
    Violation {
        page_id: Some(page.id.clone()),
        path: page.path.clone(),
        kind,
    }
}
