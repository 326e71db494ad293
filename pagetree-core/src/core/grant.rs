//! Page grants and the viewer visibility predicate.
//!
//! A [`Grant`] is a closed set of visibility levels. Whether a [`Viewer`]
//! may see a page is decided either by [`Grant::is_visible_to`] in memory or,
//! for queries, by the equivalent SQL predicate built in
//! [`crate::core::query`]. Both must agree.
//!
//! Group memberships come from an external collaborator behind the
//! [`GroupMembership`] trait.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::{PageTreeError, Result};

pub const GRANT_PUBLIC: i64 = 1;
pub const GRANT_RESTRICTED: i64 = 2;
pub const GRANT_SPECIFIED: i64 = 3;
pub const GRANT_OWNER: i64 = 4;
pub const GRANT_USER_GROUP: i64 = 5;

/// Visibility level of a page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Grant {
    /// Anyone, including anonymous viewers.
    #[default]
    Public,
    /// Only the listed grantees. A restricted page is detached from the
    /// tree: it keeps its path but has no parent and no children.
    Restricted { grantees: Vec<String> },
    /// Only the listed users.
    SpecifiedUsers { users: Vec<String> },
    /// Only the page creator.
    Owner,
    /// Members of any of the listed groups.
    UserGroup { groups: Vec<String> },
}

/// Which relation a `page_grantees` row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GranteeKind {
    User,
    Group,
}

impl GranteeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
        }
    }
}

impl Grant {
    /// Numeric code persisted in the `grant` column.
    pub fn code(&self) -> i64 {
        match self {
            Self::Public => GRANT_PUBLIC,
            Self::Restricted { .. } => GRANT_RESTRICTED,
            Self::SpecifiedUsers { .. } => GRANT_SPECIFIED,
            Self::Owner => GRANT_OWNER,
            Self::UserGroup { .. } => GRANT_USER_GROUP,
        }
    }

    /// True for grants whose pages live outside the hierarchy.
    pub fn detaches(&self) -> bool {
        matches!(self, Self::Restricted { .. })
    }

    /// Grantee rows to persist alongside the code.
    pub fn grantees(&self) -> Vec<(GranteeKind, &str)> {
        match self {
            Self::Restricted { grantees } => grantees.iter().map(|g| (GranteeKind::User, g.as_str())).collect(),
            Self::SpecifiedUsers { users } => users.iter().map(|u| (GranteeKind::User, u.as_str())).collect(),
            Self::UserGroup { groups } => groups.iter().map(|g| (GranteeKind::Group, g.as_str())).collect(),
            Self::Public | Self::Owner => Vec::new(),
        }
    }

    /// Rebuilds a grant from its stored code and grantee rows.
    ///
    /// # Errors
    ///
    /// Returns [`PageTreeError::NotFound`] for an unknown code.
    pub fn from_stored(code: i64, users: Vec<String>, groups: Vec<String>) -> Result<Self> {
        match code {
            GRANT_PUBLIC => Ok(Self::Public),
            GRANT_RESTRICTED => Ok(Self::Restricted { grantees: users }),
            GRANT_SPECIFIED => Ok(Self::SpecifiedUsers { users }),
            GRANT_OWNER => Ok(Self::Owner),
            GRANT_USER_GROUP => Ok(Self::UserGroup { groups }),
            other => Err(PageTreeError::NotFound(format!("grant code {other}"))),
        }
    }

    /// Decides whether `viewer` may see a page with this grant created by `creator`.
    pub fn is_visible_to(&self, creator: Option<&str>, viewer: &Viewer) -> bool {
        let Some(user) = viewer.user_id() else {
            return matches!(self, Self::Public);
        };
        match self {
            Self::Public => true,
            Self::Restricted { grantees } => grantees.iter().any(|g| g == user),
            Self::SpecifiedUsers { users } => users.iter().any(|u| u == user),
            Self::Owner => creator == Some(user),
            Self::UserGroup { groups } => groups.iter().any(|g| viewer.group_ids.contains(g)),
        }
    }
}

/// The identity performing a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Principal {
    Anonymous,
    User(String),
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::User(id) => Some(id),
        }
    }
}

/// A principal together with its resolved group memberships.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub principal: Principal,
    pub group_ids: HashSet<String>,
}

impl Viewer {
    pub fn anonymous() -> Self {
        Self {
            principal: Principal::Anonymous,
            group_ids: HashSet::new(),
        }
    }

    pub fn new(principal: Principal, group_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            principal,
            group_ids: group_ids.into_iter().collect(),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.principal.user_id()
    }
}

/// Source of truth for "which groups does this user belong to".
pub trait GroupMembership {
    /// Lists every group id `user_id` belongs to.
    ///
    /// # Errors
    ///
    /// Implementations surface their own lookup failures.
    fn group_ids_for(&self, user_id: &str) -> Result<Vec<String>>;
}

/// In-memory group membership table.
#[derive(Debug, Clone, Default)]
pub struct StaticGroupMembership {
    memberships: HashMap<String, Vec<String>>,
}

impl StaticGroupMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `user_id` to `group_id`.
    pub fn add(&mut self, user_id: impl Into<String>, group_id: impl Into<String>) {
        let groups = self.memberships.entry(user_id.into()).or_default();
        let group_id = group_id.into();
        if !groups.contains(&group_id) {
            groups.push(group_id);
        }
    }
}

impl GroupMembership for StaticGroupMembership {
    fn group_ids_for(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self.memberships.get(user_id).cloned().unwrap_or_default())
    }
}

/// Resolves a principal into a [`Viewer`], looking up its groups when it is a user.
///
/// # Errors
///
/// Propagates failures from the membership collaborator.
pub fn resolve_viewer(principal: &Principal, groups: &dyn GroupMembership) -> Result<Viewer> {
    match principal.user_id() {
        None => Ok(Viewer::anonymous()),
        Some(user) => Ok(Viewer::new(principal.clone(), groups.group_ids_for(user)?)),
    }
}
