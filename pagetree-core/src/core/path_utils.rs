//! Pure helpers for slash-separated page paths.
//!
//! A normalized path has a leading `/`, no trailing `/` (except the root
//! itself) and no repeated separators. Every function here is deterministic
//! and performs no I/O.

use regex::Regex;

use crate::{PageTreeError, Result};

/// The root page path.
pub const ROOT_PATH: &str = "/";

/// Normalizes `raw` into a canonical page path.
///
/// Empty input (or input made only of separators) yields the root path.
/// Whitespace is part of a segment and is kept as given.
pub fn normalize(raw: &str) -> String {
    let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return ROOT_PATH.to_string();
    }
    format!("/{}", segments.join("/"))
}

/// Returns true for the root path.
pub fn is_root(path: &str) -> bool {
    path == ROOT_PATH
}

/// Returns `path` with its final segment removed.
///
/// # Errors
///
/// Returns [`PageTreeError::InvalidOperation`] for the root path, which has no parent.
pub fn parent_of(path: &str) -> Result<String> {
    if is_root(path) {
        return Err(PageTreeError::invalid(path, "the root page has no parent"));
    }
    match path.rfind('/') {
        Some(0) | None => Ok(ROOT_PATH.to_string()),
        Some(idx) => Ok(path[..idx].to_string()),
    }
}

/// Lists the ancestors of `path`, root first, excluding `path` itself.
///
/// `ancestor_chain("/a/b/c") == ["/", "/a", "/a/b"]`; the root has no ancestors.
pub fn ancestor_chain(path: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = path.to_string();
    // every parent_of strictly shortens the path, so this terminates at root
    while let Ok(parent) = parent_of(&current) {
        chain.push(parent.clone());
        current = parent;
    }
    chain.reverse();
    chain
}

/// Number of segments in `path`; the root has depth 0.
pub fn depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

/// Returns true when `path` lies strictly below `ancestor`.
pub fn is_descendant_of(path: &str, ancestor: &str) -> bool {
    if is_root(ancestor) {
        return !is_root(path);
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Rewrites the `old_prefix` of `path` to `new_prefix`.
///
/// Returns `None` when `path` is neither `old_prefix` nor one of its descendants.
pub fn replace_prefix(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if path == old_prefix {
        return Some(new_prefix.to_string());
    }
    if !is_descendant_of(path, old_prefix) || is_root(old_prefix) {
        return None;
    }
    Some(format!("{new_prefix}{}", &path[old_prefix.len()..]))
}

/// Moves `path` under the trash prefix: `/a/b` becomes `/trash/a/b`.
pub fn to_trash_path(path: &str, trash_prefix: &str) -> String {
    if is_root(path) {
        return trash_prefix.to_string();
    }
    format!("{trash_prefix}{path}")
}

/// Returns true for the trash prefix itself and anything beneath it.
pub fn is_trashed_path(path: &str, trash_prefix: &str) -> bool {
    path == trash_prefix || is_descendant_of(path, trash_prefix)
}

/// Returns true for a reserved prefix itself and its direct children.
///
/// With the default `/user` prefix, `/user` and `/user/alice` (a home page)
/// are reserved while `/user/alice/memo` is an ordinary page.
pub fn is_reserved_path(path: &str, reserved_prefixes: &[String]) -> bool {
    reserved_prefixes.iter().any(|prefix| {
        path == prefix || (is_descendant_of(path, prefix) && depth(path) == depth(prefix) + 1)
    })
}

/// Returns true when `path` is reserved or is an ancestor of a reserved prefix.
pub fn covers_reserved_path(path: &str, reserved_prefixes: &[String]) -> bool {
    is_reserved_path(path, reserved_prefixes)
        || reserved_prefixes
            .iter()
            .any(|prefix| is_descendant_of(prefix, path))
}

/// Matcher for the direct children of `parent_of(path)`.
#[derive(Debug, Clone)]
pub struct SiblingPattern {
    regex: Regex,
}

impl SiblingPattern {
    /// The anchored regular expression, suitable for the SQL `REGEXP` operator.
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

/// Builds the sibling matcher for `path`.
///
/// Siblings of a top-level page (or of the root) are all top-level pages.
///
/// # Errors
///
/// Returns [`PageTreeError::InvalidOperation`] if the pattern cannot be compiled.
pub fn sibling_pattern(path: &str) -> Result<SiblingPattern> {
    let source = match parent_of(path) {
        Ok(parent) if !is_root(&parent) => format!("^{}/[^/]+$", regex::escape(&parent)),
        _ => "^/[^/]+$".to_string(),
    };
    let regex = Regex::new(&source).map_err(|e| PageTreeError::invalid(path, e.to_string()))?;
    Ok(SiblingPattern { regex })
}
