use std::fmt;

use serde::{Deserialize, Serialize};

/// Hierarchical path inside the store namespace, used as the key for the
/// metadata cache and the open-file bookkeeping.
///
/// The wrapped string is always normalized: leading `/`, single separators,
/// no trailing slash (the root stays `/`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(path: impl Into<String>) -> Self {
        let raw = path.into();
        let mut normalized = String::with_capacity(raw.len() + 1);
        normalized.push('/');
        for comp in raw.split('/').filter(|s| !s.is_empty()) {
            if !normalized.ends_with('/') {
                normalized.push('/');
            }
            normalized.push_str(comp);
        }
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Return non-empty path components split by `/`.
    /// Example: `/a/b` -> ["a", "b"], `/` -> []
    pub fn components(&self) -> Vec<&str> {
        self.0.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Split path into parent and name components. Root has neither.
    pub fn split_parent_name(&self) -> Option<(StorePath, String)> {
        if self.is_root() {
            return None;
        }
        let last_slash = self.0.rfind('/')?;
        let parent = if last_slash == 0 {
            "/".to_string()
        } else {
            self.0[..last_slash].to_string()
        };
        let name = self.0[last_slash + 1..].to_string();
        Some((StorePath(parent), name))
    }

    pub fn file_name(&self) -> Option<String> {
        self.split_parent_name().map(|(_, name)| name)
    }

    /// True when `self` sits directly under `parent`.
    pub fn is_child_of(&self, parent: &StorePath) -> bool {
        match self.split_parent_name() {
            Some((p, _)) => p == *parent,
            None => false,
        }
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StorePath {
    fn from(value: &str) -> Self {
        StorePath::new(value)
    }
}
