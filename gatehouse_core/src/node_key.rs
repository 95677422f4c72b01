//! Node-key algebra.
//!
//! Tree positions are addressed by colon-delimited keys such as `1:8:3`.
//! The parent of a key is its prefix up to the last colon; roots have no
//! colon at all. Descendants of `K` are exactly the keys starting with
//! `K:`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// A validated tree key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    /// Validate and wrap a raw key. Empty keys, empty segments and
    /// leading/trailing colons are rejected.
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.is_empty() || raw.split(':').any(|segment| segment.is_empty()) {
            return Err(CoreError::MalformedKey(raw));
        }
        Ok(NodeKey(raw))
    }

    /// The raw key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A root key has a single segment.
    pub fn is_root(&self) -> bool {
        !self.0.contains(':')
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.0.split(':').count()
    }

    /// The parent key, or `None` for roots.
    pub fn parent(&self) -> Option<NodeKey> {
        self.0.rfind(':').map(|idx| NodeKey(self.0[..idx].to_owned()))
    }

    /// The parent key as stored on rows: the empty string for roots.
    pub fn parent_key(&self) -> String {
        match self.0.rfind(':') {
            Some(idx) => self.0[..idx].to_owned(),
            None => String::new(),
        }
    }

    /// All strict prefixes of this key, root first.
    pub fn ancestors(&self) -> Vec<NodeKey> {
        self.0
            .match_indices(':')
            .map(|(idx, _)| NodeKey(self.0[..idx].to_owned()))
            .collect()
    }

    /// Whether `self` sits strictly below `other` in the tree.
    pub fn is_descendant_of(&self, other: &NodeKey) -> bool {
        self.0.len() > other.0.len()
            && self.0.as_bytes()[other.0.len()] == b':'
            && self.0.starts_with(other.0.as_str())
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The predicate "key equals `K` or descends from `K`", in a form usable
/// both as a point check and against a key-ordered index.
#[derive(Debug, Clone)]
pub struct SubtreeFilter {
    root: NodeKey,
}

impl SubtreeFilter {
    /// Filter for the subtree rooted at `root`.
    pub fn of(root: &NodeKey) -> Self {
        SubtreeFilter { root: root.clone() }
    }

    /// The subtree root.
    pub fn root(&self) -> &NodeKey {
        &self.root
    }

    /// Point check: `key` is the root itself or any descendant.
    pub fn matches(&self, key: &NodeKey) -> bool {
        key == &self.root || key.is_descendant_of(&self.root)
    }

    /// Half-open range `[lo, hi)` covering exactly the strict descendants
    /// of the root in a lexicographically ordered key index. `;` is the
    /// byte after `:`, so every `K:*` key and nothing else falls inside.
    pub fn descendant_range(&self) -> (String, String) {
        (format!("{}:", self.root), format!("{};", self.root))
    }
}
