//! Per-user mapping-tree store.
//!
//! The mapping tree is the denormalized projection that lets the two hot
//! queries run off index lookups: one row per node that is granted,
//! asset-granted, or an ancestor of such a node for the user. Rows are
//! replaced wholesale by the rebuilder and never patched in place.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::{NodeId, UserId};
use crate::node_key::{NodeKey, SubtreeFilter};

/// One row of a user's mapping tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingNode {
    /// Owning user.
    pub user: UserId,
    /// The projected node.
    pub node_id: NodeId,
    /// The node's tree key.
    pub key: NodeKey,
    /// Parent key; empty for roots.
    pub parent_key: String,
    /// The node itself is granted: the whole subtree is authorized.
    pub granted: bool,
    /// At least one directly granted asset lives in this node.
    pub asset_granted: bool,
    /// Count of the user's effective-granted assets rooted at this node's
    /// subtree. For a granted row this is the full subtree asset count.
    pub assets_amount: u64,
}

/// One user's rows plus the indices the queries need: `(user, key)` unique,
/// `(user, parent_key)`, `(user, granted)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UserTree {
    rows: BTreeMap<String, MappingNode>,
    by_parent: HashMap<String, BTreeSet<String>>,
    granted: BTreeSet<String>,
}

impl UserTree {
    fn from_rows(rows: Vec<MappingNode>) -> Self {
        let mut tree = UserTree::default();
        for row in rows {
            tree.by_parent
                .entry(row.parent_key.clone())
                .or_default()
                .insert(row.key.as_str().to_owned());
            if row.granted {
                tree.granted.insert(row.key.as_str().to_owned());
            }
            tree.rows.insert(row.key.as_str().to_owned(), row);
        }
        tree
    }
}

/// All users' mapping trees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingTable {
    users: HashMap<UserId, UserTree>,
}

impl MappingTable {
    /// Atomically replace every row of `user` with `rows`. An empty `rows`
    /// removes the user's tree entirely.
    pub fn replace(&mut self, user: UserId, rows: Vec<MappingNode>) {
        if rows.is_empty() {
            self.users.remove(&user);
        } else {
            self.users.insert(user, UserTree::from_rows(rows));
        }
    }

    /// Drop every row of `user`. Part of the user-deletion lifecycle.
    pub fn delete_user(&mut self, user: UserId) {
        self.users.remove(&user);
    }

    /// The row at `(user, key)`, if any.
    pub fn get(&self, user: UserId, key: &str) -> Option<&MappingNode> {
        self.users.get(&user)?.rows.get(key)
    }

    /// Rows whose `parent_key` equals `parent_key`, key-ordered.
    pub fn children_of(&self, user: UserId, parent_key: &str) -> Vec<&MappingNode> {
        let Some(tree) = self.users.get(&user) else {
            return Vec::new();
        };
        let Some(keys) = tree.by_parent.get(parent_key) else {
            return Vec::new();
        };
        keys.iter().filter_map(|k| tree.rows.get(k)).collect()
    }

    /// Root rows (`parent_key = ""`), key-ordered.
    pub fn roots(&self, user: UserId) -> Vec<&MappingNode> {
        self.children_of(user, "")
    }

    /// Rows strictly below `root`, key-ordered.
    pub fn descendants(&self, user: UserId, root: &NodeKey) -> Vec<&MappingNode> {
        let Some(tree) = self.users.get(&user) else {
            return Vec::new();
        };
        let (lo, hi) = SubtreeFilter::of(root).descendant_range();
        tree.rows.range(lo..hi).map(|(_, row)| row).collect()
    }

    /// Granted rows strictly below `root`, key-ordered.
    pub fn granted_descendants(&self, user: UserId, root: &NodeKey) -> Vec<&MappingNode> {
        self.descendants(user, root)
            .into_iter()
            .filter(|row| row.granted)
            .collect()
    }

    /// Asset-holding ungranted rows strictly below `root`, key-ordered.
    pub fn asset_granted_descendants(&self, user: UserId, root: &NodeKey) -> Vec<&MappingNode> {
        self.descendants(user, root)
            .into_iter()
            .filter(|row| row.asset_granted && !row.granted)
            .collect()
    }

    /// Whether any strict ancestor of `key` carries `granted = true`.
    pub fn has_granted_ancestor(&self, user: UserId, key: &NodeKey) -> bool {
        let Some(tree) = self.users.get(&user) else {
            return false;
        };
        key.ancestors()
            .iter()
            .any(|ancestor| tree.granted.contains(ancestor.as_str()))
    }

    /// All rows of `user`, key-ordered.
    pub fn rows_for_user(&self, user: UserId) -> Vec<&MappingNode> {
        self.users
            .get(&user)
            .map(|tree| tree.rows.values().collect())
            .unwrap_or_default()
    }
}
