//! Authoritative store: tables, indices, transactions and snapshots.
//!
//! The core works against a single in-memory table set behind one writer
//! lock. A transaction holds the write guard for its whole duration,
//! mutates in place and restores a pre-transaction snapshot on error, which
//! gives atomic commit/rollback plus read-your-writes for the invalidation
//! bus.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::events::RebuildTaskTable;
use crate::mapping::MappingTable;
use crate::model::{
    Asset, AssetId, GroupId, Node, NodeId, Permission, PermissionId, User, UserGroup, UserId,
};
use crate::node_key::{NodeKey, SubtreeFilter};

/// The full table set: shared authoritative relations (read-mostly), the
/// core-owned mapping and task tables, and the secondary indices the hot
/// queries rely on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub(crate) users: IndexMap<UserId, User>,
    pub(crate) groups: IndexMap<GroupId, UserGroup>,
    pub(crate) nodes: IndexMap<NodeId, Node>,
    pub(crate) assets: IndexMap<AssetId, Asset>,
    pub(crate) permissions: IndexMap<PermissionId, Permission>,

    pub(crate) asset_nodes: HashMap<AssetId, HashSet<NodeId>>,
    pub(crate) node_assets: HashMap<NodeId, HashSet<AssetId>>,

    pub(crate) node_key_index: BTreeMap<String, NodeId>,
    pub(crate) perms_by_user: HashMap<UserId, HashSet<PermissionId>>,
    pub(crate) perms_by_group: HashMap<GroupId, HashSet<PermissionId>>,
    pub(crate) perms_by_node: HashMap<NodeId, HashSet<PermissionId>>,
    pub(crate) perms_by_asset: HashMap<AssetId, HashSet<PermissionId>>,
    pub(crate) groups_by_user: HashMap<UserId, HashSet<GroupId>>,

    pub(crate) mapping: MappingTable,
    pub(crate) tasks: RebuildTaskTable,
}

impl Tables {
    /// Look up a node by id.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Look up a node by key.
    pub fn node_by_key(&self, key: &str) -> Option<&Node> {
        self.node_key_index.get(key).and_then(|id| self.nodes.get(id))
    }

    /// Look up an asset by id.
    pub fn asset(&self, id: AssetId) -> Option<&Asset> {
        self.assets.get(&id)
    }

    /// Look up a permission by id.
    pub fn permission(&self, id: PermissionId) -> Option<&Permission> {
        self.permissions.get(&id)
    }

    /// Node ids in the subtree of `root`, the root's own node included,
    /// via a range scan over the key-ordered index.
    pub fn subtree_node_ids(&self, root: &NodeKey) -> Vec<NodeId> {
        let mut out = Vec::new();
        if let Some(&id) = self.node_key_index.get(root.as_str()) {
            out.push(id);
        }
        let (lo, hi) = SubtreeFilter::of(root).descendant_range();
        out.extend(self.node_key_index.range(lo..hi).map(|(_, &id)| id));
        out
    }

    /// Nodes in the subtree of `root`, the root included, key-ordered.
    pub fn nodes_in_subtree(&self, root: &NodeKey) -> Vec<&Node> {
        self.subtree_node_ids(root)
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .collect()
    }

    /// Child nodes of `key` from the authoritative node table, key-ordered.
    pub fn child_nodes(&self, key: &NodeKey) -> Vec<&Node> {
        let (lo, hi) = SubtreeFilter::of(key).descendant_range();
        self.node_key_index
            .range(lo..hi)
            .filter_map(|(_, &id)| self.nodes.get(&id))
            .filter(|node| node.parent_key == key.as_str())
            .collect()
    }

    pub(crate) fn insert_user(&mut self, user: User) {
        self.users.insert(user.id, user);
    }

    pub(crate) fn insert_group(&mut self, group: UserGroup) {
        for &user in &group.users {
            self.groups_by_user.entry(user).or_default().insert(group.id);
        }
        self.groups.insert(group.id, group);
    }

    /// Insert a node; the parent of a non-root key must already exist.
    pub(crate) fn insert_node(&mut self, node: Node) -> Result<(), CoreError> {
        if !node.key.is_root() && !self.node_key_index.contains_key(&node.key.parent_key()) {
            return Err(CoreError::IntegrityViolation(format!(
                "node {} inserted before its parent",
                node.key
            )));
        }
        self.node_key_index.insert(node.key.as_str().to_owned(), node.id);
        self.nodes.insert(node.id, node);
        Ok(())
    }

    pub(crate) fn insert_asset(&mut self, asset: Asset) {
        self.assets.insert(asset.id, asset);
    }

    pub(crate) fn insert_permission(&mut self, permission: Permission) {
        let id = permission.id;
        for &user in &permission.users {
            self.perms_by_user.entry(user).or_default().insert(id);
        }
        for &group in &permission.groups {
            self.perms_by_group.entry(group).or_default().insert(id);
        }
        for &node in &permission.nodes {
            self.perms_by_node.entry(node).or_default().insert(id);
        }
        for &asset in &permission.assets {
            self.perms_by_asset.entry(asset).or_default().insert(id);
        }
        self.permissions.insert(id, permission);
    }

    pub(crate) fn delete_permission(&mut self, id: PermissionId) -> Result<(), CoreError> {
        let permission = self
            .permissions
            .shift_remove(&id)
            .ok_or(CoreError::NotFound("permission"))?;
        for user in &permission.users {
            if let Some(set) = self.perms_by_user.get_mut(user) {
                set.remove(&id);
            }
        }
        for group in &permission.groups {
            if let Some(set) = self.perms_by_group.get_mut(group) {
                set.remove(&id);
            }
        }
        for node in &permission.nodes {
            if let Some(set) = self.perms_by_node.get_mut(node) {
                set.remove(&id);
            }
        }
        for asset in &permission.assets {
            if let Some(set) = self.perms_by_asset.get_mut(asset) {
                set.remove(&id);
            }
        }
        Ok(())
    }

    /// Remove a user and everything hanging off them: group membership,
    /// permission links, mapping rows and pending tasks.
    pub(crate) fn delete_user(&mut self, id: UserId) -> Result<(), CoreError> {
        self.users
            .shift_remove(&id)
            .ok_or(CoreError::NotFound("user"))?;
        if let Some(groups) = self.groups_by_user.remove(&id) {
            for group in groups {
                if let Some(row) = self.groups.get_mut(&group) {
                    row.users.remove(&id);
                }
            }
        }
        if let Some(perms) = self.perms_by_user.remove(&id) {
            for perm in perms {
                if let Some(row) = self.permissions.get_mut(&perm) {
                    row.users.remove(&id);
                }
            }
        }
        self.mapping.delete_user(id);
        self.tasks.delete_user(id);
        Ok(())
    }

    pub(crate) fn add_group_users(
        &mut self,
        group: GroupId,
        users: &[UserId],
    ) -> Result<(), CoreError> {
        let row = self.groups.get_mut(&group).ok_or(CoreError::NotFound("group"))?;
        for &user in users {
            row.users.insert(user);
            self.groups_by_user.entry(user).or_default().insert(group);
        }
        Ok(())
    }

    pub(crate) fn remove_group_users(
        &mut self,
        group: GroupId,
        users: &[UserId],
    ) -> Result<(), CoreError> {
        let row = self.groups.get_mut(&group).ok_or(CoreError::NotFound("group"))?;
        for user in users {
            row.users.remove(user);
            if let Some(set) = self.groups_by_user.get_mut(user) {
                set.remove(&group);
            }
        }
        Ok(())
    }

    pub(crate) fn add_permission_users(
        &mut self,
        permission: PermissionId,
        users: &[UserId],
    ) -> Result<(), CoreError> {
        let row = self
            .permissions
            .get_mut(&permission)
            .ok_or(CoreError::NotFound("permission"))?;
        for &user in users {
            row.users.insert(user);
            self.perms_by_user.entry(user).or_default().insert(permission);
        }
        Ok(())
    }

    pub(crate) fn remove_permission_users(
        &mut self,
        permission: PermissionId,
        users: &[UserId],
    ) -> Result<(), CoreError> {
        let row = self
            .permissions
            .get_mut(&permission)
            .ok_or(CoreError::NotFound("permission"))?;
        for user in users {
            row.users.remove(user);
            if let Some(set) = self.perms_by_user.get_mut(user) {
                set.remove(&permission);
            }
        }
        Ok(())
    }

    pub(crate) fn add_permission_groups(
        &mut self,
        permission: PermissionId,
        groups: &[GroupId],
    ) -> Result<(), CoreError> {
        let row = self
            .permissions
            .get_mut(&permission)
            .ok_or(CoreError::NotFound("permission"))?;
        for &group in groups {
            row.groups.insert(group);
            self.perms_by_group.entry(group).or_default().insert(permission);
        }
        Ok(())
    }

    pub(crate) fn remove_permission_groups(
        &mut self,
        permission: PermissionId,
        groups: &[GroupId],
    ) -> Result<(), CoreError> {
        let row = self
            .permissions
            .get_mut(&permission)
            .ok_or(CoreError::NotFound("permission"))?;
        for group in groups {
            row.groups.remove(group);
            if let Some(set) = self.perms_by_group.get_mut(group) {
                set.remove(&permission);
            }
        }
        Ok(())
    }

    pub(crate) fn add_permission_nodes(
        &mut self,
        permission: PermissionId,
        nodes: &[NodeId],
    ) -> Result<(), CoreError> {
        let row = self
            .permissions
            .get_mut(&permission)
            .ok_or(CoreError::NotFound("permission"))?;
        for &node in nodes {
            row.nodes.insert(node);
            self.perms_by_node.entry(node).or_default().insert(permission);
        }
        Ok(())
    }

    pub(crate) fn remove_permission_nodes(
        &mut self,
        permission: PermissionId,
        nodes: &[NodeId],
    ) -> Result<(), CoreError> {
        let row = self
            .permissions
            .get_mut(&permission)
            .ok_or(CoreError::NotFound("permission"))?;
        for node in nodes {
            row.nodes.remove(node);
            if let Some(set) = self.perms_by_node.get_mut(node) {
                set.remove(&permission);
            }
        }
        Ok(())
    }

    pub(crate) fn add_permission_assets(
        &mut self,
        permission: PermissionId,
        assets: &[AssetId],
    ) -> Result<(), CoreError> {
        let row = self
            .permissions
            .get_mut(&permission)
            .ok_or(CoreError::NotFound("permission"))?;
        for &asset in assets {
            row.assets.insert(asset);
            self.perms_by_asset.entry(asset).or_default().insert(permission);
        }
        Ok(())
    }

    pub(crate) fn remove_permission_assets(
        &mut self,
        permission: PermissionId,
        assets: &[AssetId],
    ) -> Result<(), CoreError> {
        let row = self
            .permissions
            .get_mut(&permission)
            .ok_or(CoreError::NotFound("permission"))?;
        for asset in assets {
            row.assets.remove(asset);
            if let Some(set) = self.perms_by_asset.get_mut(asset) {
                set.remove(&permission);
            }
        }
        Ok(())
    }

    pub(crate) fn add_asset_nodes(
        &mut self,
        asset: AssetId,
        nodes: &[NodeId],
    ) -> Result<(), CoreError> {
        if !self.assets.contains_key(&asset) {
            return Err(CoreError::NotFound("asset"));
        }
        for &node in nodes {
            if !self.nodes.contains_key(&node) {
                return Err(CoreError::NotFound("node"));
            }
            self.asset_nodes.entry(asset).or_default().insert(node);
            self.node_assets.entry(node).or_default().insert(asset);
        }
        Ok(())
    }

    pub(crate) fn remove_asset_nodes(
        &mut self,
        asset: AssetId,
        nodes: &[NodeId],
    ) -> Result<(), CoreError> {
        if !self.assets.contains_key(&asset) {
            return Err(CoreError::NotFound("asset"));
        }
        for node in nodes {
            if let Some(set) = self.asset_nodes.get_mut(&asset) {
                set.remove(node);
            }
            if let Some(set) = self.node_assets.get_mut(node) {
                set.remove(&asset);
            }
        }
        Ok(())
    }
}

/// Fill `node.parent_key` and `node.assets_amount` from `node.key` and the
/// distinct-asset subtree count, for every node.
pub fn backfill_node_tree(tables: &mut Tables) {
    let ids: Vec<NodeId> = tables.nodes.keys().copied().collect();
    for id in ids {
        let Some(key) = tables.nodes.get(&id).map(|n| n.key.clone()) else {
            continue;
        };
        let mut amount: HashSet<AssetId> = HashSet::new();
        for node_id in tables.subtree_node_ids(&key) {
            if let Some(assets) = tables.node_assets.get(&node_id) {
                amount.extend(assets.iter().copied());
            }
        }
        if let Some(node) = tables.nodes.get_mut(&id) {
            node.parent_key = key.parent_key();
            node.assets_amount = amount.len() as u64;
        }
    }
}

/// The authoritative database: one table set behind a single writer lock.
#[derive(Debug, Default)]
pub struct Database {
    inner: RwLock<Tables>,
}

impl Database {
    /// An empty database.
    pub fn new() -> Self {
        Database::default()
    }

    /// A database seeded with an existing table set.
    pub fn with_tables(tables: Tables) -> Self {
        Database {
            inner: RwLock::new(tables),
        }
    }

    /// Shared read access to the tables.
    pub fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` as one transaction: the write guard is held throughout,
    /// mutations apply in place, and any error restores the pre-transaction
    /// snapshot before propagating.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = guard.clone();
        match f(&mut guard) {
            Ok(value) => Ok(value),
            Err(err) => {
                *guard = snapshot;
                Err(err)
            }
        }
    }

    /// Serialize the whole table set to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("creating snapshot file {}", path.display()))?;
        bincode::serialize_into(BufWriter::new(file), &*self.read())
            .context("serializing table snapshot")?;
        Ok(())
    }

    /// Load a table set previously written by [`Database::save_to`].
    pub fn load_from(path: &Path) -> Result<Database> {
        let file = File::open(path)
            .with_context(|| format!("opening snapshot file {}", path.display()))?;
        let tables: Tables = bincode::deserialize_from(BufReader::new(file))
            .context("deserializing table snapshot")?;
        Ok(Database::with_tables(tables))
    }
}
