//! Read model over the authoritative grant relations.
//!
//! Pure, index-backed queries; nothing here mutates or keeps per-user
//! state. The rebuilder and the query engine compose these.

use std::collections::HashSet;

use crate::model::{AssetId, GroupId, NodeId, OrgScope, Permission, PermissionId, UserId};
use crate::node_key::NodeKey;
use crate::store::Tables;

/// Permissions the user is linked to, directly or via group membership.
pub fn linked_permissions(tables: &Tables, user: UserId) -> HashSet<PermissionId> {
    let mut out: HashSet<PermissionId> = tables
        .perms_by_user
        .get(&user)
        .cloned()
        .unwrap_or_default();
    if let Some(groups) = tables.groups_by_user.get(&user) {
        for group in groups {
            if let Some(perms) = tables.perms_by_group.get(group) {
                out.extend(perms.iter().copied());
            }
        }
    }
    out
}

/// Node ids granted to the user through any linked permission.
pub fn node_granted_nodes(tables: &Tables, user: UserId) -> HashSet<NodeId> {
    let mut out = HashSet::new();
    for perm in linked_permissions(tables, user) {
        if let Some(row) = tables.permissions.get(&perm) {
            out.extend(row.nodes.iter().copied());
        }
    }
    out
}

/// Asset ids granted directly to the user through any linked permission.
pub fn asset_granted_assets(tables: &Tables, user: UserId) -> HashSet<AssetId> {
    let mut out = HashSet::new();
    for perm in linked_permissions(tables, user) {
        if let Some(row) = tables.permissions.get(&perm) {
            out.extend(row.assets.iter().copied());
        }
    }
    out
}

/// Distinct assets whose node set intersects the subtree of `root`,
/// filtered by `scope`.
pub fn assets_in_subtree(tables: &Tables, root: &NodeKey, scope: OrgScope) -> HashSet<AssetId> {
    let mut out = HashSet::new();
    for node_id in tables.subtree_node_ids(root) {
        if let Some(assets) = tables.node_assets.get(&node_id) {
            out.extend(
                assets
                    .iter()
                    .copied()
                    .filter(|id| asset_visible(tables, *id, scope)),
            );
        }
    }
    out
}

/// Users linked to the permission: its direct users plus every member of
/// its groups.
pub fn users_linked_to_permission(tables: &Tables, permission: &Permission) -> HashSet<UserId> {
    let mut out: HashSet<UserId> = permission.users.iter().copied().collect();
    for group in &permission.groups {
        if let Some(row) = tables.groups.get(group) {
            out.extend(row.users.iter().copied());
        }
    }
    out
}

/// Users whose grants can change when the group's membership or linkage
/// changes: the group's current members.
pub fn users_affected_by_group(tables: &Tables, group: GroupId) -> HashSet<UserId> {
    tables
        .groups
        .get(&group)
        .map(|row| row.users.iter().copied().collect())
        .unwrap_or_default()
}

/// Users linked to any permission that reaches the asset: a permission
/// referencing it directly, or one granting a node that covers it (one of
/// the asset's nodes or an ancestor of one).
pub fn users_affected_by_asset(tables: &Tables, asset: AssetId) -> HashSet<UserId> {
    let mut perms: HashSet<PermissionId> = tables
        .perms_by_asset
        .get(&asset)
        .cloned()
        .unwrap_or_default();

    if let Some(nodes) = tables.asset_nodes.get(&asset) {
        for &node_id in nodes {
            let Some(node) = tables.nodes.get(&node_id) else {
                continue;
            };
            let mut covering = node.key.ancestors();
            covering.push(node.key.clone());
            for key in covering {
                let Some(&cover_id) = tables.node_key_index.get(key.as_str()) else {
                    continue;
                };
                if let Some(linked) = tables.perms_by_node.get(&cover_id) {
                    perms.extend(linked.iter().copied());
                }
            }
        }
    }

    let mut out = HashSet::new();
    for perm in perms {
        if let Some(row) = tables.permissions.get(&perm) {
            out.extend(users_linked_to_permission(tables, row));
        }
    }
    out
}

fn asset_visible(tables: &Tables, asset: AssetId, scope: OrgScope) -> bool {
    tables
        .assets
        .get(&asset)
        .map(|row| scope.permits(row.org_id))
        .unwrap_or(false)
}
