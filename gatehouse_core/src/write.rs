//! Write facade over the authoritative relations.
//!
//! Every mutation runs in one transaction together with the invalidation
//! events it triggers, and kicks the task runner once the transaction
//! commits. This is the contract the write layer must follow; the facade
//! is also what the tests drive.

use crate::errors::CoreError;
use crate::events::{self, ChangeAction, M2mEvent};
use crate::gatehouse::Gatehouse;
use crate::model::{
    Asset, AssetId, GroupId, Node, NodeId, OrgId, Permission, PermissionId, Protocol, User,
    UserGroup, UserId,
};
use crate::node_key::NodeKey;
use crate::store::{self, Tables};

/// Input for creating an asset.
#[derive(Debug, Clone)]
pub struct NewAsset {
    /// Hostname.
    pub hostname: String,
    /// Address.
    pub ip: String,
    /// Platform family.
    pub platform_base: String,
    /// Protocols the asset speaks.
    pub protocols: Vec<Protocol>,
    /// Free-form comment.
    pub comment: String,
    /// Whether the asset is active.
    pub is_active: bool,
    /// Owning organization.
    pub org_id: OrgId,
}

impl NewAsset {
    /// A new asset with sensible defaults: active, Linux, ssh on 22.
    pub fn new(hostname: impl Into<String>, org_id: OrgId) -> Self {
        NewAsset {
            hostname: hostname.into(),
            ip: String::new(),
            platform_base: "Linux".to_owned(),
            protocols: vec![Protocol::new("ssh", 22)],
            comment: String::new(),
            is_active: true,
            org_id,
        }
    }
}

impl Gatehouse {
    /// Create a user.
    pub fn create_user(&self, username: &str) -> Result<UserId, CoreError> {
        let user = User {
            id: UserId::random(),
            username: username.to_owned(),
        };
        let id = user.id;
        self.database().transaction(|tables| {
            tables.insert_user(user);
            Ok(())
        })?;
        Ok(id)
    }

    /// Create an empty user group.
    pub fn create_group(&self, name: &str) -> Result<GroupId, CoreError> {
        let group = UserGroup {
            id: GroupId::random(),
            name: name.to_owned(),
            users: Default::default(),
        };
        let id = group.id;
        self.database().transaction(|tables| {
            tables.insert_group(group);
            Ok(())
        })?;
        Ok(id)
    }

    /// Create a tree node. The parent of a non-root key must already exist.
    pub fn create_node(&self, key: &str, value: &str, org_id: OrgId) -> Result<NodeId, CoreError> {
        let key = NodeKey::new(key)?;
        let node = Node {
            id: NodeId::random(),
            parent_key: key.parent_key(),
            value: value.to_owned(),
            assets_amount: 0,
            key,
            org_id,
        };
        let id = node.id;
        self.database().transaction(|tables| tables.insert_node(node))?;
        Ok(id)
    }

    /// Create an asset.
    pub fn create_asset(&self, new: NewAsset) -> Result<AssetId, CoreError> {
        let asset = Asset {
            id: AssetId::random(),
            hostname: new.hostname,
            ip: new.ip,
            platform_base: new.platform_base,
            protocols: new.protocols,
            comment: new.comment,
            is_active: new.is_active,
            org_id: new.org_id,
        };
        let id = asset.id;
        self.database().transaction(|tables| {
            tables.insert_asset(asset);
            Ok(())
        })?;
        Ok(id)
    }

    /// Create an empty permission.
    pub fn create_permission(&self, name: &str) -> Result<PermissionId, CoreError> {
        let permission = Permission {
            id: PermissionId::random(),
            name: name.to_owned(),
            users: Default::default(),
            groups: Default::default(),
            nodes: Default::default(),
            assets: Default::default(),
        };
        let id = permission.id;
        self.database().transaction(|tables| {
            tables.insert_permission(permission);
            Ok(())
        })?;
        Ok(id)
    }

    /// Link users to a permission.
    pub fn add_permission_users(
        &self,
        permission: PermissionId,
        users: &[UserId],
    ) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.add_permission_users(permission, users)?;
            events::on_m2m_change(
                tables,
                &M2mEvent::permission_users(permission, ChangeAction::PostAdd, users.to_vec()),
            )
        })
    }

    /// Unlink users from a permission.
    pub fn remove_permission_users(
        &self,
        permission: PermissionId,
        users: &[UserId],
    ) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.remove_permission_users(permission, users)?;
            events::on_m2m_change(
                tables,
                &M2mEvent::permission_users(permission, ChangeAction::PostRemove, users.to_vec()),
            )
        })
    }

    /// Link groups to a permission.
    pub fn add_permission_groups(
        &self,
        permission: PermissionId,
        groups: &[GroupId],
    ) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.add_permission_groups(permission, groups)?;
            events::on_m2m_change(
                tables,
                &M2mEvent::permission_groups(permission, ChangeAction::PostAdd, groups.to_vec()),
            )
        })
    }

    /// Unlink groups from a permission.
    pub fn remove_permission_groups(
        &self,
        permission: PermissionId,
        groups: &[GroupId],
    ) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.remove_permission_groups(permission, groups)?;
            events::on_m2m_change(
                tables,
                &M2mEvent::permission_groups(permission, ChangeAction::PostRemove, groups.to_vec()),
            )
        })
    }

    /// Grant nodes through a permission.
    pub fn add_permission_nodes(
        &self,
        permission: PermissionId,
        nodes: &[NodeId],
    ) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.add_permission_nodes(permission, nodes)?;
            events::on_m2m_change(
                tables,
                &M2mEvent::permission_nodes(permission, ChangeAction::PostAdd),
            )
        })
    }

    /// Revoke nodes from a permission.
    pub fn remove_permission_nodes(
        &self,
        permission: PermissionId,
        nodes: &[NodeId],
    ) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.remove_permission_nodes(permission, nodes)?;
            events::on_m2m_change(
                tables,
                &M2mEvent::permission_nodes(permission, ChangeAction::PostRemove),
            )
        })
    }

    /// Grant assets through a permission.
    pub fn add_permission_assets(
        &self,
        permission: PermissionId,
        assets: &[AssetId],
    ) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.add_permission_assets(permission, assets)?;
            events::on_m2m_change(
                tables,
                &M2mEvent::permission_assets(permission, ChangeAction::PostAdd),
            )
        })
    }

    /// Revoke assets from a permission.
    pub fn remove_permission_assets(
        &self,
        permission: PermissionId,
        assets: &[AssetId],
    ) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.remove_permission_assets(permission, assets)?;
            events::on_m2m_change(
                tables,
                &M2mEvent::permission_assets(permission, ChangeAction::PostRemove),
            )
        })
    }

    /// Add users to a group.
    pub fn add_group_users(&self, group: GroupId, users: &[UserId]) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.add_group_users(group, users)?;
            events::on_m2m_change(
                tables,
                &M2mEvent::group_users(group, ChangeAction::PostAdd, users.to_vec()),
            )
        })
    }

    /// Remove users from a group.
    pub fn remove_group_users(&self, group: GroupId, users: &[UserId]) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.remove_group_users(group, users)?;
            events::on_m2m_change(
                tables,
                &M2mEvent::group_users(group, ChangeAction::PostRemove, users.to_vec()),
            )
        })
    }

    /// Put an asset into nodes (forward side of `asset.nodes`).
    pub fn add_asset_to_nodes(&self, asset: AssetId, nodes: &[NodeId]) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.add_asset_nodes(asset, nodes)?;
            events::on_m2m_change(tables, &M2mEvent::asset_nodes(asset, ChangeAction::PostAdd))
        })
    }

    /// Take an asset out of nodes.
    pub fn remove_asset_from_nodes(
        &self,
        asset: AssetId,
        nodes: &[NodeId],
    ) -> Result<(), CoreError> {
        self.mutate(|tables| {
            tables.remove_asset_nodes(asset, nodes)?;
            events::on_m2m_change(
                tables,
                &M2mEvent::asset_nodes(asset, ChangeAction::PostRemove),
            )
        })
    }

    /// Put assets into a node (reverse side of `asset.nodes`, the one
    /// relation that defines reverse semantics).
    pub fn add_assets_to_node(&self, node: NodeId, assets: &[AssetId]) -> Result<(), CoreError> {
        self.mutate(|tables| {
            for &asset in assets {
                tables.add_asset_nodes(asset, &[node])?;
            }
            events::on_m2m_change(
                tables,
                &M2mEvent::asset_nodes_reverse(node, ChangeAction::PostAdd, assets.to_vec()),
            )
        })
    }

    /// Delete a permission. Refused while any rebuild task is pending; the
    /// affected users are computed and enqueued before the row goes away.
    pub fn delete_permission(&self, permission: PermissionId) -> Result<(), CoreError> {
        self.mutate(|tables| {
            events::on_pre_delete_permission(tables, permission)?;
            tables.delete_permission(permission)
        })
    }

    /// Delete a user together with their mapping rows and pending tasks.
    pub fn delete_user(&self, user: UserId) -> Result<(), CoreError> {
        self.database().transaction(|tables| tables.delete_user(user))
    }

    /// Fill `node.parent_key` and `node.assets_amount` on every node from
    /// the key and the subtree asset count.
    pub fn backfill_node_tree(&self) -> Result<(), CoreError> {
        self.database().transaction(|tables| {
            store::backfill_node_tree(tables);
            Ok(())
        })
    }

    /// One transaction for the mutation plus its events, then a runner kick
    /// on commit.
    fn mutate(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        self.database().transaction(f)?;
        self.runner().submit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Fixture;

    #[test]
    fn writes_enqueue_tasks_in_the_same_transaction() -> anyhow::Result<()> {
        let fx = Fixture::tree();
        fx.gatehouse.add_permission_nodes(fx.p1, &[fx.k111])?;
        assert_eq!(
            fx.gatehouse
                .database()
                .read()
                .tasks
                .count_for_user(fx.u1),
            1
        );
        Ok(())
    }

    #[test]
    fn failed_writes_leave_no_tasks_behind() {
        let fx = Fixture::tree();
        let ghost = PermissionId::random();
        let result = fx.gatehouse.add_permission_users(ghost, &[fx.u1]);
        assert!(matches!(result, Err(CoreError::NotFound(_))));
        assert!(!fx.gatehouse.database().read().tasks.any_pending());
    }

    #[test]
    fn reverse_node_write_links_and_enqueues() -> anyhow::Result<()> {
        let fx = Fixture::tree();
        let org = fx.org;
        let d = fx.gatehouse.create_asset(NewAsset::new("d", org))?;
        fx.gatehouse.add_assets_to_node(fx.k11, &[d])?;

        let tables = fx.gatehouse.database().read();
        assert!(tables.asset_nodes.get(&d).map(|n| n.contains(&fx.k11)) == Some(true));
        // u1 holds K11, so the new asset affects them.
        assert!(tables.tasks.has_for_user(fx.u1));
        Ok(())
    }

    #[test]
    fn deleting_a_user_clears_their_projection() -> anyhow::Result<()> {
        let fx = Fixture::tree();
        fx.gatehouse.add_permission_nodes(fx.p1, &[fx.k111]).ok();
        fx.gatehouse.delete_user(fx.u1)?;

        let tables = fx.gatehouse.database().read();
        assert!(tables.mapping.rows_for_user(fx.u1).is_empty());
        assert!(!tables.tasks.has_for_user(fx.u1));
        assert!(!tables
            .permission(fx.p1)
            .map(|p| p.users.contains(&fx.u1))
            .unwrap_or(true));
        Ok(())
    }
}
