//! Invalidation bus: upstream edge changes become rebuild tasks.
//!
//! The write layer calls these handlers inside the same transaction as the
//! upstream change. Each handler computes the affected user set and
//! bulk-inserts one coalescible [`RebuildUserTreeTask`] per user; the
//! runner is kicked by the caller once the transaction commits.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::errors::CoreError;
use crate::grants;
use crate::model::{AssetId, GroupId, NodeId, PermissionId, UserId};
use crate::store::Tables;

/// Identifier of a rebuild-task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(
    /// The raw UUID.
    pub Uuid,
);

/// A request to recompute one user's mapping tree. Multiple rows for the
/// same user coalesce: presence means "needs rebuild".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildUserTreeTask {
    /// Row id.
    pub id: TaskId,
    /// The user whose tree is stale.
    pub user: UserId,
    /// Creation time; the rebuild deletes rows created at or before its
    /// own start.
    pub created_at: OffsetDateTime,
}

/// The rebuild-task table, insertion-ordered (oldest first).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildTaskTable {
    rows: IndexMap<TaskId, RebuildUserTreeTask>,
}

impl RebuildTaskTable {
    /// Insert a task row for `user`.
    pub fn insert_for(&mut self, user: UserId) -> TaskId {
        let id = TaskId(Uuid::new_v4());
        self.rows.insert(
            id,
            RebuildUserTreeTask {
                id,
                user,
                created_at: OffsetDateTime::now_utc(),
            },
        );
        id
    }

    /// The oldest task whose user is not in `excluding`.
    pub fn pick_oldest(&self, excluding: &HashSet<UserId>) -> Option<&RebuildUserTreeTask> {
        self.rows
            .values()
            .find(|task| !excluding.contains(&task.user))
    }

    /// Whether any task for `user` is pending.
    pub fn has_for_user(&self, user: UserId) -> bool {
        self.rows.values().any(|task| task.user == user)
    }

    /// Count of pending tasks for `user`.
    pub fn count_for_user(&self, user: UserId) -> usize {
        self.rows.values().filter(|task| task.user == user).count()
    }

    /// Whether any task is pending at all.
    pub fn any_pending(&self) -> bool {
        !self.rows.is_empty()
    }

    /// Total pending tasks.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Delete every task for `user` created at or before `cutoff`; returns
    /// how many were removed.
    pub fn delete_for_user_up_to(&mut self, user: UserId, cutoff: OffsetDateTime) -> usize {
        let doomed: Vec<TaskId> = self
            .rows
            .values()
            .filter(|task| task.user == user && task.created_at <= cutoff)
            .map(|task| task.id)
            .collect();
        for id in &doomed {
            self.rows.shift_remove(id);
        }
        doomed.len()
    }

    /// Delete every task for `user`. Part of the user-deletion lifecycle.
    pub fn delete_user(&mut self, user: UserId) {
        self.rows.retain(|_, task| task.user != user);
    }
}

/// What happened to the relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    /// Rows were added to the relation.
    PostAdd,
    /// Rows were removed from the relation.
    PostRemove,
    /// The relation was cleared without a pk set. Always rejected.
    PreClear,
}

/// An edge change on one of the six authoritative many-to-many relations.
///
/// Constructors fix the instance/pk-set shape per relation; `reverse` is
/// only expressible where the relation defines reverse semantics.
#[derive(Debug, Clone)]
pub struct M2mEvent {
    action: ChangeAction,
    payload: Payload,
}

#[derive(Debug, Clone)]
enum Payload {
    PermissionUsers {
        permission: PermissionId,
        users: Vec<UserId>,
    },
    PermissionGroups {
        permission: PermissionId,
        groups: Vec<GroupId>,
    },
    PermissionNodes {
        permission: PermissionId,
    },
    PermissionAssets {
        permission: PermissionId,
    },
    GroupUsers {
        group: GroupId,
        users: Vec<UserId>,
    },
    AssetNodes {
        asset: AssetId,
    },
    AssetNodesReverse {
        node: NodeId,
        assets: Vec<AssetId>,
    },
    /// A reverse write on a relation that only defines forward semantics.
    ForbiddenReverse,
}

impl M2mEvent {
    /// `permission.users` changed.
    pub fn permission_users(
        permission: PermissionId,
        action: ChangeAction,
        users: Vec<UserId>,
    ) -> Self {
        M2mEvent {
            action,
            payload: Payload::PermissionUsers { permission, users },
        }
    }

    /// `permission.groups` changed.
    pub fn permission_groups(
        permission: PermissionId,
        action: ChangeAction,
        groups: Vec<GroupId>,
    ) -> Self {
        M2mEvent {
            action,
            payload: Payload::PermissionGroups { permission, groups },
        }
    }

    /// `permission.nodes` changed.
    pub fn permission_nodes(permission: PermissionId, action: ChangeAction) -> Self {
        M2mEvent {
            action,
            payload: Payload::PermissionNodes { permission },
        }
    }

    /// `permission.assets` changed.
    pub fn permission_assets(permission: PermissionId, action: ChangeAction) -> Self {
        M2mEvent {
            action,
            payload: Payload::PermissionAssets { permission },
        }
    }

    /// `group.users` changed.
    pub fn group_users(group: GroupId, action: ChangeAction, users: Vec<UserId>) -> Self {
        M2mEvent {
            action,
            payload: Payload::GroupUsers { group, users },
        }
    }

    /// `asset.nodes` changed, forward: the asset gained or lost nodes.
    pub fn asset_nodes(asset: AssetId, action: ChangeAction) -> Self {
        M2mEvent {
            action,
            payload: Payload::AssetNodes { asset },
        }
    }

    /// `asset.nodes` changed, reverse: a node gained or lost assets.
    pub fn asset_nodes_reverse(node: NodeId, action: ChangeAction, assets: Vec<AssetId>) -> Self {
        M2mEvent {
            action,
            payload: Payload::AssetNodesReverse { node, assets },
        }
    }

    /// A reverse write on any other relation; always rejected by the bus.
    pub fn forbidden_reverse(action: ChangeAction) -> Self {
        M2mEvent {
            action,
            payload: Payload::ForbiddenReverse,
        }
    }
}

/// Handle an m2m edge change: validate the contract, compute the affected
/// user set against the post-change tables, and bulk-insert task rows.
pub fn on_m2m_change(tables: &mut Tables, event: &M2mEvent) -> Result<(), CoreError> {
    // `pre_clear` carries no pk set and cannot be mapped to users.
    if event.action == ChangeAction::PreClear {
        return Err(CoreError::IllegalBulkOp);
    }

    let affected: HashSet<UserId> = match &event.payload {
        Payload::ForbiddenReverse => return Err(CoreError::ReverseNotAllowed),
        Payload::PermissionUsers { permission, users } => {
            debug!(permission = %permission, "permission users change event received");
            users.iter().copied().collect()
        }
        Payload::PermissionGroups { permission, groups } => {
            debug!(permission = %permission, "permission user groups change event received");
            let mut out = HashSet::new();
            for &group in groups {
                out.extend(grants::users_affected_by_group(tables, group));
            }
            out
        }
        Payload::PermissionNodes { permission } => {
            debug!(permission = %permission, "permission nodes change event received");
            linked_users(tables, *permission)?
        }
        Payload::PermissionAssets { permission } => {
            debug!(permission = %permission, "permission assets change event received");
            linked_users(tables, *permission)?
        }
        Payload::GroupUsers { group, users } => {
            debug!(group = %group, "group membership change event received");
            users.iter().copied().collect()
        }
        Payload::AssetNodes { asset } => {
            debug!(asset = %asset, "asset nodes change event received");
            grants::users_affected_by_asset(tables, *asset)
        }
        Payload::AssetNodesReverse { node, assets } => {
            debug!(node = %node, "asset nodes change event received (reverse)");
            let mut out = HashSet::new();
            for &asset in assets {
                out.extend(grants::users_affected_by_asset(tables, asset));
            }
            out
        }
    };

    enqueue_rebuilds(tables, &affected);
    Ok(())
}

/// Handle an imminent permission deletion. Conservatively refuses while any
/// rebuild task is pending anywhere, then enqueues tasks for every linked
/// user, computed before the row goes away.
pub fn on_pre_delete_permission(
    tables: &mut Tables,
    permission: PermissionId,
) -> Result<(), CoreError> {
    if tables.tasks.any_pending() {
        return Err(CoreError::CannotRemovePermNow);
    }
    let row = tables
        .permissions
        .get(&permission)
        .ok_or(CoreError::NotFound("permission"))?;
    let affected = grants::users_linked_to_permission(tables, row);
    enqueue_rebuilds(tables, &affected);
    Ok(())
}

fn linked_users(tables: &Tables, permission: PermissionId) -> Result<HashSet<UserId>, CoreError> {
    let row = tables
        .permissions
        .get(&permission)
        .ok_or(CoreError::NotFound("permission"))?;
    Ok(grants::users_linked_to_permission(tables, row))
}

fn enqueue_rebuilds(tables: &mut Tables, users: &HashSet<UserId>) {
    for &user in users {
        tables.tasks.insert_for(user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Fixture;

    #[test]
    fn pre_clear_is_rejected_without_enqueueing() {
        let fx = Fixture::tree();
        let result = fx.gatehouse.database().transaction(|t| {
            on_m2m_change(
                t,
                &M2mEvent::asset_nodes(fx.asset_a, ChangeAction::PreClear),
            )
        });
        assert!(matches!(result, Err(CoreError::IllegalBulkOp)));
        assert!(!fx.gatehouse.database().read().tasks.any_pending());
    }

    #[test]
    fn forbidden_reverse_is_rejected() {
        let fx = Fixture::tree();
        let result = fx.gatehouse.database().transaction(|t| {
            on_m2m_change(t, &M2mEvent::forbidden_reverse(ChangeAction::PostAdd))
        });
        assert!(matches!(result, Err(CoreError::ReverseNotAllowed)));
        assert!(!fx.gatehouse.database().read().tasks.any_pending());
    }

    #[test]
    fn reverse_asset_nodes_reaches_the_same_users_as_forward() {
        let fx = Fixture::tree();

        fx.gatehouse
            .database()
            .transaction(|t| {
                on_m2m_change(t, &M2mEvent::asset_nodes(fx.asset_c, ChangeAction::PostAdd))
            })
            .unwrap();
        let forward: Vec<_> = {
            let tables = fx.gatehouse.database().read();
            [fx.u1, fx.u2, fx.u3]
                .into_iter()
                .filter(|&u| tables.tasks.has_for_user(u))
                .collect()
        };
        fx.drain();

        fx.gatehouse
            .database()
            .transaction(|t| {
                on_m2m_change(
                    t,
                    &M2mEvent::asset_nodes_reverse(fx.k111, ChangeAction::PostAdd, vec![fx.asset_c]),
                )
            })
            .unwrap();
        let reverse: Vec<_> = {
            let tables = fx.gatehouse.database().read();
            [fx.u1, fx.u2, fx.u3]
                .into_iter()
                .filter(|&u| tables.tasks.has_for_user(u))
                .collect()
        };

        assert_eq!(forward, reverse);
        assert!(!forward.is_empty());
    }

    #[test]
    fn pre_delete_is_gated_on_any_pending_task() {
        let fx = Fixture::tree();

        // A pending task for an unrelated user still blocks the deletion.
        fx.gatehouse
            .database()
            .transaction(|t| {
                t.tasks.insert_for(fx.u2);
                Ok(())
            })
            .unwrap();
        let blocked = fx
            .gatehouse
            .database()
            .transaction(|t| on_pre_delete_permission(t, fx.p1));
        assert!(matches!(blocked, Err(CoreError::CannotRemovePermNow)));

        fx.drain();
        fx.gatehouse
            .database()
            .transaction(|t| on_pre_delete_permission(t, fx.p1))
            .unwrap();
        assert!(fx
            .gatehouse
            .database()
            .read()
            .tasks
            .has_for_user(fx.u1));
    }

    #[test]
    fn task_deletion_respects_the_cutoff() {
        let mut table = RebuildTaskTable::default();
        let user = UserId(Uuid::new_v4());
        table.insert_for(user);
        table.insert_for(user);
        let removed = table.delete_for_user_up_to(user, OffsetDateTime::now_utc());
        assert_eq!(removed, 2);
        assert!(table.is_empty());

        table.insert_for(user);
        let before_everything = OffsetDateTime::now_utc() - time::Duration::hours(1);
        assert_eq!(table.delete_for_user_up_to(user, before_everything), 0);
        assert!(table.has_for_user(user));
    }
}
