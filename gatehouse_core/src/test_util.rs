//! Shared fixtures for unit tests.

use std::sync::Arc;

use crate::config::GatehouseConfig;
use crate::gatehouse::Gatehouse;
use crate::lock::LockService;
use crate::model::{AssetId, GroupId, NodeId, OrgId, PermissionId, UserId};
use crate::runner::TaskRunner;
use crate::write::NewAsset;

/// The standard three-level world:
///
/// ```text
/// 1            (K1)
/// └── 1:2      (K11)   assets a, b
///     └── 1:2:3 (K111) asset c
/// ```
///
/// - `u1` holds permission `p1` granting node K11;
/// - `u2` holds permission `p2` granting asset `a`;
/// - `u3` is in `ops_group`, which holds `p3` granting node K111 plus
///   asset `a`.
pub(crate) struct Fixture {
    pub gatehouse: Gatehouse,
    pub org: OrgId,
    pub u1: UserId,
    pub u2: UserId,
    pub u3: UserId,
    pub ops_group: GroupId,
    pub p1: PermissionId,
    pub p2: PermissionId,
    pub p3: PermissionId,
    pub k1: NodeId,
    pub k11: NodeId,
    pub k111: NodeId,
    pub asset_a: AssetId,
    pub asset_b: AssetId,
    pub asset_c: AssetId,
}

impl Fixture {
    /// The standard world with every rebuild drained.
    pub fn tree() -> Fixture {
        let fx = Self::tree_undrained();
        fx.drain();
        fx
    }

    /// The standard world with its initial rebuild tasks still pending.
    pub fn tree_undrained() -> Fixture {
        Self::build(test_config(60_000))
    }

    /// Like [`Fixture::tree_undrained`], with a custom lock TTL.
    pub fn tree_undrained_with_ttl(ttl: time::Duration) -> Fixture {
        Self::build(test_config(ttl.whole_milliseconds().max(0) as u64))
    }

    pub fn drain(&self) {
        self.gatehouse.drain_rebuilds();
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        self.gatehouse.runner()
    }

    pub fn locks(&self) -> &Arc<LockService> {
        self.gatehouse.locks()
    }

    fn build(config: GatehouseConfig) -> Fixture {
        let gatehouse = Gatehouse::new(config);
        let org = OrgId::random();

        let k1 = gatehouse.create_node("1", "default", org).unwrap();
        let k11 = gatehouse.create_node("1:2", "web", org).unwrap();
        let k111 = gatehouse.create_node("1:2:3", "db", org).unwrap();

        let asset_a = gatehouse.create_asset(NewAsset::new("a", org)).unwrap();
        let asset_b = gatehouse.create_asset(NewAsset::new("b", org)).unwrap();
        let asset_c = gatehouse.create_asset(NewAsset::new("c", org)).unwrap();
        gatehouse.add_asset_to_nodes(asset_a, &[k11]).unwrap();
        gatehouse.add_asset_to_nodes(asset_b, &[k11]).unwrap();
        gatehouse.add_asset_to_nodes(asset_c, &[k111]).unwrap();

        let u1 = gatehouse.create_user("u1").unwrap();
        let u2 = gatehouse.create_user("u2").unwrap();
        let u3 = gatehouse.create_user("u3").unwrap();
        let ops_group = gatehouse.create_group("ops").unwrap();
        gatehouse.add_group_users(ops_group, &[u3]).unwrap();

        let p1 = gatehouse.create_permission("p1").unwrap();
        gatehouse.add_permission_users(p1, &[u1]).unwrap();
        gatehouse.add_permission_nodes(p1, &[k11]).unwrap();

        let p2 = gatehouse.create_permission("p2").unwrap();
        gatehouse.add_permission_users(p2, &[u2]).unwrap();
        gatehouse.add_permission_assets(p2, &[asset_a]).unwrap();

        let p3 = gatehouse.create_permission("p3").unwrap();
        gatehouse.add_permission_groups(p3, &[ops_group]).unwrap();
        gatehouse.add_permission_nodes(p3, &[k111]).unwrap();
        gatehouse.add_permission_assets(p3, &[asset_a]).unwrap();

        Fixture {
            gatehouse,
            org,
            u1,
            u2,
            u3,
            ops_group,
            p1,
            p2,
            p3,
            k1,
            k11,
            k111,
            asset_a,
            asset_b,
            asset_c,
        }
    }
}

fn test_config(lock_ttl_ms: u64) -> GatehouseConfig {
    GatehouseConfig {
        lock_ttl_ms,
        reader_retry_interval_ms: 10,
        background_worker: false,
        snapshot_path: None,
    }
}
