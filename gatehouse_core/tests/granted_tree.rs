//! End-to-end scenarios over the public surface: build a small tree,
//! grant it three different ways, and drive the queries, the invalidation
//! path and the locking protocol the way the HTTP layer would.

use gatehouse_core::errors::CoreError;
use gatehouse_core::lock::{generate_value, user_lock_key, Stage};
use gatehouse_core::model::{Asset, AssetId, NodeId, OrgId, OrgScope, UserId};
use gatehouse_core::node_key::NodeKey;
use gatehouse_core::query::{AssetFilter, CachePolicy, Page, Paging};
use gatehouse_core::tree::serialize_nodes;
use gatehouse_core::write::NewAsset;
use gatehouse_core::{Gatehouse, GatehouseConfig};

struct World {
    gatehouse: Gatehouse,
    org: OrgId,
    u1: UserId,
    u2: UserId,
    u3: UserId,
    k11: NodeId,
    k111: NodeId,
    asset_a: AssetId,
    p1: gatehouse_core::model::PermissionId,
    p2: gatehouse_core::model::PermissionId,
    p3: gatehouse_core::model::PermissionId,
}

/// Nodes K1=`1`, K11=`1:2`, K111=`1:2:3`; assets a, b in K11, c in K111.
/// u1 gets node K11; u2 gets asset a; u3 gets node K111 plus asset a via a
/// group.
fn world() -> World {
    let config = GatehouseConfig {
        lock_ttl_ms: 60_000,
        reader_retry_interval_ms: 10,
        background_worker: false,
        snapshot_path: None,
    };
    let gatehouse = Gatehouse::new(config);
    let org = OrgId::random();

    gatehouse.create_node("1", "default", org).unwrap();
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

    let p1 = gatehouse.create_permission("p1").unwrap();
    gatehouse.add_permission_users(p1, &[u1]).unwrap();
    gatehouse.add_permission_nodes(p1, &[k11]).unwrap();

    let p2 = gatehouse.create_permission("p2").unwrap();
    gatehouse.add_permission_users(p2, &[u2]).unwrap();
    gatehouse.add_permission_assets(p2, &[asset_a]).unwrap();

    let ops = gatehouse.create_group("ops").unwrap();
    gatehouse.add_group_users(ops, &[u3]).unwrap();
    let p3 = gatehouse.create_permission("p3").unwrap();
    gatehouse.add_permission_groups(p3, &[ops]).unwrap();
    gatehouse.add_permission_nodes(p3, &[k111]).unwrap();
    gatehouse.add_permission_assets(p3, &[asset_a]).unwrap();

    gatehouse.drain_rebuilds();

    World {
        gatehouse,
        org,
        u1,
        u2,
        u3,
        k11,
        k111,
        asset_a,
        p1,
        p2,
        p3,
    }
}

fn q1(world: &World, user: UserId, key: Option<&str>) -> Result<Page<Asset>, CoreError> {
    let key = key.map(|k| NodeKey::new(k).unwrap());
    world.gatehouse.list_granted_assets(
        user,
        key.as_ref(),
        OrgScope::Root,
        &AssetFilter::default(),
        Paging::default(),
        CachePolicy::Fresh,
    )
}

fn hostnames(page: &Page<Asset>) -> Vec<String> {
    page.items.iter().map(|a| a.hostname.clone()).collect()
}

#[test]
fn node_grant_covers_the_subtree_and_the_visible_tree() {
    let w = world();

    assert_eq!(hostnames(&q1(&w, w.u1, Some("1")).unwrap()), ["a", "b", "c"]);

    let roots = w
        .gatehouse
        .list_visible_children(w.u1, None, CachePolicy::Fresh)
        .unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].key.as_str(), "1");
    assert!(!roots[0].granted);
    assert_eq!(roots[0].assets_amount, 3);

    let children = w
        .gatehouse
        .list_visible_children(w.u1, Some(&NodeKey::new("1").unwrap()), CachePolicy::Fresh)
        .unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].key.as_str(), "1:2");
    assert!(children[0].granted);
    assert_eq!(children[0].assets_amount, 3);

    // The UI contract: "{value} ({assets_amount})" under the parent key.
    let rendered = serialize_nodes(&children, true);
    assert_eq!(rendered[0].id, "1:2");
    assert_eq!(rendered[0].p_id, "1");
    assert_eq!(rendered[0].name, "web (3)");
}

#[test]
fn asset_grant_projects_the_holding_node_only() {
    let w = world();

    assert_eq!(hostnames(&q1(&w, w.u2, None).unwrap()), ["a"]);

    let rows = w.gatehouse.mapping_rows(w.u2);
    let keys: Vec<_> = rows.iter().map(|r| r.key.to_string()).collect();
    assert_eq!(keys, ["1", "1:2"]);
    assert!(!rows[0].granted && !rows[0].asset_granted);
    assert!(!rows[1].granted && rows[1].asset_granted);
    assert_eq!(rows[1].assets_amount, 1);

    let children = w
        .gatehouse
        .list_visible_children(w.u2, Some(&NodeKey::new("1").unwrap()), CachePolicy::Fresh)
        .unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].key.as_str(), "1:2");
    assert!(!children[0].granted && children[0].asset_granted);
    assert_eq!(children[0].assets_amount, 1);
}

#[test]
fn mixed_node_and_asset_grant_union() {
    let w = world();

    assert_eq!(hostnames(&q1(&w, w.u3, None).unwrap()), ["a", "c"]);

    let rows = w.gatehouse.mapping_rows(w.u3);
    let keys: Vec<_> = rows.iter().map(|r| r.key.to_string()).collect();
    assert_eq!(keys, ["1", "1:2", "1:2:3"]);

    let k11 = &rows[1];
    assert!(!k11.granted && k11.asset_granted);
    // Rooted at K11 the user effectively holds asset a plus c via K111.
    assert_eq!(k11.assets_amount, 2);

    let k111 = &rows[2];
    assert!(k111.granted && !k111.asset_granted);
    assert_eq!(k111.assets_amount, 1);

    let children = w
        .gatehouse
        .list_visible_children(w.u3, Some(&NodeKey::new("1:2").unwrap()), CachePolicy::Fresh)
        .unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].key.as_str(), "1:2:3");
    assert!(children[0].granted);
    assert_eq!(children[0].assets_amount, 1);
}

#[test]
fn adding_an_asset_enqueues_one_task_and_refreshes_counts() {
    let w = world();

    let d = w.gatehouse.create_asset(NewAsset::new("d", w.org)).unwrap();
    w.gatehouse.add_asset_to_nodes(d, &[w.k11]).unwrap();

    assert_eq!(w.gatehouse.pending_rebuilds_for(w.u1), 1);
    assert_eq!(w.gatehouse.pending_rebuild_count(), 1);

    w.gatehouse.drain_rebuilds();
    assert_eq!(w.gatehouse.pending_rebuild_count(), 0);

    assert_eq!(
        hostnames(&q1(&w, w.u1, None).unwrap()),
        ["a", "b", "c", "d"]
    );
    let rows = w.gatehouse.mapping_rows(w.u1);
    assert_eq!(rows[1].key.as_str(), "1:2");
    assert_eq!(rows[1].assets_amount, 4);
}

#[test]
fn concurrent_rebuild_locks_out_workers_and_readers() {
    let w = world();

    // A change leaves a pending task for u1.
    w.gatehouse
        .add_permission_assets(w.p1, &[w.asset_a])
        .unwrap();
    assert!(w.gatehouse.pending_rebuilds_for(w.u1) > 0);

    // Worker A holds the user lock in DOING.
    let key = user_lock_key(w.u1);
    let doing = generate_value(Stage::Doing);
    assert!(w
        .gatehouse
        .locks()
        .acquire(&key, &doing, time::Duration::seconds(60)));

    // Worker B picks the same task and must skip.
    assert!(matches!(
        w.gatehouse.runner().run_for_user(w.u1),
        Err(CoreError::SomeoneIsDoingThis)
    ));

    // A reader during DOING gets the conflict surface.
    assert!(matches!(
        q1(&w, w.u1, Some("1")),
        Err(CoreError::AdminIsModifyingPerm)
    ));

    // Worker A finishes; the reader then sees the rebuilt state.
    w.gatehouse.locks().release(&key, &doing, &doing);
    w.gatehouse.drain_rebuilds();
    assert_eq!(w.gatehouse.pending_rebuilds_for(w.u1), 0);
    assert_eq!(hostnames(&q1(&w, w.u1, Some("1")).unwrap()), ["a", "b", "c"]);
}

#[test]
fn permission_deletion_is_blocked_while_tasks_are_pending() {
    let w = world();

    // Any pending task blocks the deletion, even for another user.
    let d = w.gatehouse.create_asset(NewAsset::new("d", w.org)).unwrap();
    w.gatehouse.add_asset_to_nodes(d, &[w.k111]).unwrap();
    assert!(w.gatehouse.pending_rebuild_count() > 0);

    let before = w.gatehouse.mapping_rows(w.u2);
    assert!(matches!(
        w.gatehouse.delete_permission(w.p2),
        Err(CoreError::CannotRemovePermNow)
    ));
    assert!(w.gatehouse.database().read().permission(w.p2).is_some());
    assert_eq!(w.gatehouse.mapping_rows(w.u2), before);

    // Once drained, the deletion goes through and re-enqueues the users
    // that lost the permission.
    w.gatehouse.drain_rebuilds();
    w.gatehouse.delete_permission(w.p2).unwrap();
    assert!(w.gatehouse.database().read().permission(w.p2).is_none());
    assert_eq!(w.gatehouse.pending_rebuilds_for(w.u2), 1);

    w.gatehouse.drain_rebuilds();
    assert!(w.gatehouse.mapping_rows(w.u2).is_empty());
    assert!(matches!(
        q1(&w, w.u2, Some("1")),
        Err(CoreError::PermissionDenied)
    ));
}

#[test]
fn draining_twice_is_idempotent() {
    let w = world();
    let before = w.gatehouse.mapping_rows(w.u3);

    // Re-adding an edge that already exists re-enqueues u3; the rebuild
    // runs against unchanged upstream state.
    w.gatehouse
        .add_permission_assets(w.p3, &[w.asset_a])
        .unwrap();
    assert!(w.gatehouse.pending_rebuilds_for(w.u3) > 0);
    w.gatehouse.drain_rebuilds();

    assert_eq!(w.gatehouse.mapping_rows(w.u3), before);
}

#[test]
fn revoking_every_grant_empties_the_tree() {
    let w = world();

    // An extra node grant for u1 comes and goes without disturbing the
    // original one.
    let temp = w.gatehouse.create_permission("temp").unwrap();
    w.gatehouse.add_permission_users(temp, &[w.u1]).unwrap();
    w.gatehouse.add_permission_nodes(temp, &[w.k111]).unwrap();
    w.gatehouse.drain_rebuilds();
    w.gatehouse.remove_permission_nodes(temp, &[w.k111]).unwrap();
    w.gatehouse.drain_rebuilds();
    w.gatehouse.delete_permission(temp).unwrap();
    w.gatehouse.drain_rebuilds();
    assert_eq!(hostnames(&q1(&w, w.u1, Some("1")).unwrap()), ["a", "b", "c"]);

    // A user whose only grant is revoked ends with zero rows.
    w.gatehouse
        .remove_permission_assets(w.p2, &[w.asset_a])
        .unwrap();
    w.gatehouse.drain_rebuilds();
    assert!(w.gatehouse.mapping_rows(w.u2).is_empty());
    assert!(matches!(
        q1(&w, w.u2, Some("1")),
        Err(CoreError::PermissionDenied)
    ));
}

#[test]
fn org_scope_filters_query_results() {
    let w = world();

    let other_org = OrgId::random();
    let e = w
        .gatehouse
        .create_asset(NewAsset::new("e", other_org))
        .unwrap();
    w.gatehouse.add_asset_to_nodes(e, &[w.k11]).unwrap();
    w.gatehouse.drain_rebuilds();

    let all = w
        .gatehouse
        .list_granted_assets(
            w.u1,
            None,
            OrgScope::Root,
            &AssetFilter::default(),
            Paging::default(),
            CachePolicy::Fresh,
        )
        .unwrap();
    assert_eq!(hostnames(&all), ["a", "b", "c", "e"]);

    let scoped = w
        .gatehouse
        .list_granted_assets(
            w.u1,
            None,
            OrgScope::Org(w.org),
            &AssetFilter::default(),
            Paging::default(),
            CachePolicy::Fresh,
        )
        .unwrap();
    assert_eq!(hostnames(&scoped), ["a", "b", "c"]);
}
