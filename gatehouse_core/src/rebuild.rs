//! Rebuilder: recompute one user's mapping tree from the grant relations.
//!
//! A rebuild derives the complete replacement row set in memory and hands
//! it to the mapping store in one shot; it never patches rows. Given the
//! same upstream state, two runs produce identical row sets.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::errors::CoreError;
use crate::grants;
use crate::mapping::MappingNode;
use crate::model::{NodeId, OrgScope, UserId};
use crate::node_key::{NodeKey, SubtreeFilter};
use crate::store::Tables;

/// Intermediate record for a node picked up as a leaf of the projection:
/// directly granted, holding a directly granted asset, or both.
#[derive(Debug, Clone)]
struct LeafSeed {
    node_id: NodeId,
    key: NodeKey,
    granted: bool,
    asset_granted: bool,
}

/// Compute the full replacement row set for `user`.
///
/// Rebuilds always see every organization; scoping happens at query time.
pub fn compute_user_rows(tables: &Tables, user: UserId) -> Result<Vec<MappingNode>, CoreError> {
    let mut leaves: HashMap<String, LeafSeed> = HashMap::new();

    for node_id in grants::node_granted_nodes(tables, user) {
        let Some(node) = tables.node(node_id) else {
            continue;
        };
        leaves
            .entry(node.key.as_str().to_owned())
            .and_modify(|seed| seed.granted = true)
            .or_insert_with(|| LeafSeed {
                node_id,
                key: node.key.clone(),
                granted: true,
                asset_granted: false,
            });
    }

    let direct_assets = grants::asset_granted_assets(tables, user);
    for &asset in &direct_assets {
        let Some(nodes) = tables.asset_nodes.get(&asset) else {
            continue;
        };
        for &node_id in nodes {
            let Some(node) = tables.node(node_id) else {
                continue;
            };
            leaves
                .entry(node.key.as_str().to_owned())
                .and_modify(|seed| seed.asset_granted = true)
                .or_insert_with(|| LeafSeed {
                    node_id,
                    key: node.key.clone(),
                    granted: false,
                    asset_granted: true,
                });
        }
    }

    let granted_keys: BTreeSet<String> = leaves
        .values()
        .filter(|seed| seed.granted)
        .map(|seed| seed.key.as_str().to_owned())
        .collect();

    // A granted node below another granted node would make the descendant
    // row redundant for authorization; refuse to materialize it.
    for key in &granted_keys {
        let key = NodeKey::new(key.as_str())?;
        if let Some(ancestor) = key
            .ancestors()
            .iter()
            .find(|ancestor| granted_keys.contains(ancestor.as_str()))
        {
            return Err(CoreError::IntegrityViolation(format!(
                "node {key} is granted while its ancestor {ancestor} is already granted"
            )));
        }
    }

    let mut ancestor_keys: BTreeSet<String> = BTreeSet::new();
    for seed in leaves.values() {
        for ancestor in seed.key.ancestors() {
            if !leaves.contains_key(ancestor.as_str()) {
                ancestor_keys.insert(ancestor.as_str().to_owned());
            }
        }
    }

    let mut rows = Vec::with_capacity(leaves.len() + ancestor_keys.len());
    for seed in leaves.values() {
        rows.push(build_row(tables, user, seed, &granted_keys, &direct_assets));
    }
    for key in ancestor_keys {
        let node = tables
            .node_by_key(&key)
            .ok_or_else(|| CoreError::IntegrityViolation(format!("ancestor node {key} missing")))?;
        let seed = LeafSeed {
            node_id: node.id,
            key: node.key.clone(),
            granted: false,
            asset_granted: false,
        };
        rows.push(build_row(tables, user, &seed, &granted_keys, &direct_assets));
    }

    rows.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(rows)
}

/// Recompute and atomically replace `user`'s mapping rows.
pub fn rebuild_user(tables: &mut Tables, user: UserId) -> Result<(), CoreError> {
    let rows = compute_user_rows(tables, user)?;
    tables.mapping.replace(user, rows);
    Ok(())
}

fn build_row(
    tables: &Tables,
    user: UserId,
    seed: &LeafSeed,
    granted_keys: &BTreeSet<String>,
    direct_assets: &HashSet<crate::model::AssetId>,
) -> MappingNode {
    let assets_amount = if seed.granted {
        grants::assets_in_subtree(tables, &seed.key, OrgScope::Root).len() as u64
    } else {
        let filter = SubtreeFilter::of(&seed.key);
        let mut counted = HashSet::new();
        for key in granted_keys {
            // Validated at insertion; granted keys are well-formed.
            let Ok(granted) = NodeKey::new(key.as_str()) else {
                continue;
            };
            if granted.is_descendant_of(&seed.key) {
                counted.extend(grants::assets_in_subtree(tables, &granted, OrgScope::Root));
            }
        }
        for &asset in direct_assets {
            let lives_here = tables
                .asset_nodes
                .get(&asset)
                .map(|nodes| {
                    nodes.iter().any(|id| {
                        tables
                            .node(*id)
                            .map(|node| filter.matches(&node.key))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false);
            if lives_here {
                counted.insert(asset);
            }
        }
        counted.len() as u64
    };

    MappingNode {
        user,
        node_id: seed.node_id,
        parent_key: seed.key.parent_key(),
        key: seed.key.clone(),
        granted: seed.granted,
        asset_granted: seed.asset_granted,
        assets_amount,
    }
}
