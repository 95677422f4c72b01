//! Query engine: the two hot reads over the mapping tree.
//!
//! Q1 enumerates the assets granted to a user under a key; Q2 enumerates
//! the child nodes a user can see, with per-node granted-asset counts.
//! Both share one dispatch: a present-and-granted row means the whole
//! subtree is authorized; a present-and-ungranted row means a partial
//! cover served from mapping rows; an absent row falls back to the nearest
//! granted ancestor or fails with `PermissionDenied`.

use std::collections::HashSet;
use std::time::Instant;

use serde::Serialize;

use crate::errors::CoreError;
use crate::gatehouse::Gatehouse;
use crate::grants;
use crate::lock::{user_lock_key, Stage};
use crate::model::{Asset, AssetId, NodeId, OrgScope, UserId};
use crate::node_key::NodeKey;
use crate::store::Tables;

/// Freshness hint carried by read requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Honor the staleness check: rebuild synchronously before serving.
    #[default]
    Fresh,
    /// Serve whatever the mapping tree currently holds.
    TolerateStale,
}

impl CachePolicy {
    /// Parse the wire form: `"1"` tolerates staleness, anything else is
    /// fresh.
    pub fn from_param(raw: &str) -> CachePolicy {
        if raw == "1" {
            CachePolicy::TolerateStale
        } else {
            CachePolicy::Fresh
        }
    }
}

/// Search and field filters for asset listings.
#[derive(Debug, Clone, Default)]
pub struct AssetFilter {
    /// Case-insensitive substring over hostname, ip and comment.
    pub search: Option<String>,
    /// Exact hostname.
    pub hostname: Option<String>,
    /// Exact address.
    pub ip: Option<String>,
}

impl AssetFilter {
    /// Whether the asset passes every requested filter.
    pub fn matches(&self, asset: &Asset) -> bool {
        if let Some(needle) = &self.search {
            let needle = needle.to_lowercase();
            let hit = asset.hostname.to_lowercase().contains(&needle)
                || asset.ip.to_lowercase().contains(&needle)
                || asset.comment.to_lowercase().contains(&needle);
            if !hit {
                return false;
            }
        }
        if let Some(hostname) = &self.hostname {
            if &asset.hostname != hostname {
                return false;
            }
        }
        if let Some(ip) = &self.ip {
            if &asset.ip != ip {
                return false;
            }
        }
        true
    }
}

/// Offset/limit paging.
#[derive(Debug, Clone, Copy, Default)]
pub struct Paging {
    /// Rows to skip.
    pub offset: usize,
    /// Max rows to return; `None` means all.
    pub limit: Option<usize>,
}

/// One page of results plus the unpaged total.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The page contents.
    pub items: Vec<T>,
    /// Total matching rows before paging.
    pub total: usize,
    /// The offset this page starts at.
    pub offset: usize,
}

/// A child node as the UI sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisibleChild {
    /// Authoritative node id.
    pub node_id: NodeId,
    /// Tree key.
    pub key: NodeKey,
    /// Parent key; empty for roots.
    pub parent_key: String,
    /// Display name.
    pub value: String,
    /// Whole subtree authorized.
    pub granted: bool,
    /// Holds a directly granted asset.
    pub asset_granted: bool,
    /// Granted-asset count for the subtree.
    pub assets_amount: u64,
}

impl Gatehouse {
    /// Q1: assets granted to `user`, rooted at `node_key`; an absent key
    /// means all granted assets. Sorted by hostname, then paged.
    pub fn list_granted_assets(
        &self,
        user: UserId,
        node_key: Option<&NodeKey>,
        scope: OrgScope,
        filter: &AssetFilter,
        paging: Paging,
        policy: CachePolicy,
    ) -> Result<Page<Asset>, CoreError> {
        self.ensure_fresh(user, policy)?;
        let tables = self.database().read();

        let ids = match node_key {
            None => self.all_granted_asset_ids(&tables, user, scope),
            Some(key) => self.granted_asset_ids_under(&tables, user, key, scope)?,
        };

        let mut assets: Vec<Asset> = ids
            .into_iter()
            .filter_map(|id| tables.asset(id))
            .filter(|asset| scope.permits(asset.org_id) && filter.matches(asset))
            .cloned()
            .collect();
        assets.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        let total = assets.len();
        let items: Vec<Asset> = assets
            .into_iter()
            .skip(paging.offset)
            .take(paging.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(Page {
            items,
            total,
            offset: paging.offset,
        })
    }

    /// Q2: child nodes of `node_key` visible to `user`; an absent key lists
    /// the user's visible roots. Key-ordered.
    pub fn list_visible_children(
        &self,
        user: UserId,
        node_key: Option<&NodeKey>,
        policy: CachePolicy,
    ) -> Result<Vec<VisibleChild>, CoreError> {
        self.ensure_fresh(user, policy)?;
        let tables = self.database().read();
        match node_key {
            None => Ok(mapping_children(&tables, tables.mapping.roots(user))),
            Some(key) => self.children_under(&tables, user, key),
        }
    }

    /// Q2 plus the assets rendered at that level: every asset directly in a
    /// granted node, or the user's directly granted assets in an ungranted
    /// asset-holding node.
    pub fn list_visible_children_with_assets(
        &self,
        user: UserId,
        node_key: Option<&NodeKey>,
        scope: OrgScope,
        policy: CachePolicy,
    ) -> Result<(Vec<VisibleChild>, Vec<Asset>), CoreError> {
        self.ensure_fresh(user, policy)?;
        let tables = self.database().read();
        let Some(key) = node_key else {
            return Ok((mapping_children(&tables, tables.mapping.roots(user)), Vec::new()));
        };

        let children = self.children_under(&tables, user, key)?;
        let node = tables
            .node_by_key(key.as_str())
            .ok_or(CoreError::NotFound("node"))?;

        let direct_ids: Vec<AssetId> = match tables.mapping.get(user, key.as_str()) {
            Some(row) if row.granted => assets_directly_in(&tables, node.id),
            Some(row) if row.asset_granted => {
                let granted = grants::asset_granted_assets(&tables, user);
                assets_directly_in(&tables, node.id)
                    .into_iter()
                    .filter(|id| granted.contains(id))
                    .collect()
            }
            Some(_) => Vec::new(),
            // `children_under` already vetted the granted ancestor.
            None => assets_directly_in(&tables, node.id),
        };

        let mut assets: Vec<Asset> = direct_ids
            .into_iter()
            .filter_map(|id| tables.asset(id))
            .filter(|asset| scope.permits(asset.org_id))
            .cloned()
            .collect();
        assets.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok((children, assets))
    }

    /// The user's whole visible tree in one shot: every mapping row plus
    /// every descendant of a granted row, key-ordered.
    pub fn granted_tree(
        &self,
        user: UserId,
        policy: CachePolicy,
    ) -> Result<Vec<VisibleChild>, CoreError> {
        self.ensure_fresh(user, policy)?;
        let tables = self.database().read();

        let mut by_key = std::collections::BTreeMap::new();
        let mut granted_roots = Vec::new();
        for row in tables.mapping.rows_for_user(user) {
            if row.granted {
                granted_roots.push(row.key.clone());
            }
            if let Some(child) = mapping_child(&tables, row) {
                by_key.insert(row.key.as_str().to_owned(), child);
            }
        }
        for root in granted_roots {
            for node in tables.nodes_in_subtree(&root) {
                if node.key == root {
                    continue;
                }
                by_key.insert(node.key.as_str().to_owned(), node_child(&tables, node));
            }
        }
        Ok(by_key.into_values().collect())
    }

    /// The current mapping rows of `user`, for admin and debugging
    /// surfaces. Key-ordered; no staleness check.
    pub fn mapping_rows(&self, user: UserId) -> Vec<crate::mapping::MappingNode> {
        self.database()
            .read()
            .mapping
            .rows_for_user(user)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Block until `user`'s mapping tree is fresh, or fail with the
    /// contention error the surface expects.
    ///
    /// A holder in `DOING` fails the read immediately; a holder in
    /// `COMMITTING` is about to finish, so the reader retries within a
    /// budget of a quarter of the lock TTL.
    fn ensure_fresh(&self, user: UserId, policy: CachePolicy) -> Result<(), CoreError> {
        if policy == CachePolicy::TolerateStale {
            return Ok(());
        }
        if !self.database().read().tasks.has_for_user(user) {
            return Ok(());
        }

        let key = user_lock_key(user);
        let deadline = Instant::now() + self.config().reader_retry_budget();
        loop {
            match self.runner().run_for_user(user) {
                Ok(()) => return Ok(()),
                Err(CoreError::SomeoneIsDoingThis) => match self.locks().stage(&key) {
                    Some(Stage::Doing) => return Err(CoreError::AdminIsModifyingPerm),
                    Some(Stage::Committing) | None => {
                        if Instant::now() >= deadline {
                            return Err(CoreError::AdminIsModifyingPerm);
                        }
                        std::thread::sleep(self.config().reader_retry_interval());
                        if !self.database().read().tasks.has_for_user(user) {
                            return Ok(());
                        }
                    }
                },
                Err(err) => return Err(err),
            }
        }
    }

    fn all_granted_asset_ids(
        &self,
        tables: &Tables,
        user: UserId,
        scope: OrgScope,
    ) -> HashSet<AssetId> {
        let mut out = grants::asset_granted_assets(tables, user);
        for row in tables.mapping.rows_for_user(user) {
            if row.granted {
                out.extend(grants::assets_in_subtree(tables, &row.key, scope));
            }
        }
        out
    }

    fn granted_asset_ids_under(
        &self,
        tables: &Tables,
        user: UserId,
        key: &NodeKey,
        scope: OrgScope,
    ) -> Result<HashSet<AssetId>, CoreError> {
        tables
            .node_by_key(key.as_str())
            .ok_or(CoreError::NotFound("node"))?;

        match tables.mapping.get(user, key.as_str()) {
            Some(row) if row.granted => Ok(grants::assets_in_subtree(tables, key, scope)),
            Some(row) => {
                // Partial cover: granted descendants contribute their whole
                // subtrees; asset-holding descendants (and this node, if it
                // holds) contribute the user's directly granted assets.
                let mut out = HashSet::new();
                for granted in tables.mapping.granted_descendants(user, key) {
                    out.extend(grants::assets_in_subtree(tables, &granted.key, scope));
                }
                let mut holders: HashSet<NodeId> = tables
                    .mapping
                    .asset_granted_descendants(user, key)
                    .into_iter()
                    .map(|r| r.node_id)
                    .collect();
                if row.asset_granted {
                    holders.insert(row.node_id);
                }
                if !holders.is_empty() {
                    for asset in grants::asset_granted_assets(tables, user) {
                        let held = tables
                            .asset_nodes
                            .get(&asset)
                            .map(|nodes| nodes.iter().any(|id| holders.contains(id)))
                            .unwrap_or(false);
                        if held {
                            out.insert(asset);
                        }
                    }
                }
                Ok(out)
            }
            None => {
                if tables.mapping.has_granted_ancestor(user, key) {
                    Ok(grants::assets_in_subtree(tables, key, scope))
                } else {
                    Err(CoreError::PermissionDenied)
                }
            }
        }
    }

    fn children_under(
        &self,
        tables: &Tables,
        user: UserId,
        key: &NodeKey,
    ) -> Result<Vec<VisibleChild>, CoreError> {
        match tables.mapping.get(user, key.as_str()) {
            Some(row) if row.granted => Ok(granted_children(tables, key)),
            Some(_) => Ok(mapping_children(
                tables,
                tables.mapping.children_of(user, key.as_str()),
            )),
            None => {
                tables
                    .node_by_key(key.as_str())
                    .ok_or(CoreError::NotFound("node"))?;
                if tables.mapping.has_granted_ancestor(user, key) {
                    Ok(granted_children(tables, key))
                } else {
                    Err(CoreError::PermissionDenied)
                }
            }
        }
    }
}

/// Children served from the authoritative node table under a granted key:
/// every child is granted by inheritance and counts its live subtree.
fn granted_children(tables: &Tables, key: &NodeKey) -> Vec<VisibleChild> {
    tables
        .child_nodes(key)
        .into_iter()
        .map(|node| node_child(tables, node))
        .collect()
}

fn node_child(tables: &Tables, node: &crate::model::Node) -> VisibleChild {
    VisibleChild {
        node_id: node.id,
        key: node.key.clone(),
        parent_key: node.parent_key.clone(),
        value: node.value.clone(),
        granted: true,
        asset_granted: false,
        assets_amount: grants::assets_in_subtree(tables, &node.key, OrgScope::Root).len() as u64,
    }
}

fn mapping_children(
    tables: &Tables,
    rows: Vec<&crate::mapping::MappingNode>,
) -> Vec<VisibleChild> {
    rows.into_iter()
        .filter_map(|row| mapping_child(tables, row))
        .collect()
}

fn mapping_child(tables: &Tables, row: &crate::mapping::MappingNode) -> Option<VisibleChild> {
    let node = tables.node(row.node_id)?;
    Some(VisibleChild {
        node_id: row.node_id,
        key: row.key.clone(),
        parent_key: row.parent_key.clone(),
        value: node.value.clone(),
        granted: row.granted,
        asset_granted: row.asset_granted,
        assets_amount: row.assets_amount,
    })
}

fn assets_directly_in(tables: &Tables, node: NodeId) -> Vec<AssetId> {
    tables
        .node_assets
        .get(&node)
        .map(|assets| assets.iter().copied().collect())
        .unwrap_or_default()
}
