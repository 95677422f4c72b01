//! Tree-node rendering for the UI.
//!
//! The frontend tree widget consumes flat lists of `{id, pId, ...}` rows.
//! Nodes render under their parent key with an optional asset count in the
//! name; assets hang off the node they were listed under, with an icon by
//! platform and `nocheck` when they cannot be connected to over ssh.

use serde::Serialize;

use crate::model::{Asset, AssetId, NodeId, OrgId};
use crate::node_key::NodeKey;
use crate::query::VisibleChild;

/// One rendered tree entry, node or asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    /// Node key, or asset id.
    pub id: String,
    /// Display label.
    pub name: String,
    /// Hover title.
    pub title: String,
    /// Parent entry id.
    #[serde(rename = "pId")]
    pub p_id: String,
    /// Whether the entry can be expanded.
    #[serde(rename = "isParent")]
    pub is_parent: bool,
    /// Whether the entry starts expanded.
    pub open: bool,
    /// Icon hint for assets.
    #[serde(rename = "iconSkin", skip_serializing_if = "Option::is_none")]
    pub icon_skin: Option<String>,
    /// Set when the entry cannot be checked (no ssh protocol).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nocheck: Option<bool>,
    /// Typed payload for the frontend.
    pub meta: TreeMeta,
}

/// The typed payload behind a tree entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeMeta {
    /// A tree node.
    Node {
        /// Node details.
        node: NodeMeta,
    },
    /// An asset.
    Asset {
        /// Asset details.
        asset: AssetMeta,
    },
}

/// Node details carried in the meta block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeMeta {
    /// Authoritative node id.
    pub id: NodeId,
    /// Tree key.
    pub key: NodeKey,
    /// Display name.
    pub value: String,
}

/// Asset details carried in the meta block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetMeta {
    /// Asset id.
    pub id: AssetId,
    /// Hostname.
    pub hostname: String,
    /// Address.
    pub ip: String,
    /// Protocols as `name/port` strings.
    pub protocols: Vec<String>,
    /// Platform family.
    pub platform: String,
    /// Owning organization.
    pub org_id: OrgId,
}

/// Render visible children as tree entries. With `with_asset_amount` the
/// label carries the granted-asset count.
pub fn serialize_nodes(children: &[VisibleChild], with_asset_amount: bool) -> Vec<TreeNode> {
    children
        .iter()
        .map(|child| {
            let name = if with_asset_amount {
                format!("{} ({})", child.value, child.assets_amount)
            } else {
                child.value.clone()
            };
            TreeNode {
                id: child.key.as_str().to_owned(),
                title: name.clone(),
                name,
                p_id: child.parent_key.clone(),
                is_parent: true,
                open: child.key.is_root(),
                icon_skin: None,
                nocheck: None,
                meta: TreeMeta::Node {
                    node: NodeMeta {
                        id: child.node_id,
                        key: child.key.clone(),
                        value: child.value.clone(),
                    },
                },
            }
        })
        .collect()
}

/// Render assets as tree entries hanging off `node_key`.
pub fn serialize_assets(assets: &[Asset], node_key: &str) -> Vec<TreeNode> {
    assets
        .iter()
        .map(|asset| TreeNode {
            id: asset.id.to_string(),
            name: asset.hostname.clone(),
            title: asset.ip.clone(),
            p_id: node_key.to_owned(),
            is_parent: false,
            open: false,
            icon_skin: Some(platform_icon(&asset.platform_base).to_owned()),
            nocheck: Some(!asset.has_protocol("ssh")),
            meta: TreeMeta::Asset {
                asset: AssetMeta {
                    id: asset.id,
                    hostname: asset.hostname.clone(),
                    ip: asset.ip.clone(),
                    protocols: asset.protocols_as_list(),
                    platform: asset.platform_base.clone(),
                    org_id: asset.org_id,
                },
            },
        })
        .collect()
}

/// Icon for a platform base: `windows` and `linux` get their own, everything
/// else falls back to a plain file icon.
fn platform_icon(platform_base: &str) -> &'static str {
    match platform_base.to_lowercase().as_str() {
        "windows" => "windows",
        "linux" => "linux",
        _ => "file",
    }
}
