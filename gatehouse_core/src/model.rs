//! Authoritative entity rows and their typed identifiers.
//!
//! These mirror the shared relational tables the core reads: users, user
//! groups, tree nodes, assets and permissions. The core never mutates them
//! outside a [`crate::store::Database`] transaction.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node_key::NodeKey;

macro_rules! typed_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(
            /// The raw UUID.
            pub Uuid,
        );

        impl $name {
            /// A fresh random identifier.
            pub fn random() -> Self {
                $name(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

typed_id!(
    /// Identifier of a user row.
    UserId
);
typed_id!(
    /// Identifier of a user-group row.
    GroupId
);
typed_id!(
    /// Identifier of a tree-node row.
    NodeId
);
typed_id!(
    /// Identifier of an asset row.
    AssetId
);
typed_id!(
    /// Identifier of a permission row.
    PermissionId
);
typed_id!(
    /// Identifier of an organization.
    OrgId
);

/// Organization visibility for read operations.
///
/// Rebuilds always run under [`OrgScope::Root`]; queries carry the caller's
/// scope explicitly instead of relying on an ambient tenant switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrgScope {
    /// See every organization.
    Root,
    /// See a single organization.
    Org(OrgId),
}

impl OrgScope {
    /// Whether rows tagged with `org` are visible under this scope.
    pub fn permits(&self, org: OrgId) -> bool {
        match self {
            OrgScope::Root => true,
            OrgScope::Org(id) => *id == org,
        }
    }
}

/// A user row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Row id.
    pub id: UserId,
    /// Login name.
    pub username: String,
}

/// A user group and its membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroup {
    /// Row id.
    pub id: GroupId,
    /// Display name.
    pub name: String,
    /// Member users.
    pub users: HashSet<UserId>,
}

/// A tree-node row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Row id.
    pub id: NodeId,
    /// Position in the tree.
    pub key: NodeKey,
    /// Denormalized parent key; empty for roots. Kept in sync with `key`.
    pub parent_key: String,
    /// Display name.
    pub value: String,
    /// Denormalized count of assets in this node's subtree, filled by the
    /// backfill maintenance operation.
    pub assets_amount: u64,
    /// Owning organization.
    pub org_id: OrgId,
}

/// A connection protocol an asset speaks, e.g. `ssh/22`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    /// Protocol name, lowercased.
    pub name: String,
    /// Port.
    pub port: u16,
}

impl Protocol {
    /// Build a protocol entry.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Protocol {
            name: name.into().to_lowercase(),
            port,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.port)
    }
}

/// An asset (host) row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Row id.
    pub id: AssetId,
    /// Hostname.
    pub hostname: String,
    /// Address.
    pub ip: String,
    /// Platform family, e.g. `Linux`, `Windows`. Matched case-insensitively.
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

impl Asset {
    /// Whether the asset speaks the named protocol.
    pub fn has_protocol(&self, name: &str) -> bool {
        self.protocols
            .iter()
            .any(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Protocols as `name/port` strings.
    pub fn protocols_as_list(&self) -> Vec<String> {
        self.protocols.iter().map(Protocol::to_string).collect()
    }
}

/// A permission row: pure membership over four sets.
///
/// A user `U` is *linked* to a permission `P` iff `U` is in `P.users` or
/// some group in `P.groups` contains `U`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Row id.
    pub id: PermissionId,
    /// Display name.
    pub name: String,
    /// Directly granted users.
    pub users: HashSet<UserId>,
    /// Granted groups.
    pub groups: HashSet<GroupId>,
    /// Granted nodes; a node grant covers the node's whole subtree.
    pub nodes: HashSet<NodeId>,
    /// Directly granted assets.
    pub assets: HashSet<AssetId>,
}
