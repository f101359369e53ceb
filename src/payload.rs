//! Typed per-kind object payloads
//!
//! Each object kind carries its own payload type. Principal rewriting and
//! cross-object reference remapping match on the kind exhaustively, so a new
//! kind cannot be added without deciding how both apply to it.

use crate::RewriteTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Directory object kinds the engine knows how to carry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// User account
    User,
    /// Security or mail-enabled group
    Group,
    /// Application registration
    Application,
    /// Named network location
    NamedLocation,
    /// Conditional access policy
    ConditionalAccessPolicy,
    /// Device configuration profile
    DeviceConfiguration,
}

impl ObjectKind {
    /// Label used in object keys and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Application => "application",
            Self::NamedLocation => "named_location",
            Self::ConditionalAccessPolicy => "conditional_access_policy",
            Self::DeviceConfiguration => "device_configuration",
        }
    }

    /// Kinds whose deletion may leave side effects behind
    pub fn is_policy_bearing(&self) -> bool {
        matches!(self, Self::ConditionalAccessPolicy | Self::DeviceConfiguration)
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User account payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayload {
    /// Sign-in name, rewritten into the destination domain
    pub user_principal_name: String,
    /// Display name
    pub display_name: String,
    /// Primary mail address, rewritten with the principal
    pub mail: Option<String>,
    /// Whether sign-in is allowed
    pub account_enabled: bool,
}

/// Group payload; members are user ids
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPayload {
    /// Display name
    pub display_name: String,
    /// Mail alias, unique within a tenant
    pub mail_nickname: String,
    /// Member user ids
    pub member_ids: Vec<String>,
}

/// Application registration payload; owners are user ids
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationPayload {
    /// Display name
    pub display_name: String,
    /// Reply URLs
    pub redirect_uris: Vec<String>,
    /// Owner user ids
    pub owner_ids: Vec<String>,
}

/// Named location payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedLocationPayload {
    /// Display name
    pub display_name: String,
    /// CIDR ranges
    pub ip_ranges: Vec<String>,
    /// Marked as a trusted location
    pub is_trusted: bool,
}

/// Conditional access policy enforcement state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyState {
    /// Enforced
    Enabled,
    /// Not evaluated
    Disabled,
    /// Evaluated and logged, not enforced
    ReportOnly,
}

/// Conditional access policy payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalAccessPolicyPayload {
    /// Display name
    pub display_name: String,
    /// Enforcement state
    pub state: PolicyState,
    /// Targeted user ids
    pub include_user_ids: Vec<String>,
    /// Excluded user ids
    pub exclude_user_ids: Vec<String>,
    /// Targeted group ids
    pub include_group_ids: Vec<String>,
    /// Named location ids the policy conditions on
    pub named_location_ids: Vec<String>,
    /// Required grant controls, e.g. `mfa`
    pub grant_controls: Vec<String>,
}

/// Device configuration profile payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfigurationPayload {
    /// Display name
    pub display_name: String,
    /// Target platform
    pub platform: String,
    /// Profile settings
    pub settings: BTreeMap<String, String>,
    /// Assigned group ids
    pub assigned_group_ids: Vec<String>,
}

/// Payload of one directory object, tagged by kind
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectPayload {
    /// User account
    User(UserPayload),
    /// Group
    Group(GroupPayload),
    /// Application registration
    Application(ApplicationPayload),
    /// Named location
    NamedLocation(NamedLocationPayload),
    /// Conditional access policy
    ConditionalAccessPolicy(ConditionalAccessPolicyPayload),
    /// Device configuration profile
    DeviceConfiguration(DeviceConfigurationPayload),
}

/// Source id referenced by a payload that must be translated before create
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    /// Kind of the referenced object
    pub kind: ObjectKind,
    /// Source-side id
    pub source_id: String,
}

/// Reference that had no destination mapping
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unresolved {kind} reference '{source_id}'")]
pub struct UnresolvedReference {
    /// Kind of the referenced object
    pub kind: ObjectKind,
    /// Source-side id
    pub source_id: String,
}

impl ObjectPayload {
    /// Kind of this payload
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::User(_) => ObjectKind::User,
            Self::Group(_) => ObjectKind::Group,
            Self::Application(_) => ObjectKind::Application,
            Self::NamedLocation(_) => ObjectKind::NamedLocation,
            Self::ConditionalAccessPolicy(_) => ObjectKind::ConditionalAccessPolicy,
            Self::DeviceConfiguration(_) => ObjectKind::DeviceConfiguration,
        }
    }

    /// Display name of the object
    pub fn display_name(&self) -> &str {
        match self {
            Self::User(p) => &p.display_name,
            Self::Group(p) => &p.display_name,
            Self::Application(p) => &p.display_name,
            Self::NamedLocation(p) => &p.display_name,
            Self::ConditionalAccessPolicy(p) => &p.display_name,
            Self::DeviceConfiguration(p) => &p.display_name,
        }
    }

    /// Name a destination lookup matches on for this kind
    pub fn natural_key(&self) -> &str {
        match self {
            Self::User(p) => &p.user_principal_name,
            Self::Group(p) => &p.mail_nickname,
            _ => self.display_name(),
        }
    }

    /// Copy with every principal name rewritten into the destination domain
    pub fn rewrite_principals(&self, table: &RewriteTable) -> Self {
        match self {
            Self::User(p) => Self::User(UserPayload {
                user_principal_name: table.rewrite(&p.user_principal_name),
                mail: p.mail.as_deref().map(|m| table.rewrite(m)),
                ..p.clone()
            }),
            Self::Group(p) => Self::Group(p.clone()),
            Self::Application(p) => Self::Application(p.clone()),
            Self::NamedLocation(p) => Self::NamedLocation(p.clone()),
            Self::ConditionalAccessPolicy(p) => Self::ConditionalAccessPolicy(p.clone()),
            Self::DeviceConfiguration(p) => Self::DeviceConfiguration(p.clone()),
        }
    }

    /// Source ids this payload points at
    pub fn references(&self) -> Vec<Reference> {
        let refs = |kind: ObjectKind, ids: &[String]| {
            ids.iter()
                .map(move |id| Reference {
                    kind,
                    source_id: id.clone(),
                })
                .collect::<Vec<_>>()
        };
        match self {
            Self::User(_) | Self::NamedLocation(_) => Vec::new(),
            Self::Group(p) => refs(ObjectKind::User, &p.member_ids),
            Self::Application(p) => refs(ObjectKind::User, &p.owner_ids),
            Self::ConditionalAccessPolicy(p) => {
                let mut all = refs(ObjectKind::User, &p.include_user_ids);
                all.extend(refs(ObjectKind::User, &p.exclude_user_ids));
                all.extend(refs(ObjectKind::Group, &p.include_group_ids));
                all.extend(refs(ObjectKind::NamedLocation, &p.named_location_ids));
                all
            }
            Self::DeviceConfiguration(p) => refs(ObjectKind::Group, &p.assigned_group_ids),
        }
    }

    /// Copy with every reference translated through `resolve`.
    ///
    /// Fails on the first reference `resolve` cannot translate.
    pub fn remap<F>(&self, resolve: F) -> Result<Self, UnresolvedReference>
    where
        F: Fn(ObjectKind, &str) -> Option<String>,
    {
        let map = |kind: ObjectKind, ids: &[String]| -> Result<Vec<String>, UnresolvedReference> {
            ids.iter()
                .map(|id| {
                    resolve(kind, id).ok_or_else(|| UnresolvedReference {
                        kind,
                        source_id: id.clone(),
                    })
                })
                .collect()
        };
        Ok(match self {
            Self::User(p) => Self::User(p.clone()),
            Self::NamedLocation(p) => Self::NamedLocation(p.clone()),
            Self::Group(p) => Self::Group(GroupPayload {
                member_ids: map(ObjectKind::User, &p.member_ids)?,
                ..p.clone()
            }),
            Self::Application(p) => Self::Application(ApplicationPayload {
                owner_ids: map(ObjectKind::User, &p.owner_ids)?,
                ..p.clone()
            }),
            Self::ConditionalAccessPolicy(p) => Self::ConditionalAccessPolicy(ConditionalAccessPolicyPayload {
                include_user_ids: map(ObjectKind::User, &p.include_user_ids)?,
                exclude_user_ids: map(ObjectKind::User, &p.exclude_user_ids)?,
                include_group_ids: map(ObjectKind::Group, &p.include_group_ids)?,
                named_location_ids: map(ObjectKind::NamedLocation, &p.named_location_ids)?,
                ..p.clone()
            }),
            Self::DeviceConfiguration(p) => Self::DeviceConfiguration(DeviceConfigurationPayload {
                assigned_group_ids: map(ObjectKind::Group, &p.assigned_group_ids)?,
                ..p.clone()
            }),
        })
    }

    /// Why this object should not be migrated, if anything
    pub fn skip_reason(&self) -> Option<String> {
        match self {
            Self::User(p) if p.user_principal_name.contains("#EXT#") => {
                Some("guest account; re-invite at destination".to_string())
            }
            _ => None,
        }
    }
}
