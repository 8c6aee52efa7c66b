//! Secret store policies and the machine-auth role
//!
//! One policy per access tier, expressed as path-glob -> capability rules and
//! rendered as HCL for the store's ACL endpoint.

use serde::{Deserialize, Serialize};

use crate::types::AccessTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Create,
    Read,
    Update,
    Delete,
    List,
    Sudo,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Create => "create",
            Capability::Read => "read",
            Capability::Update => "update",
            Capability::Delete => "delete",
            Capability::List => "list",
            Capability::Sudo => "sudo",
        }
    }

    /// Enumerated capability set granted to a tier
    pub fn for_tier(tier: AccessTier) -> Vec<Capability> {
        match tier {
            AccessTier::ReadOnly => vec![Capability::Read, Capability::List],
            AccessTier::ReadWrite => vec![
                Capability::Create,
                Capability::Read,
                Capability::Update,
                Capability::List,
            ],
            AccessTier::Admin => vec![
                Capability::Create,
                Capability::Read,
                Capability::Update,
                Capability::Delete,
                Capability::List,
                Capability::Sudo,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    pub path: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub rules: Vec<PathRule>,
}

impl Policy {
    /// Policy scoping a tier to the KV mount's data and metadata paths
    pub fn for_tier(tier: AccessTier, mount: &str) -> Self {
        let capabilities = Capability::for_tier(tier);
        let mut rules = vec![
            PathRule {
                path: format!("{}/data/*", mount),
                capabilities: capabilities.clone(),
            },
            PathRule {
                path: format!("{}/metadata/*", mount),
                capabilities: capabilities
                    .iter()
                    .copied()
                    .filter(|c| matches!(c, Capability::Read | Capability::List | Capability::Delete))
                    .collect(),
            },
        ];

        if tier == AccessTier::Admin {
            rules.push(PathRule {
                path: "sys/policies/acl/*".to_string(),
                capabilities: capabilities.clone(),
            });
            rules.push(PathRule {
                path: "auth/approle/*".to_string(),
                capabilities,
            });
        }

        Self {
            name: tier.as_str().to_string(),
            rules,
        }
    }

    /// All three tier policies
    pub fn tier_policies(mount: &str) -> Vec<Self> {
        AccessTier::ALL
            .iter()
            .map(|tier| Self::for_tier(*tier, mount))
            .collect()
    }

    pub fn to_hcl(&self) -> String {
        let mut hcl = String::new();
        for rule in &self.rules {
            let caps: Vec<String> = rule
                .capabilities
                .iter()
                .map(|c| format!("\"{}\"", c.as_str()))
                .collect();
            hcl.push_str(&format!(
                "path \"{}\" {{\n  capabilities = [{}]\n}}\n\n",
                rule.path,
                caps.join(", ")
            ));
        }
        hcl
    }
}

/// Machine-auth role definition. The secret id may be used any number of
/// times; issued session tokens live 24h and renew up to 48h.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRoleSpec {
    pub name: String,
    pub token_policies: Vec<String>,
    pub token_ttl: String,
    pub token_max_ttl: String,
    pub secret_id_num_uses: u32,
}

impl AppRoleSpec {
    pub const TOKEN_TTL: &'static str = "24h";
    pub const TOKEN_MAX_TTL: &'static str = "48h";

    pub fn reconciler(name: &str, policy: &str) -> Self {
        Self {
            name: name.to_string(),
            token_policies: vec![policy.to_string()],
            token_ttl: Self::TOKEN_TTL.to_string(),
            token_max_ttl: Self::TOKEN_MAX_TTL.to_string(),
            secret_id_num_uses: 0,
        }
    }
}
