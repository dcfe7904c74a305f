//! Per-instance configuration and capability checks.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use secp256k1::{Keypair, Secp256k1};
use serde::Deserialize;

use crate::event::{sign_event, Event};

/// Named role granting capabilities to a set of pubkeys.
///
/// The role named `member` is a wildcard: its capabilities apply to every
/// pubkey regardless of the `pubkeys` list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Role {
    #[serde(default)]
    pub pubkeys: Vec<String>,
    #[serde(default)]
    pub can_invite: bool,
    #[serde(default)]
    pub can_manage: bool,
}

/// Display information served in the relay information document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Info {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon: String,
    /// Owner public key (hex).
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Policy {
    /// Allow reads of non-private group content without group membership.
    #[serde(default)]
    pub open: bool,
    /// Zero signatures on events served to non-managers.
    #[serde(default)]
    pub strip_signatures: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auto_join: bool,
    #[serde(default = "default_true")]
    pub auto_leave: bool,
    #[serde(default)]
    pub admin_create_only: bool,
    #[serde(default)]
    pub private_admin_only: bool,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_join: false,
            auto_leave: true,
            admin_create_only: false,
            private_admin_only: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Per-instance settings loaded from `<config-dir>/<host>.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    /// Table-name prefix isolating this tenant in the shared database.
    pub schema: String,
    /// Instance secret key (hex). Cleared after parsing.
    #[serde(default)]
    secret: String,
    #[serde(default)]
    pub info: Info,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub groups: GroupsConfig,
    #[serde(default)]
    pub roles: BTreeMap<String, Role>,
    #[serde(skip)]
    keypair: Option<Keypair>,
}

impl Config {
    /// Load and validate settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: Config = toml::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;
        if config.host.is_empty() {
            bail!("host is required");
        }
        config.validate_schema()?;
        let secret = hex::decode(&config.secret).context("decoding instance secret")?;
        let secp = Secp256k1::new();
        config.keypair = Some(Keypair::from_seckey_slice(&secp, &secret)?);
        config.secret.clear();
        Ok(config)
    }

    /// The schema prefix is interpolated into table names and must stay a
    /// plain identifier.
    fn validate_schema(&self) -> Result<()> {
        let ok = !self.schema.is_empty()
            && self
                .schema
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !ok {
            bail!("schema must be a non-empty identifier, got {:?}", self.schema);
        }
        Ok(())
    }

    fn keypair(&self) -> Result<&Keypair> {
        self.keypair
            .as_ref()
            .ok_or_else(|| anyhow!("instance key not loaded"))
    }

    /// The instance's own public key (hex).
    pub fn self_pubkey(&self) -> String {
        self.keypair
            .as_ref()
            .map(|kp| hex::encode(kp.x_only_public_key().0.serialize()))
            .unwrap_or_default()
    }

    pub fn is_self(&self, pubkey: &str) -> bool {
        pubkey == self.self_pubkey()
    }

    pub fn is_owner(&self, pubkey: &str) -> bool {
        !self.info.pubkey.is_empty() && pubkey == self.info.pubkey
    }

    /// Roles applying to a pubkey: any role listing it, plus the wildcard
    /// `member` role.
    pub fn roles_for(&self, pubkey: &str) -> Vec<&Role> {
        self.roles
            .iter()
            .filter(|(name, role)| {
                name.as_str() == "member" || role.pubkeys.iter().any(|p| p == pubkey)
            })
            .map(|(_, role)| role)
            .collect()
    }

    /// Whether any non-wildcard role names this pubkey.
    pub fn in_roles(&self, pubkey: &str) -> bool {
        self.roles
            .values()
            .any(|role| role.pubkeys.iter().any(|p| p == pubkey))
    }

    pub fn can_manage(&self, pubkey: &str) -> bool {
        self.roles_for(pubkey).iter().any(|role| role.can_manage)
    }

    pub fn can_invite(&self, pubkey: &str) -> bool {
        self.roles_for(pubkey).iter().any(|role| role.can_invite)
    }

    /// Managers: the configured owner, the instance itself, and any pubkey
    /// holding a `can_manage` role.
    pub fn is_admin(&self, pubkey: &str) -> bool {
        self.is_owner(pubkey) || self.is_self(pubkey) || self.can_manage(pubkey)
    }

    /// All manager pubkeys, for the relay-level admins projection.
    pub fn managers(&self) -> Vec<String> {
        let mut out = vec![self.self_pubkey()];
        if !self.info.pubkey.is_empty() && !out.contains(&self.info.pubkey) {
            out.push(self.info.pubkey.clone());
        }
        for role in self.roles.values() {
            if role.can_manage {
                for p in &role.pubkeys {
                    if !out.contains(p) {
                        out.push(p.clone());
                    }
                }
            }
        }
        out
    }

    /// Sign an event with the instance key.
    pub fn sign(&self, ev: &mut Event) -> Result<()> {
        sign_event(ev, self.keypair()?)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::event::testutil::pubkey;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("relay.toml");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let secret = "01".repeat(32);
        let owner = pubkey(7);
        let body = format!(
            r#"
host = "relay.example.com"
schema = "main"
secret = "{secret}"

[info]
name = "Example"
pubkey = "{owner}"
description = "a relay"

[policy]
open = true
strip_signatures = true

[groups]
enabled = true
auto_join = true
admin_create_only = true

[roles.admin]
pubkeys = ["{owner}"]
can_invite = true
can_manage = true

[roles.member]
can_invite = true
"#
        );
        let path = write_config(&dir, &body);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.host, "relay.example.com");
        assert_eq!(config.schema, "main");
        assert!(config.policy.open);
        assert!(config.policy.strip_signatures);
        assert!(config.groups.enabled);
        assert!(config.groups.auto_join);
        assert!(config.groups.auto_leave);
        assert!(config.groups.admin_create_only);
        assert!(!config.groups.private_admin_only);
        assert_eq!(config.roles.len(), 2);
        assert!(!config.self_pubkey().is_empty());
    }

    #[test]
    fn rejects_missing_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!("host = \"\"\nschema = \"s\"\nsecret = \"{}\"\n", "01".repeat(32)),
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn rejects_bad_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!(
                "host = \"h\"\nschema = \"bad-schema;\"\nsecret = \"{}\"\n",
                "01".repeat(32)
            ),
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn rejects_bad_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "host = \"h\"\nschema = \"s\"\nsecret = \"xyz\"\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn owner_and_self_are_admins() {
        let config = test_config(99, 7);
        assert!(config.is_owner(&pubkey(7)));
        assert!(config.is_admin(&pubkey(7)));
        assert!(config.is_self(&config.self_pubkey()));
        assert!(config.is_admin(&config.self_pubkey()));
        assert!(!config.is_admin(&pubkey(3)));
    }

    #[test]
    fn role_capabilities() {
        let config = with_role(
            test_config(99, 7),
            "mods",
            Role {
                pubkeys: vec![pubkey(3)],
                can_invite: true,
                can_manage: true,
            },
        );
        assert!(config.can_manage(&pubkey(3)));
        assert!(config.can_invite(&pubkey(3)));
        assert!(config.is_admin(&pubkey(3)));
        assert!(config.in_roles(&pubkey(3)));
        assert!(!config.can_manage(&pubkey(4)));
    }

    #[test]
    fn member_wildcard_role_applies_to_anyone() {
        let config = with_role(
            test_config(99, 7),
            "member",
            Role {
                pubkeys: vec![],
                can_invite: true,
                can_manage: false,
            },
        );
        assert!(config.can_invite(&pubkey(42)));
        assert!(!config.can_manage(&pubkey(42)));
        // The wildcard grants capabilities, not roster membership.
        assert!(!config.in_roles(&pubkey(42)));
    }

    #[test]
    fn signing_uses_instance_key() {
        let config = test_config(99, 7);
        let mut ev = Event {
            id: String::new(),
            pubkey: String::new(),
            kind: 1,
            created_at: 100,
            tags: vec![],
            content: "signed by relay".into(),
            sig: String::new(),
        };
        config.sign(&mut ev).unwrap();
        assert_eq!(ev.pubkey, config.self_pubkey());
        crate::event::verify_event(&ev).unwrap();
    }
}
