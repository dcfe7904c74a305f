//! Event model, reserved kinds, filters, and signature plumbing.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use rand::Rng;
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, i.e. the first field.
    pub fn name(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    /// Tag value, i.e. the second field if present.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Core signed event persisted in the store and served to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `39000`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the named tag, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find(|t| t.name() == name)?.value()
    }

    /// Whether any tag with the given name is present.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name() == name)
    }

    /// Identity tag used by addressable kinds.
    pub fn d_tag(&self) -> Option<&str> {
        self.tag_value("d")
    }
}

// Relay-private kinds. The roster kind sits in the replaceable range, the
// rest in the ephemeral range.
pub const MEMBERS: u32 = 18934;
pub const JOIN: u32 = 28934;
pub const INVITE: u32 = 28935;
pub const LEAVE: u32 = 28936;
pub const ADD_MEMBER: u32 = 28937;
pub const REMOVE_MEMBER: u32 = 28938;

// Host-protocol kinds.
pub const GROUP_CHAT: u32 = 9;
pub const GIFT_WRAP: u32 = 1059;
pub const PUT_USER: u32 = 9000;
pub const REMOVE_USER: u32 = 9001;
pub const EDIT_METADATA: u32 = 9002;
pub const CREATE_GROUP: u32 = 9007;
pub const DELETE_GROUP: u32 = 9008;
pub const JOIN_REQUEST: u32 = 9021;
pub const LEAVE_REQUEST: u32 = 9022;
pub const ZAP_RECEIPT: u32 = 9735;
pub const CLIENT_AUTH: u32 = 22242;
pub const APP_DATA: u32 = 30078;
pub const GROUP_METADATA: u32 = 39000;
pub const GROUP_ADMINS: u32 = 39001;
pub const GROUP_MEMBERS: u32 = 39002;

// Reserved identifiers for internal records. The `d` values are wire
// conventions shared with other implementations of the protocol.
pub const BANNED_PUBKEYS: &str = "zooid/banned_pubkeys";
pub const BANNED_EVENTS: &str = "zooid/banned_events";
pub const INTERNAL_PREFIX: &str = "zooid/";
pub const RELAY_MEMBERS: &str = "relay-members";

/// At most one survives per `(kind, author)`.
pub fn is_replaceable(kind: u32) -> bool {
    kind == 0 || kind == 3 || (10000..20000).contains(&kind)
}

/// Not persisted, except where the engine explicitly overrides.
pub fn is_ephemeral(kind: u32) -> bool {
    (20000..30000).contains(&kind)
}

/// At most one survives per `(kind, author, d)`.
pub fn is_addressable(kind: u32) -> bool {
    (30000..40000).contains(&kind)
}

/// Stored verbatim.
pub fn is_regular(kind: u32) -> bool {
    !is_replaceable(kind) && !is_ephemeral(kind) && !is_addressable(kind)
}

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

const TOKEN_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random uppercase alphanumeric token, used for invite claims and auth
/// challenges.
pub fn random_token(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| TOKEN_CHARS[rng.gen_range(0..TOKEN_CHARS.len())] as char)
        .collect()
}

/// Recompute the event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

/// Fill in `pubkey`, `id`, and `sig` from the given keypair.
pub fn sign_event(ev: &mut Event, keypair: &Keypair) -> Result<()> {
    let secp = Secp256k1::new();
    ev.pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
    let hash = event_hash(ev)?;
    ev.id = hex::encode(hash);
    let msg = Message::from_digest_slice(&hash)?;
    let sig = secp.sign_schnorr_no_aux_rand(&msg, keypair);
    ev.sig = hex::encode(sig.as_ref());
    Ok(())
}

/// Query predicate sent by clients and built internally.
///
/// All present clauses must match for an event to pass. `limit_zero` is the
/// wire encoding `"limit": 0` and means "match nothing".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub tags: BTreeMap<char, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub search: Option<String>,
    pub limit: Option<usize>,
    pub limit_zero: bool,
}

impl Filter {
    /// Add a single-character tag clause.
    pub fn tag(mut self, name: char, values: Vec<String>) -> Self {
        self.tags.insert(name, values);
        self
    }

    /// Build a `Filter` from a wire filter JSON object.
    pub fn from_value(val: &Value) -> Self {
        let strings = |v: &Value| -> Option<Vec<String>> {
            v.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
        };
        let ids = val.get("ids").and_then(strings);
        let authors = val.get("authors").and_then(strings);
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|u| u as u32))
                .collect()
        });
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                let mut chars = key.strip_prefix('#').unwrap_or_default().chars();
                if let (Some(c), None) = (chars.next(), chars.next()) {
                    if let Some(values) = strings(v) {
                        tags.insert(c, values);
                    }
                }
            }
        }
        let since = val.get("since").and_then(|v| v.as_u64());
        let until = val.get("until").and_then(|v| v.as_u64());
        let search = val
            .get("search")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let limit = val.get("limit").and_then(|v| v.as_u64());
        Filter {
            ids,
            authors,
            kinds,
            tags,
            since,
            until,
            search,
            limit: limit.filter(|&l| l > 0).map(|l| l as usize),
            limit_zero: limit == Some(0),
        }
    }

    /// Evaluate the conjunction of clauses against a single event.
    pub fn matches(&self, ev: &Event) -> bool {
        if self.limit_zero {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        for (name, values) in &self.tags {
            // Empty value sets are ignored, matching the store's behaviour.
            if values.is_empty() {
                continue;
            }
            let name = name.to_string();
            let hit = ev.tags.iter().any(|t| {
                t.name() == name && t.value().is_some_and(|v| values.iter().any(|w| w == v))
            });
            if !hit {
                return false;
            }
        }
        if let Some(search) = &self.search {
            if !ev.content.contains(search.as_str()) {
                return false;
            }
        }
        true
    }
}
