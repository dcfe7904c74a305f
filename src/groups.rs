//! Group lifecycle, membership projections, and access predicates.
//!
//! Groups are defined entirely by events: a server-maintained metadata
//! event per group, and moderation events (`put-user` / `remove-user`)
//! folded on demand into member lists. Nothing here is cached; the event
//! log is the source of truth.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::config::Config;
use crate::event::{
    Event, Filter, Tag, CREATE_GROUP, DELETE_GROUP, EDIT_METADATA, GROUP_ADMINS, GROUP_MEMBERS,
    GROUP_METADATA, JOIN_REQUEST, LEAVE_REQUEST, PUT_USER, REMOVE_USER,
};
use crate::instance::Reject;
use crate::store::Store;

/// Group id reserved for relay-level projections.
pub const RELAY_GROUP: &str = "_";

/// The group a content or projection event refers to: the `h` tag, or the
/// `d` tag for metadata-class kinds.
pub fn group_ref(ev: &Event) -> Option<&str> {
    if let Some(h) = ev.tag_value("h") {
        return Some(h);
    }
    if (GROUP_METADATA..=GROUP_MEMBERS).contains(&ev.kind) {
        return ev.d_tag();
    }
    None
}

fn is_moderation_kind(kind: u32) -> bool {
    matches!(kind, PUT_USER | REMOVE_USER | EDIT_METADATA | DELETE_GROUP)
}

/// Boolean flag inside a group's JSON content body.
fn content_flag(content: &str, flag: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(content)
        .ok()
        .and_then(|v| v.get(flag)?.as_bool())
        .unwrap_or(false)
}

/// Per-instance group subsystem.
#[derive(Clone)]
pub struct Groups {
    config: Arc<Config>,
    events: Store,
}

impl Groups {
    pub fn new(config: Arc<Config>, events: Store) -> Self {
        Self { config, events }
    }

    pub fn events(&self) -> &Store {
        &self.events
    }

    /// The single newest metadata event for a group.
    pub fn get_metadata(&self, h: &str) -> Result<Option<Event>> {
        let filter = Filter {
            kinds: Some(vec![GROUP_METADATA]),
            limit: Some(1),
            ..Filter::default()
        }
        .tag('d', vec![h.into()]);
        Ok(self.events.query(&filter, 1)?.into_iter().next())
    }

    /// Ids of every group known through stored metadata.
    pub fn list_group_ids(&self) -> Result<Vec<String>> {
        let filter = Filter {
            kinds: Some(vec![GROUP_METADATA]),
            ..Filter::default()
        };
        let mut ids: Vec<String> = self
            .events
            .query(&filter, 0)?
            .iter()
            .filter_map(|ev| ev.d_tag().map(String::from))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Fold the moderation stream into the current member set.
    ///
    /// Events are applied in ascending `(created_at, id)` order so the last
    /// writer wins deterministically under timestamp ties.
    pub fn group_members(&self, h: &str) -> Result<Vec<String>> {
        let filter = Filter {
            kinds: Some(vec![PUT_USER, REMOVE_USER]),
            ..Filter::default()
        }
        .tag('h', vec![h.into()]);
        let mut moderation = self.events.query(&filter, 0)?;
        moderation.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let mut members: Vec<String> = vec![];
        for ev in moderation {
            for tag in ev.tags.iter().filter(|t| t.name() == "p") {
                let Some(p) = tag.value() else { continue };
                match ev.kind {
                    PUT_USER => {
                        if !members.iter().any(|m| m == p) {
                            members.push(p.to_string());
                        }
                    }
                    REMOVE_USER => members.retain(|m| m != p),
                    _ => {}
                }
            }
        }
        Ok(members)
    }

    /// Group admins: whoever created the group, plus the relay managers.
    pub fn group_admins(&self, h: &str) -> Result<Vec<String>> {
        let filter = Filter {
            kinds: Some(vec![CREATE_GROUP]),
            ..Filter::default()
        }
        .tag('h', vec![h.into()]);
        let mut admins: Vec<String> = self
            .events
            .query(&filter, 0)?
            .into_iter()
            .map(|ev| ev.pubkey)
            .collect();
        for manager in self.config.managers() {
            if !admins.iter().any(|a| a == &manager) {
                admins.push(manager);
            }
        }
        Ok(admins)
    }

    /// Admin-or-member access to a group.
    pub fn has_access(&self, pubkey: &str, h: &str) -> Result<bool> {
        if self.config.is_admin(pubkey) {
            return Ok(true);
        }
        if self.group_admins(h)?.iter().any(|a| a == pubkey) {
            return Ok(true);
        }
        Ok(self.group_members(h)?.iter().any(|m| m == pubkey))
    }

    /// Read gate for a single event, evaluated against the caller.
    pub fn can_read(&self, pubkey: Option<&str>, ev: &Event) -> bool {
        match self.can_read_inner(pubkey, ev) {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "group read check failed");
                false
            }
        }
    }

    fn can_read_inner(&self, pubkey: Option<&str>, ev: &Event) -> Result<bool> {
        if !self.config.groups.enabled {
            return Ok(false);
        }
        let Some(h) = group_ref(ev) else {
            return Ok(false);
        };
        if h == RELAY_GROUP {
            return Ok(true);
        }
        let Some(meta) = self.get_metadata(h)? else {
            return Ok(false);
        };
        let access = match pubkey {
            Some(pk) => self.has_access(pk, h)?,
            None => false,
        };
        if meta.has_tag("hidden") && !access {
            return Ok(false);
        }
        if ev.kind == GROUP_METADATA || ev.kind == DELETE_GROUP {
            return Ok(true);
        }
        if meta.has_tag("private") && !access {
            return Ok(false);
        }
        if self.config.policy.open && !meta.has_tag("private") {
            return Ok(true);
        }
        Ok(access)
    }

    /// Write gate for group-scoped events. `None` means accept.
    pub fn check_write(&self, ev: &Event) -> Option<Reject> {
        match self.check_write_inner(ev) {
            Ok(verdict) => verdict,
            Err(e) => Some(Reject::internal(e.to_string())),
        }
    }

    fn check_write_inner(&self, ev: &Event) -> Result<Option<Reject>> {
        if !self.config.groups.enabled {
            return Ok(Some(Reject::restricted("groups are not enabled")));
        }
        let Some(h) = group_ref(ev) else {
            return Ok(Some(Reject::invalid("missing group id")));
        };
        if (GROUP_METADATA..=GROUP_MEMBERS).contains(&ev.kind) {
            return Ok(Some(Reject::invalid("group metadata is relay-managed")));
        }
        let author = ev.pubkey.as_str();
        if ev.kind == CREATE_GROUP {
            if self.get_metadata(h)?.is_some() {
                return Ok(Some(Reject::invalid("group already exists")));
            }
            if self.config.groups.admin_create_only && !self.config.is_admin(author) {
                return Ok(Some(Reject::restricted(
                    "only relay admins can create groups",
                )));
            }
            if self.config.groups.private_admin_only
                && content_flag(&ev.content, "private")
                && !self.config.is_admin(author)
            {
                return Ok(Some(Reject::restricted(
                    "only relay admins can create private groups",
                )));
            }
            return Ok(None);
        }
        let Some(meta) = self.get_metadata(h)? else {
            return Ok(Some(Reject::restricted("no such group")));
        };
        let access = self.has_access(author, h)?;
        // Hidden groups look exactly like absent ones to outsiders.
        if meta.has_tag("hidden") && !access {
            return Ok(Some(Reject::restricted("no such group")));
        }
        if is_moderation_kind(ev.kind) {
            let admin =
                self.config.is_admin(author) || self.group_admins(h)?.iter().any(|a| a == author);
            if !admin {
                return Ok(Some(Reject::restricted("only group admins can moderate")));
            }
            return Ok(None);
        }
        let member = self.group_members(h)?.iter().any(|m| m == author);
        if ev.kind == JOIN_REQUEST {
            if member {
                return Ok(Some(Reject::duplicate("already a group member")));
            }
            return Ok(None);
        }
        if ev.kind == LEAVE_REQUEST {
            if !member {
                return Ok(Some(Reject::invalid("not a group member")));
            }
            return Ok(None);
        }
        if meta.has_tag("closed") && !member && !access {
            return Ok(Some(Reject::restricted("not a member")));
        }
        Ok(None)
    }

    /// Materialise the group's metadata event from a create or edit record,
    /// copying content and tags and lifting visibility flags out of the
    /// JSON body.
    pub fn update_metadata(&self, source: &Event) -> Result<()> {
        let Some(h) = source.tag_value("h") else {
            return Ok(());
        };
        let mut tags = vec![Tag(vec!["d".into(), h.into()])];
        for tag in &source.tags {
            if tag.name() != "h" && tag.name() != "d" {
                tags.push(tag.clone());
            }
        }
        for flag in ["private", "closed", "hidden"] {
            if content_flag(&source.content, flag) && !tags.iter().any(|t| t.name() == flag) {
                tags.push(Tag(vec![flag.into()]));
            }
        }
        let mut meta = Event {
            id: String::new(),
            pubkey: String::new(),
            kind: GROUP_METADATA,
            created_at: crate::event::now().max(source.created_at),
            tags,
            content: source.content.clone(),
            sig: String::new(),
        };
        self.events.sign_and_store(&mut meta, true)?;
        Ok(())
    }

    /// Drop every event belonging to a group, keeping only the delete
    /// record itself.
    pub fn delete_group(&self, source: &Event) -> Result<()> {
        let Some(h) = source.tag_value("h") else {
            return Ok(());
        };
        for tag_name in ['d', 'h'] {
            let filter = Filter::default().tag(tag_name, vec![h.into()]);
            for ev in self.events.query(&filter, 0)? {
                if ev.id != source.id {
                    self.events.delete_event(&ev.id)?;
                }
            }
        }
        Ok(())
    }

    /// Timestamp for a relay-authored moderation event, strictly after the
    /// newest one already stored for the group so the fold order never ties.
    fn next_moderation_ts(&self, h: &str) -> Result<u64> {
        let filter = Filter {
            kinds: Some(vec![PUT_USER, REMOVE_USER]),
            limit: Some(1),
            ..Filter::default()
        }
        .tag('h', vec![h.into()]);
        let newest = self
            .events
            .query(&filter, 1)?
            .into_iter()
            .next()
            .map(|ev| ev.created_at)
            .unwrap_or(0);
        Ok(crate::event::now().max(newest + 1))
    }

    fn store_moderation(&self, kind: u32, h: &str, pubkey: &str) -> Result<()> {
        let mut ev = Event {
            id: String::new(),
            pubkey: String::new(),
            kind,
            created_at: self.next_moderation_ts(h)?,
            tags: vec![
                Tag(vec!["p".into(), pubkey.into()]),
                Tag(vec!["h".into(), h.into()]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        self.events.sign_and_store(&mut ev, true)?;
        Ok(())
    }

    /// Grant membership by storing a relay-signed `put-user` event.
    pub fn add_member(&self, h: &str, pubkey: &str) -> Result<()> {
        self.store_moderation(PUT_USER, h, pubkey)
    }

    /// Revoke membership by storing a relay-signed `remove-user` event.
    pub fn remove_member(&self, h: &str, pubkey: &str) -> Result<()> {
        self.store_moderation(REMOVE_USER, h, pubkey)
    }

    /// Whether the pubkey is currently in the group's member projection.
    pub fn is_group_member(&self, h: &str, pubkey: &str) -> Result<bool> {
        Ok(self.group_members(h)?.iter().any(|m| m == pubkey))
    }
}
