//! Roster, ban lists, and invites, expressed as relay-authored events.
//!
//! The roster is a single replaceable event carrying one `member` tag per
//! pubkey; ban lists are two internal records keyed by reserved `d` tags.
//! Every mutation is signed by the instance and flows through the same
//! storage plane as client events, so moderation state is queryable and
//! auditable like everything else.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use crate::config::Config;
use crate::event::{
    self, Event, Filter, Tag, ADD_MEMBER, BANNED_EVENTS, BANNED_PUBKEYS, INVITE, MEMBERS,
    RELAY_MEMBERS, REMOVE_MEMBER,
};
use crate::instance::Reject;
use crate::store::Store;

/// Where a pubkey stands with the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubkeyStatus {
    Stranger,
    Invited,
    Member,
    Banned,
}

/// Authoritative roster and moderation state for one instance.
#[derive(Clone)]
pub struct Management {
    config: Arc<Config>,
    events: Store,
    /// Roster and ban-list updates are read-modify-write cycles; concurrent
    /// writers must not interleave them.
    write_lock: Arc<Mutex<()>>,
}

impl Management {
    pub fn new(config: Arc<Config>, events: Store) -> Self {
        Self {
            config,
            events,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The roster event, or a fresh skeleton if none is stored yet.
    pub fn members_event(&self) -> Result<Event> {
        let filter = Filter {
            kinds: Some(vec![MEMBERS]),
            limit: Some(1),
            ..Filter::default()
        };
        if let Some(ev) = self.events.query(&filter, 1)?.into_iter().next() {
            return Ok(ev);
        }
        Ok(Event {
            id: String::new(),
            pubkey: String::new(),
            kind: MEMBERS,
            created_at: event::now(),
            tags: vec![Tag(vec!["d".into(), RELAY_MEMBERS.into()])],
            content: String::new(),
            sig: String::new(),
        })
    }

    /// Current roster pubkeys.
    pub fn members(&self) -> Result<Vec<String>> {
        Ok(self
            .members_event()?
            .tags
            .iter()
            .filter(|t| t.name() == "member")
            .filter_map(|t| t.value().map(String::from))
            .collect())
    }

    /// A pubkey is a member if it is on the roster or named by a configured
    /// role.
    pub fn is_member(&self, pubkey: &str) -> Result<bool> {
        if self.config.in_roles(pubkey) {
            return Ok(true);
        }
        Ok(self.members()?.iter().any(|p| p == pubkey))
    }

    fn store_roster(&self, mut roster: Event) -> Result<()> {
        roster.created_at = event::now().max(roster.created_at);
        roster.id.clear();
        roster.sig.clear();
        self.events.sign_and_store(&mut roster, false)?;
        Ok(())
    }

    fn emit_audit(&self, kind: u32, pubkey: &str) -> Result<()> {
        let mut audit = Event {
            id: String::new(),
            pubkey: String::new(),
            kind,
            created_at: event::now(),
            tags: vec![Tag(vec!["p".into(), pubkey.into()])],
            content: String::new(),
            sig: String::new(),
        };
        self.events.sign_and_store(&mut audit, true)?;
        Ok(())
    }

    /// Add a pubkey to the roster. Adding an existing member is a no-op.
    pub fn add_member(&self, pubkey: &str) -> Result<()> {
        let _guard = self.lock();
        let mut roster = self.members_event()?;
        if roster
            .tags
            .iter()
            .any(|t| t.name() == "member" && t.value() == Some(pubkey))
        {
            return Ok(());
        }
        roster
            .tags
            .push(Tag(vec!["member".into(), pubkey.into()]));
        self.store_roster(roster)?;
        self.emit_audit(ADD_MEMBER, pubkey)
    }

    /// Remove a pubkey from the roster. Removing a non-member is a no-op.
    pub fn remove_member(&self, pubkey: &str) -> Result<()> {
        let _guard = self.lock();
        let mut roster = self.members_event()?;
        let before = roster.tags.len();
        roster
            .tags
            .retain(|t| !(t.name() == "member" && t.value() == Some(pubkey)));
        if roster.tags.len() == before {
            return Ok(());
        }
        self.store_roster(roster)?;
        self.emit_audit(REMOVE_MEMBER, pubkey)
    }

    fn ban_list(&self, d: &str, name: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .events
            .get_or_create_app_data(d)?
            .tags
            .iter()
            .filter(|t| t.name() == name)
            .filter_map(|t| {
                t.value().map(|v| {
                    (
                        v.to_string(),
                        t.0.get(2).cloned().unwrap_or_default(),
                    )
                })
            })
            .collect())
    }

    fn store_ban_list(&self, mut list: Event) -> Result<()> {
        list.created_at = event::now().max(list.created_at);
        list.id.clear();
        list.sig.clear();
        self.events.sign_and_store(&mut list, false)?;
        Ok(())
    }

    /// Banned pubkeys with their reasons.
    pub fn banned_pubkeys(&self) -> Result<Vec<(String, String)>> {
        self.ban_list(BANNED_PUBKEYS, "p")
    }

    pub fn pubkey_is_banned(&self, pubkey: &str) -> Result<bool> {
        Ok(self.banned_pubkeys()?.iter().any(|(p, _)| p == pubkey))
    }

    /// Ban a pubkey: drop it from the roster, record the ban, and purge
    /// every event it authored.
    pub fn ban_pubkey(&self, pubkey: &str, reason: &str) -> Result<()> {
        self.remove_member(pubkey)?;
        {
            let _guard = self.lock();
            let mut list = self.events.get_or_create_app_data(BANNED_PUBKEYS)?;
            if !list
                .tags
                .iter()
                .any(|t| t.name() == "p" && t.value() == Some(pubkey))
            {
                list.tags
                    .push(Tag(vec!["p".into(), pubkey.into(), reason.into()]));
                self.store_ban_list(list)?;
            }
        }
        let authored = Filter {
            authors: Some(vec![pubkey.into()]),
            ..Filter::default()
        };
        for ev in self.events.query(&authored, 0)? {
            self.events.delete_event(&ev.id)?;
        }
        Ok(())
    }

    /// Lift a pubkey ban and restore roster membership.
    pub fn allow_pubkey(&self, pubkey: &str) -> Result<()> {
        {
            let _guard = self.lock();
            let mut list = self.events.get_or_create_app_data(BANNED_PUBKEYS)?;
            let before = list.tags.len();
            list.tags
                .retain(|t| !(t.name() == "p" && t.value() == Some(pubkey)));
            if list.tags.len() != before {
                self.store_ban_list(list)?;
            }
        }
        self.add_member(pubkey)
    }

    /// Banned event ids with their reasons.
    pub fn banned_events(&self) -> Result<Vec<(String, String)>> {
        self.ban_list(BANNED_EVENTS, "e")
    }

    pub fn event_is_banned(&self, id: &str) -> Result<bool> {
        Ok(self.banned_events()?.iter().any(|(e, _)| e == id))
    }

    /// Ban an event id and delete the stored copy.
    pub fn ban_event(&self, id: &str, reason: &str) -> Result<()> {
        self.events.delete_event(id)?;
        let _guard = self.lock();
        let mut list = self.events.get_or_create_app_data(BANNED_EVENTS)?;
        if !list
            .tags
            .iter()
            .any(|t| t.name() == "e" && t.value() == Some(id))
        {
            list.tags
                .push(Tag(vec!["e".into(), id.into(), reason.into()]));
            self.store_ban_list(list)?;
        }
        Ok(())
    }

    pub fn allow_event(&self, id: &str) -> Result<()> {
        let _guard = self.lock();
        let mut list = self.events.get_or_create_app_data(BANNED_EVENTS)?;
        let before = list.tags.len();
        list.tags
            .retain(|t| !(t.name() == "e" && t.value() == Some(id)));
        if list.tags.len() != before {
            self.store_ban_list(list)?;
        }
        Ok(())
    }

    /// The capability to hand out invites.
    pub fn can_invite(&self, pubkey: &str) -> bool {
        self.config.can_invite(pubkey) || self.config.is_admin(pubkey)
    }

    /// The first persisted invite for a recipient is reused on subsequent
    /// requests; otherwise a fresh one is issued, signed, and persisted.
    pub fn get_or_create_invite(&self, pubkey: &str) -> Result<Event> {
        let _guard = self.lock();
        let filter = Filter {
            kinds: Some(vec![INVITE]),
            limit: Some(1),
            ..Filter::default()
        }
        .tag('p', vec![pubkey.into()]);
        if let Some(ev) = self.events.query(&filter, 1)?.into_iter().next() {
            return Ok(ev);
        }
        let mut invite = Event {
            id: String::new(),
            pubkey: String::new(),
            kind: INVITE,
            created_at: event::now(),
            tags: vec![
                Tag(vec!["claim".into(), event::random_token(8)]),
                Tag(vec!["p".into(), pubkey.into()]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        self.events.sign_and_store(&mut invite, false)?;
        Ok(invite)
    }

    /// Scan stored invites for one bearing the given claim.
    pub fn invite_by_claim(&self, claim: &str) -> Result<Option<Event>> {
        let filter = Filter {
            kinds: Some(vec![INVITE]),
            ..Filter::default()
        };
        for ev in self.events.query(&filter, 0)? {
            if ev.tag_value("claim") == Some(claim) {
                return Ok(Some(ev));
            }
        }
        Ok(None)
    }

    /// Decide a relay join request. `None` means accept; membership itself
    /// is granted by the post-save hook.
    pub fn validate_join_request(&self, ev: &Event) -> Result<Option<Reject>> {
        if self.is_member(&ev.pubkey)? {
            return Ok(None);
        }
        if self.pubkey_is_banned(&ev.pubkey)? {
            return Ok(Some(Reject::restricted("you are banned from this relay")));
        }
        let Some(claim) = ev.tag_value("claim") else {
            return Ok(Some(Reject::invalid("missing claim")));
        };
        if self.invite_by_claim(claim)?.is_none() {
            return Ok(Some(Reject::restricted("invalid invite claim")));
        }
        Ok(None)
    }

    /// Pubkey lifecycle state: banned wins over member, member over
    /// invited.
    pub fn status(&self, pubkey: &str) -> Result<PubkeyStatus> {
        if self.pubkey_is_banned(pubkey)? {
            return Ok(PubkeyStatus::Banned);
        }
        if self.is_member(pubkey)? {
            return Ok(PubkeyStatus::Member);
        }
        let filter = Filter {
            kinds: Some(vec![INVITE]),
            limit: Some(1),
            ..Filter::default()
        }
        .tag('p', vec![pubkey.into()]);
        if !self.events.query(&filter, 1)?.is_empty() {
            return Ok(PubkeyStatus::Invited);
        }
        Ok(PubkeyStatus::Stranger)
    }
}
