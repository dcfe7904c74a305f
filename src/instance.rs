//! Per-tenant relay engine: admission, side-effects, and read projection.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use rusqlite::Connection;
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::Config;
use crate::event::{
    self, Event, Filter, Tag, ADD_MEMBER, APP_DATA, CREATE_GROUP, DELETE_GROUP, EDIT_METADATA,
    GIFT_WRAP, GROUP_ADMINS, GROUP_MEMBERS, GROUP_METADATA, INTERNAL_PREFIX, INVITE, JOIN,
    JOIN_REQUEST, LEAVE, LEAVE_REQUEST, MEMBERS, PUT_USER, REMOVE_MEMBER, REMOVE_USER, ZAP_RECEIPT,
};
use crate::groups::{self, Groups, RELAY_GROUP};
use crate::management::Management;
use crate::store::{Store, StoreError};

/// Stored events streamed per subscription are capped regardless of the
/// requested limit.
const STORED_CEILING: usize = 1000;

/// Kinds accepted for a roster member named in a `p` tag without requiring
/// the sender to authenticate.
const RECIPIENT_KINDS: [u32; 2] = [ZAP_RECEIPT, GIFT_WRAP];

/// Server-maintained kinds clients may read but never publish.
const READ_ONLY_KINDS: [u32; 4] = [MEMBERS, INVITE, ADD_MEMBER, REMOVE_MEMBER];

/// Kinds accepted from clients but never echoed or served back.
const WRITE_ONLY_KINDS: [u32; 2] = [JOIN, LEAVE];

/// Admission verdict carried back to the session as a machine-prefixed
/// reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reject {
    AuthRequired(String),
    Restricted(String),
    Invalid(String),
    Duplicate(String),
    Internal(String),
}

impl Reject {
    pub fn auth_required(msg: impl Into<String>) -> Self {
        Reject::AuthRequired(msg.into())
    }

    pub fn restricted(msg: impl Into<String>) -> Self {
        Reject::Restricted(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Reject::Invalid(msg.into())
    }

    pub fn duplicate(msg: impl Into<String>) -> Self {
        Reject::Duplicate(msg.into())
    }

    pub fn internal(msg: impl ToString) -> Self {
        Reject::Internal(msg.to_string())
    }
}

impl fmt::Display for Reject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reject::AuthRequired(m) => write!(f, "auth-required: {m}"),
            Reject::Restricted(m) => write!(f, "restricted: {m}"),
            Reject::Invalid(m) => write!(f, "invalid: {m}"),
            Reject::Duplicate(m) => write!(f, "duplicate: {m}"),
            Reject::Internal(m) => write!(f, "error: {m}"),
        }
    }
}

/// Caller identity attached to engine calls.
#[derive(Debug, Clone, Default)]
pub struct SessionCtx {
    /// Pubkey proven via the session auth challenge.
    pub authed: Option<String>,
    /// Internal subsystems bypass read projection entirely.
    pub internal: bool,
}

impl SessionCtx {
    pub fn authed(pubkey: impl Into<String>) -> Self {
        Self {
            authed: Some(pubkey.into()),
            internal: false,
        }
    }

    pub fn internal() -> Self {
        Self {
            authed: None,
            internal: true,
        }
    }
}

/// Outcome of routing an accepted event to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Persisted; side-effects have run.
    Stored,
    /// Insert collided with an existing id.
    Duplicate,
    /// Ephemeral; side-effects have run but nothing was persisted beyond
    /// the documented overrides.
    Transient,
}

/// Relay information document served on plain HTTP.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    pub pubkey: String,
    pub icon: String,
    pub software: String,
    pub version: String,
}

/// One relay tenant: engine plus its stores.
pub struct Instance {
    pub host: String,
    pub config: Arc<Config>,
    pub events: Store,
    pub management: Management,
    pub groups: Groups,
    tx: broadcast::Sender<Event>,
}

impl Instance {
    /// Build a tenant over the shared database handle and initialise its
    /// schema.
    pub fn new(config: Config, conn: Arc<Mutex<Connection>>) -> Result<Self> {
        let config = Arc::new(config);
        let (tx, _rx) = broadcast::channel(256);
        let events = Store::new(conn, config.clone(), tx.clone());
        events.init()?;
        let management = Management::new(config.clone(), events.clone());
        let groups = Groups::new(config.clone(), events.clone());
        Ok(Self {
            host: config.host.clone(),
            config,
            events,
            management,
            groups,
            tx,
        })
    }

    /// Subscribe to live events accepted by this instance.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Relay information document.
    pub fn relay_info(&self) -> RelayInfo {
        RelayInfo {
            name: self.config.info.name.clone(),
            description: self.config.info.description.clone(),
            pubkey: self.config.info.pubkey.clone(),
            icon: self.config.info.icon.clone(),
            software: "warren".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }

    /// Internal records never served to or accepted from clients: the
    /// roster and anything under the reserved `d` prefix.
    pub fn is_internal_event(&self, ev: &Event) -> bool {
        if ev.kind == MEMBERS {
            return true;
        }
        ev.kind == APP_DATA
            && ev
                .d_tag()
                .is_some_and(|d| d.starts_with(INTERNAL_PREFIX))
    }

    /// Delegated-recipient bypass: zap receipts and gift wraps addressed to
    /// a roster member are accepted from anyone.
    pub fn allow_recipient_event(&self, ev: &Event) -> bool {
        if !RECIPIENT_KINDS.contains(&ev.kind) {
            return false;
        }
        ev.tags
            .iter()
            .filter(|t| t.name() == "p")
            .filter_map(|t| t.value())
            .any(|p| self.management.is_member(p).unwrap_or(false))
    }

    fn is_group_kind(kind: u32) -> bool {
        matches!(
            kind,
            PUT_USER
                | REMOVE_USER
                | EDIT_METADATA
                | CREATE_GROUP
                | DELETE_GROUP
                | JOIN_REQUEST
                | LEAVE_REQUEST
                | GROUP_METADATA
                | GROUP_ADMINS
                | GROUP_MEMBERS
        )
    }

    /// Write admission. The first matching rule decides.
    pub fn on_event(&self, ctx: &SessionCtx, ev: &Event) -> std::result::Result<(), Reject> {
        if self.allow_recipient_event(ev) {
            return Ok(());
        }
        let Some(author) = ctx.authed.as_deref() else {
            return Err(Reject::auth_required("authentication required"));
        };
        if author != ev.pubkey {
            return Err(Reject::restricted("cannot publish on behalf of others"));
        }
        if ev.kind == JOIN {
            if let Some(reject) = self
                .management
                .validate_join_request(ev)
                .map_err(Reject::internal)?
            {
                return Err(reject);
            }
            return Ok(());
        }
        let member = self.management.is_member(author).map_err(Reject::internal)?;
        if !member {
            return Err(Reject::restricted("not a member"));
        }
        if self.is_internal_event(ev) || READ_ONLY_KINDS.contains(&ev.kind) {
            return Err(Reject::invalid("kind not accepted"));
        }
        if Self::is_group_kind(ev.kind) || ev.has_tag("h") {
            if let Some(reject) = self.groups.check_write(ev) {
                return Err(reject);
            }
        }
        if self
            .management
            .event_is_banned(&ev.id)
            .map_err(Reject::internal)?
        {
            return Err(Reject::restricted("event is banned"));
        }
        Ok(())
    }

    /// Read admission: subscriptions require an authenticated member.
    pub fn on_request(&self, ctx: &SessionCtx, _filter: &Filter) -> std::result::Result<(), Reject> {
        if ctx.internal {
            return Ok(());
        }
        let Some(pubkey) = ctx.authed.as_deref() else {
            return Err(Reject::auth_required("authentication required"));
        };
        let member = self.management.is_member(pubkey).map_err(Reject::internal)?;
        if !member && !self.config.is_admin(pubkey) {
            return Err(Reject::restricted("not a member"));
        }
        Ok(())
    }

    /// Route an accepted event to storage and run its side-effects.
    pub fn ingest(&self, ev: &Event) -> Result<Ingest> {
        if event::is_ephemeral(ev.kind) {
            // Relay joins are persisted despite their kind class so invite
            // redemption survives restarts.
            if ev.kind == JOIN {
                match self.events.save_event(ev) {
                    Ok(()) | Err(StoreError::Duplicate) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.on_ephemeral_event(ev);
            if !self.prevent_broadcast(ev) {
                let _ = self.tx.send(ev.clone());
            }
            return Ok(Ingest::Transient);
        }
        match self.events.store(ev) {
            Ok(()) => {}
            Err(StoreError::Duplicate) => return Ok(Ingest::Duplicate),
            Err(e) => return Err(e.into()),
        }
        self.on_event_saved(ev);
        if !self.prevent_broadcast(ev) {
            let _ = self.tx.send(ev.clone());
        }
        Ok(Ingest::Stored)
    }

    /// Side-effects of accepted ephemeral events.
    fn on_ephemeral_event(&self, ev: &Event) {
        let result = match ev.kind {
            JOIN => self.management.add_member(&ev.pubkey),
            LEAVE => self.management.remove_member(&ev.pubkey),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(kind = ev.kind, error = %e, "ephemeral side effect failed");
        }
    }

    /// Cascades after successful persistence. Failures are logged and never
    /// roll back the accepted write.
    fn on_event_saved(&self, ev: &Event) {
        let result = match ev.kind {
            JOIN_REQUEST => self.saved_join_request(ev),
            LEAVE_REQUEST => self.saved_leave_request(ev),
            CREATE_GROUP => self.saved_create_group(ev),
            EDIT_METADATA => self.groups.update_metadata(ev),
            DELETE_GROUP => self.groups.delete_group(ev),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(kind = ev.kind, error = %e, "post-save side effect failed");
        }
    }

    fn saved_join_request(&self, ev: &Event) -> Result<()> {
        if !self.config.groups.auto_join {
            return Ok(());
        }
        let Some(h) = ev.tag_value("h") else {
            return Ok(());
        };
        if let Some(meta) = self.groups.get_metadata(h)? {
            if !meta.has_tag("closed") {
                self.groups.add_member(h, &ev.pubkey)?;
            }
        }
        Ok(())
    }

    fn saved_leave_request(&self, ev: &Event) -> Result<()> {
        if !self.config.groups.auto_leave {
            return Ok(());
        }
        if let Some(h) = ev.tag_value("h") {
            self.groups.remove_member(h, &ev.pubkey)?;
        }
        Ok(())
    }

    fn saved_create_group(&self, ev: &Event) -> Result<()> {
        self.groups.update_metadata(ev)?;
        if let Some(h) = ev.tag_value("h") {
            self.groups.add_member(h, &ev.pubkey)?;
        }
        Ok(())
    }

    /// Write-only kinds are never echoed to subscribers.
    pub fn prevent_broadcast(&self, ev: &Event) -> bool {
        WRITE_ONLY_KINDS.contains(&ev.kind)
    }

    fn is_manager(&self, ctx: &SessionCtx) -> bool {
        ctx.authed
            .as_deref()
            .map(|p| self.config.is_admin(p))
            .unwrap_or(false)
    }

    /// Zero the signature for non-managers when the policy asks for it.
    fn strip(&self, ctx: &SessionCtx, mut ev: Event) -> Event {
        if self.config.policy.strip_signatures && !self.is_manager(ctx) {
            ev.sig = "0".repeat(128);
        }
        ev
    }

    /// Apply the read-side drop rules to one event; `None` means the caller
    /// never sees it.
    pub fn readable(&self, ctx: &SessionCtx, ev: Event) -> Option<Event> {
        if event::is_ephemeral(ev.kind)
            || self.is_internal_event(&ev)
            || WRITE_ONLY_KINDS.contains(&ev.kind)
        {
            return None;
        }
        if groups::group_ref(&ev).is_some() && !self.groups.can_read(ctx.authed.as_deref(), &ev) {
            return None;
        }
        Some(self.strip(ctx, ev))
    }

    /// Visibility gate for live fan-out. Unlike the stored path, ephemeral
    /// kinds pass: the broadcast channel is their only delivery route.
    pub fn live_visible(&self, ctx: &SessionCtx, ev: Event) -> Option<Event> {
        if self.is_internal_event(&ev) || WRITE_ONLY_KINDS.contains(&ev.kind) {
            return None;
        }
        if groups::group_ref(&ev).is_some() && !self.groups.can_read(ctx.authed.as_deref(), &ev) {
            return None;
        }
        Some(self.strip(ctx, ev))
    }

    /// Read projection: virtual events first, then stored matches up to the
    /// implementation ceiling, all filtered and possibly stripped.
    pub fn query_stored(&self, ctx: &SessionCtx, filter: &Filter) -> Result<Vec<Event>> {
        if ctx.internal {
            return Ok(self.events.query(filter, 0)?);
        }
        let mut out = vec![];
        for ev in self.virtual_events(ctx, filter)? {
            out.push(self.strip(ctx, ev));
        }
        for ev in self.events.query(filter, STORED_CEILING)? {
            if let Some(ev) = self.readable(ctx, ev) {
                out.push(ev);
            }
        }
        Ok(out)
    }

    fn make_projection(&self, kind: u32, d: &str, pubkeys: &[String]) -> Result<Event> {
        let mut tags = vec![Tag(vec!["d".into(), d.into()])];
        for p in pubkeys {
            tags.push(Tag(vec!["p".into(), p.clone()]));
        }
        let mut ev = Event {
            id: String::new(),
            pubkey: String::new(),
            kind,
            created_at: event::now(),
            tags,
            content: String::new(),
            sig: String::new(),
        };
        self.config.sign(&mut ev)?;
        Ok(ev)
    }

    /// Kinds computed at query time instead of fetched from storage. The
    /// generator signs but never persists.
    fn virtual_events(&self, ctx: &SessionCtx, filter: &Filter) -> Result<Vec<Event>> {
        let mut out = vec![];
        // Invite issuance persists lazily, so it only runs when the caller
        // asks for the invite kind by name.
        let explicit = |kind: u32| filter.kinds.as_ref().is_some_and(|ks| ks.contains(&kind));
        let wants = |kind: u32| filter.kinds.as_ref().map_or(true, |ks| ks.contains(&kind));
        if explicit(INVITE) {
            if let Some(pubkey) = ctx.authed.as_deref() {
                if self.management.can_invite(pubkey) {
                    let invite = self.management.get_or_create_invite(pubkey)?;
                    if filter.matches(&invite) {
                        out.push(invite);
                    }
                }
            }
        }
        if wants(GROUP_ADMINS) && self.config.groups.enabled {
            let relay = self.make_projection(GROUP_ADMINS, RELAY_GROUP, &self.config.managers())?;
            if filter.matches(&relay) {
                out.push(relay);
            }
            for gid in self.groups.list_group_ids()? {
                let ev = self.make_projection(GROUP_ADMINS, &gid, &self.groups.group_admins(&gid)?)?;
                if filter.matches(&ev) && self.groups.can_read(ctx.authed.as_deref(), &ev) {
                    out.push(ev);
                }
            }
        }
        if wants(GROUP_MEMBERS) && self.config.groups.enabled {
            for gid in self.groups.list_group_ids()? {
                let ev =
                    self.make_projection(GROUP_MEMBERS, &gid, &self.groups.group_members(&gid)?)?;
                if filter.matches(&ev) && self.groups.can_read(ctx.authed.as_deref(), &ev) {
                    out.push(ev);
                }
            }
        }
        Ok(out)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::config::testutil::{test_config, with_role};
    use crate::config::Role;
    use crate::event::testutil::{pubkey, signed};

    fn member_instance(seed: u8) -> Instance {
        let instance = test_instance(test_config(99, 7));
        instance.management.add_member(&pubkey(seed)).unwrap();
        instance
    }

    fn note(seed: u8, ts: u64, content: &str) -> Event {
        signed(seed, 1, ts, content, vec![])
    }

    #[test]
    fn unauthenticated_writes_require_auth() {
        let instance = test_instance(test_config(99, 7));
        let reject = instance
            .on_event(&SessionCtx::default(), &note(1, 10, "hi"))
            .unwrap_err();
        assert_eq!(reject.to_string(), "auth-required: authentication required");
    }

    #[test]
    fn cannot_publish_on_behalf_of_others() {
        let instance = member_instance(1);
        let reject = instance
            .on_event(&SessionCtx::authed(pubkey(1)), &note(2, 10, "hi"))
            .unwrap_err();
        assert_eq!(
            reject.to_string(),
            "restricted: cannot publish on behalf of others"
        );
    }

    #[test]
    fn non_members_are_rejected() {
        let instance = test_instance(test_config(99, 7));
        let reject = instance
            .on_event(&SessionCtx::authed(pubkey(1)), &note(1, 10, "hi"))
            .unwrap_err();
        assert_eq!(reject.to_string(), "restricted: not a member");
    }

    #[test]
    fn members_can_publish() {
        let instance = member_instance(1);
        instance
            .on_event(&SessionCtx::authed(pubkey(1)), &note(1, 10, "hi"))
            .unwrap();
    }

    #[test]
    fn recipient_kinds_bypass_auth() {
        let instance = member_instance(1);
        let zap = signed(
            5,
            ZAP_RECEIPT,
            10,
            "",
            vec![Tag(vec!["p".into(), pubkey(1)])],
        );
        // No session auth at all.
        instance.on_event(&SessionCtx::default(), &zap).unwrap();
        assert!(instance.allow_recipient_event(&zap));

        // Recipient outside the roster goes through the normal flow.
        let zap_other = signed(
            5,
            ZAP_RECEIPT,
            10,
            "",
            vec![Tag(vec!["p".into(), pubkey(9)])],
        );
        assert!(!instance.allow_recipient_event(&zap_other));
        assert!(instance.on_event(&SessionCtx::default(), &zap_other).is_err());

        // Ordinary kinds never take the bypass.
        let text = signed(5, 1, 10, "", vec![Tag(vec!["p".into(), pubkey(1)])]);
        assert!(!instance.allow_recipient_event(&text));
    }

    #[test]
    fn internal_and_read_only_kinds_are_not_accepted() {
        let instance = member_instance(1);
        let ctx = SessionCtx::authed(pubkey(1));
        for kind in [MEMBERS, INVITE, ADD_MEMBER, REMOVE_MEMBER] {
            let ev = signed(1, kind, 10, "", vec![]);
            let reject = instance.on_event(&ctx, &ev).unwrap_err();
            assert_eq!(reject.to_string(), "invalid: kind not accepted", "kind {kind}");
        }
        let internal = signed(
            1,
            APP_DATA,
            10,
            "",
            vec![Tag(vec!["d".into(), "zooid/banned_pubkeys".into()])],
        );
        assert!(instance.on_event(&ctx, &internal).is_err());
        // Foreign app data is fine.
        let external = signed(
            1,
            APP_DATA,
            10,
            "",
            vec![Tag(vec!["d".into(), "external/data".into()])],
        );
        instance.on_event(&ctx, &external).unwrap();
    }

    #[test]
    fn internal_event_detection() {
        let instance = test_instance(test_config(99, 7));
        let banned = signed(
            1,
            APP_DATA,
            10,
            "",
            vec![Tag(vec!["d".into(), "zooid/banned_events".into()])],
        );
        assert!(instance.is_internal_event(&banned));
        let other = signed(
            1,
            APP_DATA,
            10,
            "",
            vec![Tag(vec!["d".into(), "zooid/some_data".into()])],
        );
        assert!(instance.is_internal_event(&other));
        let external = signed(
            1,
            APP_DATA,
            10,
            "",
            vec![Tag(vec!["d".into(), "external/data".into()])],
        );
        assert!(!instance.is_internal_event(&external));
        let wrong_kind = signed(
            1,
            1,
            10,
            "",
            vec![Tag(vec!["d".into(), "zooid/data".into()])],
        );
        assert!(!instance.is_internal_event(&wrong_kind));
        let no_d = signed(1, APP_DATA, 10, "", vec![]);
        assert!(!instance.is_internal_event(&no_d));
    }

    #[test]
    fn banned_event_ids_are_rejected() {
        let instance = member_instance(1);
        let ev = note(1, 10, "bad");
        instance.management.ban_event(&ev.id, "rude").unwrap();
        let reject = instance
            .on_event(&SessionCtx::authed(pubkey(1)), &ev)
            .unwrap_err();
        assert_eq!(reject.to_string(), "restricted: event is banned");
    }

    #[test]
    fn join_then_post_round_trip() {
        let instance = test_instance(test_config(99, 7));
        let invite = instance.management.get_or_create_invite(&pubkey(1)).unwrap();
        let claim = invite.tag_value("claim").unwrap().to_string();

        let join = signed(
            1,
            JOIN,
            event::now(),
            "",
            vec![Tag(vec!["claim".into(), claim])],
        );
        let ctx = SessionCtx::authed(pubkey(1));
        instance.on_event(&ctx, &join).unwrap();
        assert_eq!(instance.ingest(&join).unwrap(), Ingest::Transient);
        assert!(instance.management.is_member(&pubkey(1)).unwrap());

        let post = note(1, event::now(), "first post");
        instance.on_event(&ctx, &post).unwrap();
        assert_eq!(instance.ingest(&post).unwrap(), Ingest::Stored);

        let filter = Filter {
            authors: Some(vec![pubkey(1)]),
            ..Filter::default()
        };
        let got = instance.query_stored(&ctx, &filter).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, post.id);
    }

    #[test]
    fn join_with_bad_claim_is_rejected() {
        let instance = test_instance(test_config(99, 7));
        let join = signed(
            1,
            JOIN,
            10,
            "",
            vec![Tag(vec!["claim".into(), "WRONG000".into()])],
        );
        let reject = instance
            .on_event(&SessionCtx::authed(pubkey(1)), &join)
            .unwrap_err();
        assert!(reject.to_string().starts_with("restricted:"));
        assert!(!instance.management.is_member(&pubkey(1)).unwrap());
    }

    #[test]
    fn leave_removes_membership_without_persisting() {
        let instance = member_instance(1);
        let leave = signed(1, LEAVE, event::now(), "", vec![]);
        let ctx = SessionCtx::authed(pubkey(1));
        instance.on_event(&ctx, &leave).unwrap();
        assert_eq!(instance.ingest(&leave).unwrap(), Ingest::Transient);
        assert!(!instance.management.is_member(&pubkey(1)).unwrap());
        let by_kind = Filter {
            kinds: Some(vec![LEAVE]),
            ..Filter::default()
        };
        assert_eq!(instance.events.count(&by_kind).unwrap(), 0);
    }

    #[test]
    fn duplicate_ingest_reports_duplicate_once() {
        let instance = member_instance(1);
        let post = note(1, 10, "only once");
        assert_eq!(instance.ingest(&post).unwrap(), Ingest::Stored);
        assert_eq!(instance.ingest(&post).unwrap(), Ingest::Duplicate);
        let filter = Filter {
            ids: Some(vec![post.id.clone()]),
            ..Filter::default()
        };
        assert_eq!(instance.events.count(&filter).unwrap(), 1);
    }

    #[test]
    fn read_admission_requires_authenticated_member() {
        let instance = member_instance(1);
        let filter = Filter::default();
        let reject = instance
            .on_request(&SessionCtx::default(), &filter)
            .unwrap_err();
        assert!(reject.to_string().starts_with("auth-required:"));
        let reject = instance
            .on_request(&SessionCtx::authed(pubkey(2)), &filter)
            .unwrap_err();
        assert_eq!(reject.to_string(), "restricted: not a member");
        instance
            .on_request(&SessionCtx::authed(pubkey(1)), &filter)
            .unwrap();
        // Admins read without being on the roster.
        instance
            .on_request(&SessionCtx::authed(pubkey(7)), &filter)
            .unwrap();
        // Internal callers bypass the gate.
        instance.on_request(&SessionCtx::internal(), &filter).unwrap();
    }

    #[test]
    fn query_stored_hides_internal_and_ephemeral_records() {
        let instance = member_instance(1);
        // Membership changes create a roster event and audit records; the
        // join persists an ephemeral-kind event.
        let invite = instance.management.get_or_create_invite(&pubkey(2)).unwrap();
        let claim = invite.tag_value("claim").unwrap().to_string();
        let join = signed(
            2,
            JOIN,
            event::now(),
            "",
            vec![Tag(vec!["claim".into(), claim])],
        );
        instance.ingest(&join).unwrap();
        let post = note(1, event::now(), "visible");
        instance.ingest(&post).unwrap();

        let ctx = SessionCtx::authed(pubkey(1));
        let got = instance.query_stored(&ctx, &Filter::default()).unwrap();
        assert!(got.iter().any(|e| e.id == post.id));
        for ev in &got {
            assert!(!event::is_ephemeral(ev.kind), "leaked kind {}", ev.kind);
            assert_ne!(ev.kind, MEMBERS);
            assert_ne!(ev.kind, APP_DATA);
        }
        // The raw store still holds the roster and the join.
        let internal = instance
            .query_stored(&SessionCtx::internal(), &Filter::default())
            .unwrap();
        assert!(internal.iter().any(|e| e.kind == MEMBERS));
        assert!(internal.iter().any(|e| e.kind == JOIN));
    }

    #[test]
    fn virtual_invite_for_inviter() {
        let config = with_role(
            test_config(99, 7),
            "greeter",
            Role {
                pubkeys: vec![pubkey(1)],
                can_invite: true,
                can_manage: false,
            },
        );
        let instance = test_instance(config);
        instance.management.add_member(&pubkey(1)).unwrap();
        let ctx = SessionCtx::authed(pubkey(1));
        let filter = Filter {
            kinds: Some(vec![INVITE]),
            ..Filter::default()
        };
        let got = instance.query_stored(&ctx, &filter).unwrap();
        assert_eq!(got.len(), 1);
        let invite = &got[0];
        assert_eq!(invite.kind, INVITE);
        assert_eq!(invite.pubkey, instance.config.self_pubkey());
        assert!(invite.tag_value("claim").is_some());
        assert_eq!(invite.tag_value("p"), Some(pubkey(1).as_str()));
        crate::event::verify_event(invite).unwrap();

        // Re-querying yields the same invite, not a new one.
        let again = instance.query_stored(&ctx, &filter).unwrap();
        assert_eq!(again[0].id, invite.id);

        // Members without the capability get nothing.
        instance.management.add_member(&pubkey(2)).unwrap();
        let got = instance
            .query_stored(&SessionCtx::authed(pubkey(2)), &filter)
            .unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn virtual_relay_admins_list() {
        let instance = member_instance(1);
        let ctx = SessionCtx::authed(pubkey(1));
        let filter = Filter {
            kinds: Some(vec![GROUP_ADMINS]),
            ..Filter::default()
        }
        .tag('d', vec![RELAY_GROUP.into()]);
        let got = instance.query_stored(&ctx, &filter).unwrap();
        assert_eq!(got.len(), 1);
        let admins = &got[0];
        assert_eq!(admins.d_tag(), Some(RELAY_GROUP));
        let ps: Vec<_> = admins
            .tags
            .iter()
            .filter(|t| t.name() == "p")
            .filter_map(|t| t.value())
            .collect();
        assert!(ps.contains(&pubkey(7).as_str()));
        crate::event::verify_event(admins).unwrap();
    }

    #[test]
    fn virtual_group_members_projection() {
        let instance = member_instance(1);
        let ctx = SessionCtx::authed(pubkey(1));
        let create = signed(
            1,
            CREATE_GROUP,
            event::now(),
            "{}",
            vec![Tag(vec!["h".into(), "g".into()])],
        );
        instance.ingest(&create).unwrap();
        let filter = Filter {
            kinds: Some(vec![GROUP_MEMBERS]),
            ..Filter::default()
        }
        .tag('d', vec!["g".into()]);
        let got = instance.query_stored(&ctx, &filter).unwrap();
        assert_eq!(got.len(), 1);
        let ps: Vec<_> = got[0]
            .tags
            .iter()
            .filter(|t| t.name() == "p")
            .filter_map(|t| t.value())
            .collect();
        // The creator was auto-added on group creation.
        assert_eq!(ps, vec![pubkey(1).as_str()]);
    }

    #[test]
    fn group_lifecycle_side_effects() {
        let instance = member_instance(1);
        let ctx = SessionCtx::authed(pubkey(1));

        let create = signed(
            1,
            CREATE_GROUP,
            event::now(),
            r#"{"name":"Test Group"}"#,
            vec![Tag(vec!["h".into(), "g".into()])],
        );
        instance.on_event(&ctx, &create).unwrap();
        instance.ingest(&create).unwrap();
        let meta = instance.groups.get_metadata("g").unwrap().unwrap();
        assert!(meta.content.contains("Test Group"));
        assert!(instance.groups.is_group_member("g", &pubkey(1)).unwrap());

        // Auto-join admits a second member through a join request.
        instance.management.add_member(&pubkey(2)).unwrap();
        let join = signed(
            2,
            JOIN_REQUEST,
            event::now(),
            "",
            vec![Tag(vec!["h".into(), "g".into()])],
        );
        instance.on_event(&SessionCtx::authed(pubkey(2)), &join).unwrap();
        instance.ingest(&join).unwrap();
        assert!(instance.groups.is_group_member("g", &pubkey(2)).unwrap());

        // And a leave request removes them again.
        let leave = signed(
            2,
            LEAVE_REQUEST,
            event::now(),
            "",
            vec![Tag(vec!["h".into(), "g".into()])],
        );
        instance.on_event(&SessionCtx::authed(pubkey(2)), &leave).unwrap();
        instance.ingest(&leave).unwrap();
        assert!(!instance.groups.is_group_member("g", &pubkey(2)).unwrap());

        // Deleting the group purges its events.
        let delete = signed(
            1,
            DELETE_GROUP,
            event::now(),
            "",
            vec![Tag(vec!["h".into(), "g".into()])],
        );
        instance.on_event(&ctx, &delete).unwrap();
        instance.ingest(&delete).unwrap();
        assert!(instance.groups.get_metadata("g").unwrap().is_none());
    }

    #[test]
    fn auto_join_skips_closed_groups() {
        let instance = member_instance(1);
        let create = signed(
            1,
            CREATE_GROUP,
            event::now(),
            r#"{"closed":true}"#,
            vec![Tag(vec!["h".into(), "club".into()])],
        );
        instance.ingest(&create).unwrap();
        instance.management.add_member(&pubkey(2)).unwrap();
        let join = signed(
            2,
            JOIN_REQUEST,
            event::now(),
            "",
            vec![Tag(vec!["h".into(), "club".into()])],
        );
        instance.ingest(&join).unwrap();
        assert!(!instance.groups.is_group_member("club", &pubkey(2)).unwrap());
    }

    #[test]
    fn closed_group_write_gate_through_engine() {
        let instance = member_instance(1);
        let create = signed(
            1,
            CREATE_GROUP,
            event::now(),
            r#"{"closed":true}"#,
            vec![Tag(vec!["h".into(), "club".into()])],
        );
        instance.ingest(&create).unwrap();
        instance.management.add_member(&pubkey(2)).unwrap();

        let chat = signed(
            2,
            event::GROUP_CHAT,
            event::now(),
            "let me in",
            vec![Tag(vec!["h".into(), "club".into()])],
        );
        let reject = instance
            .on_event(&SessionCtx::authed(pubkey(2)), &chat)
            .unwrap_err();
        assert_eq!(reject.to_string(), "restricted: not a member");

        instance.groups.add_member("club", &pubkey(2)).unwrap();
        instance
            .on_event(&SessionCtx::authed(pubkey(2)), &chat)
            .unwrap();
    }

    #[test]
    fn signature_stripping_scope() {
        let mut config = test_config(99, 7);
        config.policy.strip_signatures = true;
        let instance = test_instance(config);
        instance.management.add_member(&pubkey(1)).unwrap();
        let post = note(1, event::now(), "stripped?");
        instance.ingest(&post).unwrap();

        let got = instance
            .query_stored(&SessionCtx::authed(pubkey(1)), &Filter::default())
            .unwrap();
        assert!(got.iter().all(|e| e.sig == "0".repeat(128)));

        // Managers keep original signatures.
        let got = instance
            .query_stored(&SessionCtx::authed(pubkey(7)), &Filter::default())
            .unwrap();
        assert!(got.iter().all(|e| e.sig != "0".repeat(128)));
        for ev in &got {
            crate::event::verify_event(ev).unwrap();
        }
    }

    #[test]
    fn signatures_intact_when_policy_off() {
        let instance = member_instance(1);
        let post = note(1, event::now(), "signed");
        instance.ingest(&post).unwrap();
        let got = instance
            .query_stored(&SessionCtx::authed(pubkey(1)), &Filter::default())
            .unwrap();
        for ev in &got {
            crate::event::verify_event(ev).unwrap();
        }
    }

    #[test]
    fn broadcast_suppression_for_write_only_kinds() {
        let instance = test_instance(test_config(99, 7));
        let join = signed(1, JOIN, 10, "", vec![]);
        let leave = signed(1, LEAVE, 10, "", vec![]);
        let post = note(1, 10, "hello");
        assert!(instance.prevent_broadcast(&join));
        assert!(instance.prevent_broadcast(&leave));
        assert!(!instance.prevent_broadcast(&post));
    }

    #[test]
    fn stored_events_are_broadcast_to_subscribers() {
        let instance = member_instance(1);
        let mut rx = instance.subscribe();
        let post = note(1, 10, "live");
        instance.ingest(&post).unwrap();
        assert_eq!(rx.try_recv().unwrap().id, post.id);
        // Joins are suppressed.
        let invite = instance.management.get_or_create_invite(&pubkey(2)).unwrap();
        let claim = invite.tag_value("claim").unwrap().to_string();
        let join = signed(2, JOIN, 10, "", vec![Tag(vec!["claim".into(), claim])]);
        let mut rx = instance.subscribe();
        instance.ingest(&join).unwrap();
        // Membership changes do broadcast their audit record.
        let live = rx.try_recv().unwrap();
        assert_eq!(live.kind, ADD_MEMBER);
    }

    #[test]
    fn ban_purge_through_engine() {
        let instance = member_instance(1);
        for ts in [10, 20, 30] {
            instance.ingest(&note(1, ts, "spam")).unwrap();
        }
        instance.management.ban_pubkey(&pubkey(1), "spam").unwrap();
        let filter = Filter {
            authors: Some(vec![pubkey(1)]),
            ..Filter::default()
        };
        assert_eq!(instance.events.count(&filter).unwrap(), 0);
        let reject = instance
            .on_event(&SessionCtx::authed(pubkey(1)), &note(1, 40, "again"))
            .unwrap_err();
        assert_eq!(reject.to_string(), "restricted: not a member");
    }

    #[test]
    fn relay_info_document() {
        let instance = test_instance(test_config(99, 7));
        let info = instance.relay_info();
        assert_eq!(info.name, "Test Relay");
        assert_eq!(info.pubkey, pubkey(7));
        assert_eq!(info.software, "warren");
    }
}
