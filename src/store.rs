//! SQLite-backed signed-event store with an inverted single-letter tag index.
//!
//! One database is shared by every tenant; each instance's tables carry its
//! configured schema prefix. Mutations are single statements under a short
//! lock, so concurrent writers to the same id race to the uniqueness check
//! with exactly one winner.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::event::{self, Event, Filter, Tag};

/// Failures surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Insert collided with an existing id. Recoverable by callers.
    #[error("duplicate event")]
    Duplicate,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("signing error: {0}")]
    Signing(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistent store for one tenant's events.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    prefix: String,
    config: Arc<Config>,
    tx: broadcast::Sender<Event>,
}

impl Store {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        config: Arc<Config>,
        tx: broadcast::Sender<Event>,
    ) -> Self {
        let prefix = config.schema.clone();
        Self {
            conn,
            prefix,
            config,
            tx,
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn table(&self, name: &str) -> String {
        format!("{}__{}", self.prefix, name)
    }

    /// Create this tenant's tables and secondary indexes.
    pub fn init(&self) -> Result<()> {
        let p = &self.prefix;
        let schema = format!(
            "
            CREATE TABLE IF NOT EXISTS {p}__events (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                pubkey TEXT NOT NULL,
                content TEXT NOT NULL,
                tags TEXT NOT NULL,
                sig TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {p}__idx_events_created_at ON {p}__events(created_at);
            CREATE INDEX IF NOT EXISTS {p}__idx_events_kind ON {p}__events(kind);
            CREATE INDEX IF NOT EXISTS {p}__idx_events_pubkey ON {p}__events(pubkey);
            CREATE INDEX IF NOT EXISTS {p}__idx_events_kind_pubkey ON {p}__events(kind, pubkey);
            CREATE INDEX IF NOT EXISTS {p}__idx_events_kind_pubkey_created_at
                ON {p}__events(kind, pubkey, created_at DESC);

            CREATE TABLE IF NOT EXISTS {p}__event_tags (
                event_id TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {p}__idx_event_tags_event_id ON {p}__event_tags(event_id);
            CREATE INDEX IF NOT EXISTS {p}__idx_event_tags_name ON {p}__event_tags(name);
            CREATE INDEX IF NOT EXISTS {p}__idx_event_tags_name_value
                ON {p}__event_tags(name, value);
            "
        );
        self.conn().execute_batch(&schema)?;
        Ok(())
    }

    /// Insert an event, failing with [`StoreError::Duplicate`] if the id is
    /// already present. Single-character tag names go to the inverted index.
    pub fn save_event(&self, ev: &Event) -> Result<()> {
        let tags_json = serde_json::to_string(&ev.tags)?;
        let conn = self.conn();
        let existing: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", self.table("events")),
                params![ev.id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::Duplicate);
        }
        conn.execute(
            &format!(
                "INSERT INTO {} (id, created_at, kind, pubkey, content, tags, sig)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                self.table("events")
            ),
            params![
                ev.id,
                ev.created_at as i64,
                ev.kind as i64,
                ev.pubkey,
                ev.content,
                tags_json,
                ev.sig
            ],
        )?;
        for tag in &ev.tags {
            if tag.0.len() >= 2 && tag.name().chars().count() == 1 {
                conn.execute(
                    &format!(
                        "INSERT INTO {} (event_id, name, value) VALUES (?1, ?2, ?3)",
                        self.table("event_tags")
                    ),
                    params![ev.id, tag.name(), tag.value().unwrap_or_default()],
                )?;
            }
        }
        Ok(())
    }

    /// Remove an event and its tag-index rows. Idempotent.
    pub fn delete_event(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            &format!("DELETE FROM {} WHERE event_id = ?1", self.table("event_tags")),
            params![id],
        )?;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.table("events")),
            params![id],
        )?;
        Ok(())
    }

    /// Keep the newest event per replaceable or addressable identity.
    ///
    /// Older-or-equal predecessors are deleted before insert; a strictly
    /// newer predecessor wins and the incoming event is discarded.
    pub fn replace_event(&self, ev: &Event) -> Result<()> {
        let mut filter = Filter {
            kinds: Some(vec![ev.kind]),
            authors: Some(vec![ev.pubkey.clone()]),
            ..Filter::default()
        };
        if event::is_addressable(ev.kind) {
            filter = filter.tag('d', vec![ev.d_tag().unwrap_or_default().to_string()]);
        }
        let mut should_store = true;
        for previous in self.query(&filter, 0)? {
            if previous.created_at <= ev.created_at {
                self.delete_event(&previous.id)?;
            } else {
                should_store = false;
            }
        }
        if should_store {
            match self.save_event(ev) {
                Err(StoreError::Duplicate) => {}
                other => other?,
            }
        }
        Ok(())
    }

    /// General write entry point: replaceable and addressable kinds go
    /// through [`Store::replace_event`], everything else is appended.
    pub fn store(&self, ev: &Event) -> Result<()> {
        if event::is_replaceable(ev.kind) || event::is_addressable(ev.kind) {
            self.replace_event(ev)
        } else {
            self.save_event(ev)
        }
    }

    /// Sign with the instance key, store, and optionally publish to live
    /// subscribers. Duplicates are silent here.
    pub fn sign_and_store(&self, ev: &mut Event, broadcast: bool) -> Result<()> {
        self.config
            .sign(ev)
            .map_err(|e| StoreError::Signing(e.to_string()))?;
        match self.store(ev) {
            Err(StoreError::Duplicate) => return Ok(()),
            other => other?,
        }
        if broadcast {
            let _ = self.tx.send(ev.clone());
        }
        Ok(())
    }

    fn where_clauses(&self, filter: &Filter) -> (Vec<String>, Vec<SqlValue>) {
        let mut clauses = vec![];
        let mut args: Vec<SqlValue> = vec![];
        let placeholders = |n: usize| vec!["?"; n].join(", ");
        // An explicitly empty set matches nothing.
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                clauses.push("1 = 0".into());
            } else {
                clauses.push(format!("id IN ({})", placeholders(ids.len())));
                args.extend(ids.iter().map(|s| SqlValue::Text(s.clone())));
            }
        }
        if let Some(authors) = &filter.authors {
            if authors.is_empty() {
                clauses.push("1 = 0".into());
            } else {
                clauses.push(format!("pubkey IN ({})", placeholders(authors.len())));
                args.extend(authors.iter().map(|s| SqlValue::Text(s.clone())));
            }
        }
        if let Some(kinds) = &filter.kinds {
            if kinds.is_empty() {
                clauses.push("1 = 0".into());
            } else {
                clauses.push(format!("kind IN ({})", placeholders(kinds.len())));
                args.extend(kinds.iter().map(|&k| SqlValue::Integer(k as i64)));
            }
        }
        if let Some(since) = filter.since {
            clauses.push("created_at >= ?".into());
            args.push(SqlValue::Integer(since as i64));
        }
        if let Some(until) = filter.until {
            clauses.push("created_at <= ?".into());
            args.push(SqlValue::Integer(until as i64));
        }
        for (name, values) in &filter.tags {
            if values.is_empty() {
                continue;
            }
            clauses.push(format!(
                "id IN (SELECT event_id FROM {} WHERE name = ? AND value IN ({}))",
                self.table("event_tags"),
                placeholders(values.len())
            ));
            args.push(SqlValue::Text(name.to_string()));
            args.extend(values.iter().map(|s| SqlValue::Text(s.clone())));
        }
        if let Some(search) = &filter.search {
            clauses.push("content LIKE ?".into());
            args.push(SqlValue::Text(format!("%{}%", search)));
        }
        (clauses, args)
    }

    /// Events matching the filter, newest first (ties broken by id,
    /// descending). The effective limit is the minimum of the filter's and
    /// `max_limit`, with zero meaning unbounded on either side.
    pub fn query(&self, filter: &Filter, max_limit: usize) -> Result<Vec<Event>> {
        if filter.limit_zero {
            return Ok(vec![]);
        }
        let mut sql = format!(
            "SELECT id, created_at, kind, pubkey, content, tags, sig FROM {}",
            self.table("events")
        );
        let (clauses, args) = self.where_clauses(filter);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        let limit = match (filter.limit, max_limit) {
            (Some(l), 0) => l,
            (None, m) => m,
            (Some(l), m) => l.min(m),
        };
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut events = vec![];
        for row in rows {
            let (id, created_at, kind, pubkey, content, tags_json, sig) = row?;
            let tags: Vec<Tag> = match serde_json::from_str(&tags_json) {
                Ok(tags) => tags,
                Err(_) => continue,
            };
            events.push(Event {
                id,
                pubkey,
                kind: kind as u32,
                created_at: created_at as u64,
                tags,
                content,
                sig,
            });
        }
        Ok(events)
    }

    /// Cardinality of the filter's match set.
    pub fn count(&self, filter: &Filter) -> Result<u64> {
        if filter.limit_zero {
            return Ok(0);
        }
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.table("events"));
        let (clauses, args) = self.where_clauses(filter);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        let conn = self.conn();
        let count: i64 = conn.query_row(&sql, params_from_iter(args), |row| row.get(0))?;
        Ok(count as u64)
    }

    /// The newest internal record with the given `d` tag, or a fresh
    /// unsigned skeleton carrying only that tag.
    pub fn get_or_create_app_data(&self, d: &str) -> Result<Event> {
        let filter = Filter {
            kinds: Some(vec![event::APP_DATA]),
            limit: Some(1),
            ..Filter::default()
        }
        .tag('d', vec![d.to_string()]);
        if let Some(ev) = self.query(&filter, 1)?.into_iter().next() {
            return Ok(ev);
        }
        Ok(Event {
            id: String::new(),
            pubkey: String::new(),
            kind: event::APP_DATA,
            created_at: event::now(),
            tags: vec![Tag(vec!["d".into(), d.into()])],
            content: String::new(),
            sig: String::new(),
        })
    }
}
