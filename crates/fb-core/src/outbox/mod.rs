//! Durable message outbox.
//!
//! Producers stage events with [`MessageOutbox::add_messages`]; each event is
//! fanned out into one row per delivery service that accepts it. Consumers
//! poll with [`MessageOutbox::retrieve_messages`], deliver, then call
//! [`MessageOutbox::delete_messages`], which moves the rows to
//! `messages_history` in the same transaction.
//!
//! ## Claims
//!
//! A locking retrieval stamps every returned row with
//! `claimed_until_ms = now + claim_timeout`. Until that instant the row is
//! invisible to every other retrieval, so two consumers polling at the same
//! time never receive the same message. A consumer that crashes mid-batch
//! simply lets its claims lapse.

mod payload;
mod types;

pub use payload::NOLIMIT_SENTINEL;
pub use types::{
    DeliveryService, EMAIL_EVENT_TYPE, Message, NewMessage, RetrieveOptions, resolve_services,
};

use crate::config::OutboxConfig;
use crate::error::{CoordError, Result, is_busy};
use crate::partition::bucket_for;
use crate::store::{Store, begin_write, from_ms, to_ms};
use chrono::{DateTime, Utc};
use payload::StoredPayload;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Rows per multi-row INSERT; keeps bound parameters under SQLite's limit.
const MAX_ROWS_PER_STATEMENT: usize = 4000;
const INSERT_COLUMNS: usize = 7;

struct PendingRow {
    id: String,
    event_type: String,
    stored: StoredPayload,
    service: DeliveryService,
    bucket: u32,
}

/// Stateless service over the `messages` and `messages_history` tables.
#[derive(Debug, Clone)]
pub struct MessageOutbox {
    store: Store,
    config: OutboxConfig,
}

impl MessageOutbox {
    pub fn new(store: Store, config: OutboxConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Stage `messages`, one row per accepting delivery service.
    ///
    /// The configured service list is validated first, so an unknown name
    /// fails the call before anything is written. All rows commit together.
    /// Returns the number of rows inserted.
    pub fn add_messages<T: Serialize>(&self, messages: &[NewMessage<T>]) -> Result<usize> {
        self.add_messages_at(messages, Utc::now())
    }

    /// [`add_messages`](Self::add_messages) with an explicit creation time.
    pub fn add_messages_at<T: Serialize>(
        &self,
        messages: &[NewMessage<T>],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let services = resolve_services(&self.config.services)?;

        let mut rows = Vec::new();
        for message in messages {
            let targets: Vec<DeliveryService> = services
                .iter()
                .copied()
                .filter(|service| service.accepts(&message.event_type))
                .collect();
            if targets.is_empty() {
                continue;
            }
            let stored = payload::place(
                payload::serialize(&message.payload)?,
                self.config.max_message_length,
            );
            for service in targets {
                let id = Uuid::new_v4().to_string();
                let bucket = bucket_for(&id);
                rows.push(PendingRow {
                    id,
                    event_type: message.event_type.clone(),
                    stored: stored.clone(),
                    service,
                    bucket,
                });
            }
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let inserted = self
            .insert_rows(&rows, to_ms(now))
            .map_err(|e| e.in_operation("add_messages"))?;
        debug!(inserted, "Messages staged");
        Ok(inserted)
    }

    /// Stage a single event.
    pub fn add_message<T: Serialize + ?Sized>(&self, event_type: &str, payload: &T) -> Result<usize> {
        self.add_messages(&[NewMessage::new(event_type, payload)])
    }

    fn insert_rows(&self, rows: &[PendingRow], now_ms: i64) -> Result<usize> {
        let chunk_size = self.config.chunk_size.clamp(1, MAX_ROWS_PER_STATEMENT);
        let mut conn = self.store.connect()?;
        let tx = begin_write(&mut conn)?;
        let mut inserted = 0;
        for batch in rows.chunks(chunk_size) {
            let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?)"; batch.len()].join(", ");
            let sql = format!(
                "INSERT INTO messages
                   (id, created_at_ms, event_type, payload, payload_nolimit, services, bucket)
                 VALUES {placeholders}"
            );
            let mut values = Vec::with_capacity(batch.len() * INSERT_COLUMNS);
            for row in batch {
                values.push(SqlValue::Text(row.id.clone()));
                values.push(SqlValue::Integer(now_ms));
                values.push(SqlValue::Text(row.event_type.clone()));
                values.push(SqlValue::Text(row.stored.payload.clone()));
                values.push(optional_text(row.stored.payload_nolimit.as_deref()));
                values.push(SqlValue::Text(row.service.as_str().to_string()));
                values.push(SqlValue::Integer(i64::from(row.bucket)));
            }
            inserted += tx.execute(&sql, params_from_iter(values))?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Oldest pending messages matching `options`.
    ///
    /// With `options.lock`, returned rows are claimed for the configured
    /// claim timeout. When another writer holds the database past the busy
    /// timeout, a locking call returns an empty batch instead of failing.
    pub fn retrieve_messages(&self, options: &RetrieveOptions) -> Result<Vec<Message>> {
        self.retrieve_messages_at(options, Utc::now())
    }

    pub fn retrieve_messages_at(
        &self,
        options: &RetrieveOptions,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        if options.bulk == 0 {
            return Ok(Vec::new());
        }
        let messages = self
            .fetch(options, now)
            .map_err(|e| e.in_operation("retrieve_messages"))?;
        debug!(
            count = messages.len(),
            lock = options.lock,
            "Messages retrieved"
        );
        Ok(messages)
    }

    fn fetch(&self, options: &RetrieveOptions, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let now_ms = to_ms(now);
        let mut conn = self.store.connect()?;
        let tx = if options.lock {
            match begin_write(&mut conn) {
                Ok(tx) => tx,
                Err(e) if is_busy(&e) => {
                    warn!("Outbox busy, skipping this poll: {e}");
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            conn.transaction()?
        };

        let (sql, values) = select_query(options, now_ms);
        let rows: Vec<(String, i64, String, String, String)> = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut messages = Vec::with_capacity(rows.len());
        for (id, created_at_ms, event_type, text, services) in rows {
            let text = if text == NOLIMIT_SENTINEL {
                overflow_payload(&tx, &id)?
            } else {
                text
            };
            let payload = payload::decode(&id, &text)?;
            let services = parse_service(&id, &services)?;
            messages.push(Message {
                id,
                created_at: from_ms(created_at_ms),
                event_type,
                payload,
                services,
            });
        }

        if options.lock && !messages.is_empty() {
            let claim_ms = i64::try_from(self.config.claim_timeout().as_millis()).unwrap_or(i64::MAX);
            let claimed_until = now_ms.saturating_add(claim_ms);
            let mut stmt = tx.prepare("UPDATE messages SET claimed_until_ms = ?1 WHERE id = ?2")?;
            for message in &messages {
                stmt.execute(params![claimed_until, message.id])?;
            }
        }
        tx.commit()?;
        Ok(messages)
    }

    /// Remove consumed messages and archive them to history.
    ///
    /// Every given message is written to history, whether or not it was
    /// still pending. Archiving an id twice is an integrity violation and
    /// rolls back the whole call. Returns the number of pending rows removed.
    pub fn delete_messages(&self, messages: &[Message]) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        let removed = self
            .archive(messages)
            .map_err(|e| e.in_operation("delete_messages"))?;
        debug!(removed, archived = messages.len(), "Messages archived");
        Ok(removed)
    }

    fn archive(&self, messages: &[Message]) -> Result<usize> {
        let mut conn = self.store.connect()?;
        let tx = begin_write(&mut conn)?;
        let mut removed = 0;
        {
            let mut delete = tx.prepare("DELETE FROM messages WHERE id = ?1")?;
            let mut insert = tx.prepare(
                "INSERT INTO messages_history
                   (id, created_at_ms, event_type, payload, payload_nolimit, services)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for message in messages {
                let stored = payload::place(
                    payload::serialize(&message.payload)?,
                    self.config.max_message_length,
                );
                removed += delete.execute(params![message.id])?;
                insert.execute(params![
                    message.id,
                    to_ms(message.created_at),
                    message.event_type,
                    stored.payload,
                    stored.payload_nolimit,
                    message.services.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Drop every pending message without archiving.
    pub fn truncate_messages(&self) -> Result<usize> {
        let conn = self.store.connect()?;
        let removed = conn
            .execute("DELETE FROM messages", [])
            .map_err(|e| CoordError::from_store("truncate_messages", e))?;
        info!("Truncated {removed} pending message(s)");
        Ok(removed)
    }

    /// Reroute pending messages to `service` and release their claims.
    pub fn update_messages_services(
        &self,
        messages: &[Message],
        service: DeliveryService,
    ) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        let updated = self
            .reroute(messages, service)
            .map_err(|e| e.in_operation("update_messages_services"))?;
        debug!(updated, service = service.as_str(), "Messages rerouted");
        Ok(updated)
    }

    fn reroute(&self, messages: &[Message], service: DeliveryService) -> Result<usize> {
        let mut conn = self.store.connect()?;
        let tx = begin_write(&mut conn)?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE messages SET services = ?1, claimed_until_ms = NULL WHERE id = ?2",
            )?;
            for message in messages {
                updated += stmt.execute(params![service.as_str(), message.id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Number of messages still pending, claimed or not.
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.store.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Archived messages, oldest first.
    pub fn list_history(&self) -> Result<Vec<Message>> {
        let conn = self.store.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at_ms, event_type, payload, payload_nolimit, services
             FROM messages_history
             ORDER BY created_at_ms, rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (id, created_at_ms, event_type, text, nolimit, services) = row?;
            let text = match nolimit {
                Some(full) if text == NOLIMIT_SENTINEL => full,
                _ => text,
            };
            history.push(Message {
                payload: payload::decode(&id, &text)?,
                services: parse_service(&id, &services)?,
                created_at: from_ms(created_at_ms),
                event_type,
                id,
            });
        }
        Ok(history)
    }
}

fn select_query(options: &RetrieveOptions, now_ms: i64) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["(claimed_until_ms IS NULL OR claimed_until_ms <= ?)"];
    let mut values = vec![SqlValue::Integer(now_ms)];

    if let Some(service) = options.service_filter {
        clauses.push("services = ?");
        values.push(SqlValue::Text(service.as_str().to_string()));
    }
    match &options.event_type {
        Some(event_type) => {
            clauses.push("event_type = ?");
            values.push(SqlValue::Text(event_type.clone()));
        }
        None if options.old_mode => {
            clauses.push("event_type <> ?");
            values.push(SqlValue::Text(EMAIL_EVENT_TYPE.to_string()));
        }
        None => {}
    }
    if let Some(partition) = options.partition.filter(|p| p.count() > 1) {
        clauses.push("bucket % ? = ?");
        values.push(SqlValue::Integer(i64::from(partition.count())));
        values.push(SqlValue::Integer(i64::from(partition.index())));
    }
    values.push(SqlValue::Integer(
        i64::try_from(options.bulk).unwrap_or(i64::MAX),
    ));

    let sql = format!(
        "SELECT id, created_at_ms, event_type, payload, services FROM messages
         WHERE {}
         ORDER BY created_at_ms, rowid
         LIMIT ?",
        clauses.join(" AND ")
    );
    (sql, values)
}

fn overflow_payload(conn: &Connection, id: &str) -> Result<String> {
    let text: Option<Option<String>> = conn
        .query_row(
            "SELECT payload_nolimit FROM messages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    text.flatten().ok_or_else(|| CoordError::Corrupt {
        id: id.to_string(),
        reason: "overflow payload missing".to_string(),
    })
}

fn parse_service(id: &str, value: &str) -> Result<DeliveryService> {
    value.parse().map_err(|_| CoordError::Corrupt {
        id: id.to_string(),
        reason: format!("unknown delivery service {value:?}"),
    })
}

fn optional_text(value: Option<&str>) -> SqlValue {
    value.map_or(SqlValue::Null, |v| SqlValue::Text(v.to_string()))
}
