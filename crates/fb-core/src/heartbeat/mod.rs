//! Heartbeat registry: liveness rows and coordinator-free work partitioning.
//!
//! Each actor (executable, host, pid, thread) owns one row, refreshed on every
//! [`HeartbeatRegistry::live`] call. The same call returns the actor's rank
//! among all actors of its executable seen within the liveness window, sorted
//! by `(hostname, pid, thread_id)`.
//!
//! The rank is a snapshot, not an identity. It shifts as peers join and leave,
//! so callers derive their slice of work again on every poll instead of
//! caching it.
//!
//! ## Reaping
//!
//! Rows disappear through [`HeartbeatRegistry::die`] (graceful shutdown),
//! [`HeartbeatRegistry::sanity_check`] (host-local dead pids plus a global
//! age purge) and [`HeartbeatRegistry::cardiac_arrest`] (age purge only).

mod identity;

pub use identity::{Actor, ExecutableId, ThreadIdentity, calc_hash, local_hostname};

use crate::error::Result;
use crate::partition::Partition;
use crate::process::{OsProcessProbe, ProcessProbe};
use crate::store::{Store, begin_write, cutoff_ms, from_ms, to_ms};
use chrono::{DateTime, Utc};
use identity::{HOSTNAME_MAX_CHARS, PAYLOAD_MAX_CHARS, THREAD_NAME_MAX_CHARS, truncate_chars};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Heartbeats older than this are ignored when ranking (10 minutes).
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(600);

/// Heartbeats older than this are purged by the sanity check (1 day).
pub const DEFAULT_EXPIRATION_DELAY: Duration = Duration::from_secs(86_400);

/// Rank of the caller among the live actors of its executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Assignment {
    /// Zero-based position of the caller in the sorted live set
    pub assign_thread: u32,
    /// Size of the live set
    pub nr_threads: u32,
}

impl Assignment {
    /// Partition slot matching this snapshot.
    pub fn partition(&self) -> Result<Partition> {
        Partition::new(self.assign_thread, self.nr_threads)
    }
}

/// One row of [`HeartbeatRegistry::list_heartbeats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatRecord {
    pub readable: Option<String>,
    pub hostname: String,
    pub pid: u32,
    pub thread_name: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub payload: Option<String>,
}

/// Stateless service over the `heartbeats` table.
#[derive(Debug, Clone)]
pub struct HeartbeatRegistry<P = OsProcessProbe> {
    store: Store,
    probe: P,
}

impl HeartbeatRegistry<OsProcessProbe> {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            probe: OsProcessProbe,
        }
    }
}

impl<P: ProcessProbe> HeartbeatRegistry<P> {
    /// Registry with a custom process-liveness probe.
    pub fn with_probe(store: Store, probe: P) -> Self {
        Self { store, probe }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Record a beat for `actor` and compute its rank.
    pub fn live(
        &self,
        actor: &Actor,
        older_than: Duration,
        payload: Option<&str>,
    ) -> Result<Assignment> {
        self.live_at(actor, older_than, payload, Utc::now())
    }

    /// [`live`](Self::live) with an explicit clock.
    pub fn live_at(
        &self,
        actor: &Actor,
        older_than: Duration,
        payload: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Assignment> {
        let now_ms = to_ms(now);
        let hostname = truncate_chars(&actor.hostname, HOSTNAME_MAX_CHARS);
        let thread_id = actor.thread.id as i64;
        let payload = payload.map(|p| truncate_chars(p, PAYLOAD_MAX_CHARS));

        let mut conn = self.store.connect()?;
        let tx = begin_write(&mut conn)?;
        tx.execute(
            "INSERT INTO heartbeats
               (executable, readable, hostname, pid, thread_id, thread_name, payload,
                created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT (executable, hostname, pid, thread_id) DO UPDATE SET
               updated_at_ms = excluded.updated_at_ms,
               payload = excluded.payload",
            params![
                actor.executable.key(),
                actor.executable.readable(),
                hostname,
                actor.pid,
                thread_id,
                truncate_chars(&actor.thread.name, THREAD_NAME_MAX_CHARS),
                payload,
                now_ms,
            ],
        )?;

        let peers: Vec<(String, u32, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT hostname, pid, thread_id FROM heartbeats
                 WHERE executable = ?1 AND updated_at_ms >= ?2
                 GROUP BY hostname, pid, thread_id
                 ORDER BY hostname, pid, thread_id",
            )?;
            let rows = stmt.query_map(
                params![actor.executable.key(), cutoff_ms(now, older_than)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        tx.commit()?;

        let assign_thread = peers
            .iter()
            .position(|(host, pid, tid)| *host == hostname && *pid == actor.pid && *tid == thread_id)
            .unwrap_or(0);
        let assignment = Assignment {
            assign_thread: assign_thread as u32,
            nr_threads: peers.len() as u32,
        };
        debug!(
            executable = actor.executable.name(),
            assign_thread = assignment.assign_thread,
            nr_threads = assignment.nr_threads,
            "Heartbeat recorded"
        );
        Ok(assignment)
    }

    /// Remove the actor's row, optionally only if it is older than `older_than`.
    ///
    /// Returns the number of rows removed (0 or 1).
    pub fn die(&self, actor: &Actor, older_than: Option<Duration>) -> Result<usize> {
        self.die_at(actor, older_than, Utc::now())
    }

    pub fn die_at(
        &self,
        actor: &Actor,
        older_than: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.store.connect()?;
        let hostname = truncate_chars(&actor.hostname, HOSTNAME_MAX_CHARS);
        let key = (
            actor.executable.key(),
            hostname.as_str(),
            actor.pid,
            actor.thread.id as i64,
        );
        let removed = match older_than {
            Some(age) => conn.execute(
                "DELETE FROM heartbeats
                 WHERE executable = ?1 AND hostname = ?2 AND pid = ?3 AND thread_id = ?4
                   AND updated_at_ms < ?5",
                params![key.0, key.1, key.2, key.3, cutoff_ms(now, age)],
            )?,
            None => conn.execute(
                "DELETE FROM heartbeats
                 WHERE executable = ?1 AND hostname = ?2 AND pid = ?3 AND thread_id = ?4",
                params![key.0, key.1, key.2, key.3],
            )?,
        };
        debug!(executable = actor.executable.name(), removed, "Heartbeat removed");
        Ok(removed)
    }

    /// Remove every heartbeat, or only those older than `older_than`.
    pub fn cardiac_arrest(&self, older_than: Option<Duration>) -> Result<usize> {
        self.cardiac_arrest_at(older_than, Utc::now())
    }

    pub fn cardiac_arrest_at(
        &self,
        older_than: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.store.connect()?;
        let removed = purge(&conn, older_than, now)?;
        if removed > 0 {
            info!("Purged {removed} stale heartbeat(s)");
        }
        Ok(removed)
    }

    /// Advisory host-local garbage collection.
    ///
    /// Deletes rows on `hostname` (for `executable`, or for every executable
    /// when `None`) whose pid no longer exists, then purges rows of any host
    /// older than `expiration_delay` ([`DEFAULT_EXPIRATION_DELAY`] when
    /// `None`). Store errors are logged at `warn` and swallowed; anything else
    /// is logged at `error`. This never fails the caller.
    pub fn sanity_check(
        &self,
        executable: Option<&ExecutableId>,
        hostname: &str,
        expiration_delay: Option<Duration>,
    ) {
        self.sanity_check_at(executable, hostname, expiration_delay, Utc::now());
    }

    pub fn sanity_check_at(
        &self,
        executable: Option<&ExecutableId>,
        hostname: &str,
        expiration_delay: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        match self.try_sanity_check(executable, hostname, expiration_delay, now) {
            Ok((dead, expired)) if dead + expired > 0 => {
                info!("Heartbeat sanity check removed {dead} dead and {expired} expired row(s)");
            }
            Ok(_) => debug!("Heartbeat sanity check found nothing to remove"),
            Err(e) if e.is_database() => warn!("Heartbeat sanity check failed (ignored): {e}"),
            Err(e) => error!("Heartbeat sanity check hit an unexpected error: {e}"),
        }
    }

    /// Sanity check followed by a beat for `actor`, as done at daemon start-up.
    ///
    /// Returns `None` when the store rejected the beat; the error is logged.
    pub fn sanity_check_and_live(
        &self,
        actor: &Actor,
        expiration_delay: Option<Duration>,
    ) -> Option<Assignment> {
        self.sanity_check(Some(&actor.executable), &actor.hostname, expiration_delay);
        match self.live(actor, DEFAULT_LIVENESS_WINDOW, None) {
            Ok(assignment) => Some(assignment),
            Err(e) => {
                warn!("Start-up heartbeat failed (ignored): {e}");
                None
            }
        }
    }

    fn try_sanity_check(
        &self,
        executable: Option<&ExecutableId>,
        hostname: &str,
        expiration_delay: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let hostname = truncate_chars(hostname, HOSTNAME_MAX_CHARS);
        let mut conn = self.store.connect()?;
        let tx = begin_write(&mut conn)?;

        let pids: Vec<u32> = match executable {
            Some(exe) => {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT pid FROM heartbeats WHERE hostname = ?1 AND executable = ?2",
                )?;
                let rows = stmt.query_map(params![hostname, exe.key()], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let mut stmt =
                    tx.prepare("SELECT DISTINCT pid FROM heartbeats WHERE hostname = ?1")?;
                let rows = stmt.query_map(params![hostname], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };

        let mut dead = 0;
        for pid in pids.into_iter().filter(|pid| !self.probe.exists(*pid)) {
            dead += match executable {
                Some(exe) => tx.execute(
                    "DELETE FROM heartbeats WHERE executable = ?1 AND hostname = ?2 AND pid = ?3",
                    params![exe.key(), hostname, pid],
                )?,
                None => tx.execute(
                    "DELETE FROM heartbeats WHERE hostname = ?1 AND pid = ?2",
                    params![hostname, pid],
                )?,
            };
        }

        let delay = expiration_delay.unwrap_or(DEFAULT_EXPIRATION_DELAY);
        let expired = purge(&tx, Some(delay), now)?;
        tx.commit()?;
        Ok((dead, expired))
    }

    /// Every heartbeat, ordered by readable name, host and thread name.
    pub fn list_heartbeats(&self) -> Result<Vec<HeartbeatRecord>> {
        let conn = self.store.connect()?;
        let mut stmt = conn.prepare(
            "SELECT readable, hostname, pid, thread_name, updated_at_ms, created_at_ms, payload
             FROM heartbeats
             ORDER BY readable, hostname, thread_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(HeartbeatRecord {
                readable: row.get(0)?,
                hostname: row.get(1)?,
                pid: row.get(2)?,
                thread_name: row.get(3)?,
                updated_at: from_ms(row.get(4)?),
                created_at: from_ms(row.get(5)?),
                payload: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Live threads per non-empty payload for one executable.
    pub fn list_payload_counts(
        &self,
        executable: &ExecutableId,
        older_than: Duration,
    ) -> Result<BTreeMap<String, u64>> {
        self.list_payload_counts_at(executable, older_than, Utc::now())
    }

    pub fn list_payload_counts_at(
        &self,
        executable: &ExecutableId,
        older_than: Duration,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, u64>> {
        let conn = self.store.connect()?;
        let mut stmt = conn.prepare(
            "SELECT payload, COUNT(payload) FROM heartbeats
             WHERE executable = ?1 AND updated_at_ms >= ?2
               AND payload IS NOT NULL AND payload <> ''
             GROUP BY payload
             ORDER BY payload",
        )?;
        let rows = stmt.query_map(
            params![executable.key(), cutoff_ms(now, older_than)],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (payload, count) = row?;
            counts.insert(payload, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Last beat of a single actor, if it has a row.
    pub fn last_beat(&self, actor: &Actor) -> Result<Option<DateTime<Utc>>> {
        let conn = self.store.connect()?;
        let ms: Option<i64> = conn
            .query_row(
                "SELECT updated_at_ms FROM heartbeats
                 WHERE executable = ?1 AND hostname = ?2 AND pid = ?3 AND thread_id = ?4",
                params![
                    actor.executable.key(),
                    truncate_chars(&actor.hostname, HOSTNAME_MAX_CHARS),
                    actor.pid,
                    actor.thread.id as i64,
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ms.map(from_ms))
    }
}

fn purge(
    conn: &rusqlite::Connection,
    older_than: Option<Duration>,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    match older_than {
        Some(age) => conn.execute(
            "DELETE FROM heartbeats WHERE updated_at_ms < ?1",
            params![cutoff_ms(now, age)],
        ),
        None => conn.execute("DELETE FROM heartbeats", []),
    }
}
