//! Table definitions shared by the heartbeat registry and the outbox

/// Idempotent DDL applied on every [`super::Store::open`].
pub(crate) const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS heartbeats (
  executable TEXT NOT NULL,
  readable TEXT,
  hostname TEXT NOT NULL,
  pid INTEGER NOT NULL,
  thread_id INTEGER NOT NULL,
  thread_name TEXT,
  payload TEXT,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL,
  PRIMARY KEY (executable, hostname, pid, thread_id)
);
CREATE INDEX IF NOT EXISTS idx_heartbeats_updated
  ON heartbeats (executable, updated_at_ms);
CREATE INDEX IF NOT EXISTS idx_heartbeats_host_pid
  ON heartbeats (hostname, pid);

CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  created_at_ms INTEGER NOT NULL,
  event_type TEXT NOT NULL,
  payload TEXT NOT NULL,
  payload_nolimit TEXT,
  services TEXT NOT NULL,
  bucket INTEGER NOT NULL,
  claimed_until_ms INTEGER,
  CHECK (payload <> 'nolimit' OR payload_nolimit IS NOT NULL)
);
CREATE INDEX IF NOT EXISTS idx_messages_created
  ON messages (created_at_ms);
CREATE INDEX IF NOT EXISTS idx_messages_services
  ON messages (services, event_type);

CREATE TABLE IF NOT EXISTS messages_history (
  id TEXT PRIMARY KEY,
  created_at_ms INTEGER NOT NULL,
  event_type TEXT NOT NULL,
  payload TEXT NOT NULL,
  payload_nolimit TEXT,
  services TEXT NOT NULL,
  CHECK (payload <> 'nolimit' OR payload_nolimit IS NOT NULL)
);
"#;
