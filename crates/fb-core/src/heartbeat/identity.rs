//! Who is beating: executable key, thread identity, and the full actor tuple.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) const READABLE_MAX_CHARS: usize = 4000;
pub(crate) const HOSTNAME_MAX_CHARS: usize = 128;
pub(crate) const THREAD_NAME_MAX_CHARS: usize = 64;
pub(crate) const PAYLOAD_MAX_CHARS: usize = 3000;

const DEFAULT_THREAD_NAME: &str = "thread";

/// Lowercase hex SHA-256 of the executable's logical name.
pub fn calc_hash(executable: &str) -> String {
    format!("{:x}", Sha256::digest(executable.as_bytes()))
}

/// Executable identity: human-readable name plus its fixed-width key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutableId {
    name: String,
    key: String,
}

impl ExecutableId {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let key = calc_hash(&name);
        Self { name, key }
    }

    /// Use a precomputed key instead of hashing `name`.
    pub fn with_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn readable(&self) -> String {
        truncate_chars(&self.name, READABLE_MAX_CHARS)
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Logical thread inside a process.
///
/// `ThreadIdentity::default()` (`0`, `"thread"`) stands for "no thread
/// context". [`ThreadIdentity::current`] hands every OS thread a
/// process-unique id starting at 1, stable for the thread's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadIdentity {
    pub id: u64,
    pub name: String,
}

impl ThreadIdentity {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn current() -> Self {
        let id = THREAD_ID.with(|id| *id);
        let name = std::thread::current()
            .name()
            .unwrap_or(DEFAULT_THREAD_NAME)
            .to_string();
        Self { id, name }
    }
}

impl Default for ThreadIdentity {
    fn default() -> Self {
        Self {
            id: 0,
            name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

/// The `(executable, hostname, pid, thread)` tuple a heartbeat row belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub executable: ExecutableId,
    pub hostname: String,
    pub pid: u32,
    pub thread: ThreadIdentity,
}

impl Actor {
    /// Actor without thread context (`thread_id = 0`).
    pub fn new(executable: ExecutableId, hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            executable,
            hostname: hostname.into(),
            pid,
            thread: ThreadIdentity::default(),
        }
    }

    /// The calling thread of this process on this host.
    pub fn current(executable: ExecutableId) -> Self {
        Self {
            executable,
            hostname: local_hostname(),
            pid: std::process::id(),
            thread: ThreadIdentity::current(),
        }
    }

    pub fn with_thread(mut self, thread: ThreadIdentity) -> Self {
        self.thread = thread;
        self
    }
}

/// Local hostname, or `"localhost"` when the OS refuses to say.
pub fn local_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!("Failed to read hostname, using localhost: {e}");
            "localhost".to_string()
        }
    }
}

pub(crate) fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
