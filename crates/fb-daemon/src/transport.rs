//! Delivery transports for the dispatcher
//!
//! A transport hands a batch of outbox messages to one downstream service.
//! Broker wire protocols live outside this crate; the transports here cover
//! logging and a file spool that an external forwarder can drain.

use fleetbeat_core::{DeliveryService, Message};
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Writing to the delivery target failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A message could not be encoded for the wire
    #[error("Encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// The downstream service refused the batch
    #[error("Delivery rejected: {message}")]
    Rejected { message: String },
}

/// Delivers outbox batches to a single service.
///
/// Uses RPITIT with an explicit `Send` bound so dispatch loops stay spawnable.
pub trait Transport: Send + Sync {
    /// Service whose rows this transport consumes.
    fn service(&self) -> DeliveryService;

    /// Deliver the whole batch, or fail without side effects the caller must undo.
    fn deliver(&self, batch: &[Message]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Logs every message at `info` and reports success.
#[derive(Debug, Clone)]
pub struct LogTransport {
    service: DeliveryService,
}

impl LogTransport {
    pub fn new(service: DeliveryService) -> Self {
        Self { service }
    }
}

impl Transport for LogTransport {
    fn service(&self) -> DeliveryService {
        self.service
    }

    async fn deliver(&self, batch: &[Message]) -> Result<(), TransportError> {
        for message in batch {
            info!(
                service = self.service.as_str(),
                id = %message.id,
                event_type = %message.event_type,
                "Delivered {}",
                message.payload
            );
        }
        Ok(())
    }
}

/// Appends each message as one JSON line to `<dir>/<service>.jsonl`.
#[derive(Debug, Clone)]
pub struct SpoolTransport {
    service: DeliveryService,
    dir: PathBuf,
}

impl SpoolTransport {
    pub fn new(service: DeliveryService, dir: impl Into<PathBuf>) -> Self {
        Self {
            service,
            dir: dir.into(),
        }
    }

    /// Spool file this transport appends to.
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.jsonl", self.service.as_str()))
    }
}

impl Transport for SpoolTransport {
    fn service(&self) -> DeliveryService {
        self.service
    }

    async fn deliver(&self, batch: &[Message]) -> Result<(), TransportError> {
        let mut lines = String::new();
        for message in batch {
            lines.push_str(&serde_json::to_string(message)?);
            lines.push('\n');
        }

        let path = self.path();
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| io_error(&path, e))?;
        file.flush().await.map_err(|e| io_error(&path, e))?;
        Ok(())
    }
}

/// Transport picked at start-up from configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredTransport {
    Log(LogTransport),
    Spool(SpoolTransport),
}

impl ConfiguredTransport {
    /// Spool to `spool_dir` when given, otherwise log.
    pub fn new(service: DeliveryService, spool_dir: Option<&Path>) -> Self {
        match spool_dir {
            Some(dir) => Self::Spool(SpoolTransport::new(service, dir)),
            None => Self::Log(LogTransport::new(service)),
        }
    }
}

impl Transport for ConfiguredTransport {
    fn service(&self) -> DeliveryService {
        match self {
            Self::Log(t) => t.service(),
            Self::Spool(t) => t.service(),
        }
    }

    async fn deliver(&self, batch: &[Message]) -> Result<(), TransportError> {
        match self {
            Self::Log(t) => t.deliver(batch).await,
            Self::Spool(t) => t.deliver(batch).await,
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> TransportError {
    TransportError::Io {
        path: path.to_path_buf(),
        source,
    }
}
