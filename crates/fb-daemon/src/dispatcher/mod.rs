//! Outbox dispatch loop
//!
//! Every tick the dispatcher beats for its actor, turns the returned rank
//! into a partition, claims one batch of its service's messages from that
//! partition, hands it to the transport and archives it on success. Peers
//! draining the same service split the outbox between them without talking
//! to each other.

use crate::transport::{Transport, TransportError};
use fleetbeat_core::config::Config;
use fleetbeat_core::heartbeat::{Actor, Assignment, ExecutableId, HeartbeatRegistry};
use fleetbeat_core::{CoordError, DeliveryService, MessageOutbox, RetrieveOptions, Store};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Store error: {0}")]
    Store(#[from] CoordError),

    /// The batch stays claimed until its claims expire
    #[error("Delivery to {service} failed: {source}")]
    Delivery {
        service: DeliveryService,
        source: TransportError,
    },

    #[error("Blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Knobs for one dispatcher, usually taken from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub bulk: usize,
    pub event_type: Option<String>,
    pub older_than: Duration,
    pub expiration_delay: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bulk: config.dispatcher.bulk,
            event_type: config.dispatcher.event_type.clone(),
            older_than: config.heartbeat.older_than(),
            expiration_delay: config.heartbeat.expiration_delay(),
        }
    }
}

/// Heartbeat executable for the dispatchers of one service.
pub fn service_executable(executable: &str, service: DeliveryService) -> ExecutableId {
    ExecutableId::new(format!("{executable}-{}", service.as_str()))
}

/// Outcome of one [`Dispatcher::tick`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub assignment: Assignment,
    pub retrieved: usize,
    pub delivered: usize,
}

pub struct Dispatcher<T> {
    registry: HeartbeatRegistry,
    outbox: MessageOutbox,
    transport: T,
    actor: Actor,
    settings: DispatchSettings,
}

impl<T: Transport> Dispatcher<T> {
    /// Dispatcher for the calling thread.
    ///
    /// Beats as `<executable>-<service>`: ranks are shared only among
    /// dispatchers of the same service.
    pub fn new(store: Store, config: &Config, transport: T) -> Self {
        let actor = Actor::current(service_executable(
            &config.dispatcher.executable,
            transport.service(),
        ));
        Self {
            registry: HeartbeatRegistry::new(store.clone()),
            outbox: MessageOutbox::new(store, config.outbox.clone()),
            transport,
            actor,
            settings: DispatchSettings::from_config(config),
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Reap dead local peers and register this actor.
    pub async fn start(&self) -> Result<Option<Assignment>, DispatchError> {
        let registry = self.registry.clone();
        let actor = self.actor.clone();
        let delay = self.settings.expiration_delay;
        let assignment =
            tokio::task::spawn_blocking(move || registry.sanity_check_and_live(&actor, Some(delay)))
                .await?;
        Ok(assignment)
    }

    /// Remove this actor's heartbeat.
    pub async fn stop(&self) -> Result<usize, DispatchError> {
        let registry = self.registry.clone();
        let actor = self.actor.clone();
        blocking(move || registry.die(&actor, None)).await
    }

    /// Beat, claim one batch from this actor's partition, deliver and archive it.
    pub async fn tick(&self) -> Result<TickReport, DispatchError> {
        let registry = self.registry.clone();
        let actor = self.actor.clone();
        let older_than = self.settings.older_than;
        let assignment = blocking(move || registry.live(&actor, older_than, None)).await?;

        let service = self.transport.service();
        let options = RetrieveOptions {
            bulk: self.settings.bulk,
            partition: Some(assignment.partition()?),
            event_type: self.settings.event_type.clone(),
            lock: true,
            // Routing already keeps email rows on the email service
            old_mode: false,
            service_filter: Some(service),
        };
        let outbox = self.outbox.clone();
        let batch = blocking(move || outbox.retrieve_messages(&options)).await?;
        let retrieved = batch.len();
        if batch.is_empty() {
            return Ok(TickReport {
                assignment,
                retrieved,
                delivered: 0,
            });
        }

        self.transport
            .deliver(&batch)
            .await
            .map_err(|source| DispatchError::Delivery { service, source })?;

        let outbox = self.outbox.clone();
        blocking(move || outbox.delete_messages(&batch)).await?;
        Ok(TickReport {
            assignment,
            retrieved,
            delivered: retrieved,
        })
    }
}

async fn blocking<F, R>(task: F) -> Result<R, DispatchError>
where
    F: FnOnce() -> fleetbeat_core::Result<R> + Send + 'static,
    R: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(task).await??)
}

/// Run `dispatcher` every `interval` until `cancel` fires.
///
/// Tick failures are logged and the loop keeps going; only the start-up
/// and shutdown store calls can end it with an error.
pub async fn run<T: Transport>(
    dispatcher: &Dispatcher<T>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), DispatchError> {
    let service = dispatcher.transport().service();
    info!(
        executable = dispatcher.actor().executable.name(),
        service = service.as_str(),
        "Starting dispatcher (interval: {:?})",
        interval
    );
    if dispatcher.start().await?.is_none() {
        error!("Dispatcher could not register its heartbeat; ticks will retry");
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match dispatcher.tick().await {
                    Ok(report) if report.retrieved > 0 => info!(
                        assign_thread = report.assignment.assign_thread,
                        nr_threads = report.assignment.nr_threads,
                        "Dispatched {} message(s) to {}",
                        report.delivered,
                        service
                    ),
                    Ok(report) => debug!(
                        assign_thread = report.assignment.assign_thread,
                        nr_threads = report.assignment.nr_threads,
                        "No messages for {}",
                        service
                    ),
                    Err(e) => error!("Dispatch tick failed: {e}"),
                }
            }
            _ = cancel.cancelled() => {
                info!("Dispatcher cancelled");
                break;
            }
        }
    }

    let removed = dispatcher.stop().await?;
    info!("Dispatcher stopped ({removed} heartbeat row(s) removed)");
    Ok(())
}
