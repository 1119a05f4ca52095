//! Integration tests for the dispatch loop

use fleetbeat_core::config::Config;
use fleetbeat_core::heartbeat::{Actor, HeartbeatRegistry};
use fleetbeat_core::{DeliveryService, Message, MessageOutbox, NewMessage, RetrieveOptions, Store};
use fleetbeat_daemon::{
    DispatchError, Dispatcher, SpoolTransport, Transport, TransportError, run, service_executable,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Records delivered ids, optionally refusing every batch.
#[derive(Clone)]
struct RecordingTransport {
    service: DeliveryService,
    delivered: Arc<Mutex<Vec<String>>>,
    reject: bool,
}

impl RecordingTransport {
    fn new(service: DeliveryService) -> Self {
        Self {
            service,
            delivered: Arc::new(Mutex::new(Vec::new())),
            reject: false,
        }
    }

    fn rejecting(service: DeliveryService) -> Self {
        Self {
            reject: true,
            ..Self::new(service)
        }
    }

    fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn service(&self) -> DeliveryService {
        self.service
    }

    async fn deliver(&self, batch: &[Message]) -> Result<(), TransportError> {
        if self.reject {
            return Err(TransportError::Rejected {
                message: "broker unavailable".to_string(),
            });
        }
        self.delivered
            .lock()
            .unwrap()
            .extend(batch.iter().map(|m| m.id.clone()));
        Ok(())
    }
}

fn setup(services: &[&str]) -> (TempDir, Store, Config) {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(temp_dir.path().join("coord.db")).unwrap();
    let mut config = Config::default();
    config.outbox.services = services.iter().map(|s| s.to_string()).collect();
    config.dispatcher.executable = "hermes-test".to_string();
    (temp_dir, store, config)
}

fn enqueue(store: &Store, config: &Config, event_type: &str, count: usize) {
    let outbox = MessageOutbox::new(store.clone(), config.outbox.clone());
    let batch: Vec<_> = (0..count)
        .map(|i| NewMessage::new(event_type, json!({"n": i})))
        .collect();
    outbox.add_messages(&batch).unwrap();
}

#[tokio::test]
async fn test_tick_delivers_and_archives() {
    let (_temp_dir, store, config) = setup(&["activemq"]);
    enqueue(&store, &config, "NEW_DID", 5);

    let transport = RecordingTransport::new(DeliveryService::ActiveMq);
    let dispatcher = Dispatcher::new(store.clone(), &config, transport.clone());
    let report = dispatcher.tick().await.unwrap();

    assert_eq!(report.retrieved, 5);
    assert_eq!(report.delivered, 5);
    assert_eq!((report.assignment.assign_thread, report.assignment.nr_threads), (0, 1));
    assert_eq!(transport.delivered().len(), 5);

    let outbox = MessageOutbox::new(store, config.outbox.clone());
    assert_eq!(outbox.pending_count().unwrap(), 0);
    assert_eq!(outbox.list_history().unwrap().len(), 5);
}

#[tokio::test]
async fn test_tick_with_empty_outbox_still_beats() {
    let (_temp_dir, store, config) = setup(&["activemq"]);
    let dispatcher = Dispatcher::new(
        store.clone(),
        &config,
        RecordingTransport::new(DeliveryService::ActiveMq),
    );

    let report = dispatcher.tick().await.unwrap();
    assert_eq!(report.retrieved, 0);

    let registry = HeartbeatRegistry::new(store);
    assert!(registry.last_beat(dispatcher.actor()).unwrap().is_some());
}

#[tokio::test]
async fn test_failed_delivery_leaves_batch_claimed() {
    let (_temp_dir, store, config) = setup(&["activemq"]);
    enqueue(&store, &config, "NEW_DID", 3);

    let dispatcher = Dispatcher::new(
        store.clone(),
        &config,
        RecordingTransport::rejecting(DeliveryService::ActiveMq),
    );
    let err = dispatcher.tick().await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Delivery {
            service: DeliveryService::ActiveMq,
            ..
        }
    ));

    let outbox = MessageOutbox::new(store, config.outbox.clone());
    assert_eq!(outbox.pending_count().unwrap(), 3);
    assert!(outbox.list_history().unwrap().is_empty());
    // Claimed by the failed tick until the claim timeout lapses
    let locking = RetrieveOptions {
        lock: true,
        ..RetrieveOptions::default()
    };
    assert!(outbox.retrieve_messages(&locking).unwrap().is_empty());
}

#[tokio::test]
async fn test_dispatcher_only_drains_its_service() {
    let (_temp_dir, store, config) = setup(&["activemq", "influx", "email"]);
    enqueue(&store, &config, "NEW_DID", 2);
    enqueue(&store, &config, "email", 1);

    let influx = RecordingTransport::new(DeliveryService::Influx);
    let dispatcher = Dispatcher::new(store.clone(), &config, influx.clone());
    assert_eq!(dispatcher.tick().await.unwrap().delivered, 2);

    let email = RecordingTransport::new(DeliveryService::Email);
    let dispatcher = Dispatcher::new(store.clone(), &config, email.clone());
    assert_eq!(dispatcher.tick().await.unwrap().delivered, 1);

    let outbox = MessageOutbox::new(store, config.outbox.clone());
    let left = outbox
        .retrieve_messages(&RetrieveOptions {
            old_mode: false,
            ..RetrieveOptions::default()
        })
        .unwrap();
    assert_eq!(left.len(), 2);
    assert!(left.iter().all(|m| m.services == DeliveryService::ActiveMq));
}

#[tokio::test]
async fn test_peer_dispatchers_split_the_outbox() {
    let (_temp_dir, store, config) = setup(&["activemq"]);
    enqueue(&store, &config, "NEW_DID", 40);

    let transport = RecordingTransport::new(DeliveryService::ActiveMq);
    let exe = service_executable(&config.dispatcher.executable, DeliveryService::ActiveMq);
    let first = Dispatcher::new(store.clone(), &config, transport.clone())
        .with_actor(Actor::new(exe.clone(), "node-a", 1));
    let second = Dispatcher::new(store.clone(), &config, transport.clone())
        .with_actor(Actor::new(exe, "node-b", 1));

    // Both register before either drains, so the first tick already sees two peers
    first.start().await.unwrap();
    second.start().await.unwrap();

    let a = first.tick().await.unwrap();
    let b = second.tick().await.unwrap();
    assert_eq!(a.assignment.nr_threads, 2);
    assert_eq!(b.assignment.nr_threads, 2);
    assert_ne!(a.assignment.assign_thread, b.assignment.assign_thread);
    assert_eq!(a.delivered + b.delivered, 40);

    let delivered = transport.delivered();
    let mut unique = delivered.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), delivered.len());
}

#[tokio::test]
async fn test_new_scopes_heartbeat_to_service() {
    let (_temp_dir, store, config) = setup(&["activemq", "email"]);
    let activemq = Dispatcher::new(
        store.clone(),
        &config,
        RecordingTransport::new(DeliveryService::ActiveMq),
    );
    let email = Dispatcher::new(store, &config, RecordingTransport::new(DeliveryService::Email));

    assert_eq!(activemq.actor().executable.name(), "hermes-test-activemq");
    assert_eq!(email.actor().executable.name(), "hermes-test-email");
}

#[tokio::test]
async fn test_dispatchers_of_different_services_drain_everything() {
    let (_temp_dir, store, config) = setup(&["activemq", "email"]);
    enqueue(&store, &config, "NEW_DID", 40);
    enqueue(&store, &config, "email", 40);

    let activemq_transport = RecordingTransport::new(DeliveryService::ActiveMq);
    let email_transport = RecordingTransport::new(DeliveryService::Email);
    // Separate nodes, as in a real deployment, so each holds its own row
    let activemq = Dispatcher::new(store.clone(), &config, activemq_transport.clone());
    let exe = activemq.actor().executable.clone();
    let activemq = activemq.with_actor(Actor::new(exe, "node-a", 1));
    let email = Dispatcher::new(store.clone(), &config, email_transport.clone());
    let exe = email.actor().executable.clone();
    let email = email.with_actor(Actor::new(exe, "node-b", 1));

    // Both alive at once: neither may count the other as a peer
    activemq.start().await.unwrap();
    email.start().await.unwrap();

    for _ in 0..5 {
        let a = activemq.tick().await.unwrap();
        let e = email.tick().await.unwrap();
        assert_eq!((a.assignment.assign_thread, a.assignment.nr_threads), (0, 1));
        assert_eq!((e.assignment.assign_thread, e.assignment.nr_threads), (0, 1));
    }

    assert_eq!(activemq_transport.delivered().len(), 40);
    assert_eq!(email_transport.delivered().len(), 40);
    let outbox = MessageOutbox::new(store, config.outbox.clone());
    assert_eq!(outbox.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_run_until_cancelled_then_dies() {
    let (temp_dir, store, config) = setup(&["activemq"]);
    enqueue(&store, &config, "NEW_DID", 4);

    let transport = SpoolTransport::new(DeliveryService::ActiveMq, temp_dir.path().join("spool"));
    let spool_path = transport.path();
    let dispatcher = Dispatcher::new(store.clone(), &config, transport);
    let actor = dispatcher.actor().clone();

    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { run(&dispatcher, Duration::from_millis(20), cancel).await })
    };

    let outbox = MessageOutbox::new(store.clone(), config.outbox.clone());
    for _ in 0..200 {
        if outbox.pending_count().unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(outbox.pending_count().unwrap(), 0);
    let lines = std::fs::read_to_string(spool_path).unwrap();
    assert_eq!(lines.lines().count(), 4);

    let registry = HeartbeatRegistry::new(store);
    assert!(registry.last_beat(&actor).unwrap().is_none());
}
