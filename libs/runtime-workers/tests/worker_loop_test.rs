//! Worker loop tests over the in-memory store and in-process transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use coordination_store::{
    InstanceIdentity, MemoryWorkStore, MessageAssociation, NewOutboxMessage, PerspectiveWork,
    WorkStore,
};
use envelope_schema::{Envelope, EnvelopeHeaders};
use runtime_workers::{
    ConsumerBinding, PerspectiveRunner, PerspectiveWorker, PublisherWorker, RunnerRegistry,
    TransportConsumerWorker, WorkerConfig,
};
use transport_core::{Destination, InProcessTransport, Transport, TransportHandler};
use work_coordinator::{CoordinatorConfig, WorkCoordinator};

fn coordinator(store: Arc<MemoryWorkStore>, service: &str) -> Arc<WorkCoordinator> {
    Arc::new(WorkCoordinator::new(
        store,
        InstanceIdentity::for_process(service),
        CoordinatorConfig {
            lease_duration: Duration::from_secs(5),
            ..Default::default()
        },
    ))
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

fn event_message(stream_id: Uuid, event_type: &str, payload: serde_json::Value) -> NewOutboxMessage {
    let mut envelope = Envelope::new(payload);
    envelope.push_hop(
        envelope_schema::Hop::current("test/host/1", chrono::Utc::now())
            .with_stream_key(stream_id.to_string()),
    );
    NewOutboxMessage {
        message_id: envelope.message_id,
        destination: "products".to_string(),
        event_type: event_type.to_string(),
        envelope_type: event_type.to_string(),
        envelope: serde_json::to_value(&envelope).unwrap(),
        metadata: json!({"aggregate_type": "product"}),
        stream_id,
        partition_number: 0,
        is_event: true,
    }
}

struct CollectingHandler {
    seen: Mutex<Vec<Envelope>>,
    notify: tokio::sync::Notify,
}

#[async_trait]
impl TransportHandler for CollectingHandler {
    async fn handle(&self, envelope: Envelope, _headers: EnvelopeHeaders) -> Result<(), String> {
        self.seen.lock().push(envelope);
        self.notify.notify_one();
        Ok(())
    }
}

#[tokio::test]
async fn publisher_claims_publishes_and_completes() {
    let store = Arc::new(MemoryWorkStore::new());
    let coordinator = coordinator(store.clone(), "publisher-test");
    let transport = Arc::new(InProcessTransport::new());

    let handler = Arc::new(CollectingHandler {
        seen: Mutex::new(Vec::new()),
        notify: tokio::sync::Notify::new(),
    });
    let _subscription = transport
        .subscribe(&Destination::new("products"), handler.clone())
        .await
        .unwrap();

    let stream = Uuid::now_v7();
    let message = event_message(stream, "ProductCreated, Inventory", json!({"stock": 75}));
    let message_id = message.message_id;
    coordinator.enqueue_outbox(message);

    let worker = Arc::new(PublisherWorker::new(
        coordinator.clone(),
        transport.clone() as Arc<dyn Transport>,
        worker_config(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    // The envelope reaches the transport.
    timeout(Duration::from_secs(2), handler.notify.notified())
        .await
        .expect("publish within deadline");
    assert_eq!(handler.seen.lock()[0].message_id, message_id);

    // The completion lands on a following cycle and the worker goes idle.
    timeout(Duration::from_secs(2), async {
        loop {
            let row = store.outbox_message(message_id).await.unwrap().unwrap();
            if row.status & 4 != 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("completion within deadline");

    timeout(Duration::from_secs(2), async {
        while !worker.is_idle() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("idle after empty polls");

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(2), run).await.unwrap().unwrap();

    // The claimed event also landed in the event store.
    let events = store.load_events(stream).await.unwrap();
    assert_eq!(events.len(), 1);
}

struct AppendingRunner {
    applied: Mutex<Vec<(String, i64)>>,
}

#[async_trait]
impl PerspectiveRunner for AppendingRunner {
    async fn run(&self, work: &PerspectiveWork) -> Result<(), String> {
        self.applied
            .lock()
            .push((work.stream_id.to_string(), work.version));
        Ok(())
    }
}

#[tokio::test]
async fn perspective_worker_processes_in_version_order_and_checkpoints() {
    let store = Arc::new(MemoryWorkStore::new());
    store
        .register_associations(&[MessageAssociation::perspective(
            "ProductUpdated, Inventory",
            "inventory-product",
            "inventory",
        )])
        .await
        .unwrap();

    let publisher_side = coordinator(store.clone(), "producer");
    let stream = Uuid::now_v7();
    for n in 0..3 {
        publisher_side.enqueue_outbox(event_message(
            stream,
            "ProductUpdated, Inventory",
            json!({"n": n}),
        ));
    }
    // Insert and claim the rows, then persist the events with a drain so the
    // producer does not claim the perspective work for itself.
    publisher_side
        .flush(work_coordinator::FlushMode::Immediate, chrono::Utc::now())
        .await
        .unwrap();
    publisher_side.drain(chrono::Utc::now()).await.unwrap();

    let runner = Arc::new(AppendingRunner {
        applied: Mutex::new(Vec::new()),
    });
    let runners = RunnerRegistry::builder()
        .runner("inventory-product", runner.clone())
        .build();
    let worker = Arc::new(PerspectiveWorker::new(
        coordinator(store.clone(), "perspectives"),
        runners,
        worker_config(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    timeout(Duration::from_secs(3), async {
        loop {
            if runner.applied.lock().len() == 3 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all events processed");

    let applied = runner.applied.lock().clone();
    assert_eq!(
        applied,
        vec![
            (stream.to_string(), 1),
            (stream.to_string(), 2),
            (stream.to_string(), 3)
        ],
        "strict version order"
    );

    // Checkpoint advanced to the final event.
    let events = store.load_events(stream).await.unwrap();
    timeout(Duration::from_secs(2), async {
        loop {
            let checkpoint = store
                .checkpoint(stream, "inventory-product")
                .await
                .unwrap()
                .unwrap();
            if checkpoint.last_event_id == Some(events[2].event_id) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("checkpoint advanced");

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(3), run).await.unwrap().unwrap();
}

#[tokio::test]
async fn consumer_stores_inbound_events_through_the_batch() {
    let store = Arc::new(MemoryWorkStore::new());
    let transport = Arc::new(InProcessTransport::new());
    let destination = Destination::new("products");
    let consumer_coordinator = coordinator(store.clone(), "consumer");

    let worker = Arc::new(TransportConsumerWorker::new(
        consumer_coordinator,
        Arc::new(message_dispatch::ReceptorRegistry::default()),
        store.clone() as Arc<dyn WorkStore>,
        vec![ConsumerBinding {
            transport: transport.clone() as Arc<dyn Transport>,
            destination: destination.clone(),
        }],
        worker_config(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    // Give the worker a beat to subscribe, then publish an inbound event.
    sleep(Duration::from_millis(50)).await;
    let stream = Uuid::now_v7();
    let mut envelope = Envelope::new(json!({"stock": 75}));
    envelope.push_hop(
        envelope_schema::Hop::current("remote/host/9", chrono::Utc::now())
            .with_stream_key(stream.to_string())
            .with_metadata(json!({"aggregate_type": "product"})),
    );
    let headers = EnvelopeHeaders::new("ProductCreated, Inventory", "remote-service");
    transport
        .publish(&envelope, &headers, &destination)
        .await
        .unwrap();

    // The event lands in the store and the inbox row is processed.
    timeout(Duration::from_secs(3), async {
        loop {
            let events = store.load_events(stream).await.unwrap();
            if events.len() == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("inbound event stored");

    timeout(Duration::from_secs(3), async {
        loop {
            if let Some(row) = store.inbox_message(envelope.message_id).await.unwrap() {
                if row.status & 2 != 0 {
                    break;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("inbox row processed");

    // A duplicate delivery never produces a second event.
    transport
        .publish(&envelope, &headers, &destination)
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(store.load_events(stream).await.unwrap().len(), 1);

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(3), run).await.unwrap().unwrap();
}
