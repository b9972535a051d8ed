//! In-process transport backed by per-address channels.

use async_trait::async_trait;
use envelope_schema::{Envelope, EnvelopeHeaders};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::{Destination, Subscription, Transport, TransportError, TransportHandler, TransportResult};

type Delivery = (Envelope, EnvelopeHeaders);

struct Registry {
    subscribers: Mutex<HashMap<String, Vec<(usize, mpsc::UnboundedSender<Delivery>)>>>,
}

impl Registry {
    fn remove(&self, address: &str, id: usize) {
        let mut subscribers = self.subscribers.lock();
        if let Some(entries) = subscribers.get_mut(address) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                subscribers.remove(address);
            }
        }
    }
}

/// Channel-based transport for tests and single-process deployments.
/// Delivery is per-subscription FIFO; pause buffers, resume drains.
pub struct InProcessTransport {
    registry: Arc<Registry>,
    next_id: AtomicUsize,
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                subscribers: Mutex::new(HashMap::new()),
            }),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Number of live subscriptions for an address.
    pub fn subscriber_count(&self, address: &str) -> usize {
        self.registry
            .subscribers
            .lock()
            .get(address)
            .map_or(0, Vec::len)
    }
}

struct InProcessSubscription {
    registry: Arc<Registry>,
    address: String,
    id: usize,
    paused: watch::Sender<bool>,
    disposed: Arc<AtomicBool>,
}

impl Subscription for InProcessSubscription {
    fn pause(&self) {
        let _ = self.paused.send(true);
    }

    fn resume(&self) {
        let _ = self.paused.send(false);
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

impl Drop for InProcessSubscription {
    fn drop(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.registry.remove(&self.address, self.id);
        debug!(address = %self.address, "In-process subscription disposed");
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn publish(
        &self,
        envelope: &Envelope,
        headers: &EnvelopeHeaders,
        destination: &Destination,
    ) -> TransportResult<()> {
        let subscribers = self.registry.subscribers.lock();
        if let Some(entries) = subscribers.get(&destination.address) {
            for (_, sender) in entries {
                sender
                    .send((envelope.clone(), headers.clone()))
                    .map_err(|_| {
                        TransportError::PublishFailed("subscriber channel closed".to_string())
                    })?;
            }
        }
        debug!(
            address = %destination.address,
            message_id = %envelope.message_id,
            "Envelope published in-process"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &Destination,
        handler: Arc<dyn TransportHandler>,
    ) -> TransportResult<Box<dyn Subscription>> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Delivery>();
        let (paused_tx, paused_rx) = watch::channel(false);
        let disposed = Arc::new(AtomicBool::new(false));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        self.registry
            .subscribers
            .lock()
            .entry(destination.address.clone())
            .or_default()
            .push((id, sender));

        let task_disposed = disposed.clone();
        tokio::spawn(async move {
            let mut paused = paused_rx;
            while let Some((envelope, headers)) = receiver.recv().await {
                // Hold delivery while paused; the channel keeps buffering.
                while *paused.borrow() {
                    if paused.changed().await.is_err() {
                        return;
                    }
                }
                if task_disposed.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(error) = handler.handle(envelope, headers).await {
                    debug!(error = %error, "In-process handler reported failure");
                }
            }
        });

        Ok(Box::new(InProcessSubscription {
            registry: self.registry.clone(),
            address: destination.address.clone(),
            id,
            paused: paused_tx,
            disposed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct Collector {
        seen: Mutex<Vec<Envelope>>,
        notify: tokio::sync::Notify,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }
    }

    #[async_trait]
    impl TransportHandler for Collector {
        async fn handle(&self, envelope: Envelope, _headers: EnvelopeHeaders) -> Result<(), String> {
            self.seen.lock().push(envelope);
            self.notify.notify_one();
            Ok(())
        }
    }

    fn headers() -> EnvelopeHeaders {
        EnvelopeHeaders::new("ProductCreated, Inventory", "inventory")
    }

    #[tokio::test]
    async fn published_envelopes_reach_subscribers() {
        let transport = InProcessTransport::new();
        let collector = Collector::new();
        let destination = Destination::new("products");
        let _subscription = transport
            .subscribe(&destination, collector.clone())
            .await
            .unwrap();

        let envelope = Envelope::new(json!({"stock": 75}));
        transport
            .publish(&envelope, &headers(), &destination)
            .await
            .unwrap();

        timeout(Duration::from_secs(1), collector.notify.notified())
            .await
            .unwrap();
        let seen = collector.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message_id, envelope.message_id);
    }

    #[tokio::test]
    async fn pause_buffers_and_resume_drains() {
        let transport = InProcessTransport::new();
        let collector = Collector::new();
        let destination = Destination::new("products");
        let subscription = transport
            .subscribe(&destination, collector.clone())
            .await
            .unwrap();

        subscription.pause();
        assert!(subscription.is_paused());
        transport
            .publish(&Envelope::new(json!({"n": 1})), &headers(), &destination)
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;
        assert!(collector.seen.lock().is_empty(), "paused delivery held");

        subscription.resume();
        timeout(Duration::from_secs(1), collector.notify.notified())
            .await
            .unwrap();
        assert_eq!(collector.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn dropping_the_subscription_disposes_it() {
        let transport = InProcessTransport::new();
        let collector = Collector::new();
        let destination = Destination::new("products");
        let subscription = transport
            .subscribe(&destination, collector.clone())
            .await
            .unwrap();
        assert_eq!(transport.subscriber_count("products"), 1);

        drop(subscription);
        assert_eq!(transport.subscriber_count("products"), 0);

        // Publishing after disposal is a quiet no-op.
        transport
            .publish(&Envelope::new(json!({})), &headers(), &destination)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unrelated_addresses_do_not_cross_deliver() {
        let transport = InProcessTransport::new();
        let products = Collector::new();
        let orders = Collector::new();
        let _s1 = transport
            .subscribe(&Destination::new("products"), products.clone())
            .await
            .unwrap();
        let _s2 = transport
            .subscribe(&Destination::new("orders"), orders.clone())
            .await
            .unwrap();

        transport
            .publish(
                &Envelope::new(json!({})),
                &headers(),
                &Destination::new("products"),
            )
            .await
            .unwrap();
        timeout(Duration::from_secs(1), products.notify.notified())
            .await
            .unwrap();
        assert_eq!(products.seen.lock().len(), 1);
        assert!(orders.seen.lock().is_empty());
    }
}
