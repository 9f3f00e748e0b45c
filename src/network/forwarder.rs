//! Event forwarder - republishes manager events on per-connection topics
//!
//! Managers push into an unbounded [`EventSink`]; the forwarder task drains it
//! and fans each event out to the `<kind>:<connection-id>` topic. Topics are
//! bounded broadcast channels created on first use, so a subscriber that
//! attaches after `connect` resolves still sees everything that follows, and
//! a subscriber going away never reaches back into the manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};

use crate::messages::{EventKind, ManagerEvent};
use crate::network::lifecycle::EventSink;

struct Topics {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<ManagerEvent>>>,
    /// Every event, for the stdio boundary
    firehose: broadcast::Sender<ManagerEvent>,
}

impl Topics {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<ManagerEvent>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: ManagerEvent) {
        let channel = event.channel();
        {
            let mut channels = self.channels();
            if let Some(tx) = channels.get(&channel) {
                if tx.send(event.clone()).is_err() {
                    // Every subscriber is gone
                    channels.remove(&channel);
                }
            }
        }
        let _ = self.firehose.send(event);
    }

    fn prune(&self, channel: &str) {
        let mut channels = self.channels();
        if channels
            .get(channel)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(channel);
        }
    }
}

/// Cloneable handle for subscribing to topics
#[derive(Clone)]
pub struct EventForwarder {
    topics: Arc<Topics>,
}

impl EventForwarder {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (firehose, _) = broadcast::channel(capacity);
        EventForwarder {
            topics: Arc::new(Topics {
                capacity,
                channels: Mutex::new(HashMap::new()),
                firehose,
            }),
        }
    }

    /// Create the manager-side sink and spawn the forwarding task
    pub fn start(&self) -> EventSink {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().run(rx));
        tx
    }

    /// Drain manager events until every sink is dropped
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<ManagerEvent>) {
        while let Some(event) = rx.recv().await {
            tracing::trace!(channel = %event.channel(), "Forwarding event");
            self.topics.publish(event);
        }
        tracing::info!("Event forwarder stopped");
    }

    /// Subscribe to one topic by name
    pub fn subscribe_channel(&self, channel: impl Into<String>) -> Subscription {
        let channel = channel.into();
        let rx = self
            .topics
            .channels()
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(self.topics.capacity).0)
            .subscribe();
        Subscription {
            channel,
            rx: Some(rx),
            topics: Arc::clone(&self.topics),
        }
    }

    pub fn subscribe(&self, kind: EventKind, connection_id: &str) -> Subscription {
        self.subscribe_channel(kind.channel(connection_id))
    }

    /// Receive every event on every topic
    pub fn subscribe_all(&self) -> broadcast::Receiver<ManagerEvent> {
        self.topics.firehose.subscribe()
    }

    /// Number of topics with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.topics.channels().len()
    }
}

/// One subscriber on one topic; unsubscribes on drop
pub struct Subscription {
    channel: String,
    rx: Option<broadcast::Receiver<ManagerEvent>>,
    topics: Arc<Topics>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next event, or `None` once unsubscribed or the forwarder is gone.
    /// Lagging receivers skip what they missed.
    pub async fn recv(&mut self) -> Option<ManagerEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(channel = %self.channel, skipped = n, "Subscriber lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<ManagerEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.rx.take().is_some() {
            self.topics.prune(&self.channel);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
