//! Fan-out of domain events to live subscribers.
//!
//! A single broadcaster task owns the subscriber set. Registrations,
//! unregistrations and events all reach it through channels, so the set needs no
//! lock. Delivery to a subscriber never blocks: a subscriber whose queue is full
//! is dropped and its queue closed.

use crate::event::DomainEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Producer side of the inbound event channel
pub type EventSender = mpsc::Sender<DomainEvent>;

pub type SubscriberId = Uuid;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Event hub is not running")]
    Closed,
}

enum HubCommand {
    Register {
        id: SubscriberId,
        queue: mpsc::Sender<Arc<DomainEvent>>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        id: SubscriberId,
    },
}

/// Build a hub with its inbound event sender and subscription handle
pub fn channel(event_capacity: usize, queue_capacity: usize) -> (EventSender, EventHub, HubHandle) {
    let (events_tx, events_rx) = mpsc::channel(event_capacity.max(1));
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let subscriber_count = Arc::new(AtomicUsize::new(0));

    let hub = EventHub {
        events: events_rx,
        commands: commands_rx,
        subscribers: HashMap::new(),
        subscriber_count: Arc::clone(&subscriber_count),
    };
    let handle = HubHandle {
        commands: commands_tx,
        queue_capacity: queue_capacity.max(1),
        subscriber_count,
    };

    (events_tx, hub, handle)
}

/// The broadcaster
pub struct EventHub {
    events: mpsc::Receiver<DomainEvent>,
    commands: mpsc::Receiver<HubCommand>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<DomainEvent>>>,
    subscriber_count: Arc<AtomicUsize>,
}

impl EventHub {
    /// Run until cancelled or until every event producer is gone
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Event hub started");
        let mut commands_open = true;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },

                event = self.events.recv() => match event {
                    Some(event) => self.broadcast(event),
                    None => break,
                },
            }
        }

        self.subscribers.clear();
        self.subscriber_count.store(0, Ordering::Relaxed);
        info!("Event hub stopped");
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { id, queue, ack } => {
                self.subscribers.insert(id, queue);
                debug!(subscriber = %id, total = self.subscribers.len(), "Subscriber registered");
                let _ = ack.send(());
            }
            HubCommand::Unregister { id } => {
                if self.subscribers.remove(&id).is_some() {
                    debug!(
                        subscriber = %id,
                        total = self.subscribers.len(),
                        "Subscriber unregistered"
                    );
                }
            }
        }
        self.subscriber_count.store(self.subscribers.len(), Ordering::Relaxed);
    }

    fn broadcast(&mut self, event: DomainEvent) {
        let kind = event.kind();
        let event = Arc::new(event);
        metrics::counter!("mirror.hub.events").increment(1);

        self.subscribers.retain(|id, queue| match queue.try_send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = %id, event = kind, "Subscriber queue full, dropping subscriber");
                metrics::counter!("mirror.hub.subscribers.dropped").increment(1);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = %id, "Subscriber gone");
                false
            }
        });
        self.subscriber_count.store(self.subscribers.len(), Ordering::Relaxed);
    }
}

/// Cloneable entry point used to subscribe to the hub
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    queue_capacity: usize,
    subscriber_count: Arc<AtomicUsize>,
}

impl HubHandle {
    /// Register a subscriber with the default queue capacity
    pub async fn subscribe(&self) -> Result<Subscription, HubError> {
        self.subscribe_with_capacity(self.queue_capacity).await
    }

    /// Register a subscriber; returns once the broadcaster has recorded it
    pub async fn subscribe_with_capacity(&self, capacity: usize) -> Result<Subscription, HubError> {
        let id = Uuid::new_v4();
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        let (ack, acked) = oneshot::channel();

        self.commands
            .send(HubCommand::Register { id, queue, ack })
            .await
            .map_err(|_| HubError::Closed)?;
        acked.await.map_err(|_| HubError::Closed)?;

        Ok(Subscription {
            id,
            receiver,
            commands: self.commands.clone(),
        })
    }

    /// Subscribers registered at the last broadcaster step
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Relaxed)
    }
}

/// Receiving side of one subscriber; unregisters itself on drop
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<DomainEvent>>,
    commands: mpsc::Sender<HubCommand>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, `None` once the hub dropped this subscriber
    pub async fn recv(&mut self) -> Option<Arc<DomainEvent>> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.try_send(HubCommand::Unregister { id: self.id });
    }
}
