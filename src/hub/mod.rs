//! In-process fan-out of ingestion events to live subscribers.
//!
//! All hub state lives in a single coordinator task. Handles talk to it over
//! an unbounded command channel, so [`Hub::broadcast`] never waits on a
//! subscriber. Each subscriber owns a bounded outbound queue; when a queue is
//! full at delivery time that subscriber alone is dropped.

mod events;
mod session;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub use events::{BlockEvent, BroadcastEvent, ControlMessage, StatsEvent, TransactionEvent};
pub use session::{run_session, Connection, ConnectionState};

/// Serialized event as it sits in a subscriber queue
pub type Frame = Arc<str>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    #[error("broadcast hub has shut down")]
    Closed,
}

/// Why the hub let go of a subscriber
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    #[error("subscriber queue overflowed")]
    SubscriberBackpressure,

    #[error("subscriber unregistered")]
    Unregistered,

    #[error("subscriber stopped receiving")]
    ReceiverClosed,

    #[error("hub shutting down")]
    Shutdown,
}

impl DisconnectReason {
    /// WebSocket close code sent to the peer
    pub fn close_code(&self) -> u16 {
        match self {
            DisconnectReason::SubscriberBackpressure => 1008,
            DisconnectReason::Shutdown => 1001,
            DisconnectReason::Unregistered | DisconnectReason::ReceiverClosed => 1000,
        }
    }
}

/// Receiving end handed to a registered subscriber
pub struct Subscription {
    pub id: u64,
    pub queue: mpsc::Receiver<Frame>,
    /// Resolves once the hub drops this subscriber
    pub disconnect: oneshot::Receiver<DisconnectReason>,
}

enum HubCommand {
    Register {
        id: u64,
        queue: mpsc::Sender<Frame>,
        disconnect: oneshot::Sender<DisconnectReason>,
    },
    Unregister(u64),
    Subscribe(u64, String),
    Unsubscribe(u64, String),
    Broadcast(BroadcastEvent),
    ClientCount(oneshot::Sender<usize>),
    Shutdown,
}

/// Cloneable handle to the hub coordinator
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<HubCommand>,
    shutdown: CancellationToken,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl Hub {
    /// Spawn the coordinator task and return a handle to it
    pub fn start(queue_capacity: usize) -> (Self, JoinHandle<()>) {
        let (commands, inbox) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let coordinator = Coordinator {
            subscribers: HashMap::new(),
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(coordinator.run(inbox));
        info!("Broadcast hub started: queue_capacity={}", queue_capacity);

        let hub = Self {
            commands,
            shutdown,
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity: queue_capacity.max(1),
        };
        (hub, handle)
    }

    /// Add a subscriber with an empty topic set (receives every event)
    pub fn register(&self) -> Result<Subscription, HubError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        let (disconnect_tx, disconnect_rx) = oneshot::channel();

        self.send(HubCommand::Register {
            id,
            queue: queue_tx,
            disconnect: disconnect_tx,
        })?;

        Ok(Subscription {
            id,
            queue: queue_rx,
            disconnect: disconnect_rx,
        })
    }

    pub fn unregister(&self, id: u64) {
        let _ = self.send(HubCommand::Unregister(id));
    }

    pub fn subscribe(&self, id: u64, topic: impl Into<String>) {
        let _ = self.send(HubCommand::Subscribe(id, topic.into()));
    }

    pub fn unsubscribe(&self, id: u64, topic: impl Into<String>) {
        let _ = self.send(HubCommand::Unsubscribe(id, topic.into()));
    }

    /// Queue an event for every interested subscriber. Never blocks and never
    /// fails from the producer's point of view.
    pub fn broadcast(&self, event: BroadcastEvent) {
        if self.send(HubCommand::Broadcast(event)).is_err() {
            trace!("Dropping broadcast, hub is closed");
        }
    }

    /// Number of registered subscribers; zero once the hub has stopped
    pub async fn client_count(&self) -> usize {
        let (reply, count) = oneshot::channel();
        if self.send(HubCommand::ClientCount(reply)).is_err() {
            return 0;
        }
        count.await.unwrap_or(0)
    }

    /// Close every subscriber with "going away" and stop the coordinator
    pub fn shutdown(&self) {
        if self.send(HubCommand::Shutdown).is_err() {
            self.shutdown.cancel();
        }
    }

    /// Cancelled once the hub has shut down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).map_err(|_| HubError::Closed)
    }
}

struct Subscriber {
    queue: mpsc::Sender<Frame>,
    topics: HashSet<String>,
    disconnect: oneshot::Sender<DisconnectReason>,
}

impl Subscriber {
    fn wants(&self, topic: &str) -> bool {
        self.topics.is_empty() || self.topics.contains(topic)
    }
}

struct Coordinator {
    subscribers: HashMap<u64, Subscriber>,
    shutdown: CancellationToken,
}

impl Coordinator {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = inbox.recv().await {
            match command {
                HubCommand::Register {
                    id,
                    queue,
                    disconnect,
                } => {
                    self.subscribers.insert(
                        id,
                        Subscriber {
                            queue,
                            topics: HashSet::new(),
                            disconnect,
                        },
                    );
                    debug!(subscriber = id, total = self.subscribers.len(), "Subscriber registered");
                }
                HubCommand::Unregister(id) => self.drop_subscriber(id, DisconnectReason::Unregistered),
                HubCommand::Subscribe(id, topic) => {
                    if let Some(subscriber) = self.subscribers.get_mut(&id) {
                        debug!(subscriber = id, topic = %topic, "Subscribed");
                        subscriber.topics.insert(topic);
                    }
                }
                HubCommand::Unsubscribe(id, topic) => {
                    if let Some(subscriber) = self.subscribers.get_mut(&id) {
                        debug!(subscriber = id, topic = %topic, "Unsubscribed");
                        subscriber.topics.remove(&topic);
                    }
                }
                HubCommand::Broadcast(event) => self.deliver(&event),
                HubCommand::ClientCount(reply) => {
                    let _ = reply.send(self.subscribers.len());
                }
                HubCommand::Shutdown => break,
            }
        }

        let ids: Vec<u64> = self.subscribers.keys().copied().collect();
        for id in ids {
            self.drop_subscriber(id, DisconnectReason::Shutdown);
        }
        self.shutdown.cancel();
        info!("Broadcast hub stopped");
    }

    fn deliver(&mut self, event: &BroadcastEvent) {
        let frame: Frame = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.topic(), e);
                return;
            }
        };

        let topic = event.topic();
        let mut dropped = Vec::new();
        for (id, subscriber) in &self.subscribers {
            if !subscriber.wants(topic) {
                continue;
            }
            match subscriber.queue.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped.push((*id, DisconnectReason::SubscriberBackpressure))
                }
                Err(TrySendError::Closed(_)) => dropped.push((*id, DisconnectReason::ReceiverClosed)),
            }
        }

        for (id, reason) in dropped {
            self.drop_subscriber(id, reason);
        }
        trace!(topic, subscribers = self.subscribers.len(), "Event delivered");
    }

    fn drop_subscriber(&mut self, id: u64, reason: DisconnectReason) {
        let Some(subscriber) = self.subscribers.remove(&id) else {
            return;
        };
        match reason {
            DisconnectReason::SubscriberBackpressure => {
                warn!(subscriber = id, "Disconnecting slow subscriber: {}", reason)
            }
            _ => debug!(subscriber = id, "Subscriber removed: {}", reason),
        }
        // Reason first, so it is waiting by the time the queue reports closed
        let _ = subscriber.disconnect.send(reason);
        drop(subscriber.queue);
    }
}
