use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ControlMessage, DisconnectReason, Hub, Subscription};

/// Lifecycle of one subscriber connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closed,
}

/// Tracks a connection's state; `Closed` is terminal
#[derive(Debug)]
pub struct Connection {
    id: Option<u64>,
    state: ConnectionState,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            id: None,
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connecting -> Active once the hub has accepted the subscriber
    pub fn activate(&mut self, id: u64) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.id = Some(id);
        self.state = ConnectionState::Active;
        true
    }

    /// Move to `Closed`. Returns the hub id when this call ended an active
    /// connection; the caller then owns releasing it.
    pub fn close(&mut self, reason: &str) -> Option<u64> {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return None;
        }
        debug!(subscriber = ?self.id, reason, "Connection closed");
        match previous {
            ConnectionState::Active => self.id,
            _ => None,
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive one WebSocket subscriber until either side goes away
pub async fn run_session(socket: WebSocket, hub: Hub) {
    let mut connection = Connection::new();

    let subscription = match hub.register() {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Rejecting WebSocket connection: {}", e);
            let (mut sink, _) = socket.split();
            let _ = send_close(&mut sink, DisconnectReason::Shutdown).await;
            connection.close("hub closed");
            return;
        }
    };

    let id = subscription.id;
    connection.activate(id);
    info!(subscriber = id, "WebSocket subscriber connected");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        sink,
        subscription,
        hub.shutdown_token().child_token(),
    ));
    let mut reader = tokio::spawn(read_loop(stream, hub.clone(), id));

    tokio::select! {
        finished = &mut writer => {
            reader.abort();
            let reason = match finished {
                Ok(Some(reason)) => reason.to_string(),
                _ => "write failed".to_string(),
            };
            // The hub already dropped the subscriber unless the write failed;
            // unregistering again is a no-op
            if let Some(id) = connection.close(&reason) {
                hub.unregister(id);
            }
        }
        _ = &mut reader => {
            // Unregistering closes the queue, which ends the writer
            if let Some(id) = connection.close("peer disconnected") {
                hub.unregister(id);
            }
            let _ = writer.await;
        }
    }

    debug_assert_eq!(connection.state(), ConnectionState::Closed);
    info!(subscriber = id, "WebSocket subscriber disconnected");
}

/// Forward queued frames to `sink` until the hub lets go of the subscriber,
/// then send a close frame carrying the reason. Returns `None` when the peer
/// could not be written to.
pub(crate) async fn write_loop<S>(
    mut sink: S,
    subscription: Subscription,
    shutdown: CancellationToken,
) -> Option<DisconnectReason>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let Subscription {
        id,
        mut queue,
        disconnect,
    } = subscription;

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break DisconnectReason::Shutdown,
            frame = queue.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
                        debug!(subscriber = id, error = %e, "WebSocket write failed");
                        return None;
                    }
                }
                None => break disconnect.await.unwrap_or(DisconnectReason::Unregistered),
            },
        }
    };

    debug!(subscriber = id, code = reason.close_code(), "Closing WebSocket: {}", reason);
    if let Err(e) = send_close(&mut sink, reason).await {
        debug!(subscriber = id, error = %e, "Failed to send close frame");
    }
    Some(reason)
}

async fn read_loop<S, E>(mut stream: S, hub: Hub, id: u64)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match ControlMessage::parse(&text) {
                Some(ControlMessage::Subscribe { topic }) => hub.subscribe(id, topic),
                Some(ControlMessage::Unsubscribe { topic }) => hub.unsubscribe(id, topic),
                None => debug!(subscriber = id, "Ignoring unrecognised message"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(subscriber = id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }
}

async fn send_close<S>(sink: &mut S, reason: DisconnectReason) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    sink.send(Message::Close(Some(CloseFrame {
        code: reason.close_code(),
        reason: reason.to_string().into(),
    })))
    .await
}
