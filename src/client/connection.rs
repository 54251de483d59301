//! One real-time connection per client, kept alive across drops.
//!
//! A background task owns the socket. It reconnects with capped, jittered
//! exponential backoff and, before reporting itself connected again, re-sends
//! `join-room` for the last room and identity it was asked to join. Frames
//! written while the socket is down wait in the outbound queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::messages::{ClientMessage, ServerMessage};
use crate::room::canonical_room_id;

pub const CONNECTED: &str = "connected";
pub const DISCONNECTED: &str = "disconnected";

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    Disconnected { reason: String },
    Message(ServerMessage),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected => CONNECTED,
            Event::Disconnected { .. } => DISCONNECTED,
            Event::Message(message) => message.event_name(),
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnection budget spent. Call `connect` again to start over.
    Failed,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    listeners: Mutex<HashMap<String, Handler>>,
    last_join: Mutex<Option<(String, String)>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: &Event) {
        let handler = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event.name())
            .cloned();
        match handler {
            Some(handler) => handler(event),
            None => debug!("No listener for {}", event.name()),
        }
    }

    fn last_join(&self) -> Option<(String, String)> {
        self.last_join.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct Transport {
    endpoint: String,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    transport: tokio::sync::Mutex<Option<Transport>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        ConnectionManager {
            config,
            shared: Arc::new(Shared {
                state,
                listeners: Mutex::new(HashMap::new()),
                last_join: Mutex::new(None),
            }),
            transport: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connects, or returns at once if a live connection to `endpoint` exists.
    ///
    /// Fails with [`ConnectionError::Timeout`] if the transport is not ready
    /// within the connect timeout. The background task keeps trying after
    /// that and emits `connected` when it gets through.
    pub async fn connect(&self, endpoint: &str) -> Result<(), ConnectionError> {
        let mut state_rx = self.shared.state.subscribe();
        {
            let mut transport = self.transport.lock().await;
            let live = transport
                .as_ref()
                .is_some_and(|t| t.endpoint == endpoint && !t.task.is_finished());
            if live && self.is_connected() {
                return Ok(());
            }
            if !live {
                if let Some(stale) = transport.take() {
                    debug!("Discarding stale transport to {}", stale.endpoint);
                    stale.task.abort();
                }
                let (outbound, rx) = mpsc::unbounded_channel();
                self.shared.set_state(ConnectionState::Connecting);
                let task = tokio::spawn(run(
                    endpoint.to_string(),
                    self.config.clone(),
                    self.shared.clone(),
                    rx,
                ));
                *transport = Some(Transport {
                    endpoint: endpoint.to_string(),
                    outbound,
                    task,
                });
            }
        }

        let ready = state_rx.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Failed));
        let outcome = tokio::time::timeout(self.config.connect_timeout, ready)
            .await
            .map(|settled| settled.map(|state| *state));
        match outcome {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(_)) => Err(ConnectionError::Exhausted {
                attempts: self.config.reconnect_attempts,
            }),
            Ok(Err(_)) => Err(ConnectionError::NotConnected),
            Err(_) => Err(ConnectionError::Timeout(self.config.connect_timeout)),
        }
    }

    /// Replaces any listener already registered for `event`.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.to_string(), Arc::new(handler));
    }

    pub fn off(&self, event: &str) -> bool {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event)
            .is_some()
    }

    /// Records the room for rejoin and queues the join, even mid-connect.
    pub async fn join_room(&self, room_id: &str, identity: &str) -> Result<(), ConnectionError> {
        *self.shared.last_join.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((room_id.to_string(), identity.to_string()));
        self.send(&ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            identity: identity.to_string(),
        })
        .await
    }

    pub async fn leave_room(&self, room_id: &str, identity: &str) -> Result<(), ConnectionError> {
        {
            let mut last_join = self.shared.last_join.lock().unwrap_or_else(PoisonError::into_inner);
            let leaving = canonical_room_id(room_id);
            if last_join.as_ref().is_some_and(|(room, _)| canonical_room_id(room) == leaving) {
                *last_join = None;
            }
        }
        self.send(&ClientMessage::LeaveRoom {
            room_id: room_id.to_string(),
            identity: identity.to_string(),
        })
        .await
    }

    pub async fn send_message(
        &self,
        room_id: &str,
        text: &str,
        sender: &str,
        message_id: Option<String>,
    ) -> Result<(), ConnectionError> {
        self.send(&ClientMessage::SendMessage {
            room_id: room_id.to_string(),
            message: text.to_string(),
            sender: sender.to_string(),
            message_id,
        })
        .await
    }

    pub async fn request_next(&self, room_id: &str) -> Result<(), ConnectionError> {
        self.send(&ClientMessage::RequestNextMessage {
            room_id: room_id.to_string(),
        })
        .await
    }

    /// Queues a frame. Fails only when there is no transport task at all.
    pub async fn send(&self, message: &ClientMessage) -> Result<(), ConnectionError> {
        let frame = serde_json::to_string(message).map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let transport = self.transport.lock().await;
        let transport = transport.as_ref().ok_or(ConnectionError::NotConnected)?;
        transport
            .outbound
            .send(frame)
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Closes the socket and stops reconnecting.
    pub async fn close(&self) {
        let transport = self.transport.lock().await.take();
        *self.shared.last_join.lock().unwrap_or_else(PoisonError::into_inner) = None;
        if let Some(Transport { outbound, mut task, .. }) = transport {
            drop(outbound);
            let graceful = self.is_connected()
                && tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_ok();
            if !graceful {
                task.abort();
            }
        }
        self.shared.set_state(ConnectionState::Idle);
    }
}

/// Wait before reconnect `attempt` (1-based). `jitter` in `[-1, 1]` scales
/// the configured randomization.
pub fn reconnect_delay(config: &ConnectionConfig, attempt: u32, jitter: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = config
        .reconnect_delay
        .saturating_mul(1 << exponent)
        .min(config.reconnect_delay_max);
    let spread = config.randomization.clamp(0.0, 1.0) * jitter.clamp(-1.0, 1.0);
    base.mul_f64(1.0 + spread).min(config.reconnect_delay_max)
}

enum Exit {
    Closed,
    Lost(String),
}

async fn run(
    endpoint: String,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let mut failures = 0u32;
    let mut unsent: VecDeque<String> = VecDeque::new();

    loop {
        match connect_async(endpoint.as_str()).await {
            Ok((ws, _)) => {
                let (mut sink, mut stream) = ws.split();
                let exit = 'session: {
                    if let Some((room_id, identity)) = shared.last_join() {
                        let rejoin = ClientMessage::JoinRoom { room_id, identity };
                        let frame = match serde_json::to_string(&rejoin) {
                            Ok(frame) => frame,
                            Err(e) => break 'session Exit::Lost(e.to_string()),
                        };
                        if let Err(e) = sink.send(Message::text(frame)).await {
                            break 'session Exit::Lost(e.to_string());
                        }
                    }
                    while let Some(frame) = unsent.pop_front() {
                        if let Err(e) = sink.send(Message::text(frame.clone())).await {
                            unsent.push_front(frame);
                            break 'session Exit::Lost(e.to_string());
                        }
                    }

                    failures = 0;
                    info!("Connected to {}", endpoint);
                    shared.set_state(ConnectionState::Connected);
                    shared.emit(&Event::Connected);

                    loop {
                        tokio::select! {
                            inbound = stream.next() => match inbound {
                                Some(Ok(Message::Text(text))) => {
                                    match serde_json::from_str::<ServerMessage>(text.as_str()) {
                                        Ok(message) => shared.emit(&Event::Message(message)),
                                        Err(e) => debug!("Ignoring unreadable frame: {}", e),
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break 'session Exit::Lost("closed by server".into()),
                                Some(Ok(_)) => {}
                                Some(Err(e)) => break 'session Exit::Lost(e.to_string()),
                            },
                            queued = outbound.recv() => match queued {
                                Some(frame) => {
                                    if let Err(e) = sink.send(Message::text(frame.clone())).await {
                                        unsent.push_back(frame);
                                        break 'session Exit::Lost(e.to_string());
                                    }
                                }
                                None => break 'session Exit::Closed,
                            },
                        }
                    }
                };

                match exit {
                    Exit::Closed => {
                        let _ = sink.close().await;
                        info!("Connection to {} closed", endpoint);
                        return;
                    }
                    Exit::Lost(reason) => {
                        warn!("Lost connection to {}: {}", endpoint, reason);
                        shared.emit(&Event::Disconnected { reason });
                    }
                }
            }
            Err(e) => warn!("Failed to connect to {}: {}", endpoint, e),
        }

        failures += 1;
        if failures > config.reconnect_attempts {
            warn!("Giving up on {} after {} reconnection attempts", endpoint, config.reconnect_attempts);
            shared.emit(&Event::Disconnected {
                reason: ConnectionError::Exhausted {
                    attempts: config.reconnect_attempts,
                }
                .to_string(),
            });
            shared.set_state(ConnectionState::Failed);
            return;
        }
        shared.set_state(ConnectionState::Reconnecting { attempt: failures });
        let jitter = rand::thread_rng().gen_range(-1.0..=1.0);
        tokio::time::sleep(reconnect_delay(&config, failures, jitter)).await;
    }
}
