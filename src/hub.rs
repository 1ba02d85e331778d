//! The relay hub: registers relay clients over a WebSocket endpoint, fans
//! session events out to them, and routes their commands back into the
//! originating sessions.
//!
//! The hub holds only non-owning references to sessions; ownership stays
//! with the engine-acceptor client that produced them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{Client, ClientObserver};
use crate::codec::CommandArgs;
use crate::event::SessionEvent;
use crate::relay::{ClientFrame, HubFrame};
use crate::session::Session;

/// Handle to one attached relay client.
#[derive(Debug, Clone)]
struct RelayClientHandle {
    connection: Uuid,
    outbound: mpsc::UnboundedSender<HubFrame>,
}

struct HubInner {
    engine_hostname: String,
    clients: Mutex<HashMap<String, RelayClientHandle>>,
    sessions: Mutex<HashMap<String, Weak<Session>>>,
    session_hooks: Mutex<Vec<Arc<dyn Fn(&Arc<Session>) + Send + Sync>>>,
}

pub struct ProxyHub {
    namespace: String,
    inner: Arc<HubInner>,
}

impl ProxyHub {
    pub fn new(namespace: impl Into<String>, engine_hostname: impl Into<String>) -> Self {
        let mut namespace = namespace.into();
        if !namespace.starts_with('/') {
            namespace.insert(0, '/');
        }
        Self {
            namespace,
            inner: Arc::new(HubInner {
                engine_hostname: engine_hostname.into(),
                clients: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                session_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Router exposing the hub's WebSocket endpoint under its namespace. The
    /// hosting application serves it; the hub itself never binds a socket.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.namespace, get(relay_upgrade))
            .with_state(Arc::clone(&self.inner))
    }

    /// Registers a policy hook invoked synchronously for every new engine
    /// session, before any of its events are fanned out. Locking a session
    /// to a client inside the hook is therefore race-free.
    pub fn on_session<F>(&self, hook: F)
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        self.inner.session_hooks.lock().unwrap().push(Arc::new(hook));
    }

    /// Subscribes to an engine-acceptor client's sessions. Call before
    /// connecting the client so no session is missed.
    pub fn listen(&self, client: &Client) {
        client.add_observer(Arc::new(HubListener {
            inner: Arc::clone(&self.inner),
        }));
    }

    pub fn relay_clients(&self) -> Vec<String> {
        self.inner.clients.lock().unwrap().keys().cloned().collect()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner.sessions.lock().unwrap().keys().cloned().collect()
    }
}

struct HubListener {
    inner: Arc<HubInner>,
}

impl ClientObserver for HubListener {
    fn on_session(&self, session: &Arc<Session>) {
        let Some(session_id) = session.id() else {
            return;
        };
        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(session_id.clone(), Arc::downgrade(session));

        // Policy window: the application gets to see (and lock) the session
        // before anything is delivered.
        let hooks: Vec<Arc<dyn Fn(&Arc<Session>) + Send + Sync>> =
            self.inner.session_hooks.lock().unwrap().clone();
        for hook in hooks {
            hook(session);
        }

        let events = session.subscribe();
        let inner = Arc::clone(&self.inner);
        let session_ref = Arc::downgrade(session);
        let session_name = session.name();
        tokio::spawn(async move {
            forward_session_events(inner, session_id, session_name, session_ref, events).await;
        });
    }
}

async fn forward_session_events(
    inner: Arc<HubInner>,
    session_id: String,
    session_name: Option<String>,
    session_ref: Weak<Session>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, session = %session_id, "relay fan-out lagging; events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let ended = matches!(event, SessionEvent::End { .. });
        let locked = session_ref
            .upgrade()
            .and_then(|session| session.locked_client());
        inner.fan_out(&session_id, session_name.as_deref(), locked.as_deref(), event);
        if ended {
            break;
        }
    }
    inner.sessions.lock().unwrap().remove(&session_id);
    debug!(session = %session_id, "session deregistered from hub");
}

impl HubInner {
    fn fan_out(
        &self,
        session_id: &str,
        session_name: Option<&str>,
        locked: Option<&str>,
        event: SessionEvent,
    ) {
        let targets: Vec<(String, RelayClientHandle)> = {
            let clients = self.clients.lock().unwrap();
            clients
                .iter()
                .map(|(identity, handle)| (identity.clone(), handle.clone()))
                .collect()
        };
        for (identity, handle) in targets {
            if let Some(owner) = locked {
                if identity != owner {
                    debug!(
                        session = %session_id,
                        client = %identity,
                        "session locked to another client; skipping"
                    );
                    continue;
                }
            }
            let frame = HubFrame::Event {
                session: session_id.to_string(),
                session_name: session_name.map(str::to_string),
                event: event.clone(),
            };
            if handle.outbound.send(frame).is_err() {
                debug!(client = %identity, "relay client channel closed");
            }
        }
    }
}

async fn relay_upgrade(
    State(inner): State<Arc<HubInner>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_relay_connection(socket, inner))
}

async fn handle_relay_connection(socket: WebSocket, inner: Arc<HubInner>) {
    let connection = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<HubFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, "failed to encode hub frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut identity: Option<String> = None;
    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(%err, "relay socket error");
                break;
            }
        };
        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "discarding unparseable relay frame");
                continue;
            }
        };
        match frame {
            ClientFrame::ConnectClient { seq, client } => {
                // Re-registration replaces a stale handle for this identity.
                inner.clients.lock().unwrap().insert(
                    client.clone(),
                    RelayClientHandle {
                        connection,
                        outbound: outbound_tx.clone(),
                    },
                );
                identity = Some(client.clone());
                info!(client = %client, "relay client attached");
                let _ = outbound_tx.send(HubFrame::Ack {
                    seq,
                    transaction: None,
                });
                let _ = outbound_tx.send(HubFrame::Init {
                    engine_hostname: inner.engine_hostname.clone(),
                });
            }
            ClientFrame::DisconnectClient { seq, client } => {
                deregister(&inner, &client, connection);
                if identity.as_deref() == Some(client.as_str()) {
                    identity = None;
                }
                info!(client = %client, "relay client detached");
                let _ = outbound_tx.send(HubFrame::Ack {
                    seq,
                    transaction: None,
                });
            }
            ClientFrame::Command {
                seq,
                session,
                name,
                args,
                data,
            } => {
                let transaction =
                    route_command(&inner, &session, &name, &args, data.as_deref()).await;
                let _ = outbound_tx.send(HubFrame::Ack { seq, transaction });
            }
        }
    }

    if let Some(identity) = identity {
        deregister(&inner, &identity, connection);
        info!(client = %identity, "relay client connection closed");
    }
    writer.abort();
}

fn deregister(inner: &Arc<HubInner>, identity: &str, connection: Uuid) {
    let mut clients = inner.clients.lock().unwrap();
    if clients
        .get(identity)
        .is_some_and(|handle| handle.connection == connection)
    {
        clients.remove(identity);
    }
}

async fn route_command(
    inner: &Arc<HubInner>,
    session_id: &str,
    name: &str,
    args: &CommandArgs,
    data: Option<&str>,
) -> Option<u64> {
    let session = inner
        .sessions
        .lock()
        .unwrap()
        .get(session_id)
        .and_then(Weak::upgrade);
    let Some(session) = session else {
        // The session may have just ended; not an error.
        debug!(session = %session_id, "command for unknown session (ignored)");
        return None;
    };
    let decoded = match data {
        Some(encoded) => match BASE64.decode(encoded) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(%err, "discarding command with invalid payload encoding");
                return None;
            }
        },
        None => None,
    };
    match session.send_command(name, args, decoded.as_deref()).await {
        Ok(transaction) => Some(transaction),
        Err(err) => {
            warn!(%err, session = %session_id, "failed to route relay command");
            None
        }
    }
}
