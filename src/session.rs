//! One debugging conversation with an engine.
//!
//! A session is driven exclusively by inbound packets: the first packet on a
//! connection is the handshake (authorization, identity), everything after
//! that is interpreted in the ready state. Sessions created from relayed
//! events ("shadow" sessions) have no engine transport of their own and
//! route commands back through the hub.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::codec::{self, CommandArgs, Packet};
use crate::event::{SessionEvent, SessionState, Status};
use crate::relay::{ClientFrame, RelayLink};
use crate::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Attributes echoed on every response packet that never belong in the
/// relayed argument map.
const RESERVED_RESPONSE_ATTRS: &[&str] = &["command", "transaction_id", "xmlns", "xmlns:xdebug"];

/// Authorization configuration applied during the handshake.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub allowed_addresses: Option<Vec<String>>,
    pub allowed_ide_keys: Option<Vec<String>>,
}

/// A response packet matched to the command that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub name: String,
    pub transaction: u64,
    pub args: IndexMap<String, String>,
    pub data: Option<Value>,
}

/// Pieces recovered from the overloaded handshake idekey field.
///
/// The engine reuses one wire attribute for two logical values: a bare token
/// is a session name, while `KEY,session=NAME` carries the actual idekey
/// (possibly empty) and the session name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdeKeyParts {
    pub ide_key: Option<String>,
    pub session: Option<String>,
}

pub fn parse_ide_key(raw: &str) -> Result<IdeKeyParts> {
    let tokens: Vec<&str> = raw.split(',').collect();
    match tokens.len() {
        1 => Ok(IdeKeyParts {
            ide_key: None,
            session: non_empty(tokens[0]),
        }),
        2 => {
            let session = tokens[1].strip_prefix("session=").ok_or_else(|| {
                Error::protocol(format!(
                    "malformed idekey field `{raw}`: second token must be `session=NAME`"
                ))
            })?;
            Ok(IdeKeyParts {
                ide_key: non_empty(tokens[0]),
                session: non_empty(session),
            })
        }
        _ => Err(Error::protocol(format!(
            "malformed idekey field `{raw}`: too many comma-separated tokens"
        ))),
    }
}

fn non_empty(token: &str) -> Option<String> {
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[derive(Debug, Default)]
struct SessionDetails {
    id: Option<String>,
    name: Option<String>,
    ide_key: Option<String>,
}

#[derive(Debug)]
enum SessionTransport {
    /// Direct engine connection; frames go to the connection's writer task.
    Engine { writer: mpsc::UnboundedSender<Bytes> },
    /// Relay shadow; commands are routed through the hub.
    Relay { link: Arc<RelayLink> },
}

pub struct Session {
    serial: u64,
    options: SessionOptions,
    peer: Option<SocketAddr>,
    transport: SessionTransport,
    state: Mutex<SessionState>,
    details: Mutex<SessionDetails>,
    locked_client: Mutex<Option<String>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<CommandResponse>>>,
    events: broadcast::Sender<SessionEvent>,
    end_emitted: AtomicBool,
}

impl Session {
    pub(crate) fn for_engine(
        serial: u64,
        peer: SocketAddr,
        writer: mpsc::UnboundedSender<Bytes>,
        options: SessionOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            serial,
            options,
            peer: Some(peer),
            transport: SessionTransport::Engine { writer },
            state: Mutex::new(SessionState::Init),
            details: Mutex::new(SessionDetails::default()),
            locked_client: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            events,
            end_emitted: AtomicBool::new(false),
        }
    }

    /// A shadow for a session that lives behind the hub. Born ready: the
    /// remote session already completed its handshake.
    pub(crate) fn for_relay(id: String, name: Option<String>, link: Arc<RelayLink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            serial: 0,
            options: SessionOptions::default(),
            peer: None,
            transport: SessionTransport::Relay { link },
            state: Mutex::new(SessionState::Ready),
            details: Mutex::new(SessionDetails {
                id: Some(id),
                name,
                ide_key: None,
            }),
            locked_client: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            events,
            end_emitted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Option<String> {
        self.details.lock().unwrap().id.clone()
    }

    pub fn name(&self) -> Option<String> {
        self.details.lock().unwrap().name.clone()
    }

    pub fn ide_key(&self) -> Option<String> {
        self.details.lock().unwrap().ide_key.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Restricts this session's relayed events to one relay client.
    pub fn lock_to_client(&self, identity: impl Into<String>) {
        *self.locked_client.lock().unwrap() = Some(identity.into());
    }

    pub fn locked_client(&self) -> Option<String> {
        self.locked_client.lock().unwrap().clone()
    }

    /// Feeds one raw chunk as read from the engine socket.
    pub(crate) fn handle_chunk(&self, chunk: &[u8]) -> Result<()> {
        let packet = codec::parse_chunk(chunk)?;
        self.handle_packet(packet)
    }

    pub(crate) fn handle_packet(&self, packet: Packet) -> Result<()> {
        match self.state() {
            SessionState::Init => self.handle_handshake(packet),
            SessionState::Ready => {
                self.dispatch_ready(packet);
                Ok(())
            }
            state => {
                debug!(?state, "packet after terminal state (ignored)");
                Ok(())
            }
        }
    }

    fn handle_handshake(&self, packet: Packet) -> Result<()> {
        if let Some(allowed) = &self.options.allowed_addresses {
            let peer_ip = self
                .peer
                .map(|peer| peer.ip().to_string())
                .unwrap_or_default();
            if !allowed.iter().any(|address| address == &peer_ip) {
                warn!(peer = %peer_ip, "dropping engine connection from unauthorized address");
                return Err(Error::authorization(peer_ip));
            }
        }

        let raw_ide_key = packet.attribute("idekey").unwrap_or_default();
        let parts = parse_ide_key(raw_ide_key)?;
        let session_name = parts
            .session
            .clone()
            .or_else(|| packet.attribute("session").map(str::to_string));

        if let Some(allowed) = &self.options.allowed_ide_keys {
            let authorized = parts
                .ide_key
                .as_ref()
                .is_some_and(|key| allowed.iter().any(|allowed_key| allowed_key == key));
            if !authorized {
                warn!(idekey = ?parts.ide_key, "dropping engine connection with unauthorized idekey");
                return Err(Error::authorization(raw_ide_key));
            }
        }

        let mut id = format!("session-{}", self.serial);
        let pieces = [
            packet.attribute("appid"),
            session_name.as_deref(),
            packet.attribute("thread"),
            parts.ide_key.as_deref(),
        ];
        for piece in pieces.into_iter().flatten() {
            id.push('-');
            id.push_str(piece);
        }

        {
            let mut details = self.details.lock().unwrap();
            details.id = Some(id.clone());
            details.name = session_name;
            details.ide_key = parts.ide_key;
        }
        *self.state.lock().unwrap() = SessionState::Ready;
        info!(session = %id, "engine session ready");
        self.emit(SessionEvent::Init);
        Ok(())
    }

    fn dispatch_ready(&self, packet: Packet) {
        if let Some(error) = packet.error() {
            self.emit(SessionEvent::EngineError {
                code: error.code.clone(),
                message: error.message.clone(),
            });
            return;
        }

        if let Some(command) = packet.attribute("command") {
            let command = command.to_string();
            match decode_response(&command, &packet) {
                Ok(response) => {
                    self.emit(SessionEvent::CommandResponse {
                        name: response.name.clone(),
                        transaction: response.transaction,
                        args: response.args.clone(),
                        data: response.data.clone(),
                    });
                    self.resolve_pending(response);
                }
                Err(err) => warn!(%err, command = %command, "discarding unparseable response"),
            }
            return;
        }

        if packet.name() == "stream" {
            let data = codec::decode_stream_text(packet.root());
            match packet.attribute("type") {
                Some("stdout") => self.emit(SessionEvent::Stdout { data }),
                Some("stderr") => self.emit(SessionEvent::Stderr { data }),
                other => warn!(stream = ?other, "unrecognized stream type"),
            }
            return;
        }

        if let Some(raw_status) = packet.attribute("status") {
            match raw_status.parse::<Status>() {
                Ok(Status::Stopping) => {
                    self.emit(SessionEvent::Status {
                        status: Status::Stopping,
                    });
                    // Engines linger in `stopping` until told otherwise;
                    // issue the stop so the session always closes out.
                    if let Err(err) = self.send_engine_command("stop", &CommandArgs::new(), None) {
                        warn!(%err, "failed to issue automatic stop command");
                    }
                }
                Ok(Status::Stopped) => self.finish(false),
                Ok(status) => self.emit(SessionEvent::Status { status }),
                Err(err) => warn!(%err, "ignoring packet with unrecognized status"),
            }
            return;
        }

        debug!(packet = %packet.name(), "ignoring unrecognized packet");
    }

    fn send_engine_command(
        &self,
        name: &str,
        args: &CommandArgs,
        data: Option<&[u8]>,
    ) -> Result<u64> {
        let SessionTransport::Engine { writer } = &self.transport else {
            return Err(Error::protocol(
                "shadow sessions route commands through the relay",
            ));
        };
        let (frame, transaction) = codec::format_command(name, args, data);
        writer.send(frame).map_err(|_| Error::TransportClosed)?;
        self.emit(SessionEvent::Command {
            name: name.to_string(),
            args: args.clone(),
            data: data.map(|bytes| BASE64.encode(bytes)),
        });
        Ok(transaction)
    }

    async fn send_relay_command(
        &self,
        link: &Arc<RelayLink>,
        name: &str,
        args: &CommandArgs,
        data: Option<&[u8]>,
    ) -> Result<u64> {
        let session = self
            .id()
            .ok_or_else(|| Error::protocol("shadow session has no id"))?;
        let name = name.to_string();
        let args = args.clone();
        let data = data.map(|bytes| BASE64.encode(bytes));
        let acknowledged = link
            .request(move |seq| ClientFrame::Command {
                seq,
                session,
                name,
                args,
                data,
            })
            .await?;
        acknowledged.ok_or_else(|| Error::protocol("hub could not route the command"))
    }

    /// Issues a command on this session and returns its transaction id.
    ///
    /// On an engine session the id is assigned locally; on a shadow session
    /// it is assigned by the remote session and learned from the hub's
    /// acknowledgement.
    pub async fn send_command(
        &self,
        name: &str,
        args: &CommandArgs,
        data: Option<&[u8]>,
    ) -> Result<u64> {
        if self.state().is_terminal() {
            return Err(Error::SessionClosed);
        }
        match &self.transport {
            SessionTransport::Engine { .. } => self.send_engine_command(name, args, data),
            SessionTransport::Relay { link } => {
                let link = Arc::clone(link);
                self.send_relay_command(&link, name, args, data).await
            }
        }
    }

    /// Issues a command and awaits the correlated response. The session
    /// imposes no timeout; callers that need a deadline must bring their own.
    pub async fn call(
        &self,
        name: &str,
        args: &CommandArgs,
        data: Option<&[u8]>,
    ) -> Result<CommandResponse> {
        if self.state().is_terminal() {
            return Err(Error::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        match &self.transport {
            SessionTransport::Engine { writer } => {
                // Register before the frame hits the wire so an immediate
                // response cannot race the waiter.
                let (frame, transaction) = codec::format_command(name, args, data);
                self.pending.lock().unwrap().insert(transaction, tx);
                if writer.send(frame).is_err() {
                    self.pending.lock().unwrap().remove(&transaction);
                    return Err(Error::TransportClosed);
                }
                self.emit(SessionEvent::Command {
                    name: name.to_string(),
                    args: args.clone(),
                    data: data.map(|bytes| BASE64.encode(bytes)),
                });
            }
            SessionTransport::Relay { link } => {
                let link = Arc::clone(link);
                let transaction = self.send_relay_command(&link, name, args, data).await?;
                self.pending.lock().unwrap().insert(transaction, tx);
            }
        }
        rx.await.map_err(|_| Error::SessionClosed)
    }

    fn resolve_pending(&self, response: CommandResponse) {
        let waiter = self.pending.lock().unwrap().remove(&response.transaction);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                // A response nobody asked about: either fire-and-forget or a
                // duplicate delivery. Never fatal.
                debug!(
                    error = %Error::StaleCallback(response.transaction),
                    "response without a pending command (ignored)"
                );
            }
        }
    }

    /// Applies an event forwarded by the hub to this shadow session.
    pub(crate) fn apply_relay_event(&self, event: SessionEvent) {
        if let SessionEvent::CommandResponse {
            name,
            transaction,
            args,
            data,
        } = &event
        {
            self.resolve_pending(CommandResponse {
                name: name.clone(),
                transaction: *transaction,
                args: args.clone(),
                data: data.clone(),
            });
        }
        match event {
            SessionEvent::End { aborted } => self.finish(aborted),
            other => self.emit(other),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.end_emitted.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(event);
    }

    /// Marks the session terminal and emits the final `End` event exactly
    /// once. Outstanding `call` waiters are cancelled.
    pub(crate) fn finish(&self, aborted: bool) {
        if self.end_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if !state.is_terminal() {
                *state = if aborted {
                    SessionState::Aborted
                } else {
                    SessionState::Ended
                };
            }
        }
        self.pending.lock().unwrap().clear();
        let _ = self.events.send(SessionEvent::End { aborted });
    }
}

fn decode_response(command: &str, packet: &Packet) -> Result<CommandResponse> {
    let transaction = packet
        .attribute("transaction_id")
        .ok_or_else(|| Error::protocol("response packet is missing transaction_id"))?
        .parse::<u64>()
        .map_err(|_| Error::protocol("response packet carries a non-numeric transaction_id"))?;

    let mut args = IndexMap::new();
    for (key, value) in packet.attributes() {
        if !RESERVED_RESPONSE_ATTRS.contains(&key.as_str()) {
            args.insert(key.clone(), value.clone());
        }
    }

    Ok(CommandResponse {
        name: command.to_string(),
        transaction,
        args,
        data: response_payload(command, packet),
    })
}

/// Picks the structured payload of a response. Commands this proxy itself
/// understands get an explicit decoding; anything else falls back to a fixed
/// structural precedence, which is best-effort by design.
fn response_payload(command: &str, packet: &Packet) -> Option<Value> {
    match command {
        "stack_get" => children_json(packet, "stack"),
        "context_names" | "context_get" => {
            children_json(packet, "context").or_else(|| children_json(packet, "property"))
        }
        "property_get" | "property_set" | "property_value" | "eval" => {
            children_json(packet, "property")
        }
        "breakpoint_set" | "breakpoint_get" | "breakpoint_list" => {
            children_json(packet, "breakpoint")
        }
        "source" => packet.text().map(|text| Value::String(text.to_string())),
        "status" | "run" | "step_into" | "step_over" | "step_out" | "stop" | "detach" => None,
        _ => packet
            .child("message")
            .and_then(|message| message.text.clone())
            .map(Value::String)
            .or_else(|| children_json(packet, "stack"))
            .or_else(|| children_json(packet, "context"))
            .or_else(|| children_json(packet, "property"))
            .or_else(|| children_json(packet, "breakpoint"))
            .or_else(|| packet.text().map(|text| Value::String(text.to_string()))),
    }
}

fn children_json(packet: &Packet, name: &str) -> Option<Value> {
    let matches: Vec<Value> = packet
        .children_named(name)
        .map(|element| element.to_json())
        .collect();
    match matches.len() {
        0 => None,
        1 => matches.into_iter().next(),
        _ => Some(Value::Array(matches)),
    }
}
