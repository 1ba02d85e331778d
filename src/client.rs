//! Clients produce sessions. An engine-acceptor client listens for direct
//! debugger-engine connections; a relay-consumer client attaches to a proxy
//! hub and mirrors the sessions the hub forwards. Both expose the same
//! observer surface, so code downstream never cares where a session came
//! from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Config;
use crate::event::{SessionEvent, SessionState};
use crate::relay::{ClientFrame, HubFrame, RelayLink};
use crate::session::{Session, SessionOptions};
use crate::{Error, Result};

const READ_BUFFER_SIZE: usize = 8192;

/// Application-owned registry of clients: allocates identities and tracks
/// which clients are currently connected. Identities are stable within the
/// owning process only, not globally unique.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    next_id: AtomicU64,
    connected: Mutex<Vec<String>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_identity(&self) -> String {
        format!("client-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn register(&self, identity: &str) {
        let mut connected = self.connected.lock().unwrap();
        if !connected.iter().any(|existing| existing == identity) {
            connected.push(identity.to_string());
        }
    }

    fn deregister(&self, identity: &str) {
        self.connected
            .lock()
            .unwrap()
            .retain(|existing| existing != identity);
    }

    pub fn connected_clients(&self) -> Vec<String> {
        self.connected.lock().unwrap().clone()
    }
}

/// Where a client's sessions come from.
#[derive(Debug, Clone)]
pub enum SessionSource {
    /// Listen for direct engine connections on a local address.
    EngineAcceptor {
        addr: String,
        options: SessionOptions,
    },
    /// Attach to a proxy hub and consume the sessions it forwards.
    RelayConsumer { endpoint: Url },
}

/// Lifecycle notifications. Callbacks run synchronously on the task that
/// produced them; `on_session` in particular completes before any further
/// packet or relayed event for that session is processed, so an observer may
/// still configure the session (e.g. lock it) without missing anything.
pub trait ClientObserver: Send + Sync {
    fn on_connect(&self, _client: &str) {}
    fn on_session(&self, _session: &Arc<Session>) {}
    fn on_disconnect(&self, _client: &str) {}
}

struct RelayState {
    link: Arc<RelayLink>,
    registered: bool,
}

struct ClientInner {
    identity: String,
    registry: Arc<ClientRegistry>,
    connected: AtomicBool,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    observers: Mutex<Vec<Arc<dyn ClientObserver>>>,
    session_serial: AtomicU64,
    relay: Mutex<Option<RelayState>>,
    bound_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    fn notify_session(&self, session: &Arc<Session>) {
        let observers: Vec<Arc<dyn ClientObserver>> = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer.on_session(session);
        }
    }

    fn notify_disconnect(&self) {
        let observers: Vec<Arc<dyn ClientObserver>> = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer.on_disconnect(&self.identity);
        }
    }

    /// Full-disconnect bookkeeping shared by `disconnect()` and the relay
    /// transport-closed path.
    fn teardown(&self) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(state) = self.relay.lock().unwrap().take() {
            state.link.close();
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.sessions.lock().unwrap().clear();
        self.registry.deregister(&self.identity);
        self.notify_disconnect();
        true
    }
}

pub struct Client {
    source: SessionSource,
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(registry: &Arc<ClientRegistry>, source: SessionSource) -> Self {
        let identity = registry.next_identity();
        Self {
            source,
            inner: Arc::new(ClientInner {
                identity,
                registry: Arc::clone(registry),
                connected: AtomicBool::new(false),
                sessions: Mutex::new(HashMap::new()),
                observers: Mutex::new(Vec::new()),
                session_serial: AtomicU64::new(0),
                relay: Mutex::new(None),
                bound_addr: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Builds a client from configuration: an engine acceptor when an accept
    /// port is configured, a relay consumer when only a relay endpoint is.
    pub fn from_config(registry: &Arc<ClientRegistry>, config: &Config) -> Result<Self> {
        if let Some(addr) = config.engine_addr() {
            return Ok(Self::new(
                registry,
                SessionSource::EngineAcceptor {
                    addr,
                    options: config.session_options(),
                },
            ));
        }
        if let Some(endpoint) = config.relay_endpoint()? {
            return Ok(Self::new(registry, SessionSource::RelayConsumer { endpoint }));
        }
        Err(Error::configuration(
            "neither an engine accept port nor a relay endpoint is configured",
        ))
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// The address the engine acceptor actually bound, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound_addr.lock().unwrap()
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.lock().unwrap().values().cloned().collect()
    }

    pub fn add_observer(&self, observer: Arc<dyn ClientObserver>) {
        self.inner.observers.lock().unwrap().push(observer);
    }

    pub async fn connect(&self) -> Result<()> {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }
        let result = match &self.source {
            SessionSource::EngineAcceptor { addr, options } => {
                self.connect_engine(addr, options.clone()).await
            }
            SessionSource::RelayConsumer { endpoint } => {
                self.connect_relay(endpoint.clone()).await
            }
        };
        if let Err(err) = result {
            self.inner.connected.store(false, Ordering::SeqCst);
            if let Some(state) = self.inner.relay.lock().unwrap().take() {
                state.link.close();
            }
            for task in self.inner.tasks.lock().unwrap().drain(..) {
                task.abort();
            }
            return Err(err);
        }
        self.inner.registry.register(&self.inner.identity);
        let observers: Vec<Arc<dyn ClientObserver>> =
            self.inner.observers.lock().unwrap().clone();
        for observer in observers {
            observer.on_connect(&self.inner.identity);
        }
        Ok(())
    }

    /// Disconnects, tolerating a transport that is already gone. A no-op if
    /// not connected.
    pub async fn disconnect(&self) {
        let link = self
            .inner
            .relay
            .lock()
            .unwrap()
            .as_ref()
            .filter(|state| state.registered)
            .map(|state| Arc::clone(&state.link));
        if self.is_connected() {
            if let Some(link) = link {
                let identity = self.inner.identity.clone();
                if let Err(err) = link
                    .request(move |seq| ClientFrame::DisconnectClient {
                        seq,
                        client: identity,
                    })
                    .await
                {
                    debug!(%err, "disconnect-client handshake skipped");
                }
            }
        }
        self.inner.teardown();
    }

    async fn connect_engine(&self, addr: &str, options: SessionOptions) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        *self.inner.bound_addr.lock().unwrap() = Some(bound);
        info!(addr = %bound, client = %self.inner.identity, "listening for debugger engines");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!(%peer, "engine connection accepted");
                        let inner = Arc::clone(&inner);
                        let options = options.clone();
                        tokio::spawn(async move {
                            run_engine_session(inner, socket, peer, options).await;
                        });
                    }
                    Err(err) => error!(%err, "engine accept failed"),
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    async fn connect_relay(&self, endpoint: Url) -> Result<()> {
        let (stream, _) = connect_async(endpoint.as_str()).await?;
        info!(endpoint = %endpoint, client = %self.inner.identity, "attached to relay hub");
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let link = Arc::new(RelayLink::new(outbound_tx));

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        error!(%err, "failed to encode relay frame");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        let reader_link = Arc::clone(&link);
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => handle_hub_frame(&inner, &reader_link, &text),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(%err, "relay transport error");
                        break;
                    }
                }
            }
            debug!(client = %inner.identity, "relay transport closed");
            inner.teardown();
        });

        *self.inner.relay.lock().unwrap() = Some(RelayState {
            link,
            registered: false,
        });
        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            tasks.push(writer);
            tasks.push(reader);
        }

        self.trigger_connect().await
    }

    /// Performs the `connect-client` handshake with the hub. Idempotent: a
    /// repeated trigger (e.g. after a transport-level reconnect) while the
    /// registration stands is a no-op.
    pub async fn trigger_connect(&self) -> Result<()> {
        let link = {
            let mut relay = self.inner.relay.lock().unwrap();
            match relay.as_mut() {
                Some(state) if !state.registered => {
                    state.registered = true;
                    Arc::clone(&state.link)
                }
                Some(_) => return Ok(()),
                None => return Err(Error::configuration("client has no relay transport")),
            }
        };
        let identity = self.inner.identity.clone();
        match link
            .request(move |seq| ClientFrame::ConnectClient {
                seq,
                client: identity,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                if let Some(state) = self.inner.relay.lock().unwrap().as_mut() {
                    state.registered = false;
                }
                Err(err)
            }
        }
    }
}

async fn run_engine_session(
    inner: Arc<ClientInner>,
    socket: TcpStream,
    peer: SocketAddr,
    options: SessionOptions,
) {
    let (mut read_half, mut write_half) = socket.into_split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Bytes>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = writer_rx.recv().await {
            if let Err(err) = write_half.write_all(&frame).await {
                debug!(%err, "engine write failed");
                break;
            }
        }
    });

    let serial = inner.session_serial.fetch_add(1, Ordering::Relaxed) + 1;
    let session = Arc::new(Session::for_engine(serial, peer, writer_tx, options));

    let mut registered = false;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(%err, %peer, "engine read failed");
                break;
            }
        };
        match session.handle_chunk(&buf[..n]) {
            Ok(()) => {}
            Err(Error::Authorization(_)) => {
                // Silent drop: no reply, no events, nothing registered.
                writer.abort();
                return;
            }
            Err(err) => {
                warn!(%err, %peer, "engine connection terminated");
                break;
            }
        }
        if !registered && session.state() == SessionState::Ready {
            registered = true;
            if let Some(id) = session.id() {
                inner
                    .sessions
                    .lock()
                    .unwrap()
                    .insert(id, Arc::clone(&session));
            }
            // Observers run before the next chunk is read, so a hub hooked
            // up here sees every event that follows the handshake.
            inner.notify_session(&session);
        }
        if session.state().is_terminal() {
            break;
        }
    }

    session.finish(true);
    if registered {
        if let Some(id) = session.id() {
            inner.sessions.lock().unwrap().remove(&id);
        }
    }
    writer.abort();
}

fn handle_hub_frame(inner: &Arc<ClientInner>, link: &Arc<RelayLink>, text: &str) {
    let frame: HubFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, "discarding unparseable hub frame");
            return;
        }
    };
    match frame {
        HubFrame::Ack { seq, transaction } => link.resolve(seq, transaction),
        HubFrame::Init { engine_hostname } => {
            debug!(%engine_hostname, "hub greeting received");
        }
        HubFrame::Event {
            session,
            session_name,
            event,
        } => {
            let existing = inner.sessions.lock().unwrap().get(&session).cloned();
            let target = match existing {
                Some(target) => target,
                None => {
                    let shadow = Arc::new(Session::for_relay(
                        session.clone(),
                        session_name,
                        Arc::clone(link),
                    ));
                    inner
                        .sessions
                        .lock()
                        .unwrap()
                        .insert(session.clone(), Arc::clone(&shadow));
                    inner.notify_session(&shadow);
                    shadow
                }
            };
            let ended = matches!(event, SessionEvent::End { .. });
            target.apply_relay_event(event);
            if ended {
                inner.sessions.lock().unwrap().remove(&session);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CommandArgs;
    use std::time::Duration;
    use tokio::time::sleep;

    fn chunk(xml: &str) -> Vec<u8> {
        let mut out = xml.len().to_string().into_bytes();
        out.push(0);
        out.extend_from_slice(xml.as_bytes());
        out.push(0);
        out
    }

    #[derive(Default)]
    struct Recorder {
        sessions: Mutex<Vec<Arc<Session>>>,
        connects: AtomicU64,
        disconnects: AtomicU64,
    }

    impl ClientObserver for Recorder {
        fn on_connect(&self, _client: &str) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_session(&self, session: &Arc<Session>) {
            self.sessions.lock().unwrap().push(Arc::clone(session));
        }

        fn on_disconnect(&self, _client: &str) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_registry_allocates_distinct_identities() {
        let registry = ClientRegistry::new();
        assert_eq!(registry.next_identity(), "client-1");
        assert_eq!(registry.next_identity(), "client-2");
    }

    #[test]
    fn test_registry_tracks_connections() {
        let registry = ClientRegistry::new();
        registry.register("client-1");
        registry.register("client-1");
        assert_eq!(registry.connected_clients(), vec!["client-1"]);
        registry.deregister("client-1");
        assert!(registry.connected_clients().is_empty());
    }

    #[test]
    fn test_from_config_requires_a_source() {
        let registry = Arc::new(ClientRegistry::new());
        let config = Config {
            engine_port: None,
            relay_port: None,
            ..Config::default()
        };
        let result = Client::from_config(&registry, &config);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_from_config_prefers_engine_acceptor() {
        let registry = Arc::new(ClientRegistry::new());
        let client = Client::from_config(&registry, &Config::default()).unwrap();
        assert!(matches!(
            client.source,
            SessionSource::EngineAcceptor { .. }
        ));
    }

    #[test]
    fn test_from_config_falls_back_to_relay_consumer() {
        let registry = Arc::new(ClientRegistry::new());
        let config = Config {
            engine_port: None,
            ..Config::default()
        };
        let client = Client::from_config(&registry, &config).unwrap();
        assert!(matches!(client.source, SessionSource::RelayConsumer { .. }));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let registry = Arc::new(ClientRegistry::new());
        let client = Client::new(
            &registry,
            SessionSource::EngineAcceptor {
                addr: "127.0.0.1:0".to_string(),
                options: SessionOptions::default(),
            },
        );
        client.connect().await.unwrap();
        assert!(matches!(
            client.connect().await,
            Err(Error::AlreadyConnected)
        ));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let registry = Arc::new(ClientRegistry::new());
        let client = Client::new(
            &registry,
            SessionSource::EngineAcceptor {
                addr: "127.0.0.1:0".to_string(),
                options: SessionOptions::default(),
            },
        );
        client.connect().await.unwrap();
        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected());
        assert!(registry.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn test_engine_acceptor_produces_sessions() {
        let registry = Arc::new(ClientRegistry::new());
        let client = Client::new(
            &registry,
            SessionSource::EngineAcceptor {
                addr: "127.0.0.1:0".to_string(),
                options: SessionOptions::default(),
            },
        );
        let recorder = Arc::new(Recorder::default());
        client.add_observer(Arc::clone(&recorder) as Arc<dyn ClientObserver>);
        client.connect().await.unwrap();
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);

        let addr = client.local_addr().unwrap();
        let mut engine = TcpStream::connect(addr).await.unwrap();
        let init = r#"<?xml version="1.0"?><init appid="7" idekey=",session=S1" thread="1"/>"#;
        engine.write_all(&chunk(init)).await.unwrap();

        wait_until(|| !recorder.sessions.lock().unwrap().is_empty()).await;
        let session = recorder.sessions.lock().unwrap()[0].clone();
        assert_eq!(session.id().as_deref(), Some("session-1-7-S1-1"));
        assert!(client.session("session-1-7-S1-1").is_some());

        // Engine hangs up before a stop: the session aborts and is removed.
        drop(engine);
        wait_until(|| client.sessions().is_empty()).await;
        assert_eq!(session.state(), SessionState::Aborted);

        client.disconnect().await;
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_engine_acceptor_drops_bad_frames_only_for_that_connection() {
        let registry = Arc::new(ClientRegistry::new());
        let client = Client::new(
            &registry,
            SessionSource::EngineAcceptor {
                addr: "127.0.0.1:0".to_string(),
                options: SessionOptions::default(),
            },
        );
        client.connect().await.unwrap();
        let addr = client.local_addr().unwrap();

        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"garbage with no framing").await.unwrap();

        let mut good = TcpStream::connect(addr).await.unwrap();
        let init = r#"<?xml version="1.0"?><init appid="9" idekey="S2"/>"#;
        good.write_all(&chunk(init)).await.unwrap();

        wait_until(|| !client.sessions().is_empty()).await;
        assert!(client.session("session-2-9-S2").is_some() || client.session("session-1-9-S2").is_some());
        client.disconnect().await;
    }

    /// Forwards every event of every session produced by a client into one
    /// channel, subscribing inside `on_session` so nothing is missed.
    struct EventCollector {
        tx: mpsc::UnboundedSender<(String, SessionEvent)>,
    }

    impl ClientObserver for EventCollector {
        fn on_session(&self, session: &Arc<Session>) {
            let mut events = session.subscribe();
            let tx = self.tx.clone();
            let id = session.id().unwrap_or_default();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    let _ = tx.send((id.clone(), event));
                }
            });
        }
    }

    #[tokio::test]
    async fn test_relay_consumer_mirrors_hub_sessions() {
        // An engine acceptor feeding a hub, served over a real WebSocket.
        let registry = Arc::new(ClientRegistry::new());
        let engine_client = Client::new(
            &registry,
            SessionSource::EngineAcceptor {
                addr: "127.0.0.1:0".to_string(),
                options: SessionOptions::default(),
            },
        );
        let hub = crate::hub::ProxyHub::new("/dbgp-proxy", "127.0.0.1");
        hub.listen(&engine_client);
        engine_client.connect().await.unwrap();
        let engine_addr = engine_client.local_addr().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();
        let app = hub.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // A relay-consumer client attached to the hub.
        let endpoint = Url::parse(&format!("ws://{relay_addr}/dbgp-proxy")).unwrap();
        let consumer = Client::new(&registry, SessionSource::RelayConsumer { endpoint });
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        consumer.add_observer(Arc::new(EventCollector { tx: event_tx }));
        consumer.connect().await.unwrap();
        wait_until(|| registry.connected_clients().len() == 2).await;

        // A repeated connect trigger must not double-register.
        consumer.trigger_connect().await.unwrap();

        // An engine session comes up and hits a breakpoint.
        let mut engine = TcpStream::connect(engine_addr).await.unwrap();
        let init = r#"<?xml version="1.0"?><init appid="7" idekey=",session=S1"/>"#;
        engine.write_all(&chunk(init)).await.unwrap();
        wait_until(|| !engine_client.sessions().is_empty()).await;

        sleep(Duration::from_millis(50)).await;
        let status = r#"<?xml version="1.0"?><notify status="break"/>"#;
        engine.write_all(&chunk(status)).await.unwrap();

        let (session_id, event) = event_rx.recv().await.unwrap();
        assert_eq!(session_id, "session-1-7-S1");
        assert_eq!(
            event,
            SessionEvent::Status {
                status: crate::event::Status::Break
            }
        );
        let shadow = consumer.session(&session_id).unwrap();
        assert_eq!(shadow.name().as_deref(), Some("S1"));

        // A command issued on the shadow session travels through the hub to
        // the engine; the response travels all the way back.
        let caller = Arc::clone(&shadow);
        let pending =
            tokio::spawn(async move { caller.call("status", &CommandArgs::new(), None).await });

        let mut wire = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            engine.read_exact(&mut byte).await.unwrap();
            if byte[0] == 0 {
                break;
            }
            wire.push(byte[0]);
        }
        let wire = String::from_utf8(wire).unwrap();
        assert!(wire.starts_with("status -i "));
        let transaction: u64 = wire.rsplit(' ').next().unwrap().parse().unwrap();

        sleep(Duration::from_millis(50)).await;
        let response = format!(
            r#"<?xml version="1.0"?><response command="status" status="starting" reason="ok" transaction_id="{transaction}"/>"#
        );
        engine.write_all(&chunk(&response)).await.unwrap();

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.transaction, transaction);
        assert_eq!(
            response.args.get("status").map(String::as_str),
            Some("starting")
        );

        // The engine stopping removes the shadow from the consumer's map.
        sleep(Duration::from_millis(50)).await;
        let stopped = r#"<?xml version="1.0"?><notify status="stopped"/>"#;
        engine.write_all(&chunk(stopped)).await.unwrap();
        wait_until(|| consumer.sessions().is_empty()).await;
        assert_eq!(shadow.state(), SessionState::Ended);

        consumer.disconnect().await;
        engine_client.disconnect().await;
        wait_until(|| registry.connected_clients().is_empty()).await;
    }

    #[tokio::test]
    async fn test_shadow_session_sends_command_through_link() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let link = Arc::new(RelayLink::new(outbound_tx));
        let shadow = Arc::new(Session::for_relay(
            "session-1-S1".to_string(),
            Some("S1".to_string()),
            Arc::clone(&link),
        ));

        let sender = Arc::clone(&shadow);
        let pending = tokio::spawn(async move {
            sender.send_command("status", &CommandArgs::new(), None).await
        });

        let frame = outbound_rx.recv().await.unwrap();
        let ClientFrame::Command { seq, session, name, .. } = frame else {
            panic!("expected command frame");
        };
        assert_eq!(session, "session-1-S1");
        assert_eq!(name, "status");
        link.resolve(seq, Some(17));
        assert_eq!(pending.await.unwrap().unwrap(), 17);
    }
}
