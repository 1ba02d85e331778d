//! Relay wire protocol: JSON frames exchanged between the hub and its relay
//! clients over a WebSocket, plus the correlation machinery for the acked
//! client-to-hub requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::event::SessionEvent;
use crate::{Error, Result};

/// Frames a relay client sends to the hub. Every frame carries a `seq` the
/// hub echoes back in its acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientFrame {
    ConnectClient {
        seq: u64,
        client: String,
    },
    DisconnectClient {
        seq: u64,
        client: String,
    },
    Command {
        seq: u64,
        session: String,
        name: String,
        args: IndexMap<String, String>,
        /// Base64-encoded command payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
}

/// Frames the hub sends to a relay client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HubFrame {
    /// Acknowledges a client frame; for `command` frames, carries the
    /// transaction id assigned by the target session.
    Ack {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction: Option<u64>,
    },
    /// Greeting sent after a client registers.
    Init { engine_hostname: String },
    /// A session event fanned out by the hub. The event itself is flattened,
    /// so its `type` tag sits next to the session fields.
    Event {
        session: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        #[serde(flatten)]
        event: SessionEvent,
    },
}

/// One relay consumer's connection to the hub: an outbound frame channel plus
/// the pending acknowledgements keyed by `seq`.
#[derive(Debug)]
pub(crate) struct RelayLink {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Option<u64>>>>,
    next_seq: AtomicU64,
}

impl RelayLink {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<ClientFrame>) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Sends one frame and awaits the hub's acknowledgement for it.
    pub(crate) async fn request<F>(&self, build: F) -> Result<Option<u64>>
    where
        F: FnOnce(u64) -> ClientFrame,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(seq, tx);
        if self.outbound.send(build(seq)).is_err() {
            self.pending.lock().unwrap().remove(&seq);
            return Err(Error::TransportClosed);
        }
        rx.await.map_err(|_| Error::TransportClosed)
    }

    /// Resolves a pending request with the transaction id the hub returned.
    pub(crate) fn resolve(&self, seq: u64, transaction: Option<u64>) {
        match self.pending.lock().unwrap().remove(&seq) {
            Some(tx) => {
                let _ = tx.send(transaction);
            }
            None => debug!(seq, "acknowledgement for unknown request (ignored)"),
        }
    }

    /// Drops all pending requests, failing their waiters.
    pub(crate) fn close(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Status;

    #[test]
    fn test_client_frame_round_trip() {
        let frame = ClientFrame::Command {
            seq: 3,
            session: "session-1-app".to_string(),
            name: "status".to_string(),
            args: IndexMap::new(),
            data: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""kind":"command""#));
        let back: ClientFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_connect_client_wire_shape() {
        let frame = ClientFrame::ConnectClient {
            seq: 1,
            client: "client-1".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["kind"], "connect-client");
        assert_eq!(json["client"], "client-1");
    }

    #[test]
    fn test_event_frame_flattens_session_event() {
        let frame = HubFrame::Event {
            session: "session-1".to_string(),
            session_name: Some("S1".to_string()),
            event: SessionEvent::Status {
                status: Status::Break,
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["kind"], "event");
        assert_eq!(json["session"], "session-1");
        assert_eq!(json["session_name"], "S1");
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "break");

        let back: HubFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_ack_frame_omits_missing_transaction() {
        let json = serde_json::to_value(&HubFrame::Ack {
            seq: 9,
            transaction: None,
        })
        .unwrap();
        assert!(json.get("transaction").is_none());
    }

    #[tokio::test]
    async fn test_link_request_resolves_on_ack() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = std::sync::Arc::new(RelayLink::new(tx));

        let requester = std::sync::Arc::clone(&link);
        let pending = tokio::spawn(async move {
            requester
                .request(|seq| ClientFrame::ConnectClient {
                    seq,
                    client: "client-1".to_string(),
                })
                .await
        });

        let sent = rx.recv().await.unwrap();
        let ClientFrame::ConnectClient { seq, .. } = sent else {
            panic!("expected connect-client frame");
        };
        link.resolve(seq, Some(42));
        assert_eq!(pending.await.unwrap().unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_link_request_fails_when_outbound_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let link = RelayLink::new(tx);
        let result = link
            .request(|seq| ClientFrame::ConnectClient {
                seq,
                client: "client-1".to_string(),
            })
            .await;
        assert!(matches!(result, Err(Error::TransportClosed)));
    }

    #[test]
    fn test_resolve_unknown_seq_is_a_no_op() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = RelayLink::new(tx);
        link.resolve(99, Some(1));
    }
}
