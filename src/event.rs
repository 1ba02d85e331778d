//! Session lifecycle events and states.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Engine execution status carried by status packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Starting,
    Running,
    Break,
    Stopping,
    Stopped,
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "starting" => Ok(Status::Starting),
            "running" => Ok(Status::Running),
            "break" => Ok(Status::Break),
            "stopping" => Ok(Status::Stopping),
            "stopped" => Ok(Status::Stopped),
            other => Err(Error::protocol(format!("unrecognized engine status `{other}`"))),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Break => "break",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle state of a session. `Init` until the handshake succeeds,
/// `Ready` afterwards; `Ended` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Ready,
    Ended,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Aborted)
    }
}

/// Everything a session reports to its subscribers. The serialized form is
/// the payload of relayed `event` frames, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    /// The handshake packet was accepted.
    Init,
    /// The engine reported an execution status.
    Status { status: Status },
    /// Program output captured from the engine.
    Stdout { data: String },
    Stderr { data: String },
    /// A response packet correlated to an issued command.
    CommandResponse {
        name: String,
        transaction: u64,
        args: IndexMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Local echo of a command issued on this session.
    Command {
        name: String,
        args: IndexMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    /// The engine reported a protocol-level error.
    #[serde(rename = "error")]
    EngineError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// The session reached a terminal state. Emitted exactly once.
    End { aborted: bool },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Init => "init",
            SessionEvent::Status { .. } => "status",
            SessionEvent::Stdout { .. } => "stdout",
            SessionEvent::Stderr { .. } => "stderr",
            SessionEvent::CommandResponse { .. } => "command-response",
            SessionEvent::Command { .. } => "command",
            SessionEvent::EngineError { .. } => "error",
            SessionEvent::End { .. } => "end",
        }
    }
}
