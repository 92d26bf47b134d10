//! Local control socket: one JSON object per line in each direction.
//!
//! ```text
//! → {"cmd":"status"}     ← {"reply":"status", "pid":…, "sessions":…, …}
//! → {"cmd":"stop"}       ← {"reply":"stopping"}
//! → anything else        ← {"reply":"rejected","message":"…"}
//! ```

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, ServerError};
use crate::paths::control_socket_path;
use crate::registry::ProjectStatus;
use crate::relay::RelayCounters;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ControlReply {
    Status(StatusReport),
    Stopping,
    Rejected { message: String },
}

/// Runtime snapshot returned by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub pid: u32,
    pub listen: String,
    pub protocol: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub sessions: usize,
    pub projects: Vec<ProjectStatus>,
    pub relay: RelayCounters,
}

/// Status of the server whose control socket lives under `home`.
pub fn query_status(home: &Path) -> Result<StatusReport, ServerError> {
    match exchange(home, ControlRequest::Status)? {
        ControlReply::Status(report) => Ok(report),
        other => Err(unexpected(other)),
    }
}

/// Ask the server under `home` to shut down gracefully.
pub fn request_stop(home: &Path) -> Result<(), ServerError> {
    match exchange(home, ControlRequest::Stop)? {
        ControlReply::Stopping => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn exchange(home: &Path, request: ControlRequest) -> Result<ControlReply, ServerError> {
    let socket = control_socket_path(home);
    let mut stream = UnixStream::connect(&socket).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => ServerError::NotRunning {
            socket: socket.clone(),
        },
        _ => io_err(&socket, err),
    })?;
    stream
        .set_read_timeout(Some(REPLY_TIMEOUT))
        .map_err(|e| io_err(&socket, e))?;

    let mut line = serde_json::to_vec(&request)?;
    line.push(b'\n');
    stream.write_all(&line).map_err(|e| io_err(&socket, e))?;

    let mut reply = String::new();
    let read = BufReader::new(stream)
        .read_line(&mut reply)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(ServerError::Protocol(format!(
            "no reply to {request:?} before the server closed the socket"
        )));
    }
    Ok(serde_json::from_str(&reply)?)
}

fn unexpected(reply: ControlReply) -> ServerError {
    match reply {
        ControlReply::Rejected { message } => ServerError::Protocol(message),
        other => ServerError::Protocol(format!("unexpected reply {other:?}")),
    }
}
