//! Line-oriented wire codec.
//!
//! Every frame is one line of `:::`-separated fields:
//!
//! ```text
//! handshake        <project>:::<username>:::<credential>
//! client change    <id>:::<kind>:::<address_hex>:::<payload>     (id ignored)
//! server change    <id>:::<kind>:::<address_hex>:::<payload>
//! server ready     ready:::<project>:::<backlog_len>
//! server error     error:::<code>:::<message>
//! ```
//!
//! Payloads may not contain the delimiter or a line break; the encoder
//! rejects them instead of escaping.

use std::fmt;

use thiserror::Error;

use crate::types::{Address, ChangeId, ChangeKind, ChangeRecord, NameError, ProjectName, UserName};

/// Field separator.
pub const DELIMITER: &str = ":::";

/// Separator between the two sub-values of NAME / STACK_NAME payloads.
pub const NAME_SEPARATOR: char = '*';

/// Longest inbound line, terminator excluded.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Largest kind code accepted on the wire.
pub const MAX_KIND_CODE: u32 = 255;

const READY_TAG: &str = "ready";
const ERROR_TAG: &str = "error";

/// Malformed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameDecodeError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: &'static str, found: usize },

    #[error("non-numeric {field}: '{value}'")]
    NonNumeric { field: &'static str, value: String },

    #[error("kind code {0} is out of range (max {MAX_KIND_CODE})")]
    KindOutOfRange(u32),

    #[error("invalid handshake: {0}")]
    Name(#[from] NameError),

    #[error("unknown error code '{0}'")]
    UnknownErrorCode(String),

    #[error("frame is not valid UTF-8")]
    Encoding,

    #[error("line longer than {limit} bytes")]
    TooLong { limit: usize },
}

/// Text of one raw inbound line.
pub fn frame_text(bytes: Vec<u8>) -> Result<String, FrameDecodeError> {
    String::from_utf8(bytes).map_err(|_| FrameDecodeError::Encoding)
}

/// Frame that cannot be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameEncodeError {
    #[error("payload contains the frame delimiter '{DELIMITER}'")]
    Delimiter,

    #[error("payload contains a line break")]
    LineBreak,
}

fn fields(line: &str) -> Vec<&str> {
    line.trim_end_matches(['\r', '\n']).split(DELIMITER).collect()
}

fn check_payload(payload: &str) -> Result<(), FrameEncodeError> {
    if payload.contains(DELIMITER) {
        return Err(FrameEncodeError::Delimiter);
    }
    if payload.contains(['\n', '\r']) {
        return Err(FrameEncodeError::LineBreak);
    }
    Ok(())
}

fn parse_id(value: &str) -> Result<ChangeId, FrameDecodeError> {
    value
        .parse::<u64>()
        .map(ChangeId)
        .map_err(|_| FrameDecodeError::NonNumeric {
            field: "id",
            value: value.to_owned(),
        })
}

fn parse_kind(value: &str) -> Result<ChangeKind, FrameDecodeError> {
    let code = value
        .parse::<u32>()
        .map_err(|_| FrameDecodeError::NonNumeric {
            field: "kind",
            value: value.to_owned(),
        })?;
    if code > MAX_KIND_CODE {
        return Err(FrameDecodeError::KindOutOfRange(code));
    }
    Ok(ChangeKind::from_code(code))
}

fn parse_address(value: &str) -> Result<Address, FrameDecodeError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16)
        .map(Address)
        .map_err(|_| FrameDecodeError::NonNumeric {
            field: "address",
            value: value.to_owned(),
        })
}

/// Split a NAME / STACK_NAME payload on the first separator only.
pub fn split_name_payload(payload: &str) -> (&str, Option<&str>) {
    match payload.split_once(NAME_SEPARATOR) {
        Some((first, rest)) => (first, Some(rest)),
        None => (payload, None),
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// First frame a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub project: ProjectName,
    pub user: UserName,
    pub credential: String,
}

impl Handshake {
    pub fn decode(line: &str) -> Result<Self, FrameDecodeError> {
        let parts = fields(line);
        let [project, user, credential] = parts.as_slice() else {
            return Err(FrameDecodeError::FieldCount {
                expected: "3",
                found: parts.len(),
            });
        };
        Ok(Self {
            project: ProjectName::parse(*project)?,
            user: UserName::parse(*user)?,
            credential: (*credential).to_owned(),
        })
    }

    pub fn encode(&self) -> Result<String, FrameEncodeError> {
        check_payload(&self.credential)?;
        Ok(format!(
            "{}{DELIMITER}{}{DELIMITER}{}",
            self.project, self.user, self.credential
        ))
    }
}

// ---------------------------------------------------------------------------
// Change frames
// ---------------------------------------------------------------------------

/// A change as submitted by a client; the server assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub kind: ChangeKind,
    pub address: Address,
    pub payload: String,
}

impl Submission {
    /// Only the 4-field wire form; the leading id must be numeric and is dropped.
    pub fn decode(line: &str) -> Result<Self, FrameDecodeError> {
        let parts = fields(line);
        let [id, kind, address, payload] = parts.as_slice() else {
            return Err(FrameDecodeError::FieldCount {
                expected: "4",
                found: parts.len(),
            });
        };
        parse_id(id)?;
        Ok(Self {
            kind: parse_kind(kind)?,
            address: parse_address(address)?,
            payload: (*payload).to_owned(),
        })
    }

    /// Wire form with a `0` placeholder id.
    pub fn encode(&self) -> Result<String, FrameEncodeError> {
        check_payload(&self.payload)?;
        Ok(format!(
            "0{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}",
            self.kind.code(),
            self.address,
            self.payload
        ))
    }
}

/// A stored change on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFrame {
    pub id: ChangeId,
    pub kind: ChangeKind,
    pub address: Address,
    pub payload: String,
}

impl ChangeFrame {
    pub fn decode(line: &str) -> Result<Self, FrameDecodeError> {
        let parts = fields(line);
        let [id, kind, address, payload] = parts.as_slice() else {
            return Err(FrameDecodeError::FieldCount {
                expected: "4",
                found: parts.len(),
            });
        };
        Ok(Self {
            id: parse_id(id)?,
            kind: parse_kind(kind)?,
            address: parse_address(address)?,
            payload: (*payload).to_owned(),
        })
    }

    pub fn encode(&self) -> Result<String, FrameEncodeError> {
        check_payload(&self.payload)?;
        Ok(format!(
            "{}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}",
            self.id,
            self.kind.code(),
            self.address,
            self.payload
        ))
    }
}

impl From<&ChangeRecord> for ChangeFrame {
    fn from(record: &ChangeRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            address: record.address,
            payload: record.payload.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Server frames
// ---------------------------------------------------------------------------

/// Wire code of a session-fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    FrameDecode,
    ProjectNotFound,
    AuthFailed,
    StorageUnavailable,
    CatchupTimeout,
    Protocol,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::FrameDecode => "frame_decode",
            ErrorCode::ProjectNotFound => "project_not_found",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::StorageUnavailable => "storage_unavailable",
            ErrorCode::CatchupTimeout => "catchup_timeout",
            ErrorCode::Protocol => "protocol",
        }
    }

    pub fn parse(value: &str) -> Result<Self, FrameDecodeError> {
        Ok(match value {
            "frame_decode" => ErrorCode::FrameDecode,
            "project_not_found" => ErrorCode::ProjectNotFound,
            "auth_failed" => ErrorCode::AuthFailed,
            "storage_unavailable" => ErrorCode::StorageUnavailable,
            "catchup_timeout" => ErrorCode::CatchupTimeout,
            "protocol" => ErrorCode::Protocol,
            other => return Err(FrameDecodeError::UnknownErrorCode(other.to_owned())),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything the server writes to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Handshake accepted; `pending` catch-up records follow.
    Ready { project: ProjectName, pending: usize },
    Change(ChangeFrame),
    Error { code: ErrorCode, message: String },
}

impl ServerFrame {
    /// Error frame with the message made wire-safe.
    pub fn error(code: ErrorCode, message: impl AsRef<str>) -> Self {
        let message = message
            .as_ref()
            .replace(DELIMITER, ": ")
            .replace(['\r', '\n'], " ");
        ServerFrame::Error { code, message }
    }

    pub fn encode(&self) -> Result<String, FrameEncodeError> {
        match self {
            ServerFrame::Ready { project, pending } => {
                Ok(format!("{READY_TAG}{DELIMITER}{project}{DELIMITER}{pending}"))
            }
            ServerFrame::Change(change) => change.encode(),
            ServerFrame::Error { code, message } => {
                check_payload(message)?;
                Ok(format!("{ERROR_TAG}{DELIMITER}{code}{DELIMITER}{message}"))
            }
        }
    }

    pub fn decode(line: &str) -> Result<Self, FrameDecodeError> {
        let parts = fields(line);
        match parts.as_slice() {
            [READY_TAG, project, pending] => Ok(ServerFrame::Ready {
                project: ProjectName::parse(*project)?,
                pending: pending
                    .parse()
                    .map_err(|_| FrameDecodeError::NonNumeric {
                        field: "backlog length",
                        value: (*pending).to_owned(),
                    })?,
            }),
            [ERROR_TAG, code, message] => Ok(ServerFrame::Error {
                code: ErrorCode::parse(code)?,
                message: (*message).to_owned(),
            }),
            _ => ChangeFrame::decode(line).map(ServerFrame::Change),
        }
    }
}
