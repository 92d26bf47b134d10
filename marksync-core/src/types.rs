//! Domain types for the marksync change log.
//!
//! Names are validated newtypes; numeric identifiers are `Copy` newtypes so
//! they cannot be mixed up with each other at call sites.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Maximum length of a project or user name.
pub const MAX_NAME_LEN: usize = 64;

/// Rejected project or user name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("{what} name must not be empty")]
    Empty { what: &'static str },

    #[error("{what} name is longer than {MAX_NAME_LEN} characters")]
    TooLong { what: &'static str },

    #[error("{what} name '{name}' contains '{ch}'; allowed: ASCII letters, digits, '_', '-', '.'")]
    InvalidChar {
        what: &'static str,
        name: String,
        ch: char,
    },
}

fn validate_name(what: &'static str, name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty { what });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong { what });
    }
    if let Some(ch) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(NameError::InvalidChar {
            what,
            name: name.to_owned(),
            ch,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// A strongly-typed project name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectName(pub String);

impl ProjectName {
    /// Validate and wrap a project name.
    pub fn parse(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        validate_name("project", &name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ProjectName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed user name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserName(pub String);

impl UserName {
    /// Validate and wrap a user name.
    pub fn parse(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        validate_name("user", &name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for UserName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Storage key of a project row. Never reused, so a dropped and re-created
/// project with the same name gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(pub i64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Position of a change record inside its project's log.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChangeId(pub u64);

impl ChangeId {
    /// Cursor value meaning "nothing consumed yet".
    pub const ZERO: ChangeId = ChangeId(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Numeric offset inside the analysed artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub u64);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// Change kinds
// ---------------------------------------------------------------------------

/// The kind of annotation carried by a change record.
///
/// Kinds travel as integers on the wire; codes without a named variant are
/// preserved as [`ChangeKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Name,
    StackName,
    CommentRegular,
    CommentRepeatable,
    FunctionStart,
    FunctionEnd,
    Other(u32),
}

impl ChangeKind {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => ChangeKind::Name,
            2 => ChangeKind::StackName,
            3 => ChangeKind::CommentRegular,
            4 => ChangeKind::CommentRepeatable,
            5 => ChangeKind::FunctionStart,
            6 => ChangeKind::FunctionEnd,
            other => ChangeKind::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            ChangeKind::Name => 1,
            ChangeKind::StackName => 2,
            ChangeKind::CommentRegular => 3,
            ChangeKind::CommentRepeatable => 4,
            ChangeKind::FunctionStart => 5,
            ChangeKind::FunctionEnd => 6,
            ChangeKind::Other(code) => code,
        }
    }

    /// NAME and STACK_NAME payloads hold two `*`-joined sub-values.
    pub fn has_split_payload(self) -> bool {
        matches!(self, ChangeKind::Name | ChangeKind::StackName)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Name => write!(f, "NAME"),
            ChangeKind::StackName => write!(f, "STACK_NAME"),
            ChangeKind::CommentRegular => write!(f, "COMMENT_REGULAR"),
            ChangeKind::CommentRepeatable => write!(f, "COMMENT_REPEATABLE"),
            ChangeKind::FunctionStart => write!(f, "FUNCTION_START"),
            ChangeKind::FunctionEnd => write!(f, "FUNCTION_END"),
            ChangeKind::Other(code) => write!(f, "KIND_{code}"),
        }
    }
}

impl Serialize for ChangeKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A project row as seen by sessions and admin tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: ProjectName,
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

/// One atomic annotation update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub project: ProjectId,
    pub user: UserName,
    pub timestamp: DateTime<Utc>,
    pub address: Address,
    pub kind: ChangeKind,
    pub payload: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
