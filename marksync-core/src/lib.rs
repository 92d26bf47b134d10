//! marksync core library: domain types, wire codec and configuration.
//!
//! - [`types`]: newtypes and change records
//! - [`kinds`]: kind-equivalence classes
//! - [`frame`]: the `:::`-delimited line codec
//! - [`config`]: YAML configuration load / save / init
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod frame;
pub mod kinds;
pub mod types;

pub use config::Config;
pub use error::ConfigError;
pub use frame::{
    ChangeFrame, ErrorCode, FrameDecodeError, FrameEncodeError, Handshake, ServerFrame, Submission,
};
pub use kinds::KindClasses;
pub use types::{
    Address, ChangeId, ChangeKind, ChangeRecord, NameError, Project, ProjectId, ProjectName,
    UserName,
};
