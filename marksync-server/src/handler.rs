//! Protocol handlers, selected by id from the config at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use marksync_core::{Handshake, Project};

use crate::annotations::AnnotationSync;
use crate::error::{ServerError, SessionError};
use crate::session::{LiveSession, SessionContext, SessionIo};

/// The per-connection capabilities a wire protocol has to provide.
///
/// The session driver calls them in order (`validate`, `catchup`,
/// `stream`) and owns the teardown; a handler only returns errors.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolve the project and check the credential.
    async fn validate(
        &self,
        ctx: &SessionContext,
        handshake: &Handshake,
    ) -> Result<Project, SessionError>;

    /// Register for live relay and replay the backlog.
    async fn catchup(
        &self,
        ctx: &SessionContext,
        session: &mut LiveSession,
        io: &mut SessionIo,
    ) -> Result<(), SessionError>;

    /// Steady state until the client goes away.
    async fn stream(
        &self,
        ctx: &SessionContext,
        session: &mut LiveSession,
        io: &mut SessionIo,
    ) -> Result<(), SessionError>;
}

/// Static id → handler table.
pub struct ProtocolRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn ProtocolHandler>>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(AnnotationSync));
        registry
    }
}

impl ProtocolRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn ProtocolHandler>, ServerError> {
        self.handlers
            .get(id)
            .cloned()
            .ok_or_else(|| ServerError::UnknownProtocol(id.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}
