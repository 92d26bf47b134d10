//! marksync relay server: sessions, connection registry, broadcast relay,
//! the TCP accept loop and the local control socket.

mod annotations;
pub mod control;
mod error;
pub mod handler;
pub mod paths;
pub mod registry;
pub mod relay;
mod runtime;
pub mod session;

pub use annotations::{AnnotationSync, PROTOCOL_ID};
pub use control::{query_status, request_stop, ControlReply, ControlRequest, StatusReport};
pub use error::{ServerError, SessionError};
pub use handler::{ProtocolHandler, ProtocolRegistry};
pub use registry::{ConnectionRegistry, SessionId};
pub use relay::{BroadcastRelay, OutboundQueue, RelayFrame};
pub use runtime::{init_tracing, run, start_blocking, Server, ServerHandle};
pub use session::{run_session, SessionContext, SessionIo, SessionReport, SessionState};
