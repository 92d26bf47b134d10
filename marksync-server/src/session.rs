//! Per-connection state machine.
//!
//! ```text
//! INIT ──handshake──▶ VALIDATING ──ok──▶ CATCHUP ──backlog done──▶ STREAMING
//!   │                     │                 │                          │
//!   └───────────── error frame / EOF ───────┴──────────────────────────┴──▶ CLOSED
//! ```
//!
//! [`run_session`] is the single teardown boundary: whatever ends the
//! session, it writes the error frame (if the socket still works),
//! deregisters, and stores the final cursor.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use marksync_core::config::ServerConfig;
use marksync_core::frame::{frame_text, MAX_LINE_BYTES};
use marksync_core::{
    ChangeId, ErrorCode, FrameDecodeError, Handshake, Project, ServerFrame, UserName,
};
use marksync_store::{Credentials, Store, StoreError};

use crate::error::SessionError;
use crate::handler::ProtocolHandler;
use crate::registry::{ConnectionRegistry, SessionHandle, SessionId};
use crate::relay::BroadcastRelay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Validating,
    Catchup,
    Streaming,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Init => "init",
            SessionState::Validating => "validating",
            SessionState::Catchup => "catchup",
            SessionState::Streaming => "streaming",
            SessionState::Closed => "closed",
        })
    }
}

/// Everything sessions share. Built once per server.
pub struct SessionContext {
    pub store: Store,
    pub credentials: Arc<dyn Credentials>,
    pub registry: Arc<ConnectionRegistry>,
    pub relay: BroadcastRelay,
    pub catchup_ack_timeout: Duration,
    pub relay_queue_capacity: usize,
    pub shutdown: broadcast::Sender<()>,
}

impl SessionContext {
    pub fn new(store: Store, credentials: Arc<dyn Credentials>, config: &ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::default());
        let (shutdown, _) = broadcast::channel(16);
        Self {
            store,
            credentials,
            relay: BroadcastRelay::new(registry.clone()),
            registry,
            catchup_ack_timeout: config.catchup_ack_timeout(),
            relay_queue_capacity: config.relay_queue_capacity,
            shutdown,
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-framed transport of one client.
pub struct SessionIo {
    reader: BufReader<BoxedReader>,
    writer: BufWriter<BoxedWriter>,
    /// Bytes of a line whose read was interrupted; kept across `select!` polls.
    pending: Vec<u8>,
    /// Inside an oversized line, dropping bytes up to its terminator.
    discarding: bool,
}

impl SessionIo {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: BufReader::new(Box::new(reader) as BoxedReader),
            writer: BufWriter::new(Box::new(writer) as BoxedWriter),
            pending: Vec::new(),
            discarding: false,
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }

    /// Next line without its terminator, or `None` at EOF. Cancel safe.
    ///
    /// A line over [`MAX_LINE_BYTES`] yields `FrameDecode`; the rest of it is
    /// skipped and reading resumes at the next line.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        loop {
            let room = (MAX_LINE_BYTES + 1).saturating_sub(self.pending.len());
            let read = (&mut self.reader)
                .take(room as u64)
                .read_until(b'\n', &mut self.pending)
                .await?;
            let complete = self.pending.last() == Some(&b'\n');

            if self.discarding {
                self.pending.clear();
                if read == 0 {
                    self.discarding = false;
                    return Ok(None);
                }
                if complete {
                    self.discarding = false;
                }
                continue;
            }
            if complete || (read == 0 && !self.pending.is_empty()) {
                break;
            }
            if read == 0 {
                return Ok(None);
            }
            if self.pending.len() > MAX_LINE_BYTES {
                self.pending.clear();
                self.discarding = true;
                return Err(FrameDecodeError::TooLong {
                    limit: MAX_LINE_BYTES,
                }
                .into());
            }
        }

        let mut line = std::mem::take(&mut self.pending);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(Some(line))
    }

    /// One acknowledgment byte of any value.
    pub async fn read_ack(&mut self) -> io::Result<u8> {
        if !self.pending.is_empty() {
            return Ok(self.pending.remove(0));
        }
        self.reader.read_u8().await
    }

    /// Buffered; call [`SessionIo::flush`] after a batch.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }

    pub async fn send(&mut self, frame: &ServerFrame) -> Result<(), SessionError> {
        let line = frame
            .encode()
            .map_err(|err| SessionError::Protocol(err.to_string()))?;
        self.write_line(&line).await?;
        self.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Err(err) = self.writer.shutdown().await {
            debug!(error = %err, "socket shutdown failed");
        }
    }
}

/// A validated session: its relay handle plus cursor bookkeeping.
pub struct LiveSession {
    pub handle: Arc<SessionHandle>,
    /// Cursor as last read from or written to the store.
    stored_cursor: Option<ChangeId>,
    /// Last id delivered during catch-up; relay frames at or below it are duplicates.
    pub replayed_through: ChangeId,
    /// Highest id delivered to or submitted by this client.
    pub last_processed: ChangeId,
    registered: bool,
}

impl LiveSession {
    pub fn new(handle: Arc<SessionHandle>) -> Self {
        Self {
            handle,
            stored_cursor: None,
            replayed_through: ChangeId::ZERO,
            last_processed: ChangeId::ZERO,
            registered: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id
    }

    pub fn project(&self) -> &Project {
        &self.handle.project
    }

    pub fn user(&self) -> &UserName {
        &self.handle.user
    }

    /// Seed bookkeeping from the stored cursor.
    pub fn resume_from(&mut self, cursor: Option<ChangeId>) {
        self.stored_cursor = cursor;
        let start = cursor.unwrap_or(ChangeId::ZERO);
        self.replayed_through = start;
        self.last_processed = start;
    }

    pub fn register(&mut self, ctx: &SessionContext) {
        ctx.registry.register(self.handle.clone());
        self.registered = true;
    }

    fn unregister(&mut self, ctx: &SessionContext) {
        if self.registered {
            ctx.registry
                .unregister(self.handle.project.id, self.handle.id);
            self.registered = false;
        }
    }

    pub fn note_processed(&mut self, id: ChangeId) {
        self.last_processed = self.last_processed.max(id);
    }

    /// Cursor value that never passes a frame the client has not been sent.
    pub fn cursor_target(&self) -> ChangeId {
        match self.handle.queue.cursor_ceiling() {
            Some(ceiling) => self.last_processed.min(ceiling),
            None => self.last_processed,
        }
    }

    /// Upsert the cursor if it moved.
    pub async fn persist_cursor(&mut self, ctx: &SessionContext) -> Result<(), StoreError> {
        let target = self.cursor_target();
        if target <= self.stored_cursor.unwrap_or(ChangeId::ZERO) {
            return Ok(());
        }
        ctx.store
            .set_cursor(&self.handle.project, &self.handle.user, target)
            .await?;
        self.stored_cursor = Some(target);
        Ok(())
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session: Option<SessionId>,
    /// Last state entered before CLOSED.
    pub reached: SessionState,
    pub error: Option<ErrorCode>,
}

/// Drive one connection from handshake to close.
pub async fn run_session(
    ctx: Arc<SessionContext>,
    handler: Arc<dyn ProtocolHandler>,
    mut io: SessionIo,
    peer: String,
    mut shutdown: broadcast::Receiver<()>,
) -> SessionReport {
    let mut state = SessionState::Init;
    let mut live: Option<LiveSession> = None;

    let result = tokio::select! {
        result = drive(&ctx, handler.as_ref(), &mut io, &peer, &mut state, &mut live) => result,
        _ = shutdown.recv() => Err(SessionError::ShuttingDown),
    };

    close(&ctx, &mut io, &peer, state, live, result).await
}

async fn drive(
    ctx: &SessionContext,
    handler: &dyn ProtocolHandler,
    io: &mut SessionIo,
    peer: &str,
    state: &mut SessionState,
    live: &mut Option<LiveSession>,
) -> Result<(), SessionError> {
    let Some(line) = io.read_line().await? else {
        debug!(peer, "connection closed before handshake");
        return Ok(());
    };
    let handshake = Handshake::decode(&frame_text(line)?)?;

    enter(state, SessionState::Validating, peer);
    let project = handler.validate(ctx, &handshake).await?;
    let handle = ctx.registry.open_session(
        project,
        handshake.user,
        peer.to_string(),
        ctx.relay_queue_capacity,
    );
    info!(
        session = %handle.id,
        project = %handle.project.name,
        user = %handle.user,
        peer,
        "session accepted"
    );
    let live = live.insert(LiveSession::new(handle));

    enter(state, SessionState::Catchup, peer);
    handler.catchup(ctx, live, io).await?;

    enter(state, SessionState::Streaming, peer);
    handler.stream(ctx, live, io).await
}

fn enter(state: &mut SessionState, next: SessionState, peer: &str) {
    debug!(peer, from = %state, to = %next, "session transition");
    *state = next;
}

async fn close(
    ctx: &SessionContext,
    io: &mut SessionIo,
    peer: &str,
    reached: SessionState,
    live: Option<LiveSession>,
    result: Result<(), SessionError>,
) -> SessionReport {
    let error = match result {
        Ok(()) => None,
        Err(err) => {
            let code = err.code();
            match &err {
                SessionError::Io(_) | SessionError::ShuttingDown => {
                    info!(peer, state = %reached, error = %err, "session ended");
                }
                _ => warn!(peer, state = %reached, code = %code, error = %err, "session failed"),
            }
            if err.connection_usable() {
                let frame = ServerFrame::error(code, err.to_string());
                match tokio::time::timeout(ctx.catchup_ack_timeout, io.send(&frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(send_err)) => debug!(peer, error = %send_err, "error frame not sent"),
                    Err(_) => debug!(peer, "error frame write timed out"),
                }
            }
            Some(code)
        }
    };

    let session = match live {
        Some(mut live) => {
            live.unregister(ctx);
            if let Err(err) = live.persist_cursor(ctx).await {
                warn!(
                    session = %live.id(),
                    project = %live.project().name,
                    user = %live.user(),
                    error = %err,
                    "final cursor update failed"
                );
            }
            info!(
                session = %live.id(),
                project = %live.project().name,
                user = %live.user(),
                last_change_id = %live.last_processed,
                degraded = live.handle.queue.is_degraded(),
                "session closed"
            );
            Some(live.id())
        }
        None => None,
    };

    io.shutdown().await;
    SessionReport {
        session,
        reached,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marksync_core::{ProjectId, ProjectName};
    use tokio::io::{duplex, AsyncWriteExt};

    use crate::relay::RelayFrame;

    #[tokio::test]
    async fn read_line_strips_terminators_and_reports_eof() {
        let (mut client, server) = duplex(256);
        let (reader, writer) = tokio::io::split(server);
        let mut io = SessionIo::new(reader, writer);

        client.write_all(b"one\r\ntwo\nlast").await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(io.read_line().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(io.read_line().await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(io.read_line().await.unwrap(), Some(b"last".to_vec()));
        assert_eq!(io.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_line_is_rejected_then_skipped() {
        let (mut client, server) = duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        let mut io = SessionIo::new(reader, writer);

        let feeder = tokio::spawn(async move {
            client.write_all(&vec![b'a'; MAX_LINE_BYTES + 10]).await.unwrap();
            client.write_all(b"\nnext\n").await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        assert!(matches!(
            io.read_line().await,
            Err(SessionError::FrameDecode(FrameDecodeError::TooLong { .. }))
        ));
        assert_eq!(io.read_line().await.unwrap(), Some(b"next".to_vec()));
        assert_eq!(io.read_line().await.unwrap(), None);
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn line_at_the_limit_is_accepted() {
        let (mut client, server) = duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        let mut io = SessionIo::new(reader, writer);

        let feeder = tokio::spawn(async move {
            client.write_all(&vec![b'b'; MAX_LINE_BYTES]).await.unwrap();
            client.write_all(b"\n").await.unwrap();
            client
        });

        let line = io.read_line().await.unwrap().expect("line");
        assert_eq!(line.len(), MAX_LINE_BYTES);
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn ack_is_any_single_byte() {
        let (mut client, server) = duplex(64);
        let (reader, writer) = tokio::io::split(server);
        let mut io = SessionIo::new(reader, writer);

        client.write_all(b"\nxhello\n").await.unwrap();
        assert_eq!(io.read_ack().await.unwrap(), b'\n');
        assert_eq!(io.read_ack().await.unwrap(), b'x');
        assert_eq!(io.read_line().await.unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn cursor_target_is_clamped_by_the_queue() {
        let registry = ConnectionRegistry::default();
        let project = Project {
            id: ProjectId(1),
            name: ProjectName::from("bootrom"),
        };
        let handle = registry.open_session(project, UserName::from("a"), "a".into(), 2);
        let mut live = LiveSession::new(handle.clone());
        live.resume_from(Some(ChangeId(3)));
        assert_eq!(live.cursor_target(), ChangeId(3));

        live.note_processed(ChangeId(9));
        assert_eq!(live.cursor_target(), ChangeId(9));

        handle.queue.push(RelayFrame::new(ChangeId(7), "7"));
        assert_eq!(live.cursor_target(), ChangeId(6));

        live.note_processed(ChangeId(5));
        assert_eq!(live.last_processed, ChangeId(9));
    }
}
