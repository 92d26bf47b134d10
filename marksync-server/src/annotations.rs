//! The `annotations` protocol: address-keyed annotation changes, replayed on
//! join and relayed live between clients of one project.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use marksync_core::frame::frame_text;
use marksync_core::{ChangeFrame, ChangeId, Handshake, Project, ServerFrame, Submission};

use crate::error::SessionError;
use crate::handler::ProtocolHandler;
use crate::relay::RelayFrame;
use crate::session::{LiveSession, SessionContext, SessionIo};

pub const PROTOCOL_ID: &str = "annotations";

pub struct AnnotationSync;

enum Event {
    Inbound(Result<Option<Vec<u8>>, SessionError>),
    Relay(RelayFrame),
}

#[async_trait]
impl ProtocolHandler for AnnotationSync {
    fn name(&self) -> &'static str {
        PROTOCOL_ID
    }

    async fn validate(
        &self,
        ctx: &SessionContext,
        handshake: &Handshake,
    ) -> Result<Project, SessionError> {
        let project = ctx
            .store
            .find_project(&handshake.project)
            .await?
            .ok_or_else(|| SessionError::ProjectNotFound(handshake.project.clone()))?;

        if !ctx
            .credentials
            .validate(&handshake.user, &handshake.credential)
            .await?
        {
            return Err(SessionError::AuthFailed(handshake.user.clone()));
        }
        Ok(project)
    }

    async fn catchup(
        &self,
        ctx: &SessionContext,
        session: &mut LiveSession,
        io: &mut SessionIo,
    ) -> Result<(), SessionError> {
        let cursor = ctx.store.cursor(session.project(), session.user()).await?;
        session.resume_from(cursor);

        // Registered before the backlog query: a change committed meanwhile is
        // either in the backlog or in the relay queue.
        session.register(ctx);
        let backlog = ctx
            .store
            .list_since(session.project(), cursor.unwrap_or(ChangeId::ZERO))
            .await?;

        debug!(
            session = %session.id(),
            cursor = %cursor.unwrap_or(ChangeId::ZERO),
            backlog = backlog.len(),
            "catch-up started"
        );
        io.send(&ServerFrame::Ready {
            project: session.project().name.clone(),
            pending: backlog.len(),
        })
        .await?;

        for record in &backlog {
            let frame = ServerFrame::Change(ChangeFrame::from(record));
            let delivered = async {
                io.send(&frame).await?;
                io.read_ack().await?;
                Ok::<_, SessionError>(())
            };
            tokio::time::timeout(ctx.catchup_ack_timeout, delivered)
                .await
                .map_err(|_| SessionError::CatchupTimeout { id: record.id })??;
            session.replayed_through = record.id;
            session.note_processed(record.id);
        }

        session.handle.queue.discard_through(session.replayed_through);
        session.persist_cursor(ctx).await?;
        debug!(
            session = %session.id(),
            through = %session.replayed_through,
            "catch-up finished"
        );
        Ok(())
    }

    async fn stream(
        &self,
        ctx: &SessionContext,
        session: &mut LiveSession,
        io: &mut SessionIo,
    ) -> Result<(), SessionError> {
        let handle = session.handle.clone();
        loop {
            let event = tokio::select! {
                line = io.read_line() => Event::Inbound(line),
                frame = handle.queue.pop() => Event::Relay(frame),
            };

            match event {
                Event::Inbound(Ok(None)) => {
                    debug!(session = %session.id(), "client closed connection");
                    return Ok(());
                }
                Event::Inbound(Ok(Some(line))) => apply(ctx, session, line).await?,
                Event::Inbound(Err(SessionError::FrameDecode(err))) => {
                    warn!(session = %session.id(), error = %err, "discarding undecodable frame");
                }
                Event::Inbound(Err(err)) => return Err(err),
                Event::Relay(first) => {
                    let mut delivered = 0usize;
                    let mut next = Some(first);
                    while let Some(frame) = next {
                        if frame.id > session.replayed_through {
                            io.write_line(&frame.line).await?;
                            session.note_processed(frame.id);
                            delivered += 1;
                        }
                        next = handle.queue.try_pop();
                    }
                    io.flush().await?;
                    if delivered > 0 {
                        session.persist_cursor(ctx).await?;
                    }
                }
            }
        }
    }
}

/// Store one client change, relay it to the peers, advance the cursor.
/// Undecodable lines are dropped.
async fn apply(
    ctx: &SessionContext,
    session: &mut LiveSession,
    line: Vec<u8>,
) -> Result<(), SessionError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }

    let submission = match frame_text(line).and_then(|text| Submission::decode(&text)) {
        Ok(submission) => submission,
        Err(err) => {
            warn!(session = %session.id(), error = %err, "discarding undecodable frame");
            return Ok(());
        }
    };
    if let Err(err) = submission.encode() {
        warn!(session = %session.id(), error = %err, "discarding unencodable change");
        return Ok(());
    }

    let handle = Arc::clone(&session.handle);
    let sequencer = ctx.registry.sequencer(handle.project.id);
    let record = {
        let _turn = sequencer.lock().await;
        let record = ctx
            .store
            .append(
                &handle.project,
                &handle.user,
                submission.kind,
                submission.address,
                &submission.payload,
                Utc::now(),
            )
            .await?;
        let line = ChangeFrame::from(&record)
            .encode()
            .map_err(|err| SessionError::Protocol(err.to_string()))?;
        let report = ctx
            .relay
            .publish(handle.id, handle.project.id, RelayFrame::new(record.id, line));
        debug!(
            session = %handle.id,
            change_id = %record.id,
            kind = %record.kind,
            address = %record.address,
            peers = report.targets,
            "change relayed"
        );
        record
    };

    session.note_processed(record.id);
    session.persist_cursor(ctx).await?;
    Ok(())
}
