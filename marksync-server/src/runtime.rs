use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};

use marksync_core::config::{self, Config, LoggingConfig, ServerConfig};
use marksync_store::{Credentials, Store};

use crate::control::{ControlReply, ControlRequest, StatusReport};
use crate::error::{io_err, ServerError};
use crate::handler::{ProtocolHandler, ProtocolRegistry};
use crate::paths::{control_socket_path, run_dir};
use crate::session::{run_session, SessionContext, SessionIo};

/// TCP listener bound and ready to accept.
pub struct Server {
    listener: TcpListener,
    handle: ServerHandle,
    shutdown_rx: broadcast::Receiver<()>,
}

/// Cloneable view of a running [`Server`] for status and shutdown.
#[derive(Clone)]
pub struct ServerHandle {
    ctx: Arc<SessionContext>,
    handler: Arc<dyn ProtocolHandler>,
    local_addr: SocketAddr,
    started_at: DateTime<Utc>,
}

impl Server {
    pub async fn bind(
        config: &ServerConfig,
        store: Store,
        credentials: Arc<dyn Credentials>,
        protocols: &ProtocolRegistry,
    ) -> Result<Self, ServerError> {
        let handler = protocols.resolve(&config.protocol)?;
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|e| io_err(&config.listen, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| io_err(&config.listen, e))?;

        let ctx = Arc::new(SessionContext::new(store, credentials, config));
        let shutdown_rx = ctx.shutdown.subscribe();
        Ok(Self {
            listener,
            handle: ServerHandle {
                ctx,
                handler,
                local_addr,
                started_at: Utc::now(),
            },
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept connections until shutdown, then wait for every session to close.
    pub async fn serve(self) -> Result<(), ServerError> {
        let Server {
            listener,
            handle,
            mut shutdown_rx,
        } = self;
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %err, "set_nodelay failed");
                        }
                        tracing::info!(peer = %peer, "connection accepted");
                        sessions.spawn(run_session(
                            handle.ctx.clone(),
                            handle.handler.clone(),
                            SessionIo::from_tcp(stream),
                            peer.to_string(),
                            handle.ctx.shutdown.subscribe(),
                        ));
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "session task failed");
                    }
                }
            }
        }

        tracing::info!(open = sessions.len(), "listener closed, draining sessions");
        while let Some(joined) = sessions.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "session task failed");
            }
        }
        Ok(())
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        let _ = self.ctx.shutdown.send(());
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.ctx.shutdown.subscribe()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            pid: std::process::id(),
            listen: self.local_addr.to_string(),
            protocol: self.handler.name().to_string(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            sessions: self.ctx.registry.session_count(),
            projects: self.ctx.registry.snapshot(),
            relay: self.ctx.relay.counters(),
        }
    }
}

/// Load config, install tracing, and run until stopped.
pub fn start_blocking(home: &Path) -> Result<(), ServerError> {
    let config = config::load_at(home)?;
    init_tracing(&config.logging);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Open the store, then run the listener, the control socket and the signal
/// handler until any of them requests shutdown.
pub async fn run(home: PathBuf, config: Config) -> Result<(), ServerError> {
    config.validate()?;
    ensure_runtime_dirs(&home)?;

    let store = Store::open(
        &config.database_path(&home),
        &config.storage,
        config.server.exclusive_kind_groups.clone(),
    )
    .await?;
    let credentials: Arc<dyn Credentials> = Arc::new(store.clone());
    let server = Server::bind(
        &config.server,
        store.clone(),
        credentials,
        &ProtocolRegistry::default(),
    )
    .await?;
    let handle = server.handle();
    tracing::info!(
        listen = %handle.local_addr(),
        protocol = %config.server.protocol,
        database = %config.database_path(&home).display(),
        "marksync server listening"
    );

    // Receivers exist before any task can send.
    let control_rx = handle.subscribe_shutdown();
    let signal_rx = handle.subscribe_shutdown();

    let server_task = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let result = server.serve().await;
            handle.shutdown();
            result
        })
    };

    let control_task = {
        let handle = handle.clone();
        let home = home.clone();
        tokio::spawn(async move {
            let result = control_socket_task(home, handle.clone(), control_rx).await;
            handle.shutdown();
            result
        })
    };

    let signal_task = {
        let handle = handle.clone();
        let mut shutdown_rx = signal_rx;
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down server");
                            handle.shutdown();
                            Ok(())
                        }
                        Err(err) => Err(ServerError::Protocol(format!(
                            "ctrl-c handler failed: {err}"
                        ))),
                    }
                }
            }
        })
    };

    let (server_result, control_result, signal_result) =
        tokio::join!(server_task, control_task, signal_task);

    store.close().await;
    let joined: [(&str, Result<Result<(), ServerError>, JoinError>); 3] = [
        ("listener", server_result),
        ("control socket", control_result),
        ("signal handler", signal_result),
    ];
    for (task, result) in joined {
        result.map_err(|err| ServerError::Protocol(format!("{task} task failed: {err}")))??;
    }
    tracing::info!("marksync server stopped");
    Ok(())
}

async fn control_socket_task(
    home: PathBuf,
    handle: ServerHandle,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let socket = control_socket_path(&home);
    claim_socket_path(&socket)?;
    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    fs::set_permissions(&socket, fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(&socket, e))?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_control_client(stream, &handle).await {
                        tracing::warn!(error = %err, "control client failed");
                    }
                });
            }
        }
    }

    if let Err(err) = fs::remove_file(&socket) {
        tracing::debug!(socket = %socket.display(), error = %err, "control socket not removed");
    }
    Ok(())
}

/// Answer requests until the client hangs up or asks the server to stop.
async fn serve_control_client(stream: UnixStream, handle: &ServerHandle) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = answer(handle, &line);
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        if matches!(reply, ControlReply::Stopping) {
            break;
        }
    }
    Ok(())
}

fn answer(handle: &ServerHandle, line: &str) -> ControlReply {
    match serde_json::from_str::<ControlRequest>(line) {
        Ok(ControlRequest::Status) => ControlReply::Status(handle.status()),
        Ok(ControlRequest::Stop) => {
            tracing::info!("stop requested over control socket");
            handle.shutdown();
            ControlReply::Stopping
        }
        Err(err) => ControlReply::Rejected {
            message: format!("invalid control request: {err}"),
        },
    }
}

/// Refuse a socket another server still answers on; remove a stale one.
fn claim_socket_path(socket: &Path) -> Result<(), ServerError> {
    if StdUnixStream::connect(socket).is_ok() {
        return Err(ServerError::AlreadyRunning {
            socket: socket.to_path_buf(),
        });
    }
    match fs::remove_file(socket) {
        Ok(()) => {
            tracing::warn!(socket = %socket.display(), "removed stale control socket");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), ServerError> {
    config::ensure_root_at(home)?;
    let run = run_dir(home);
    fs::create_dir_all(&run).map_err(|e| io_err(&run, e))
}

/// `RUST_LOG` wins over the configured filter.
pub fn init_tracing(logging: &LoggingConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
