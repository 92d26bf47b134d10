//! `marksync server start|stop|status`

use anyhow::{Context, Result};
use clap::Subcommand;

use marksync_server::paths::control_socket_path;
use marksync_server::{query_status, request_stop, start_blocking, ServerError};

use super::home;

#[derive(Subcommand, Debug)]
pub enum ServerCommand {
    /// Run the relay in the foreground (TCP listener + control socket).
    Start,
    /// Request graceful shutdown over the control socket.
    Stop,
    /// Query runtime status over the control socket.
    Status,
}

pub fn run(command: ServerCommand) -> Result<()> {
    let home = home()?;

    match command {
        ServerCommand::Start => {
            start_blocking(&home).context("server exited with error")?;
        }
        ServerCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("server stop requested"),
            Err(ServerError::NotRunning { .. }) => println!("server is not running"),
            Err(err) => return Err(err).context("failed to stop server"),
        },
        ServerCommand::Status => {
            let status = match query_status(&home) {
                Ok(report) => {
                    let mut status = serde_json::to_value(&report)
                        .context("failed to render status JSON")?;
                    status["running"] = serde_json::Value::Bool(true);
                    status
                }
                Err(ServerError::NotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": control_socket_path(&home).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query server status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("failed to render status JSON")?
            );
        }
    }

    Ok(())
}
