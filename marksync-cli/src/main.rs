//! marksync: annotation change relay for shared reverse-engineering projects.
//!
//! # Usage
//!
//! ```text
//! marksync init
//! marksync project create|drop <name>
//! marksync project list [--json]
//! marksync user add <name> --password <pw> [--real-name <name>]
//! marksync user remove <name>
//! marksync user list
//! marksync dump <project> [--json]
//! marksync server start|stop|status
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    dump::DumpArgs, init::InitArgs, project::ProjectCommand, server::ServerCommand,
    user::UserCommand,
};

#[derive(Parser, Debug)]
#[command(
    name = "marksync",
    version,
    about = "Relay annotation changes between clients of a shared project",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the default config and create the database.
    Init(InitArgs),

    /// Create, drop and list projects.
    Project {
        #[command(subcommand)]
        command: ProjectCommand,
    },

    /// Manage the accounts allowed to connect.
    User {
        #[command(subcommand)]
        command: UserCommand,
    },

    /// Print a project's live records in wire form.
    Dump(DumpArgs),

    /// Run or control the relay server.
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Project { command } => commands::project::run(command),
        Commands::User { command } => commands::user::run(command),
        Commands::Dump(args) => args.run(),
        Commands::Server { command } => commands::server::run(command),
    }
}
