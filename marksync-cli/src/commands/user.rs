//! `marksync user add|remove|list`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use marksync_core::UserName;

use super::{block_on, home, open_store};

#[derive(Subcommand, Debug)]
pub enum UserCommand {
    /// Add an account.
    Add(AddArgs),

    /// Remove an account. Its cursors are kept.
    Remove(RemoveArgs),

    /// List accounts.
    List,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    pub name: String,

    /// Credential sent in the handshake.
    #[arg(long)]
    pub password: String,

    #[arg(long)]
    pub real_name: Option<String>,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    pub name: String,
}

#[derive(Tabled)]
struct UserRow {
    #[tabled(rename = "user")]
    name: String,
    #[tabled(rename = "real name")]
    real_name: String,
}

pub fn run(cmd: UserCommand) -> Result<()> {
    match cmd {
        UserCommand::Add(args) => add(args),
        UserCommand::Remove(args) => remove(args),
        UserCommand::List => list(),
    }
}

fn add(args: AddArgs) -> Result<()> {
    let name = UserName::parse(args.name).context("invalid user name")?;
    let home = home()?;
    block_on(async {
        let store = open_store(&home).await?;
        let added = store
            .add_user(&name, &args.password, args.real_name.as_deref())
            .await
            .with_context(|| format!("failed to add user '{name}'"));
        store.close().await;
        added
    })??;
    println!("✓ Added user '{name}'");
    Ok(())
}

fn remove(args: RemoveArgs) -> Result<()> {
    let name = UserName::parse(args.name).context("invalid user name")?;
    let home = home()?;
    block_on(async {
        let store = open_store(&home).await?;
        let removed = store
            .remove_user(&name)
            .await
            .with_context(|| format!("failed to remove user '{name}'"));
        store.close().await;
        removed
    })??;
    println!("✓ Removed user '{name}'");
    Ok(())
}

fn list() -> Result<()> {
    let home = home()?;
    let users = block_on(async {
        let store = open_store(&home).await?;
        let listed = store.list_users().await.context("failed to list users");
        store.close().await;
        listed
    })??;

    if users.is_empty() {
        println!("No users.");
        return Ok(());
    }

    let rows: Vec<UserRow> = users
        .into_iter()
        .map(|user| UserRow {
            name: user.name.to_string(),
            real_name: user.real_name.unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}
