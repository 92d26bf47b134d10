//! `marksync project create|drop|list`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use marksync_core::ProjectName;

use super::{block_on, home, open_store};

#[derive(Subcommand, Debug)]
pub enum ProjectCommand {
    /// Create an empty project.
    Create(NameArg),

    /// Delete a project with all its change records and cursors.
    Drop(NameArg),

    /// List projects with their live record counts.
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct NameArg {
    /// Project name (letters, digits, `_`, `-`, `.`).
    pub name: String,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct ProjectRow {
    #[tabled(rename = "project")]
    name: String,
    #[tabled(rename = "live records")]
    live_records: u64,
    #[tabled(rename = "next id")]
    next_change_id: u64,
    #[tabled(rename = "created")]
    created: String,
}

#[derive(Serialize)]
struct ProjectJson {
    name: String,
    live_records: u64,
    next_change_id: u64,
    created_at: String,
}

pub fn run(cmd: ProjectCommand) -> Result<()> {
    match cmd {
        ProjectCommand::Create(arg) => create(arg),
        ProjectCommand::Drop(arg) => drop_project(arg),
        ProjectCommand::List(args) => list(args),
    }
}

fn create(arg: NameArg) -> Result<()> {
    let name = ProjectName::parse(arg.name).context("invalid project name")?;
    let home = home()?;
    let project = block_on(async {
        let store = open_store(&home).await?;
        let created = store
            .create_project(&name)
            .await
            .with_context(|| format!("failed to create project '{name}'"));
        store.close().await;
        created
    })??;
    println!("✓ Created project '{}' (id {})", project.name, project.id);
    Ok(())
}

fn drop_project(arg: NameArg) -> Result<()> {
    let name = ProjectName::parse(arg.name).context("invalid project name")?;
    let home = home()?;
    block_on(async {
        let store = open_store(&home).await?;
        let dropped = store
            .drop_project(&name)
            .await
            .with_context(|| format!("failed to drop project '{name}'"));
        store.close().await;
        dropped
    })??;
    println!("✓ Dropped project '{name}'");
    Ok(())
}

fn list(args: ListArgs) -> Result<()> {
    let home = home()?;
    let projects = block_on(async {
        let store = open_store(&home).await?;
        let listed = store.list_projects().await.context("failed to list projects");
        store.close().await;
        listed
    })??;

    if args.json {
        let payload: Vec<ProjectJson> = projects
            .iter()
            .map(|summary| ProjectJson {
                name: summary.project.name.to_string(),
                live_records: summary.live_records,
                next_change_id: summary.next_change_id.get(),
                created_at: summary.created_at.to_rfc3339(),
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to serialize project list")?
        );
        return Ok(());
    }

    if projects.is_empty() {
        println!("No projects.");
        println!("Run: marksync project create <name>");
        return Ok(());
    }

    println!("{}", format!("{} projects", projects.len()).bold());
    let rows: Vec<ProjectRow> = projects
        .into_iter()
        .map(|summary| ProjectRow {
            name: summary.project.name.to_string(),
            live_records: summary.live_records,
            next_change_id: summary.next_change_id.get(),
            created: summary.created_at.format("%Y-%m-%d %H:%M").to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}
