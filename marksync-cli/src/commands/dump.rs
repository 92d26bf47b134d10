//! `marksync dump <project> [--json]`

use std::io::{self, Write};

use anyhow::{anyhow, Context, Result};
use clap::Args;

use marksync_core::{ChangeFrame, ProjectName};

use super::{block_on, home, open_store};

#[derive(Args, Debug)]
pub struct DumpArgs {
    pub project: String,

    /// One JSON object per record instead of wire frames.
    #[arg(long)]
    pub json: bool,
}

impl DumpArgs {
    pub fn run(self) -> Result<()> {
        let name = ProjectName::parse(self.project).context("invalid project name")?;
        let home = home()?;
        let records = block_on(async {
            let store = open_store(&home).await?;
            let records = match store.find_project(&name).await? {
                Some(project) => store.live_records(&project).await.map_err(anyhow::Error::from),
                None => Err(anyhow!("project '{name}' not found")),
            };
            store.close().await;
            records
        })??;

        let stdout = io::stdout();
        let mut out = stdout.lock();
        for record in &records {
            let line = if self.json {
                serde_json::to_string(record).context("failed to serialize record")?
            } else {
                ChangeFrame::from(record)
                    .encode()
                    .with_context(|| format!("record {} cannot be framed", record.id))?
            };
            writeln!(out, "{line}").context("failed to write dump")?;
        }
        Ok(())
    }
}
