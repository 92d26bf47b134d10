//! `marksync init`

use anyhow::{Context, Result};
use clap::Args;

use marksync_core::config;

use super::{block_on, home, open_store};

#[derive(Args, Debug)]
pub struct InitArgs {}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let config = config::init_at(&home).context("failed to write default config")?;
        let database = config.database_path(&home);

        block_on(async {
            let store = open_store(&home).await?;
            store.close().await;
            anyhow::Ok(())
        })??;

        println!("✓ Config at {}", config::config_path_at(&home).display());
        println!("✓ Database at {}", database.display());
        println!("  Next: marksync project create <name>");
        Ok(())
    }
}
