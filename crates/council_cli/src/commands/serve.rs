//! Serve command - Run the HTTP API.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use super::GlobalArgs;

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(short, long, env = "COUNCIL_ADDR", default_value = "127.0.0.1:8080")]
    addr: String,
}

pub async fn execute(global: &GlobalArgs, args: ServeArgs) -> Result<()> {
    let state = global.open_state()?;
    info!("Serving data from {}", global.data_dir.display());
    council_server::serve(&args.addr, Arc::new(state)).await?;
    Ok(())
}
