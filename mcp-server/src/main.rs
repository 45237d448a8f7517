use anyhow::Result;
use clap::Parser;
use filebroker_mcp_server::Cli;
use filebroker_mcp_server::run_main;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    run_main(cli).await?;
    Ok(())
}
