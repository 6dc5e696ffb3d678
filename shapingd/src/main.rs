mod api;
mod command;
mod shaping;
mod storage;
mod system;
mod utils;
mod web;
use clap::Parser;
use command::{run, Options};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Parse command line arguments
    let options = Options::parse();

    // Run main program
    run(options).await?;

    Ok(())
}
