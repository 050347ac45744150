use anyhow::Result;
use chaincrawl_mono::{run_prod, Args};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder().format_timestamp_secs().init();
    let args = Args::parse();
    run_prod(args).await
}
