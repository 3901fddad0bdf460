use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::operator::Operator;

mod client;
mod config;
mod consts;
mod controller;
mod diff;
mod error;
mod operator;
mod resources;
mod version;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let config = Config::parse();
    Operator::new(config).run().await
}
