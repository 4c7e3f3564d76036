//! `oncewrite-api` binary entrypoint.
//!
//! Loads configuration from environment variables and starts the HTTP server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;

use oncewrite_api::config::Config;
use oncewrite_api::server::Server;
use oncewrite_core::observability::{LogFormat, init_logging};

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(choose_log_format(&config));

    tracing::warn!(
        "Using in-memory idempotency key store; duplicates are only caught within this process"
    );

    let server = Server::new(config);
    server.serve().await?;
    Ok(())
}
