#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! Email capture server for development and testing

use clap::Parser;
use inbucket::{App, Config};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "inbucket")]
#[command(about = "Email capture service: SMTP in, POP3/REST/WebSocket out")]
struct Args {
    /// SMTP listener address (overrides INBUCKET_SMTP_ADDR)
    #[arg(long)]
    smtp_addr: Option<String>,

    /// POP3 listener address (overrides INBUCKET_POP3_ADDR)
    #[arg(long)]
    pop3_addr: Option<String>,

    /// HTTP listener address (overrides INBUCKET_WEB_ADDR)
    #[arg(long)]
    web_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(addr) = args.smtp_addr {
        config.smtp.addr = addr;
    }
    if let Some(addr) = args.pop3_addr {
        config.pop3_addr = addr;
    }
    if let Some(addr) = args.web_addr {
        config.web_addr = addr;
    }

    let app = App::start(config).await?;

    tokio::signal::ctrl_c().await?;
    app.shutdown().await;

    Ok(())
}
