use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Serves until ctrl-c. Returns only after open connections have flushed
/// their farewell or the close grace ran out, so nothing queued is lost when
/// the runtime goes away.
async fn serve(args: ServerArgs) -> Result<()> {
    let config = args.to_config();
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let server = Server::new(listener, args.transport, config.clone());
    let addr = server.local_addr()?;

    // Tests read the address as the last token of the first line.
    info!("relay listening on {}", addr);
    info!(
        transport = ?args.transport,
        admin_policy = ?config.admin_policy,
        heartbeat = ?config.heartbeat_interval,
        close_grace = ?config.close_grace,
        "relay configured"
    );

    server.run_until_ctrl_c().await?;
    info!("relay stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Server(args) => serve(args).await,
        Command::Client(args) => client::run(args).await,
    };
    if let Err(err) = &result {
        warn!("chat-relay exited with error: {err:?}");
    }
    result
}
