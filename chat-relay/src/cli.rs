use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{AdminPolicy, RelayConfig, TransportKind};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:1337")]
    pub listen: SocketAddr,

    /// Framing spoken by every connection on this listener.
    #[arg(long, value_enum, default_value_t = TransportKind::Lines)]
    pub transport: TransportKind,

    #[arg(long, value_enum, default_value_t = AdminPolicy::OldestConnection)]
    pub admin_policy: AdminPolicy,

    /// Seconds between liveness probes on WebSocket sessions.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub heartbeat_secs: u64,

    /// Seconds a closing connection may spend flushing before it is dropped.
    #[arg(long, default_value_t = 3)]
    pub close_grace_secs: u64,
}

impl ServerArgs {
    pub fn to_config(&self) -> RelayConfig {
        RelayConfig {
            admin_policy: self.admin_policy,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            close_grace: Duration::from_secs(self.close_grace_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:1337")]
    pub server: SocketAddr,

    #[arg(long, value_enum, default_value_t = TransportKind::Lines)]
    pub transport: TransportKind,

    /// Join with this name instead of prompting for one.
    #[arg(long)]
    pub username: Option<String>,

    /// Seconds allowed for connecting, including the WebSocket handshake.
    #[arg(long, default_value_t = 5)]
    pub connect_timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::parse_from(["chat-relay", "server"]);
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.transport, TransportKind::Lines);
        let config = args.to_config();
        assert_eq!(config.admin_policy, AdminPolicy::OldestConnection);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.close_grace, Duration::from_secs(3));
    }

    #[test]
    fn client_accepts_websocket_and_username() {
        let cli = Cli::parse_from([
            "chat-relay",
            "client",
            "--transport",
            "websocket",
            "--username",
            "alice",
        ]);
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.transport, TransportKind::WebSocket);
        assert_eq!(args.username.as_deref(), Some("alice"));
        assert_eq!(args.connect_timeout_secs, 5);
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        assert!(Cli::try_parse_from(["chat-relay", "server", "--heartbeat-secs", "0"]).is_err());
    }
}
