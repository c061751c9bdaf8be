//! Command-line arguments.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use lodestar::DEFAULT_PORT;

/// Lodestar game server.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "lodestar-server", version, about)]
pub struct CliArgs {
    /// Address to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub ip: IpAddr,

    /// Port to listen on (1-65535).
    #[arg(long, default_value_t = DEFAULT_PORT, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,
}

impl CliArgs {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}
