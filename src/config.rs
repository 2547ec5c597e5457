use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};
use crate::server::{ServerOptions, DEFAULT_BUFFER_SIZE};

/// Command line of the proxy binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "socks4", version, about = "SOCKS4 proxy server")]
pub struct Config {
    /// Address to listen on.
    #[arg(short, long, env = "SOCKS4_ADDRESS", default_value = "127.0.0.1")]
    pub address: String,

    /// Port to listen on.
    #[arg(short, long, env = "SOCKS4_PORT", default_value_t = 1080)]
    pub port: u16,

    /// Upstream connect timeout, in seconds.
    #[arg(short, long, env = "SOCKS4_TIMEOUT", default_value_t = 10)]
    pub timeout: u64,

    /// Relay buffer size per participant, in bytes.
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Maximum number of concurrent sessions (unlimited if unset).
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Runtime worker threads (one per core if unset).
    #[arg(long)]
    pub workers: Option<usize>,
}

impl Config {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|_| Error::Config(format!("invalid listen address: {}", self.address)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout == 0 {
            return Err(Error::Config("timeout must be positive".into()));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer size must be positive".into()));
        }
        if self.max_connections == Some(0) {
            return Err(Error::Config("max connections must be positive".into()));
        }
        if self.workers == Some(0) {
            return Err(Error::Config("workers must be positive".into()));
        }
        Ok(())
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            timeout: Duration::from_secs(self.timeout),
            buffer_size: self.buffer_size,
            max_connections: self.max_connections,
        }
    }
}
