//! A SOCKS4 proxy server and a client for chaining SOCKS4 proxies.

pub mod chain;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use chain::{connect_chain, connect_chain_with_timeout, handshake, ProxyHop};
pub use config::Config;
pub use error::{Error, Result};
pub use server::{ServerOptions, SOCKS4Server, Stats};
