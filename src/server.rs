use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Result;

pub mod connection;

pub use connection::{SOCKS4ClientConnection, SessionHandle, State};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Budget for the upstream connect of each session.
    pub timeout: Duration,
    /// Relay buffer allocated per participant.
    pub buffer_size: usize,
    /// Optional cap on concurrent sessions. `None` accepts without limit.
    pub max_connections: Option<usize>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            timeout: DEFAULT_CONNECT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_connections: None,
        }
    }
}

/// Counters kept across all sessions of one listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub accepted: u64,
    pub active: u64,
    pub granted: u64,
    pub rejected: u64,
    /// Sessions that closed before any reply was sent.
    pub dropped: u64,
}

/// Process-wide state shared by every session of a listener.
#[derive(Debug)]
pub struct ProxyState {
    pub(crate) timeout: Duration,
    pub(crate) buffer_size: usize,
    stats: Mutex<Stats>,
}

impl ProxyState {
    pub fn new(timeout: Duration, buffer_size: usize) -> Self {
        ProxyState {
            timeout,
            buffer_size,
            stats: Mutex::new(Stats::default()),
        }
    }

    pub fn stats(&self) -> Stats {
        *self.lock()
    }

    /// Registers a new session and returns its id.
    pub(crate) fn open_session(&self) -> u64 {
        let mut stats = self.lock();
        stats.accepted += 1;
        stats.active += 1;
        stats.accepted
    }

    pub(crate) fn record<F: FnOnce(&mut Stats)>(&self, update: F) {
        update(&mut self.lock());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct SOCKS4Server {
    listener: TcpListener,
    state: Arc<ProxyState>,
    limit: Option<Arc<Semaphore>>,
}

impl SOCKS4Server {
    pub async fn bind(address: SocketAddr, options: ServerOptions) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(
            "listening on {} (connect timeout {:?}, buffer {} bytes)",
            listener.local_addr()?,
            options.timeout,
            options.buffer_size
        );

        let limit = options.max_connections.map(|n| {
            info!("max_connections set to {}", n);
            Arc::new(Semaphore::new(n))
        });

        Ok(SOCKS4Server {
            listener,
            state: Arc::new(ProxyState::new(options.timeout, options.buffer_size)),
            limit,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Stats {
        self.state.stats()
    }

    /// Accepts connections forever, one task per session.
    pub async fn run(&self) {
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let permit: Option<OwnedSemaphorePermit> = match &self.limit {
                Some(limit) => match limit.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        debug!("connection from {} refused: max_connections reached", peer);
                        drop(socket);
                        continue;
                    }
                },
                None => None,
            };

            let id = self.state.open_session();
            debug!("session {}: accepted {}", id, peer);

            let connection = SOCKS4ClientConnection::new(id, socket, self.state.clone());
            tokio::spawn(async move {
                let _permit = permit;
                connection.process().await;
            });
        }
    }
}
