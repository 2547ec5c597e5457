use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, trace};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::protocol::{self, ProtocolError, ReplyCode, MAX_USERID_SIZE, REQUEST_HEADER_SIZE};
use crate::server::ProxyState;
use crate::transport;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingRequest,
    ParsingRequest,
    ReadingUserId,
    ConnectingUpstream,
    SendingReply,
    Relaying,
    Finished,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Finished | State::Failed)
    }
}

/// Finish latch of one session.
///
/// Clones share the latch. The first [`finish`](SessionHandle::finish) flips it
/// and wakes the session task, which abandons whatever I/O it is suspended on
/// and closes both sockets.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<Latch>,
}

#[derive(Debug, Default)]
struct Latch {
    finished: Mutex<bool>,
    notify: Notify,
}

impl SessionHandle {
    /// Returns `true` for the one call that actually finished the session.
    pub fn finish(&self) -> bool {
        let mut finished = self
            .inner
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *finished {
            return false;
        }
        *finished = true;
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_finished(&self) -> bool {
        *self
            .inner
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves once the session has been finished.
    pub async fn finished(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_finished() {
            return;
        }
        notified.await;
    }
}

struct Client {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    buffer: Vec<u8>,
    user_id: String,
    transferred: u64,
}

struct Server {
    stream: Option<TcpStream>,
    endpoint: Option<SocketAddrV4>,
    buffer: Vec<u8>,
    transferred: u64,
}

pub struct SOCKS4ClientConnection {
    id: u64,
    state: State,
    reply: Option<ReplyCode>,
    client: Client,
    server: Server,
    handle: SessionHandle,
    proxy: Arc<ProxyState>,
}

impl SOCKS4ClientConnection {
    pub fn new(id: u64, stream: TcpStream, proxy: Arc<ProxyState>) -> Self {
        SOCKS4ClientConnection {
            id,
            state: State::AwaitingRequest,
            reply: None,
            client: Client {
                peer: stream.peer_addr().ok(),
                stream,
                buffer: Vec::new(),
                user_id: String::new(),
                transferred: 0,
            },
            server: Server {
                stream: None,
                endpoint: None,
                buffer: Vec::new(),
                transferred: 0,
            },
            handle: SessionHandle::default(),
            proxy,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Drives the session to completion and returns its terminal state.
    pub async fn process(mut self) -> State {
        let handle = self.handle.clone();
        let outcome = tokio::select! {
            biased;
            _ = handle.finished() => None,
            result = self.run() => Some(result),
        };

        let terminal = match outcome {
            Some(Ok(())) => State::Finished,
            Some(Err(e)) => {
                debug!("session {}: failed in {:?}: {}", self.id, self.state, e);
                State::Failed
            }
            None => {
                debug!("session {}: cancelled in {:?}", self.id, self.state);
                State::Failed
            }
        };
        self.handle.finish();
        self.transition(terminal);

        self.proxy.record(|stats| {
            stats.active = stats.active.saturating_sub(1);
            match self.reply {
                Some(ReplyCode::Granted) => stats.granted += 1,
                Some(_) => stats.rejected += 1,
                None => stats.dropped += 1,
            }
        });
        debug!(
            "session {}: closed as {:?} ({} bytes from client, {} bytes from server)",
            self.id, terminal, self.client.transferred, self.server.transferred
        );

        self.close().await;
        terminal
    }

    async fn run(&mut self) -> Result<()> {
        trace!("session {}: client {:?}", self.id, self.client.peer);

        self.transition(State::AwaitingRequest);
        self.client.buffer.resize(REQUEST_HEADER_SIZE, 0);
        transport::read_exact(&self.client.stream, &mut self.client.buffer).await?;

        self.transition(State::ParsingRequest);
        // A malformed request is dropped without a reply.
        let destination = protocol::parse_header(&self.client.buffer)?;
        self.server.endpoint = Some(destination);

        self.transition(State::ReadingUserId);
        self.client.buffer.resize(MAX_USERID_SIZE, 0);
        match transport::read_until(&self.client.stream, 0, &mut self.client.buffer).await? {
            Some(len) => {
                self.client.user_id = protocol::decode_user_id(&self.client.buffer[..len]);
            }
            None => return Err(ProtocolError::UserIdTooLong.into()),
        }
        debug!(
            "session {}: CONNECT {} as {:?}",
            self.id, destination, self.client.user_id
        );

        self.transition(State::ConnectingUpstream);
        let code = match transport::connect(SocketAddr::V4(destination), self.proxy.timeout).await {
            Ok(stream) => {
                self.server.stream = Some(stream);
                ReplyCode::Granted
            }
            Err(e) => {
                debug!("session {}: connect to {} failed: {}", self.id, destination, e);
                ReplyCode::Rejected
            }
        };

        self.transition(State::SendingReply);
        transport::write_all(&self.client.stream, &protocol::build_reply(code)).await?;
        self.reply = Some(code);
        if code != ReplyCode::Granted {
            return Ok(());
        }
        debug!("session {}: granted {}", self.id, destination);

        self.transition(State::Relaying);
        self.relay().await
    }

    /// Pumps both directions until either one hits EOF or an error.
    async fn relay(&mut self) -> Result<()> {
        let size = self.proxy.buffer_size.max(1);
        self.client.buffer.resize(size, 0);
        self.server.buffer.resize(size, 0);

        let Client {
            stream: client,
            buffer: upload,
            transferred: uploaded,
            ..
        } = &mut self.client;
        let Server {
            stream: server,
            buffer: download,
            transferred: downloaded,
            ..
        } = &mut self.server;
        let client = &*client;
        let server = server.as_ref().ok_or(Error::PeerClosed)?;

        let (direction, result) = tokio::select! {
            result = pump(client, server, upload, uploaded) => ("client -> server", result),
            result = pump(server, client, download, downloaded) => ("server -> client", result),
        };
        trace!("session {}: {} ended: {:?}", self.id, direction, result);
        result
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            trace!("session {}: {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }

    async fn close(self) {
        close_stream(self.id, self.client.stream).await;
        if let Some(stream) = self.server.stream {
            close_stream(self.id, stream).await;
        }
    }
}

async fn pump(
    from: &TcpStream,
    to: &TcpStream,
    buffer: &mut [u8],
    transferred: &mut u64,
) -> Result<()> {
    loop {
        let n = transport::read_some(from, buffer).await?;
        if n == 0 {
            return Ok(());
        }
        transport::write_all(to, &buffer[..n]).await?;
        *transferred += n as u64;
    }
}

async fn close_stream(id: u64, mut stream: TcpStream) {
    if let Err(e) = stream.shutdown().await {
        trace!("session {}: shutdown: {}", id, e);
    }
}
