//! TCP listener and per-connection protocol state machine.
//!
//! Each accepted socket gets its own task. The task checks the peer against
//! the address allowlist, then feeds bytes through a [`LineFramer`] and hands
//! every complete line to a [`Session`], writing replies back in request
//! order.

use serde_json::{Value, json};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vigil_protocol::protocol::{
    AUTH_COMMAND, LineFramer, ParsedLine, Response, codes, encode_response, parse_line,
};

use crate::commands::{CommandContext, CommandRegistry};
use crate::errors::{AgentError, Result};
use crate::security::remote_address_allowed;
use crate::token_store::SharedTokenStore;

pub type ShutdownTx = mpsc::Sender<()>;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// State shared by every connection
pub struct ServerContext {
    pub tokens: SharedTokenStore,
    pub registry: Arc<CommandRegistry>,
    pub commands: Arc<CommandContext>,
    /// When false, admitted connections start authenticated
    pub auth_required: bool,
    pub remote_ip_whitelist: Vec<IpAddr>,
}

/// Where a connection is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// Protocol state of one connection. Owned by its connection task.
pub struct Session {
    state: ConnectionState,
    ctx: Arc<ServerContext>,
}

impl Session {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let state = if ctx.auth_required {
            ConnectionState::Unauthenticated
        } else {
            ConnectionState::Authenticated
        };
        Self { state, ctx }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Handle one complete line. Blank lines, and anything after the
    /// connection closed, produce no reply.
    pub async fn handle_line(&mut self, line: &[u8]) -> Option<Response> {
        if self.is_closed() {
            return None;
        }

        let msg = match parse_line(line) {
            ParsedLine::Empty => return None,
            ParsedLine::Malformed(reason) => {
                debug!("Malformed line: {}", reason);
                return Some(Response::error(Value::Null, codes::BAD_REQUEST, "invalid JSON"));
            }
            ParsedLine::Message(msg) => msg,
        };

        match self.state {
            ConnectionState::Unauthenticated => {
                if !msg.is_auth() {
                    return Some(Response::error(
                        msg.id,
                        codes::UNAUTHORIZED,
                        "authentication required",
                    ));
                }
                let Some(token) = msg.token.as_deref() else {
                    return Some(Response::error(msg.id, codes::UNAUTHORIZED, "missing token"));
                };
                if !self.ctx.tokens.is_valid(token) {
                    warn!("Rejected invalid auth token");
                    return Some(Response::error(msg.id, codes::UNAUTHORIZED, "invalid token"));
                }
                self.state = ConnectionState::Authenticated;
                debug!("Connection authenticated");
                Some(auth_ok(msg.id))
            }
            ConnectionState::Authenticated => {
                if msg.is_auth() {
                    return Some(auth_ok(msg.id));
                }
                let Some(cmd) = msg.cmd else {
                    return Some(Response::error(msg.id, codes::BAD_REQUEST, "missing cmd"));
                };
                let args = msg.args.unwrap_or_else(|| json!({}));

                debug!("Dispatching {}", cmd);
                match self.ctx.registry.dispatch(&self.ctx.commands, &cmd, args).await {
                    Ok(content) => {
                        if self.ctx.registry.closes_connection(&cmd) {
                            self.state = ConnectionState::Closed;
                        }
                        Some(Response::ok(msg.id, cmd, content))
                    }
                    Err(e) => {
                        debug!("Command {} failed: {}", cmd, e);
                        Some(Response::error(msg.id, e.code(), e.to_string()))
                    }
                }
            }
            ConnectionState::Closed => None,
        }
    }
}

fn auth_ok(id: Value) -> Response {
    Response::ok(id, AUTH_COMMAND, json!({ "status": "ok" }))
}

async fn send(writer: &mut OwnedWriteHalf, response: &Response) -> std::io::Result<()> {
    match encode_response(response) {
        Ok(bytes) => writer.write_all(&bytes).await,
        Err(e) => {
            error!("Failed to encode response: {}", e);
            Ok(())
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    if !remote_address_allowed(peer.ip(), &ctx.remote_ip_whitelist) {
        warn!("Rejected connection from {}", peer);
        let response = Response::error(Value::Null, codes::FORBIDDEN, "remote address not allowed");
        send(&mut writer, &response).await?;
        writer.shutdown().await?;
        return Ok(());
    }
    debug!("Client connected: {}", peer);

    let mut framer = LineFramer::new();
    let mut session = Session::new(ctx);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if framer.pending_len() > 0 {
                debug!("Discarding {} byte partial line from {}", framer.pending_len(), peer);
            }
            debug!("Client disconnected: {}", peer);
            break;
        }

        let frames = framer.push(&buf[..n]);
        for line in frames.lines {
            if let Some(response) = session.handle_line(&line).await {
                send(&mut writer, &response).await?;
            }
            if session.is_closed() {
                debug!("Client {} quit", peer);
                writer.shutdown().await?;
                return Ok(());
            }
        }

        if let Some(e) = frames.overflow {
            warn!("Closing connection from {}: {}", peer, e);
            let response = Response::error(Value::Null, codes::BAD_REQUEST, "line too long");
            send(&mut writer, &response).await?;
            break;
        }
    }

    writer.shutdown().await?;
    Ok(())
}

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Server {
    pub async fn bind(addr: &str, ctx: Arc<ServerContext>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| AgentError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok(Self {
            listener,
            ctx,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| AgentError::Internal(format!("Failed to read listen address: {}", e)))
    }

    /// Sending on the returned channel stops the accept loop
    pub fn shutdown_handle(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Agent listening on {}", addr);
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, ctx).await {
                                    debug!("Connection {} ended with error: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Server shutdown requested");
                    break;
                }
            }
        }

        Ok(())
    }
}
