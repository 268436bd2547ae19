//! Localhost mTLS streaming server for TAK clients.
//!
//! Accepts CoT clients on 127.0.0.1:8089, performs TAK Protocol v0
//! negotiation, frames the XML stream into events, and fans broadcasts out
//! to every connected client. A single coordinator task owns the connection
//! table; per-connection reader, writer, and keepalive tasks hang off a
//! cancellation token so disconnecting one client tears down exactly its
//! own tasks.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use meshtak_cot::{parse_event, CotEvent};

pub mod certstore;
pub mod control;
pub mod frame;

pub use certstore::{CertStore, CertStoreError, Identity, Keyring, MemoryKeyring, BUNDLE_PASSWORD};
pub use frame::StreamFramer;

/// The rustls server configuration consumed by [`TakServer::start`].
pub type TlsConfig = rustls::ServerConfig;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("TLS configuration failed: {0}")]
    TlsConfigurationFailed(String),

    #[error("no client CA configured; refusing to accept clients")]
    NoClientCa,

    #[error("listener failed: {0}")]
    ListenerFailed(std::io::Error),

    #[error("client {0} not found")]
    ClientNotFound(u64),

    #[error("server is not running")]
    NotRunning,

    #[error("connection closed")]
    ConnectionClosed,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub keepalive_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // Loopback only: nothing off-device may connect.
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8089,
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Setup,
    Preparing,
    Ready,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub conn_id: u64,
    pub endpoint: String,
    pub uid: Option<String>,
    pub callsign: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub negotiated: bool,
    pub phase: ConnectionPhase,
}

/// What the server surfaces to the rest of the gateway.
#[derive(Debug)]
pub enum ServerEvent {
    Connected { conn_id: u64, endpoint: String },
    Disconnected { conn_id: u64 },
    /// A non-control CoT event from a client, ready for the bridge.
    Event { conn_id: u64, event: CotEvent },
    ListenerFailed { error: String },
}

enum Command {
    /// TCP accepted; TLS not started yet.
    Accepted {
        conn_id: u64,
        endpoint: String,
        token: CancellationToken,
    },
    /// TLS handshake in flight.
    Handshaking {
        conn_id: u64,
    },
    /// Handshake done; the connection can send and receive.
    Register {
        conn_id: u64,
        endpoint: String,
        outbox: mpsc::Sender<Vec<u8>>,
        token: CancellationToken,
    },
    Deregister {
        conn_id: u64,
        failed: bool,
    },
    Broadcast {
        bytes: Vec<u8>,
    },
    SendTo {
        conn_id: u64,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    SetIdentity {
        conn_id: u64,
        uid: String,
        callsign: Option<String>,
    },
    SetNegotiated {
        conn_id: u64,
    },
    Clients {
        reply: oneshot::Sender<Vec<ClientInfo>>,
    },
}

struct ConnEntry {
    /// Present once the connection reaches `Ready`.
    outbox: Option<mpsc::Sender<Vec<u8>>>,
    token: CancellationToken,
    info: ClientInfo,
}

/// Build the mTLS acceptor configuration: TLS >= 1.2, client certificates
/// required, trust evaluated against the configured CA anchors exclusively.
pub fn build_tls_config(
    identity: Identity,
    anchors: Vec<CertificateDer<'static>>,
) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    if anchors.is_empty() {
        return Err(ServerError::NoClientCa);
    }
    let mut roots = RootCertStore::empty();
    for anchor in anchors {
        roots
            .add(anchor)
            .map_err(|e| ServerError::TlsConfigurationFailed(e.to_string()))?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ServerError::TlsConfigurationFailed(e.to_string()))?;
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.cert_chain, identity.key)
        .map_err(|e| ServerError::TlsConfigurationFailed(e.to_string()))?;
    Ok(Arc::new(config))
}

pub struct TakServer {
    cmd_tx: mpsc::Sender<Command>,
    token: CancellationToken,
    local_addr: SocketAddr,
    server_uid: String,
}

impl TakServer {
    pub async fn start(
        tls: Arc<rustls::ServerConfig>,
        config: ServerConfig,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), ServerError> {
        let listener = TcpListener::bind((config.bind, config.port))
            .await
            .map_err(ServerError::ListenerFailed)?;
        let local_addr = listener.local_addr().map_err(ServerError::ListenerFailed)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let token = CancellationToken::new();
        let server_uid = Uuid::new_v4().to_string();

        tokio::spawn(coordinator(cmd_rx, event_tx.clone(), token.clone()));
        tokio::spawn(accept_loop(
            listener,
            TlsAcceptor::from(tls),
            cmd_tx.clone(),
            event_tx,
            token.clone(),
            config.keepalive_interval,
            server_uid.clone(),
        ));

        info!("TAK server listening on {}", local_addr);
        Ok((
            Self {
                cmd_tx,
                token,
                local_addr,
                server_uid,
            },
            event_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn server_uid(&self) -> &str {
        &self.server_uid
    }

    /// Serialize once, send to every connected client.
    pub async fn broadcast(&self, event: &CotEvent) {
        self.broadcast_raw(control::to_wire(event)).await;
    }

    pub async fn broadcast_raw(&self, bytes: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::Broadcast { bytes }).await;
    }

    /// Send to one client. `ClientNotFound` when no ready connection has
    /// that id; `ConnectionClosed` when the write side is gone (the client
    /// is disconnected as a side effect).
    pub async fn send_to(&self, conn_id: u64, event: &CotEvent) -> Result<(), ServerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendTo {
                conn_id,
                bytes: control::to_wire(event),
                reply,
            })
            .await
            .map_err(|_| ServerError::NotRunning)?;
        rx.await.map_err(|_| ServerError::NotRunning)?
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Clients { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Graceful stop: cancels the listener and every connection.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

async fn coordinator(
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<ServerEvent>,
    token: CancellationToken,
) {
    let mut connections: HashMap<u64, ConnEntry> = HashMap::new();

    loop {
        let cmd = tokio::select! {
            _ = token.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            Command::Accepted {
                conn_id,
                endpoint,
                token,
            } => {
                debug!("client {} accepted from {}", conn_id, endpoint);
                connections.insert(
                    conn_id,
                    ConnEntry {
                        outbox: None,
                        token,
                        info: ClientInfo {
                            conn_id,
                            endpoint,
                            uid: None,
                            callsign: None,
                            connected_at: Utc::now(),
                            negotiated: false,
                            phase: ConnectionPhase::Setup,
                        },
                    },
                );
            }
            Command::Handshaking { conn_id } => {
                if let Some(entry) = connections.get_mut(&conn_id) {
                    entry.info.phase = ConnectionPhase::Preparing;
                }
            }
            Command::Register {
                conn_id,
                endpoint,
                outbox,
                token,
            } => {
                info!("client {} connected from {}", conn_id, endpoint);
                let entry = connections.entry(conn_id).or_insert_with(|| ConnEntry {
                    outbox: None,
                    token,
                    info: ClientInfo {
                        conn_id,
                        endpoint: endpoint.clone(),
                        uid: None,
                        callsign: None,
                        connected_at: Utc::now(),
                        negotiated: false,
                        phase: ConnectionPhase::Setup,
                    },
                });
                entry.outbox = Some(outbox);
                entry.info.phase = ConnectionPhase::Ready;
                let _ = event_tx
                    .send(ServerEvent::Connected { conn_id, endpoint })
                    .await;
            }
            Command::Deregister { conn_id, failed } => {
                if let Some(mut entry) = connections.remove(&conn_id) {
                    entry.info.phase = if failed {
                        warn!("client {} failed ({})", conn_id, entry.info.endpoint);
                        ConnectionPhase::Failed
                    } else {
                        info!("client {} disconnected", conn_id);
                        ConnectionPhase::Cancelled
                    };
                    entry.token.cancel();
                    // Only connections that reached ready were announced.
                    if entry.outbox.is_some() {
                        let _ = event_tx.send(ServerEvent::Disconnected { conn_id }).await;
                    }
                }
            }
            Command::Broadcast { bytes } => {
                // Fan out to ready connections in table order; a full or
                // closed outbox disconnects that client only.
                let mut dead = Vec::new();
                for (&conn_id, entry) in &connections {
                    if let Some(outbox) = &entry.outbox {
                        if outbox.try_send(bytes.clone()).is_err() {
                            dead.push(conn_id);
                        }
                    }
                }
                for conn_id in dead {
                    if let Some(entry) = connections.remove(&conn_id) {
                        warn!("client {} send failed, disconnecting", conn_id);
                        entry.token.cancel();
                        let _ = event_tx.send(ServerEvent::Disconnected { conn_id }).await;
                    }
                }
            }
            Command::SendTo {
                conn_id,
                bytes,
                reply,
            } => {
                let outbox = connections.get(&conn_id).and_then(|e| e.outbox.clone());
                let result = match outbox {
                    Some(outbox) => {
                        if outbox.try_send(bytes).is_ok() {
                            Ok(())
                        } else {
                            if let Some(entry) = connections.remove(&conn_id) {
                                warn!("client {} send failed, disconnecting", conn_id);
                                entry.token.cancel();
                                let _ =
                                    event_tx.send(ServerEvent::Disconnected { conn_id }).await;
                            }
                            Err(ServerError::ConnectionClosed)
                        }
                    }
                    None => Err(ServerError::ClientNotFound(conn_id)),
                };
                let _ = reply.send(result);
            }
            Command::SetIdentity {
                conn_id,
                uid,
                callsign,
            } => {
                if let Some(entry) = connections.get_mut(&conn_id) {
                    entry.info.uid = Some(uid);
                    if callsign.is_some() {
                        entry.info.callsign = callsign;
                    }
                }
            }
            Command::SetNegotiated { conn_id } => {
                if let Some(entry) = connections.get_mut(&conn_id) {
                    entry.info.negotiated = true;
                }
            }
            Command::Clients { reply } => {
                let infos = connections.values().map(|e| e.info.clone()).collect();
                let _ = reply.send(infos);
            }
        }
    }

    for (_, entry) in connections {
        entry.token.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    cmd_tx: mpsc::Sender<Command>,
    event_tx: mpsc::Sender<ServerEvent>,
    token: CancellationToken,
    keepalive_interval: Duration,
    server_uid: String,
) {
    let mut next_id: u64 = 1;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    let _ = tcp.set_nodelay(true);
                    let conn_id = next_id;
                    next_id += 1;
                    let acceptor = acceptor.clone();
                    let cmd_tx = cmd_tx.clone();
                    let event_tx = event_tx.clone();
                    let conn_token = token.child_token();
                    let keepalive = keepalive_interval;
                    let server_uid = server_uid.clone();
                    let _ = cmd_tx
                        .send(Command::Accepted {
                            conn_id,
                            endpoint: peer.to_string(),
                            token: conn_token.clone(),
                        })
                        .await;
                    tokio::spawn(async move {
                        debug!("connection {} from {}: TLS handshake", conn_id, peer);
                        let _ = cmd_tx.send(Command::Handshaking { conn_id }).await;
                        match acceptor.accept(tcp).await {
                            Ok(stream) => {
                                run_connection(
                                    stream,
                                    conn_id,
                                    peer.to_string(),
                                    cmd_tx,
                                    event_tx,
                                    conn_token,
                                    keepalive,
                                    server_uid,
                                )
                                .await;
                            }
                            // Unauthenticated or broken client.
                            Err(e) => {
                                debug!("TLS handshake from {} failed: {}", peer, e);
                                let _ = cmd_tx
                                    .send(Command::Deregister {
                                        conn_id,
                                        failed: true,
                                    })
                                    .await;
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("listener failed: {}", e);
                    let _ = event_tx
                        .send(ServerEvent::ListenerFailed { error: e.to_string() })
                        .await;
                    token.cancel();
                    break;
                }
            }
        }
    }
}

/// Drive one client connection: register as ready, advertise protocol
/// support, then read/frame/dispatch until the peer closes or the token
/// fires.
#[allow(clippy::too_many_arguments)]
async fn run_connection<S>(
    stream: S,
    conn_id: u64,
    endpoint: String,
    cmd_tx: mpsc::Sender<Command>,
    event_tx: mpsc::Sender<ServerEvent>,
    token: CancellationToken,
    keepalive_interval: Duration,
    server_uid: String,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Vec<u8>>(64);

    let _ = cmd_tx
        .send(Command::Register {
            conn_id,
            endpoint,
            outbox: outbox_tx.clone(),
            token: token.clone(),
        })
        .await;

    let write_token = token.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_token.cancelled() => break,
                msg = outbox_rx.recv() => match msg {
                    Some(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            write_token.cancel();
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    let keepalive_token = token.clone();
    let keepalive_out = outbox_tx.clone();
    let keepalive_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(keepalive_interval);
        ticker.tick().await; // consume the immediate tick
        loop {
            tokio::select! {
                _ = keepalive_token.cancelled() => break,
                _ = ticker.tick() => {
                    if keepalive_out
                        .send(control::to_wire(&control::keepalive()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    // Ready: the first thing a client sees is the protocol advertisement.
    let _ = outbox_tx
        .send(control::to_wire(&control::protocol_support(&server_uid)))
        .await;

    let mut framer = StreamFramer::new();
    let mut buf = [0u8; 4096];
    let mut failed = false;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    for message in framer.push(&buf[..n]) {
                        handle_message(
                            &message,
                            conn_id,
                            &outbox_tx,
                            &cmd_tx,
                            &event_tx,
                            &server_uid,
                        )
                        .await;
                    }
                }
                Err(e) => {
                    debug!("read error on client {}: {}", conn_id, e);
                    failed = true;
                    break;
                }
            }
        }
    }

    token.cancel();
    let _ = cmd_tx.send(Command::Deregister { conn_id, failed }).await;
    let _ = writer_task.await;
    let _ = keepalive_task.await;
}

async fn handle_message(
    message: &[u8],
    conn_id: u64,
    outbox: &mpsc::Sender<Vec<u8>>,
    cmd_tx: &mpsc::Sender<Command>,
    event_tx: &mpsc::Sender<ServerEvent>,
    server_uid: &str,
) {
    let event = match parse_event(message) {
        Ok(event) => event,
        Err(e) => {
            // Malformed input never takes the connection down.
            debug!("dropping unparseable message from client {}: {}", conn_id, e);
            return;
        }
    };

    if event.event_type == "t-x-takp-q" {
        let _ = outbox
            .send(control::to_wire(&control::protocol_response(server_uid)))
            .await;
        let _ = cmd_tx.send(Command::SetNegotiated { conn_id }).await;
        return;
    }

    if event.is_control() {
        // Pings get a pong; all control traffic stays off the radio.
        if event.event_type == "t-x-c-t" || event.uid == "ping" {
            let _ = outbox.send(control::to_wire(&control::keepalive())).await;
        }
        return;
    }

    if let Some(contact) = &event.contact {
        let _ = cmd_tx
            .send(Command::SetIdentity {
                conn_id,
                uid: event.uid.clone(),
                callsign: Some(contact.callsign.clone()).filter(|c| !c.is_empty()),
            })
            .await;
    }

    let _ = event_tx.send(ServerEvent::Event { conn_id, event }).await;
}
