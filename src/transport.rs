//! # Transports
//!
//! Listeners and per-peer workers that turn sockets into frame batches for a
//! [`PairRouter`] and drain each slot's egress queue back onto the wire.
//!
//! ## Stream Sniffing
//!
//! Every accepted TCP connection is classified by its first bytes:
//!
//! | First bytes | Transport |
//! |-------------|-----------|
//! | `0x16` (TLS ClientHello) | secure WebSocket, when a TLS identity is configured |
//! | `GET` | WebSocket |
//! | anything else, or nothing within [`SNIFF_TIMEOUT`] | raw stream |
//!
//! Admission is requested before any handshake so a refused peer is closed
//! immediately.
//!
//! ## Workers
//!
//! One task per stream slot: a `select!` over socket reads and the slot's
//! egress queue. The worker ends on EOF, transport error, shutdown, or when
//! the router drops the slot (which closes the egress queue). UDP slots share
//! the listening socket; each gets a small writer task instead.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::frame::{FrameParser, parse_datagram};
use crate::router::{EGRESS_QUEUE_DEPTH, PairRouter};
use crate::slots::{Role, SlotId, TransportKind};

// ============================================================================
// Constants
// ============================================================================

/// Pending connections queued by the kernel per TCP listener.
pub const TCP_BACKLOG: u32 = 8;

/// How long to wait for a new stream's first bytes before treating it as raw.
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on TLS plus WebSocket handshakes.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest UDP datagram accepted.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

const READ_BUF_SIZE: usize = 4096;

const TLS_HANDSHAKE_RECORD: u8 = 0x16;

// ============================================================================
// Binding
// ============================================================================

pub async fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    UdpSocket::bind(addr).await
}

pub fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(TCP_BACKLOG)
}

// ============================================================================
// UDP
// ============================================================================

/// Receive datagrams for one role of a pair until shutdown.
pub async fn run_udp_listener(
    socket: Arc<UdpSocket>,
    role: Role,
    router: PairRouter,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, peer)) => {
                        let frames = parse_datagram(&buf[..n]);
                        router.datagram(role, peer, frames, socket.clone()).await;
                    }
                    Err(e) => {
                        debug!(port2 = router.port2(), error = %e, "udp receive failed");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    trace!(port2 = router.port2(), ?role, "udp listener stopped");
}

/// Writer task for one UDP peer. Ends when the returned sender is dropped.
pub fn spawn_udp_writer(socket: Arc<UdpSocket>, peer: SocketAddr) -> mpsc::Sender<Vec<u8>> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(EGRESS_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                trace!(%peer, error = %e, "udp send failed");
            }
        }
    });
    tx
}

// ============================================================================
// TCP
// ============================================================================

/// Accept stream peers for one role of a pair until shutdown.
pub async fn run_tcp_listener(
    listener: TcpListener,
    role: Role,
    router: PairRouter,
    tls: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        tokio::spawn(serve_stream(
                            stream,
                            peer,
                            role,
                            router.clone(),
                            tls.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(port2 = router.port2(), error = %e, "tcp accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    trace!(port2 = router.port2(), ?role, "tcp listener stopped");
}

async fn sniff(stream: &TcpStream, tls_enabled: bool) -> TransportKind {
    let mut head = [0u8; 4];
    let n = match tokio::time::timeout(SNIFF_TIMEOUT, stream.peek(&mut head)).await {
        Ok(Ok(n)) => n,
        Ok(Err(_)) | Err(_) => 0,
    };
    match &head[..n] {
        [TLS_HANDSHAKE_RECORD, ..] if tls_enabled => TransportKind::SecureWebSocket,
        [b'G', rest @ ..] if rest.iter().zip(b"ET").all(|(a, b)| a == b) => TransportKind::WebSocket,
        _ => TransportKind::Tcp,
    }
}

async fn serve_stream(
    stream: TcpStream,
    peer: SocketAddr,
    role: Role,
    router: PairRouter,
    tls: Option<TlsAcceptor>,
    shutdown: watch::Receiver<bool>,
) {
    let kind = sniff(&stream, tls.is_some()).await;
    let (egress_tx, egress_rx) = mpsc::channel(EGRESS_QUEUE_DEPTH);
    let Some(slot) = router.connect(role, kind, peer, egress_tx).await else {
        // Refused: dropping the stream closes it.
        return;
    };

    let worker = Worker { router: router.clone(), slot, egress_rx, shutdown };
    let reason = match kind {
        TransportKind::Tcp => worker.run_stream(stream).await,
        TransportKind::WebSocket => {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream)).await {
                Ok(Ok(ws)) => {
                    router.established(slot).await;
                    worker.run_websocket(ws).await
                }
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "websocket handshake failed");
                    "handshake failed"
                }
                Err(_) => "handshake timeout",
            }
        }
        TransportKind::SecureWebSocket => match tls {
            Some(acceptor) => {
                let handshake = async {
                    let tls_stream = acceptor.accept(stream).await.map_err(|e| e.to_string())?;
                    tokio_tungstenite::accept_async(tls_stream)
                        .await
                        .map_err(|e| e.to_string())
                };
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
                    Ok(Ok(ws)) => {
                        router.established(slot).await;
                        worker.run_websocket(ws).await
                    }
                    Ok(Err(e)) => {
                        debug!(%peer, error = %e, "secure websocket handshake failed");
                        "handshake failed"
                    }
                    Err(_) => "handshake timeout",
                }
            }
            None => "no tls identity",
        },
        TransportKind::Udp => "unexpected transport",
    };
    router.disconnected(slot, reason).await;
}

// ============================================================================
// Stream Workers
// ============================================================================

struct Worker {
    router: PairRouter,
    slot: SlotId,
    egress_rx: mpsc::Receiver<Vec<u8>>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    /// Raw byte stream: frames may span reads.
    async fn run_stream<S>(mut self, stream: S) -> &'static str
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut parser = FrameParser::new();
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    match read {
                        Ok(0) => return "eof",
                        Ok(n) => {
                            let frames = parser.push(&buf[..n]);
                            if !frames.is_empty() {
                                self.router.frames(self.slot, frames).await;
                            }
                        }
                        Err(e) => {
                            debug!(slot = self.slot, error = %e, "stream read failed");
                            return "read error";
                        }
                    }
                }
                outgoing = self.egress_rx.recv() => {
                    let Some(bytes) = outgoing else {
                        return "closed by relay";
                    };
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!(slot = self.slot, error = %e, "stream write failed");
                        return "write error";
                    }
                }
                _ = self.shutdown.changed() => return "shutdown",
            }
        }
    }

    /// WebSocket: each binary or text message carries frame bytes.
    async fn run_websocket<S>(mut self, ws: tokio_tungstenite::WebSocketStream<S>) -> &'static str
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        let mut parser = FrameParser::new();
        let reason = loop {
            tokio::select! {
                incoming = stream.next() => {
                    let data = match incoming {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Close(_))) | None => break "closed",
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(slot = self.slot, error = %e, "websocket read failed");
                            break "read error";
                        }
                    };
                    let frames = parser.push(&data);
                    if !frames.is_empty() {
                        self.router.frames(self.slot, frames).await;
                    }
                }
                outgoing = self.egress_rx.recv() => {
                    let Some(bytes) = outgoing else {
                        break "closed by relay";
                    };
                    if let Err(e) = sink.send(Message::Binary(bytes)).await {
                        debug!(slot = self.slot, error = %e, "websocket write failed");
                        break "write error";
                    }
                }
                _ = self.shutdown.changed() => break "shutdown",
            }
        };
        let _ = sink.close().await;
        reason
    }
}
