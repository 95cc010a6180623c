use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::transport::PeerTransport;
use crate::config::HANDSHAKE_TIMEOUT;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// One authenticated TCP connection to a peer.
///
/// `connect` dials and completes the handshake; [`PeerLink::split`] then
/// turns the link into a [`PeerReader`] for the owning task and a cloneable
/// [`PeerHandle`] whose sends are queued to a dedicated writer task.
pub struct PeerLink {
    pub addr: SocketAddr,
    pub peer_id: PeerId,
    transport: PeerTransport,
}

impl PeerLink {
    /// Dials `addr` and runs the handshake. The whole exchange must finish
    /// within the handshake timeout; a peer presenting the wrong info-hash
    /// or our own peer ID is rejected.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        local_id: PeerId,
    ) -> Result<Self, PeerError> {
        let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let mut transport = PeerTransport::new(stream);

        transport
            .send_handshake(&Handshake::new(info_hash, *local_id.as_bytes()))
            .await?;

        let theirs = timeout(HANDSHAKE_TIMEOUT, transport.receive_handshake())
            .await
            .map_err(|_| PeerError::Timeout)??;

        if theirs.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        let peer_id = PeerId::from_bytes(theirs.peer_id);
        if peer_id == local_id {
            return Err(PeerError::SelfConnection);
        }

        Ok(Self {
            addr,
            peer_id,
            transport,
        })
    }

    /// Splits the link into its reading half and a sending handle.
    ///
    /// A writer task drains the outbound queue and injects keep-alives when
    /// the connection is quiet. Dropping every handle clone shuts the
    /// writer down and closes the socket's write side.
    pub fn split(
        self,
        queue_cap: usize,
        keepalive: Duration,
        idle_timeout: Duration,
    ) -> (PeerHandle, PeerReader) {
        let (stream, read_buf) = self.transport.into_parts();
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Message>(queue_cap);

        let peer_id = self.peer_id;
        tokio::spawn(async move {
            let mut writer = PeerTransport::from_parts(write_half, bytes::BytesMut::new());
            let mut keepalive_tick = tokio::time::interval(keepalive);
            keepalive_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            keepalive_tick.reset();

            loop {
                let message = tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = keepalive_tick.tick() => Message::KeepAlive,
                };

                if let Err(e) = writer.send_message(&message).await {
                    tracing::debug!(peer = ?peer_id, error = %e, "writer stopped");
                    break;
                }
                keepalive_tick.reset();
            }
        });

        let handle = PeerHandle {
            peer_id: self.peer_id,
            addr: self.addr,
            tx,
        };
        let reader = PeerReader {
            transport: PeerTransport::from_parts(read_half, read_buf),
            idle_timeout,
        };
        (handle, reader)
    }
}

/// Cloneable sending side of a connection.
///
/// Sends never block: the outbound queue holds a bounded number of
/// messages, and a peer that does not drain it fails with
/// [`PeerError::SlowPeer`].
#[derive(Clone)]
pub struct PeerHandle {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    pub fn send(&self, message: Message) -> Result<(), PeerError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::SlowPeer,
            mpsc::error::TrySendError::Closed(_) => PeerError::ConnectionClosed,
        })
    }
}

/// Receiving side of a connection, owned by the peer task.
pub struct PeerReader {
    transport: PeerTransport<OwnedReadHalf>,
    idle_timeout: Duration,
}

impl PeerReader {
    /// Next inbound message, in arrival order. A connection quiet for
    /// longer than the idle timeout is considered dead.
    pub async fn recv(&mut self) -> Result<Message, PeerError> {
        timeout(self.idle_timeout, self.transport.receive_message())
            .await
            .map_err(|_| PeerError::Timeout)?
    }
}
