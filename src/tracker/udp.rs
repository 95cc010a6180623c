use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng as _;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceRequest, AnnounceResponse};

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

// BEP-15 retransmission: 15 * 2^n seconds, n capped.
const RETRY_BASE: Duration = Duration::from_secs(15);
const MAX_RETRY_EXPONENT: u32 = 8;

/// A UDP tracker endpoint (BEP-15).
pub struct UdpTracker {
    socket: UdpSocket,
    addr: SocketAddr,
}

impl UdpTracker {
    /// Resolves a `udp://host:port/...` URL and binds a local socket.
    pub async fn connect(url: &str) -> Result<Self, TrackerError> {
        let authority = url
            .strip_prefix("udp://")
            .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
        let authority = authority.split('/').next().unwrap_or(authority);

        let addr = lookup_host(authority)
            .await
            .map_err(|_| TrackerError::InvalidUrl(url.to_string()))?
            .next()
            .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        Ok(Self { socket, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self.obtain_connection_id().await?;

        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        let mut frame = Vec::with_capacity(98);
        frame.extend_from_slice(&connection_id.to_be_bytes());
        frame.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&request.info_hash);
        frame.extend_from_slice(&request.peer_id);
        frame.extend_from_slice(&request.downloaded.to_be_bytes());
        frame.extend_from_slice(&request.left.to_be_bytes());
        frame.extend_from_slice(&request.uploaded.to_be_bytes());
        frame.extend_from_slice(&request.event.as_udp_id().to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes()); // ip: let the tracker use the source
        frame.extend_from_slice(&key.to_be_bytes());
        frame.extend_from_slice(&(-1i32).to_be_bytes()); // num_want: default
        frame.extend_from_slice(&request.port.to_be_bytes());

        let reply = self.exchange(&frame, 20).await?;

        let action = be_u32(&reply[0..4]);
        let reply_tid = be_u32(&reply[4..8]);

        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(&reply[8..]).into_owned();
            return Err(TrackerError::Failure(message));
        }
        if action != ACTION_ANNOUNCE || reply_tid != transaction_id {
            return Err(TrackerError::InvalidResponse("announce reply mismatch"));
        }

        let mut response = AnnounceResponse::new(be_u32(&reply[8..12]));
        response.leechers = Some(be_u32(&reply[12..16]));
        response.seeders = Some(be_u32(&reply[16..20]));
        response.peers = parse_compact_peers(&reply[20..]);

        Ok(response)
    }

    async fn obtain_connection_id(&self) -> Result<u64, TrackerError> {
        let transaction_id: u32 = rand::rng().random();

        let mut frame = Vec::with_capacity(16);
        frame.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        frame.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        frame.extend_from_slice(&transaction_id.to_be_bytes());

        let reply = self.exchange(&frame, 16).await?;

        if be_u32(&reply[0..4]) != ACTION_CONNECT || be_u32(&reply[4..8]) != transaction_id {
            return Err(TrackerError::InvalidResponse("connect reply mismatch"));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&reply[8..16]);
        Ok(u64::from_be_bytes(id))
    }

    /// Sends a frame and awaits a reply of at least `min_len` bytes,
    /// retransmitting with exponential backoff.
    async fn exchange(&self, frame: &[u8], min_len: usize) -> Result<Vec<u8>, TrackerError> {
        let mut buf = vec![0u8; 2048];

        for exponent in 0..=MAX_RETRY_EXPONENT {
            self.socket.send(frame).await?;

            let wait = RETRY_BASE * (1 << exponent);
            match timeout(wait, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) if n >= min_len => return Ok(buf[..n].to_vec()),
                Ok(Ok(_)) => return Err(TrackerError::InvalidResponse("reply too short")),
                Ok(Err(e)) => return Err(TrackerError::Io(e)),
                Err(_) => continue,
            }
        }

        Err(TrackerError::Timeout)
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
