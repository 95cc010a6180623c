use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Lifecycle event reported with an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Periodic announce, no event.
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    /// The `event` query value for HTTP trackers; empty means omitted.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    /// The numeric event code of the UDP protocol.
    pub fn as_udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

/// Everything a tracker needs to know about us for one announce.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the next periodic announce.
    pub interval: u32,
    /// Seeder count, when the tracker reports it.
    pub seeders: Option<u32>,
    /// Leecher count, when the tracker reports it.
    pub leechers: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            seeders: None,
            leechers: None,
            peers: Vec::new(),
        }
    }
}

/// Parses the compact peer format: 6 bytes per peer, 4-byte IPv4 then
/// 2-byte port, both big-endian. A trailing partial entry is ignored.
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}
