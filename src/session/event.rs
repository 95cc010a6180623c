use crate::peer::{BlockRequest, PeerId};
use crate::storage::StorageError;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Upward traffic: peer task to coordinator.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Handshake complete; the coordinator may now command this peer.
    Joined {
        peer_id: PeerId,
        addr: SocketAddr,
        commands: mpsc::UnboundedSender<PeerCommand>,
    },
    /// The peer task ended. `peer_id` is `None` when the connection died
    /// before the handshake finished; `ban` asks for a session-wide ban.
    Closed {
        peer_id: Option<PeerId>,
        addr: SocketAddr,
        ban: bool,
    },
    /// The peer flipped its interest in our data.
    Interest { peer_id: PeerId, interested: bool },
    /// A fresh block was accepted by the store.
    BlockStored {
        peer_id: PeerId,
        request: BlockRequest,
    },
    /// We served a block to this peer.
    Uploaded { peer_id: PeerId, bytes: u64 },
    PieceCompleted { piece: u32 },
    PieceCorrupted { piece: u32, sources: Vec<PeerId> },
    /// Block requests expired; the peer's next rate sample is forfeit.
    RequestsTimedOut { peer_id: PeerId },
    /// Disk failure: the session cannot continue.
    Fatal(StorageError),
}

/// Downward traffic: coordinator to peer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerCommand {
    /// Apply a choke decision (true = choke).
    SetChoke(bool),
    /// A piece finished: advertise it and stop requesting it.
    PieceCompleted(u32),
    /// Another peer won the endgame race for this block.
    CancelBlock(BlockRequest),
    /// Disconnect and exit.
    Close,
}
