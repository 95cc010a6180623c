use super::peer_id::PeerId;
use crate::storage::PieceStore;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One outstanding block request: the unit of the wire `request` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

/// Sliding window of block requests for one unchoked peer.
///
/// The pipeline reserves pieces from the store, keeps up to `depth`
/// requests in flight, and tracks per-request deadlines. It is a passive
/// state machine: the owning peer task feeds it events and transmits the
/// requests it emits.
pub struct RequestPipeline {
    depth: usize,
    request_timeout: Duration,
    in_flight: HashMap<BlockRequest, Instant>,
    assigned: Vec<u32>,
}

impl RequestPipeline {
    pub fn new(depth: usize, request_timeout: Duration) -> Self {
        Self {
            depth,
            request_timeout,
            in_flight: HashMap::new(),
            assigned: Vec::new(),
        }
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.assigned.is_empty()
    }

    /// Tops the window up and returns the requests to transmit.
    ///
    /// Pieces whose reservation we lost (corruption reset, release) are
    /// dropped from the assignment list first. When the assigned pieces
    /// cannot fill the window, more pieces are reserved until the store has
    /// nothing left for this peer.
    pub fn fill(&mut self, store: &PieceStore, peer: PeerId, endgame: bool) -> Vec<BlockRequest> {
        self.assigned
            .retain(|&piece| store.holds_reservation(piece, peer));

        let mut out = Vec::new();
        loop {
            if self.in_flight.len() >= self.depth {
                return out;
            }
            for i in 0..self.assigned.len() {
                let piece = self.assigned[i];
                if self.in_flight.len() >= self.depth {
                    return out;
                }
                for request in store.missing_blocks(piece) {
                    if self.in_flight.len() >= self.depth {
                        return out;
                    }
                    if self.in_flight.contains_key(&request) {
                        continue;
                    }
                    self.in_flight.insert(request, Instant::now());
                    out.push(request);
                }
            }

            match store.reserve_piece(peer, endgame) {
                Some(piece) => self.assigned.push(piece),
                None => return out,
            }
        }
    }

    /// Records an arrived block. Returns `true` if we had asked for it.
    pub fn on_block(&mut self, request: &BlockRequest) -> bool {
        self.in_flight.remove(request).is_some()
    }

    /// The peer choked us: nothing in flight will be answered. Assigned
    /// pieces are released back to the store so other peers can pick the
    /// remaining blocks up; already-received blocks stay buffered there.
    pub fn on_choke(&mut self, store: &PieceStore, peer: PeerId) {
        self.in_flight.clear();
        for piece in self.assigned.drain(..) {
            store.release_reservation(piece, peer);
        }
    }

    /// Completed pieces no longer need an assignment slot.
    pub fn on_piece_done(&mut self, piece: u32) {
        self.assigned.retain(|&p| p != piece);
        self.in_flight.retain(|req, _| req.piece != piece);
    }

    /// Expires requests older than the timeout and returns them; the caller
    /// sends `cancel` for each and penalizes the peer's rate.
    pub fn expire(&mut self, now: Instant) -> Vec<BlockRequest> {
        let timeout = self.request_timeout;
        let expired: Vec<BlockRequest> = self
            .in_flight
            .iter()
            .filter(|(_, &sent_at)| now.duration_since(sent_at) >= timeout)
            .map(|(&req, _)| req)
            .collect();
        for request in &expired {
            self.in_flight.remove(request);
        }
        expired
    }
}
