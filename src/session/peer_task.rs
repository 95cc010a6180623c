use super::event::{PeerCommand, SessionEvent};
use crate::config::{Config, MAX_REQUEST_LENGTH};
use crate::peer::{
    Bitfield, BlockRequest, Message, PeerError, PeerHandle, PeerId, PeerLink, RequestPipeline,
};
use crate::storage::{BlockOutcome, PieceStore, StorageError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Misbehavior tolerance before the connection is dropped and banned.
const MAX_STRIKES: u32 = 3;

pub(crate) struct PeerTask {
    pub addr: SocketAddr,
    pub info_hash: [u8; 20],
    pub local_id: PeerId,
    pub store: Arc<PieceStore>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub config: Arc<Config>,
}

/// Drives one peer connection from dial to disconnect. Every exit path
/// reports a `Closed` event so the coordinator can tidy the table.
pub(crate) async fn run(task: PeerTask) {
    let addr = task.addr;
    let events = task.events.clone();

    match drive(task).await {
        Ok(ended) => {
            let _ = events.send(SessionEvent::Closed {
                peer_id: ended.peer_id,
                addr,
                ban: ended.ban,
            });
        }
        Err(Departure { peer_id, error }) => {
            tracing::debug!(%addr, error = %error, "peer connection ended");
            let ban = matches!(error, PeerError::Misbehavior(_));
            let _ = events.send(SessionEvent::Closed { peer_id, addr, ban });
        }
    }
}

struct Ended {
    peer_id: Option<PeerId>,
    ban: bool,
}

struct Departure {
    peer_id: Option<PeerId>,
    error: PeerError,
}

struct PeerCtx {
    peer_id: PeerId,
    handle: PeerHandle,
    store: Arc<PieceStore>,
    events: mpsc::UnboundedSender<SessionEvent>,
    config: Arc<Config>,
    pipeline: RequestPipeline,
    peer_choking: bool,
    am_interested: bool,
    am_choking: bool,
    strikes: u32,
    last_inbound: Instant,
}

async fn drive(task: PeerTask) -> Result<Ended, Departure> {
    let link = PeerLink::connect(task.addr, task.info_hash, task.local_id)
        .await
        .map_err(|error| Departure {
            peer_id: None,
            error,
        })?;
    let peer_id = link.peer_id;
    let fail = |error| Departure {
        peer_id: Some(peer_id),
        error,
    };

    let (handle, mut reader) = link.split(
        task.config.outbound_queue,
        task.config.keepalive_interval,
        task.config.idle_timeout,
    );

    // Advertise what we already have before anything else.
    let ours = task.store.bitfield();
    if !ours.is_empty() {
        handle.send(Message::Bitfield(ours.to_bytes())).map_err(fail)?;
    }

    // Until a bitfield arrives the peer claims nothing.
    task.store
        .register_peer(peer_id, Bitfield::new(task.store.piece_count()));

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let _ = task.events.send(SessionEvent::Joined {
        peer_id,
        addr: task.addr,
        commands: command_tx,
    });

    let mut ctx = PeerCtx {
        peer_id,
        handle,
        store: task.store,
        events: task.events,
        pipeline: RequestPipeline::new(task.config.pipeline_depth, task.config.request_timeout),
        config: task.config,
        peer_choking: true,
        am_interested: false,
        am_choking: true,
        strikes: 0,
        last_inbound: Instant::now(),
    };

    let mut housekeeping = tokio::time::interval(Duration::from_secs(1));
    housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            inbound = reader.recv() => {
                match inbound {
                    Ok(message) => {
                        if let Err(e) = ctx.on_message(message).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e),
                }
            }
            command = command_rx.recv() => {
                match command {
                    Some(PeerCommand::Close) | None => break Ok(()),
                    Some(command) => {
                        if let Err(e) = ctx.on_command(command) {
                            break Err(e);
                        }
                    }
                }
            }
            _ = housekeeping.tick() => {
                if let Err(e) = ctx.on_housekeeping() {
                    break Err(e);
                }
            }
        }
    };

    ctx.store.release_peer(peer_id);

    match result {
        Ok(()) => Ok(Ended {
            peer_id: Some(peer_id),
            ban: false,
        }),
        Err(error) => Err(fail(error)),
    }
}

impl PeerCtx {
    async fn on_message(&mut self, message: Message) -> Result<(), PeerError> {
        self.last_inbound = Instant::now();
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                // Nothing in flight survives a choke; hand the pieces back.
                self.pipeline.on_choke(&self.store, self.peer_id);
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.refill()?;
            }
            Message::Interested => {
                let _ = self.events.send(SessionEvent::Interest {
                    peer_id: self.peer_id,
                    interested: true,
                });
            }
            Message::NotInterested => {
                let _ = self.events.send(SessionEvent::Interest {
                    peer_id: self.peer_id,
                    interested: false,
                });
            }
            Message::Have { piece } => {
                if piece as usize >= self.store.piece_count() {
                    return self.strike("have for impossible piece");
                }
                self.store.peer_has(self.peer_id, piece);
                self.update_interest()?;
                self.refill()?;
            }
            Message::Bitfield(bytes) => {
                let Some(bitfield) = Bitfield::from_wire(&bytes, self.store.piece_count()) else {
                    return self.strike("oversize bitfield");
                };
                self.store.register_peer(self.peer_id, bitfield);
                self.update_interest()?;
                self.refill()?;
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                self.serve_block(index, begin, length).await?;
            }
            Message::Piece { index, begin, data } => {
                self.accept_block(index, begin, data).await?;
            }
            // We answer requests synchronously, so there is never a queued
            // response to withdraw.
            Message::Cancel { .. } => {}
        }
        Ok(())
    }

    fn on_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        match command {
            PeerCommand::SetChoke(choke) => {
                if choke != self.am_choking {
                    self.am_choking = choke;
                    self.handle.send(if choke {
                        Message::Choke
                    } else {
                        Message::Unchoke
                    })?;
                }
            }
            PeerCommand::PieceCompleted(piece) => {
                self.pipeline.on_piece_done(piece);
                self.handle.send(Message::Have { piece })?;
                self.update_interest()?;
                self.refill()?;
            }
            PeerCommand::CancelBlock(request) => {
                // Only rescind what we actually have outstanding.
                if self.pipeline.on_block(&request) {
                    self.handle.send(Message::Cancel {
                        index: request.piece,
                        begin: request.offset,
                        length: request.length,
                    })?;
                    self.refill()?;
                }
            }
            // Close is intercepted by the select loop before we get here.
            PeerCommand::Close => {}
        }
        Ok(())
    }

    fn on_housekeeping(&mut self) -> Result<(), PeerError> {
        // The reader's own timeout restarts whenever the select loop wakes
        // for another branch, so idle enforcement lives here.
        if self.last_inbound.elapsed() >= self.config.idle_timeout {
            return Err(PeerError::Timeout);
        }

        let expired = self.pipeline.expire(Instant::now());
        if !expired.is_empty() {
            tracing::debug!(
                peer = ?self.peer_id,
                count = expired.len(),
                "rescinding timed out requests"
            );
            for request in &expired {
                self.handle.send(Message::Cancel {
                    index: request.piece,
                    begin: request.offset,
                    length: request.length,
                })?;
            }
            let _ = self.events.send(SessionEvent::RequestsTimedOut {
                peer_id: self.peer_id,
            });
        }
        // Periodic refill: pieces released elsewhere (disconnects,
        // corruption resets) would otherwise never reach an idle peer.
        self.refill()
    }

    async fn accept_block(
        &mut self,
        index: u32,
        begin: u32,
        data: bytes::Bytes,
    ) -> Result<(), PeerError> {
        let request = BlockRequest {
            piece: index,
            offset: begin,
            length: data.len() as u32,
        };
        let was_in_flight = self.pipeline.on_block(&request);
        let endgame = self.endgame();
        if !was_in_flight && !endgame && !self.store.has_piece(index) {
            // A block we never asked for outside the racing phase. Late
            // deliveries for pieces that already completed (the endgame
            // check goes false the instant the last piece lands) fall
            // through to the store's Duplicate handling instead.
            return self.strike("unsolicited block");
        }

        let outcome = match self.store.submit_block(index, begin, data, self.peer_id).await {
            Ok(outcome) => outcome,
            Err(e) => return self.fatal(e),
        };

        match outcome {
            BlockOutcome::Rejected => return self.strike("invalid block geometry"),
            BlockOutcome::Duplicate => {}
            BlockOutcome::Accepted => {
                let _ = self.events.send(SessionEvent::BlockStored {
                    peer_id: self.peer_id,
                    request,
                });
            }
            BlockOutcome::PieceComplete(piece) => {
                let _ = self.events.send(SessionEvent::BlockStored {
                    peer_id: self.peer_id,
                    request,
                });
                self.pipeline.on_piece_done(piece);
                let _ = self.events.send(SessionEvent::PieceCompleted { piece });
            }
            BlockOutcome::PieceCorrupt { piece, sources } => {
                let _ = self.events.send(SessionEvent::BlockStored {
                    peer_id: self.peer_id,
                    request,
                });
                self.pipeline.on_piece_done(piece);
                let _ = self.events.send(SessionEvent::PieceCorrupted { piece, sources });
            }
        }

        self.refill()
    }

    /// Serves a `request` from a peer we have unchoked (reciprocation).
    async fn serve_block(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        if self.am_choking {
            // Requests sent while choked are simply dropped.
            return Ok(());
        }
        if length == 0 || length > MAX_REQUEST_LENGTH {
            return self.strike("oversize request");
        }
        if !self.store.has_piece(index)
            || begin as u64 + length as u64 > self.store.piece_size(index)
        {
            return self.strike("request for data we do not have");
        }

        let data = match self.store.read_block(index, begin, length).await {
            Ok(data) => data,
            Err(StorageError::PieceNotComplete(_)) => {
                return self.strike("request for data we do not have")
            }
            Err(e) => return self.fatal(e),
        };

        self.handle.send(Message::Piece {
            index,
            begin,
            data,
        })?;
        let _ = self.events.send(SessionEvent::Uploaded {
            peer_id: self.peer_id,
            bytes: length as u64,
        });
        Ok(())
    }

    /// Declares or withdraws interest based on whether the peer still has
    /// anything we lack.
    fn update_interest(&mut self) -> Result<(), PeerError> {
        let useful = self.store.peer_is_useful(self.peer_id);
        if useful && !self.am_interested {
            self.am_interested = true;
            self.handle.send(Message::Interested)?;
        } else if !useful && self.am_interested {
            self.am_interested = false;
            self.handle.send(Message::NotInterested)?;
        }
        Ok(())
    }

    /// Tops the request window up when the peer will serve us.
    fn refill(&mut self) -> Result<(), PeerError> {
        if self.peer_choking || !self.am_interested {
            return Ok(());
        }
        let endgame = self.endgame();
        for request in self.pipeline.fill(&self.store, self.peer_id, endgame) {
            self.handle.send(Message::Request {
                index: request.piece,
                begin: request.offset,
                length: request.length,
            })?;
        }
        Ok(())
    }

    fn endgame(&self) -> bool {
        let remaining = self.store.remaining();
        remaining > 0 && remaining <= self.config.endgame_threshold
    }

    fn strike(&mut self, what: &'static str) -> Result<(), PeerError> {
        self.strikes += 1;
        tracing::debug!(peer = ?self.peer_id, what, strikes = self.strikes, "peer misbehavior");
        if self.strikes >= MAX_STRIKES {
            return Err(PeerError::Misbehavior(what));
        }
        Ok(())
    }

    fn fatal(&mut self, error: StorageError) -> Result<(), PeerError> {
        let _ = self.events.send(SessionEvent::Fatal(error));
        Err(PeerError::ConnectionClosed)
    }
}
