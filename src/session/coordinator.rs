use super::event::{PeerCommand, SessionEvent};
use super::peer_task::{self, PeerTask};
use crate::config::Config;
use crate::metainfo::Metainfo;
use crate::peer::{ChokeScheduler, PeerId, PeerSample, PeerScorer};
use crate::storage::{PieceStore, StorageError};
use crate::tracker::{AnnounceRequest, TrackerError, TrackerEvent, TrackerSet};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Session-scoped failures. Peer-scoped trouble never surfaces here; it is
/// handled by dropping the offending connection.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Disk trouble: fatal, the download cannot proceed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// No tracker yielded any peers.
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),
}

/// One torrent download session.
///
/// Owns the piece store, the tracker set, the choke scheduler, and the
/// table of live peer tasks; see the [module docs](crate::session).
pub struct Session {
    config: Arc<Config>,
    info_hash: [u8; 20],
    local_id: PeerId,
    store: Arc<PieceStore>,
    trackers: Arc<TrackerSet>,
}

impl Session {
    pub fn new(
        meta: &Metainfo,
        download_dir: PathBuf,
        config: Config,
    ) -> Result<Self, SessionError> {
        let store = PieceStore::new(download_dir, &meta.info, config.disk_permits)?;
        let trackers = TrackerSet::from_urls(&meta.trackers())?;

        Ok(Self {
            config: Arc::new(config),
            info_hash: *meta.info_hash.as_bytes(),
            local_id: PeerId::generate(),
            store: Arc::new(store),
            trackers: Arc::new(trackers),
        })
    }

    /// The piece store, exposed for inspection (progress, bitfield).
    pub fn store(&self) -> &Arc<PieceStore> {
        &self.store
    }

    /// Runs the session to completion: verify what is on disk, announce,
    /// connect peers, download, and shut down.
    pub async fn run(self) -> Result<(), SessionError> {
        self.store.verify_existing().await?;
        if self.store.is_finished() {
            tracing::info!("all pieces already present, nothing to download");
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (late_tx, late_rx) = mpsc::unbounded_channel();

        let first = self
            .trackers
            .announce(
                self.announce_request(TrackerEvent::Started),
                Some(late_tx.clone()),
            )
            .await?;
        let announce_interval = Duration::from_secs(u64::from(first.interval).clamp(30, 3600));
        tracing::info!(
            peers = first.peers.len(),
            interval = announce_interval.as_secs(),
            "tracker announce complete"
        );

        let mut coordinator = Coordinator {
            config: Arc::clone(&self.config),
            info_hash: self.info_hash,
            local_id: self.local_id,
            store: Arc::clone(&self.store),
            events_tx,
            peers: HashMap::new(),
            active_addrs: HashSet::new(),
            banned: HashSet::new(),
            backlog: VecDeque::new(),
            active_count: 0,
            downloaded: 0,
            uploaded: 0,
            scheduler: ChokeScheduler::new(
                PeerScorer::new(self.config.ewma_alpha, self.config.trust_cap),
                self.config.base_slots,
                self.config.slot_bandwidth,
                self.config.optimistic_every,
                self.config.snub_timeout,
            ),
        };
        coordinator.admit_peers(first.peers);

        let outcome = coordinator
            .event_loop(events_rx, late_rx, late_tx, &self.trackers, announce_interval)
            .await;

        coordinator.close_all_peers();
        if let Err(e) = self.store.flush().await {
            tracing::warn!(error = %e, "flush failed during shutdown");
        }
        self.farewell_announces(&coordinator, outcome.is_ok()).await;

        outcome
    }

    fn announce_request(&self, event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: *self.local_id.as_bytes(),
            port: self.config.port,
            uploaded: 0,
            downloaded: 0,
            left: self.store.bytes_left(),
            event,
        }
    }

    /// Best-effort `completed` and `stopped` announces on the way out.
    async fn farewell_announces(&self, coordinator: &Coordinator, completed: bool) {
        let farewell_budget = Duration::from_secs(10);

        if completed && self.store.is_finished() {
            let mut request = self.announce_request(TrackerEvent::Completed);
            request.downloaded = coordinator.downloaded;
            request.uploaded = coordinator.uploaded;
            let _ = timeout(farewell_budget, self.trackers.announce(request, None)).await;
        }

        let mut request = self.announce_request(TrackerEvent::Stopped);
        request.downloaded = coordinator.downloaded;
        request.uploaded = coordinator.uploaded;
        let _ = timeout(farewell_budget, self.trackers.announce(request, None)).await;
    }
}

struct PeerEntry {
    addr: SocketAddr,
    commands: mpsc::UnboundedSender<PeerCommand>,
    interested: bool,
    bytes_this_tick: u64,
    /// Set when a request timed out: the next rate sample counts as zero.
    forfeit_sample: bool,
    corrupt_strikes: u32,
}

enum Flow {
    Continue,
    Finished,
}

struct Coordinator {
    config: Arc<Config>,
    info_hash: [u8; 20],
    local_id: PeerId,
    store: Arc<PieceStore>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    peers: HashMap<PeerId, PeerEntry>,
    /// Addresses currently dialing or connected.
    active_addrs: HashSet<SocketAddr>,
    banned: HashSet<SocketAddr>,
    backlog: VecDeque<SocketAddr>,
    active_count: usize,
    downloaded: u64,
    uploaded: u64,
    scheduler: ChokeScheduler,
}

impl Coordinator {
    async fn event_loop(
        &mut self,
        mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut late_rx: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
        late_tx: mpsc::UnboundedSender<Vec<SocketAddr>>,
        trackers: &Arc<TrackerSet>,
        announce_interval: Duration,
    ) -> Result<(), SessionError> {
        let mut choke_tick = tokio::time::interval(self.config.choke_interval);
        choke_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_choke = Instant::now();

        let mut announce_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + announce_interval,
            announce_interval,
        );
        announce_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    // The coordinator holds a sender too, so recv never
                    // returns None while we are alive.
                    let Some(event) = event else { continue };
                    match self.handle_event(event)? {
                        Flow::Continue => {}
                        Flow::Finished => return Ok(()),
                    }
                }
                Some(addrs) = late_rx.recv() => {
                    self.admit_peers(addrs);
                }
                _ = choke_tick.tick() => {
                    let elapsed = last_choke.elapsed();
                    last_choke = Instant::now();
                    self.run_choke_round(elapsed);
                }
                _ = announce_tick.tick() => {
                    self.spawn_reannounce(Arc::clone(trackers), late_tx.clone());
                }
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) -> Result<Flow, SessionError> {
        match event {
            SessionEvent::Joined {
                peer_id,
                addr,
                commands,
            } => {
                tracing::debug!(?peer_id, %addr, "peer joined");
                self.peers.insert(
                    peer_id,
                    PeerEntry {
                        addr,
                        commands,
                        interested: false,
                        bytes_this_tick: 0,
                        forfeit_sample: false,
                        corrupt_strikes: 0,
                    },
                );
            }
            SessionEvent::Closed { peer_id, addr, ban } => {
                if let Some(peer_id) = peer_id {
                    self.peers.remove(&peer_id);
                    self.scheduler.remove_peer(peer_id);
                    // Reservation/availability release normally happens in
                    // the task; repeat it here in case it was aborted.
                    self.store.release_peer(peer_id);
                }
                if ban {
                    tracing::warn!(%addr, "banning misbehaving peer");
                    self.banned.insert(addr);
                }
                self.active_addrs.remove(&addr);
                self.active_count = self.active_count.saturating_sub(1);
                self.dial_from_backlog();
            }
            SessionEvent::Interest { peer_id, interested } => {
                if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.interested = interested;
                }
            }
            SessionEvent::BlockStored { peer_id, request } => {
                self.downloaded += u64::from(request.length);
                if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.bytes_this_tick += u64::from(request.length);
                }
                // During endgame the same block is racing on other peers;
                // rescind their copies.
                if self.in_endgame() {
                    for holder in self.store.reservation_holders(request.piece) {
                        if holder == peer_id {
                            continue;
                        }
                        if let Some(entry) = self.peers.get(&holder) {
                            let _ = entry.commands.send(PeerCommand::CancelBlock(request));
                        }
                    }
                }
            }
            SessionEvent::Uploaded { bytes, .. } => {
                self.uploaded += bytes;
            }
            SessionEvent::PieceCompleted { piece } => {
                let have = self.store.complete_count();
                let total = self.store.piece_count();
                tracing::info!(piece, have, total, "piece verified");

                for entry in self.peers.values() {
                    let _ = entry.commands.send(PeerCommand::PieceCompleted(piece));
                }

                if self.store.is_finished() {
                    tracing::info!(
                        downloaded = self.downloaded,
                        uploaded = self.uploaded,
                        "download complete"
                    );
                    return Ok(Flow::Finished);
                }
                if self.in_endgame() {
                    tracing::debug!(
                        remaining = self.store.remaining(),
                        "endgame racing active"
                    );
                }
            }
            SessionEvent::PieceCorrupted { piece, sources } => {
                tracing::warn!(piece, ?sources, "piece failed verification");
                for source in sources {
                    self.scheduler.scorer_mut().zero_rate(source);
                    let Some(entry) = self.peers.get_mut(&source) else {
                        continue;
                    };
                    entry.corrupt_strikes += 1;
                    if entry.corrupt_strikes >= self.config.max_corrupt_strikes {
                        tracing::warn!(?source, "too many corrupt pieces, disconnecting");
                        self.banned.insert(entry.addr);
                        let _ = entry.commands.send(PeerCommand::Close);
                    }
                }
            }
            SessionEvent::RequestsTimedOut { peer_id } => {
                if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.forfeit_sample = true;
                }
            }
            SessionEvent::Fatal(error) => {
                tracing::error!(error = %error, "fatal storage error");
                return Err(error.into());
            }
        }
        Ok(Flow::Continue)
    }

    /// Queues freshly discovered endpoints and dials as capacity allows.
    fn admit_peers(&mut self, addrs: Vec<SocketAddr>) {
        for addr in addrs {
            if self.banned.contains(&addr)
                || self.active_addrs.contains(&addr)
                || self.backlog.contains(&addr)
            {
                continue;
            }
            self.backlog.push_back(addr);
        }
        self.dial_from_backlog();
    }

    fn dial_from_backlog(&mut self) {
        while self.active_count < self.config.max_peers {
            let Some(addr) = self.backlog.pop_front() else {
                return;
            };
            if self.banned.contains(&addr) || self.active_addrs.contains(&addr) {
                continue;
            }

            self.active_addrs.insert(addr);
            self.active_count += 1;
            tokio::spawn(peer_task::run(PeerTask {
                addr,
                info_hash: self.info_hash,
                local_id: self.local_id,
                store: Arc::clone(&self.store),
                events: self.events_tx.clone(),
                config: Arc::clone(&self.config),
            }));
        }
    }

    fn run_choke_round(&mut self, elapsed: Duration) {
        let samples: Vec<PeerSample> = self
            .peers
            .iter_mut()
            .map(|(&peer_id, entry)| {
                let bytes = if entry.forfeit_sample {
                    0
                } else {
                    entry.bytes_this_tick
                };
                entry.bytes_this_tick = 0;
                entry.forfeit_sample = false;
                PeerSample {
                    peer_id,
                    bytes,
                    interested: entry.interested,
                }
            })
            .collect();

        for decision in self.scheduler.tick(&samples, elapsed) {
            if let Some(entry) = self.peers.get(&decision.peer_id) {
                tracing::debug!(peer = ?decision.peer_id, unchoke = decision.unchoke, "choke flip");
                let _ = entry
                    .commands
                    .send(PeerCommand::SetChoke(!decision.unchoke));
            }
        }
    }

    fn spawn_reannounce(
        &self,
        trackers: Arc<TrackerSet>,
        late_tx: mpsc::UnboundedSender<Vec<SocketAddr>>,
    ) {
        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: *self.local_id.as_bytes(),
            port: self.config.port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.store.bytes_left(),
            event: TrackerEvent::None,
        };
        tokio::spawn(async move {
            match trackers.announce(request, Some(late_tx.clone())).await {
                Ok(response) => {
                    if !response.peers.is_empty() {
                        let _ = late_tx.send(response.peers);
                    }
                }
                Err(e) => tracing::debug!(error = %e, "periodic announce failed"),
            }
        });
    }

    fn in_endgame(&self) -> bool {
        let remaining = self.store.remaining();
        remaining > 0 && remaining <= self.config.endgame_threshold
    }

    fn close_all_peers(&mut self) {
        for entry in self.peers.values() {
            let _ = entry.commands.send(PeerCommand::Close);
        }
        self.peers.clear();
    }
}
