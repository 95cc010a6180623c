use super::peer_id::PeerId;
use super::scorer::PeerScorer;
use rand::Rng as _;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// One peer's activity since the last choke tick.
#[derive(Debug, Clone, Copy)]
pub struct PeerSample {
    pub peer_id: PeerId,
    /// Payload bytes downloaded from the peer this tick.
    pub bytes: u64,
    /// Whether the peer is interested in our data.
    pub interested: bool,
}

/// A choke-state change to apply to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeDecision {
    pub peer_id: PeerId,
    pub unchoke: bool,
}

/// Periodic tit-for-tat reciprocation.
///
/// Every tick the scheduler folds rate samples into the [`PeerScorer`],
/// sizes the unchoke set from the measured download rate, unchokes the top
/// scorers plus a rotating optimistic pick, and emits only the state
/// changes. Peers that were unchoked but delivered nothing for the snub
/// window are treated as dead weight and excluded from the ranking.
pub struct ChokeScheduler {
    scorer: PeerScorer,
    base_slots: usize,
    slot_bandwidth: u64,
    optimistic_every: u32,
    snub_timeout: Duration,
    round: u32,
    optimistic: Option<PeerId>,
    /// Peers we currently have unchoked, with the unchoke instant.
    unchoked_since: HashMap<PeerId, Instant>,
}

impl ChokeScheduler {
    pub fn new(
        scorer: PeerScorer,
        base_slots: usize,
        slot_bandwidth: u64,
        optimistic_every: u32,
        snub_timeout: Duration,
    ) -> Self {
        Self {
            scorer,
            base_slots: base_slots.max(1),
            slot_bandwidth: slot_bandwidth.max(1),
            optimistic_every: optimistic_every.max(1),
            snub_timeout,
            round: 0,
            optimistic: None,
            unchoked_since: HashMap::new(),
        }
    }

    pub fn scorer_mut(&mut self) -> &mut PeerScorer {
        &mut self.scorer
    }

    /// Unchoke slots warranted by the current download rate: a base
    /// allotment plus one per slot-bandwidth of incoming traffic, with one
    /// slot-bandwidth of safety margin.
    pub fn slot_count(&self, download_rate: f64) -> usize {
        let margin = self.slot_bandwidth as f64;
        let warranted = ((download_rate + margin) / margin).ceil() as usize;
        warranted.max(self.base_slots)
    }

    /// Runs one reciprocation round and returns the choke flips to apply.
    pub fn tick(&mut self, samples: &[PeerSample], elapsed: Duration) -> Vec<ChokeDecision> {
        let now = Instant::now();
        let elapsed_secs = elapsed.as_secs_f64();

        for sample in samples {
            self.scorer
                .record_sample(sample.peer_id, sample.bytes, elapsed_secs);
        }

        let total: u64 = samples.iter().map(|s| s.bytes).sum();
        let download_rate = if elapsed_secs > 0.0 {
            total as f64 / elapsed_secs
        } else {
            0.0
        };
        let slots = self.slot_count(download_rate);

        let mut ranked: Vec<PeerId> = samples
            .iter()
            .filter(|s| s.interested && !self.is_snubbed(s.peer_id, now))
            .map(|s| s.peer_id)
            .collect();
        ranked.sort_by(|&a, &b| {
            self.scorer
                .score(b)
                .partial_cmp(&self.scorer.score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let top: HashSet<PeerId> = ranked.iter().take(slots).copied().collect();
        for sample in samples {
            if !sample.interested {
                continue;
            }
            if top.contains(&sample.peer_id) {
                self.scorer.record_win(sample.peer_id);
            } else {
                self.scorer.record_loss(sample.peer_id);
            }
        }

        self.round = self.round.wrapping_add(1);
        if self.round % self.optimistic_every == 0 {
            let pool: Vec<PeerId> = samples
                .iter()
                .filter(|s| s.interested && !top.contains(&s.peer_id))
                .map(|s| s.peer_id)
                .collect();
            self.optimistic = if pool.is_empty() {
                None
            } else {
                Some(pool[rand::rng().random_range(0..pool.len())])
            };
        }

        let mut unchoke_set = top;
        if let Some(optimistic) = self.optimistic {
            let still_interested = samples
                .iter()
                .any(|s| s.peer_id == optimistic && s.interested);
            if still_interested {
                unchoke_set.insert(optimistic);
            }
        }

        let mut decisions = Vec::new();
        for sample in samples {
            let currently = self.unchoked_since.contains_key(&sample.peer_id);
            let desired = unchoke_set.contains(&sample.peer_id);
            if desired == currently {
                continue;
            }
            decisions.push(ChokeDecision {
                peer_id: sample.peer_id,
                unchoke: desired,
            });
            if desired {
                self.unchoked_since.insert(sample.peer_id, now);
            } else {
                self.unchoked_since.remove(&sample.peer_id);
            }
        }

        // Anything not sampled anymore has disconnected.
        let present: HashSet<PeerId> = samples.iter().map(|s| s.peer_id).collect();
        self.unchoked_since.retain(|peer, _| present.contains(peer));

        decisions
    }

    pub fn remove_peer(&mut self, peer: PeerId) {
        self.unchoked_since.remove(&peer);
        if self.optimistic == Some(peer) {
            self.optimistic = None;
        }
        self.scorer.forget(peer);
    }

    fn is_snubbed(&self, peer: PeerId, now: Instant) -> bool {
        let Some(&since) = self.unchoked_since.get(&peer) else {
            return false;
        };
        if now.duration_since(since) < self.snub_timeout {
            return false;
        }
        match self.scorer.last_delivery(peer) {
            Some(delivery) => now.duration_since(delivery) >= self.snub_timeout,
            None => true,
        }
    }
}
