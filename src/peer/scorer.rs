use super::peer_id::PeerId;
use std::collections::HashMap;
use std::time::Instant;

/// Guard against division by zero for idle peers.
const EPSILON: f64 = 1.0;

#[derive(Debug, Default, Clone)]
struct RateStats {
    /// EWMA of the download rate in bytes/sec.
    rate: f64,
    /// EWMA of the squared deviation from the rate.
    variance: f64,
    /// Rounds spent in the top tier, capped; feeds the trust bonus.
    trust: u32,
    last_delivery: Option<Instant>,
}

/// Per-peer performance memory: smoothed rate, stability, and a trust
/// counter rewarding peers that keep earning a top slot.
///
/// The composite score is
/// `rate * (1 + trust/cap) * max(0.1, 1 - sqrt(variance)/(rate + eps))` —
/// fast is good, erratic is discounted, consistently fast is boosted up to
/// twice over.
pub struct PeerScorer {
    alpha: f64,
    trust_cap: u32,
    stats: HashMap<PeerId, RateStats>,
}

impl PeerScorer {
    pub fn new(alpha: f64, trust_cap: u32) -> Self {
        Self {
            alpha,
            trust_cap: trust_cap.max(1),
            stats: HashMap::new(),
        }
    }

    /// Folds one tick's byte count into the EWMA rate and variance.
    pub fn record_sample(&mut self, peer: PeerId, bytes: u64, elapsed_secs: f64) {
        let sample = if elapsed_secs > 0.0 {
            bytes as f64 / elapsed_secs
        } else {
            0.0
        };

        let stats = self.stats.entry(peer).or_default();
        // Variance uses the pre-update rate as the mean estimate.
        stats.variance =
            self.alpha * (sample - stats.rate).powi(2) + (1.0 - self.alpha) * stats.variance;
        stats.rate = self.alpha * sample + (1.0 - self.alpha) * stats.rate;
        if bytes > 0 {
            stats.last_delivery = Some(Instant::now());
        }
    }

    pub fn score(&self, peer: PeerId) -> f64 {
        let Some(stats) = self.stats.get(&peer) else {
            return 0.0;
        };
        let trust_bonus = 1.0 + stats.trust as f64 / self.trust_cap as f64;
        let stability =
            (1.0 - stats.variance.sqrt() / (stats.rate + EPSILON)).max(0.1);
        stats.rate * trust_bonus * stability
    }

    pub fn rate(&self, peer: PeerId) -> f64 {
        self.stats.get(&peer).map_or(0.0, |s| s.rate)
    }

    /// The peer made the top tier this round.
    pub fn record_win(&mut self, peer: PeerId) {
        let stats = self.stats.entry(peer).or_default();
        stats.trust = (stats.trust + 1).min(self.trust_cap);
    }

    /// The peer missed the top tier this round.
    pub fn record_loss(&mut self, peer: PeerId) {
        let stats = self.stats.entry(peer).or_default();
        stats.trust = stats.trust.saturating_sub(1);
    }

    /// Hash-mismatch penalty: the smoothed rate is wiped for this round.
    pub fn zero_rate(&mut self, peer: PeerId) {
        if let Some(stats) = self.stats.get_mut(&peer) {
            stats.rate = 0.0;
        }
    }

    pub fn last_delivery(&self, peer: PeerId) -> Option<Instant> {
        self.stats.get(&peer).and_then(|s| s.last_delivery)
    }

    pub fn forget(&mut self, peer: PeerId) {
        self.stats.remove(&peer);
    }
}
