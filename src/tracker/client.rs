use super::error::TrackerError;
use super::http::HttpTracker;
use super::response::{AnnounceRequest, AnnounceResponse};
use super::udp::UdpTracker;
use crate::config::TRACKER_TIMEOUT;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;

/// A single tracker endpoint, HTTP or UDP, behind one announce interface.
pub enum Tracker {
    Http(HttpTracker),
    Udp(String),
}

impl Tracker {
    pub fn from_url(url: &str) -> Result<Self, TrackerError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Tracker::Http(HttpTracker::new(url)?))
        } else if url.starts_with("udp://") {
            Ok(Tracker::Udp(url.to_string()))
        } else {
            Err(TrackerError::UnsupportedScheme(url.to_string()))
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Tracker::Http(t) => t.url(),
            Tracker::Udp(url) => url,
        }
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        match self {
            Tracker::Http(tracker) => tracker.announce(request).await,
            // UDP trackers are connectionless at our layer: resolve and
            // obtain a fresh connection id per announce.
            Tracker::Udp(url) => UdpTracker::connect(url).await?.announce(request).await,
        }
    }
}

/// All trackers of a torrent, announced to concurrently.
pub struct TrackerSet {
    trackers: Vec<Arc<Tracker>>,
}

impl TrackerSet {
    /// Builds the set from tracker URLs, skipping unusable ones.
    pub fn from_urls(urls: &[String]) -> Result<Self, TrackerError> {
        let trackers: Vec<Arc<Tracker>> = urls
            .iter()
            .filter_map(|url| match Tracker::from_url(url) {
                Ok(tracker) => Some(Arc::new(tracker)),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "skipping tracker");
                    None
                }
            })
            .collect();

        if trackers.is_empty() {
            return Err(TrackerError::NoTrackers);
        }
        Ok(Self { trackers })
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Announces to every tracker concurrently and returns as soon as one
    /// succeeds, with that tracker's interval and the peers seen so far.
    ///
    /// The remaining announces keep running in the background; peers they
    /// discover (minus duplicates) are pushed into `late_peers`. The call
    /// fails only if every tracker fails.
    pub async fn announce(
        &self,
        request: AnnounceRequest,
        late_peers: Option<mpsc::UnboundedSender<Vec<SocketAddr>>>,
    ) -> Result<AnnounceResponse, TrackerError> {
        let mut announces = JoinSet::new();
        for tracker in &self.trackers {
            let tracker = Arc::clone(tracker);
            announces.spawn(async move {
                let outcome = timeout(TRACKER_TIMEOUT, tracker.announce(&request))
                    .await
                    .map_err(|_| TrackerError::Timeout)
                    .and_then(|r| r);
                (tracker, outcome)
            });
        }

        let seen: Arc<Mutex<HashSet<SocketAddr>>> = Arc::new(Mutex::new(HashSet::new()));

        while let Some(joined) = announces.join_next().await {
            let Ok((tracker, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(mut response) => {
                    tracing::debug!(
                        url = tracker.url(),
                        peers = response.peers.len(),
                        interval = response.interval,
                        "announce succeeded"
                    );
                    {
                        let mut seen = seen.lock();
                        response.peers.retain(|addr| seen.insert(*addr));
                    }

                    // Let the stragglers finish on their own time.
                    if let Some(late) = late_peers {
                        tokio::spawn(drain_announces(announces, seen, late));
                    }
                    return Ok(response);
                }
                Err(e) => {
                    tracing::debug!(url = tracker.url(), error = %e, "announce failed");
                }
            }
        }

        Err(TrackerError::AllFailed)
    }
}

async fn drain_announces(
    mut announces: JoinSet<(Arc<Tracker>, Result<AnnounceResponse, TrackerError>)>,
    seen: Arc<Mutex<HashSet<SocketAddr>>>,
    late_peers: mpsc::UnboundedSender<Vec<SocketAddr>>,
) {
    while let Some(joined) = announces.join_next().await {
        let Ok((tracker, Ok(mut response))) = joined else {
            continue;
        };
        {
            let mut seen = seen.lock();
            response.peers.retain(|addr| seen.insert(*addr));
        }
        if !response.peers.is_empty() {
            tracing::debug!(
                url = tracker.url(),
                peers = response.peers.len(),
                "late announce peers"
            );
            if late_peers.send(response.peers).is_err() {
                return;
            }
        }
    }
}
