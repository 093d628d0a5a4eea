// Announce controller (spec.md §4.8). Factored out of `torrent.rs`'s
// inline tier-iteration/jitter logic (kept verbatim below) and
// generalized to also drive DHT `get_peers` on the same cadence and on a
// low-peer-count trigger, merging both sources into one deduplicated,
// source-annotated candidate set per spec.md's `PeerAddress{ip,port,source}`.
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::Rng;

use crate::{
    dht::DhtHandle,
    tracker::{AnnounceParams, Event, Tracker, TrackerError},
};

pub type Result<T> = std::result::Result<T, AnnounceError>;

#[derive(Debug, thiserror::Error)]
pub enum AnnounceError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Incoming,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerCandidate {
    pub addr: SocketAddr,
    pub source: PeerSource,
}

// Repeated per-peer announce/connect failures push a peer's next retry
// further out rather than dropping it outright.
struct Backoff {
    failures: u32,
    last_failure: Instant,
}

const BACKOFF_BASE: Duration = Duration::from_secs(30);
const BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);
const JITTER_FRACTION: f64 = 0.10;

pub struct AnnounceController {
    info_hash: [u8; 20],
    client_id: [u8; 20],
    port: u16,
    trackers: Vec<Vec<Tracker>>,
    dht: Option<DhtHandle>,
    low_watermark: usize,
    next_dht_query: Option<Instant>,
    dht_interval: Duration,
    backoffs: HashMap<SocketAddr, Backoff>,
}

impl AnnounceController {
    pub fn new(
        info_hash: [u8; 20],
        client_id: [u8; 20],
        port: u16,
        trackers: Vec<Vec<Tracker>>,
        dht: Option<DhtHandle>,
        low_watermark: usize,
    ) -> Self {
        AnnounceController {
            info_hash,
            client_id,
            port,
            trackers,
            dht,
            low_watermark,
            next_dht_query: None,
            dht_interval: Duration::from_secs(15 * 60),
            backoffs: HashMap::new(),
        }
    }

    // Runs one announce pass: tier-ordered tracker announces (falling
    // through to the next tier only when every tracker in the current one
    // is skipped or fails) plus a DHT get_peers when due, merged and
    // deduplicated by address.
    #[tracing::instrument(skip(self), fields(peer_count))]
    pub async fn poll(&mut self, peer_count: usize, event: Option<Event>, time: Instant) -> Vec<PeerCandidate> {
        let mut seen: HashSet<SocketAddr> = HashSet::new();
        let mut candidates = Vec::new();

        let want_more = peer_count < self.low_watermark;
        let num_want = if want_more || event.is_some() {
            Some(self.low_watermark.saturating_sub(peer_count).max(1))
        } else {
            None
        };

        'tiers: for tier in self.trackers.iter_mut() {
            let mut tier_succeeded = false;
            for tracker in tier.iter_mut() {
                let due = event.is_some() || (want_more && tracker.can_announce(time)) || tracker.should_announce(time);
                if !due {
                    continue;
                }

                let params = AnnounceParams {
                    info_hash: self.info_hash,
                    client_id: self.client_id,
                    port: self.port,
                    uploaded: 0,
                    downloaded: 0,
                    left: 0,
                    event,
                    num_want,
                };

                match tracker.send_announce(params).await {
                    Ok(peers) => {
                        tier_succeeded = true;
                        for addr in peers {
                            if seen.insert(addr) {
                                candidates.push(PeerCandidate { addr, source: PeerSource::Tracker });
                            }
                        }
                    }
                    Err(e) => tracing::warn!("tracker {} announce failed: {}", tracker.url, e),
                }
            }
            if tier_succeeded {
                break 'tiers;
            }
        }

        if let Some(dht) = &self.dht {
            let due = self
                .next_dht_query
                .map(|next| time >= next)
                .unwrap_or(true)
                || want_more;

            if due {
                match dht.get_peers(self.info_hash).await {
                    Ok(peers) => {
                        for addr in peers {
                            if seen.insert(addr) {
                                candidates.push(PeerCandidate { addr, source: PeerSource::Dht });
                            }
                        }
                    }
                    Err(e) => tracing::debug!("dht get_peers failed: {}", e),
                }
                self.next_dht_query = Some(time + self.next_interval());
            }
        }

        candidates.retain(|c| self.is_eligible(c.addr, time));
        candidates
    }

    pub fn record_failure(&mut self, addr: SocketAddr, time: Instant) {
        let entry = self.backoffs.entry(addr).or_insert(Backoff { failures: 0, last_failure: time });
        entry.failures = entry.failures.saturating_add(1);
        entry.last_failure = time;
    }

    pub fn record_success(&mut self, addr: SocketAddr) {
        self.backoffs.remove(&addr);
    }

    fn is_eligible(&self, addr: SocketAddr, time: Instant) -> bool {
        match self.backoffs.get(&addr) {
            None => true,
            Some(b) => {
                let delay = BACKOFF_BASE.saturating_mul(1 << b.failures.min(6)).min(BACKOFF_CAP);
                time.duration_since(b.last_failure) >= delay
            }
        }
    }

    // The tracker-negotiated cadence across all known trackers, taking
    // the shortest (so the most demanding tracker's interval governs),
    // falling back to the DHT's own default, with ±10% jitter applied.
    fn next_interval(&self) -> Duration {
        let min_tracker_interval = self
            .trackers
            .iter()
            .flatten()
            .filter_map(|t| t.interval())
            .min();

        let base = min_tracker_interval.unwrap_or(self.dht_interval);
        let jitter = 1.0 + rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        Duration::from_secs_f64(base.as_secs_f64() * jitter)
    }

    pub async fn stop(&mut self, time: Instant) {
        let _ = self.poll(0, Some(Event::Stopped), time).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn controller() -> AnnounceController {
        let trackers = vec![vec![Tracker::new(Url::parse("udp://tracker.example.org:6969/announce").unwrap())]];
        AnnounceController::new([1u8; 20], [2u8; 20], 6881, trackers, None, 30)
    }

    #[test]
    fn newly_seen_peer_is_eligible() {
        let ctl = controller();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        assert!(ctl.is_eligible(addr, Instant::now()));
    }

    #[test]
    fn failed_peer_is_ineligible_until_backoff_elapses() {
        let mut ctl = controller();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let now = Instant::now();
        ctl.record_failure(addr, now);
        assert!(!ctl.is_eligible(addr, now));
    }

    #[test]
    fn success_clears_backoff() {
        let mut ctl = controller();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let now = Instant::now();
        ctl.record_failure(addr, now);
        ctl.record_success(addr);
        assert!(ctl.is_eligible(addr, now));
    }
}
