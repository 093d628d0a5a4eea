use std::{net::SocketAddr, time::{Duration, Instant}};
use url::Url;

mod http;
mod udp;
use http::HttpState;
use udp::UdpState;
pub use udp::ScrapeStats;

type Result<T> = std::result::Result<T, TrackerError>;

// In cases where the tracker doesn't give us a min interval.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: u64 = 60; // seconds

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("response error: {0}")]
    ResponseError(String),

    #[error("scrape is not supported over this tracker's transport")]
    ScrapeUnsupported,

}

#[derive(Debug, Copy, Clone, Default)]
pub struct AnnounceParams {

    // Hash of info dict.
    pub info_hash: [u8; 20],

    // Urlencoded 20-byte string used as a unique ID for the client.
    pub client_id: [u8; 20],

    // Port number.
    pub port: u16,

    // The total amount uploaded (since the client sent the 'started' event to the tracker) in base ten ASCII.
    pub uploaded: u64,

    // The total amount downloaded (since the client sent the 'started' event to the tracker) in base ten ASCII.
    pub downloaded: u64,

    // The number of bytes this client still has to download in base ten ASCII.
    pub left: u64,

    // If specified, must be one of started, completed, stopped, (or empty which is the same as not being specified).
    // If not specified, then this request is one performed at regular intervals.
    pub event: Option<Event>,

    // Number of peers that the client would like to receive from the tracker.
    pub num_want: Option<usize>,

}

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum Event {

    Completed,

    #[default]
    Started,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

// A tracker as the torrent's announce loop sees it: a URL, the
// negotiated announce cadence, and whichever transport (HTTP or UDP,
// per BEP 3/BEP 15) the scheme calls for.
#[derive(Debug)]
pub struct Tracker {

    pub url: Url,

    pub tracker_id: Option<String>,

    pub last_announce: Option<Instant>,

    interval: Option<Duration>,

    min_interval: Option<Duration>,

    transport: Transport,

}

#[derive(Debug)]
enum Transport {
    Http(HttpState),
    Udp(UdpState),
}

impl Tracker {

    pub fn new(url: Url) -> Self {
        let transport = match url.scheme() {
            "udp" => Transport::Udp(UdpState::new()),
            _ => Transport::Http(HttpState::new()),
        };
        Self {
            url,
            tracker_id: None,
            last_announce: None,
            interval: None,
            min_interval: None,
            transport,
        }
    }

    pub async fn send_announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>> {
        let peers = match &mut self.transport {
            Transport::Http(state) => {
                let (peers, id, interval, min_interval) = http::announce(state, &self.url, &self.tracker_id, params).await?;
                if let Some(id) = id {
                    self.tracker_id = Some(id);
                }
                if let Some(interval) = interval {
                    self.interval = Some(interval);
                }
                if let Some(min_interval) = min_interval {
                    self.min_interval = Some(min_interval);
                }
                peers
            }
            Transport::Udp(state) => udp::announce(state, &self.url, params).await?,
        };
        self.last_announce = Some(Instant::now());
        Ok(peers)
    }

    // The tracker-negotiated regular announce interval, if one has been seen yet.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    // BEP 15 scrape. UDP trackers only; HTTP scrape requires rewriting the
    // announce URL's `announce` path segment to `scrape` and a separate
    // bencode response shape this client doesn't parse, so HTTP trackers
    // report `ScrapeUnsupported` rather than silently no-op.
    pub async fn scrape(&mut self, info_hashes: &[[u8; 20]]) -> Result<Vec<ScrapeStats>> {
        match &mut self.transport {
            Transport::Udp(state) => udp::scrape(state, &self.url, info_hashes).await,
            Transport::Http(_) => Err(TrackerError::ScrapeUnsupported),
        }
    }

    // Whether we are still within the tracker's minimum re-announce interval.
    pub fn can_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => time.duration_since(last) >= self.min_interval.unwrap_or(Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL)),
            None => true,
        }
    }

    // Whether it's time for our next regular-interval announce.
    pub fn should_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => time.duration_since(last) >= self.interval.unwrap_or(Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL)),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_dispatches_on_scheme() {
        let http = Tracker::new(Url::parse("http://tracker.example.org:6969/announce").unwrap());
        assert!(matches!(http.transport, Transport::Http(_)));
        let udp = Tracker::new(Url::parse("udp://tracker.example.org:6969/announce").unwrap());
        assert!(matches!(udp.transport, Transport::Udp(_)));
    }

    #[test]
    fn can_announce_true_before_first_announce() {
        let tracker = Tracker::new(Url::parse("http://tracker.example.org:6969/announce").unwrap());
        assert!(tracker.can_announce(Instant::now()));
        assert!(tracker.should_announce(Instant::now()));
    }
}
