use std::{
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::{Duration, Instant},
};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time};
use url::Url;
use super::{AnnounceParams, Event, Result, TrackerError};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: i64 = 0x41727101980;
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;
const ACTION_SCRAPE: i32 = 2;
const CONNECTION_ID_LIFETIME: Duration = Duration::from_secs(60);
const CONNECTION_ID_REFRESH_MARGIN: Duration = Duration::from_secs(10);

// BEP 15's retransmission schedule is 15 * 2^n seconds; capped here at 60s
// rather than letting it grow to the spec's multi-hour tail.
const INITIAL_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RETRIES: u32 = 8;

#[derive(Debug, Default)]
pub struct UdpState {
    socket: Option<UdpSocket>,
    conn_id: Option<i64>,
    conn_established: Option<Instant>,
    retry_count: u32,
    is_connected: bool,
    rtt: Option<Duration>,
}

impl UdpState {
    pub fn new() -> Self {
        Self::default()
    }

    // Last measured round trip, excluding any request that needed a
    // retransmit (Karn's algorithm: a retransmitted probe's round trip is
    // ambiguous between the original and the retry, so it's never sampled).
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

pub struct ScrapeStats {
    pub complete: i32,
    pub downloaded: i32,
    pub incomplete: i32,
}

// The tracker's connection id is valid for one minute; refresh it a
// little early rather than racing the deadline.
fn conn_id_valid(state: &UdpState) -> bool {
    match (state.conn_id, state.conn_established) {
        (Some(_), Some(since)) => {
            since.elapsed() < CONNECTION_ID_LIFETIME.saturating_sub(CONNECTION_ID_REFRESH_MARGIN)
        }
        _ => false,
    }
}

// Retransmits with exponential backoff (capped at `MAX_TIMEOUT`) on
// timeout, up to `MAX_RETRIES` attempts, after which the session is
// considered failed and `is_connected` drops to false. An action or
// transaction-id mismatch is not retried: it means a reply to a different,
// still-in-flight exchange arrived, not that this one was dropped.
async fn send_and_recv(
    state: &mut UdpState,
    buf: &[u8],
    trans_id: i32,
    expected_action: i32,
) -> Result<Vec<u8>> {
    let mut timeout_duration = INITIAL_TIMEOUT;

    for attempt in 0..=MAX_RETRIES {
        let sock = state.socket.as_ref().expect("socket bound before send");
        sock.send(buf).await?;
        let sent_at = Instant::now();

        let mut resp_buf = [0u8; 1024];
        match time::timeout(timeout_duration, sock.recv(&mut resp_buf)).await {
            Ok(Ok(n)) => {
                if n < 8 {
                    return Err(TrackerError::ResponseError("invalid response length".to_string()));
                }
                let mut cursor = &resp_buf[..n];
                let action = cursor.get_i32();
                let txn = cursor.get_i32();
                if action != expected_action {
                    return Err(TrackerError::ResponseError(format!(
                        "expected action {expected_action}, got {action}"
                    )));
                }
                if txn != trans_id {
                    return Err(TrackerError::ResponseError("invalid transaction id".to_string()));
                }

                if attempt == 0 {
                    state.rtt = Some(sent_at.elapsed());
                }
                state.retry_count = 0;
                state.is_connected = true;
                return Ok(resp_buf[..n].to_vec());
            }
            Ok(Err(e)) => return Err(TrackerError::IoError(e)),
            Err(_elapsed) => {
                state.retry_count = state.retry_count.saturating_add(1);
                tracing::debug!(attempt, timeout = ?timeout_duration, "udp tracker request timed out, retrying");
                timeout_duration = (timeout_duration * 2).min(MAX_TIMEOUT);
            }
        }
    }

    state.is_connected = false;
    Err(TrackerError::ResponseError(format!("no response after {MAX_RETRIES} retries")))
}

async fn connect(state: &mut UdpState, url: &Url) -> Result<()> {

    if conn_id_valid(state) {
        return Ok(());
    }

    let host = url.host_str().ok_or(TrackerError::InvalidUrl)?;
    let port = url.port().ok_or(TrackerError::InvalidUrl)?;
    let addr = (host, port).to_socket_addrs()?.next().ok_or(TrackerError::InvalidUrl)?;

    // Bound once for the socket's entire lifetime; never recreated
    // implicitly even if a later send fails, per BEP 15's singular-socket
    // policy.
    if state.socket.is_none() {
        state.socket = Some(UdpSocket::bind("0.0.0.0:0").await?);
    }
    time::timeout(Duration::from_secs(10), state.socket.as_ref().unwrap().connect(addr)).await??;

    let trans_id = rand::random();
    let mut buf = BytesMut::with_capacity(16);
    buf.put_i64(PROTOCOL_ID);
    buf.put_i32(ACTION_CONNECT);
    buf.put_i32(trans_id);

    let resp = send_and_recv(state, &buf, trans_id, ACTION_CONNECT).await?;
    let mut cursor = &resp[8..];
    state.conn_id = Some(cursor.get_i64());
    state.conn_established = Some(Instant::now());

    tracing::trace!("connected to tracker");
    Ok(())
}

pub async fn announce(state: &mut UdpState, url: &Url, params: AnnounceParams) -> Result<Vec<SocketAddr>> {

    connect(state, url).await?;
    let conn_id = state.conn_id.expect("connect populates conn_id");

    let trans_id = rand::random();
    let mut buf = BytesMut::with_capacity(98);
    buf.put_i64(conn_id);
    buf.put_i32(ACTION_ANNOUNCE);
    buf.put_i32(trans_id);
    buf.put(&params.info_hash[..]);
    buf.put(&params.client_id[..]);
    buf.put_u64(params.downloaded);
    buf.put_u64(params.left);
    buf.put_u64(params.uploaded);
    buf.put_i32(match params.event {
        Some(Event::Started) => 2,
        Some(Event::Completed) => 1,
        Some(Event::Stopped) => 3,
        None => 0,
    });
    buf.put_i32(0); // IP address, default = 0.
    buf.put_i32(rand::random()); // Key, random.
    buf.put_i32(match params.num_want {
        Some(num_want) => num_want as i32,
        None => -1,
    });
    buf.put_u16(params.port);

    let resp = send_and_recv(state, &buf, trans_id, ACTION_ANNOUNCE).await?;
    if resp.len() < 20 {
        return Err(TrackerError::ResponseError("invalid response length".to_string()));
    }
    let mut cursor = &resp[8..];
    let _interval = cursor.get_i32();
    let _leechers = cursor.get_i32();
    let _seeders = cursor.get_i32();
    let num_peers = (resp.len() - 20) / 6;

    let mut peers = Vec::with_capacity(num_peers);
    for _ in 0..num_peers {
        let ip = cursor.get_u32();
        let port = cursor.get_u16();
        // A peer advertised at 0.0.0.0 or port 0 is never reachable and is
        // dropped; every other address, including private ranges, is kept
        // since a valid peer may sit behind NAT/VPN.
        if ip == 0 || port == 0 {
            continue;
        }
        peers.push(SocketAddr::new(Ipv4Addr::from(ip).into(), port));
    }

    tracing::info!("provided {} peers", peers.len());
    Ok(peers)
}

// BEP 15 scrape: returns (complete, downloaded, incomplete) triples in the
// same order as `info_hashes`.
pub async fn scrape(state: &mut UdpState, url: &Url, info_hashes: &[[u8; 20]]) -> Result<Vec<ScrapeStats>> {

    connect(state, url).await?;
    let conn_id = state.conn_id.expect("connect populates conn_id");

    let trans_id = rand::random();
    let mut buf = BytesMut::with_capacity(16 + info_hashes.len() * 20);
    buf.put_i64(conn_id);
    buf.put_i32(ACTION_SCRAPE);
    buf.put_i32(trans_id);
    for hash in info_hashes {
        buf.put(&hash[..]);
    }

    let resp = send_and_recv(state, &buf, trans_id, ACTION_SCRAPE).await?;
    let expected_len = 8 + info_hashes.len() * 12;
    if resp.len() < expected_len {
        return Err(TrackerError::ResponseError("invalid response length".to_string()));
    }

    let mut cursor = &resp[8..];
    let mut stats = Vec::with_capacity(info_hashes.len());
    for _ in 0..info_hashes.len() {
        stats.push(ScrapeStats {
            complete: cursor.get_i32(),
            downloaded: cursor.get_i32(),
            incomplete: cursor.get_i32(),
        });
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_id_invalid_before_connect() {
        let state = UdpState::new();
        assert!(!conn_id_valid(&state));
    }

    #[test]
    fn conn_id_valid_within_refresh_margin() {
        let mut state = UdpState::new();
        state.conn_id = Some(42);
        state.conn_established = Some(Instant::now());
        assert!(conn_id_valid(&state));
    }

    #[test]
    fn conn_id_invalid_past_refresh_margin() {
        let mut state = UdpState::new();
        state.conn_id = Some(42);
        state.conn_established = Some(Instant::now() - Duration::from_secs(51));
        assert!(!conn_id_valid(&state));
    }
}
