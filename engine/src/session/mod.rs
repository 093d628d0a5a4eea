// Session manager (spec.md §4.11): owns the one listening TCP socket and
// one UDP socket the whole daemon shares, and the info_hash -> torrent map
// behind a single mutex (spec.md §5's single-mutex ordering guarantee).
// Not present in the teacher, which has each `Torrent` bind its own
// listener; generalized from `torrent.rs`'s former inline accept loop
// (now removed there, see `CommandToTorrent::IncomingPeer`).
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, UdpSocket},
    sync::Mutex,
    task::JoinHandle,
};

use crate::{
    dht::{DhtHandle, DhtNode, NodeId},
    torrent::{CommandToTorrent, TorrentTx},
};

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dht(#[from] crate::dht::DhtError),
}

const HANDSHAKE_PSTRLEN: u8 = 19;
const HANDSHAKE_LEN: usize = 68;
const INFO_HASH_OFFSET: usize = 1 + 19 + 8;

pub struct SessionManager {
    torrents: Arc<Mutex<HashMap<[u8; 20], TorrentTx>>>,
    listen_addr: SocketAddr,
    dht: DhtHandle,
    dht_join: JoinHandle<()>,
    accept_join: JoinHandle<()>,
}

impl SessionManager {
    pub async fn start(bind_addr: SocketAddr, dht_node_id: NodeId) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let listen_addr = listener.local_addr()?;

        // DHT and uTP share the same UDP socket, per spec.md's single
        // listening-socket-pair control flow.
        let udp_socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let (dht_join, dht) = DhtNode::spawn_with_socket(udp_socket, dht_node_id)?;

        let torrents: Arc<Mutex<HashMap<[u8; 20], TorrentTx>>> = Arc::new(Mutex::new(HashMap::new()));
        let accept_join = tokio::spawn(Self::accept_loop(listener, torrents.clone()));

        Ok(SessionManager { torrents, listen_addr, dht, dht_join, accept_join })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn dht(&self) -> &DhtHandle {
        &self.dht
    }

    pub async fn register(&self, info_hash: [u8; 20], tx: TorrentTx) {
        self.torrents.lock().await.insert(info_hash, tx);
    }

    pub async fn unregister(&self, info_hash: &[u8; 20]) {
        self.torrents.lock().await.remove(info_hash);
    }

    pub fn shutdown(self) {
        self.accept_join.abort();
        self.dht.shutdown();
        self.dht_join.abort();
    }

    async fn accept_loop(listener: TcpListener, torrents: Arc<Mutex<HashMap<[u8; 20], TorrentTx>>>) {
        loop {
            let (stream, address) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("inbound connection error: {}", e);
                    continue;
                }
            };

            let torrents = torrents.clone();
            tokio::spawn(async move {
                match peek_info_hash(&stream).await {
                    Ok(Some(info_hash)) => {
                        let tx = torrents.lock().await.get(&info_hash).cloned();
                        match tx {
                            Some(tx) => {
                                if tx.send(CommandToTorrent::IncomingPeer { address, stream }).is_err() {
                                    tracing::debug!("torrent for {} is no longer running", hex::encode(info_hash));
                                }
                            }
                            None => tracing::debug!("no torrent registered for info_hash {}", hex::encode(info_hash)),
                        }
                    }
                    Ok(None) => tracing::debug!("peer {} disconnected before completing its handshake", address),
                    Err(e) => tracing::debug!("malformed handshake from {}: {}", address, e),
                }
            });
        }
    }
}

// Reads the BEP 3 handshake's info_hash via MSG_PEEK so the bytes are
// still there for the torrent's own handshake exchange once dispatched.
async fn peek_info_hash(stream: &tokio::net::TcpStream) -> std::io::Result<Option<[u8; 20]>> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    loop {
        stream.readable().await?;
        match stream.peek(&mut buf[..]) {
            Ok(0) => return Ok(None),
            Ok(n) if n >= HANDSHAKE_LEN => break,
            Ok(_) => {
                // Handshake not fully arrived yet; avoid busy-looping on
                // `readable()`, which stays ready as soon as any bytes are queued.
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }

    if buf[0] != HANDSHAKE_PSTRLEN {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad pstrlen"));
    }

    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&buf[INFO_HASH_OFFSET..INFO_HASH_OFFSET + 20]);
    Ok(Some(info_hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_binds_a_listener_and_dht_socket() {
        let manager = SessionManager::start("127.0.0.1:0".parse().unwrap(), NodeId::random()).await.unwrap();
        assert!(manager.listen_addr().port() > 0);
        manager.shutdown();
    }
}
