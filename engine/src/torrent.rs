use std::{
    collections::HashMap,
    net::SocketAddr,
    time::Instant,
    sync::Arc,
};
use tokio::sync::{mpsc, oneshot};
use crate::{
    p2p::{PeerHandle, PeerCommand, state::SessionState},
    tracker::{Tracker, Event, AnnounceParams, TrackerError},
    metainfo::{MetaInfo, MetaInfoError, MagnetLink, ut_metadata},
    picker::{Picker, PickStrategy, Priority},
    store::StoreInfo,
    fs,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("tracker error: {0}")]
    TrackerError(#[from] TrackerError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("metadata resolution error: {0}")]
    Metadata(#[from] MetaInfoError),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("no bootstrap peer answered the metadata request")]
    NoBootstrapPeer,

    #[error("option rejected: {0}")]
    Option(#[from] TorrentOptionError),
}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())       
    }
}

// Type aliases.
pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Lifecycle state of a torrent, surfaced to callers via TorrentStats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TorrentState {

    #[default]
    Connecting,

    // Added from a magnet link; waiting on ut_metadata from a peer.
    FetchingMetadata,

    Downloading,

    Seeding,

    Paused,

    Error,

}

// Per-torrent dynamic options (spec.md §9 "Dynamic config dict overlay"),
// modeled as a closed sum type instead of an open dict: an option the IPC
// layer can't deserialize into one of these variants is rejected by serde
// before it ever reaches the torrent.
#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentOption {
    PieceSelection(PickStrategy),
    StreamingMode(bool),
    MaxPeers(u32),
    RateLimit { down: Option<u32>, up: Option<u32> },
    Priority { file_idx: usize, priority: Priority },
}

#[derive(Debug, thiserror::Error)]
pub enum TorrentOptionError {

    #[error("file index {0} is out of range")]
    FileIndexOutOfRange(usize),

    #[error("per-torrent rate limiting is not yet implemented")]
    RateLimitUnsupported,

}

// Commands that can be sent to a torrent from other tasks.
pub enum CommandToTorrent {

    // Sent by peer task when peer successfully connects.
    PeerConnected { address: SocketAddr, id: [u8; 20] },

    // Sent by disk task when piece written.
    PieceWritten { idx: usize, valid: bool },

    // Sent by a peer session whenever its state changes, for stats reporting.
    PeerState { address: SocketAddr, state: SessionState },

    // Sent by the session manager when an inbound connection's handshake
    // info_hash was matched to this torrent.
    IncomingPeer { address: SocketAddr, stream: tokio::net::TcpStream },

    // IPC-driven lifecycle commands.
    Pause,
    Resume,

    // IPC-driven dynamic option change; the reply channel carries back
    // whether the option applied or was rejected.
    SetOption(TorrentOption, oneshot::Sender<std::result::Result<(), TorrentOptionError>>),

    // Sent by itself to shutdown.
    Shutdown,

}

#[derive(Debug)]
pub struct Torrent {

    // Context is a read-only state accessible by peers in threads.
    ctx: Arc<TorrentContext>,

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Trackers are ordered by tier.
    trackers: Vec<Vec<Tracker>>,

    // Peers we know about but don't have a session with.
    available: Vec<SocketAddr>,

    // Receiver for commands.
    torrent_rx: TorrentRx,

    // Sender for commands, used on shutdown.
    torrent_tx: TorrentTx,

    // Time when torrent started.
    start_time: Option<Instant>,

    // Current lifecycle state.
    state: TorrentState,

    // Address to listen for incoming connections on.
    listen_address: SocketAddr,

    // Handle for disk task.
    // Option is for moving out of the handle behind a mutable ref.
    disk_handle: Option<tokio::task::JoinHandle<fs::Result<()>>>,

    // Minimum and maximum peers desired for the torrent.
    min_max_peers: (u32, u32),

    // Consecutive piece hash mismatches attributed to a peer before it's
    // disconnected.
    hash_mismatch_threshold: u32,

    // Per-peer count of pieces that failed the hash check after that peer
    // contributed at least one block to them.
    reputation: HashMap<SocketAddr, u32>,

}

#[derive(Debug)]
pub struct TorrentContext {
    
    // The info hash for this torrent.
    pub info_hash: [u8; 20],

    // The client ID for this client.
    pub client_id: [u8; 20],

    // Allows for peers to pick next block to download.
    pub picker: Picker,

    // Commands to the peer.
    pub torrent_tx: TorrentTx,
    
    // // Commands to disk.
    pub disk_tx: fs::DiskTx,

    // Torrent storage information.
    pub info: StoreInfo,

}

#[derive(Clone)]
pub struct TorrentConfig {

    // Unique 20-byte identifier used by client.
    pub client_id: [u8; 20],

    // Address on which the client listens for incoming peers.
    pub listen_address: SocketAddr,

    // The minimum and maximum peers desired for the torrent.
    pub min_max_peers: (u32, u32),

    // Path where the torrent will write files.
    pub output_dir: std::path::PathBuf,

    // Consecutive piece hash mismatches attributed to a peer before it's
    // disconnected.
    pub hash_mismatch_threshold: u32,

}

impl Torrent {

    // This probably shouldnt be async, it is at the moment because Disk::new() is.
    pub async fn new(metainfo: MetaInfo, config: TorrentConfig) -> Self {
        
        let info = StoreInfo::new(&metainfo, config.output_dir);
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        // Change unwrap after moving disk outside of torrent.
        let (disk_handle, disk_tx) = fs::spawn(info.clone(), metainfo.piece_hashes(), torrent_tx.clone()).await.unwrap();
        
        Torrent {
            ctx: Arc::new(
                TorrentContext {
                    info_hash: metainfo.info_hash(),
                    client_id: config.client_id,
                    picker: Picker::new(
                        info.num_pieces, 
                        info.piece_len,
                        info.last_piece_len
                    ),
                    torrent_tx: torrent_tx.clone(),
                    info,
                    disk_tx,
                }
            ),
            trackers: metainfo.trackers(),
            peers: HashMap::new(),
            available: Vec::new(),
            torrent_rx,
            torrent_tx,
            start_time: None,
            state: TorrentState::Connecting,
            listen_address: config.listen_address,
            disk_handle: Some(disk_handle),
            min_max_peers: config.min_max_peers,
            hash_mismatch_threshold: config.hash_mismatch_threshold,
            reputation: HashMap::new(),
        }
    }

    // Resolves a magnet link's metadata via a single bootstrap peer (e.g.
    // one learned from the magnet's own trackers or the DHT) before
    // constructing a normal torrent. The engine reports
    // `TorrentState::FetchingMetadata` to callers for the duration of
    // this call; a `Torrent` only exists once metadata is in hand.
    pub async fn from_magnet(magnet: MagnetLink, config: TorrentConfig, bootstrap_peer: SocketAddr) -> Result<Self> {
        let info_hash = magnet.info_hash.as_v1();
        let metainfo = ut_metadata::fetch_from_peer(bootstrap_peer, info_hash, config.client_id, magnet.trackers).await?;
        Ok(Self::new(metainfo, config).await)
    }

    // Do something with blocks in request queue if there is an error on run.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting torrent");
        self.start_time = Some(Instant::now());
        self.state = TorrentState::Downloading;
        // Announce start event to trackers.
        self.announce(Some(Event::Started), Instant::now()).await?;
        // Run until there is an error.
        self.run().await?;
        Ok(())
    }

    // TODO: reorder trackers within tiers based on whether we can connect to trackers.
    // TODO: maybe put announces on a seperate task.
    #[tracing::instrument(skip(self, time), fields(num_peers = self.peers.len() + self.available.len()))]
    pub async fn announce(&mut self, event: Option<Event>, time: Instant) -> Result<()> {
        debug_assert!(self.trackers.len() > 0, "no trackers");

        // Use trackers in order of tiers/priority.
        for tier in self.trackers.iter_mut() {
            for tracker in tier {

                let num_peers = self.peers.len() + self.available.len();
                // Number of peers we absolutely require.
                let num_peers_essential = if num_peers >= self.min_max_peers.0 as usize || event == Some(Event::Stopped) {
                    None
                } else {
                    Some((self.min_max_peers.1 as usize - num_peers).max(self.min_max_peers.0 as usize))
                };

                // If event OR we need peers and we can announce OR we can have more peers and should announce, then announce.
                if event.is_some() || (num_peers_essential > Some(0) && tracker.can_announce(time)) || tracker.should_announce(time) {
                    
                    let params = AnnounceParams {
                        info_hash: self.ctx.info_hash,
                        client_id: self.ctx.client_id,
                        // TODO: Change to config.
                        port: 6881,
                        // TODO change all with relation to stats.
                        uploaded: 0,
                        downloaded: 0,
                        left: self.ctx.info.total_len,
                        event,
                        num_want: num_peers_essential,
                    };

                    match tracker.send_announce(params).await {
                        Ok(peers) => {
                            self.available.extend(peers.into_iter());
                            tracker.last_announce = Some(time);
                        },
                        Err(e) => {
                            tracing::error!("tracker announce error: {}", e);
                        }
                    }

                }

            }
        }

        tracing::trace!("new number of peers: {}", self.peers.len() + self.available.len());
        Ok(())
    }

    fn connect_to_peers(&mut self) {
        let count = self.available.len().min((self.min_max_peers.1 as usize).saturating_sub(self.peers.len()));
        if count == 0 {
            tracing::warn!("no peers to connect to");
            return;
        }

        tracing::info!("connecting to {} peers", count);
        for address in self.available.drain(0..count) {
            self.peers.insert(address, PeerHandle::start_session(address, self.ctx.clone(), None));
        }
    }

    // The session manager owns the single listening socket for the whole
    // daemon (spec.md §4.11) and hands this torrent its own inbound
    // connections, pre-matched by info_hash, via `IncomingPeer`; this
    // torrent no longer binds a socket of its own.
    #[tracing::instrument(skip_all, name = "torrent")]
    async fn run(&mut self) -> Result<()> {

        tracing::info!("torrent started, listening via the shared session socket on {}", self.listen_address);

        self.connect_to_peers();

        // Top level torrent loop.
        loop {
            let Some(cmd) = self.torrent_rx.recv().await else { break };
            match cmd {

                CommandToTorrent::PeerConnected { address, id } => {
                    if let Some(peer) = self.peers.get_mut(&address) {
                        peer.id = Some(id);
                    }
                },

                CommandToTorrent::PieceWritten { idx, valid } => {
                    self.handle_piece_write(idx, valid).await?;
                },

                CommandToTorrent::PeerState { address, state } => {
                    if let Some(peer) = self.peers.get_mut(&address) {
                        peer.state = state;
                    }
                },

                CommandToTorrent::IncomingPeer { address, stream } => {
                    self.peers.insert(address, PeerHandle::start_session(address, self.ctx.clone(), Some(stream)));
                },

                CommandToTorrent::Pause => {
                    self.state = TorrentState::Paused;
                    for peer in self.peers.values() {
                        let _ = peer.peer_tx.send(PeerCommand::Shutdown);
                    }
                    self.peers.clear();
                },

                CommandToTorrent::Resume => {
                    self.state = TorrentState::Downloading;
                    self.connect_to_peers();
                },

                CommandToTorrent::SetOption(option, reply) => {
                    let result = self.handle_set_option(option).await;
                    let _ = reply.send(result);
                },

                CommandToTorrent::Shutdown => {
                    break;
                },
            }
        }

        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {

        tracing::info!("disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            let _ = peer.peer_tx.send(PeerCommand::Shutdown);
        }

        for (_, peer) in self.peers.drain() {
            if let Err(e) = peer.session_handle.await {
                tracing::warn!("session shutdown: {}", e);
            }
        }
        self.ctx.disk_tx.send(fs::CommandToDisk::Shutdown)?;
        self
            .disk_handle
            .take()
            .expect("missing handle")
            .await
            .expect("disk task err")
            .expect("disk task err");

        // Announce stopped event to trackers.
        self.announce(Some(Event::Stopped), Instant::now()).await?;

        self.torrent_tx.send(CommandToTorrent::Shutdown)?;
        Ok(())
    }

    async fn handle_piece_write(&mut self, idx: usize, valid: bool) -> Result<()> {
        
        if valid {
            
            self.ctx.picker.partial_pieces.write().await.remove(&idx);
            self.ctx.picker.piece_picker.write().await.received_piece(idx);
            
            let num_pieces_missing = self.ctx.picker.piece_picker.read().await.own_bitfield().count_zeros();
            tracing::info!("piece {} downloaded, {} pieces remain", idx, num_pieces_missing);

            for peer in self.peers.values() {
                peer.peer_tx.send(PeerCommand::PieceWritten(idx)).ok();
            }

            // Check if torrent is fully downloaded.
            if num_pieces_missing == 0 {
                tracing::info!("torrent download complete");
                self.state = TorrentState::Seeding;
                // Shutdown everything.
                self.shutdown().await?;
            }
        
        } else {
            // Attribute the failed hash check to every peer that
            // contributed at least one block to this piece, then free the
            // blocks for re-download.
            let contributors: Vec<SocketAddr> = match self.ctx.picker.partial_pieces.read().await.get(&idx) {
                Some(piece) => piece.read().await.contributors().collect(),
                None => Vec::new(),
            };

            for addr in contributors {
                let count = self.reputation.entry(addr).or_insert(0);
                *count += 1;
                tracing::warn!(peer = %addr, mismatches = *count, "piece {} failed hash check", idx);

                if *count >= self.hash_mismatch_threshold {
                    tracing::warn!(peer = %addr, "hash mismatch threshold reached, disconnecting peer");
                    if let Some(peer) = self.peers.remove(&addr) {
                        let _ = peer.peer_tx.send(PeerCommand::Shutdown);
                    }
                    self.reputation.remove(&addr);
                }
            }

            if let Some(piece) = self.ctx.picker.partial_pieces.read().await.get(&idx) {
                piece.write().await.free_all_blocks();
            }
        }

        Ok(())
    }

    async fn handle_set_option(&mut self, option: TorrentOption) -> std::result::Result<(), TorrentOptionError> {
        match option {
            TorrentOption::PieceSelection(strategy) => {
                self.ctx.picker.set_strategy(strategy).await;
            },

            TorrentOption::StreamingMode(enabled) => {
                let strategy = if enabled {
                    PickStrategy::Streaming { cursor: 0, window: 32 }
                } else {
                    PickStrategy::RarestFirst
                };
                self.ctx.picker.set_strategy(strategy).await;
            },

            TorrentOption::MaxPeers(max) => {
                self.min_max_peers.1 = max.max(self.min_max_peers.0);
            },

            TorrentOption::RateLimit { .. } => {
                // No per-torrent token-bucket exists yet (only the global
                // upload/download rate limit in engine::config); storing
                // this without enforcing it would just be a quieter version
                // of the no-op this replaces.
                return Err(TorrentOptionError::RateLimitUnsupported);
            },

            TorrentOption::Priority { file_idx, priority } => {
                if file_idx >= self.ctx.info.files.len() {
                    return Err(TorrentOptionError::FileIndexOutOfRange(file_idx));
                }
                let piece_range = self.ctx.info.file_piece_range(file_idx);
                self.ctx.picker.set_file_priority(piece_range, priority).await;
            },
        }
        Ok(())
    }
}

// A cloneable, outward-facing reference to a running torrent, in the same
// handle-plus-background-task shape as `p2p::PeerHandle`/`dht::DhtHandle`.
// The daemon's IPC layer holds one of these per active torrent instead of
// reaching into `Torrent` directly.
pub struct TorrentHandle {
    pub info_hash: [u8; 20],
    pub command_tx: TorrentTx,
    pub join_handle: tokio::task::JoinHandle<Result<()>>,
}

impl TorrentHandle {
    pub async fn spawn(metainfo: MetaInfo, config: TorrentConfig) -> Self {
        let info_hash = metainfo.info_hash();
        let mut torrent = Torrent::new(metainfo, config).await;
        let command_tx = torrent.torrent_tx.clone();
        let join_handle = tokio::spawn(async move { torrent.start().await });
        TorrentHandle { info_hash, command_tx, join_handle }
    }

    // Resolves a magnet link against each candidate peer in turn (as
    // discovered by the caller via DHT `get_peers` or the magnet's own
    // `tr` trackers) until one answers the ut_metadata request, then
    // spawns like `spawn`. Returns the last peer's error if none answer.
    pub async fn spawn_magnet(magnet: MagnetLink, config: TorrentConfig, candidates: Vec<SocketAddr>) -> Result<Self> {
        let info_hash = magnet.info_hash.as_v1();
        let mut last_err = None;
        for peer in candidates {
            match Torrent::from_magnet(magnet.clone(), config.clone(), peer).await {
                Ok(mut torrent) => {
                    let command_tx = torrent.torrent_tx.clone();
                    let join_handle = tokio::spawn(async move { torrent.start().await });
                    return Ok(TorrentHandle { info_hash, command_tx, join_handle });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(TorrentError::NoBootstrapPeer))
    }

    pub fn pause(&self) -> Result<()> {
        self.command_tx.send(CommandToTorrent::Pause)?;
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.command_tx.send(CommandToTorrent::Resume)?;
        Ok(())
    }

    // Applies a dynamic per-torrent option (spec.md §9 dict overlay). The
    // torrent task itself validates and applies it; a rejected option comes
    // back as `TorrentError::Option` rather than a silent success.
    pub async fn set_option(&self, option: TorrentOption) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(CommandToTorrent::SetOption(option, tx))?;
        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TorrentError::Channel("torrent dropped the option reply channel".to_string())),
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command_tx.send(CommandToTorrent::Shutdown)?;
        Ok(())
    }
}
