// Top-level error taxonomy. Each variant wraps one module's own
// `thiserror` enum, following the rest of the crate's per-module-enum
// idiom; this one just gives callers at the session-manager/IPC layer a
// single type to match on without caring which subsystem raised it.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {

    #[error("network error: {0}")]
    Network(String),

    #[error(transparent)]
    Disk(#[from] crate::fs::DiskError),

    #[error(transparent)]
    Protocol(#[from] crate::p2p::PeerError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Security(#[from] crate::security::SecurityError),

    #[error(transparent)]
    Dht(#[from] crate::dht::DhtError),

    #[error(transparent)]
    Nat(#[from] crate::nat::NatError),

    #[error(transparent)]
    Announce(#[from] crate::announce::AnnounceError),

    #[error(transparent)]
    Session(#[from] crate::session::SessionError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Tracker(#[from] crate::tracker::TrackerError),

    #[error(transparent)]
    MetaInfo(#[from] crate::metainfo::MetaInfoError),

    #[error(transparent)]
    Torrent(#[from] crate::torrent::TorrentError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
