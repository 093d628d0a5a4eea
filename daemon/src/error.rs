// Aggregating error type for the daemon binary, mirroring
// `engine::error::EngineError`'s one-variant-per-subsystem shape.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Engine(#[from] engine::EngineError),

    #[error(transparent)]
    Config(#[from] engine::config::ConfigError),

    #[error(transparent)]
    Security(#[from] engine::security::SecurityError),

    #[error("daemon is already running with pid {0}")]
    AlreadyRunning(u32),

    #[error("state error: {0}")]
    State(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
