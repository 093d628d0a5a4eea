// Ed25519 peer identity, handshake signing, AES-256-GCM secure messaging
// and a self-signed TLS cert for the local IPC server. Each submodule
// mirrors one of the standalone security helpers: identity <-> key
// storage, signing <-> handshake authentication, messaging <-> the
// peer-to-peer encrypted channel, tls <-> the daemon's HTTPS listener.

pub mod identity;
pub mod messaging;
pub mod signing;
pub mod tls;

pub use identity::Identity;
pub use messaging::SecureMessage;
pub use signing::HandshakeSignature;

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key encoding error: {0}")]
    Encoding(String),

    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("handshake timestamp outside acceptable window")]
    StaleTimestamp,

    #[error("key not found in storage")]
    KeyNotFound,
}

pub type Result<T> = std::result::Result<T, SecurityError>;

// Name of the per-user state directory under the home dir, e.g. `~/.bitterd/keys`.
pub const APP_DIR_NAME: &str = "bitterd";

