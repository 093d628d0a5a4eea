// Two distinct uses of Ed25519 signatures: authenticating the BitTorrent
// wire handshake between peers, and authenticating HTTP requests to the
// local daemon IPC server.
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use super::{identity::Identity, Result, SecurityError};

// Acceptable clock skew between a signed request's timestamp and now,
// beyond which the signature is rejected even if cryptographically valid.
pub const REPLAY_WINDOW: std::time::Duration = std::time::Duration::from_secs(300);

pub fn unix_timestamp_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs_f64()
}

#[derive(Debug, Clone)]
pub struct HandshakeSignature {
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
    pub timestamp: u64,
}

fn handshake_message(info_hash: &[u8; 20], peer_id: &[u8; 20], timestamp: u64) -> Vec<u8> {
    let mut message = Vec::with_capacity(48);
    message.extend_from_slice(info_hash);
    message.extend_from_slice(peer_id);
    message.extend_from_slice(&timestamp.to_be_bytes());
    message
}

// Builds the signature a peer attaches to its BEP 10 extension handshake
// to prove ownership of its advertised Ed25519 public key.
pub fn sign_handshake(identity: &Identity, info_hash: &[u8; 20], peer_id: &[u8; 20]) -> HandshakeSignature {
    let timestamp = unix_timestamp_now() as u64;
    let message = handshake_message(info_hash, peer_id, timestamp);
    let signature = identity.sign(&message);
    HandshakeSignature {
        public_key: identity.public_key_bytes(),
        signature: signature.to_bytes(),
        timestamp,
    }
}

// Verifies a peer's handshake signature. Does not itself enforce a replay
// window: a handshake signature is only ever meaningful for the lifetime
// of the TCP connection it arrives on, unlike a standalone IPC request.
pub fn verify_handshake(
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    sig: &HandshakeSignature,
) -> Result<()> {
    let public_key = VerifyingKey::from_bytes(&sig.public_key)
        .map_err(|e| SecurityError::Encoding(e.to_string()))?;
    let message = handshake_message(info_hash, peer_id, sig.timestamp);
    let signature = Signature::from_bytes(&sig.signature);
    public_key
        .verify(&message, &signature)
        .map_err(|_| SecurityError::InvalidSignature)
}

// Signs an IPC request the way the daemon's HTTP clients authenticate:
// `METHOD path\ntimestamp\nsha256(body)-hex`.
pub fn sign_ipc_request(identity: &Identity, method: &str, path: &str, body: &[u8]) -> (String, f64, [u8; 64]) {
    let timestamp = unix_timestamp_now();
    let message = ipc_request_message(method, path, timestamp, body);
    let signature = identity.sign(&message).to_bytes();
    (identity.public_key_hex(), timestamp, signature)
}

fn ipc_request_message(method: &str, path: &str, timestamp: f64, body: &[u8]) -> Vec<u8> {
    let body_hash = hex::encode(Sha256::digest(body));
    format!("{method} {path}\n{timestamp}\n{body_hash}").into_bytes()
}

// Verifies an IPC request's signature and rejects it if `timestamp` falls
// outside `REPLAY_WINDOW` of the current time, even when cryptographically
// valid, to block replayed requests.
pub fn verify_ipc_request(
    public_key: &VerifyingKey,
    method: &str,
    path: &str,
    timestamp: f64,
    body: &[u8],
    signature: &[u8; 64],
) -> Result<()> {
    let now = unix_timestamp_now();
    if (now - timestamp).abs() > REPLAY_WINDOW.as_secs_f64() {
        return Err(SecurityError::StaleTimestamp);
    }

    let message = ipc_request_message(method, path, timestamp, body);
    let signature = Signature::from_bytes(signature);
    public_key
        .verify(&message, &signature)
        .map_err(|_| SecurityError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_signature_roundtrips() {
        let identity = Identity::generate();
        let info_hash = [1u8; 20];
        let peer_id = [2u8; 20];
        let sig = sign_handshake(&identity, &info_hash, &peer_id);
        assert!(verify_handshake(&info_hash, &peer_id, &sig).is_ok());
    }

    #[test]
    fn handshake_signature_rejects_wrong_info_hash() {
        let identity = Identity::generate();
        let peer_id = [2u8; 20];
        let sig = sign_handshake(&identity, &[1u8; 20], &peer_id);
        assert!(verify_handshake(&[9u8; 20], &peer_id, &sig).is_err());
    }

    #[test]
    fn ipc_request_signature_roundtrips() {
        let identity = Identity::generate();
        let (_, timestamp, signature) = sign_ipc_request(&identity, "GET", "/api/v1/status", b"");
        assert!(verify_ipc_request(&identity.public_key(), "GET", "/api/v1/status", timestamp, b"", &signature).is_ok());
    }

    #[test]
    fn ipc_request_signature_is_cryptographically_valid_even_when_stale() {
        let identity = Identity::generate();
        let old_timestamp = unix_timestamp_now() - 400.0;
        let message = ipc_request_message("GET", "/api/v1/status", old_timestamp, b"");
        let signature = identity.sign(&message).to_bytes();

        // Signature checks out on its own...
        let sig_obj = Signature::from_bytes(&signature);
        assert!(identity.public_key().verify(&message, &sig_obj).is_ok());

        // ...but the replay window rejects it.
        let err = verify_ipc_request(&identity.public_key(), "GET", "/api/v1/status", old_timestamp, b"", &signature);
        assert!(matches!(err, Err(SecurityError::StaleTimestamp)));
    }
}
