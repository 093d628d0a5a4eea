// Peer-to-peer encrypted messaging layered on top of each peer's Ed25519
// identity. The shared secret is derived by feeding HKDF-SHA256 the raw
// concatenation of our key material and the peer's public key, not a real
// X25519 Diffie-Hellman exchange — this mirrors how the key agreement is
// actually done elsewhere in this protocol family, where the same
// shortcut is taken and explicitly called out as a simplification rather
// than a proper elliptic-curve exchange.
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::{Sha256, Sha512};

use super::{identity::Identity, signing::unix_timestamp_now, Result, SecurityError};

const HKDF_INFO: &[u8] = b"ccbt-secure-messaging";
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct SecureMessage {
    pub sender_public_key: [u8; 32],
    pub recipient_public_key: [u8; 32],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub signature: [u8; 64],
    pub timestamp: f64,
}

// Derives a fixed-width scalar from an Ed25519 seed the same way the
// rest of this key-agreement scheme does: the first half of SHA-512(seed),
// with no scalar clamping.
fn ed25519_seed_to_scalar(seed: &[u8; 32]) -> [u8; 32] {
    let digest = Sha512::digest(seed);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    out
}

fn derive_shared_secret(our_scalar: &[u8; 32], peer_public_key: &[u8; 32]) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(our_scalar);
    ikm.extend_from_slice(peer_public_key);

    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

pub fn encrypt_message(identity: &Identity, recipient_public_key: [u8; 32], plaintext: &[u8]) -> Result<SecureMessage> {
    let our_scalar = ed25519_seed_to_scalar(&identity.signing_key().to_bytes());
    let shared_secret = derive_shared_secret(&our_scalar, &recipient_public_key);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&shared_secret));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| SecurityError::Crypto(e.to_string()))?;

    let signature = identity.sign(&ciphertext);

    Ok(SecureMessage {
        sender_public_key: identity.public_key_bytes(),
        recipient_public_key,
        nonce: nonce_bytes,
        ciphertext,
        signature: signature.to_bytes(),
        timestamp: unix_timestamp_now(),
    })
}

pub fn decrypt_message(identity: &Identity, message: &SecureMessage) -> Result<Vec<u8>> {
    let sender_key = VerifyingKey::from_bytes(&message.sender_public_key)
        .map_err(|e| SecurityError::Encoding(e.to_string()))?;
    let signature = Signature::from_bytes(&message.signature);
    sender_key
        .verify(&message.ciphertext, &signature)
        .map_err(|_| SecurityError::InvalidSignature)?;

    let our_scalar = ed25519_seed_to_scalar(&identity.signing_key().to_bytes());
    let shared_secret = derive_shared_secret(&our_scalar, &message.sender_public_key);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&shared_secret));
    cipher
        .decrypt(Nonce::from_slice(&message.nonce), message.ciphertext.as_ref())
        .map_err(|e| SecurityError::Crypto(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let sender = Identity::generate();
        let recipient = Identity::generate();

        let message = encrypt_message(&sender, recipient.public_key_bytes(), b"hello peer").unwrap();
        let plaintext = decrypt_message(&recipient, &message).unwrap();
        assert_eq!(plaintext, b"hello peer");
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let sender = Identity::generate();
        let recipient = Identity::generate();

        let mut message = encrypt_message(&sender, recipient.public_key_bytes(), b"hello peer").unwrap();
        message.ciphertext[0] ^= 0xff;

        // The signature covers the ciphertext, so tampering is caught
        // before the (now-mismatched) AEAD tag is even checked.
        assert!(decrypt_message(&recipient, &message).is_err());
    }

    #[test]
    fn decrypt_fails_for_wrong_recipient() {
        let sender = Identity::generate();
        let recipient = Identity::generate();
        let eavesdropper = Identity::generate();

        let message = encrypt_message(&sender, recipient.public_key_bytes(), b"hello peer").unwrap();
        assert!(decrypt_message(&eavesdropper, &message).is_err());
    }
}
