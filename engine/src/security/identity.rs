// Ed25519 key generation and storage. The private key is kept on disk
// encrypted with a locally-generated AES-256-GCM key-encryption key
// (itself 0600); the public key is stored as a plaintext PEM file
// alongside it.
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use ed25519_dalek::{
    pkcs8::{EncodePublicKey, LineEnding},
    Signature, Signer, SigningKey, Verifier, VerifyingKey,
};
use rand::{rngs::OsRng, RngCore};

use super::{Result, SecurityError};

const KEK_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Identity { signing_key }
    }

    pub fn generate() -> Self {
        Identity { signing_key: SigningKey::generate(&mut OsRng) }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(public_key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
        public_key.verify(message, signature).is_ok()
    }
}

// On-disk key store rooted at `~/.bitterd/keys` (private/public key pair)
// and `~/.bitterd/.key_encryption_key` (the KEK protecting the private key).
pub struct KeyStore {
    key_dir: PathBuf,
    kek_file: PathBuf,
}

impl KeyStore {
    pub fn new(base_dir: &Path) -> Self {
        KeyStore {
            key_dir: base_dir.join("keys"),
            kek_file: base_dir.join(".key_encryption_key"),
        }
    }

    fn private_key_file(&self) -> PathBuf {
        self.key_dir.join("ed25519_private_key.enc")
    }

    fn public_key_file(&self) -> PathBuf {
        self.key_dir.join("ed25519_public_key.pem")
    }

    fn set_owner_only(path: &Path, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
        }
        Ok(())
    }

    fn load_or_create_kek(&self) -> Result<[u8; KEK_LEN]> {
        if let Some(parent) = self.kek_file.parent() {
            fs::create_dir_all(parent)?;
        }

        match fs::read(&self.kek_file) {
            Ok(bytes) if bytes.len() == KEK_LEN => {
                let mut kek = [0u8; KEK_LEN];
                kek.copy_from_slice(&bytes);
                Ok(kek)
            }
            Ok(_) => {
                tracing::warn!("invalid key encryption key, regenerating");
                self.generate_and_store_kek()
            }
            Err(e) if e.kind() == ErrorKind::NotFound => self.generate_and_store_kek(),
            Err(e) => Err(e.into()),
        }
    }

    fn generate_and_store_kek(&self) -> Result<[u8; KEK_LEN]> {
        let mut kek = [0u8; KEK_LEN];
        OsRng.fill_bytes(&mut kek);
        fs::write(&self.kek_file, kek)?;
        Self::set_owner_only(&self.kek_file, 0o600)?;
        tracing::info!("generated new key encryption key");
        Ok(kek)
    }

    pub fn save(&self, identity: &Identity) -> Result<()> {
        fs::create_dir_all(&self.key_dir)?;
        let kek = self.load_or_create_kek()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let mut encrypted = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), identity.signing_key.to_bytes().as_ref())
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;

        let mut on_disk = Vec::with_capacity(NONCE_LEN + encrypted.len());
        on_disk.extend_from_slice(&nonce_bytes);
        on_disk.append(&mut encrypted);
        fs::write(self.private_key_file(), on_disk)?;
        Self::set_owner_only(&self.private_key_file(), 0o600)?;

        let public_pem = identity
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SecurityError::Encoding(e.to_string()))?;
        fs::write(self.public_key_file(), public_pem)?;
        Self::set_owner_only(&self.public_key_file(), 0o644)?;

        tracing::info!("saved ed25519 key pair to secure storage");
        Ok(())
    }

    pub fn load(&self) -> Result<Identity> {
        let encrypted = fs::read(self.private_key_file()).map_err(|e| match e.kind() {
            ErrorKind::NotFound => SecurityError::KeyNotFound,
            _ => SecurityError::Io(e),
        })?;
        if encrypted.len() < NONCE_LEN {
            return Err(SecurityError::Encoding("truncated private key file".to_string()));
        }
        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);

        let kek = self.load_or_create_kek()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let seed_bytes = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;
        let seed: [u8; 32] = seed_bytes
            .try_into()
            .map_err(|_| SecurityError::Encoding("private key is not 32 bytes".to_string()))?;

        Ok(Identity::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    // Returns the existing identity, generating and persisting a new one
    // the first time it's called for a given key directory.
    pub fn get_or_create(&self) -> Result<Identity> {
        match self.load() {
            Ok(identity) => Ok(identity),
            Err(SecurityError::KeyNotFound) => {
                let identity = Identity::generate();
                self.save(&identity)?;
                Ok(identity)
            }
            Err(e) => Err(e),
        }
    }

    // Generates a fresh key pair, backing up the previous private key file
    // alongside it, and persists the new pair.
    pub fn rotate(&self) -> Result<Identity> {
        let old = self.private_key_file();
        if old.exists() {
            let backup = self.key_dir.join("ed25519_private_key.enc.backup");
            if let Err(e) = fs::copy(&old, &backup) {
                tracing::warn!("failed to back up old private key: {}", e);
            }
        }
        let identity = Identity::generate();
        self.save(&identity)?;
        tracing::info!("rotated ed25519 key pair");
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_sign_and_verify_roundtrips() {
        let identity = Identity::generate();
        let msg = b"test message";
        let sig = identity.sign(msg);
        assert!(Identity::verify(&identity.public_key(), msg, &sig));
        assert!(!Identity::verify(&identity.public_key(), b"wrong message", &sig));
    }

    #[test]
    fn save_then_load_roundtrips_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let identity = Identity::generate();
        store.save(&identity).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.public_key_bytes(), identity.public_key_bytes());
    }

    #[test]
    fn get_or_create_is_stable_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let first = store.get_or_create().unwrap();
        let second = KeyStore::new(dir.path()).get_or_create().unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }

    #[test]
    fn rotate_changes_the_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let first = store.get_or_create().unwrap();
        let rotated = store.rotate().unwrap();
        assert_ne!(first.public_key_bytes(), rotated.public_key_bytes());

        let backup = dir.path().join("keys").join("ed25519_private_key.enc.backup");
        assert!(backup.exists());
    }
}
