// Self-signed X.509 certificate for the daemon's optional HTTPS IPC
// listener, using the daemon's own Ed25519 identity as the certificate
// key so the cert's public key doubles as the peer-visible identity.
use chrono::{Datelike, Duration, Utc};
use ed25519_dalek::pkcs8::EncodePrivateKey;
use rcgen::{date_time_ymd, Certificate, CertificateParams, KeyPair, PKCS_ED25519};

use super::{identity::Identity, Result, SecurityError};

const VALIDITY_DAYS: i64 = 365;

pub struct SelfSignedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

pub fn generate_self_signed(identity: &Identity) -> Result<SelfSignedCert> {
    let pkcs8_der = identity
        .signing_key()
        .to_pkcs8_der()
        .map_err(|e| SecurityError::Encoding(e.to_string()))?;
    let key_pair = KeyPair::from_der(pkcs8_der.as_bytes())
        .map_err(|e| SecurityError::Crypto(e.to_string()))?;

    let mut params = CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ]);
    params.alg = &PKCS_ED25519;
    params.key_pair = Some(key_pair);

    let now = Utc::now();
    params.not_before = date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    let expiry = now + Duration::days(VALIDITY_DAYS);
    params.not_after = date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

    let cert = Certificate::from_params(params).map_err(|e| SecurityError::Crypto(e.to_string()))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| SecurityError::Crypto(e.to_string()))?;

    Ok(SelfSignedCert { cert_pem, key_pem: cert.serialize_private_key_pem() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_a_pem_encoded_cert_and_key() {
        let identity = Identity::generate();
        let cert = generate_self_signed(&identity).unwrap();
        assert!(cert.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
    }
}
