//! Certificate and key store
//!
//! Provides:
//! - Loading the long-lived ECDSA P-256 certificate and key used by every
//!   DTLS handshake
//! - SHA-256 certificate fingerprints for `a=fingerprint`
//! - The PKCS#8 key handed to the DTLS stack
//! - Self-signed certificate generation (rcgen)

use std::fmt::Write as _;
use std::path::Path;

use p256::ecdsa::SigningKey;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::CryptoError;

/// DER prefix of a SubjectPublicKeyInfo holding an uncompressed P-256 point
const P256_SPKI_PREFIX: &[u8] = &[
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

/// Length of an uncompressed SEC1 P-256 point
pub const P256_POINT_LEN: usize = 65;

/// Certificate fingerprint - SHA-256 of the DER-encoded certificate
pub type CertFingerprint = [u8; 32];

/// Long-lived certificate and private key
pub struct CertStore {
    chain: Vec<Vec<u8>>,
    signing_key: SigningKey,
    pkcs8: Vec<u8>,
    fingerprint: CertFingerprint,
}

impl CertStore {
    /// Load and validate the certificate/key pair from PEM files
    pub fn init(cert_path: &Path, key_path: &Path) -> Result<Self, CryptoError> {
        let cert_pem = read_file(cert_path)?;
        let key_pem = read_file(key_path)?;
        let store = Self::from_pem(&cert_pem, &key_pem)?;
        info!(
            "Loaded certificate {:?} (fingerprint {})",
            cert_path,
            store.fingerprint_sdp()
        );
        Ok(store)
    }

    /// Build a store from PEM text
    ///
    /// The first CERTIFICATE block is the leaf. The key may be PKCS#8
    /// (`PRIVATE KEY`) or SEC1 (`EC PRIVATE KEY`).
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CryptoError> {
        let chain: Vec<Vec<u8>> = pem::parse_many(cert_pem)?
            .into_iter()
            .filter(|p| p.tag() == "CERTIFICATE")
            .map(|p| p.contents().to_vec())
            .collect();
        if chain.is_empty() {
            return Err(CryptoError::NoCertificate);
        }

        let (signing_key, pkcs8) = parse_private_key(key_pem)?;

        let cert_point = extract_p256_public_key(&chain[0]).ok_or_else(|| {
            CryptoError::UnsupportedKey("certificate does not carry a P-256 public key".into())
        })?;
        let key_point = signing_key.verifying_key().to_encoded_point(false);
        if key_point.as_bytes() != cert_point.as_slice() {
            return Err(CryptoError::KeyMismatch);
        }

        let fingerprint = fingerprint(&chain[0]);
        debug!("Certificate chain has {} entries", chain.len());

        Ok(Self {
            chain,
            signing_key,
            pkcs8,
            fingerprint,
        })
    }

    /// Generate a self-signed P-256 certificate for the given names
    pub fn generate_self_signed(names: Vec<String>) -> Result<GeneratedCert, CryptoError> {
        let cert = rcgen::generate_simple_self_signed(names)
            .map_err(|e| CryptoError::Generate(e.to_string()))?;
        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| CryptoError::Generate(e.to_string()))?;
        let key_pem = cert.serialize_private_key_pem();
        Ok(GeneratedCert { cert_pem, key_pem })
    }

    /// DER certificate chain, leaf first
    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    /// Leaf certificate DER
    pub fn leaf(&self) -> &[u8] {
        &self.chain[0]
    }

    pub fn fingerprint(&self) -> &CertFingerprint {
        &self.fingerprint
    }

    /// Fingerprint formatted for `a=fingerprint:sha-256 ...`
    pub fn fingerprint_sdp(&self) -> String {
        format_fingerprint(&self.fingerprint)
    }

    /// Private key as PKCS#8 DER, whatever form the PEM file used
    pub fn private_key_pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }

    /// Uncompressed public key point
    pub fn public_key(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }
}

/// PEM text of a freshly generated certificate
pub struct GeneratedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

impl GeneratedCert {
    /// Write the certificate and key PEM files
    pub fn write_to(&self, cert_path: &Path, key_path: &Path) -> Result<(), CryptoError> {
        for (path, content) in [(cert_path, &self.cert_pem), (key_path, &self.key_pem)] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CryptoError::Io {
                    path: parent.to_path_buf(),
                    reason: e.to_string(),
                })?;
            }
            std::fs::write(path, content).map_err(|e| CryptoError::Io {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn into_store(self) -> Result<CertStore, CryptoError> {
        CertStore::from_pem(&self.cert_pem, &self.key_pem)
    }
}

fn read_file(path: &Path) -> Result<String, CryptoError> {
    std::fs::read_to_string(path).map_err(|e| CryptoError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn parse_private_key(key_pem: &str) -> Result<(SigningKey, Vec<u8>), CryptoError> {
    for block in pem::parse_many(key_pem)? {
        match block.tag() {
            "PRIVATE KEY" => {
                let key = SigningKey::from_pkcs8_der(block.contents())
                    .map_err(|e| CryptoError::UnsupportedKey(e.to_string()))?;
                return Ok((key, block.contents().to_vec()));
            }
            "EC PRIVATE KEY" => {
                let secret = p256::SecretKey::from_sec1_der(block.contents())
                    .map_err(|e| CryptoError::UnsupportedKey(e.to_string()))?;
                let pkcs8 = secret
                    .to_pkcs8_der()
                    .map_err(|e| CryptoError::UnsupportedKey(e.to_string()))?;
                return Ok((SigningKey::from(secret), pkcs8.as_bytes().to_vec()));
            }
            _ => continue,
        }
    }
    Err(CryptoError::NoPrivateKey)
}

/// Compute the SHA-256 fingerprint of a DER certificate
pub fn fingerprint(der: &[u8]) -> CertFingerprint {
    Sha256::digest(der).into()
}

/// Format a fingerprint as colon separated upper-case hex
pub fn format_fingerprint(fp: &[u8]) -> String {
    let mut out = String::with_capacity(fp.len() * 3);
    for (i, byte) in fp.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

/// Parse a colon separated hex fingerprint (case-insensitive)
pub fn parse_fingerprint(text: &str) -> Option<CertFingerprint> {
    let hex: String = text.trim().chars().filter(|c| *c != ':').collect();
    let bytes = hex::decode(hex).ok()?;
    bytes.try_into().ok()
}

/// Locate the P-256 public key inside a DER certificate
///
/// Only ECDSA P-256 certificates are supported, which is what browsers
/// generate for WebRTC.
pub fn extract_p256_public_key(cert_der: &[u8]) -> Option<[u8; P256_POINT_LEN]> {
    let start = cert_der
        .windows(P256_SPKI_PREFIX.len())
        .position(|w| w == P256_SPKI_PREFIX)?
        + P256_SPKI_PREFIX.len();
    let point = cert_der.get(start..start + P256_POINT_LEN)?;
    if point[0] != 0x04 {
        return None;
    }
    point.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generated() -> GeneratedCert {
        CertStore::generate_self_signed(vec!["localhost".into()]).unwrap()
    }

    #[test]
    fn test_generate_and_load() {
        let cert = generated();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        let store = cert.into_store().unwrap();
        assert_eq!(store.chain().len(), 1);
        assert_eq!(store.public_key().len(), P256_POINT_LEN);
        assert_eq!(store.fingerprint_sdp().len(), 32 * 3 - 1);
    }

    #[test]
    fn test_init_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("certs/server.crt");
        let key_path = dir.path().join("certs/server.key");
        generated().write_to(&cert_path, &key_path).unwrap();

        let store = CertStore::init(&cert_path, &key_path).unwrap();
        assert_eq!(store.fingerprint(), &fingerprint(store.leaf()));
    }

    #[test]
    fn test_missing_files() {
        let result = CertStore::init(
            Path::new("/nonexistent/server.crt"),
            Path::new("/nonexistent/server.key"),
        );
        assert!(matches!(result, Err(CryptoError::Io { .. })));
    }

    #[test]
    fn test_key_mismatch() {
        let a = generated();
        let b = generated();
        let result = CertStore::from_pem(&a.cert_pem, &b.key_pem);
        assert!(matches!(result, Err(CryptoError::KeyMismatch)));
    }

    #[test]
    fn test_garbage_pem() {
        let a = generated();
        assert!(matches!(
            CertStore::from_pem("not a pem", &a.key_pem),
            Err(CryptoError::NoCertificate)
        ));
        assert!(matches!(
            CertStore::from_pem(&a.cert_pem, &a.cert_pem),
            Err(CryptoError::NoPrivateKey)
        ));
    }

    #[test]
    fn test_sec1_key_converted_to_pkcs8() {
        let generated = generated();
        let store = CertStore::from_pem(&generated.cert_pem, &generated.key_pem).unwrap();
        let secret = p256::SecretKey::from_pkcs8_der(store.private_key_pkcs8()).unwrap();
        let sec1 = pem::Pem::new("EC PRIVATE KEY", secret.to_sec1_der().unwrap().to_vec());

        let from_sec1 = CertStore::from_pem(&generated.cert_pem, &pem::encode(&sec1)).unwrap();
        assert_eq!(from_sec1.public_key(), store.public_key());
        assert!(p256::SecretKey::from_pkcs8_der(from_sec1.private_key_pkcs8()).is_ok());
    }

    #[test]
    fn test_fingerprint_format_roundtrip() {
        let fp = fingerprint(b"certificate");
        let text = format_fingerprint(&fp);
        assert_eq!(&text[2..3], ":");
        assert_eq!(parse_fingerprint(&text), Some(fp));
        assert_eq!(parse_fingerprint(&text.to_lowercase()), Some(fp));
        assert_eq!(parse_fingerprint("AB:CD"), None);
    }
}
