//! Long-lived DTLS identity shared by every handshake

use std::sync::Arc;

use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use rustls_pki_types::CertificateDer;
use tracing::debug;
use webrtc::dtls::config::{ClientAuthType, Config, ExtendedMasterSecretType};
use webrtc::dtls::crypto::{Certificate, CryptoPrivateKey, CryptoPrivateKeyKind};
use webrtc::dtls::extension::extension_use_srtp::SrtpProtectionProfile;

use rtcpilot_core::CertStore;

use super::{DtlsError, HandshakeTimeouts};

/// The certificate store converted once into the DTLS stack's form
pub struct DtlsIdentity {
    store: Arc<CertStore>,
    certificate: Certificate,
}

impl DtlsIdentity {
    pub fn new(store: Arc<CertStore>) -> Result<Self, DtlsError> {
        let pkcs8 = store.private_key_pkcs8();
        let key_pair = EcdsaKeyPair::from_pkcs8(
            &ECDSA_P256_SHA256_ASN1_SIGNING,
            pkcs8,
            &SystemRandom::new(),
        )
        .map_err(|e| DtlsError::Certificate(e.to_string()))?;

        let certificate = Certificate {
            certificate: store
                .chain()
                .iter()
                .map(|der| CertificateDer::from(der.clone()))
                .collect(),
            private_key: CryptoPrivateKey {
                kind: CryptoPrivateKeyKind::Ecdsa256(key_pair),
                serialized_der: pkcs8.to_vec(),
            },
        };
        debug!("DTLS identity ready ({})", store.fingerprint_sdp());
        Ok(Self { store, certificate })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn store(&self) -> &CertStore {
        &self.store
    }

    /// Fingerprint for the answer's `a=fingerprint:sha-256`
    pub fn fingerprint_sdp(&self) -> String {
        self.store.fingerprint_sdp()
    }

    /// Server-side handshake config
    ///
    /// Browsers present self-signed certificates, so no chain is verified.
    /// The peer certificate is pinned to the SDP fingerprint after the
    /// handshake instead.
    pub fn server_config(&self, timeouts: &HandshakeTimeouts) -> Config {
        Config {
            certificates: vec![self.certificate.clone()],
            srtp_protection_profiles: vec![
                SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm,
                SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80,
            ],
            client_auth: ClientAuthType::RequireAnyClientCert,
            extended_master_secret: ExtendedMasterSecretType::Require,
            insecure_skip_verify: true,
            flight_interval: timeouts.initial_retransmit,
            ..Default::default()
        }
    }
}
