//! STUN for ICE-lite connectivity checks
//!
//! Message encoding and the integrity/fingerprint checks come from
//! `webrtc::stun`. This module only adds what an ICE-lite agent needs on
//! top: pulling the local ufrag out of USERNAME, verifying short-term
//! credentials and answering with XOR-MAPPED-ADDRESS.

use std::net::SocketAddr;

use thiserror::Error;
use webrtc::stun::attributes::ATTR_USERNAME;
use webrtc::stun::error_code::ErrorCodeAttribute;
use webrtc::stun::fingerprint::FINGERPRINT;
use webrtc::stun::integrity::MessageIntegrity;
use webrtc::stun::message::{
    Getter, Message, Setter, BINDING_ERROR, BINDING_REQUEST, BINDING_SUCCESS,
};
use webrtc::stun::textattrs::TextAttribute;
use webrtc::stun::xoraddr::XorMappedAddress;

pub use webrtc::stun::error_code::{ErrorCode, CODE_BAD_REQUEST, CODE_UNAUTHORIZED};

/// STUN errors
#[derive(Error, Debug)]
pub enum StunError {
    #[error("malformed STUN message: {0}")]
    Decode(#[source] webrtc::stun::Error),

    #[error("not a Binding Request")]
    NotBindingRequest,

    #[error("FINGERPRINT check failed")]
    FingerprintMismatch,

    #[error("MESSAGE-INTEGRITY check failed")]
    IntegrityMismatch,

    #[error("failed to encode STUN response: {0}")]
    Encode(#[source] webrtc::stun::Error),
}

/// A decoded Binding Request
#[derive(Debug)]
pub struct BindingRequest {
    msg: Message,
    username: Option<String>,
}

impl BindingRequest {
    pub fn decode(data: &[u8]) -> Result<Self, StunError> {
        let mut msg = Message::new();
        msg.unmarshal_binary(data).map_err(StunError::Decode)?;
        if msg.typ != BINDING_REQUEST {
            return Err(StunError::NotBindingRequest);
        }
        let mut username = TextAttribute::new(ATTR_USERNAME, String::new());
        let username = username.get_from(&msg).ok().map(|()| username.text);
        Ok(Self { msg, username })
    }

    /// `USERNAME` as sent, `<local ufrag>:<remote ufrag>`
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Our half of USERNAME, the key that finds the session
    pub fn local_ufrag(&self) -> Option<&str> {
        let (local, _) = self.username()?.split_once(':')?;
        (!local.is_empty()).then_some(local)
    }

    /// Check FINGERPRINT, then MESSAGE-INTEGRITY keyed with `pwd`
    pub fn verify(&mut self, pwd: &str) -> Result<(), StunError> {
        FINGERPRINT
            .check(&self.msg)
            .map_err(|_| StunError::FingerprintMismatch)?;
        MessageIntegrity::new_short_term_integrity(pwd.to_owned())
            .check(&mut self.msg)
            .map_err(|_| StunError::IntegrityMismatch)
    }

    /// Success response carrying the address the request came from
    pub fn success(&self, mapped: SocketAddr, pwd: &str) -> Result<Vec<u8>, StunError> {
        self.respond(vec![
            Box::new(BINDING_SUCCESS),
            Box::new(self.msg.transaction_id),
            Box::new(XorMappedAddress {
                ip: mapped.ip(),
                port: mapped.port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(pwd.to_owned())),
            Box::new(FINGERPRINT),
        ])
    }

    /// Error response. Unauthenticated, so no MESSAGE-INTEGRITY.
    pub fn error(&self, code: ErrorCode, reason: &str) -> Result<Vec<u8>, StunError> {
        self.respond(vec![
            Box::new(BINDING_ERROR),
            Box::new(self.msg.transaction_id),
            Box::new(ErrorCodeAttribute {
                code,
                reason: reason.as_bytes().to_vec(),
            }),
            Box::new(FINGERPRINT),
        ])
    }

    fn respond(&self, setters: Vec<Box<dyn Setter>>) -> Result<Vec<u8>, StunError> {
        let mut response = Message::new();
        response.build(&setters).map_err(StunError::Encode)?;
        Ok(response.raw)
    }
}
