//! Session description rewriting
//!
//! Parsing and serialization are done by the `sdp` crate. On top of it this
//! module answers the questions the server asks of a browser offer (ICE
//! credentials, certificate fingerprint, media sections), replaces the
//! candidates a description advertises with the server's reachable
//! addresses, and builds ICE-lite answers.

use std::fmt;
use std::io::Cursor;
use std::net::IpAddr;

use sdp::description::common::{Address, Attribute, ConnectionInformation};
use sdp::description::media::{MediaDescription, RangedPort};
use sdp::description::session::SessionDescription as Description;

use crate::error::SdpError;
use crate::types::{CandidateDescriptor, NetType, RelayEndpoint};

/// One `m=` section
pub type MediaSection = MediaDescription;

/// Parsed session description
#[derive(Clone, Debug)]
pub struct SessionDescription {
    inner: Description,
}

/// A candidate the server advertises
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvertisedCandidate {
    pub net_type: NetType,
    pub ip: String,
    pub port: u16,
}

/// Local parameters placed into an answer
#[derive(Clone, Debug)]
pub struct AnswerParams {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    /// Colon separated SHA-256 fingerprint of our certificate
    pub fingerprint: String,
    pub candidates: Vec<AdvertisedCandidate>,
}

/// Attributes copied from an offered media section into the answer
const MIRRORED_ATTRIBUTES: &[&str] = &[
    "mid", "rtpmap", "fmtp", "rtcp-fb", "extmap", "rtcp-rsize", "sctp-port",
    "max-message-size",
];

impl SessionDescription {
    /// Parse SDP text (`\r\n` or `\n` line endings)
    pub fn parse(text: &str) -> Result<Self, SdpError> {
        if text.trim().is_empty() {
            return Err(SdpError::Empty);
        }
        let inner = Description::unmarshal(&mut Cursor::new(text.as_bytes()))?;
        if inner.media_descriptions.is_empty() {
            return Err(SdpError::NoMedia);
        }
        Ok(Self { inner })
    }

    pub fn media(&self) -> &[MediaSection] {
        &self.inner.media_descriptions
    }

    /// The underlying parsed description
    pub fn description(&self) -> &Description {
        &self.inner
    }

    /// First value of a session-level attribute
    pub fn session_attribute(&self, name: &str) -> Option<&str> {
        find_attribute(&self.inner.attributes, name)
    }

    /// Attribute from session level, falling back to the first media section
    /// that carries it
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.session_attribute(name)
            .or_else(|| self.media().iter().find_map(|m| m.attr(name)))
    }

    /// Remote ICE username fragment and password
    pub fn ice_credentials(&self) -> Option<(String, String)> {
        let ufrag = self.attribute("ice-ufrag")?;
        let pwd = self.attribute("ice-pwd")?;
        Some((ufrag.to_string(), pwd.to_string()))
    }

    /// Remote certificate fingerprint as `(algorithm, value)`
    pub fn fingerprint(&self) -> Option<(String, String)> {
        let value = self.attribute("fingerprint")?;
        let (alg, fp) = value.split_once(' ')?;
        Some((alg.to_ascii_lowercase(), fp.trim().to_string()))
    }

    /// Replace every advertised candidate with `candidates`
    ///
    /// Candidate attributes at session level are dropped; each active media
    /// section gets the full candidate list, a matching `c=` line and the
    /// first candidate's port in its `m=` line. Rejected sections (port 0)
    /// are left alone. All other attributes are preserved.
    pub fn rewrite_candidates(&mut self, candidates: &[AdvertisedCandidate]) {
        self.inner.attributes.retain(|a| !is_candidate(a));

        let Some(first) = candidates.first() else {
            for section in &mut self.inner.media_descriptions {
                section.attributes.retain(|a| !is_candidate(a));
            }
            return;
        };

        for section in &mut self.inner.media_descriptions {
            if section.port() == Some(0) {
                continue;
            }
            section.attributes.retain(|a| !is_candidate(a));
            section.media_name.port = RangedPort {
                value: first.port as isize,
                range: None,
            };
            section.connection_information = Some(connection_information(&first.ip));

            for (idx, candidate) in candidates.iter().enumerate() {
                section.attributes.push(Attribute::new(
                    "candidate".to_string(),
                    Some(candidate_value(idx, candidate)),
                ));
            }
            section
                .attributes
                .push(Attribute::new("end-of-candidates".to_string(), None));
        }
    }

    /// Build an ICE-lite answer mirroring the offer's media sections
    pub fn build_answer(
        offer: &SessionDescription,
        params: &AnswerParams,
        session_id: u64,
    ) -> Result<SessionDescription, SdpError> {
        if offer.media().is_empty() {
            return Err(SdpError::NoMedia);
        }

        let mut answer = Description::new_jsep_session_description(false);
        answer.origin.username = "rtcpilot".to_string();
        answer.origin.session_id = session_id;
        answer.origin.session_version = 2;
        answer.origin.unicast_address = "127.0.0.1".to_string();
        answer
            .attributes
            .push(Attribute::new("ice-lite".to_string(), None));
        for name in ["group", "msid-semantic"] {
            if let Some(attr) = offer.inner.attributes.iter().find(|a| a.key == name) {
                answer.attributes.push(attr.clone());
            }
        }

        for section in offer.media() {
            let mut attributes: Vec<Attribute> = section
                .attributes
                .iter()
                .filter(|a| MIRRORED_ATTRIBUTES.contains(&a.key.as_str()))
                .cloned()
                .collect();
            let valued = |key: &str, value: String| Attribute::new(key.to_string(), Some(value));
            attributes.push(valued("ice-ufrag", params.ice_ufrag.clone()));
            attributes.push(valued("ice-pwd", params.ice_pwd.clone()));
            attributes.push(valued("fingerprint", format!("sha-256 {}", params.fingerprint)));
            attributes.push(valued("setup", "passive".to_string()));
            attributes.push(Attribute::new(
                answer_direction(section.direction()).to_string(),
                None,
            ));
            if section.kind() != "application" {
                attributes.push(Attribute::new("rtcp-mux".to_string(), None));
            }

            // Rejected sections keep port 0 and are skipped by the rewrite
            let mut media = section.clone();
            media.media_title = None;
            media.bandwidth.clear();
            media.encryption_key = None;
            media.connection_information = Some(connection_information("0.0.0.0"));
            media.attributes = attributes;
            answer.media_descriptions.push(media);
        }

        let mut answer = SessionDescription { inner: answer };
        answer.rewrite_candidates(&params.candidates);
        Ok(answer)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.marshal())
    }
}

/// Queries on an `m=` section
pub trait MediaSectionExt {
    /// `audio`, `video` or `application`
    fn kind(&self) -> &str;
    fn port(&self) -> Option<u16>;
    fn mid(&self) -> Option<&str>;
    /// Value of the first attribute named `name`, `""` for flags
    fn attr(&self, name: &str) -> Option<&str>;
    /// Media direction, `sendrecv` when absent
    fn direction(&self) -> &str;
    /// Values of the `a=candidate` attributes
    fn candidates(&self) -> Vec<&str>;
}

impl MediaSectionExt for MediaDescription {
    fn kind(&self) -> &str {
        &self.media_name.media
    }

    fn port(&self) -> Option<u16> {
        u16::try_from(self.media_name.port.value).ok()
    }

    fn mid(&self) -> Option<&str> {
        self.attr("mid")
    }

    fn attr(&self, name: &str) -> Option<&str> {
        find_attribute(&self.attributes, name)
    }

    fn direction(&self) -> &str {
        ["sendrecv", "sendonly", "recvonly", "inactive"]
            .into_iter()
            .find(|dir| self.attributes.iter().any(|a| a.key == *dir))
            .unwrap_or("sendrecv")
    }

    fn candidates(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|a| a.key == "candidate")
            .filter_map(|a| a.value.as_deref())
            .collect()
    }
}

/// Build the list of candidates to advertise
///
/// With a relay endpoint, UDP candidates are replaced by the relay's
/// address and allocated port; TCP candidates are advertised as configured.
pub fn advertised_candidates(
    candidates: &[CandidateDescriptor],
    relay: Option<&RelayEndpoint>,
) -> Vec<AdvertisedCandidate> {
    let mut out: Vec<AdvertisedCandidate> = Vec::new();
    for candidate in candidates {
        let advertised = match (candidate.net_type, relay) {
            (NetType::Udp, Some(relay)) => AdvertisedCandidate {
                net_type: NetType::Udp,
                ip: relay.ip.clone(),
                port: relay.port,
            },
            _ => AdvertisedCandidate {
                net_type: candidate.net_type,
                ip: candidate.candidate_ip.clone(),
                port: candidate.port,
            },
        };
        if !out.contains(&advertised) {
            out.push(advertised);
        }
    }
    if let Some(relay) = relay {
        let relay_candidate = AdvertisedCandidate {
            net_type: NetType::Udp,
            ip: relay.ip.clone(),
            port: relay.port,
        };
        if !out.contains(&relay_candidate) {
            out.insert(0, relay_candidate);
        }
    }
    out
}

fn find_attribute<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.key == name)
        .map(|a| a.value.as_deref().unwrap_or(""))
}

fn is_candidate(attr: &Attribute) -> bool {
    attr.key == "candidate" || attr.key == "end-of-candidates"
}

fn connection_information(ip: &str) -> ConnectionInformation {
    let address_type = match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => "IP6",
        _ => "IP4",
    };
    ConnectionInformation {
        network_type: "IN".to_string(),
        address_type: address_type.to_string(),
        address: Some(Address {
            address: ip.to_string(),
            ttl: None,
            range: None,
        }),
    }
}

fn answer_direction(offered: &str) -> &'static str {
    match offered {
        "sendonly" => "recvonly",
        "recvonly" => "sendonly",
        "inactive" => "inactive",
        _ => "sendrecv",
    }
}

/// RFC 8445 priority for a host candidate
fn candidate_priority(idx: usize, net_type: NetType) -> u32 {
    let type_pref: u32 = 126;
    let transport_pref: u32 = match net_type {
        NetType::Udp => 0x8000,
        NetType::Tcp => 0x4000,
    };
    let local_pref = transport_pref.saturating_sub(idx as u32).min(0xFFFF);
    (type_pref << 24) | (local_pref << 8) | (256 - 1)
}

/// Value of an `a=candidate:` attribute
fn candidate_value(idx: usize, candidate: &AdvertisedCandidate) -> String {
    let mut value = format!(
        "{} 1 {} {} {} {} typ host",
        idx + 1,
        candidate.net_type,
        candidate_priority(idx, candidate.net_type),
        candidate.ip,
        candidate.port
    );
    if candidate.net_type == NetType::Tcp {
        value.push_str(" tcptype passive");
    }
    value
}
