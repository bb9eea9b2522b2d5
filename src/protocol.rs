//! Wire envelope and the closed set of request types.
//!
//! ## Wire summary
//! - Every request travels as a JSON envelope
//!   `{"status": "<TYPE>", "data": {...}, "timestamp": <ms since epoch>}`.
//! - A request id is `hash(status, data)`. The timestamp is left out so that
//!   resends and rebroadcasts of the same content collapse to one id. The
//!   hashed form is the canonical JSON of the typed payload, so ids do not
//!   depend on how a peer ordered its fields.
//! - Parsing is structural only: an unknown status or a payload of the wrong
//!   shape is rejected here. Signatures, freshness and references are checked
//!   by [`Request::validate`] and by the router.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::contact::Contact;
use crate::conversation::EncryptedMessage;
use crate::crypto::{self, SealedBox};
use crate::identity::{IdentityError, Node};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Request type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// LAN broadcast of a contact.
    Bcp,
    /// "Send me your contacts."
    Dcp,
    /// "Send me your nodes."
    Dnp,
    /// Contact set publication.
    Csp,
    /// Node set publication.
    Npp,
    /// Key exchange part.
    Kep,
    /// Encrypted message propagation.
    Mpp,
    /// Catch-up request for a time window.
    WupIni,
    /// Catch-up reply carrying a bundle of requests.
    WupRep,
}

/// Declared semantics of a request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    pub name: &'static str,
    /// Stored in the request log, and therefore deduplicated and replayable.
    pub persisted: bool,
    pub expects_reply: bool,
    /// Flooded to every reachable contact when first seen.
    pub relayed: bool,
}

impl Status {
    pub const ALL: [Status; 9] = [
        Status::Bcp,
        Status::Dcp,
        Status::Dnp,
        Status::Csp,
        Status::Npp,
        Status::Kep,
        Status::Mpp,
        Status::WupIni,
        Status::WupRep,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Bcp => "BCP",
            Status::Dcp => "DCP",
            Status::Dnp => "DNP",
            Status::Csp => "CSP",
            Status::Npp => "NPP",
            Status::Kep => "KEP",
            Status::Mpp => "MPP",
            Status::WupIni => "WUP_INI",
            Status::WupRep => "WUP_REP",
        }
    }

    pub fn parse(tag: &str) -> Option<Status> {
        Status::ALL.into_iter().find(|s| s.as_str() == tag)
    }

    pub fn info(self) -> TypeInfo {
        let (name, persisted, expects_reply, relayed) = match self {
            Status::Bcp => ("broadcast contact publication", false, false, false),
            Status::Dcp => ("discover contacts", false, true, false),
            Status::Dnp => ("discover nodes", false, true, false),
            Status::Csp => ("contact set publication", true, false, true),
            Status::Npp => ("node set publication", true, false, true),
            Status::Kep => ("key exchange part", true, false, true),
            Status::Mpp => ("message propagation", true, false, true),
            Status::WupIni => ("catch-up request", false, true, false),
            Status::WupRep => ("catch-up reply", false, false, false),
        };
        TypeInfo {
            name,
            persisted,
            expects_reply,
            relayed,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `BCP`, `DCP` and `DNP`: who is asking, and where to answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactAnnouncement {
    pub author: Contact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSet {
    pub contacts: Vec<Contact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSet {
    pub nodes: Vec<Node>,
}

/// One member's key part, sealed for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    pub key_part: SealedBox,
    /// Hex SHA-256 of the plaintext part.
    pub hash: String,
    /// Author's signature over `hash`.
    pub sig: String,
    pub author: Node,
    pub members: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePropagation {
    pub message: EncryptedMessage,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpRequest {
    pub beginning: u64,
    pub end: u64,
    pub author: Contact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpReply {
    pub requests: Vec<Request>,
}

/// Typed payload; the variant selects the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestData {
    Bcp(ContactAnnouncement),
    Dcp(ContactAnnouncement),
    Dnp(ContactAnnouncement),
    Csp(ContactSet),
    Npp(NodeSet),
    Kep(KeyExchange),
    Mpp(MessagePropagation),
    WupIni(CatchUpRequest),
    WupRep(CatchUpReply),
}

impl RequestData {
    pub fn status(&self) -> Status {
        match self {
            RequestData::Bcp(_) => Status::Bcp,
            RequestData::Dcp(_) => Status::Dcp,
            RequestData::Dnp(_) => Status::Dnp,
            RequestData::Csp(_) => Status::Csp,
            RequestData::Npp(_) => Status::Npp,
            RequestData::Kep(_) => Status::Kep,
            RequestData::Mpp(_) => Status::Mpp,
            RequestData::WupIni(_) => Status::WupIni,
            RequestData::WupRep(_) => Status::WupRep,
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            RequestData::Bcp(p) | RequestData::Dcp(p) | RequestData::Dnp(p) => {
                serde_json::to_value(p)
            }
            RequestData::Csp(p) => serde_json::to_value(p),
            RequestData::Npp(p) => serde_json::to_value(p),
            RequestData::Kep(p) => serde_json::to_value(p),
            RequestData::Mpp(p) => serde_json::to_value(p),
            RequestData::WupIni(p) => serde_json::to_value(p),
            RequestData::WupRep(p) => serde_json::to_value(p),
        }
    }

    fn from_value(status: Status, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match status {
            Status::Bcp => RequestData::Bcp(serde_json::from_value(data)?),
            Status::Dcp => RequestData::Dcp(serde_json::from_value(data)?),
            Status::Dnp => RequestData::Dnp(serde_json::from_value(data)?),
            Status::Csp => RequestData::Csp(serde_json::from_value(data)?),
            Status::Npp => RequestData::Npp(serde_json::from_value(data)?),
            Status::Kep => RequestData::Kep(serde_json::from_value(data)?),
            Status::Mpp => RequestData::Mpp(serde_json::from_value(data)?),
            Status::WupIni => RequestData::WupIni(serde_json::from_value(data)?),
            Status::WupRep => RequestData::WupRep(serde_json::from_value(data)?),
        })
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown status {0:?}")]
    UnknownStatus(String),
    #[error("malformed {status} payload: {source}")]
    Payload {
        status: Status,
        source: serde_json::Error,
    },
    #[error("envelope of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    status: String,
    data: Value,
    timestamp: u64,
}

#[derive(Serialize)]
struct CanonicalContent<'a> {
    status: &'a str,
    data: &'a Value,
}

/// `{status, data, timestamp}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub data: RequestData,
    pub timestamp: u64,
}

impl Request {
    /// Wrap `data`, stamped with the current time.
    pub fn new(data: RequestData) -> Self {
        Self {
            data,
            timestamp: now_millis(),
        }
    }

    pub fn status(&self) -> Status {
        self.data.status()
    }

    pub fn info(&self) -> TypeInfo {
        self.status().info()
    }

    /// `hash(status, data)`; independent of `timestamp`.
    pub fn id(&self) -> Result<String, EnvelopeError> {
        let data = self.data.to_value().map_err(EnvelopeError::Encode)?;
        let canonical = serde_json::to_vec(&CanonicalContent {
            status: self.status().as_str(),
            data: &data,
        })
        .map_err(EnvelopeError::Encode)?;
        Ok(crypto::content_id(&canonical))
    }

    fn to_wire(&self) -> Result<WireEnvelope, serde_json::Error> {
        Ok(WireEnvelope {
            status: self.status().as_str().to_string(),
            data: self.data.to_value()?,
            timestamp: self.timestamp,
        })
    }

    fn from_wire(wire: WireEnvelope) -> Result<Self, EnvelopeError> {
        let status =
            Status::parse(&wire.status).ok_or_else(|| EnvelopeError::UnknownStatus(wire.status))?;
        let data = RequestData::from_value(status, wire.data)
            .map_err(|source| EnvelopeError::Payload { status, source })?;
        Ok(Self {
            data,
            timestamp: wire.timestamp,
        })
    }

    /// Parse raw bytes into a structurally valid request.
    pub fn parse(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)?;
        Self::from_wire(wire)
    }

    /// Like [`Request::parse`], refusing oversized input first.
    pub fn parse_bounded(bytes: &[u8], limit: usize) -> Result<Self, EnvelopeError> {
        if bytes.len() > limit {
            return Err(EnvelopeError::TooLarge {
                size: bytes.len(),
                limit,
            });
        }
        Self::parse(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let wire = self.to_wire().map_err(EnvelopeError::Encode)?;
        serde_json::to_vec(&wire).map_err(EnvelopeError::Encode)
    }

    /// Envelope as a JSON string, the form kept in the request log.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        let wire = self.to_wire().map_err(EnvelopeError::Encode)?;
        serde_json::to_string(&wire).map_err(EnvelopeError::Encode)
    }

    /// Context-free semantic checks: freshness, routable contacts, node
    /// self-signatures and member set shape. Checks that need local state
    /// (known conversations, expected part lengths) happen in the handlers.
    pub fn validate(&self, now: u64, max_skew: Duration) -> Result<(), ValidationError> {
        let limit = now.saturating_add(max_skew.as_millis() as u64);
        if self.timestamp > limit {
            return Err(ValidationError::FutureTimestamp {
                timestamp: self.timestamp,
                now,
            });
        }

        match &self.data {
            RequestData::Bcp(p) | RequestData::Dcp(p) | RequestData::Dnp(p) => {
                validate_contact(&p.author)
            }
            RequestData::Csp(p) => p.contacts.iter().try_for_each(validate_contact),
            RequestData::Npp(p) => p.nodes.iter().try_for_each(validate_node),
            RequestData::Kep(p) => {
                validate_members(&p.members)?;
                validate_node(&p.author)?;
                if !p.members.contains(&p.author) {
                    return Err(ValidationError::AuthorNotMember(p.author.id.clone()));
                }
                Ok(())
            }
            RequestData::Mpp(p) => {
                if p.message.conversation != p.conversation_id {
                    return Err(ValidationError::ConversationMismatch);
                }
                Ok(())
            }
            RequestData::WupIni(p) => {
                if p.beginning > p.end {
                    return Err(ValidationError::InvalidWindow {
                        beginning: p.beginning,
                        end: p.end,
                    });
                }
                validate_contact(&p.author)
            }
            // Bundled requests are validated one by one when unwrapped.
            RequestData::WupRep(_) => Ok(()),
        }
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEnvelope::deserialize(deserializer)?;
        Request::from_wire(wire).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Semantic validation
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("timestamp {timestamp} is in the future (now {now})")]
    FutureTimestamp { timestamp: u64, now: u64 },
    #[error("unroutable contact: {0}")]
    UnroutableContact(&'static str),
    #[error("invalid node {id}: {source}")]
    InvalidNode {
        id: String,
        #[source]
        source: IdentityError,
    },
    #[error("member set is empty")]
    EmptyMembers,
    #[error("member {0} listed twice")]
    DuplicateMember(String),
    #[error("author {0} is not a member")]
    AuthorNotMember(String),
    #[error("message conversation does not match envelope")]
    ConversationMismatch,
    #[error("invalid window {beginning}..{end}")]
    InvalidWindow { beginning: u64, end: u64 },
    #[error("catch-up bundle nested deeper than {0}")]
    CatchUpTooDeep(usize),
}

fn validate_contact(contact: &Contact) -> Result<(), ValidationError> {
    match contact.unroutable_reason() {
        Some(reason) => Err(ValidationError::UnroutableContact(reason)),
        None => Ok(()),
    }
}

fn validate_node(node: &Node) -> Result<(), ValidationError> {
    node.verify().map_err(|source| ValidationError::InvalidNode {
        id: node.id.clone(),
        source,
    })
}

fn validate_members(members: &[Node]) -> Result<(), ValidationError> {
    if members.is_empty() {
        return Err(ValidationError::EmptyMembers);
    }
    let mut seen = HashSet::new();
    for member in members {
        if !seen.insert(member.id.as_str()) {
            return Err(ValidationError::DuplicateMember(member.id.clone()));
        }
        validate_node(member)?;
    }
    Ok(())
}
