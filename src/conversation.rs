//! Conversations and the message codec.
//!
//! A conversation is identified by its sorted member ids and holds either the
//! key parts collected so far or the reconstructed [`SymmetricKey`]. Messages
//! move one way through three states:
//!
//! ```text
//! Draft --seal(key)--> EncryptedMessage --open(key)--> ClearMessage
//! ```
//!
//! Only [`EncryptedMessage`]s are stored or sent. Members are referenced by
//! id; callers load [`Node`](crate::identity::Node) records separately.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, CryptoError, NONCE_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE};
use crate::storage::Object;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("key for conversation {0} is not available yet")]
    KeyUnavailable(String),
    #[error("message belongs to conversation {found}, expected {expected}")]
    WrongConversation { expected: String, found: String },
    #[error("{0} is not a member of the conversation")]
    NotAMember(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("message content is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// `hash(sorted(member ids))`. Order and repetition of the input do not matter.
pub fn conversation_id<S: AsRef<str>>(member_ids: &[S]) -> String {
    let sorted = sorted_members(member_ids);
    let fields: Vec<&[u8]> = sorted.iter().map(|id| id.as_bytes()).collect();
    crypto::content_id_of(&fields)
}

/// Sorted, deduplicated copy of `member_ids`.
pub fn sorted_members<S: AsRef<str>>(member_ids: &[S]) -> Vec<String> {
    let mut sorted: Vec<String> = member_ids.iter().map(|id| id.as_ref().to_string()).collect();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// A negotiated conversation key.
///
/// The base nonce is derived from the key and never transmitted. Stored as
/// the base64 key alone.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SymmetricKey {
    key: Vec<u8>,
    nonce: [u8; NONCE_SIZE],
}

impl SymmetricKey {
    pub fn new(key: Vec<u8>) -> Self {
        let digest = crypto::hash(&key);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        Self { key, nonce }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// The AEAD key. Negotiated keys of another length are hashed down.
    fn cipher_key(&self) -> [u8; SYMMETRIC_KEY_SIZE] {
        match <[u8; SYMMETRIC_KEY_SIZE]>::try_from(self.key.as_slice()) {
            Ok(key) => key,
            Err(_) => crypto::hash(&self.key),
        }
    }

    /// Per-message nonce: `truncate(hash(base_nonce, author, time_sent))`.
    fn message_nonce(&self, author: &str, time_sent: u64) -> [u8; NONCE_SIZE] {
        let digest =
            crypto::hash_fields(&[&self.nonce, author.as_bytes(), &time_sent.to_be_bytes()]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        nonce
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("len", &self.key.len())
            .finish_non_exhaustive()
    }
}

impl From<SymmetricKey> for String {
    fn from(key: SymmetricKey) -> Self {
        crypto::b64_encode(&key.key)
    }
}

impl TryFrom<String> for SymmetricKey {
    type Error = CryptoError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Ok(SymmetricKey::new(crypto::b64_decode(&text)?))
    }
}

/// One member's contribution to a conversation key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPart {
    #[serde(with = "crypto::b64_bytes")]
    pub value: Vec<u8>,
    /// Author node id.
    pub author: String,
}

impl KeyPart {
    /// `hash(value)`; the sort key for reconstruction.
    pub fn id(&self) -> String {
        crypto::content_id(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KeyState {
    Pending { parts: Vec<KeyPart> },
    Complete { key: SymmetricKey },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Sorted member node ids.
    pub members: Vec<String>,
    pub key_state: KeyState,
    /// Creation time in milliseconds.
    pub created_at: u64,
}

impl Conversation {
    pub fn new<S: AsRef<str>>(member_ids: &[S], created_at: u64) -> Self {
        let members = sorted_members(member_ids);
        Self {
            id: conversation_id(&members),
            members,
            key_state: KeyState::Pending { parts: Vec::new() },
            created_at,
        }
    }

    pub fn is_member(&self, node_id: &str) -> bool {
        self.members.binary_search_by(|m| m.as_str().cmp(node_id)).is_ok()
    }

    pub fn key(&self) -> Option<&SymmetricKey> {
        match &self.key_state {
            KeyState::Complete { key } => Some(key),
            KeyState::Pending { .. } => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.key().is_some()
    }

    /// Parts collected so far; empty once the key is complete.
    pub fn parts(&self) -> &[KeyPart] {
        match &self.key_state {
            KeyState::Pending { parts } => parts,
            KeyState::Complete { .. } => &[],
        }
    }

    pub fn has_part_from(&self, author: &str) -> bool {
        self.parts().iter().any(|p| p.author == author)
    }

    fn require_key(&self) -> Result<&SymmetricKey, CodecError> {
        self.key()
            .ok_or_else(|| CodecError::KeyUnavailable(self.id.clone()))
    }

    /// Encrypt a draft written by a member of this conversation.
    pub fn seal(&self, draft: Draft, time_sent: u64) -> Result<EncryptedMessage, CodecError> {
        if draft.conversation != self.id {
            return Err(CodecError::WrongConversation {
                expected: self.id.clone(),
                found: draft.conversation,
            });
        }
        if !self.is_member(&draft.author) {
            return Err(CodecError::NotAMember(draft.author));
        }
        let key = self.require_key()?;
        let nonce = key.message_nonce(&draft.author, time_sent);
        let (ciphertext, tag) = crypto::seal_detached(
            &key.cipher_key(),
            &nonce,
            draft.content.as_bytes(),
            self.id.as_bytes(),
        )?;
        Ok(EncryptedMessage {
            author: draft.author,
            content: crypto::b64_encode(&ciphertext),
            digest: crypto::b64_encode(&tag),
            time_sent,
            time_received: None,
            conversation: draft.conversation,
        })
    }

    /// Decrypt and verify. Corruption anywhere fails; nothing partial is
    /// returned.
    pub fn open(&self, message: &EncryptedMessage) -> Result<ClearMessage, CodecError> {
        if message.conversation != self.id {
            return Err(CodecError::WrongConversation {
                expected: self.id.clone(),
                found: message.conversation.clone(),
            });
        }
        let key = self.require_key()?;
        let tag = crypto::b64_decode(&message.digest)?;
        if tag.len() != TAG_SIZE {
            return Err(CryptoError::InvalidLength("message digest must be 16 bytes").into());
        }
        let nonce = key.message_nonce(&message.author, message.time_sent);
        let plaintext = crypto::open_detached(
            &key.cipher_key(),
            &nonce,
            &crypto::b64_decode(&message.content)?,
            &tag,
            self.id.as_bytes(),
        )?;
        Ok(ClearMessage {
            id: message.id(),
            author: message.author.clone(),
            content: String::from_utf8(plaintext)?,
            time_sent: message.time_sent,
            time_received: message.time_received,
            conversation: message.conversation.clone(),
        })
    }
}

impl Object for Conversation {
    const KIND: &'static str = "conversation";

    fn object_id(&self) -> String {
        self.id.clone()
    }
}

/// An unsent, editable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub author: String,
    pub content: String,
    pub conversation: String,
}

impl Draft {
    pub fn new(author: impl Into<String>, conversation: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            content: String::new(),
            conversation: conversation.into(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }
}

/// A sealed message as stored and sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub author: String,
    /// Ciphertext, base64.
    pub content: String,
    /// AEAD tag, base64.
    pub digest: String,
    /// Milliseconds since epoch, set by the author.
    pub time_sent: u64,
    /// Set locally on receipt; not part of the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_received: Option<u64>,
    pub conversation: String,
}

impl EncryptedMessage {
    /// `hash(time_sent, digest)`.
    pub fn id(&self) -> String {
        crypto::content_id_of(&[&self.time_sent.to_be_bytes(), self.digest.as_bytes()])
    }
}

impl Object for EncryptedMessage {
    const KIND: &'static str = "message";

    fn object_id(&self) -> String {
        self.id()
    }

    fn parent_id(&self) -> Option<String> {
        Some(self.conversation.clone())
    }
}

/// A decrypted message. Never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearMessage {
    pub id: String,
    pub author: String,
    pub content: String,
    pub time_sent: u64,
    pub time_received: Option<u64>,
    pub conversation: String,
}
