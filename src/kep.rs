//! Leaderless key exchange.
//!
//! Every member of a conversation contributes one random key part. For a key
//! of `L` bytes and `N` members each part is `L / N` bytes, except the
//! designated member's, which also absorbs `L % N`. The designated member is
//! the one whose id is closest, by character-wise Hamming distance, to
//! `hash(sorted member ids)`; ties go to the smallest id. Every member can
//! therefore check the length of every other member's part on its own.
//!
//! A part is sealed separately for each other member and sent in its own
//! `KEP` request, signed over the part's hash. Once one valid part per member
//! is held, the parts are sorted by part id and concatenated.
//!
//! Our own `KEP` requests are generated once and kept, so re-announcing them
//! produces byte-identical requests that peers drop as duplicates.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::conversation::{
    conversation_id, sorted_members, Conversation, KeyPart, KeyState, SymmetricKey,
};
use crate::crypto::{self, CryptoError};
use crate::identity::{Identity, IdentityError, Node};
use crate::logging;
use crate::protocol::{now_millis, KeyExchange, Request, RequestData};
use crate::storage::{Object, ObjectStore, StorageError, StoreExt};

/// HPKE `info` for sealed key parts.
pub const KEP_INFO: &[u8] = b"hush-kep";

#[derive(Debug, Error)]
pub enum KepError {
    #[error("part hash does not match its content")]
    HashMismatch,
    #[error("invalid part signature: {0}")]
    BadSignature(#[source] CryptoError),
    #[error("part from {author} is {actual} bytes, expected {expected}")]
    PartLength {
        author: String,
        expected: usize,
        actual: usize,
    },
    #[error("{0} is not a member of the conversation")]
    NotAMember(String),
    #[error("author node does not verify: {0}")]
    UnverifiedAuthor(#[source] IdentityError),
    #[error("local node is not among the members")]
    NotParticipating,
    #[error("reconstructed key for {conversation} is {actual} bytes, expected {expected}")]
    InvariantViolation {
        conversation: String,
        expected: usize,
        actual: usize,
    },
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("key exchange lock poisoned")]
    Poisoned,
}

impl KepError {
    /// Whether this error means a correct peer set could not have produced it,
    /// i.e. processing must stop rather than drop the request.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, KepError::InvariantViolation { .. })
    }
}

/// Character-wise Hamming distance. Unequal lengths count the excess as
/// differences.
pub fn hamming_distance(a: &str, b: &str) -> usize {
    let differing = a.chars().zip(b.chars()).filter(|(x, y)| x != y).count();
    differing + a.chars().count().abs_diff(b.chars().count())
}

/// Who absorbs the remainder and how long each part is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Designation {
    pub designated: String,
    pub floor: usize,
    pub remainder: usize,
}

impl Designation {
    /// `None` for an empty member set.
    pub fn compute<S: AsRef<str>>(member_ids: &[S], key_length: usize) -> Option<Self> {
        let members = sorted_members(member_ids);
        let reference = conversation_id(&members);
        // `members` is sorted, so min_by_key keeps the smallest id on ties.
        let designated = members
            .iter()
            .min_by_key(|id| hamming_distance(id, &reference))?
            .clone();
        Some(Self {
            designated,
            floor: key_length / members.len(),
            remainder: key_length % members.len(),
        })
    }

    pub fn part_length(&self, member_id: &str) -> usize {
        if member_id == self.designated {
            self.floor + self.remainder
        } else {
            self.floor
        }
    }
}

/// Concatenate parts in part-id order.
pub fn reconstruct(parts: &[KeyPart]) -> Vec<u8> {
    let mut sorted: Vec<&KeyPart> = parts.iter().collect();
    sorted.sort_by_cached_key(|p| p.id());
    sorted.iter().flat_map(|p| p.value.iter().copied()).collect()
}

/// Our own part for one conversation and the `KEP` requests carrying it.
///
/// Kept after the conversation expires, so a restarted exchange reuses the
/// part peers may already hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyAnnouncement {
    pub conversation: String,
    pub part: KeyPart,
    pub requests: Vec<Request>,
}

impl Object for KeyAnnouncement {
    const KIND: &'static str = "key_announcement";

    fn object_id(&self) -> String {
        self.conversation.clone()
    }

    fn parent_id(&self) -> Option<String> {
        Some(self.conversation.clone())
    }
}

/// What happened to an incoming `KEP` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Sealed for another member, or we are not in the conversation.
    NotForUs,
    /// A part from this author is already held, or the key is complete.
    AlreadyHave,
    /// Part stored. `completed` is set when the key is now complete.
    Stored { completed: bool },
}

/// Result of [`KepCoordinator::verify`].
#[derive(Debug)]
pub enum Verified {
    /// Sealed for another member, or we are not in the conversation. Such
    /// parts cannot be checked here.
    NotForUs { conversation: String },
    Part(VerifiedPart),
}

/// A part whose author, hash, signature and length have been checked.
#[derive(Debug)]
pub struct VerifiedPart {
    pub conversation: String,
    members: Vec<Node>,
    part: KeyPart,
}

/// Outcome of [`KepCoordinator::receive`]: the disposition of the part plus
/// any `KEP` requests of our own that must now be broadcast.
#[derive(Debug, Clone)]
pub struct Progress {
    pub conversation: String,
    pub received: Received,
    pub announce: Vec<Request>,
}

pub struct KepCoordinator {
    identity: Arc<Identity>,
    store: Arc<dyn ObjectStore>,
    key_length: usize,
    /// Serialises read-modify-write of conversation key state.
    lock: Mutex<()>,
}

impl KepCoordinator {
    pub fn new(identity: Arc<Identity>, store: Arc<dyn ObjectStore>, key_length: usize) -> Self {
        Self {
            identity,
            store,
            key_length,
            lock: Mutex::new(()),
        }
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, KepError> {
        self.lock.lock().map_err(|_| KepError::Poisoned)
    }

    /// Make sure a conversation with `members` exists and our part has been
    /// generated. Returns the conversation id and the `KEP` requests to
    /// broadcast, which is empty if they were produced earlier.
    pub fn initiate(&self, members: &[Node]) -> Result<(String, Vec<Request>), KepError> {
        let _guard = self.guard()?;
        let mut conversation = self.load_or_create(members)?;
        let requests = self.contribute(&mut conversation, members)?;
        Ok((conversation.id, requests))
    }

    /// Process the `KEP` payload of a validated request.
    pub fn receive(&self, exchange: &KeyExchange) -> Result<Progress, KepError> {
        match self.verify(exchange)? {
            Verified::NotForUs { conversation } => Ok(Progress {
                conversation,
                received: Received::NotForUs,
                announce: Vec::new(),
            }),
            Verified::Part(part) => self.accept(part),
        }
    }

    /// Open and check a part without touching conversation state.
    ///
    /// The author must be the member record listed in `members`; the hash and
    /// signature are checked against that record's keys.
    pub fn verify(&self, exchange: &KeyExchange) -> Result<Verified, KepError> {
        let member_ids: Vec<&str> = exchange.members.iter().map(|m| m.id.as_str()).collect();
        let id = conversation_id(&member_ids);

        if !member_ids.contains(&self.identity.id()) {
            return Ok(Verified::NotForUs { conversation: id });
        }
        let Ok(value) = self
            .identity
            .open(&exchange.key_part, KEP_INFO, id.as_bytes())
        else {
            return Ok(Verified::NotForUs { conversation: id });
        };

        let author = exchange
            .members
            .iter()
            .find(|m| m.id == exchange.author.id)
            .ok_or_else(|| KepError::NotAMember(exchange.author.id.clone()))?;
        if *author != exchange.author {
            return Err(KepError::NotAMember(exchange.author.id.clone()));
        }
        author.verify().map_err(KepError::UnverifiedAuthor)?;
        if hex::encode(crypto::hash(&value)) != exchange.hash {
            return Err(KepError::HashMismatch);
        }
        author
            .verify_signature(exchange.hash.as_bytes(), &exchange.sig)
            .map_err(KepError::BadSignature)?;
        let expected = self.part_length(&member_ids, &author.id);
        if value.len() != expected {
            return Err(KepError::PartLength {
                author: author.id.clone(),
                expected,
                actual: value.len(),
            });
        }

        Ok(Verified::Part(VerifiedPart {
            conversation: id,
            members: exchange.members.clone(),
            part: KeyPart {
                value,
                author: author.id.clone(),
            },
        }))
    }

    /// Store a verified part, then contribute our own if still needed.
    pub fn accept(&self, verified: VerifiedPart) -> Result<Progress, KepError> {
        let VerifiedPart { members, part, .. } = verified;
        let author = part.author.clone();

        let _guard = self.guard()?;
        let mut conversation = self.load_or_create(&members)?;
        let fresh = !conversation.is_complete() && !conversation.has_part_from(&author);
        if fresh {
            self.add_part(&mut conversation, part)?;
        } else {
            trace!(
                conversation = %logging::conversation_id(&conversation.id),
                author = %logging::node_id(&author),
                "already have part"
            );
        }
        let announce = self.contribute(&mut conversation, &members)?;
        let received = if fresh {
            Received::Stored {
                completed: conversation.is_complete(),
            }
        } else {
            Received::AlreadyHave
        };

        Ok(Progress {
            conversation: conversation.id,
            received,
            announce,
        })
    }

    /// Previously generated `KEP` requests for `conversation`.
    pub fn announcement(&self, conversation: &str) -> Result<Vec<Request>, KepError> {
        Ok(self
            .store
            .get_by_id::<KeyAnnouncement>(conversation)?
            .map(|a| a.requests)
            .unwrap_or_default())
    }

    /// Our stored `KEP` requests for every conversation created within
    /// `horizon` of `now` (milliseconds).
    pub fn announcements_since(&self, now: u64, horizon: Duration) -> Result<Vec<Request>, KepError> {
        let cutoff = now.saturating_sub(horizon.as_millis() as u64);
        let mut requests = Vec::new();
        for conversation in self.store.get_all::<Conversation>()? {
            if conversation.created_at >= cutoff {
                requests.extend(self.announcement(&conversation.id)?);
            }
        }
        Ok(requests)
    }

    /// Drop conversations still pending after `ttl`. Returns how many.
    ///
    /// Our own part is kept: it stops being re-announced, but a later
    /// exchange for the same members (a peer's part arriving, a node set
    /// naming the peer, a local start) resumes with it.
    pub fn expire_pending(&self, now: u64, ttl: Duration) -> Result<usize, KepError> {
        let cutoff = now.saturating_sub(ttl.as_millis() as u64);
        let _guard = self.guard()?;
        let mut expired = 0;
        for conversation in self.store.get_all::<Conversation>()? {
            if conversation.is_complete() || conversation.created_at >= cutoff {
                continue;
            }
            self.store.forget::<Conversation>(&conversation.id)?;
            info!(
                conversation = %logging::conversation_id(&conversation.id),
                parts = conversation.parts().len(),
                members = conversation.members.len(),
                "expired pending conversation"
            );
            expired += 1;
        }
        Ok(expired)
    }

    fn part_length(&self, member_ids: &[&str], author: &str) -> usize {
        Designation::compute(member_ids, self.key_length)
            .map(|d| d.part_length(author))
            .unwrap_or(0)
    }

    fn load_or_create(&self, members: &[Node]) -> Result<Conversation, KepError> {
        for node in members {
            if node.id != self.identity.id() && !self.store.is_known::<Node>(&node.id)? {
                self.store.store(node)?;
            }
        }
        let member_ids: Vec<&str> = members.iter().map(|m| m.id.as_str()).collect();
        let id = conversation_id(&member_ids);
        if let Some(conversation) = self.store.get_by_id::<Conversation>(&id)? {
            return Ok(conversation);
        }
        let mut conversation = Conversation::new(&member_ids, now_millis());
        match self.store.get_by_id::<KeyAnnouncement>(&id)? {
            Some(announcement) => {
                self.add_part(&mut conversation, announcement.part)?;
            }
            None => self.store.store(&conversation)?,
        }
        debug!(
            conversation = %logging::conversation_id(&conversation.id),
            members = conversation.members.len(),
            "created conversation"
        );
        Ok(conversation)
    }

    /// Generate, store and seal our part unless that already happened.
    fn contribute(
        &self,
        conversation: &mut Conversation,
        members: &[Node],
    ) -> Result<Vec<Request>, KepError> {
        let own_id = self.identity.id().to_string();
        if !conversation.is_member(&own_id) {
            return Err(KepError::NotParticipating);
        }
        if self.store.is_known::<KeyAnnouncement>(&conversation.id)? {
            return Ok(Vec::new());
        }

        let member_ids: Vec<&str> = conversation.members.iter().map(String::as_str).collect();
        let length = self.part_length(&member_ids, &own_id);
        let value = crypto::random_bytes(length);
        let hash = hex::encode(crypto::hash(&value));
        let sig = self.identity.sign(hash.as_bytes())?;

        let mut sorted_members = members.to_vec();
        sorted_members.sort_by(|a, b| a.id.cmp(&b.id));
        sorted_members.dedup_by(|a, b| a.id == b.id);

        let mut requests = Vec::new();
        for recipient in sorted_members.iter().filter(|m| m.id != own_id) {
            let key_part = crypto::seal_to(
                &recipient.public_key,
                &value,
                KEP_INFO,
                conversation.id.as_bytes(),
                None,
            )?;
            requests.push(Request::new(RequestData::Kep(KeyExchange {
                key_part,
                hash: hash.clone(),
                sig: sig.clone(),
                author: self.identity.node().clone(),
                members: sorted_members.clone(),
            })));
        }

        let part = KeyPart {
            value,
            author: own_id.clone(),
        };
        if !conversation.is_complete() && !conversation.has_part_from(&own_id) {
            self.add_part(conversation, part.clone())?;
        }
        self.store.store(&KeyAnnouncement {
            conversation: conversation.id.clone(),
            part,
            requests: requests.clone(),
        })?;
        debug!(
            conversation = %logging::conversation_id(&conversation.id),
            part_len = length,
            recipients = requests.len(),
            "generated key part"
        );
        Ok(requests)
    }

    /// Add a part to a pending conversation and persist it, completing the
    /// key when every member has contributed.
    fn add_part(&self, conversation: &mut Conversation, part: KeyPart) -> Result<bool, KepError> {
        let KeyState::Pending { parts } = &mut conversation.key_state else {
            return Ok(false);
        };
        debug!(
            conversation = %logging::conversation_id(&conversation.id),
            author = %logging::node_id(&part.author),
            "stored key part"
        );
        parts.push(part);

        let completed = parts.len() == conversation.members.len();
        if completed {
            let key = reconstruct(parts);
            if key.len() != self.key_length {
                error!(
                    conversation = %logging::conversation_id(&conversation.id),
                    expected = self.key_length,
                    actual = key.len(),
                    "reconstructed key has wrong length"
                );
                return Err(KepError::InvariantViolation {
                    conversation: conversation.id.clone(),
                    expected: self.key_length,
                    actual: key.len(),
                });
            }
            conversation.key_state = KeyState::Complete {
                key: SymmetricKey::new(key),
            };
            info!(
                conversation = %logging::conversation_id(&conversation.id),
                members = conversation.members.len(),
                "conversation key complete"
            );
        }
        self.store.store(&*conversation)?;
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;

    struct Peer {
        identity: Arc<Identity>,
        store: Arc<SqliteStore>,
        kep: KepCoordinator,
    }

    fn peer(key_length: usize) -> Peer {
        let identity = Arc::new(Identity::generate().unwrap());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let kep = KepCoordinator::new(identity.clone(), store.clone(), key_length);
        Peer {
            identity,
            store,
            kep,
        }
    }

    fn exchange(request: &Request) -> &KeyExchange {
        match &request.data {
            RequestData::Kep(exchange) => exchange,
            other => panic!("expected KEP, got {:?}", other.status()),
        }
    }

    fn deliver_all(requests: &[Request], to: &Peer) -> Vec<Progress> {
        requests
            .iter()
            .map(|r| to.kep.receive(exchange(r)).unwrap())
            .collect()
    }

    fn conversation(peer: &Peer, id: &str) -> Conversation {
        peer.store.get_by_id::<Conversation>(id).unwrap().unwrap()
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance("abcd", "abcd"), 0);
        assert_eq!(hamming_distance("abcd", "abce"), 1);
        assert_eq!(hamming_distance("abcd", "ab"), 2);
        assert_eq!(hamming_distance("", "xyz"), 3);
    }

    #[test]
    fn test_partition_sums_to_key_length() {
        let members = ["m1", "m2", "m3", "m4", "m5"];
        for key_length in [1, 7, 32, 33, 64] {
            let designation = Designation::compute(&members, key_length).unwrap();
            let total: usize = members.iter().map(|m| designation.part_length(m)).sum();
            assert_eq!(total, key_length);
            assert_eq!(designation.remainder, key_length % members.len());
        }
        assert!(Designation::compute::<&str>(&[], 32).is_none());
    }

    #[test]
    fn test_designation_is_order_independent() {
        let a = Designation::compute(&["x1", "y2", "z3"], 32).unwrap();
        let b = Designation::compute(&["z3", "x1", "y2"], 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_designation_matches_closest_id() {
        let members = ["aaaa", "zzzz"];
        let reference = conversation_id(&members);
        let expected = members
            .iter()
            .min_by_key(|m| (hamming_distance(m, &reference), *m))
            .unwrap();
        let designation = Designation::compute(&members, 33).unwrap();
        assert_eq!(designation.designated, *expected);
        assert_eq!(designation.part_length(expected), 17);
    }

    #[test]
    fn test_ties_go_to_smallest_id() {
        // Both ids are equally far from any 43-character reference.
        let designation = Designation::compute(&["!", "\""], 4).unwrap();
        assert_eq!(designation.designated, "!");
    }

    #[test]
    fn test_reconstruct_is_order_independent() {
        let parts: Vec<KeyPart> = ["a", "b", "c"]
            .iter()
            .zip(1u8..)
            .map(|(author, byte)| KeyPart {
                value: vec![byte; 4],
                author: author.to_string(),
            })
            .collect();
        let mut reversed = parts.clone();
        reversed.reverse();
        assert_eq!(reconstruct(&parts), reconstruct(&reversed));
        assert_eq!(reconstruct(&parts).len(), 12);
    }

    #[test]
    fn test_two_members_agree_on_32_byte_key() {
        let alice = peer(32);
        let bob = peer(32);
        let members = vec![alice.identity.node().clone(), bob.identity.node().clone()];

        let (id, from_alice) = alice.kep.initiate(&members).unwrap();
        assert_eq!(from_alice.len(), 1);
        let progress = deliver_all(&from_alice, &bob);
        assert_eq!(progress[0].received, Received::Stored { completed: true });
        let from_bob = progress[0].announce.clone();
        assert_eq!(from_bob.len(), 1);

        let progress = deliver_all(&from_bob, &alice);
        assert_eq!(progress[0].received, Received::Stored { completed: true });
        assert!(progress[0].announce.is_empty());
        assert!(conversation(&bob, &id).is_complete());

        let alice_key = conversation(&alice, &id).key().unwrap().clone();
        let bob_key = conversation(&bob, &id).key().unwrap().clone();
        assert_eq!(alice_key, bob_key);
        assert_eq!(alice_key.len(), 32);

        let ids = [alice.identity.id(), bob.identity.id()];
        let designation = Designation::compute(&ids, 32).unwrap();
        let designated = &designation.designated;
        assert_eq!(designation.part_length(designated), 16);
        let other = ids.iter().find(|id| *id != designated).unwrap();
        assert_eq!(designation.part_length(other), 16);
    }

    #[test]
    fn test_three_members_with_remainder() {
        let peers: Vec<Peer> = (0..3).map(|_| peer(32)).collect();
        let members: Vec<Node> = peers.iter().map(|p| p.identity.node().clone()).collect();

        let (id, mut pending) = peers[0].kep.initiate(&members).unwrap();
        // Flood every request to everyone until nothing new is produced.
        while !pending.is_empty() {
            let mut next = Vec::new();
            for request in &pending {
                for p in &peers {
                    next.extend(p.kep.receive(exchange(request)).unwrap().announce);
                }
            }
            pending = next;
        }

        let keys: Vec<SymmetricKey> = peers
            .iter()
            .map(|p| conversation(p, &id).key().unwrap().clone())
            .collect();
        assert_eq!(keys[0].len(), 32);
        assert!(keys.iter().all(|k| *k == keys[0]));
    }

    #[test]
    fn test_part_for_other_member_is_not_for_us() {
        let alice = peer(32);
        let bob = peer(32);
        let carol = peer(32);
        let members: Vec<Node> = [&alice, &bob, &carol]
            .iter()
            .map(|p| p.identity.node().clone())
            .collect();
        let (id, requests) = alice.kep.initiate(&members).unwrap();

        let outcomes: Vec<Received> = deliver_all(&requests, &bob)
            .into_iter()
            .map(|p| p.received)
            .collect();
        assert_eq!(outcomes.iter().filter(|r| **r == Received::NotForUs).count(), 1);
        assert_eq!(conversation(&bob, &id).parts().len(), 2);

        let outsider = peer(32);
        let progress = outsider.kep.receive(exchange(&requests[0])).unwrap();
        assert_eq!(progress.received, Received::NotForUs);
        assert!(!outsider.store.is_known::<Conversation>(&id).unwrap());
    }

    #[test]
    fn test_invalid_signature_is_dropped() {
        let alice = peer(32);
        let bob = peer(32);
        let members = vec![alice.identity.node().clone(), bob.identity.node().clone()];
        let (id, requests) = alice.kep.initiate(&members).unwrap();

        let mut forged = exchange(&requests[0]).clone();
        forged.sig = bob.identity.sign(forged.hash.as_bytes()).unwrap();
        assert!(matches!(
            bob.kep.receive(&forged),
            Err(KepError::BadSignature(_))
        ));
        assert!(!bob.store.is_known::<Conversation>(&id).unwrap());

        // The genuine part is still accepted afterwards.
        let progress = bob.kep.receive(exchange(&requests[0])).unwrap();
        assert_eq!(progress.received, Received::Stored { completed: true });
    }

    #[test]
    fn test_impersonated_author_is_dropped() {
        let alice = peer(32);
        let bob = peer(32);
        let mallory = peer(32);
        let members = vec![alice.identity.node().clone(), bob.identity.node().clone()];
        let id = conversation_id(&[alice.identity.id(), bob.identity.id()]);

        // Mallory claims Alice's id but signs with her own key.
        let value = vec![0x41u8; 16];
        let hash = hex::encode(crypto::hash(&value));
        let mut claimed = alice.identity.node().clone();
        claimed.signing_key = mallory.identity.node().signing_key.clone();
        let recipient = &bob.identity.node().public_key;
        let impersonated = KeyExchange {
            key_part: crypto::seal_to(recipient, &value, KEP_INFO, id.as_bytes(), None).unwrap(),
            sig: mallory.identity.sign(hash.as_bytes()).unwrap(),
            hash,
            author: claimed.clone(),
            members: members.clone(),
        };
        assert!(matches!(
            bob.kep.receive(&impersonated),
            Err(KepError::NotAMember(_))
        ));

        // Same forgery with the member list rewritten to match.
        let rewritten = KeyExchange {
            members: vec![claimed, bob.identity.node().clone()],
            ..impersonated
        };
        assert!(matches!(
            bob.kep.receive(&rewritten),
            Err(KepError::UnverifiedAuthor(_))
        ));
        assert!(!bob.store.is_known::<Conversation>(&id).unwrap());

        // Alice's genuine part still completes the key.
        let (_, requests) = alice.kep.initiate(&members).unwrap();
        let progress = bob.kep.receive(exchange(&requests[0])).unwrap();
        assert_eq!(progress.received, Received::Stored { completed: true });
        let key = conversation(&bob, &id).key().unwrap().key().to_vec();
        assert!(!key.windows(16).any(|w| w == [0x41u8; 16]));
    }

    #[test]
    fn test_verify_leaves_state_untouched() {
        let alice = peer(32);
        let bob = peer(32);
        let members = vec![alice.identity.node().clone(), bob.identity.node().clone()];
        let (id, requests) = alice.kep.initiate(&members).unwrap();

        let verified = bob.kep.verify(exchange(&requests[0])).unwrap();
        assert!(!bob.store.is_known::<Conversation>(&id).unwrap());
        let Verified::Part(part) = verified else {
            panic!("part addressed to bob");
        };
        assert_eq!(part.conversation, id);
        let progress = bob.kep.accept(part).unwrap();
        assert_eq!(progress.received, Received::Stored { completed: true });
    }

    #[test]
    fn test_tampered_hash_is_dropped() {
        let alice = peer(32);
        let bob = peer(32);
        let members = vec![alice.identity.node().clone(), bob.identity.node().clone()];
        let (_, requests) = alice.kep.initiate(&members).unwrap();

        let mut tampered = exchange(&requests[0]).clone();
        tampered.hash = hex::encode([0u8; 32]);
        tampered.sig = alice.identity.sign(tampered.hash.as_bytes()).unwrap();
        assert!(matches!(bob.kep.receive(&tampered), Err(KepError::HashMismatch)));
    }

    #[test]
    fn test_wrong_part_length_is_dropped() {
        let alice = peer(32);
        let bob = peer(32);
        let members = vec![alice.identity.node().clone(), bob.identity.node().clone()];
        let id = conversation_id(&[alice.identity.id(), bob.identity.id()]);

        let value = vec![9u8; 5];
        let hash = hex::encode(crypto::hash(&value));
        let recipient = &bob.identity.node().public_key;
        let forged = KeyExchange {
            key_part: crypto::seal_to(recipient, &value, KEP_INFO, id.as_bytes(), None).unwrap(),
            sig: alice.identity.sign(hash.as_bytes()).unwrap(),
            hash,
            author: alice.identity.node().clone(),
            members,
        };
        assert!(matches!(
            bob.kep.receive(&forged),
            Err(KepError::PartLength { actual: 5, .. })
        ));
    }

    #[test]
    fn test_initiate_is_idempotent() {
        let alice = peer(32);
        let bob = peer(32);
        let members = vec![alice.identity.node().clone(), bob.identity.node().clone()];
        let (id, first) = alice.kep.initiate(&members).unwrap();
        let (again, second) = alice.kep.initiate(&members).unwrap();
        assert_eq!(id, again);
        assert!(second.is_empty());
        assert_eq!(alice.kep.announcement(&id).unwrap(), first);
        assert_eq!(conversation(&alice, &id).parts().len(), 1);
    }

    #[test]
    fn test_single_member_conversation_completes_immediately() {
        let alice = peer(32);
        let (id, requests) = alice.kep.initiate(&[alice.identity.node().clone()]).unwrap();
        assert!(requests.is_empty());
        assert_eq!(conversation(&alice, &id).key().unwrap().len(), 32);
    }

    #[test]
    fn test_expire_pending_only_drops_stale_pending() {
        let alice = peer(32);
        let bob = peer(32);
        let members = vec![alice.identity.node().clone(), bob.identity.node().clone()];
        let (pending, _) = alice.kep.initiate(&members).unwrap();
        let (complete, _) = alice.kep.initiate(&[alice.identity.node().clone()]).unwrap();

        let later = now_millis() + 10_000;
        assert_eq!(alice.kep.expire_pending(later, Duration::from_secs(60)).unwrap(), 0);
        assert_eq!(alice.kep.expire_pending(later, Duration::from_secs(1)).unwrap(), 1);
        assert!(!alice.store.is_known::<Conversation>(&pending).unwrap());
        assert!(!alice.kep.announcement(&pending).unwrap().is_empty());
        assert!(alice.store.is_known::<Conversation>(&complete).unwrap());
    }

    #[test]
    fn test_exchange_resumes_after_expiry_with_same_part() {
        let alice = peer(32);
        let bob = peer(32);
        let members = vec![alice.identity.node().clone(), bob.identity.node().clone()];
        let (id, from_alice) = alice.kep.initiate(&members).unwrap();
        let from_bob = deliver_all(&from_alice, &bob)[0].announce.clone();

        // Bob's part never reached Alice before her conversation expired.
        let later = now_millis() + 10_000;
        assert_eq!(alice.kep.expire_pending(later, Duration::from_secs(1)).unwrap(), 1);
        assert!(alice.kep.announcements_since(now_millis(), Duration::from_secs(60)).unwrap().is_empty());

        // Restarting locally reuses the stored part and announces nothing new.
        let (again, requests) = alice.kep.initiate(&members).unwrap();
        assert_eq!(again, id);
        assert!(requests.is_empty());
        assert_eq!(conversation(&alice, &id).parts().len(), 1);
        assert_eq!(
            alice.kep.announcements_since(now_millis(), Duration::from_secs(60)).unwrap(),
            from_alice
        );

        deliver_all(&from_bob, &alice);
        assert_eq!(
            conversation(&alice, &id).key().unwrap(),
            conversation(&bob, &id).key().unwrap()
        );
    }

    #[test]
    fn test_expired_conversation_is_rebuilt_from_peer_part() {
        let alice = peer(32);
        let bob = peer(32);
        let members = vec![alice.identity.node().clone(), bob.identity.node().clone()];
        let (id, from_alice) = alice.kep.initiate(&members).unwrap();
        let from_bob = deliver_all(&from_alice, &bob)[0].announce.clone();

        alice
            .kep
            .expire_pending(now_millis() + 10_000, Duration::from_secs(1))
            .unwrap();
        let progress = deliver_all(&from_bob, &alice);
        assert_eq!(progress[0].received, Received::Stored { completed: true });
        assert!(progress[0].announce.is_empty());
        assert_eq!(
            conversation(&alice, &id).key().unwrap(),
            conversation(&bob, &id).key().unwrap()
        );
    }
}
