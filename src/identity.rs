//! Local identity and public node records.
//!
//! A [`Node`] is *who* a peer is: its X25519 encryption key, its Ed25519
//! signing key, a self-signature binding the two, and the id and display name
//! derived from them. The local [`Identity`] additionally holds the private
//! halves and is persisted in the object store on first start.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, CryptoError, SealedBox, StoredKeypair};
use crate::storage::{Object, ObjectStore, StorageError, StoreExt};

const LOCAL_IDENTITY_ID: &str = "local";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("node id does not match its keys")]
    IdMismatch,
    #[error("node name does not match its id")]
    NameMismatch,
    #[error("invalid self-signature: {0}")]
    Signature(#[source] CryptoError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Public identity of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    /// X25519 public key, hex.
    pub public_key: String,
    /// Ed25519 verifying key, hex.
    pub signing_key: String,
    /// Ed25519 signature over both public keys, hex.
    pub signature: String,
}

impl Node {
    fn key_fields<'a>(public_key: &'a str, signing_key: &'a str) -> [&'a [u8]; 2] {
        [public_key.as_bytes(), signing_key.as_bytes()]
    }

    /// `hash(public_key, signing_key)`.
    pub fn derive_id(public_key: &str, signing_key: &str) -> String {
        crypto::content_id_of(&Self::key_fields(public_key, signing_key))
    }

    fn signed_bytes(public_key: &str, signing_key: &str) -> Vec<u8> {
        crypto::hash_fields(&Self::key_fields(public_key, signing_key)).to_vec()
    }

    /// Check that id, name and self-signature are consistent.
    pub fn verify(&self) -> Result<(), IdentityError> {
        if Self::derive_id(&self.public_key, &self.signing_key) != self.id {
            return Err(IdentityError::IdMismatch);
        }
        if generate_name(&self.id) != self.name {
            return Err(IdentityError::NameMismatch);
        }
        crypto::verify(
            &Self::signed_bytes(&self.public_key, &self.signing_key),
            &self.signature,
            &self.signing_key,
        )
        .map_err(IdentityError::Signature)
    }

    /// Verify a detached signature made by this node.
    pub fn verify_signature(&self, message: &[u8], signature_hex: &str) -> Result<(), CryptoError> {
        crypto::verify(message, signature_hex, &self.signing_key)
    }
}

impl Object for Node {
    const KIND: &'static str = "node";

    fn object_id(&self) -> String {
        self.id.clone()
    }
}

impl Object for StoredKeypair {
    const KIND: &'static str = "identity";

    fn object_id(&self) -> String {
        LOCAL_IDENTITY_ID.to_string()
    }
}

/// The local keypair plus its public [`Node`] record.
#[derive(Debug, Clone)]
pub struct Identity {
    keys: StoredKeypair,
    node: Node,
}

impl Identity {
    pub fn from_keypair(keys: StoredKeypair) -> Result<Self, IdentityError> {
        let signature = crypto::sign(
            &Node::signed_bytes(&keys.public_key_hex, &keys.signing_public_key_hex),
            &keys.signing_private_key_hex,
        )?;
        let id = Node::derive_id(&keys.public_key_hex, &keys.signing_public_key_hex);
        let node = Node {
            name: generate_name(&id),
            id,
            public_key: keys.public_key_hex.clone(),
            signing_key: keys.signing_public_key_hex.clone(),
            signature,
        };
        Ok(Self { keys, node })
    }

    pub fn generate() -> Result<Self, IdentityError> {
        Self::from_keypair(crypto::generate_keypair())
    }

    /// Load the persisted identity, or create and persist a new one.
    /// The flag is `true` when the identity was just created.
    pub fn load_or_create(store: &dyn ObjectStore) -> Result<(Self, bool), IdentityError> {
        if let Some(keys) = store.get_by_id::<StoredKeypair>(LOCAL_IDENTITY_ID)? {
            return Ok((Self::from_keypair(keys)?, false));
        }
        let identity = Self::generate()?;
        store.store(&identity.keys)?;
        store.store(&identity.node)?;
        Ok((identity, true))
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn id(&self) -> &str {
        &self.node.id
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Sign `message` with the local signing key, hex output.
    pub fn sign(&self, message: &[u8]) -> Result<String, CryptoError> {
        crypto::sign(message, &self.keys.signing_private_key_hex)
    }

    /// Open a box addressed to this node.
    pub fn open(&self, sealed: &SealedBox, info: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::open_from(&self.keys.private_key_hex, sealed, info, aad)
    }
}

const ADJECTIVES: &[&str] = &[
    "Amber", "Brisk", "Calm", "Dusky", "Eager", "Faint", "Gentle", "Hollow", "Idle", "Jolly",
    "Keen", "Lucid", "Mellow", "Nimble", "Odd", "Pale", "Quiet", "Rapid", "Silent", "Tawny",
    "Umber", "Vivid", "Wary", "Young", "Zesty", "Bold", "Crisp", "Dapper", "Fuzzy", "Lone",
    "Misty", "Rusty",
];

const ANIMALS: &[&str] = &[
    "Badger", "Crane", "Dingo", "Egret", "Ferret", "Gecko", "Heron", "Ibis", "Jackal", "Koala",
    "Lemur", "Marten", "Newt", "Ocelot", "Puffin", "Quail", "Raven", "Stoat", "Tapir", "Urchin",
    "Vole", "Walrus", "Yak", "Zebu", "Bison", "Cobra", "Dormouse", "Finch", "Hare", "Lynx",
    "Otter", "Wren",
];

/// Deterministic two-word display name seeded by a node id.
pub fn generate_name(id: &str) -> String {
    let mut rng = ChaCha20Rng::from_seed(crypto::hash(id.as_bytes()));
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Nameless");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("Peer");
    format!("{adjective} {animal}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;

    #[test]
    fn test_generated_node_verifies() {
        let identity = Identity::generate().unwrap();
        assert!(identity.node().verify().is_ok());
        assert_eq!(identity.name(), generate_name(identity.id()));
    }

    #[test]
    fn test_tampered_node_is_rejected() {
        let identity = Identity::generate().unwrap();
        let other = Identity::generate().unwrap();

        let mut swapped = identity.node().clone();
        swapped.public_key = other.node().public_key.clone();
        assert!(matches!(swapped.verify(), Err(IdentityError::IdMismatch)));

        let mut renamed = identity.node().clone();
        renamed.name = "Someone Else".to_string();
        assert!(matches!(renamed.verify(), Err(IdentityError::NameMismatch)));

        let mut forged = identity.node().clone();
        forged.signature = other.node().signature.clone();
        assert!(matches!(forged.verify(), Err(IdentityError::Signature(_))));
    }

    #[test]
    fn test_name_is_deterministic() {
        assert_eq!(generate_name("abc"), generate_name("abc"));
        assert_eq!(generate_name("abc").split(' ').count(), 2);
    }

    #[test]
    fn test_load_or_create_persists_identity() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (created, newly_created) = Identity::load_or_create(&store).unwrap();
        assert!(newly_created);
        assert!(store.is_known::<Node>(created.id()).unwrap());

        let (loaded, newly_created) = Identity::load_or_create(&store).unwrap();
        assert!(!newly_created);
        assert_eq!(loaded.id(), created.id());
        assert_eq!(loaded.node().public_key, created.node().public_key);
    }

    #[test]
    fn test_sign_and_verify_detached() {
        let identity = Identity::generate().unwrap();
        let signature = identity.sign(b"part-hash").unwrap();
        assert!(identity.node().verify_signature(b"part-hash", &signature).is_ok());
    }
}
