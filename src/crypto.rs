//! Cryptographic primitives used by the protocol engine.
//!
//! - Content ids: SHA-256 digests encoded as URL-safe base64 without padding.
//! - Symmetric sealing: ChaCha20-Poly1305 with a detached tag, so the tag can
//!   travel (and be hashed) separately from the ciphertext.
//! - Asymmetric sealing: HPKE (X25519, HKDF-SHA256, ChaCha20-Poly1305) for
//!   per-recipient key parts.
//! - Signatures: Ed25519.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hpke::aead::ChaCha20Poly1305 as HpkeChaCha20Poly1305;
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{Deserializable, Kem as _, OpModeR, OpModeS, Serializable};
use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const SYMMETRIC_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid length: {0}")]
    InvalidLength(&'static str),
    #[error("hpke error: {0:?}")]
    Hpke(hpke::HpkeError),
    #[error("authenticated decryption failed")]
    Aead,
    #[error("signature error: {0}")]
    Signature(#[from] ed25519_dalek::SignatureError),
    #[error("hex error: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<hpke::HpkeError> for CryptoError {
    fn from(error: hpke::HpkeError) -> Self {
        CryptoError::Hpke(error)
    }
}

impl From<chacha20poly1305::aead::Error> for CryptoError {
    fn from(_: chacha20poly1305::aead::Error) -> Self {
        CryptoError::Aead
    }
}

/// SHA-256 of `bytes`.
pub fn hash(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Hash several fields at once. Each field is length-prefixed so that
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn hash_fields(fields: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    hasher.finalize().into()
}

/// Encode a digest as a content id.
pub fn encode_id(digest: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(digest)
}

/// Content id of arbitrary bytes.
pub fn content_id(bytes: &[u8]) -> String {
    encode_id(&hash(bytes))
}

/// Content id over several length-prefixed fields.
pub fn content_id_of(fields: &[&[u8]]) -> String {
    encode_id(&hash_fields(fields))
}

pub fn b64_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64_decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(URL_SAFE_NO_PAD.decode(text.as_bytes())?)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

// ---------------------------------------------------------------------------
// Symmetric sealing
// ---------------------------------------------------------------------------

/// Encrypt `plaintext`, returning the ciphertext and the detached tag.
pub fn seal_detached(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE]), CryptoError> {
    if key.len() != SYMMETRIC_KEY_SIZE {
        return Err(CryptoError::InvalidLength("symmetric key must be 32 bytes"));
    }
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidLength("nonce must be 12 bytes"));
    }

    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut buffer = plaintext.to_vec();
    let tag = aead.encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer)?;
    Ok((buffer, tag.into()))
}

/// Decrypt and verify. Any corruption of ciphertext, tag, nonce or aad fails
/// with [`CryptoError::Aead`].
pub fn open_detached(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if key.len() != SYMMETRIC_KEY_SIZE {
        return Err(CryptoError::InvalidLength("symmetric key must be 32 bytes"));
    }
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidLength("nonce must be 12 bytes"));
    }
    if tag.len() != TAG_SIZE {
        return Err(CryptoError::InvalidLength("tag must be 16 bytes"));
    }

    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut buffer = ciphertext.to_vec();
    aead.decrypt_in_place_detached(
        Nonce::from_slice(nonce),
        aad,
        &mut buffer,
        Tag::from_slice(tag),
    )?;
    Ok(buffer)
}

// ---------------------------------------------------------------------------
// Asymmetric sealing (HPKE)
// ---------------------------------------------------------------------------

/// HPKE output addressed to a single recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// Encapsulated ephemeral key, base64.
    pub enc: String,
    /// Ciphertext including the AEAD tag, base64.
    pub ciphertext: String,
}

/// Seal `plaintext` for the holder of `recipient_public_key_hex`.
///
/// `sender_seed` makes the encapsulation deterministic, for fixtures only.
pub fn seal_to(
    recipient_public_key_hex: &str,
    plaintext: &[u8],
    info: &[u8],
    aad: &[u8],
    sender_seed: Option<[u8; 32]>,
) -> Result<SealedBox, CryptoError> {
    let recipient_bytes = hex::decode(recipient_public_key_hex)?;
    let recipient_public_key =
        <X25519HkdfSha256 as hpke::Kem>::PublicKey::from_bytes(&recipient_bytes)?;

    let (encapped_key, mut sender_ctx) = if let Some(seed) = sender_seed {
        let mut rng = ChaCha20Rng::from_seed(seed);
        hpke::setup_sender::<HpkeChaCha20Poly1305, HkdfSha256, X25519HkdfSha256, _>(
            &OpModeS::Base,
            &recipient_public_key,
            info,
            &mut rng,
        )?
    } else {
        let mut rng = rand::rngs::OsRng;
        hpke::setup_sender::<HpkeChaCha20Poly1305, HkdfSha256, X25519HkdfSha256, _>(
            &OpModeS::Base,
            &recipient_public_key,
            info,
            &mut rng,
        )?
    };

    let ciphertext = sender_ctx.seal(plaintext, aad)?;
    Ok(SealedBox {
        enc: b64_encode(&encapped_key.to_bytes()),
        ciphertext: b64_encode(&ciphertext),
    })
}

/// Open a [`SealedBox`]. Fails when the box was addressed to another key.
pub fn open_from(
    recipient_private_key_hex: &str,
    sealed: &SealedBox,
    info: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let private_bytes = hex::decode(recipient_private_key_hex)?;
    let recipient_private_key =
        <X25519HkdfSha256 as hpke::Kem>::PrivateKey::from_bytes(&private_bytes)?;
    let encapped_key =
        <X25519HkdfSha256 as hpke::Kem>::EncappedKey::from_bytes(&b64_decode(&sealed.enc)?)?;

    let mut receiver_ctx = hpke::setup_receiver::<
        HpkeChaCha20Poly1305,
        HkdfSha256,
        X25519HkdfSha256,
    >(&OpModeR::Base, &recipient_private_key, &encapped_key, info)?;

    Ok(receiver_ctx.open(&b64_decode(&sealed.ciphertext)?, aad)?)
}

// ---------------------------------------------------------------------------
// Keypairs and signatures
// ---------------------------------------------------------------------------

/// Serialized local key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key_hex: String,
    pub private_key_hex: String,
    pub signing_public_key_hex: String,
    pub signing_private_key_hex: String,
}

pub fn generate_keypair() -> StoredKeypair {
    generate_keypair_with_rng(&mut rand::rngs::OsRng)
}

pub fn generate_keypair_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> StoredKeypair {
    let (private_key, public_key) = X25519HkdfSha256::gen_keypair(rng);
    let signing_key = SigningKey::generate(rng);
    StoredKeypair {
        public_key_hex: hex::encode(public_key.to_bytes()),
        private_key_hex: hex::encode(private_key.to_bytes()),
        signing_public_key_hex: hex::encode(signing_key.verifying_key().to_bytes()),
        signing_private_key_hex: hex::encode(signing_key.to_bytes()),
    }
}

fn key_bytes(hex_key: &str) -> Result<[u8; 32], CryptoError> {
    hex::decode(hex_key)?
        .try_into()
        .map_err(|_| CryptoError::InvalidLength("ed25519 keys must be 32 bytes"))
}

/// Sign `message`, returning the signature as hex.
pub fn sign(message: &[u8], signing_private_key_hex: &str) -> Result<String, CryptoError> {
    let signing_key = SigningKey::from_bytes(&key_bytes(signing_private_key_hex)?);
    Ok(hex::encode(signing_key.sign(message).to_bytes()))
}

pub fn verify(
    message: &[u8],
    signature_hex: &str,
    signing_public_key_hex: &str,
) -> Result<(), CryptoError> {
    let verifying_key = VerifyingKey::from_bytes(&key_bytes(signing_public_key_hex)?)?;
    let signature = Signature::from_slice(&hex::decode(signature_hex)?)?;
    verifying_key.verify(message, &signature)?;
    Ok(())
}

/// `#[serde(with = "crypto::b64_bytes")]` for raw byte fields.
pub mod b64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::b64_encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::b64_decode(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seals_and_opens_with_fixture_key() {
        let key = hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
            .unwrap();
        let nonce = hex::decode("000102030405060708090a0b").unwrap();

        let (ciphertext, tag) = seal_detached(&key, &nonce, b"payload:hello world", b"ctx").unwrap();
        assert_eq!(ciphertext.len(), b"payload:hello world".len());

        let opened = open_detached(&key, &nonce, &ciphertext, &tag, b"ctx").unwrap();
        assert_eq!(opened, b"payload:hello world");
    }

    #[test]
    fn open_rejects_wrong_aad() {
        let key = [4u8; 32];
        let nonce = [1u8; 12];
        let (ciphertext, tag) = seal_detached(&key, &nonce, b"hello", b"a").unwrap();
        assert!(matches!(
            open_detached(&key, &nonce, &ciphertext, &tag, b"b"),
            Err(CryptoError::Aead)
        ));
    }

    #[test]
    fn seal_rejects_short_key() {
        assert!(matches!(
            seal_detached(&[0u8; 16], &[0u8; 12], b"x", b""),
            Err(CryptoError::InvalidLength(_))
        ));
    }

    #[test]
    fn hpke_box_only_opens_for_recipient() {
        let mut rng = ChaCha20Rng::from_seed([7u8; 32]);
        let alice = generate_keypair_with_rng(&mut rng);
        let bob = generate_keypair_with_rng(&mut rng);

        let sealed = seal_to(&alice.public_key_hex, b"part", b"info", b"aad", Some([9u8; 32]))
            .unwrap();
        assert_eq!(
            open_from(&alice.private_key_hex, &sealed, b"info", b"aad").unwrap(),
            b"part"
        );
        assert!(open_from(&bob.private_key_hex, &sealed, b"info", b"aad").is_err());
    }

    #[test]
    fn signatures_verify_and_detect_tampering() {
        let keypair = generate_keypair();
        let signature = sign(b"message", &keypair.signing_private_key_hex).unwrap();
        assert!(verify(b"message", &signature, &keypair.signing_public_key_hex).is_ok());
        assert!(verify(b"messagf", &signature, &keypair.signing_public_key_hex).is_err());
    }

    #[test]
    fn field_hash_is_unambiguous() {
        assert_ne!(
            content_id_of(&[b"ab", b"c"]),
            content_id_of(&[b"a", b"bc"])
        );
        assert_eq!(content_id_of(&[b"ab"]), content_id_of(&[b"ab"]));
    }
}
