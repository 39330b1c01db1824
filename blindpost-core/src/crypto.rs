//! Crypto adapter.
//!
//! Pure functions over the primitives. No protocol knowledge lives here: the
//! codec decides *what* gets signed, this module only signs and verifies it.
//!
//! - Identity: Ed25519 (`ed25519-dalek`)
//! - Key agreement: X25519 on the Montgomery form of the Ed25519 keys
//! - KDF: HKDF-SHA256, bound to both public halves of the exchange
//! - AEAD: ChaCha20-Poly1305, fresh random nonce per message

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::error::ProtocolError;

/// Public key length in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Signature length in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Registration/login challenge nonce length in bytes.
pub const CHALLENGE_NONCE_LENGTH: usize = 32;

/// AEAD nonce length in bytes.
pub const AEAD_NONCE_LENGTH: usize = 12;

/// AEAD tag length in bytes.
pub const AEAD_TAG_LENGTH: usize = 16;

/// HKDF info label for per-message keys.
const MESSAGE_KEY_LABEL: &[u8] = b"blindpost/v1/message-key";

/// A long-term verification key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// Parse and validate a public key.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self, ProtocolError> {
        VerifyingKey::from_bytes(bytes).map_err(|_| ProtocolError::InvalidPublicKey)?;
        Ok(Self(*bytes))
    }

    /// Parse a hex-encoded public key.
    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let raw = hex::decode(s.trim()).map_err(|_| ProtocolError::InvalidPublicKey)?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] =
            raw.try_into().map_err(|_| ProtocolError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// Hex encoding of the full key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short fingerprint for out-of-band comparison and logs.
    ///
    /// First 8 bytes of SHA-256 over the key, as 16 hex characters.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }

    fn verifying_key(&self) -> Result<VerifyingKey, ProtocolError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| ProtocolError::InvalidPublicKey)
    }

    fn agreement_key(&self) -> Result<X25519Public, ProtocolError> {
        let montgomery = self.verifying_key()?.to_montgomery();
        Ok(X25519Public::from(montgomery.to_bytes()))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// An Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Wrap raw signature bytes. Validity is only known at verification.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..4]))
    }
}

/// A participant's (or the directory's) long-term identity.
///
/// Does not implement `Clone`. The inner signing key zeroizes on drop.
pub struct IdentityKeypair {
    signing: SigningKey,
}

impl IdentityKeypair {
    /// Generate a fresh identity from the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Restore an identity from a hex-encoded seed.
    pub fn from_hex_seed(s: &str) -> Result<Self, ProtocolError> {
        let raw = Zeroizing::new(hex::decode(s.trim()).map_err(|_| ProtocolError::Malformed("seed"))?);
        let seed: &[u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::Malformed("seed"))?;
        Ok(Self::from_seed(seed))
    }

    /// Export the seed. Callers own its lifetime.
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// The verification key others use for us.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }

    fn agreement_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing.to_scalar_bytes())
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("public", &self.public_key().fingerprint())
            .finish()
    }
}

/// Verify `signature` over `message` under `public_key`.
///
/// Uses strict verification: malleable and small-order encodings are rejected.
pub fn verify(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), ProtocolError> {
    let key = public_key.verifying_key()?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    key.verify_strict(message, &sig)
        .map_err(|_| ProtocolError::BadSignature)
}

/// Fresh random nonce for a registration or login challenge.
pub fn challenge_nonce() -> [u8; CHALLENGE_NONCE_LENGTH] {
    let mut nonce = [0u8; CHALLENGE_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Output of [`seal_to`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Ephemeral X25519 public key generated for this message only.
    pub ephemeral_public_key: [u8; 32],
    /// `nonce || ciphertext || tag`.
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` so that only the holder of `recipient`'s identity can read it.
///
/// A new ephemeral key pair is generated per call and dropped on return.
pub fn seal_to(recipient: &PublicKey, plaintext: &[u8]) -> Result<Sealed, ProtocolError> {
    let recipient_x = recipient.agreement_key()?;

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_x);
    if !shared.was_contributory() {
        return Err(ProtocolError::DecryptionFailed);
    }

    let key = derive_message_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient_x.as_bytes())?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));

    let mut nonce = [0u8; AEAD_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| ProtocolError::Internal)?;

    let mut ciphertext = Vec::with_capacity(AEAD_NONCE_LENGTH + sealed.len());
    ciphertext.extend_from_slice(&nonce);
    ciphertext.extend_from_slice(&sealed);

    Ok(Sealed {
        ephemeral_public_key: ephemeral_public.to_bytes(),
        ciphertext,
    })
}

/// Mirror of [`seal_to`]: decrypt with our long-term identity.
pub fn open_with(
    identity: &IdentityKeypair,
    ephemeral_public_key: &[u8; 32],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
    if ciphertext.len() < AEAD_NONCE_LENGTH + AEAD_TAG_LENGTH {
        return Err(ProtocolError::DecryptionFailed);
    }

    let secret = identity.agreement_secret();
    let own_public = X25519Public::from(&secret);
    let ephemeral = X25519Public::from(*ephemeral_public_key);
    let shared = secret.diffie_hellman(&ephemeral);
    if !shared.was_contributory() {
        return Err(ProtocolError::DecryptionFailed);
    }

    let key = derive_message_key(shared.as_bytes(), ephemeral_public_key, own_public.as_bytes())?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));

    let (nonce, sealed) = ciphertext.split_at(AEAD_NONCE_LENGTH);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map(Zeroizing::new)
        .map_err(|_| ProtocolError::DecryptionFailed)
}

fn derive_message_key(
    shared: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, ProtocolError> {
    let mut info = Vec::with_capacity(MESSAGE_KEY_LABEL.len() + 64);
    info.extend_from_slice(MESSAGE_KEY_LABEL);
    info.extend_from_slice(ephemeral_public);
    info.extend_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(&info, key.as_mut_slice())
        .map_err(|_| ProtocolError::Internal)?;
    Ok(key)
}
