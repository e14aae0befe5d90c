//! Optionally-encrypted entry fields.
//!
//! Any entry field (metadata, payload, each signature) is stored as a
//! [`MaybeEncrypted`] value: either the plain value or an [`EncryptedThing`]
//! sealed for a [`ReceiverSet`]. Each field is sealed independently, so a
//! relay can be allowed to read an entry's metadata while its payload and
//! signers stay confidential.
//!
//! Sealing uses ChaCha20-Poly1305 under a fresh data key. For
//! [`ReceiverSet::PublicKeys`] the data key is wrapped once per receiver with
//! a key agreed over X25519 against an ephemeral sender key; for
//! [`ReceiverSet::SharedSecret`] the data key is the shared secret itself and
//! the envelope records only its BLAKE3 hash.
//!
//! The enum discriminants (`Decrypted` = 0, `Encrypted` = 1; `PublicKeys` = 0,
//! `SharedSecret` = 1) are part of the wire format.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use curve25519_dalek::montgomery::MontgomeryPoint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AccessError, LogError};

/// Context string for deriving per-receiver key-wrapping keys.
const KEY_WRAP_CONTEXT: &str = "reef envelope v1 key wrap";

/// A 32-byte ChaCha20-Poly1305 key.
pub type SymmetricKey = [u8; 32];

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// X25519 public key of an envelope receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangePublicKey(pub [u8; 32]);

impl fmt::Debug for ExchangePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExchangePublicKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// X25519 keypair able to open envelopes addressed to its public key.
#[derive(Clone)]
pub struct ExchangeKeypair {
    secret: [u8; 32],
    public: ExchangePublicKey,
}

impl ExchangeKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        Self::from_secret(rand::random())
    }

    /// Derive the keypair for a 32-byte secret (clamped on use).
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let public = ExchangePublicKey(MontgomeryPoint::mul_base_clamped(secret).to_bytes());
        Self { secret, public }
    }

    pub fn public(&self) -> ExchangePublicKey {
        self.public
    }

    fn agree(&self, peer: &ExchangePublicKey) -> Result<[u8; 32], AccessError> {
        let shared = MontgomeryPoint(peer.0).mul_clamped(self.secret).to_bytes();

        // A low-order peer point yields the all-zero secret.
        if shared == [0u8; 32] {
            return Err(AccessError::Decrypt("degenerate key agreement".into()));
        }

        Ok(shared)
    }
}

impl fmt::Debug for ExchangeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Who can open an envelope.
#[derive(Clone, Debug)]
pub enum ReceiverSet {
    /// Each listed key receives its own wrapped copy of the data key.
    PublicKeys(Vec<ExchangePublicKey>),
    /// Everyone holding this symmetric key.
    SharedSecret(SymmetricKey),
}

/// Identifier recorded in a shared-secret envelope: BLAKE3 of the key.
pub fn symmetric_key_id(key: &SymmetricKey) -> [u8; 32] {
    blake3::hash(key).into()
}

/// Supplies the private key material needed to open envelopes.
pub trait KeyResolver: Send + Sync {
    /// The keypair for `public`, if held.
    fn exchange_keypair(&self, public: &ExchangePublicKey) -> Option<ExchangeKeypair>;

    /// The symmetric key whose [`symmetric_key_id`] is `key_id`, if held.
    fn symmetric_key(&self, key_id: &[u8; 32]) -> Option<SymmetricKey>;
}

/// In-memory [`KeyResolver`].
#[derive(Clone, Debug, Default)]
pub struct Keychain {
    exchange: HashMap<ExchangePublicKey, ExchangeKeypair>,
    symmetric: HashMap<[u8; 32], SymmetricKey>,
}

impl Keychain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an X25519 keypair.
    pub fn with_exchange_keypair(mut self, keypair: ExchangeKeypair) -> Self {
        self.exchange.insert(keypair.public(), keypair);
        self
    }

    /// Add a shared symmetric key.
    pub fn with_symmetric_key(mut self, key: SymmetricKey) -> Self {
        self.symmetric.insert(symmetric_key_id(&key), key);
        self
    }
}

impl KeyResolver for Keychain {
    fn exchange_keypair(&self, public: &ExchangePublicKey) -> Option<ExchangeKeypair> {
        self.exchange.get(public).cloned()
    }

    fn symmetric_key(&self, key_id: &[u8; 32]) -> Option<SymmetricKey> {
        self.symmetric.get(key_id).copied()
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Data key wrapped for a single receiver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub receiver: ExchangePublicKey,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// Key-exchange metadata telling a receiver how to recover the data key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyExchange {
    PublicKeys {
        /// Ephemeral sender key the wrapping keys were agreed against.
        ephemeral: ExchangePublicKey,
        wrapped: Vec<WrappedKey>,
    },
    SharedSecret {
        /// [`symmetric_key_id`] of the data key.
        key_id: [u8; 32],
    },
}

/// A sealed field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedThing {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
    pub exchange: KeyExchange,
}

impl EncryptedThing {
    /// Seal `plaintext` for `receivers`.
    pub fn seal(plaintext: &[u8], receivers: &ReceiverSet) -> Result<Self, AccessError> {
        let nonce: [u8; 12] = rand::random();

        let (data_key, exchange) = match receivers {
            ReceiverSet::SharedSecret(key) => (
                *key,
                KeyExchange::SharedSecret {
                    key_id: symmetric_key_id(key),
                },
            ),
            ReceiverSet::PublicKeys(keys) => {
                if keys.is_empty() {
                    return Err(AccessError::Encrypt("empty receiver set".into()));
                }

                let data_key: SymmetricKey = rand::random();
                let ephemeral = ExchangeKeypair::generate();
                let mut wrapped = Vec::with_capacity(keys.len());

                for receiver in keys {
                    let shared = ephemeral
                        .agree(receiver)
                        .map_err(|e| AccessError::Encrypt(e.to_string()))?;
                    let wrap_key = wrapping_key(&shared, &ephemeral.public(), receiver);
                    let wrap_nonce: [u8; 12] = rand::random();

                    wrapped.push(WrappedKey {
                        receiver: *receiver,
                        nonce: wrap_nonce,
                        ciphertext: aead_seal(&wrap_key, &wrap_nonce, &data_key)?,
                    });
                }

                (
                    data_key,
                    KeyExchange::PublicKeys {
                        ephemeral: ephemeral.public(),
                        wrapped,
                    },
                )
            }
        };

        Ok(Self {
            ciphertext: aead_seal(&data_key, &nonce, plaintext)?,
            nonce,
            exchange,
        })
    }

    /// Open the envelope with keys from `resolver`.
    pub fn open(&self, resolver: &dyn KeyResolver) -> Result<Vec<u8>, AccessError> {
        let data_key = match &self.exchange {
            KeyExchange::SharedSecret { key_id } => {
                resolver.symmetric_key(key_id).ok_or(AccessError::NoKey)?
            }
            KeyExchange::PublicKeys { ephemeral, wrapped } => {
                let (keypair, wrapped_key) = wrapped
                    .iter()
                    .find_map(|w| resolver.exchange_keypair(&w.receiver).map(|kp| (kp, w)))
                    .ok_or(AccessError::NoKey)?;

                let shared = keypair.agree(ephemeral)?;
                let wrap_key = wrapping_key(&shared, ephemeral, &keypair.public());
                let raw = aead_open(&wrap_key, &wrapped_key.nonce, &wrapped_key.ciphertext)?;

                raw.try_into()
                    .map_err(|_| AccessError::Decrypt("wrapped key has wrong length".into()))?
            }
        };

        aead_open(&data_key, &self.nonce, &self.ciphertext)
    }
}

/// A field that is either plain or sealed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaybeEncrypted<T> {
    Decrypted(T),
    Encrypted(EncryptedThing),
}

impl<T> MaybeEncrypted<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Serialize `value` and seal it for `receivers`.
    pub fn encrypt(value: &T, receivers: &ReceiverSet) -> Result<Self, LogError> {
        let plaintext = postcard::to_allocvec(value)?;
        Ok(Self::Encrypted(EncryptedThing::seal(&plaintext, receivers)?))
    }

    /// The plain value, opening the envelope with `resolver` when sealed.
    pub fn decrypt(&self, resolver: Option<&dyn KeyResolver>) -> Result<Cow<'_, T>, AccessError> {
        match self {
            Self::Decrypted(value) => Ok(Cow::Borrowed(value)),
            Self::Encrypted(thing) => {
                let resolver = resolver.ok_or(AccessError::NoKey)?;
                let plaintext = thing.open(resolver)?;
                let value = postcard::from_bytes(&plaintext)
                    .map_err(|e| AccessError::Decrypt(format!("undecodable plaintext: {e}")))?;
                Ok(Cow::Owned(value))
            }
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }

    /// The plain value if this field was never sealed.
    pub fn as_decrypted(&self) -> Option<&T> {
        match self {
            Self::Decrypted(value) => Some(value),
            Self::Encrypted(_) => None,
        }
    }
}

fn wrapping_key(
    shared: &[u8; 32],
    ephemeral: &ExchangePublicKey,
    receiver: &ExchangePublicKey,
) -> SymmetricKey {
    let mut material = Vec::with_capacity(96);
    material.extend_from_slice(shared);
    material.extend_from_slice(&ephemeral.0);
    material.extend_from_slice(&receiver.0);
    blake3::derive_key(KEY_WRAP_CONTEXT, &material)
}

fn aead_seal(key: &SymmetricKey, nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>, AccessError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| AccessError::Encrypt(e.to_string()))
}

fn aead_open(key: &SymmetricKey, nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>, AccessError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| AccessError::Decrypt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_envelope_opens_for_each_receiver() {
        let alice = ExchangeKeypair::generate();
        let bob = ExchangeKeypair::generate();
        let receivers = ReceiverSet::PublicKeys(vec![alice.public(), bob.public()]);

        let sealed = MaybeEncrypted::encrypt(&"secret".to_string(), &receivers).unwrap();
        assert!(sealed.is_encrypted());

        for kp in [alice, bob] {
            let keychain = Keychain::new().with_exchange_keypair(kp);
            let opened = sealed.decrypt(Some(&keychain)).unwrap();
            assert_eq!(opened.as_str(), "secret");
        }
    }

    #[test]
    fn test_outsider_cannot_open() {
        let alice = ExchangeKeypair::generate();
        let receivers = ReceiverSet::PublicKeys(vec![alice.public()]);
        let sealed = MaybeEncrypted::encrypt(&42u64, &receivers).unwrap();

        let outsider = Keychain::new().with_exchange_keypair(ExchangeKeypair::generate());
        assert!(matches!(
            sealed.decrypt(Some(&outsider)),
            Err(AccessError::NoKey)
        ));
        assert!(matches!(sealed.decrypt(None), Err(AccessError::NoKey)));
    }

    #[test]
    fn test_shared_secret_envelope() {
        let key: SymmetricKey = [9u8; 32];
        let sealed = MaybeEncrypted::encrypt(&vec![1u8, 2, 3], &ReceiverSet::SharedSecret(key)).unwrap();

        let keychain = Keychain::new().with_symmetric_key(key);
        assert_eq!(*sealed.decrypt(Some(&keychain)).unwrap(), vec![1u8, 2, 3]);

        let wrong = Keychain::new().with_symmetric_key([8u8; 32]);
        assert!(sealed.decrypt(Some(&wrong)).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key: SymmetricKey = [1u8; 32];
        let mut sealed = MaybeEncrypted::encrypt(&"x".to_string(), &ReceiverSet::SharedSecret(key)).unwrap();

        if let MaybeEncrypted::Encrypted(thing) = &mut sealed {
            thing.ciphertext[0] ^= 0xff;
        }

        let keychain = Keychain::new().with_symmetric_key(key);
        assert!(matches!(
            sealed.decrypt(Some(&keychain)),
            Err(AccessError::Decrypt(_))
        ));
    }

    #[test]
    fn test_decrypted_variant_needs_no_keys() {
        let plain = MaybeEncrypted::Decrypted(7u32);
        assert_eq!(*plain.decrypt(None).unwrap(), 7);
        assert_eq!(plain.as_decrypted(), Some(&7));
    }

    #[test]
    fn test_empty_public_key_set_is_rejected() {
        let result = MaybeEncrypted::encrypt(&1u8, &ReceiverSet::PublicKeys(vec![]));
        assert!(matches!(
            result,
            Err(LogError::Access(AccessError::Encrypt(_)))
        ));
    }

    #[test]
    fn test_envelope_survives_postcard() {
        let alice = ExchangeKeypair::generate();
        let sealed =
            MaybeEncrypted::encrypt(&"wire".to_string(), &ReceiverSet::PublicKeys(vec![alice.public()])).unwrap();

        let bytes = postcard::to_allocvec(&sealed).unwrap();
        let decoded: MaybeEncrypted<String> = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, sealed);

        let keychain = Keychain::new().with_exchange_keypair(alice);
        assert_eq!(decoded.decrypt(Some(&keychain)).unwrap().as_str(), "wire");
    }
}
