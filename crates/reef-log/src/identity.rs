//! Writer identities and entry signatures.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use reef_types::PublicKey;
use serde::{Deserialize, Serialize};

/// A signature together with the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureWithKey {
    /// Raw 64-byte ed25519 signature (a `Vec` so serde handles it).
    pub signature: Vec<u8>,
    pub public_key: PublicKey,
}

impl SignatureWithKey {
    /// Verify the signature over `data`.
    ///
    /// Returns `false` if the key bytes or signature bytes are invalid or the
    /// signature doesn't match.
    pub fn verify(&self, data: &[u8]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(self.public_key.as_bytes()) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        verifying_key.verify(data, &signature).is_ok()
    }
}

/// Something that can sign entries.
pub trait Identity: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, data: &[u8]) -> SignatureWithKey;
}

/// ed25519 identity holding its signing key in memory.
#[derive(Clone)]
pub struct Ed25519Identity {
    signing_key: SigningKey,
}

impl Ed25519Identity {
    /// Generate a random identity.
    pub fn generate() -> Self {
        Self::from_seed(rand::random())
    }

    /// Deterministic identity from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }
}

impl Identity for Ed25519Identity {
    fn public_key(&self) -> PublicKey {
        PublicKey::from(self.signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, data: &[u8]) -> SignatureWithKey {
        let signature: Signature = self.signing_key.sign(data);
        SignatureWithKey {
            signature: signature.to_bytes().to_vec(),
            public_key: self.public_key(),
        }
    }
}

impl std::fmt::Debug for Ed25519Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Identity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}
