//! Ed25519 node identity and hashing helpers.
//!
//! Every dispatcher and worker owns an Ed25519 keypair. Peer and worker
//! messages are signed with the sender's secret key and verified against the
//! pubkey recorded at HELLO time.

use ed25519_consensus::{Signature, SigningKey, VerificationKey};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{DispatchError, Result};

/// Node keypair. The secret seed never leaves this struct except through
/// [`Keypair::secret_bytes`] for persistence in the node store.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
    public: VerificationKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from(seed);
        let public = signing.verification_key();
        Self { signing, public }
    }

    /// Rebuild a keypair from a persisted 32-byte seed.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DispatchError::Key("secret key must be 32 bytes".into()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_bytes().to_vec()
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public.to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing.sign(msg).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", &self.public_hex()[..8])
    }
}

/// Verify an Ed25519 signature against a raw 32-byte pubkey.
///
/// Returns false on malformed keys or signatures rather than erroring: a
/// garbage signature from the wire is no different from a wrong one.
pub fn verify(pubkey: &[u8], msg: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(pubkey) else {
        return false;
    };
    let Ok(key) = VerificationKey::try_from(key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(&Signature::from(sig_bytes), msg).is_ok()
}

/// SHA-256 over arbitrary bytes.
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}
