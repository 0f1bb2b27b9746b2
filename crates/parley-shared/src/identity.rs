use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::constants::{ADDRESS_SIZE, KDF_CONTEXT_ADDRESS};
use crate::error::IdentityError;

/// The local wallet identity based on Ed25519.
/// The wallet address is derived from the public key; the signing key never
/// leaves this struct.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Get the raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Wallet address: `0x` + hex of the first 20 bytes of a BLAKE3 KDF
    /// over the public key.
    pub fn address(&self) -> String {
        address_from_pubkey(&self.public_key_bytes())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

pub fn address_from_pubkey(pubkey: &[u8; 32]) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_ADDRESS);
    hasher.update(pubkey);
    let hash = hasher.finalize();
    format!("0x{}", hex::encode(&hash.as_bytes()[..ADDRESS_SIZE]))
}

/// Verify a signature against a public key
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| IdentityError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}
