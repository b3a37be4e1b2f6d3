#![forbid(unsafe_code)]

use cvl_protocol::cvl::v1::Identity;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use std::convert::TryInto;
use thiserror::Error;

/// Refusal returned by a signer that will not authorize a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("sign request rejected: {reason}")]
pub struct SignRejected {
    pub reason: String,
}

/// An identity capable of signing governed-action requests.
///
/// A signer may refuse to sign; the refusal carries the policy-level reason.
pub trait Signer {
    fn identity(&self) -> Identity;
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignRejected>;
}

/// Ed25519 signer backed by an in-memory keypair.
#[derive(Debug, Clone)]
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Construct a signer with a freshly generated keypair.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl Signer for Ed25519Signer {
    fn identity(&self) -> Identity {
        Identity {
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignRejected> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

/// Signer that refuses every request with a fixed reason; stands in for an
/// identity the governing darc does not authorize.
#[derive(Debug, Clone)]
pub struct RejectingSigner {
    identity: Identity,
    reason: String,
}

impl RejectingSigner {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            identity: Ed25519Signer::generate().identity(),
            reason: reason.into(),
        }
    }
}

impl Signer for RejectingSigner {
    fn identity(&self) -> Identity {
        self.identity
    }

    fn sign(&self, _message: &[u8]) -> Result<Vec<u8>, SignRejected> {
        Err(SignRejected {
            reason: self.reason.clone(),
        })
    }
}

/// Verify a detached signature against a signer identity.
pub fn verify_signature(identity: &Identity, message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&identity.public_key) else {
        return false;
    };
    let Ok(signature_bytes) = signature.try_into() else {
        return false;
    };
    let signature = Signature::from_bytes(&signature_bytes);

    verifying_key.verify(message, &signature).is_ok()
}
