//! Signer and verifier seams.
//!
//! The verification engine only ever holds a [`ClassicalVerifier`]; the
//! signer side exists so fixtures and tooling can produce messages that go
//! through exactly the same code path.

use crate::error::CryptoError;
use crate::types::ClassicalAlgorithm;

/// Trait for classical signature operations.
pub trait ClassicalSigner {
    /// Get the algorithm used by this signer.
    fn algorithm(&self) -> ClassicalAlgorithm;

    /// Get the public key (SEC1 uncompressed encoding).
    fn public_key(&self) -> Result<Vec<u8>, CryptoError>;

    /// Sign data and return the raw signature.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Trait for classical signature verification.
pub trait ClassicalVerifier {
    /// Algorithm this verifier accepts.
    fn algorithm(&self) -> ClassicalAlgorithm;

    /// Verify a signature against a public key.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not match;
    /// malformed keys or signatures are errors.
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8])
        -> Result<bool, CryptoError>;
}
