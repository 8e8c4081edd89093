//! ECDSA P-256 signature operations.
//!
//! COSE `ES256` signatures are the raw 64-byte `r || s` concatenation, which
//! is exactly what `p256::ecdsa::Signature::from_slice` expects.

use p256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use p256::elliptic_curve::rand_core::OsRng;
use p256::pkcs8::DecodePrivateKey;
use p256::{EncodedPoint, FieldBytes};

use crate::error::CryptoError;
use crate::traits::{ClassicalSigner, ClassicalVerifier};
use crate::types::ClassicalAlgorithm;

/// Length of one affine coordinate in bytes.
pub const P256_COORDINATE_LEN: usize = 32;

/// ECDSA P-256 signer.
pub struct P256Signer {
    signing_key: SigningKey,
}

impl P256Signer {
    /// Create a new signer with a random key.
    #[must_use]
    pub fn random() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Create a signer from a raw 32-byte scalar.
    ///
    /// # Errors
    ///
    /// Returns error if the key bytes are invalid.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| CryptoError::invalid_private_key(e.to_string()))?;

        Ok(Self { signing_key })
    }

    /// Create a signer from a PKCS#8 DER private key.
    ///
    /// # Errors
    ///
    /// Returns error if the document is not a P-256 PKCS#8 key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::invalid_private_key(e.to_string()))?;

        Ok(Self { signing_key })
    }

    /// Get the verifying key.
    #[must_use]
    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl ClassicalSigner for P256Signer {
    fn algorithm(&self) -> ClassicalAlgorithm {
        ClassicalAlgorithm::EcdsaP256
    }

    fn public_key(&self) -> Result<Vec<u8>, CryptoError> {
        let vk = self.signing_key.verifying_key();
        let encoded = vk.to_encoded_point(false); // Uncompressed
        Ok(encoded.as_bytes().to_vec())
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature: Signature = self
            .signing_key
            .try_sign(data)
            .map_err(|e| CryptoError::signing_failed(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}

/// ECDSA P-256 verifier.
pub struct P256Verifier;

impl P256Verifier {
    /// Create a new verifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Rebuild an uncompressed SEC1 public key from its affine coordinates.
    ///
    /// The point is checked to lie on the curve.
    ///
    /// # Errors
    ///
    /// Returns error if either coordinate has the wrong length or the point
    /// is not on P-256.
    pub fn public_key_from_coordinates(x: &[u8], y: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if x.len() != P256_COORDINATE_LEN || y.len() != P256_COORDINATE_LEN {
            return Err(CryptoError::invalid_public_key(format!(
                "expected {}-byte coordinates, got x={} y={}",
                P256_COORDINATE_LEN,
                x.len(),
                y.len()
            )));
        }

        let point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(x),
            FieldBytes::from_slice(y),
            false,
        );
        let vk = VerifyingKey::from_encoded_point(&point)
            .map_err(|e| CryptoError::invalid_public_key(e.to_string()))?;

        Ok(vk.to_encoded_point(false).as_bytes().to_vec())
    }
}

impl Default for P256Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassicalVerifier for P256Verifier {
    fn algorithm(&self) -> ClassicalAlgorithm {
        ClassicalAlgorithm::EcdsaP256
    }

    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
        // Parse public key
        let vk = VerifyingKey::from_sec1_bytes(public_key)
            .map_err(|e| CryptoError::invalid_public_key(e.to_string()))?;

        // Parse signature
        let sig = Signature::from_slice(signature)
            .map_err(|e| CryptoError::invalid_signature(e.to_string()))?;

        // Verify
        match vk.verify(data, &sig) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}
