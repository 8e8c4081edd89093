//! # hcert-crypto
//!
//! Signature primitives for digital health certificate verification.
//!
//! Health certificates are COSE_Sign1 messages. This crate supports exactly
//! one algorithm family, ECDSA P-256 with SHA-256 (COSE `ES256`, alg `-7`),
//! and everything else fails closed:
//!
//! ```text
//! ClassicalAlgorithm::from_cose_id(-7)  => Some(EcdsaP256)
//! ClassicalAlgorithm::from_cose_id(-37) => None   (PS256, refused)
//! ```
//!
//! Verifiers take SEC1-encoded public keys. Trust anchors published as X.509
//! certificates are reduced to their affine coordinates by the caller and
//! rebuilt with [`P256Verifier::public_key_from_coordinates`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod traits;
mod types;

#[cfg(feature = "ecdsa-p256")]
mod ecdsa;

pub use error::CryptoError;
pub use traits::{ClassicalSigner, ClassicalVerifier};
pub use types::{cose_algorithm_name, ClassicalAlgorithm, CoseAlgorithmId, COSE_ALG_ES256};

#[cfg(feature = "ecdsa-p256")]
pub use ecdsa::{P256Signer, P256Verifier, P256_COORDINATE_LEN};
