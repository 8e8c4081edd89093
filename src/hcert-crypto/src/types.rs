//! Algorithm identifiers shared between the signing and verifying sides.

use serde::{Deserialize, Serialize};

/// COSE algorithm identifier (RFC 9053, "alg" header parameter).
pub type CoseAlgorithmId = i64;

/// COSE identifier for ECDSA w/ SHA-256.
pub const COSE_ALG_ES256: CoseAlgorithmId = -7;

/// Classical signature algorithm.
///
/// Only one family is supported. Messages declaring anything else are
/// rejected before any key material is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ClassicalAlgorithm {
    /// ECDSA with NIST P-256 (secp256r1) over SHA-256.
    EcdsaP256 = 1,
}

impl ClassicalAlgorithm {
    /// COSE "alg" value for this algorithm.
    #[must_use]
    pub const fn cose_id(&self) -> CoseAlgorithmId {
        match self {
            Self::EcdsaP256 => COSE_ALG_ES256,
        }
    }

    /// COSE registry name.
    #[must_use]
    pub const fn cose_name(&self) -> &'static str {
        match self {
            Self::EcdsaP256 => "ES256",
        }
    }

    /// Map a COSE "alg" value to a supported algorithm.
    #[must_use]
    pub const fn from_cose_id(id: CoseAlgorithmId) -> Option<Self> {
        match id {
            COSE_ALG_ES256 => Some(Self::EcdsaP256),
            _ => None,
        }
    }

    /// Raw signature length (r || s).
    #[must_use]
    pub const fn signature_len(&self) -> usize {
        match self {
            Self::EcdsaP256 => 64,
        }
    }
}

/// Human-readable name for a COSE algorithm id, including ones we refuse.
#[must_use]
pub fn cose_algorithm_name(id: CoseAlgorithmId) -> String {
    match id {
        -7 => "ES256".into(),
        -35 => "ES384".into(),
        -36 => "ES512".into(),
        -37 => "PS256".into(),
        -38 => "PS384".into(),
        -39 => "PS512".into(),
        -8 => "EdDSA".into(),
        -257 => "RS256".into(),
        other => format!("COSE alg {}", other),
    }
}
