//! Signature verification against trust anchors.
//!
//! Only ES256 (ECDSA P-256 with SHA-256) is accepted. Any other declared
//! algorithm, or an anchor carrying a different key type, fails closed with
//! `UnsupportedAlgorithm`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hcert_crypto::{
    cose_algorithm_name, ClassicalAlgorithm, ClassicalVerifier, P256Verifier,
    P256_COORDINATE_LEN,
};
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::envelope::SignedMessage;
use crate::error::VerifyError;
use crate::trust::{AnchorKey, TrustAnchor, TrustStore};

/// Signature gate between decoding and policy.
pub struct SignatureVerifier {
    trust: Arc<TrustStore>,
    clock: Arc<dyn Clock>,
}

impl SignatureVerifier {
    /// Create a verifier over a trust store.
    pub fn new(trust: Arc<TrustStore>, clock: Arc<dyn Clock>) -> Self {
        Self { trust, clock }
    }

    /// Resolve the anchor for the message key identifier and verify.
    ///
    /// # Errors
    ///
    /// Any trust store error, then the errors of [`verify_with_anchor`].
    #[instrument(skip(self, message), fields(kid = %message.key_id))]
    pub fn verify(&self, message: &SignedMessage) -> Result<(), VerifyError> {
        let anchor = self.trust.lookup(&message.key_id)?;
        verify_with_anchor(message, &anchor, self.clock.now())
    }
}

/// Verify `message` against one anchor at instant `now`.
///
/// Checks run in order: validity window, declared algorithm, anchor key
/// type, signature.
///
/// # Errors
///
/// `SignerNotYetValid`, `SignerExpired`, `UnsupportedAlgorithm` or
/// `SignatureInvalid`.
pub fn verify_with_anchor(
    message: &SignedMessage,
    anchor: &TrustAnchor,
    now: DateTime<Utc>,
) -> Result<(), VerifyError> {
    let kid = &anchor.key_id;

    if now < anchor.not_before {
        return Err(VerifyError::SignerNotYetValid {
            kid: kid.clone(),
            not_before: anchor.not_before,
        });
    }
    if now > anchor.not_after {
        return Err(VerifyError::SignerExpired {
            kid: kid.clone(),
            not_after: anchor.not_after,
        });
    }

    let algorithm = match message.algorithm {
        Some(id) => ClassicalAlgorithm::from_cose_id(id).ok_or_else(|| {
            VerifyError::UnsupportedAlgorithm {
                algorithm: cose_algorithm_name(id),
            }
        })?,
        None => {
            return Err(VerifyError::UnsupportedAlgorithm {
                algorithm: "none".into(),
            })
        },
    };

    let point = match &anchor.key {
        AnchorKey::EcP256 { point } => point,
        AnchorKey::Unsupported { algorithm } => {
            warn!(%kid, %algorithm, "Signature: anchor key type not supported");
            return Err(VerifyError::UnsupportedAlgorithm {
                algorithm: format!("anchor key {}", algorithm),
            });
        },
    };
    let public_key = anchor_public_key(point).map_err(|reason| {
        warn!(%kid, %reason, "Signature: anchor key rejected");
        VerifyError::SignatureInvalid { kid: kid.clone() }
    })?;

    if message.signature.len() != algorithm.signature_len() {
        debug!(%kid, len = message.signature.len(), "Signature: wrong length");
        return Err(VerifyError::SignatureInvalid { kid: kid.clone() });
    }

    let tbs = message.sig_structure()?;
    match P256Verifier::new().verify(&public_key, &tbs, &message.signature) {
        Ok(true) => {
            debug!(%kid, alg = algorithm.cose_name(), subject = %anchor.subject, "Signature: valid");
            Ok(())
        },
        Ok(false) => Err(VerifyError::SignatureInvalid { kid: kid.clone() }),
        Err(e) => {
            debug!(%kid, error = %e, "Signature: verification error");
            Err(VerifyError::SignatureInvalid { kid: kid.clone() })
        },
    }
}

/// Split an uncompressed point into its coordinates and rebuild the key.
fn anchor_public_key(point: &[u8]) -> Result<Vec<u8>, String> {
    if point.len() != 1 + 2 * P256_COORDINATE_LEN || point[0] != 0x04 {
        return Err(format!(
            "expected uncompressed P-256 point, got {} bytes",
            point.len()
        ));
    }
    let (x, y) = point[1..].split_at(P256_COORDINATE_LEN);
    P256Verifier::public_key_from_coordinates(x, y).map_err(|e| e.to_string())
}
