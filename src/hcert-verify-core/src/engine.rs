//! Main certificate verification engine.
//!
//! This module implements the complete verification flow:
//! 1. Image acquisition (raster decode or first PDF page)
//! 2. QR extraction
//! 3. Envelope decoding (prefix, base45, zlib, COSE_Sign1)
//! 4. Record decoding for the expected group
//! 5. Signature verification against the trust store
//! 6. Admission policy
//!
//! Every step returns a typed [`VerifyError`]; the first failure ends the
//! attempt. Policy only ever sees records whose signature verified.

use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, info, instrument, warn};

use crate::acquire;
use crate::clock::{Clock, SystemClock};
use crate::config::VerifyConfig;
use crate::envelope::{EnvelopeDecoder, SignedMessage};
use crate::error::VerifyError;
use crate::https::{HttpsGateway, TrustGateway};
use crate::policy::PolicyValidator;
use crate::qr;
use crate::record::{self, CertificateRecord};
use crate::signature::SignatureVerifier;
use crate::trust::TrustStore;
use crate::types::{CertificateKind, Validity, VerificationResult, VerifiedCertificate};

/// The main certificate verification engine.
///
/// Stateless across calls except for the trust store it owns; safe to share
/// between threads.
pub struct CertificateEngine {
    /// Configuration.
    config: VerifyConfig,
    /// Time source for trust freshness, signer validity and expiry.
    clock: Arc<dyn Clock>,
    /// Text envelope decoder.
    envelope: EnvelopeDecoder,
    /// Trust anchors.
    trust: Arc<TrustStore>,
    /// Signature gate.
    signatures: SignatureVerifier,
    /// Admission rules.
    policy: PolicyValidator,
}

impl CertificateEngine {
    /// Create an engine with default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails.
    pub fn new() -> Result<Self, VerifyError> {
        Self::with_config(VerifyConfig::default())
    }

    /// Create an engine talking to the configured HTTPS gateway.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn with_config(config: VerifyConfig) -> Result<Self, VerifyError> {
        let gateway = Arc::new(HttpsGateway::from_config(&config));
        Self::with_collaborators(config, gateway, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit gateway and clock.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn with_collaborators(
        config: VerifyConfig,
        gateway: Arc<dyn TrustGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, VerifyError> {
        info!(
            gateway = %config.gateway_url,
            resource = %config.trust_list_resource,
            cache_ttl = config.cache_ttl.as_secs(),
            cache_dir = ?config.cache_dir,
            stale_policy = ?config.stale_policy,
            "CertificateEngine: starting initialization"
        );

        let trust = Arc::new(TrustStore::new(&config, gateway, Arc::clone(&clock))?);
        let signatures = SignatureVerifier::new(Arc::clone(&trust), Arc::clone(&clock));
        let envelope = EnvelopeDecoder::new(config.prefix.clone(), config.validate_prefix);
        let policy = PolicyValidator::new(config.rules.clone());

        info!("CertificateEngine: initialization complete");
        Ok(Self {
            config,
            clock,
            envelope,
            trust,
            signatures,
            policy,
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &VerifyConfig {
        &self.config
    }

    /// Trust store used for signature checks.
    #[must_use]
    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Verify an uploaded document for an event starting at `event` (UTC).
    ///
    /// # Errors
    ///
    /// Any [`VerifyError`]; see the module docs for the order of checks.
    #[instrument(skip(self, document), fields(len = document.len()))]
    pub fn verify(
        &self,
        document: &[u8],
        filename_hint: &str,
        expected: CertificateKind,
        event: NaiveDateTime,
    ) -> VerificationResult {
        let frame = acquire::acquire_frame(document, filename_hint)?;
        let scan = qr::extract_payload(&frame)?;
        debug!(
            candidates = scan.candidates,
            bytes = scan.payload.len(),
            "CertificateEngine: QR payload extracted"
        );
        self.verify_payload(&scan.payload, expected, event)
    }

    /// Verify a raw QR payload (`HC1:...`).
    ///
    /// # Errors
    ///
    /// Any [`VerifyError`] past the acquisition stage.
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub fn verify_payload(
        &self,
        payload: &[u8],
        expected: CertificateKind,
        event: NaiveDateTime,
    ) -> VerificationResult {
        let (message, record) = self.decode(payload, expected)?;

        self.signatures.verify(&message).map_err(|e| {
            warn!(kid = %message.key_id, error = %e, "CertificateEngine: signature rejected");
            e
        })?;

        let validity = match expected {
            CertificateKind::Vaccination => {
                let clearance =
                    self.policy
                        .validate_vaccination(&record, self.clock.today(), event.date())?;
                Validity::VaccinatedUntil(clearance.valid_until)
            },
            CertificateKind::Test => {
                let clearance = self.policy.validate_test(&record, event)?;
                Validity::TestedUntil(clearance.valid_until)
            },
        };

        let holder_name = record.holder_name();
        info!(
            kind = %expected,
            kid = %message.key_id,
            validity = ?validity,
            "CertificateEngine: certificate accepted"
        );
        Ok(VerifiedCertificate {
            holder_name,
            kind: expected,
            validity,
            kid: message.key_id,
            record,
        })
    }

    /// Decode a payload without checking signature or policy.
    ///
    /// # Errors
    ///
    /// Decode errors only (`BadPrefix`, `Base45DecodeError`,
    /// `MalformedEnvelope`, `WrongCertificateKind`).
    pub fn decode(
        &self,
        payload: &[u8],
        expected: CertificateKind,
    ) -> Result<(SignedMessage, CertificateRecord), VerifyError> {
        let message = self.envelope.decode(payload)?;
        let record =
            record::decode_record(&message.payload, expected.group(), self.config.entry_selection)?;
        Ok((message, record))
    }
}
