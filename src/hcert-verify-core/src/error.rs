//! Error types for certificate verification.
//!
//! Every failure of a single verification attempt is one of these variants.
//! None of them is retried inside the engine.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

use crate::base45::Base45Error;
use crate::types::{HealthGroup, KeyId};

/// Broad grouping of [`VerifyError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The uploaded document could not be turned into a QR payload.
    Input,
    /// The payload is not a well-formed health certificate.
    Decode,
    /// Trust anchors could not be obtained or do not cover the signer.
    Trust,
    /// The signature or the signer certificate was rejected.
    Signature,
    /// The certificate is authentic but does not satisfy admission rules.
    Policy,
    /// Configuration, cache or caller-side failures.
    Internal,
}

/// Errors that can occur during verification.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Neither the raster nor the document path produced a frame.
    #[error("Unsupported input '{hint}': {reason}")]
    UnsupportedInput {
        /// Filename hint supplied by the caller.
        hint: String,
        /// Why decoding failed.
        reason: String,
    },

    /// No QR code could be decoded from the frame.
    #[error("No QR code was detected in the image ({candidates} candidate regions)")]
    NoQrCodeFound {
        /// Number of grid candidates the detector located.
        candidates: usize,
    },

    /// Payload does not start with the health certificate context prefix.
    #[error("Payload does not start with '{expected}' (found {found:?})")]
    BadPrefix {
        /// Prefix required by configuration.
        expected: String,
        /// Leading characters actually present.
        found: String,
    },

    /// Base-45 text could not be decoded.
    #[error("Base45 decode error: {0}")]
    Base45DecodeError(#[from] Base45Error),

    /// Compressed blob, COSE structure or claims could not be decoded.
    #[error("Malformed envelope ({stage}): {reason}")]
    MalformedEnvelope {
        /// Decoding stage that failed.
        stage: &'static str,
        /// Underlying reason.
        reason: String,
    },

    /// The certificate does not carry the group the caller asked for.
    #[error("The certificate must be for a {expected} (found: {})", display_groups(.present))]
    WrongCertificateKind {
        /// Group the caller expected.
        expected: HealthGroup,
        /// Groups actually present in the certificate.
        present: Vec<HealthGroup>,
    },

    /// Trust list could not be fetched and no cached copy is usable.
    #[error("Unable to reach trust gateway for '{resource}': {reason}")]
    TrustGatewayUnreachable {
        /// Resource name that was requested.
        resource: String,
        /// Transport or status failure.
        reason: String,
    },

    /// Trust list body could not be decoded.
    #[error("Malformed trust list '{resource}': {reason}")]
    MalformedTrustList {
        /// Resource name that was decoded.
        resource: String,
        /// Underlying reason.
        reason: String,
    },

    /// No trust anchor is registered for the message key identifier.
    #[error("Unable to validate certificate signature: kid '{kid}' not found")]
    UnknownSigner {
        /// Key identifier from the message.
        kid: KeyId,
    },

    /// Signer certificate validity has not started yet.
    #[error("Signer certificate '{kid}' not valid before {not_before}")]
    SignerNotYetValid {
        /// Key identifier of the anchor.
        kid: KeyId,
        /// Start of validity.
        not_before: DateTime<Utc>,
    },

    /// Signer certificate validity has ended.
    #[error("Signer certificate '{kid}' expired at {not_after}")]
    SignerExpired {
        /// Key identifier of the anchor.
        kid: KeyId,
        /// End of validity.
        not_after: DateTime<Utc>,
    },

    /// Message or anchor uses an algorithm other than ES256.
    #[error("Unsupported signature algorithm: {algorithm}")]
    UnsupportedAlgorithm {
        /// Name of the declared algorithm or key type.
        algorithm: String,
    },

    /// Signature does not verify against the anchor key.
    #[error("Unable to validate certificate signature (kid '{kid}')")]
    SignatureInvalid {
        /// Key identifier of the anchor.
        kid: KeyId,
    },

    /// Targeted disease is not COVID-19.
    #[error("The certificate must be for covid19 (disease code {actual})")]
    WrongDisease {
        /// Required disease code.
        expected: String,
        /// Code found in the certificate.
        actual: String,
    },

    /// Vaccination series is not complete.
    #[error("With this certificate you are not fully immunized (dose {dose_number} of {total_doses})")]
    NotFullyImmunized {
        /// Dose number of the entry.
        dose_number: u32,
        /// Total doses of the series.
        total_doses: u32,
    },

    /// Vaccination validity already ended.
    #[error("This certificate is already expired (valid until {valid_until})")]
    CertificateExpired {
        /// Computed end of validity.
        valid_until: NaiveDate,
        /// Date the check ran.
        today: NaiveDate,
    },

    /// Vaccination validity ends before the event.
    #[error("Your vaccine will expire before the event at {event_date} (valid until {valid_until})")]
    ExpiresBeforeEvent {
        /// Computed end of validity.
        valid_until: NaiveDate,
        /// Configured event date.
        event_date: NaiveDate,
    },

    /// Test result is not negative.
    #[error("The test was not negative ({result})")]
    TestNotNegative {
        /// Result code found in the certificate.
        result: String,
    },

    /// Test is not a PCR/NAAT test.
    #[error("We only allow PCR tests (test type {})", .test_type.as_deref().unwrap_or("unknown"))]
    NonPcrTestRejected {
        /// Test type code, if present.
        test_type: Option<String>,
    },

    /// Test validity ends before the admission deadline.
    #[error(
        "Your test will expire before the event at {admission_deadline} \
         (time of test: {collected_at}, valid until: {valid_until})"
    )]
    TestExpiresBeforeEvent {
        /// Sample collection time.
        collected_at: NaiveDateTime,
        /// End of test validity.
        valid_until: NaiveDateTime,
        /// Event start plus the admission grace window.
        admission_deadline: NaiveDateTime,
    },

    /// Vaccination and test certificates name different holders.
    #[error(
        "The name in the test and the vaccine certificate don't match. \
         Test name: '{test_name}', Vaccine name: '{vaccination_name}'"
    )]
    HolderMismatch {
        /// Holder of the vaccination certificate.
        vaccination_name: String,
        /// Holder of the test certificate.
        test_name: String,
    },

    /// Reconciliation was asked for without any verified certificate.
    #[error("At least one certificate must be supplied")]
    NoCertificates,

    /// Trust cache failure.
    #[error("Cache error: {message}")]
    CacheError {
        /// Error message.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message.
        message: String,
    },
}

fn display_groups(groups: &[HealthGroup]) -> String {
    if groups.is_empty() {
        return "none".into();
    }
    groups
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl VerifyError {
    /// Create a malformed envelope error for a decoding stage.
    #[must_use]
    pub fn malformed(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            stage,
            reason: reason.into(),
        }
    }

    /// Category this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedInput { .. } | Self::NoQrCodeFound { .. } => ErrorCategory::Input,
            Self::BadPrefix { .. }
            | Self::Base45DecodeError(_)
            | Self::MalformedEnvelope { .. }
            | Self::WrongCertificateKind { .. } => ErrorCategory::Decode,
            Self::TrustGatewayUnreachable { .. }
            | Self::MalformedTrustList { .. }
            | Self::UnknownSigner { .. } => ErrorCategory::Trust,
            Self::SignerNotYetValid { .. }
            | Self::SignerExpired { .. }
            | Self::UnsupportedAlgorithm { .. }
            | Self::SignatureInvalid { .. } => ErrorCategory::Signature,
            Self::WrongDisease { .. }
            | Self::NotFullyImmunized { .. }
            | Self::CertificateExpired { .. }
            | Self::ExpiresBeforeEvent { .. }
            | Self::TestNotNegative { .. }
            | Self::NonPcrTestRejected { .. }
            | Self::TestExpiresBeforeEvent { .. } => ErrorCategory::Policy,
            Self::HolderMismatch { .. }
            | Self::NoCertificates
            | Self::CacheError { .. }
            | Self::ConfigError { .. } => ErrorCategory::Internal,
        }
    }

    /// Check if the certificate was authentic but rejected by admission rules.
    #[must_use]
    pub fn is_policy_rejection(&self) -> bool {
        self.category() == ErrorCategory::Policy
    }

    /// Check if a caller-level retry could help (trust gateway trouble).
    #[must_use]
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::TrustGatewayUnreachable { .. } | Self::MalformedTrustList { .. }
        )
    }

    /// Stable machine-readable name of the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedInput { .. } => "unsupported_input",
            Self::NoQrCodeFound { .. } => "no_qr_code_found",
            Self::BadPrefix { .. } => "bad_prefix",
            Self::Base45DecodeError(_) => "base45_decode_error",
            Self::MalformedEnvelope { .. } => "malformed_envelope",
            Self::WrongCertificateKind { .. } => "wrong_certificate_kind",
            Self::TrustGatewayUnreachable { .. } => "trust_gateway_unreachable",
            Self::MalformedTrustList { .. } => "malformed_trust_list",
            Self::UnknownSigner { .. } => "unknown_signer",
            Self::SignerNotYetValid { .. } => "signer_not_yet_valid",
            Self::SignerExpired { .. } => "signer_expired",
            Self::UnsupportedAlgorithm { .. } => "unsupported_algorithm",
            Self::SignatureInvalid { .. } => "signature_invalid",
            Self::WrongDisease { .. } => "wrong_disease",
            Self::NotFullyImmunized { .. } => "not_fully_immunized",
            Self::CertificateExpired { .. } => "certificate_expired",
            Self::ExpiresBeforeEvent { .. } => "expires_before_event",
            Self::TestNotNegative { .. } => "test_not_negative",
            Self::NonPcrTestRejected { .. } => "non_pcr_test_rejected",
            Self::TestExpiresBeforeEvent { .. } => "test_expires_before_event",
            Self::HolderMismatch { .. } => "holder_mismatch",
            Self::NoCertificates => "no_certificates",
            Self::CacheError { .. } => "cache_error",
            Self::ConfigError { .. } => "config_error",
        }
    }
}
