//! Shared domain types for the verification pipeline.

use std::fmt;

use base64::Engine;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Serialize, Serializer};

use crate::error::VerifyError;
use crate::record::CertificateRecord;

/// Opaque key identifier selecting a trust anchor.
///
/// Displayed in standard base64, which is how trust lists and issuers
/// publish them.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(Vec<u8>);

impl KeyId {
    /// Raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Base64 rendering used in logs and messages.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }

    /// Lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<Vec<u8>> for KeyId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for KeyId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_base64())
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

/// Certificate group inside the health certificate claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthGroup {
    /// `v` array.
    Vaccination,
    /// `t` array.
    Test,
    /// `r` array.
    Recovery,
}

impl HealthGroup {
    /// All groups in schema order.
    pub const ALL: [HealthGroup; 3] = [Self::Vaccination, Self::Test, Self::Recovery];

    /// Claim key of this group.
    #[must_use]
    pub const fn key(&self) -> &'static str {
        match self {
            Self::Vaccination => "v",
            Self::Test => "t",
            Self::Recovery => "r",
        }
    }
}

impl fmt::Display for HealthGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vaccination => "vaccination",
            Self::Test => "test",
            Self::Recovery => "recovery",
        })
    }
}

/// Kind of certificate accepted for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateKind {
    /// Vaccination proof.
    Vaccination,
    /// Test proof.
    Test,
}

impl CertificateKind {
    /// Claims group carrying this kind.
    #[must_use]
    pub const fn group(&self) -> HealthGroup {
        match self {
            Self::Vaccination => HealthGroup::Vaccination,
            Self::Test => HealthGroup::Test,
        }
    }
}

impl fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.group().fmt(f)
    }
}

impl std::str::FromStr for CertificateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vaccination" | "vaccine" | "v" => Ok(Self::Vaccination),
            "test" | "t" => Ok(Self::Test),
            other => Err(format!("unknown certificate kind '{}'", other)),
        }
    }
}

/// How long an admitted certificate stays acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "until", rename_all = "snake_case")]
pub enum Validity {
    /// Vaccination protection ends on this date.
    VaccinatedUntil(NaiveDate),
    /// Test result stays valid until this instant (UTC).
    TestedUntil(NaiveDateTime),
}

/// Successful verification outcome.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedCertificate {
    /// Canonical holder identity (`given + " " + family`).
    pub holder_name: String,
    /// Kind of certificate that was verified.
    pub kind: CertificateKind,
    /// Computed validity.
    pub validity: Validity,
    /// Key identifier of the signer.
    pub kid: KeyId,
    /// Decoded claims.
    #[serde(skip)]
    pub record: CertificateRecord,
}

/// Result of one verification attempt.
pub type VerificationResult = Result<VerifiedCertificate, VerifyError>;
