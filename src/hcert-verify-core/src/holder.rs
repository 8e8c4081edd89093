//! Holder reconciliation.
//!
//! Combines a verified vaccination and/or test certificate into the record
//! a caller persists per holder. The core never touches storage itself.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::VerifyError;
use crate::types::VerifiedCertificate;

/// Holder record keyed by full name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HolderRecord {
    /// Canonical holder identity.
    pub name: String,
    /// A vaccination certificate was accepted.
    pub is_vaccinated: bool,
    /// A test certificate was accepted.
    pub is_tested: bool,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

/// Build a holder record from up to two verified certificates.
///
/// # Errors
///
/// - `NoCertificates` when neither is given
/// - `HolderMismatch` when both are given and name different holders
pub fn reconcile(
    vaccination: Option<&VerifiedCertificate>,
    test: Option<&VerifiedCertificate>,
    now: DateTime<Utc>,
) -> Result<HolderRecord, VerifyError> {
    let name = match (vaccination, test) {
        (Some(v), Some(t)) if v.holder_name != t.holder_name => {
            return Err(VerifyError::HolderMismatch {
                vaccination_name: v.holder_name.clone(),
                test_name: t.holder_name.clone(),
            })
        },
        (Some(v), _) => v.holder_name.clone(),
        (None, Some(t)) => t.holder_name.clone(),
        (None, None) => return Err(VerifyError::NoCertificates),
    };

    let record = HolderRecord {
        name,
        is_vaccinated: vaccination.is_some(),
        is_tested: test.is_some(),
        created_at: now,
    };
    info!(
        holder = %record.name,
        vaccinated = record.is_vaccinated,
        tested = record.is_tested,
        "Holder: reconciled"
    );
    Ok(record)
}
