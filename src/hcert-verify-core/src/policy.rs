//! Admission policy.
//!
//! Runs only on records whose signature has been verified. Checks are
//! ordered: disease, then completeness (dose count or result and test
//! type), then expiry.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::config::PolicyRules;
use crate::error::VerifyError;
use crate::record::{CertificateRecord, TestEntry, VaccinationEntry};
use crate::types::HealthGroup;

/// Accepted vaccination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaccinationClearance {
    /// Canonical holder identity.
    pub holder_name: String,
    /// Last day the vaccination counts.
    pub valid_until: NaiveDate,
}

/// Accepted test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestClearance {
    /// Canonical holder identity.
    pub holder_name: String,
    /// Sample collection time (UTC).
    pub collected_at: NaiveDateTime,
    /// End of test validity (UTC).
    pub valid_until: NaiveDateTime,
    /// Instant the test had to cover.
    pub admission_deadline: NaiveDateTime,
}

/// Applies [`PolicyRules`] to decoded records.
#[derive(Debug, Clone, Default)]
pub struct PolicyValidator {
    rules: PolicyRules,
}

impl PolicyValidator {
    /// Create a validator with the given rules.
    pub fn new(rules: PolicyRules) -> Self {
        Self { rules }
    }

    /// Active rules.
    #[must_use]
    pub fn rules(&self) -> &PolicyRules {
        &self.rules
    }

    /// Check a vaccination record for an event on `event_date`.
    ///
    /// # Errors
    ///
    /// `WrongDisease`, `NotFullyImmunized`, `CertificateExpired` (validity
    /// ended before `today`) or `ExpiresBeforeEvent`.
    #[instrument(skip(self, record))]
    pub fn validate_vaccination(
        &self,
        record: &CertificateRecord,
        today: NaiveDate,
        event_date: NaiveDate,
    ) -> Result<VaccinationClearance, VerifyError> {
        let entry = record.vaccination().ok_or_else(|| VerifyError::WrongCertificateKind {
            expected: HealthGroup::Vaccination,
            present: vec![record.entry.group()],
        })?;

        self.check_disease(&entry.disease)?;

        if entry.dose_number != entry.total_doses {
            return Err(VerifyError::NotFullyImmunized {
                dose_number: entry.dose_number,
                total_doses: entry.total_doses,
            });
        }

        let valid_until = self.vaccination_valid_until(entry)?;
        if valid_until < today {
            return Err(VerifyError::CertificateExpired { valid_until, today });
        }
        if valid_until < event_date {
            return Err(VerifyError::ExpiresBeforeEvent {
                valid_until,
                event_date,
            });
        }

        debug!(%valid_until, doses = entry.total_doses, "Policy: vaccination accepted");
        Ok(VaccinationClearance {
            holder_name: record.holder_name(),
            valid_until,
        })
    }

    /// Check a test record for an event starting at `event` (UTC).
    ///
    /// # Errors
    ///
    /// `WrongDisease`, `TestNotNegative`, `NonPcrTestRejected` or
    /// `TestExpiresBeforeEvent`; `MalformedEnvelope` when the collection
    /// time and `ConfigError` when the event time cannot be offset.
    #[instrument(skip(self, record))]
    pub fn validate_test(
        &self,
        record: &CertificateRecord,
        event: NaiveDateTime,
    ) -> Result<TestClearance, VerifyError> {
        let entry = record.test().ok_or_else(|| VerifyError::WrongCertificateKind {
            expected: HealthGroup::Test,
            present: vec![record.entry.group()],
        })?;

        self.check_disease(&entry.disease)?;

        if entry.result != self.rules.negative_result_code {
            return Err(VerifyError::TestNotNegative {
                result: entry.result.clone(),
            });
        }
        if !self.is_pcr(entry) {
            return Err(VerifyError::NonPcrTestRejected {
                test_type: entry.test_type.clone(),
            });
        }

        let collected_at = entry.sample_collected.naive_utc();
        let valid_until = Duration::try_hours(self.rules.test_validity_hours)
            .and_then(|window| collected_at.checked_add_signed(window))
            .ok_or_else(|| VerifyError::malformed("record", "sample collection time out of range"))?;
        let admission_deadline = Duration::try_hours(self.rules.admission_grace_hours)
            .and_then(|grace| event.checked_add_signed(grace))
            .ok_or_else(|| VerifyError::ConfigError {
                message: format!("event time {} out of range", event),
            })?;
        if valid_until < admission_deadline {
            return Err(VerifyError::TestExpiresBeforeEvent {
                collected_at,
                valid_until,
                admission_deadline,
            });
        }

        debug!(%collected_at, %valid_until, "Policy: test accepted");
        Ok(TestClearance {
            holder_name: record.holder_name(),
            collected_at,
            valid_until,
            admission_deadline,
        })
    }

    /// Last day a completed series counts.
    ///
    /// Single-dose regimens are capped at the configured cutoff.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEnvelope` if the date arithmetic overflows.
    pub fn vaccination_valid_until(&self, entry: &VaccinationEntry) -> Result<NaiveDate, VerifyError> {
        let until = Duration::try_days(self.rules.vaccination_validity_days)
            .and_then(|validity| entry.date.checked_add_signed(validity))
            .ok_or_else(|| VerifyError::malformed("record", "vaccination date out of range"))?;
        if entry.total_doses == 1 {
            Ok(until.min(self.rules.single_dose_cutoff))
        } else {
            Ok(until)
        }
    }

    /// PCR/NAAT check: the type code matches, or no type is given but an
    /// NAA test name is.
    fn is_pcr(&self, entry: &TestEntry) -> bool {
        match entry.test_type.as_deref() {
            Some(tt) => tt == self.rules.pcr_test_type,
            None => entry.test_name.as_deref().is_some_and(|nm| !nm.is_empty()),
        }
    }

    fn check_disease(&self, disease: &str) -> Result<(), VerifyError> {
        if disease == self.rules.disease_code {
            Ok(())
        } else {
            Err(VerifyError::WrongDisease {
                expected: self.rules.disease_code.clone(),
                actual: disease.to_string(),
            })
        }
    }
}
