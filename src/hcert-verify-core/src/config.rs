//! Configuration for the verification engine.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;

use crate::error::VerifyError;

/// What the trust store does when a refresh fails but an older copy exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePolicy {
    /// Keep verifying against the last trust list that was fetched.
    #[default]
    ServeStale,
    /// Refuse verification until a fresh trust list is available.
    FailClosed,
}

/// Which entry of a group is inspected when a certificate carries several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntrySelection {
    /// The first array element.
    #[default]
    First,
    /// The vaccination entry with the highest dose number (tests and
    /// recoveries still use the first element).
    HighestDose,
}

/// Admission rule constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRules {
    /// SNOMED code for COVID-19 (`tg`).
    pub disease_code: String,
    /// SNOMED code for "not detected" (`tr`).
    pub negative_result_code: String,
    /// LOINC code for nucleic acid amplification tests (`tt`).
    pub pcr_test_type: String,
    /// Days a completed vaccination series stays valid.
    pub vaccination_validity_days: i64,
    /// Latest validity end for single-dose regimens.
    pub single_dose_cutoff: NaiveDate,
    /// Hours a test result stays valid after sample collection.
    pub test_validity_hours: i64,
    /// Hours after the event start until which a test must be valid.
    pub admission_grace_hours: i64,
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            disease_code: "840539006".into(),
            negative_result_code: "260415000".into(),
            pcr_test_type: "LP6464-4".into(),
            vaccination_validity_days: 270,
            single_dose_cutoff: NaiveDate::from_ymd_opt(2022, 1, 3).unwrap_or(NaiveDate::MIN),
            test_validity_hours: 48,
            admission_grace_hours: 24 + 6,
        }
    }
}

/// Configuration for the certificate engine.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Base URL of the trust gateway.
    pub gateway_url: String,
    /// Resource name of the trust list on the gateway.
    pub trust_list_resource: String,
    /// Request timeout.
    pub timeout: Duration,
    /// Trust list cache TTL.
    pub cache_ttl: Duration,
    /// Directory for persisted trust resources (`None` = memory only).
    pub cache_dir: Option<PathBuf>,
    /// Behaviour when a refresh fails and a stale copy exists.
    pub stale_policy: StalePolicy,
    /// Whether the context prefix is checked before stripping.
    pub validate_prefix: bool,
    /// Context prefix of the QR payload.
    pub prefix: String,
    /// Entry selection within a group.
    pub entry_selection: EntrySelection,
    /// Upper bound on a trust gateway response body.
    pub max_response_bytes: u64,
    /// Admission rules.
    pub rules: PolicyRules,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            gateway_url: "https://dgc-trust.qr.gv.at".into(),
            trust_list_resource: "trustlist".into(),
            timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(12 * 60 * 60), // 12 hours
            cache_dir: None,
            stale_policy: StalePolicy::ServeStale,
            validate_prefix: true,
            prefix: "HC1:".into(),
            entry_selection: EntrySelection::First,
            max_response_bytes: 8 * 1024 * 1024,
            rules: PolicyRules::default(),
        }
    }
}

impl VerifyConfig {
    /// Check the configuration for values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` describing the first offending field.
    pub fn validate(&self) -> Result<(), VerifyError> {
        validate_resource_name(&self.trust_list_resource)?;
        if self.cache_ttl.is_zero() {
            return Err(config_error("cache_ttl must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(config_error("timeout must be greater than zero"));
        }
        if self.prefix.is_empty() {
            return Err(config_error("prefix must not be empty"));
        }
        if self.gateway_url.trim().is_empty() {
            return Err(config_error("gateway_url must not be empty"));
        }
        self.rules.validate()
    }
}

impl PolicyRules {
    /// Check that every window is non-negative and representable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the offending rule.
    pub fn validate(&self) -> Result<(), VerifyError> {
        let windows = [
            (
                "vaccination_validity_days",
                self.vaccination_validity_days,
                chrono::Duration::try_days(self.vaccination_validity_days),
            ),
            (
                "test_validity_hours",
                self.test_validity_hours,
                chrono::Duration::try_hours(self.test_validity_hours),
            ),
            (
                "admission_grace_hours",
                self.admission_grace_hours,
                chrono::Duration::try_hours(self.admission_grace_hours),
            ),
        ];
        for (name, value, duration) in windows {
            if value < 0 || duration.is_none() {
                return Err(config_error(format!("{} out of range: {}", name, value)));
            }
        }
        Ok(())
    }
}

/// Resource names double as cache file names, so they are restricted to a
/// path-safe alphabet.
pub(crate) fn validate_resource_name(resource: &str) -> Result<(), VerifyError> {
    let valid = !resource.is_empty()
        && resource
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(config_error(format!("invalid resource name '{}'", resource)))
    }
}

fn config_error(message: impl Into<String>) -> VerifyError {
    VerifyError::ConfigError {
        message: message.into(),
    }
}
