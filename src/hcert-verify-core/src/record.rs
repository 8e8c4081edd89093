//! Structured record (CWT claims) decoding.
//!
//! The COSE payload is a CBOR map of CWT claims. The health certificate
//! itself sits under claim `-260`, version key `1`:
//!
//! ```text
//! { 1: iss, 4: exp, 6: iat, -260: { 1: { "ver", "nam", "dob", "v" | "t" | "r": [ entry ] } } }
//! ```
//!
//! Entries are decoded with serde straight from the CBOR value, so field
//! names below follow the published schema through `rename`.

use chrono::{DateTime, NaiveDate, Utc};
use ciborium::value::{Integer, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::EntrySelection;
use crate::error::VerifyError;
use crate::types::HealthGroup;

/// CWT claim key for the health certificate container.
pub const CLAIM_HCERT: i64 = -260;

/// Version key inside the health certificate container.
pub const HCERT_V1: i64 = 1;

const CLAIM_ISS: i64 = 1;
const CLAIM_EXP: i64 = 4;
const CLAIM_IAT: i64 = 6;

/// Registered CWT claims carried next to the certificate.
///
/// Informational only; admission is decided by the entry itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CwtClaims {
    /// Issuing country (`iss`).
    pub issuer: Option<String>,
    /// Issued-at (`iat`).
    pub issued_at: Option<DateTime<Utc>>,
    /// Expiration (`exp`).
    pub expires_at: Option<DateTime<Utc>>,
}

/// Holder name (`nam`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderName {
    /// Given name as printed.
    #[serde(rename = "gn", default, skip_serializing_if = "Option::is_none")]
    pub given: Option<String>,
    /// Family name as printed.
    #[serde(rename = "fn", default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    /// Standardized given name.
    #[serde(rename = "gnt", default, skip_serializing_if = "Option::is_none")]
    pub given_std: Option<String>,
    /// Standardized family name.
    #[serde(rename = "fnt", default, skip_serializing_if = "Option::is_none")]
    pub family_std: Option<String>,
}

impl HolderName {
    /// Canonical holder identity: `given + " " + family`.
    ///
    /// Standardized forms are preferred over printed ones. A missing given
    /// name yields the family name alone.
    #[must_use]
    pub fn full_name(&self) -> String {
        let given = self.given_std.as_deref().or(self.given.as_deref());
        let family = self.family_std.as_deref().or(self.family.as_deref());
        match (given, family) {
            (Some(g), Some(f)) if !g.is_empty() => format!("{} {}", g, f),
            (_, Some(f)) => f.to_string(),
            (Some(g), None) => g.to_string(),
            (None, None) => String::new(),
        }
    }
}

/// One vaccination event (`v[]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaccinationEntry {
    /// Disease or agent targeted.
    #[serde(rename = "tg")]
    pub disease: String,
    /// Vaccine or prophylaxis.
    #[serde(rename = "vp", default, skip_serializing_if = "Option::is_none")]
    pub vaccine: Option<String>,
    /// Medicinal product.
    #[serde(rename = "mp", default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    /// Marketing authorization holder.
    #[serde(rename = "ma", default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Dose number.
    #[serde(rename = "dn")]
    pub dose_number: u32,
    /// Total doses in the series.
    #[serde(rename = "sd")]
    pub total_doses: u32,
    /// Date of vaccination.
    #[serde(rename = "dt")]
    pub date: NaiveDate,
    /// Country of vaccination.
    #[serde(rename = "co", default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Certificate issuer.
    #[serde(rename = "is", default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Unique certificate identifier.
    #[serde(rename = "ci", default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
}

/// One test event (`t[]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntry {
    /// Disease or agent targeted.
    #[serde(rename = "tg")]
    pub disease: String,
    /// Type of test (LOINC).
    #[serde(rename = "tt", default, skip_serializing_if = "Option::is_none")]
    pub test_type: Option<String>,
    /// NAA test name.
    #[serde(rename = "nm", default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    /// RAT test device identifier.
    #[serde(rename = "ma", default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Sample collection time.
    #[serde(rename = "sc")]
    pub sample_collected: DateTime<Utc>,
    /// Test result (SNOMED).
    #[serde(rename = "tr")]
    pub result: String,
    /// Testing centre.
    #[serde(rename = "tc", default, skip_serializing_if = "Option::is_none")]
    pub test_center: Option<String>,
    /// Country of test.
    #[serde(rename = "co", default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Certificate issuer.
    #[serde(rename = "is", default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Unique certificate identifier.
    #[serde(rename = "ci", default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
}

/// One recovery statement (`r[]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEntry {
    /// Disease or agent targeted.
    #[serde(rename = "tg")]
    pub disease: String,
    /// Date of first positive result.
    #[serde(rename = "fr")]
    pub first_positive: NaiveDate,
    /// Certificate valid from.
    #[serde(rename = "df")]
    pub valid_from: NaiveDate,
    /// Certificate valid until.
    #[serde(rename = "du")]
    pub valid_until: NaiveDate,
    /// Country of test.
    #[serde(rename = "co", default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Certificate issuer.
    #[serde(rename = "is", default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Unique certificate identifier.
    #[serde(rename = "ci", default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
}

/// The single entry a record is judged on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "group", rename_all = "snake_case")]
pub enum CertificateEntry {
    /// Vaccination event.
    Vaccination(VaccinationEntry),
    /// Test event.
    Test(TestEntry),
    /// Recovery statement.
    Recovery(RecoveryEntry),
}

impl CertificateEntry {
    /// Group this entry belongs to.
    #[must_use]
    pub fn group(&self) -> HealthGroup {
        match self {
            Self::Vaccination(_) => HealthGroup::Vaccination,
            Self::Test(_) => HealthGroup::Test,
            Self::Recovery(_) => HealthGroup::Recovery,
        }
    }

    /// Disease code of the entry.
    #[must_use]
    pub fn disease(&self) -> &str {
        match self {
            Self::Vaccination(v) => &v.disease,
            Self::Test(t) => &t.disease,
            Self::Recovery(r) => &r.disease,
        }
    }
}

/// Decoded health certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateRecord {
    /// Holder name.
    pub name: HolderName,
    /// Date of birth as printed (may be partial, e.g. `1964` or `1964-08`).
    pub date_of_birth: Option<String>,
    /// Schema version (`ver`).
    pub version: Option<String>,
    /// Registered CWT claims.
    pub claims: CwtClaims,
    /// Selected entry of the expected group.
    pub entry: CertificateEntry,
}

impl CertificateRecord {
    /// Canonical holder identity.
    #[must_use]
    pub fn holder_name(&self) -> String {
        self.name.full_name()
    }

    /// Vaccination entry, if this record was decoded as one.
    #[must_use]
    pub fn vaccination(&self) -> Option<&VaccinationEntry> {
        match &self.entry {
            CertificateEntry::Vaccination(v) => Some(v),
            _ => None,
        }
    }

    /// Test entry, if this record was decoded as one.
    #[must_use]
    pub fn test(&self) -> Option<&TestEntry> {
        match &self.entry {
            CertificateEntry::Test(t) => Some(t),
            _ => None,
        }
    }
}

/// Decode CWT payload bytes into a record for the `expected` group.
///
/// # Errors
///
/// - `MalformedEnvelope` (stage `record`) when the CBOR or the schema is off
/// - `WrongCertificateKind` when the expected group is absent or empty
#[instrument(skip(payload), fields(len = payload.len()))]
pub fn decode_record(
    payload: &[u8],
    expected: HealthGroup,
    selection: EntrySelection,
) -> Result<CertificateRecord, VerifyError> {
    let root: Value =
        ciborium::from_reader(payload).map_err(|e| VerifyError::malformed("record", e.to_string()))?;
    let claims_map = as_map(&root, "claims")?;

    let claims = CwtClaims {
        issuer: int_entry(claims_map, CLAIM_ISS).and_then(|v| v.as_text().map(str::to_owned)),
        issued_at: int_entry(claims_map, CLAIM_IAT).and_then(timestamp),
        expires_at: int_entry(claims_map, CLAIM_EXP).and_then(timestamp),
    };

    let container = int_entry(claims_map, CLAIM_HCERT)
        .ok_or_else(|| VerifyError::malformed("record", "missing health certificate claim (-260)"))?;
    let hcert = int_entry(as_map(container, "hcert")?, HCERT_V1)
        .ok_or_else(|| VerifyError::malformed("record", "missing health certificate version 1"))?;
    let hcert = as_map(hcert, "hcert v1")?;

    let present: Vec<HealthGroup> = HealthGroup::ALL
        .into_iter()
        .filter(|g| matches!(text_entry(hcert, g.key()), Some(Value::Array(a)) if !a.is_empty()))
        .collect();

    let entries = match text_entry(hcert, expected.key()) {
        Some(Value::Array(entries)) if !entries.is_empty() => entries,
        Some(Value::Array(_)) | None => {
            return Err(VerifyError::WrongCertificateKind { expected, present })
        },
        Some(_) => {
            return Err(VerifyError::malformed(
                "record",
                format!("group '{}' is not an array", expected.key()),
            ))
        },
    };

    let entry = select_entry(entries, expected, selection)?;

    let name = match text_entry(hcert, "nam") {
        Some(value) => deserialize::<HolderName>(value, "nam")?,
        None => return Err(VerifyError::malformed("record", "missing holder name (nam)")),
    };

    let record = CertificateRecord {
        name,
        date_of_birth: text_entry(hcert, "dob").and_then(|v| v.as_text().map(str::to_owned)),
        version: text_entry(hcert, "ver").and_then(|v| v.as_text().map(str::to_owned)),
        claims,
        entry,
    };
    debug!(
        group = %expected,
        ?present,
        issuer = ?record.claims.issuer,
        "Record: decoded"
    );
    Ok(record)
}

fn select_entry(
    entries: &[Value],
    group: HealthGroup,
    selection: EntrySelection,
) -> Result<CertificateEntry, VerifyError> {
    match group {
        HealthGroup::Vaccination => {
            let entry = match selection {
                EntrySelection::First => deserialize::<VaccinationEntry>(&entries[0], "v")?,
                EntrySelection::HighestDose => {
                    let mut best: Option<VaccinationEntry> = None;
                    for value in entries {
                        let candidate = deserialize::<VaccinationEntry>(value, "v")?;
                        if best
                            .as_ref()
                            .map_or(true, |b| candidate.dose_number > b.dose_number)
                        {
                            best = Some(candidate);
                        }
                    }
                    best.ok_or_else(|| VerifyError::malformed("record", "empty vaccination group"))?
                },
            };
            Ok(CertificateEntry::Vaccination(entry))
        },
        HealthGroup::Test => Ok(CertificateEntry::Test(deserialize(&entries[0], "t")?)),
        HealthGroup::Recovery => Ok(CertificateEntry::Recovery(deserialize(&entries[0], "r")?)),
    }
}

/// Encode a record back into CWT payload bytes.
///
/// Inverse of [`decode_record`] for the fields the record keeps.
///
/// # Errors
///
/// Returns `MalformedEnvelope` (stage `record`) if serialization fails.
pub fn encode_record(record: &CertificateRecord) -> Result<Vec<u8>, VerifyError> {
    let ser = |e: ciborium::value::Error| VerifyError::malformed("record", e.to_string());

    let entry = match &record.entry {
        CertificateEntry::Vaccination(v) => Value::serialized(v).map_err(ser)?,
        CertificateEntry::Test(t) => Value::serialized(t).map_err(ser)?,
        CertificateEntry::Recovery(r) => Value::serialized(r).map_err(ser)?,
    };

    let mut hcert = Vec::new();
    if let Some(ver) = &record.version {
        hcert.push((Value::Text("ver".into()), Value::Text(ver.clone())));
    }
    hcert.push((Value::Text("nam".into()), Value::serialized(&record.name).map_err(ser)?));
    if let Some(dob) = &record.date_of_birth {
        hcert.push((Value::Text("dob".into()), Value::Text(dob.clone())));
    }
    hcert.push((
        Value::Text(record.entry.group().key().into()),
        Value::Array(vec![entry]),
    ));

    let mut claims = Vec::new();
    if let Some(iss) = &record.claims.issuer {
        claims.push((int(CLAIM_ISS), Value::Text(iss.clone())));
    }
    if let Some(exp) = record.claims.expires_at {
        claims.push((int(CLAIM_EXP), int(exp.timestamp())));
    }
    if let Some(iat) = record.claims.issued_at {
        claims.push((int(CLAIM_IAT), int(iat.timestamp())));
    }
    claims.push((
        int(CLAIM_HCERT),
        Value::Map(vec![(int(HCERT_V1), Value::Map(hcert))]),
    ));

    let mut out = Vec::new();
    ciborium::into_writer(&Value::Map(claims), &mut out)
        .map_err(|e| VerifyError::malformed("record", e.to_string()))?;
    Ok(out)
}

fn int(value: i64) -> Value {
    Value::Integer(Integer::from(value))
}

fn as_map<'a>(value: &'a Value, what: &str) -> Result<&'a [(Value, Value)], VerifyError> {
    match value {
        Value::Map(entries) => Ok(entries),
        _ => Err(VerifyError::malformed(
            "record",
            format!("{} is not a map", what),
        )),
    }
}

fn int_entry(map: &[(Value, Value)], key: i64) -> Option<&Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if i128::from(*i) == i128::from(key) => Some(v),
        _ => None,
    })
}

fn text_entry<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Text(t) if t == key => Some(v),
        _ => None,
    })
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Integer(i) => DateTime::from_timestamp(i64::try_from(i128::from(*i)).ok()?, 0),
        Value::Float(f) if f.is_finite() => DateTime::from_timestamp(*f as i64, 0),
        _ => None,
    }
}

fn deserialize<T: serde::de::DeserializeOwned>(value: &Value, what: &str) -> Result<T, VerifyError> {
    value
        .deserialized()
        .map_err(|e| VerifyError::malformed("record", format!("{}: {}", what, e)))
}
