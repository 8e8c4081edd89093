//! Property-based tests for decoding and admission rules.
//!
//! These tests check that records survive the full text encoding, that
//! malformed input always ends in a typed error, and that the admission
//! arithmetic holds across the whole input range.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use hcert_verify_core::base45;
use hcert_verify_core::{
    CertificateEntry, CertificateKind, CertificateRecord, CwtClaims, EnvelopeDecoder, HealthGroup,
    HolderName, PolicyValidator, TestEntry, VaccinationEntry, Validity, VerifyError,
};
use proptest::prelude::*;

use crate::fixtures::{self, at, Issuer, NEGATIVE};

fn issuer() -> &'static Issuer {
    static ISSUER: OnceLock<Issuer> = OnceLock::new();
    ISSUER.get_or_init(|| Issuer::new(&[0x42; 8]))
}

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 1, 1).unwrap()
}

fn text(pattern: &'static str) -> impl Strategy<Value = Option<String>> {
    proptest::option::of(pattern)
}

/// Whole seconds between 2020 and 2025; CWT timestamps carry no fraction.
fn instant() -> impl Strategy<Value = DateTime<Utc>> {
    (1_577_836_800i64..1_735_689_600).prop_map(|secs| DateTime::from_timestamp(secs, 0).unwrap())
}

fn holder_name() -> impl Strategy<Value = HolderName> {
    (
        text("[A-Z][a-z]{0,10}"),
        text("[A-Z][a-z]{0,14}( [A-Z][a-z]{1,8})?"),
        text("[A-Z]{1,10}"),
        text("[A-Z]{1,14}(<[A-Z]{1,8})?"),
    )
        .prop_map(|(given, family, given_std, family_std)| HolderName {
            given,
            family,
            given_std,
            family_std,
        })
}

fn vaccination_entry() -> impl Strategy<Value = CertificateEntry> {
    (
        0i64..1500,
        1u32..4,
        1u32..4,
        text("EU/1/2[01]/[0-9]{4}"),
        text("ORG-[0-9]{9}"),
        text("[A-Z]{2}"),
        text("URN:UVCI:01:[A-Z]{2}:[0-9A-F]{8}#[0-9]"),
    )
        .prop_map(|(days, dn, sd, product, manufacturer, country, certificate_id)| {
            CertificateEntry::Vaccination(VaccinationEntry {
                disease: fixtures::COVID19.into(),
                vaccine: Some("1119349007".into()),
                product,
                manufacturer,
                dose_number: dn,
                total_doses: sd,
                date: base_date() + Duration::days(days),
                country,
                issuer: Some("Ministry of Health".into()),
                certificate_id,
            })
        })
}

fn test_entry() -> impl Strategy<Value = CertificateEntry> {
    (
        instant(),
        prop_oneof![Just(NEGATIVE), Just("260373001")],
        text("LP(6464-4|217198-3)"),
        text("[A-Za-z ]{1,20}"),
        text("[0-9]{4}"),
        text("[A-Za-z ]{1,24}"),
        text("[A-Z]{2}"),
    )
        .prop_map(|(collected, result, test_type, test_name, device, test_center, country)| {
            CertificateEntry::Test(TestEntry {
                disease: fixtures::COVID19.into(),
                test_type,
                test_name,
                device,
                sample_collected: collected,
                result: result.into(),
                test_center,
                country,
                issuer: None,
                certificate_id: Some("URN:UVCI:01:AT:TEST#1".into()),
            })
        })
}

fn certificate_record() -> impl Strategy<Value = CertificateRecord> {
    (
        holder_name(),
        text("19[0-9]{2}(-0[1-9](-1[0-9])?)?"),
        text("1\\.[0-3]\\.0"),
        text("[A-Z]{2}"),
        proptest::option::of(instant()),
        proptest::option::of(instant()),
        prop_oneof![vaccination_entry(), test_entry()],
    )
        .prop_map(|(name, date_of_birth, version, issuer, issued_at, expires_at, entry)| {
            CertificateRecord {
                name,
                date_of_birth,
                version,
                claims: CwtClaims {
                    issuer,
                    issued_at,
                    expires_at,
                },
                entry,
            }
        })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    // ========================================================================
    // Decoding
    // ========================================================================

    /// Base45 decoding inverts encoding for any byte string.
    #[test]
    fn base45_inverts_encoding(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let text = base45::encode(&data);
        prop_assert_eq!(text.len(), data.len() / 2 * 3 + data.len() % 2 * 2);
        prop_assert_eq!(base45::decode(text.as_bytes()).unwrap(), data);
    }

    /// A record signed into `HC1:` text decodes back to itself.
    #[test]
    fn record_survives_text_encoding(record in certificate_record()) {
        let kind = match record.entry.group() {
            HealthGroup::Test => CertificateKind::Test,
            _ => CertificateKind::Vaccination,
        };
        let payload = issuer().sign(&record);
        prop_assert!(payload.starts_with("HC1:"));

        let (message, decoded) = fixtures::engine(&[]).decode(payload.as_bytes(), kind).unwrap();
        prop_assert_eq!(message.key_id.as_bytes(), issuer().kid.as_slice());
        prop_assert_eq!(decoded, record);
    }

    /// Arbitrary prefixed text never panics the envelope decoder.
    #[test]
    fn envelope_rejects_garbage(body in "[0-9A-Z $%*+./:-]{0,200}") {
        let payload = format!("HC1:{}", body);
        let result = EnvelopeDecoder::default().decode(payload.as_bytes());
        prop_assert!(matches!(
            result,
            Err(VerifyError::Base45DecodeError(_))
                | Err(VerifyError::MalformedEnvelope { .. })
                | Err(VerifyError::BadPrefix { .. })
        ), "unexpected envelope decode result");
    }

    /// Any other prefix is refused in strict mode.
    #[test]
    fn envelope_requires_prefix(prefix in "[A-Z]{2}[0-9]:", body in "[0-9A-Z]{0,40}") {
        prop_assume!(prefix != "HC1:");
        let payload = format!("{}{}", prefix, body);
        let result = EnvelopeDecoder::default().decode(payload.as_bytes());
        prop_assert!(
            matches!(result, Err(VerifyError::BadPrefix { .. })),
            "expected BadPrefix, got {:?}",
            result
        );
    }

    // ========================================================================
    // Admission rules
    // ========================================================================

    /// Completed two-dose series stay valid for exactly 270 days.
    #[test]
    fn two_dose_validity_is_270_days(offset in 0i64..400) {
        let day = base_date() + Duration::days(offset);
        let record = fixtures::vaccination("Erika", "Mustermann", 2, 2, &day.to_string());
        let entry = record.vaccination().unwrap();
        let valid_until = PolicyValidator::default().vaccination_valid_until(entry).unwrap();
        prop_assert_eq!(valid_until, day + Duration::days(270));
    }

    /// Single-dose series never outlast the cutoff date.
    #[test]
    fn single_dose_never_exceeds_cutoff(offset in 0i64..400) {
        let day = base_date() + Duration::days(offset);
        let record = fixtures::vaccination("Erika", "Mustermann", 1, 1, &day.to_string());
        let entry = record.vaccination().unwrap();
        let validator = PolicyValidator::default();
        let valid_until = validator.vaccination_valid_until(entry).unwrap();
        prop_assert!(valid_until <= validator.rules().single_dose_cutoff);
        prop_assert!(valid_until <= day + Duration::days(270));
    }

    /// A negative PCR is admitted exactly when it was taken no more than
    /// 18 hours before the event.
    #[test]
    fn pcr_admitted_within_18_hours(minutes_before in 0i64..(72 * 60)) {
        let event = at("2021-09-01T10:00");
        let mut record = fixtures::test("Erika", "Mustermann", NEGATIVE, "2021-09-01T00:00:00Z");
        if let CertificateEntry::Test(entry) = &mut record.entry {
            entry.sample_collected = (event - Duration::minutes(minutes_before)).and_utc();
        }

        let result = PolicyValidator::default().validate_test(&record, event);
        if minutes_before <= 18 * 60 {
            let clearance = result.unwrap();
            prop_assert_eq!(clearance.valid_until, event - Duration::minutes(minutes_before) + Duration::hours(48));
        } else {
            prop_assert!(
                matches!(result, Err(VerifyError::TestExpiresBeforeEvent { .. })),
                "expected TestExpiresBeforeEvent, got {:?}",
                result
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 16,
        ..ProptestConfig::default()
    })]

    // ========================================================================
    // Full pipeline
    // ========================================================================

    /// Whatever the holder is called, a signed certificate verifies and
    /// reports the standardized name.
    #[test]
    fn signed_certificate_reports_holder(
        given in "[A-Z][a-z]{1,12}",
        family in "[A-Z][a-z]{1,16}",
        offset in 0i64..200,
    ) {
        let day = base_date() + Duration::days(offset);
        let payload = issuer().sign(&fixtures::vaccination(&given, &family, 2, 2, &day.to_string()));
        let engine = fixtures::engine(&[issuer()]);

        let verified = engine
            .verify_payload(payload.as_bytes(), CertificateKind::Vaccination, at("2021-09-01T10:00"))
            .unwrap();
        prop_assert_eq!(
            verified.holder_name,
            format!("{} {}", given.to_uppercase(), family.to_uppercase())
        );
        prop_assert_eq!(
            verified.validity,
            Validity::VaccinatedUntil(day + Duration::days(270))
        );
    }
}
