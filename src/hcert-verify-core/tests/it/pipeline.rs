//! End-to-end verification: document in, admission decision out.

use chrono::{NaiveDate, Utc};
use hcert_verify_core::{
    reconcile, CertificateEntry, CertificateKind, EntrySelection, HealthGroup, Validity,
    VerifyConfig, VerifyError,
};

use crate::fixtures::{self, at, Issuer, NEGATIVE};

const KID: &[u8] = &[0xd9, 0x19, 0x37, 0x5f, 0xc1, 0xe7, 0xb6, 0xb2];

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

// =============================================================================
// Vaccination
// =============================================================================

#[test]
fn test_vaccination_png_accepted() {
    let issuer = Issuer::new(KID);
    let payload = issuer.sign(&fixtures::vaccination("Erika", "Mustermann", 2, 2, "2021-08-01"));
    let png = fixtures::qr_png(payload.as_bytes());

    let verified = fixtures::engine(&[&issuer])
        .verify(&png, "certificate.png", CertificateKind::Vaccination, at("2021-09-01T10:00"))
        .unwrap();

    assert_eq!(verified.holder_name, "ERIKA MUSTERMANN");
    assert_eq!(verified.kind, CertificateKind::Vaccination);
    assert_eq!(verified.validity, Validity::VaccinatedUntil(date("2022-04-28")));
    assert_eq!(verified.kid.as_bytes(), KID);
    assert_eq!(verified.record.claims.issuer.as_deref(), Some("AT"));
}

#[test]
fn test_vaccination_pdf_accepted() {
    let issuer = Issuer::new(KID);
    let payload = issuer.sign(&fixtures::vaccination("Erika", "Mustermann", 2, 2, "2021-08-01"));
    let pdf = fixtures::qr_pdf(payload.as_bytes());

    let verified = fixtures::engine(&[&issuer])
        .verify(&pdf, "certificate.pdf", CertificateKind::Vaccination, at("2021-09-01T10:00"))
        .unwrap();
    assert_eq!(verified.validity, Validity::VaccinatedUntil(date("2022-04-28")));
}

#[test]
fn test_single_dose_capped_at_cutoff() {
    let issuer = Issuer::new(KID);
    let payload = issuer.sign(&fixtures::vaccination("Erika", "Mustermann", 1, 1, "2021-06-01"));

    let verified = fixtures::engine(&[&issuer])
        .verify_payload(payload.as_bytes(), CertificateKind::Vaccination, at("2021-09-01T10:00"))
        .unwrap();
    assert_eq!(verified.validity, Validity::VaccinatedUntil(date("2022-01-03")));
}

#[test]
fn test_incomplete_series_rejected() {
    let issuer = Issuer::new(KID);
    let payload = issuer.sign(&fixtures::vaccination("Erika", "Mustermann", 1, 2, "2021-08-01"));

    let err = fixtures::engine(&[&issuer])
        .verify_payload(payload.as_bytes(), CertificateKind::Vaccination, at("2021-09-01T10:00"))
        .unwrap_err();
    assert!(matches!(err, VerifyError::NotFullyImmunized { dose_number: 1, total_doses: 2 }));
    assert!(err.is_policy_rejection());
}

#[test]
fn test_expiry_before_event_rejected() {
    let issuer = Issuer::new(KID);
    // Valid until 2022-04-28, event two days later.
    let payload = issuer.sign(&fixtures::vaccination("Erika", "Mustermann", 2, 2, "2021-08-01"));

    let err = fixtures::engine(&[&issuer])
        .verify_payload(payload.as_bytes(), CertificateKind::Vaccination, at("2022-04-30T10:00"))
        .unwrap_err();
    assert!(matches!(err, VerifyError::ExpiresBeforeEvent { .. }));
}

// =============================================================================
// Test certificates
// =============================================================================

#[test]
fn test_pcr_18h_before_event_accepted() {
    let issuer = Issuer::new(KID);
    let payload =
        issuer.sign(&fixtures::test("Erika", "Mustermann", NEGATIVE, "2021-08-31T16:00:00Z"));

    let verified = fixtures::engine(&[&issuer])
        .verify_payload(payload.as_bytes(), CertificateKind::Test, at("2021-09-01T10:00"))
        .unwrap();
    assert_eq!(verified.validity, Validity::TestedUntil(at("2021-09-02T16:00")));
}

#[test]
fn test_pcr_40h_before_event_rejected() {
    let issuer = Issuer::new(KID);
    let payload =
        issuer.sign(&fixtures::test("Erika", "Mustermann", NEGATIVE, "2021-08-30T18:00:00Z"));

    let err = fixtures::engine(&[&issuer])
        .verify_payload(payload.as_bytes(), CertificateKind::Test, at("2021-09-01T10:00"))
        .unwrap_err();
    assert!(matches!(err, VerifyError::TestExpiresBeforeEvent { .. }));
}

#[test]
fn test_positive_result_rejected() {
    let issuer = Issuer::new(KID);
    let payload =
        issuer.sign(&fixtures::test("Erika", "Mustermann", "260373001", "2021-09-01T06:00:00Z"));

    let err = fixtures::engine(&[&issuer])
        .verify_payload(payload.as_bytes(), CertificateKind::Test, at("2021-09-01T10:00"))
        .unwrap_err();
    assert!(matches!(err, VerifyError::TestNotNegative { ref result } if result == "260373001"));
}

#[test]
fn test_collection_time_at_calendar_end_rejected() {
    let issuer = Issuer::new(KID);
    let mut record = fixtures::test("Erika", "Mustermann", NEGATIVE, "2021-08-31T16:00:00Z");
    if let CertificateEntry::Test(entry) = &mut record.entry {
        entry.sample_collected = NaiveDate::MAX.and_hms_opt(23, 0, 0).unwrap().and_utc();
    }
    let payload = issuer.sign(&record);

    let err = fixtures::engine(&[&issuer])
        .verify_payload(payload.as_bytes(), CertificateKind::Test, at("2021-09-01T10:00"))
        .unwrap_err();
    assert!(matches!(err, VerifyError::MalformedEnvelope { stage: "record", .. }));
}

#[test]
fn test_event_at_calendar_end_rejected() {
    let issuer = Issuer::new(KID);
    let payload =
        issuer.sign(&fixtures::test("Erika", "Mustermann", NEGATIVE, "2021-08-31T16:00:00Z"));
    let event = chrono::NaiveDateTime::MAX - chrono::Duration::hours(1);

    let err = fixtures::engine(&[&issuer])
        .verify_payload(payload.as_bytes(), CertificateKind::Test, event)
        .unwrap_err();
    assert!(matches!(err, VerifyError::ConfigError { .. }));
}

// =============================================================================
// Decode and trust failures
// =============================================================================

#[test]
fn test_wrong_kind_reported_before_signature() {
    let issuer = Issuer::new(KID);
    let payload =
        issuer.sign(&fixtures::test("Erika", "Mustermann", NEGATIVE, "2021-08-31T16:00:00Z"));

    // Nobody is trusted; the kind check still comes first.
    let err = fixtures::engine(&[])
        .verify_payload(payload.as_bytes(), CertificateKind::Vaccination, at("2021-09-01T10:00"))
        .unwrap_err();
    match err {
        VerifyError::WrongCertificateKind { expected, present } => {
            assert_eq!(expected, HealthGroup::Vaccination);
            assert_eq!(present, vec![HealthGroup::Test]);
        },
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unknown_signer_rejected() {
    let trusted = Issuer::new(&[0x01; 8]);
    let stranger = Issuer::new(KID);
    let payload = stranger.sign(&fixtures::vaccination("Erika", "Mustermann", 2, 2, "2021-08-01"));

    let err = fixtures::engine(&[&trusted])
        .verify_payload(payload.as_bytes(), CertificateKind::Vaccination, at("2021-09-01T10:00"))
        .unwrap_err();
    assert!(matches!(err, VerifyError::UnknownSigner { ref kid } if kid.as_bytes() == KID));
    assert!(!err.is_trust_failure());
}

#[test]
fn test_forged_kid_rejected() {
    // Same kid as the trusted signer, different key.
    let trusted = Issuer::new(KID);
    let forger = Issuer::new(KID);
    let payload = forger.sign(&fixtures::vaccination("Erika", "Mustermann", 2, 2, "2021-08-01"));

    let err = fixtures::engine(&[&trusted])
        .verify_payload(payload.as_bytes(), CertificateKind::Vaccination, at("2021-09-01T10:00"))
        .unwrap_err();
    assert!(matches!(err, VerifyError::SignatureInvalid { .. }));
}

#[test]
fn test_expired_signer_rejected() {
    let issuer = Issuer::valid_between(KID, (2020, 1, 1), (2021, 6, 1));
    let payload = issuer.sign(&fixtures::vaccination("Erika", "Mustermann", 2, 2, "2021-05-01"));

    let err = fixtures::engine(&[&issuer])
        .verify_payload(payload.as_bytes(), CertificateKind::Vaccination, at("2021-09-01T10:00"))
        .unwrap_err();
    assert!(matches!(err, VerifyError::SignerExpired { .. }));
}

#[test]
fn test_non_es256_rejected() {
    let issuer = Issuer::new(KID);
    let payload = issuer.sign_with_alg(
        &fixtures::vaccination("Erika", "Mustermann", 2, 2, "2021-08-01"),
        -37,
    );

    let err = fixtures::engine(&[&issuer])
        .verify_payload(payload.as_bytes(), CertificateKind::Vaccination, at("2021-09-01T10:00"))
        .unwrap_err();
    assert!(matches!(err, VerifyError::UnsupportedAlgorithm { ref algorithm } if algorithm == "PS256"));
}

#[test]
fn test_document_without_qr_rejected() {
    let blank = {
        let mut out = std::io::Cursor::new(Vec::new());
        image::GrayImage::from_pixel(300, 300, image::Luma([255]))
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    };

    let err = fixtures::engine(&[])
        .verify(&blank, "blank.png", CertificateKind::Test, at("2021-09-01T10:00"))
        .unwrap_err();
    assert!(matches!(err, VerifyError::NoQrCodeFound { .. }));
}

#[test]
fn test_lenient_prefix() {
    let issuer = Issuer::new(KID);
    let payload = issuer.sign(&fixtures::vaccination("Erika", "Mustermann", 2, 2, "2021-08-01"));
    let relabelled = format!("HC9:{}", &payload[4..]);

    let strict = fixtures::engine(&[&issuer])
        .verify_payload(relabelled.as_bytes(), CertificateKind::Vaccination, at("2021-09-01T10:00"))
        .unwrap_err();
    assert!(matches!(strict, VerifyError::BadPrefix { .. }));

    let config = VerifyConfig {
        validate_prefix: false,
        entry_selection: EntrySelection::HighestDose,
        ..VerifyConfig::default()
    };
    let lenient = fixtures::engine_with(
        config,
        std::sync::Arc::new(fixtures::FakeGateway::serving(fixtures::trust_list(&[&issuer]))),
        fixtures::clock(),
    );
    assert!(lenient
        .verify_payload(relabelled.as_bytes(), CertificateKind::Vaccination, at("2021-09-01T10:00"))
        .is_ok());
}

// =============================================================================
// Holder reconciliation
// =============================================================================

#[test]
fn test_both_certificates_for_one_holder() {
    let issuer = Issuer::new(KID);
    let engine = fixtures::engine(&[&issuer]);
    let event = at("2021-09-01T10:00");

    let vaccination = engine
        .verify_payload(
            issuer
                .sign(&fixtures::vaccination("Erika", "Mustermann", 2, 2, "2021-08-01"))
                .as_bytes(),
            CertificateKind::Vaccination,
            event,
        )
        .unwrap();
    let test = engine
        .verify_payload(
            issuer
                .sign(&fixtures::test("Erika", "Mustermann", NEGATIVE, "2021-09-01T06:00:00Z"))
                .as_bytes(),
            CertificateKind::Test,
            event,
        )
        .unwrap();
    let other = engine
        .verify_payload(
            issuer
                .sign(&fixtures::test("Max", "Mustermann", NEGATIVE, "2021-09-01T06:00:00Z"))
                .as_bytes(),
            CertificateKind::Test,
            event,
        )
        .unwrap();

    let holder = reconcile(Some(&vaccination), Some(&test), Utc::now()).unwrap();
    assert_eq!(holder.name, "ERIKA MUSTERMANN");
    assert!(holder.is_vaccinated && holder.is_tested);

    let err = reconcile(Some(&vaccination), Some(&other), Utc::now()).unwrap_err();
    assert!(matches!(err, VerifyError::HolderMismatch { .. }));
}
