//! Shared fixtures: a throwaway issuer, signed QR payloads and an
//! in-process trust gateway.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use ciborium::value::Value;
use hcert_crypto::{ClassicalSigner, P256Signer};
use hcert_verify_core::{
    encode_envelope, encode_record, CertificateEngine, CertificateEntry, CertificateRecord,
    CwtClaims, FixedClock, HolderName, TestEntry, TrustGateway, VaccinationEntry, VerifyConfig,
    VerifyError,
};
use image::{GrayImage, ImageFormat, Luma};
use qrcode::{Color, QrCode};

pub const COVID19: &str = "840539006";
pub const NEGATIVE: &str = "260415000";
pub const PCR: &str = "LP6464-4";

/// Document signer with a self-signed P-256 certificate.
pub struct Issuer {
    pub kid: Vec<u8>,
    pub certificate_der: Vec<u8>,
    signer: P256Signer,
}

impl Issuer {
    /// Signer valid through 2021 and 2022.
    pub fn new(kid: &[u8]) -> Self {
        Self::valid_between(kid, (2021, 1, 1), (2023, 1, 1))
    }

    pub fn valid_between(kid: &[u8], from: (i32, u8, u8), until: (i32, u8, u8)) -> Self {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["dsc.test".to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Test Document Signer");
        params.not_before = rcgen::date_time_ymd(from.0, from.1, from.2);
        params.not_after = rcgen::date_time_ymd(until.0, until.1, until.2);
        let cert = params.self_signed(&key_pair).unwrap();

        Self {
            kid: kid.to_vec(),
            certificate_der: cert.der().to_vec(),
            signer: P256Signer::from_pkcs8_der(&key_pair.serialize_der()).unwrap(),
        }
    }

    /// `HC1:` payload carrying `record`, signed with ES256.
    pub fn sign(&self, record: &CertificateRecord) -> String {
        self.sign_with_alg(record, -7)
    }

    pub fn sign_with_alg(&self, record: &CertificateRecord, alg: i64) -> String {
        let protected = cbor(&Value::Map(vec![
            (Value::Integer(1.into()), Value::Integer(alg.into())),
            (Value::Integer(4.into()), Value::Bytes(self.kid.clone())),
        ]));
        let payload = encode_record(record).unwrap();
        let to_be_signed = cbor(&Value::Array(vec![
            Value::Text("Signature1".into()),
            Value::Bytes(protected.clone()),
            Value::Bytes(Vec::new()),
            Value::Bytes(payload.clone()),
        ]));
        let signature = self.signer.sign(&to_be_signed).unwrap();

        let cose = cbor(&Value::Tag(
            18,
            Box::new(Value::Array(vec![
                Value::Bytes(protected),
                Value::Map(Vec::new()),
                Value::Bytes(payload),
                Value::Bytes(signature),
            ])),
        ));
        encode_envelope("HC1:", &cose).unwrap()
    }
}

fn cbor(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).unwrap();
    out
}

/// Trust list body in the gateway format: `{"c": [{"i": kid, "c": der}]}`.
pub fn trust_list(issuers: &[&Issuer]) -> Vec<u8> {
    let entries = issuers
        .iter()
        .map(|issuer| {
            Value::Map(vec![
                (Value::Text("i".into()), Value::Bytes(issuer.kid.clone())),
                (Value::Text("c".into()), Value::Bytes(issuer.certificate_der.clone())),
            ])
        })
        .collect();
    cbor(&Value::Map(vec![(Value::Text("c".into()), Value::Array(entries))]))
}

fn name(given: &str, family: &str) -> HolderName {
    HolderName {
        given: Some(given.to_string()),
        family: Some(family.to_string()),
        given_std: Some(given.to_uppercase()),
        family_std: Some(family.to_uppercase()),
    }
}

fn claims() -> CwtClaims {
    CwtClaims {
        issuer: Some("AT".into()),
        issued_at: Some(utc("2021-08-02T00:00:00Z")),
        expires_at: Some(utc("2022-08-02T00:00:00Z")),
    }
}

pub fn vaccination(given: &str, family: &str, dn: u32, sd: u32, date: &str) -> CertificateRecord {
    CertificateRecord {
        name: name(given, family),
        date_of_birth: Some("1990-01-01".into()),
        version: Some("1.3.0".into()),
        claims: claims(),
        entry: CertificateEntry::Vaccination(VaccinationEntry {
            disease: COVID19.into(),
            vaccine: Some("1119349007".into()),
            product: Some("EU/1/20/1528".into()),
            manufacturer: Some("ORG-100030215".into()),
            dose_number: dn,
            total_doses: sd,
            date: date.parse::<NaiveDate>().unwrap(),
            country: Some("AT".into()),
            issuer: Some("Ministry of Health".into()),
            certificate_id: Some("URN:UVCI:01:AT:TESTV".into()),
        }),
    }
}

pub fn test(given: &str, family: &str, result: &str, collected: &str) -> CertificateRecord {
    CertificateRecord {
        name: name(given, family),
        date_of_birth: Some("1990-01-01".into()),
        version: Some("1.3.0".into()),
        claims: claims(),
        entry: CertificateEntry::Test(TestEntry {
            disease: COVID19.into(),
            test_type: Some(PCR.into()),
            test_name: Some("PCR".into()),
            device: None,
            sample_collected: utc(collected),
            result: result.into(),
            test_center: Some("Teststrasse".into()),
            country: Some("AT".into()),
            issuer: Some("Ministry of Health".into()),
            certificate_id: Some("URN:UVCI:01:AT:TESTT".into()),
        }),
    }
}

pub fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// Naive UTC event start, `YYYY-MM-DDTHH:MM`.
pub fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M").unwrap()
}

/// QR code for `data`, `scale` pixels per module with a 4-module quiet zone.
pub fn qr_frame(data: &[u8], scale: u32) -> GrayImage {
    let code = QrCode::new(data).unwrap();
    let width = code.width() as u32;
    let quiet = 4;
    let size = (width + 2 * quiet) * scale;
    let mut img = GrayImage::from_pixel(size, size, Luma([255]));
    for (i, color) in code.to_colors().iter().enumerate() {
        if *color == Color::Dark {
            let mx = (i as u32 % width + quiet) * scale;
            let my = (i as u32 / width + quiet) * scale;
            for dy in 0..scale {
                for dx in 0..scale {
                    img.put_pixel(mx + dx, my + dy, Luma([0]));
                }
            }
        }
    }
    img
}

pub fn qr_png(data: &[u8]) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    qr_frame(data, 4).write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Single-page PDF with the QR code drawn as a raw grayscale image.
pub fn qr_pdf(data: &[u8]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    let frame = qr_frame(data, 4);
    let (w, h) = frame.dimensions();

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(w),
            "Height" => i64::from(h),
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8i64,
        },
        frame.into_raw(),
    ));
    let resources_id = doc.add_object(dictionary! {
        "XObject" => dictionary! { "Im0" => image_id },
    });

    let n = |v: i64| Object::Integer(v);
    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new("cm", vec![n(216), n(0), n(0), n(216), n(42), n(42)]),
            Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1i64,
            "MediaBox" => vec![n(0), n(0), n(300), n(300)],
        }),
    );
    let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

/// In-process gateway serving one body for every resource.
pub struct FakeGateway {
    body: Mutex<Result<Vec<u8>, String>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeGateway {
    pub fn serving(body: Vec<u8>) -> Self {
        Self {
            body: Mutex::new(Ok(body)),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn offline() -> Self {
        Self {
            body: Mutex::new(Err("connection refused".into())),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Hold every fetch for `delay` before answering.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_offline(&self) {
        *self.body.lock().unwrap() = Err("connection refused".into());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TrustGateway for FakeGateway {
    fn fetch(&self, resource: &str) -> Result<Vec<u8>, VerifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.body
            .lock()
            .unwrap()
            .clone()
            .map_err(|reason| VerifyError::TrustGatewayUnreachable {
                resource: resource.to_string(),
                reason,
            })
    }
}

/// Clock pinned to 2021-09-01T08:00Z.
pub fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2021, 9, 1, 8, 0, 0).unwrap()))
}

pub fn engine_with(
    config: VerifyConfig,
    gateway: Arc<FakeGateway>,
    clock: Arc<FixedClock>,
) -> CertificateEngine {
    CertificateEngine::with_collaborators(config, gateway, clock).unwrap()
}

/// Engine trusting `issuers`, clock from [`clock`].
pub fn engine(issuers: &[&Issuer]) -> CertificateEngine {
    engine_with(
        VerifyConfig::default(),
        Arc::new(FakeGateway::serving(trust_list(issuers))),
        clock(),
    )
}
