//! # hcert-verify-core
//!
//! Core verification logic for digital health certificates: turns an
//! uploaded image or PDF into a verified holder identity, or a typed reason
//! why admission is refused.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   CertificateEngine                         │
//! │                                                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │   acquire    │─▶│      qr      │─▶│   envelope   │       │
//! │  │ (raster/PDF) │  │   (rqrr)     │  │ HC1/b45/zlib │       │
//! │  └──────────────┘  └──────────────┘  └──────────────┘       │
//! │                                             │               │
//! │                           ┌─────────────────┴───┐           │
//! │                           ▼                     ▼           │
//! │  ┌──────────────────────────────┐  ┌──────────────────┐     │
//! │  │      SignatureVerifier       │  │      record      │     │
//! │  │  (ES256 over Sig_structure)  │  │  (CWT / -260)    │     │
//! │  └──────────────────────────────┘  └──────────────────┘     │
//! │                 │                           │               │
//! │                 ▼                           ▼               │
//! │  ┌──────────────────────────────┐  ┌──────────────────┐     │
//! │  │ TrustStore ◀── TrustGateway  │  │  PolicyValidator │     │
//! │  │ (12h TTL, single-flight)     │  │ (vaccine / test) │     │
//! │  └──────────────────────────────┘  └──────────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Properties
//!
//! - **Fail-closed**: only ES256 is accepted; policy runs after the
//!   signature gate, never before
//! - **Injected time and transport**: [`Clock`] and [`TrustGateway`] are
//!   collaborators, so the whole pipeline runs deterministically in tests
//! - **One fetch per resource**: concurrent callers share a trust refresh

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::doc_markdown)] // Allow product names without backticks
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::missing_panics_doc)] // Panic documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod acquire;
pub mod base45;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod holder;
pub mod https;
pub mod policy;
pub mod qr;
pub mod record;
pub mod signature;
pub mod trust;
pub mod types;

pub use acquire::{acquire_frame, DocumentKind};
pub use base45::Base45Error;
pub use cache::ResourceCache;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{EntrySelection, PolicyRules, StalePolicy, VerifyConfig};
pub use engine::CertificateEngine;
pub use envelope::{encode_envelope, EnvelopeDecoder, SignedMessage};
pub use error::{ErrorCategory, VerifyError};
pub use holder::{reconcile, HolderRecord};
pub use https::{HttpsGateway, TrustGateway};
pub use policy::{PolicyValidator, TestClearance, VaccinationClearance};
pub use qr::{extract_payload, QrScan};
pub use record::{
    decode_record, encode_record, CertificateEntry, CertificateRecord, CwtClaims, HolderName,
    RecoveryEntry, TestEntry, VaccinationEntry,
};
pub use signature::{verify_with_anchor, SignatureVerifier};
pub use trust::{AnchorKey, TrustAnchor, TrustStore, TrustStoreSnapshot};
pub use types::{
    CertificateKind, HealthGroup, KeyId, Validity, VerificationResult, VerifiedCertificate,
};
