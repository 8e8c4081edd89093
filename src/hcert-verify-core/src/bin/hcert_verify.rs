//! hcert-verify CLI - verify digital health certificates from images or PDFs.
//!
//! Thin wrapper over [`CertificateEngine`]: reads files, prints the verdict,
//! and exits non-zero when admission is refused.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use hcert_verify_core::{
    reconcile, CertificateEngine, CertificateKind, EntrySelection, StalePolicy, TrustStoreSnapshot,
    Validity, VerifiedCertificate, VerifyConfig, VerifyError,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// hcert-verify - digital health certificate verification.
///
/// Decodes the QR code of a vaccination or test certificate, checks its
/// signature against the public trust list, and applies the admission rules
/// for an event.
#[derive(Parser)]
#[command(name = "hcert-verify")]
#[command(version = VERSION)]
#[command(about = "Verify digital health certificates for event admission")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Trust gateway base URL
    #[arg(long, default_value = "https://dgc-trust.qr.gv.at")]
    gateway: String,

    /// Directory for the persisted trust list
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Refuse to verify against a stale trust list when the gateway is down
    #[arg(long)]
    fail_closed: bool,

    /// Strip the payload prefix without checking it
    #[arg(long)]
    lenient_prefix: bool,

    /// Judge the vaccination entry with the highest dose number
    #[arg(long)]
    highest_dose: bool,

    /// Request timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify one certificate file
    Check {
        /// Image (PNG, JPEG, ...) or PDF
        file: PathBuf,

        /// Certificate kind (vaccination, test)
        #[arg(short, long, default_value = "vaccination")]
        kind: CertificateKind,

        /// Event start (UTC), e.g. 2021-09-01T10:00 or 2021-09-01
        #[arg(short, long, value_parser = parse_event)]
        event: NaiveDateTime,
    },

    /// Verify a vaccination and/or test certificate for one holder
    Admit {
        /// Vaccination certificate file
        #[arg(long)]
        vaccination: Option<PathBuf>,

        /// Test certificate file
        #[arg(long)]
        test: Option<PathBuf>,

        /// Event start (UTC)
        #[arg(short, long, value_parser = parse_event)]
        event: NaiveDateTime,
    },

    /// Fetch (or load from cache) the trust list and summarize it
    TrustList {
        /// Resource name on the gateway
        #[arg(long, default_value = "trustlist")]
        resource: String,
    },
}

fn parse_event(s: &str) -> Result<NaiveDateTime, String> {
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(at);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| format!("invalid event time '{}'", s))
}

fn build_config(cli: &Cli) -> VerifyConfig {
    VerifyConfig {
        gateway_url: cli.gateway.clone(),
        timeout: Duration::from_secs(cli.timeout.max(1)),
        cache_dir: cli.cache_dir.clone(),
        stale_policy: if cli.fail_closed {
            StalePolicy::FailClosed
        } else {
            StalePolicy::ServeStale
        },
        validate_prefix: !cli.lenient_prefix,
        entry_selection: if cli.highest_dose {
            EntrySelection::HighestDose
        } else {
            EntrySelection::First
        },
        ..VerifyConfig::default()
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("failed to render JSON: {}", e),
    }
}

fn error_json(error: &VerifyError) -> serde_json::Value {
    json!({
        "kind": error.kind(),
        "category": error.category(),
        "message": error.to_string(),
    })
}

fn describe_validity(validity: &Validity) -> String {
    match validity {
        Validity::VaccinatedUntil(date) => format!("vaccinated until {}", date),
        Validity::TestedUntil(at) => format!("test valid until {} UTC", at),
    }
}

fn verify_file(
    engine: &CertificateEngine,
    path: &Path,
    kind: CertificateKind,
    event: NaiveDateTime,
) -> Result<VerifiedCertificate, VerifyError> {
    let bytes = std::fs::read(path).map_err(|e| VerifyError::UnsupportedInput {
        hint: path.display().to_string(),
        reason: format!("cannot read file: {}", e),
    })?;
    let hint = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    engine.verify(&bytes, &hint, kind, event)
}

fn run_check(
    engine: &CertificateEngine,
    file: &Path,
    kind: CertificateKind,
    event: NaiveDateTime,
    json: bool,
) -> bool {
    let result = verify_file(engine, file, kind, event);
    if json {
        let output = match &result {
            Ok(cert) => json!({ "accepted": true, "certificate": cert, "record": cert.record }),
            Err(e) => json!({ "accepted": false, "error": error_json(e) }),
        };
        print_json(&output);
    } else {
        match &result {
            Ok(cert) => {
                println!("ACCEPTED  {} ({})", cert.holder_name, cert.kind);
                println!("  {}", describe_validity(&cert.validity));
                println!("  signer kid: {}", cert.kid);
            },
            Err(e) => {
                println!("REJECTED  {}", file.display());
                println!("  {}", e);
            },
        }
    }
    result.is_ok()
}

fn run_admit(
    engine: &CertificateEngine,
    vaccination: Option<&Path>,
    test: Option<&Path>,
    event: NaiveDateTime,
    json: bool,
) -> bool {
    let mut failures = Vec::new();
    let mut verify = |path: Option<&Path>, kind| {
        let path = path?;
        match verify_file(engine, path, kind, event) {
            Ok(cert) => Some(cert),
            Err(e) => {
                failures.push((kind, e));
                None
            },
        }
    };
    let vaccinated = verify(vaccination, CertificateKind::Vaccination);
    let tested = verify(test, CertificateKind::Test);

    let holder = if failures.is_empty() {
        reconcile(vaccinated.as_ref(), tested.as_ref(), Utc::now())
    } else {
        Err(VerifyError::NoCertificates)
    };

    if json {
        let output = match &holder {
            Ok(record) => json!({ "accepted": true, "holder": record }),
            Err(e) if failures.is_empty() => json!({ "accepted": false, "error": error_json(e) }),
            Err(_) => json!({
                "accepted": false,
                "errors": failures
                    .iter()
                    .map(|(kind, e)| json!({ "certificate": kind, "error": error_json(e) }))
                    .collect::<Vec<_>>(),
            }),
        };
        print_json(&output);
    } else {
        match &holder {
            Ok(record) => {
                println!("ADMITTED  {}", record.name);
                println!("  vaccinated: {}", record.is_vaccinated);
                println!("  tested:     {}", record.is_tested);
            },
            Err(e) if failures.is_empty() => println!("REFUSED   {}", e),
            Err(_) => {
                for (kind, e) in &failures {
                    println!("REFUSED   {} certificate: {}", kind, e);
                }
            },
        }
    }
    holder.is_ok()
}

fn run_trust_list(engine: &CertificateEngine, resource: &str, json: bool) -> bool {
    let snapshot: Result<Arc<TrustStoreSnapshot>, VerifyError> =
        engine.trust_store().resolve(resource);
    match snapshot {
        Ok(snapshot) => {
            let now = Utc::now();
            let mut anchors: Vec<_> = snapshot.anchors().collect();
            anchors.sort_by(|a, b| a.key_id.cmp(&b.key_id));
            if json {
                let entries: Vec<_> = anchors
                    .iter()
                    .map(|a| {
                        json!({
                            "kid": a.key_id,
                            "kid_hex": a.key_id.to_hex(),
                            "subject": a.subject,
                            "not_before": a.not_before,
                            "not_after": a.not_after,
                            "valid_now": a.is_valid_at(now),
                        })
                    })
                    .collect();
                print_json(&json!({
                    "resource": snapshot.resource(),
                    "fetched_at": snapshot.fetched_at(),
                    "anchors": entries,
                    "skipped": snapshot.skipped(),
                }));
            } else {
                println!(
                    "{}: {} anchors ({} skipped), fetched {}",
                    snapshot.resource(),
                    snapshot.len(),
                    snapshot.skipped(),
                    snapshot.fetched_at()
                );
                for a in anchors {
                    let marker = if a.is_valid_at(now) { " " } else { "!" };
                    println!(
                        "{} {:<16} {} .. {}  {}",
                        marker,
                        a.key_id.to_string(),
                        a.not_before.date_naive(),
                        a.not_after.date_naive(),
                        a.subject
                    );
                }
            }
            true
        },
        Err(e) => {
            if json {
                print_json(&json!({ "error": error_json(&e) }));
            } else {
                println!("Trust list unavailable: {}", e);
            }
            false
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let json_output = cli.format == "json";

    // Logs go to stderr; JSON mode keeps them to errors only. RUST_LOG overrides.
    let level = if json_output {
        tracing::Level::ERROR
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let engine = match CertificateEngine::with_config(build_config(&cli)) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("hcert-verify: {}", e);
            return ExitCode::from(2);
        },
    };

    let ok = match &cli.command {
        Commands::Check { file, kind, event } => {
            run_check(&engine, file, *kind, *event, json_output)
        },
        Commands::Admit {
            vaccination,
            test,
            event,
        } => run_admit(
            &engine,
            vaccination.as_deref(),
            test.as_deref(),
            *event,
            json_output,
        ),
        Commands::TrustList { resource } => run_trust_list(&engine, resource, json_output),
    };

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
