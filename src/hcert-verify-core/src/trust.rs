//! Trust anchors and the trust store.
//!
//! ```text
//! resolve(resource)
//!   ├─ memory snapshot younger than TTL ──────────────► return
//!   ├─ cold start: persisted file (mtime = fetched-at) ─► memory
//!   └─ per-resource flight lock
//!        ├─ re-check freshness (another caller may have refreshed)
//!        └─ gateway fetch ─┬─ ok ──► replace snapshot wholesale
//!                          └─ err ─► stale snapshot (ServeStale) or error
//! ```
//!
//! A trust list body is CBOR: `{ "c": [ { "i": kid, "c": DER certificate } ] }`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ciborium::value::Value;
use tracing::{debug, info, instrument, warn};
use x509_parser::prelude::*;

use crate::cache::ResourceCache;
use crate::clock::Clock;
use crate::config::{validate_resource_name, StalePolicy, VerifyConfig};
use crate::error::VerifyError;
use crate::https::TrustGateway;
use crate::types::KeyId;

/// OID of `id-ecPublicKey`.
pub const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";

/// OID of the `prime256v1` (P-256) named curve.
pub const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";

/// Public key carried by a trust anchor certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorKey {
    /// P-256 key as an uncompressed SEC1 point (`0x04 || x || y`).
    EcP256 {
        /// Encoded point.
        point: Vec<u8>,
    },
    /// Any other key type, kept so the verifier can name it.
    Unsupported {
        /// Algorithm OID (and curve OID when EC).
        algorithm: String,
    },
}

/// A certificate authorized to sign for one key identifier.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    /// Key identifier the anchor is registered under.
    pub key_id: KeyId,
    /// Raw DER certificate.
    pub certificate_der: Vec<u8>,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
    /// Subject distinguished name.
    pub subject: String,
    /// Subject public key.
    pub key: AnchorKey,
}

impl TrustAnchor {
    /// Parse a DER certificate registered under `key_id`.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse failure.
    pub fn from_der(key_id: KeyId, der: Vec<u8>) -> Result<Self, String> {
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| format!("Failed to parse X.509 certificate: {}", e))?;

        let validity = cert.validity();
        let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or("notBefore out of range")?;
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or("notAfter out of range")?;

        let spki = cert.public_key();
        let algorithm = spki.algorithm.algorithm.to_id_string();
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|p| p.as_oid().ok())
            .map(|oid| oid.to_id_string());
        let point = spki.subject_public_key.data.to_vec();

        let key = if algorithm == OID_EC_PUBLIC_KEY && curve.as_deref() == Some(OID_CURVE_P256) {
            AnchorKey::EcP256 { point }
        } else {
            AnchorKey::Unsupported {
                algorithm: match curve {
                    Some(curve) => format!("{} ({})", algorithm, curve),
                    None => algorithm,
                },
            }
        };

        let subject = cert.subject().to_string();
        Ok(Self {
            key_id,
            certificate_der: der,
            not_before,
            not_after,
            subject,
            key,
        })
    }

    /// Check whether `now` falls inside `[not_before, not_after]`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// Immutable set of anchors from one fetch of one resource.
#[derive(Debug, Clone)]
pub struct TrustStoreSnapshot {
    resource: String,
    fetched_at: DateTime<Utc>,
    anchors: HashMap<KeyId, TrustAnchor>,
    skipped: usize,
}

impl TrustStoreSnapshot {
    /// Snapshot without anchors.
    pub fn empty(resource: &str, fetched_at: DateTime<Utc>) -> Self {
        Self {
            resource: resource.to_string(),
            fetched_at,
            anchors: HashMap::new(),
            skipped: 0,
        }
    }

    /// Decode a trust list body.
    ///
    /// Entries whose certificate cannot be parsed are skipped with a warning;
    /// for duplicate key identifiers the first entry wins.
    ///
    /// # Errors
    ///
    /// Returns `MalformedTrustList` if the body is not CBOR or lacks the
    /// `c` array.
    pub fn from_cbor(
        resource: &str,
        bytes: &[u8],
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, VerifyError> {
        let malformed = |reason: String| VerifyError::MalformedTrustList {
            resource: resource.to_string(),
            reason,
        };

        let root: Value = ciborium::from_reader(bytes).map_err(|e| malformed(e.to_string()))?;
        let Value::Map(root) = root else {
            return Err(malformed("root is not a map".into()));
        };
        let entries = match text_field(&root, "c") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(malformed("missing certificate array 'c'".into())),
        };

        let mut snapshot = Self::empty(resource, fetched_at);
        for (index, entry) in entries.iter().enumerate() {
            let Value::Map(fields) = entry else {
                warn!(resource, index, "Trust list: entry is not a map, skipped");
                snapshot.skipped += 1;
                continue;
            };
            let (Some(Value::Bytes(kid)), Some(Value::Bytes(der))) =
                (text_field(fields, "i"), text_field(fields, "c"))
            else {
                warn!(resource, index, "Trust list: entry lacks 'i'/'c' bytes, skipped");
                snapshot.skipped += 1;
                continue;
            };

            let key_id = KeyId::from(kid.as_slice());
            match TrustAnchor::from_der(key_id.clone(), der.clone()) {
                Ok(anchor) => {
                    if snapshot.anchors.contains_key(&key_id) {
                        debug!(resource, kid = %key_id, "Trust list: duplicate kid ignored");
                        continue;
                    }
                    snapshot.anchors.insert(key_id, anchor);
                },
                Err(e) => {
                    warn!(resource, kid = %key_id, "Trust list: {}, skipped", e);
                    snapshot.skipped += 1;
                },
            }
        }

        info!(
            resource,
            anchors = snapshot.anchors.len(),
            skipped = snapshot.skipped,
            "Trust list: decoded"
        );
        Ok(snapshot)
    }

    /// Resource this snapshot was fetched from.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// When the snapshot was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Anchor registered for `kid`.
    #[must_use]
    pub fn get(&self, kid: &KeyId) -> Option<&TrustAnchor> {
        self.anchors.get(kid)
    }

    /// All anchors, in no particular order.
    pub fn anchors(&self) -> impl Iterator<Item = &TrustAnchor> {
        self.anchors.values()
    }

    /// Number of anchors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Whether the snapshot has no anchors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Entries dropped while decoding.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

fn text_field<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Text(t) if t == key => Some(v),
        _ => None,
    })
}

/// Process-scoped trust store.
///
/// Reads are concurrent; refreshes of one resource are serialized so at
/// most one gateway fetch per resource is in flight.
pub struct TrustStore {
    gateway: Arc<dyn TrustGateway>,
    clock: Arc<dyn Clock>,
    cache: ResourceCache,
    ttl: chrono::Duration,
    stale_policy: StalePolicy,
    trust_list_resource: String,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TrustStore {
    /// Create a trust store from configuration and collaborators.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn new(
        config: &VerifyConfig,
        gateway: Arc<dyn TrustGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, VerifyError> {
        config.validate()?;
        let ttl = chrono::Duration::from_std(config.cache_ttl).map_err(|e| {
            VerifyError::ConfigError {
                message: format!("cache_ttl out of range: {}", e),
            }
        })?;

        Ok(Self {
            gateway,
            clock,
            cache: ResourceCache::new(config.cache_dir.clone()),
            ttl,
            stale_policy: config.stale_policy,
            trust_list_resource: config.trust_list_resource.clone(),
            flights: Mutex::new(HashMap::new()),
        })
    }

    /// Return a snapshot of `resource` no older than the TTL, fetching
    /// if needed.
    ///
    /// # Errors
    ///
    /// - `TrustGatewayUnreachable` / `MalformedTrustList` when the refresh
    ///   fails and no snapshot may be served
    /// - `ConfigError` for invalid resource names
    /// - `CacheError` for poisoned locks
    #[instrument(skip(self))]
    pub fn resolve(&self, resource: &str) -> Result<Arc<TrustStoreSnapshot>, VerifyError> {
        validate_resource_name(resource)?;

        if let Some(snapshot) = self.fresh(resource)? {
            return Ok(snapshot);
        }

        let flight = self.flight(resource)?;
        let _guard = flight.lock().map_err(|_| VerifyError::CacheError {
            message: format!("Refresh lock for '{}' poisoned", resource),
        })?;

        if let Some(snapshot) = self.fresh(resource)? {
            debug!(resource, "Trust store: refreshed by a concurrent caller");
            return Ok(snapshot);
        }

        let stale = self.cache.get(resource);
        match self.fetch(resource) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => match (stale, self.stale_policy) {
                (Some(snapshot), StalePolicy::ServeStale) => {
                    warn!(
                        resource,
                        fetched_at = %snapshot.fetched_at(),
                        error = %e,
                        "Trust store: refresh failed, serving stale snapshot"
                    );
                    Ok(snapshot)
                },
                (Some(_), StalePolicy::FailClosed) => {
                    warn!(resource, error = %e, "Trust store: refresh failed, stale snapshot refused");
                    Err(e)
                },
                (None, _) => Err(e),
            },
        }
    }

    /// Anchor registered for `kid` in the current trust list.
    ///
    /// # Errors
    ///
    /// `UnknownSigner` when no anchor matches, or any [`TrustStore::resolve`]
    /// error.
    pub fn lookup(&self, kid: &KeyId) -> Result<TrustAnchor, VerifyError> {
        let snapshot = self.resolve(&self.trust_list_resource)?;
        snapshot.get(kid).cloned().ok_or_else(|| {
            debug!(kid = %kid, anchors = snapshot.len(), "Trust store: unknown kid");
            VerifyError::UnknownSigner { kid: kid.clone() }
        })
    }

    /// Drop `resource` from memory and storage so the next resolve fetches.
    pub fn invalidate(&self, resource: &str) {
        self.cache.invalidate(resource);
    }

    /// Cached snapshot if it is younger than the TTL. On a memory miss the
    /// persisted copy is loaded into memory (even when stale, so it can be
    /// served on refresh failure).
    fn fresh(&self, resource: &str) -> Result<Option<Arc<TrustStoreSnapshot>>, VerifyError> {
        let snapshot = match self.cache.get(resource) {
            Some(snapshot) => snapshot,
            None => match self.load_persisted(resource)? {
                Some(snapshot) => snapshot,
                None => return Ok(None),
            },
        };

        let age = self.clock.now() - snapshot.fetched_at();
        if age < self.ttl {
            Ok(Some(snapshot))
        } else {
            debug!(resource, age_secs = age.num_seconds(), "Trust store: snapshot stale");
            Ok(None)
        }
    }

    fn load_persisted(
        &self,
        resource: &str,
    ) -> Result<Option<Arc<TrustStoreSnapshot>>, VerifyError> {
        let Some(persisted) = self.cache.load_persisted(resource) else {
            return Ok(None);
        };
        match TrustStoreSnapshot::from_cbor(resource, &persisted.bytes, persisted.fetched_at) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.cache.insert(Arc::clone(&snapshot))?;
                info!(
                    resource,
                    fetched_at = %snapshot.fetched_at(),
                    "Trust store: restored persisted snapshot"
                );
                Ok(Some(snapshot))
            },
            Err(e) => {
                warn!(resource, error = %e, "Trust store: ignoring unreadable cache file");
                Ok(None)
            },
        }
    }

    fn fetch(&self, resource: &str) -> Result<Arc<TrustStoreSnapshot>, VerifyError> {
        let bytes = self.gateway.fetch(resource)?;
        let snapshot = Arc::new(TrustStoreSnapshot::from_cbor(
            resource,
            &bytes,
            self.clock.now(),
        )?);
        self.cache.put(Arc::clone(&snapshot), &bytes)?;
        Ok(snapshot)
    }

    fn flight(&self, resource: &str) -> Result<Arc<Mutex<()>>, VerifyError> {
        let mut flights = self.flights.lock().map_err(|_| VerifyError::CacheError {
            message: "Refresh registry lock poisoned".into(),
        })?;
        Ok(Arc::clone(
            flights.entry(resource.to_string()).or_default(),
        ))
    }
}
