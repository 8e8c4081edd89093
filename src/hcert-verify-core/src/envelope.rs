//! Health certificate envelope decoding.
//!
//! ```text
//! "HC1:" || base45( zlib( COSE_Sign1 ) )
//!
//! COSE_Sign1 = [ protected: bstr, unprotected: map, payload: bstr, signature: bstr ]
//! ```
//!
//! The decoder stops at the COSE layer: the payload stays an opaque CBOR
//! byte string for [`crate::record`], and the whole message is kept intact
//! for signature verification.

use std::io::Read;

use ciborium::value::Value;
use flate2::read::ZlibDecoder;
use tracing::{debug, instrument, warn};

use crate::base45;
use crate::error::VerifyError;
use crate::types::KeyId;

/// CBOR tag for COSE_Sign1 (RFC 9052).
pub const COSE_SIGN1_TAG: u64 = 18;

/// COSE header label for the algorithm.
pub const HEADER_ALG: i64 = 1;

/// COSE header label for the key identifier.
pub const HEADER_KID: i64 = 4;

/// Upper bound on the inflated envelope size.
const MAX_INFLATED_LEN: u64 = 64 * 1024;

/// A decoded COSE_Sign1 message.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedMessage {
    /// Serialized protected header, exactly as signed.
    pub protected_header: Vec<u8>,
    /// Payload bytes (CWT claims).
    pub payload: Vec<u8>,
    /// Raw signature bytes.
    pub signature: Vec<u8>,
    /// Key identifier selecting the trust anchor.
    pub key_id: KeyId,
    /// Declared COSE algorithm, if any.
    pub algorithm: Option<i64>,
}

impl SignedMessage {
    /// Build the `Sig_structure` the signature covers:
    /// `["Signature1", protected, external_aad = h'', payload]`.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEnvelope` if CBOR serialization fails.
    pub fn sig_structure(&self) -> Result<Vec<u8>, VerifyError> {
        let structure = Value::Array(vec![
            Value::Text("Signature1".into()),
            Value::Bytes(self.protected_header.clone()),
            Value::Bytes(Vec::new()),
            Value::Bytes(self.payload.clone()),
        ]);
        let mut out = Vec::new();
        ciborium::into_writer(&structure, &mut out)
            .map_err(|e| VerifyError::malformed("sig_structure", e.to_string()))?;
        Ok(out)
    }
}

/// Decoder for the text envelope down to the signed message.
#[derive(Debug, Clone)]
pub struct EnvelopeDecoder {
    prefix: String,
    validate_prefix: bool,
}

impl EnvelopeDecoder {
    /// Create a decoder for `prefix`.
    ///
    /// With `validate_prefix == false` the first `prefix.len()` bytes are
    /// stripped without looking at them.
    pub fn new(prefix: impl Into<String>, validate_prefix: bool) -> Self {
        Self {
            prefix: prefix.into(),
            validate_prefix,
        }
    }

    /// Decode a raw QR payload into a signed message.
    ///
    /// # Errors
    ///
    /// `BadPrefix`, `Base45DecodeError` or `MalformedEnvelope` depending on
    /// the layer that failed.
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub fn decode(&self, payload: &[u8]) -> Result<SignedMessage, VerifyError> {
        let body = self.strip_prefix(payload)?;
        let compressed = base45::decode(trim_ascii_end(body))?;
        let cose = inflate(&compressed)?;
        debug!(
            compressed_len = compressed.len(),
            inflated_len = cose.len(),
            "Envelope: inflated"
        );
        parse_cose_sign1(&cose)
    }

    fn strip_prefix<'a>(&self, payload: &'a [u8]) -> Result<&'a [u8], VerifyError> {
        let expected = self.prefix.as_bytes();
        if payload.len() < expected.len() {
            return Err(VerifyError::BadPrefix {
                expected: self.prefix.clone(),
                found: String::from_utf8_lossy(payload).into_owned(),
            });
        }
        let (head, rest) = payload.split_at(expected.len());
        if self.validate_prefix && head != expected {
            return Err(VerifyError::BadPrefix {
                expected: self.prefix.clone(),
                found: String::from_utf8_lossy(head).into_owned(),
            });
        }
        Ok(rest)
    }
}

impl Default for EnvelopeDecoder {
    fn default() -> Self {
        Self::new("HC1:", true)
    }
}

/// Encode a signed COSE message into the QR text form.
///
/// Counterpart of [`EnvelopeDecoder::decode`], used to build fixtures and by
/// tooling that re-renders certificates.
///
/// # Errors
///
/// Returns `MalformedEnvelope` if compression fails.
pub fn encode_envelope(prefix: &str, cose: &[u8]) -> Result<String, VerifyError> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(cose)
        .map_err(|e| VerifyError::malformed("deflate", e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| VerifyError::malformed("deflate", e.to_string()))?;
    Ok(format!("{}{}", prefix, base45::encode(&compressed)))
}

fn trim_ascii_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

fn inflate(compressed: &[u8]) -> Result<Vec<u8>, VerifyError> {
    let mut out = Vec::new();
    ZlibDecoder::new(compressed)
        .take(MAX_INFLATED_LEN + 1)
        .read_to_end(&mut out)
        .map_err(|e| VerifyError::malformed("inflate", e.to_string()))?;
    if out.len() as u64 > MAX_INFLATED_LEN {
        return Err(VerifyError::malformed(
            "inflate",
            format!("envelope exceeds {} bytes", MAX_INFLATED_LEN),
        ));
    }
    Ok(out)
}

/// Parse COSE_Sign1 bytes (tagged or untagged).
///
/// # Errors
///
/// Returns `MalformedEnvelope` if the structure is not a 4-element
/// COSE_Sign1 or carries no key identifier.
pub fn parse_cose_sign1(bytes: &[u8]) -> Result<SignedMessage, VerifyError> {
    let value: Value = ciborium::from_reader(bytes)
        .map_err(|e| VerifyError::malformed("cose", e.to_string()))?;

    let value = match value {
        Value::Tag(COSE_SIGN1_TAG, inner) => *inner,
        Value::Tag(tag, _) => {
            return Err(VerifyError::malformed(
                "cose",
                format!("unexpected CBOR tag {}", tag),
            ))
        },
        other => other,
    };

    let Value::Array(items) = value else {
        return Err(VerifyError::malformed("cose", "COSE_Sign1 is not an array"));
    };
    let [protected, unprotected, payload, signature]: [Value; 4] =
        items.try_into().map_err(|items: Vec<Value>| {
            VerifyError::malformed(
                "cose",
                format!("expected 4 elements, found {}", items.len()),
            )
        })?;

    let protected_header = into_bytes(protected, "protected header")?;
    let payload = into_bytes(payload, "payload")?;
    let signature = into_bytes(signature, "signature")?;

    let protected_map = decode_header_map(&protected_header)?;
    let unprotected_map = match unprotected {
        Value::Map(entries) => entries,
        _ => {
            return Err(VerifyError::malformed(
                "cose",
                "unprotected header is not a map",
            ))
        },
    };

    let key_id = match header_bytes(&protected_map, HEADER_KID) {
        Some(kid) => kid,
        None => {
            let kid = header_bytes(&unprotected_map, HEADER_KID)
                .ok_or_else(|| VerifyError::malformed("cose", "no key identifier in headers"))?;
            warn!("Envelope: key identifier taken from unprotected header");
            kid
        },
    };
    let algorithm =
        header_int(&protected_map, HEADER_ALG).or_else(|| header_int(&unprotected_map, HEADER_ALG));

    let message = SignedMessage {
        protected_header,
        payload,
        signature,
        key_id: KeyId::from(key_id),
        algorithm,
    };
    debug!(
        kid = %message.key_id,
        alg = ?message.algorithm,
        payload_len = message.payload.len(),
        "Envelope: COSE_Sign1 decoded"
    );
    Ok(message)
}

fn into_bytes(value: Value, what: &str) -> Result<Vec<u8>, VerifyError> {
    match value {
        Value::Bytes(bytes) => Ok(bytes),
        _ => Err(VerifyError::malformed(
            "cose",
            format!("{} is not a byte string", what),
        )),
    }
}

fn decode_header_map(bytes: &[u8]) -> Result<Vec<(Value, Value)>, VerifyError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    match ciborium::from_reader::<Value, _>(bytes) {
        Ok(Value::Map(entries)) => Ok(entries),
        Ok(_) => Err(VerifyError::malformed(
            "cose",
            "protected header is not a map",
        )),
        Err(e) => Err(VerifyError::malformed("cose", e.to_string())),
    }
}

fn header_value(map: &[(Value, Value)], label: i64) -> Option<&Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if i128::from(*i) == i128::from(label) => Some(v),
        _ => None,
    })
}

fn header_bytes(map: &[(Value, Value)], label: i64) -> Option<Vec<u8>> {
    match header_value(map, label)? {
        Value::Bytes(b) => Some(b.clone()),
        _ => None,
    }
}

fn header_int(map: &[(Value, Value)], label: i64) -> Option<i64> {
    match header_value(map, label)? {
        Value::Integer(i) => i64::try_from(i128::from(*i)).ok(),
        _ => None,
    }
}
