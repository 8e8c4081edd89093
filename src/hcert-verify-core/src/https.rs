//! Trust gateway client.
//!
//! The gateway serves each trust resource as a raw CBOR body at
//! `GET {base_url}/{resource}`. Transport is blocking `ureq`; the engine is
//! synchronous end to end, so there is no runtime to drive.

use std::io::Read;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::{validate_resource_name, VerifyConfig};
use crate::error::VerifyError;

/// Source of trust resources.
///
/// Implementations perform exactly one attempt per call; retries are a
/// caller decision.
pub trait TrustGateway: Send + Sync {
    /// Fetch the raw bytes of `resource`.
    ///
    /// # Errors
    ///
    /// Returns `TrustGatewayUnreachable` on transport, timeout or status
    /// failures.
    fn fetch(&self, resource: &str) -> Result<Vec<u8>, VerifyError>;
}

/// HTTPS implementation of [`TrustGateway`].
pub struct HttpsGateway {
    agent: ureq::Agent,
    base_url: String,
    max_response_bytes: u64,
}

impl HttpsGateway {
    /// Create a gateway client for `base_url`.
    pub fn new(base_url: &str, timeout: Duration, max_response_bytes: u64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout.min(Duration::from_secs(5)))
            .timeout_read(timeout)
            .timeout(timeout)
            .user_agent(&format!("hcert-verify/{}", env!("CARGO_PKG_VERSION")))
            .build();

        info!(base_url, ?timeout, "Trust gateway: client created");
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_response_bytes,
        }
    }

    /// Create a gateway client from engine configuration.
    pub fn from_config(config: &VerifyConfig) -> Self {
        Self::new(&config.gateway_url, config.timeout, config.max_response_bytes)
    }

    /// Base URL requests are made against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn unreachable(resource: &str, reason: impl Into<String>) -> VerifyError {
        VerifyError::TrustGatewayUnreachable {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}

impl TrustGateway for HttpsGateway {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    fn fetch(&self, resource: &str) -> Result<Vec<u8>, VerifyError> {
        validate_resource_name(resource)?;
        let url = format!("{}/{}", self.base_url, resource);
        debug!("Trust gateway GET: {}", url);

        let response = self.agent.get(&url).call().map_err(|e| {
            if let ureq::Error::Status(code, _) = &e {
                return Self::unreachable(resource, format!("HTTP error: {}", code));
            }
            warn!("Trust gateway GET failed: {} - {}", url, e);
            Self::unreachable(resource, format!("Request failed: {}", e))
        })?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(Self::unreachable(resource, format!("HTTP error: {}", status)));
        }

        let mut body = Vec::new();
        response
            .into_reader()
            .take(self.max_response_bytes + 1)
            .read_to_end(&mut body)
            .map_err(|e| Self::unreachable(resource, format!("Body read failed: {}", e)))?;
        if body.len() as u64 > self.max_response_bytes {
            return Err(Self::unreachable(
                resource,
                format!("Response exceeds {} bytes", self.max_response_bytes),
            ));
        }

        info!(resource, bytes = body.len(), "Trust gateway: fetched");
        Ok(body)
    }
}
