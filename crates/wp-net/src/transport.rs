//! Service transport carrying control messages to the proxy server.

use reqwest::blocking::Client;
use reqwest::header::CACHE_CONTROL;
use reqwest::header::CONTENT_TYPE;
use reqwest::header::PRAGMA;
use std::time::Duration;
use wp_core::ProxyError;
use wp_core::ProxyResult;

const NO_CACHE: &str = "no-cache, no-store, must-revalidate";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response to a delivered control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ServiceResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }
}

/// Blocking POST of a serialized control message.
///
/// `Err` means the request never completed (connect failure, abort,
/// timeout). Any HTTP response, whatever its status, counts as delivered.
pub trait ServiceTransport: Send + Sync + 'static {
    fn post(&self, endpoint: &str, body: &[u8]) -> ProxyResult<ServiceResponse>;
}

/// HTTP transport with cache-suppression headers on every request.
#[derive(Debug, Clone)]
pub struct HttpServiceTransport {
    client: Client,
}

impl HttpServiceTransport {
    pub fn new() -> ProxyResult<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> ProxyResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|error| {
            ProxyError::new(
                "net.transport.client_init_failed",
                format!("failed to build service HTTP client: {error}"),
            )
        })?;

        Ok(Self { client })
    }
}

impl ServiceTransport for HttpServiceTransport {
    fn post(&self, endpoint: &str, body: &[u8]) -> ProxyResult<ServiceResponse> {
        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(CACHE_CONTROL, NO_CACHE)
            .header(PRAGMA, "no-cache")
            .body(body.to_vec())
            .send()
            .map_err(|error| {
                ProxyError::new(
                    "net.transport.send_failed",
                    format!("service request to `{endpoint}` failed: {error}"),
                )
            })?;

        let status = response.status().as_u16();
        let body = response.bytes().map_err(|error| {
            ProxyError::new(
                "net.transport.read_failed",
                format!("failed reading service response from `{endpoint}`: {error}"),
            )
        })?;

        Ok(ServiceResponse {
            status,
            body: body.to_vec(),
        })
    }
}
