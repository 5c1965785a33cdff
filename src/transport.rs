use crate::error::TransportError;
use http::{HeaderMap, StatusCode};
use std::future::Future;

/// A response as delivered by the HTTP transport
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers (case-insensitive lookup)
    pub headers: HeaderMap,
    /// Raw response body
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Create a response with empty headers and body
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Whether the server rejected the request for exceeding its quota
    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
    }
}

/// Trait that HTTP clients implement to carry requests for the rate limiter.
///
/// The limiter decides *when* a request goes out; the transport decides *how*.
/// Requests must be cloneable because a 429 response sends the same request
/// again on a later window.
///
/// # Example
///
/// ```ignore
/// use gateway_flow::{HttpResponse, Transport, TransportError};
///
/// struct ReqwestTransport {
///     client: reqwest::Client,
/// }
///
/// impl Transport for ReqwestTransport {
///     type Request = reqwest::Request;
///
///     async fn send(&self, request: &Self::Request) -> Result<HttpResponse, TransportError> {
///         let request = request.try_clone().ok_or(TransportError::Request("stream body".into()))?;
///         let response = self.client.execute(request).await
///             .map_err(|e| TransportError::Request(e.to_string()))?;
///         // ... convert into HttpResponse
///     }
/// }
/// ```
pub trait Transport: Send + Sync + 'static {
    /// Outgoing request description
    type Request: Clone + Send + Sync + 'static;

    /// Send a request and wait for its response.
    ///
    /// May be called from any task; the limiter spawns one call per dispatched request.
    fn send(
        &self,
        request: &Self::Request,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}
