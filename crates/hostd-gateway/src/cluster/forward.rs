//! Proxying of requests to the member that owns the addressed instance.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, Method, Uri};
use axum::response::Response;
use hostd_common::{HostdError, Result};
use tracing::{debug, instrument};

use super::FORWARDED_HEADER;

/// Request headers replayed on the target member.
const REPLAYED_HEADERS: [HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::ACCEPT,
    header::IF_MATCH,
    header::USER_AGENT,
];

/// Response headers that describe the hop rather than the payload.
const HOP_HEADERS: [HeaderName; 3] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
];

#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    node_name: String,
}

impl Forwarder {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), node_name)
    }

    pub fn with_client(client: reqwest::Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }

    /// Replay the request on `address` and relay its response unchanged.
    #[instrument(skip(self, headers, body))]
    pub async fn forward(
        &self,
        address: &str,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response> {
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let url = format!("{}{}", address.trim_end_matches('/'), path);
        debug!("Forwarding {} {} to {}", method, path, address);

        let mut request = self
            .client
            .request(method, &url)
            .header(FORWARDED_HEADER, &self.node_name)
            .body(body);
        for name in REPLAYED_HEADERS.iter() {
            if let Some(value) = headers.get(name) {
                request = request.header(name, value);
            }
        }

        let upstream = request.send().await.map_err(|e| {
            HostdError::internal(format!("Failed to forward request to {address}: {e}"))
        })?;

        let status = upstream.status();
        let upstream_headers = upstream.headers().clone();
        let body = upstream.bytes().await.map_err(|e| {
            HostdError::internal(format!("Failed to read response from {address}: {e}"))
        })?;

        let mut response = Response::builder().status(status);
        for (name, value) in upstream_headers.iter() {
            if !HOP_HEADERS.contains(name) {
                response = response.header(name, value);
            }
        }
        response
            .body(Body::from(body))
            .map_err(|e| HostdError::internal(format!("Failed to relay response: {e}")))
    }
}
