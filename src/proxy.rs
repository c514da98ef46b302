//! Follower-to-leader write forwarding.
//!
//! Only the leader mutates the shared data directory. The middleware in
//! front of the router passes safe methods through everywhere; on a
//! follower, mutating requests are streamed to the leader and the
//! leader's response is streamed back, without buffering either body.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::errors::ApiError;
use crate::http_server::AppState;
use crate::metrics::Metrics;

/// Streaming HTTP client used to reach the leader. reqwest still speaks
/// `http` 0.2, so names and values are converted at the boundary.
#[derive(Clone, Debug)]
pub struct ForwardClient {
    client: reqwest::Client,
    scheme: &'static str,
}

impl ForwardClient {
    pub fn new(
        scheme: &'static str,
        verify_tls: bool,
        ca_cert: Option<&Path>,
        timeout: Duration,
    ) -> Result<Self, String> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!verify_tls);

        if let Some(path) = ca_cert {
            let pem = std::fs::read(path)
                .map_err(|e| format!("failed to read CA bundle {}: {e}", path.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| format!("invalid CA bundle {}: {e}", path.display()))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| format!("failed to build forwarding client: {e}"))?;
        Ok(Self { client, scheme })
    }

    /// Stream `req` to the leader and stream its response back.
    pub async fn forward(&self, leader_addr: &str, req: Request) -> Result<Response, ApiError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = format!("{}://{}{}", self.scheme, leader_addr, path_and_query);

        let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
            .map_err(|_| ApiError::proxy("unforwardable method"))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in req.headers() {
            // Host comes from the leader URL; hop-by-hop and framing
            // headers are the client's business.
            if matches!(
                name.as_str(),
                "host" | "content-length" | "connection" | "transfer-encoding"
            ) {
                continue;
            }
            let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()) else {
                continue;
            };
            let Ok(value) = reqwest::header::HeaderValue::from_bytes(value.as_bytes()) else {
                continue;
            };
            headers.insert(name, value);
        }

        let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());

        debug!(%url, "forwarding write request to leader");
        let upstream = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!(%url, %e, "forwarding to leader failed");
                ApiError::proxy(format!("failed to reach leader at {leader_addr}: {e}"))
            })?;

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .map_err(|_| ApiError::proxy("leader returned an invalid status"))?;

        let mut response = Response::builder().status(status);
        if let Some(resp_headers) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                if matches!(name.as_str(), "connection" | "transfer-encoding") {
                    continue;
                }
                let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) else {
                    continue;
                };
                let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) else {
                    continue;
                };
                resp_headers.insert(name, value);
            }
        }

        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| ApiError::proxy(format!("failed to relay leader response: {e}")))
    }
}

fn is_safe(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Router middleware implementing the leader/follower write discipline.
pub async fn leader_proxy_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.election.is_leader() || is_safe(req.method()) {
        return next.run(req).await;
    }

    let leader_addr = state.election.leader_addr();
    if leader_addr.is_empty() {
        return ApiError::leader_unknown("no leader is currently known to this follower")
            .into_response();
    }

    Metrics::incr(&state.metrics.proxied_requests);
    match state.forward_client.forward(&leader_addr, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
