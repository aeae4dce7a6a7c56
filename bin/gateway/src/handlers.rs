//! The gateway's handler implementations: the upstream forwarder, the
//! default failure response, and the registration chooser page.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode, Uri, header};
use glowing_turnstile_oauth2::{Handler, TargetBinding};
use serde_json::{Value, json};
use url::Url;

/// Upper bound on the forwarded request body size.
const MAX_FORWARD_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Headers that describe the connection rather than the message and must
/// not be forwarded (RFC 9110 section 7.6.1).
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_forwardable(name: &HeaderName) -> bool {
    !HOP_BY_HOP.contains(name)
        && name != &header::HOST
        && name != &header::CONTENT_LENGTH
}

/// Forwards filtered requests to the protected upstream application.
///
/// An absolute-path request URI is resolved against the upstream base URL;
/// any path component of the base itself is discarded.
pub struct UpstreamHandler {
    http: reqwest::Client,
    base: Url,
}

impl UpstreamHandler {
    /// Creates a forwarder to the given upstream base URL.
    #[must_use]
    pub fn new(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    fn target_url(&self, uri: &Uri) -> Result<Url, url::ParseError> {
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        self.base.join(path_and_query)
    }

    async fn forward(&self, request: Request<Body>) -> Result<Response<Body>, String> {
        let (parts, body) = request.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_FORWARD_BODY_BYTES)
            .await
            .map_err(|e| format!("unable to read the request body: {e}"))?;
        let url = self
            .target_url(&parts.uri)
            .map_err(|e| format!("unable to build the upstream URL: {e}"))?;

        let mut outbound = self.http.request(parts.method, url);
        for (name, value) in &parts.headers {
            if is_forwardable(name) {
                outbound = outbound.header(name, value);
            }
        }
        let upstream = outbound
            .body(bytes)
            .send()
            .await
            .map_err(|e| format!("upstream request failed: {e}"))?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream
            .bytes()
            .await
            .map_err(|e| format!("unable to read the upstream response: {e}"))?;

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        for (name, value) in &headers {
            if is_forwardable(name) {
                response.headers_mut().append(name, value.clone());
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl Handler for UpstreamHandler {
    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        match self.forward(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Upstream forwarding failed");
                json_response(
                    StatusCode::BAD_GATEWAY,
                    &json!({"error": {"error": "server_error", "error_description": "upstream unavailable"}}),
                )
            }
        }
    }
}

/// Renders delegated-login failures as a JSON 401.
///
/// Only the structured error and the failure detail from the binding are
/// exposed; token material stays inside the gateway.
pub struct FailureResponseHandler;

#[async_trait]
impl Handler for FailureResponseHandler {
    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let binding = request.extensions().get::<TargetBinding>();
        let error = binding
            .and_then(|b| b.get("error"))
            .cloned()
            .unwrap_or_else(|| json!({"error": "server_error"}));
        let mut body = json!({"error": error});
        if let Some(detail) = binding.and_then(|b| b.get("failure_detail")) {
            body["failure_detail"] = detail.clone();
        }
        json_response(StatusCode::UNAUTHORIZED, &body)
    }
}

/// Minimal login chooser listing one link per configured registration.
pub struct RegistrationChooserHandler {
    client_endpoint: String,
    names: Vec<String>,
}

impl RegistrationChooserHandler {
    /// Creates a chooser for the given registration names.
    #[must_use]
    pub fn new(client_endpoint: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            client_endpoint: client_endpoint.into(),
            names,
        }
    }

    fn page(&self) -> String {
        let mut items = String::new();
        for name in &self.names {
            let href = format!(
                "{}/login?registration={}",
                self.client_endpoint,
                url::form_urlencoded::byte_serialize(name.as_bytes()).collect::<String>()
            );
            items.push_str(&format!("<li><a href=\"{href}\">{name}</a></li>\n"));
        }
        format!(
            "<!DOCTYPE html>\n<html><head><title>Sign in</title></head>\n\
             <body><h1>Sign in with</h1>\n<ul>\n{items}</ul></body></html>\n"
        )
    }
}

#[async_trait]
impl Handler for RegistrationChooserHandler {
    async fn handle(&self, _request: Request<Body>) -> Response<Body> {
        let mut response = Response::new(Body::from(self.page()));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response
    }
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
