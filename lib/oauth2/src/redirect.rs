//! Building the authorization redirect that starts a login.
//!
//! The `state` parameter carries a SHA-256 hash of a per-attempt random
//! nonce, optionally followed by `:` and the URI to return to after login.
//! The callback compares the hash against the nonce stored in the session,
//! which ties the callback to the browser that started the login. The goto
//! part is plaintext and not integrity-protected; only the hash is checked.

use crate::error::OAuth2Error;
use crate::registration::ClientRegistration;
use crate::session::OAuth2Session;
use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, StatusCode, header};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use url::Url;

/// A built authorization redirect: the 302 to send back and the
/// `Authorizing` session the caller must persist onto it.
pub struct AuthorizationRedirect {
    pub response: Response<Body>,
    pub session: OAuth2Session,
}

/// Generates a fresh random authorization nonce.
#[must_use]
pub fn new_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Hashes an authorization nonce for transport in the `state` parameter.
///
/// SHA-256, base64url without padding. Deterministic so the callback can
/// recompute it from the session's nonce.
#[must_use]
pub fn nonce_hash(nonce: &str) -> String {
    let digest = Sha256::digest(nonce.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Returns the effective scheme of a request, honoring a reverse proxy's
/// `x-forwarded-proto` when the URI itself carries no scheme.
#[must_use]
pub fn request_scheme(request: &Request<Body>) -> &str {
    if let Some(scheme) = request.uri().scheme_str() {
        return scheme;
    }
    request
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http")
}

/// Builds provider authorization redirects for one filter instance.
#[derive(Debug, Clone)]
pub struct AuthorizationRedirectHandler {
    client_endpoint: String,
}

impl AuthorizationRedirectHandler {
    /// Creates a handler rooted at the filter's base path.
    #[must_use]
    pub fn new(client_endpoint: impl Into<String>) -> Self {
        Self {
            client_endpoint: client_endpoint.into(),
        }
    }

    /// Computes the absolute callback URI as seen by the authorization
    /// server, derived from the incoming request's scheme and host.
    pub fn callback_uri(&self, request: &Request<Body>) -> Result<String, OAuth2Error> {
        let host = request
            .uri()
            .authority()
            .map(ToString::to_string)
            .or_else(|| {
                request
                    .headers()
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                OAuth2Error::invalid_request("cannot determine the host of the request")
            })?;
        Ok(format!(
            "{}://{}{}/callback",
            request_scheme(request),
            host,
            self.client_endpoint
        ))
    }

    /// Builds the 302 to the provider's authorization endpoint and the
    /// matching `Authorizing` session.
    ///
    /// The caller is responsible for persisting the returned session onto
    /// the returned response.
    pub fn authorization_redirect(
        &self,
        request: &Request<Body>,
        registration: &ClientRegistration,
        session: &OAuth2Session,
        goto_uri: Option<&str>,
    ) -> Result<AuthorizationRedirect, OAuth2Error> {
        let nonce = new_nonce();
        let mut state = nonce_hash(&nonce);
        if let Some(goto_uri) = goto_uri {
            state.push(':');
            state.push_str(goto_uri);
        }

        let callback_uri = self.callback_uri(request)?;
        let mut url =
            Url::parse(registration.issuer().authorization_endpoint()).map_err(|e| {
                OAuth2Error::server_error(format!(
                    "invalid authorization endpoint for registration '{}': {e}",
                    registration.name()
                ))
            })?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("response_type", "code");
            pairs.append_pair("client_id", registration.client_id());
            pairs.append_pair("redirect_uri", &callback_uri);
            if !registration.scopes().is_empty() {
                pairs.append_pair("scope", &registration.scopes().join(" "));
            }
            pairs.append_pair("state", &state);
        }

        let location = HeaderValue::from_str(url.as_str()).map_err(|e| {
            OAuth2Error::server_error(format!("unencodable authorization redirect: {e}"))
        })?;
        let response = Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .map_err(|e| {
                OAuth2Error::server_error(format!("failed to build the redirect response: {e}"))
            })?;

        Ok(AuthorizationRedirect {
            response,
            session: session.state_authorizing(registration.name(), nonce),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::Issuer;
    use std::collections::HashMap;

    fn registration() -> ClientRegistration {
        ClientRegistration::new(
            "openam".to_string(),
            "gateway-client".to_string(),
            "secret".to_string(),
            Issuer::new(
                "https://as.example.com/authorize".to_string(),
                "https://as.example.com/token".to_string(),
                None,
            ),
            vec!["openid".to_string(), "profile".to_string()],
        )
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, "gateway.example.com")
            .body(Body::empty())
            .expect("request")
    }

    fn location_params(response: &Response<Body>) -> (Url, HashMap<String, String>) {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .expect("location header");
        let url = Url::parse(location).expect("absolute location");
        let params = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        (url, params)
    }

    #[test]
    fn nonce_hash_is_deterministic_and_one_way() {
        assert_eq!(nonce_hash("nonce-1"), nonce_hash("nonce-1"));
        assert_ne!(nonce_hash("nonce-1"), nonce_hash("nonce-2"));
        assert!(!nonce_hash("nonce-1").contains("nonce-1"));
        assert!(!nonce_hash("nonce-1").contains('='));
    }

    #[test]
    fn nonces_are_unique_per_call() {
        assert_ne!(new_nonce(), new_nonce());
    }

    #[test]
    fn redirect_carries_the_standard_parameters() {
        let handler = AuthorizationRedirectHandler::new("/openid");
        let redirect = handler
            .authorization_redirect(
                &request("/app/home"),
                &registration(),
                &OAuth2Session::state_new("/openid"),
                None,
            )
            .expect("redirect");

        assert_eq!(redirect.response.status(), StatusCode::FOUND);
        let (url, params) = location_params(&redirect.response);
        assert_eq!(url.host_str(), Some("as.example.com"));
        assert_eq!(params.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(
            params.get("client_id").map(String::as_str),
            Some("gateway-client")
        );
        assert_eq!(
            params.get("redirect_uri").map(String::as_str),
            Some("http://gateway.example.com/openid/callback")
        );
        assert_eq!(
            params.get("scope").map(String::as_str),
            Some("openid profile")
        );
    }

    #[test]
    fn state_is_the_hash_of_the_session_nonce() {
        let handler = AuthorizationRedirectHandler::new("/openid");
        let redirect = handler
            .authorization_redirect(
                &request("/app/home"),
                &registration(),
                &OAuth2Session::state_new("/openid"),
                None,
            )
            .expect("redirect");

        let (_, params) = location_params(&redirect.response);
        let state = params.get("state").expect("state parameter");
        let nonce = redirect
            .session
            .authorization_nonce()
            .expect("authorizing session");
        assert_eq!(state, &nonce_hash(nonce));
        assert!(redirect.session.is_authorizing());
        assert_eq!(redirect.session.registration_name(), Some("openam"));
    }

    #[test]
    fn goto_is_appended_after_a_colon() {
        let handler = AuthorizationRedirectHandler::new("/openid");
        let redirect = handler
            .authorization_redirect(
                &request("/app/home"),
                &registration(),
                &OAuth2Session::state_new("/openid"),
                Some("/app/home?tab=1"),
            )
            .expect("redirect");

        let (_, params) = location_params(&redirect.response);
        let state = params.get("state").expect("state parameter");
        let (hash, goto_uri) = state.split_once(':').expect("hash and goto");
        let nonce = redirect
            .session
            .authorization_nonce()
            .expect("authorizing session");
        assert_eq!(hash, nonce_hash(nonce));
        assert_eq!(goto_uri, "/app/home?tab=1");
    }

    #[test]
    fn callback_uri_honors_forwarded_proto() {
        let handler = AuthorizationRedirectHandler::new("/openid");
        let request = Request::builder()
            .uri("/app/home")
            .header(header::HOST, "gateway.example.com")
            .header("x-forwarded-proto", "https")
            .body(Body::empty())
            .expect("request");

        assert_eq!(
            handler.callback_uri(&request).expect("callback uri"),
            "https://gateway.example.com/openid/callback"
        );
    }

    #[test]
    fn callback_uri_without_host_is_invalid_request() {
        let handler = AuthorizationRedirectHandler::new("/openid");
        let request = Request::builder()
            .uri("/app/home")
            .body(Body::empty())
            .expect("request");

        let err = handler.callback_uri(&request).expect_err("no host");
        assert!(err.is(crate::error::E_INVALID_REQUEST));
    }
}
