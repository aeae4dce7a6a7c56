//! Loading and saving the federation session on the client.
//!
//! The filter only talks to the [`SessionCodec`] trait; the cookie-backed
//! implementation here stores the session as base64url-encoded JSON.
//! Payload encryption is a deployment concern layered on top of (or
//! substituted for) this codec, not part of the filter core.

use crate::session::OAuth2Session;
use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, header};
use axum_extra::extract::cookie::{Cookie, SameSite};
use base64::Engine;
use time::Duration;

/// Round-trips the session between the request and the response.
pub trait SessionCodec: Send + Sync {
    /// Loads the session carried by the request.
    ///
    /// Returns `None` when no session is present or it cannot be decoded;
    /// the caller treats both as a fresh `New` session.
    fn load(&self, request: &Request<Body>) -> Option<OAuth2Session>;

    /// Persists the session onto the outgoing response.
    ///
    /// Must be called after the response has been built: the codec writes
    /// cookies onto it.
    fn save(&self, response: &mut Response<Body>, session: &OAuth2Session);

    /// Removes the persisted session, if any, via the outgoing response.
    fn remove(&self, request: &Request<Body>, response: &mut Response<Body>);
}

/// Cookie-backed session codec.
#[derive(Debug, Clone)]
pub struct CookieSessionCodec {
    cookie_name: String,
    secure: bool,
}

impl CookieSessionCodec {
    /// Creates a codec using the given cookie name.
    ///
    /// `secure` controls the cookie's Secure flag; disable it only for
    /// local HTTP development.
    #[must_use]
    pub fn new(cookie_name: impl Into<String>, secure: bool) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            secure,
        }
    }

    fn cookie_value(&self, request: &Request<Body>) -> Option<String> {
        let header = request.headers().get(header::COOKIE)?.to_str().ok()?;
        Cookie::split_parse(header.to_string())
            .filter_map(Result::ok)
            .find(|cookie| cookie.name() == self.cookie_name)
            .map(|cookie| cookie.value().to_string())
    }

    fn append_cookie(response: &mut Response<Body>, cookie: &Cookie<'_>) {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode session cookie header");
            }
        }
    }
}

impl SessionCodec for CookieSessionCodec {
    fn load(&self, request: &Request<Body>) -> Option<OAuth2Session> {
        let value = self.cookie_value(request)?;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(value.as_bytes())
            .ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable session cookie");
                None
            }
        }
    }

    fn save(&self, response: &mut Response<Body>, session: &OAuth2Session) {
        let json = match serde_json::to_vec(session) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize session");
                return;
            }
        };
        let value = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json);
        let cookie = Cookie::build((self.cookie_name.clone(), value))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .build();
        Self::append_cookie(response, &cookie);
    }

    fn remove(&self, request: &Request<Body>, response: &mut Response<Body>) {
        if self.cookie_value(request).is_none() {
            return;
        }
        let cookie = Cookie::build((self.cookie_name.clone(), String::new()))
            .path("/")
            .max_age(Duration::ZERO)
            .build();
        Self::append_cookie(response, &cookie);
    }
}
