//! Token endpoint access: authorization-code exchange, refresh, user info.
//!
//! `TokenExchangeClient` is the seam between the filter and the
//! authorization server; `HttpTokenExchangeClient` is the production
//! implementation over [`reqwest`]. Non-2xx responses are translated into
//! the structured [`OAuth2Error`] vocabulary.

use crate::error::{E_SERVER_ERROR, OAuth2Error};
use crate::registration::{ClientRegistration, TokenEndpointAuthMethod};
use async_trait::async_trait;
use axum::http::{StatusCode, header};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The JSON body returned by a token endpoint.
///
/// Kept as the raw mapping (the authorization server may include
/// provider-specific members) with typed accessors for the standard fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenResponse(Map<String, Value>);

impl TokenResponse {
    /// Wraps a raw token endpoint response body.
    #[must_use]
    pub fn new(values: Map<String, Value>) -> Self {
        Self(values)
    }

    /// Returns true if the response carries no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the raw response mapping.
    #[must_use]
    pub fn values(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns the access token, if present.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.str_field("access_token")
    }

    /// Returns the refresh token, if present.
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.str_field("refresh_token")
    }

    /// Returns the raw ID token JWT, if present.
    #[must_use]
    pub fn id_token(&self) -> Option<&str> {
        self.str_field("id_token")
    }

    /// Returns the token type (usually `Bearer`), if present.
    #[must_use]
    pub fn token_type(&self) -> Option<&str> {
        self.str_field("token_type")
    }

    /// Returns the token lifetime in seconds, if present.
    #[must_use]
    pub fn expires_in(&self) -> Option<i64> {
        self.0.get("expires_in").and_then(Value::as_i64)
    }

    /// Returns the granted scopes, parsed from the space-delimited `scope`
    /// member.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.str_field("scope")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Overlays a newer response on this one.
    ///
    /// Refresh responses are allowed to omit `refresh_token` and `id_token`
    /// (RFC 6749 section 6); fields absent from the newer response are
    /// retained from the previous one.
    #[must_use]
    pub fn merged_with(&self, newer: &TokenResponse) -> TokenResponse {
        let mut merged = self.0.clone();
        for (key, value) in &newer.0 {
            merged.insert(key.clone(), value.clone());
        }
        TokenResponse(merged)
    }

    /// Decodes the ID token's claims from the JWT payload segment.
    ///
    /// The signature is not verified here; verification belongs to the
    /// token validation collaborator, not this filter.
    #[must_use]
    pub fn id_token_claims(&self) -> Option<Map<String, Value>> {
        let jwt = self.id_token()?;
        let mut segments = jwt.split('.');
        let payload = match (segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_)) if segments.next().is_none() => payload,
            _ => return None,
        };
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload)
            .ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

/// Access to a provider's token and user-info endpoints.
#[async_trait]
pub trait TokenExchangeClient: Send + Sync {
    /// Exchanges an authorization code for a token response.
    async fn exchange_code(
        &self,
        registration: &ClientRegistration,
        code: &str,
        callback_uri: &str,
    ) -> Result<TokenResponse, OAuth2Error>;

    /// Exchanges a refresh token for a new token response.
    async fn refresh(
        &self,
        registration: &ClientRegistration,
        refresh_token: &str,
    ) -> Result<TokenResponse, OAuth2Error>;

    /// Retrieves the authenticated user's profile claims.
    async fn user_info(
        &self,
        registration: &ClientRegistration,
        access_token: &str,
    ) -> Result<Map<String, Value>, OAuth2Error>;
}

/// Production token client over a shared `reqwest` connection pool.
///
/// Timeouts are the caller's responsibility: configure them on the
/// [`reqwest::Client`] handed in here.
#[derive(Debug, Clone)]
pub struct HttpTokenExchangeClient {
    http: reqwest::Client,
}

impl HttpTokenExchangeClient {
    /// Creates a token client using the given HTTP client.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn token_request(
        &self,
        registration: &ClientRegistration,
        mut form: Vec<(&str, String)>,
        operation: &str,
    ) -> Result<TokenResponse, OAuth2Error> {
        let mut request = self.http.post(registration.issuer().token_endpoint());
        match registration.token_endpoint_auth_method() {
            TokenEndpointAuthMethod::ClientSecretBasic => {
                request = request.basic_auth(
                    registration.client_id(),
                    Some(registration.client_secret()),
                );
            }
            TokenEndpointAuthMethod::ClientSecretPost => {
                form.push(("client_id", registration.client_id().to_string()));
                form.push(("client_secret", registration.client_secret().to_string()));
            }
        }

        let response = request.form(&form).send().await.map_err(|e| {
            OAuth2Error::server_error(format!(
                "failed to contact the authorization server while {operation}: {e}"
            ))
        })?;

        let status = response.status();
        if status.is_success() {
            let body: Map<String, Value> = response.json().await.map_err(|e| {
                OAuth2Error::server_error(format!("malformed token response while {operation}: {e}"))
            })?;
            return Ok(TokenResponse::new(body));
        }

        Err(Self::upstream_error(status, response, operation).await)
    }

    /// Maps a non-2xx authorization server response into an `OAuth2Error`.
    ///
    /// 400 and 401 responses carry an RFC 6749 error body; anything else is
    /// a `server_error`.
    async fn upstream_error(
        status: StatusCode,
        response: reqwest::Response,
        operation: &str,
    ) -> OAuth2Error {
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            if let Ok(body) = response.json::<Map<String, Value>>().await {
                let error = OAuth2Error::from_json(&body);
                if error.error_code().is_some() {
                    return error;
                }
            }
        }
        OAuth2Error::new(E_SERVER_ERROR).with_description(format!(
            "authorization server returned status {status} while {operation}"
        ))
    }
}

#[async_trait]
impl TokenExchangeClient for HttpTokenExchangeClient {
    async fn exchange_code(
        &self,
        registration: &ClientRegistration,
        code: &str,
        callback_uri: &str,
    ) -> Result<TokenResponse, OAuth2Error> {
        let form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("redirect_uri", callback_uri.to_string()),
            ("code", code.to_string()),
        ];
        self.token_request(registration, form, "exchanging the authorization code")
            .await
    }

    async fn refresh(
        &self,
        registration: &ClientRegistration,
        refresh_token: &str,
    ) -> Result<TokenResponse, OAuth2Error> {
        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        self.token_request(registration, form, "refreshing the access token")
            .await
    }

    async fn user_info(
        &self,
        registration: &ClientRegistration,
        access_token: &str,
    ) -> Result<Map<String, Value>, OAuth2Error> {
        let Some(endpoint) = registration.issuer().user_info_endpoint() else {
            return Err(OAuth2Error::server_error(format!(
                "client registration '{}' has no user-info endpoint",
                registration.name()
            )));
        };

        let response = self
            .http
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| {
                OAuth2Error::server_error(format!(
                    "failed to contact the user-info endpoint: {e}"
                ))
            })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<Map<String, Value>>().await.map_err(|e| {
                OAuth2Error::server_error(format!("malformed user-info response: {e}"))
            });
        }

        if status == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(OAuth2Error::parse_bearer_challenge);
            if let Some(error) = challenge {
                if error.error_code().is_some() {
                    return Err(error);
                }
            }
        }

        Err(Self::upstream_error(status, response, "getting the user info").await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::E_INVALID_TOKEN;

    fn response(json: &str) -> TokenResponse {
        TokenResponse::new(serde_json::from_str(json).expect("valid json"))
    }

    #[test]
    fn typed_accessors_read_standard_fields() {
        let tr = response(
            r#"{
                "access_token": "at-1",
                "token_type": "Bearer",
                "expires_in": 3599,
                "refresh_token": "rt-1",
                "scope": "openid profile email"
            }"#,
        );

        assert_eq!(tr.access_token(), Some("at-1"));
        assert_eq!(tr.token_type(), Some("Bearer"));
        assert_eq!(tr.expires_in(), Some(3599));
        assert_eq!(tr.refresh_token(), Some("rt-1"));
        assert_eq!(tr.scopes(), vec!["openid", "profile", "email"]);
    }

    #[test]
    fn merge_keeps_fields_missing_from_refresh_response() {
        let original = response(
            r#"{"access_token": "at-1", "refresh_token": "rt-1", "id_token": "a.b.c"}"#,
        );
        let refreshed = response(r#"{"access_token": "at-2", "expires_in": 60}"#);

        let merged = original.merged_with(&refreshed);
        assert_eq!(merged.access_token(), Some("at-2"));
        assert_eq!(merged.refresh_token(), Some("rt-1"));
        assert_eq!(merged.id_token(), Some("a.b.c"));
        assert_eq!(merged.expires_in(), Some(60));
    }

    #[test]
    fn id_token_claims_decodes_payload_segment() {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(r#"{"sub":"user-1","email":"mouse@example.com"}"#);
        let jwt = format!("eyJhbGciOiJSUzI1NiJ9.{payload}.c2ln");
        let tr = TokenResponse::new(
            serde_json::from_value(serde_json::json!({ "id_token": jwt })).expect("map"),
        );

        let claims = tr.id_token_claims().expect("claims");
        assert_eq!(claims.get("sub"), Some(&Value::String("user-1".into())));
        assert_eq!(
            claims.get("email"),
            Some(&Value::String("mouse@example.com".into()))
        );
    }

    #[test]
    fn id_token_claims_rejects_malformed_jwt() {
        let tr = response(r#"{"id_token": "not-a-jwt"}"#);
        assert!(tr.id_token_claims().is_none());
    }

    #[test]
    fn serde_roundtrip_is_transparent() {
        let tr = response(r#"{"access_token": "at-1", "custom": {"nested": true}}"#);
        let json = serde_json::to_string(&tr).expect("serialize");
        let parsed: TokenResponse = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(tr, parsed);
    }

    #[test]
    fn challenge_error_is_usable_for_refresh_decision() {
        let err = OAuth2Error::parse_bearer_challenge(r#"Bearer error="invalid_token""#)
            .expect("challenge");
        assert!(err.is(E_INVALID_TOKEN));
    }
}
