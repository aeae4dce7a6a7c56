//! The per-client federation session.
//!
//! A session is an immutable value: every transition returns a new
//! instance, and the current value round-trips through the session codec
//! on each request. The variant structure encodes the state invariants
//! directly — the authorization nonce exists only while authorizing, and a
//! token response exists only once authorized.

use crate::token::TokenResponse;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Login progress for one client, as carried in the session cookie.
///
/// Lifecycle: `New` → `Authorizing` (login redirect issued) → `Authorized`
/// (code exchanged). Refresh keeps the session authorized with new token
/// values; logout or an unrecoverable refresh failure drops back to `New`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OAuth2Session {
    /// No login in progress.
    New {
        /// The filter base path this session belongs to.
        client_endpoint: String,
    },
    /// An authorization redirect has been issued; awaiting the callback.
    Authorizing {
        client_endpoint: String,
        /// Name of the registration the redirect was issued for.
        registration_name: String,
        /// Per-attempt random nonce; its hash travels in the `state`
        /// parameter for CSRF protection.
        nonce: String,
    },
    /// The code (or a refresh token) has been exchanged successfully.
    Authorized {
        client_endpoint: String,
        registration_name: String,
        token_response: TokenResponse,
        /// Absolute access token expiry, derived from `expires_in` at
        /// exchange time.
        expires_at: Option<DateTime<Utc>>,
    },
}

impl OAuth2Session {
    /// Creates a fresh session with no login in progress.
    #[must_use]
    pub fn state_new(client_endpoint: impl Into<String>) -> Self {
        Self::New {
            client_endpoint: client_endpoint.into(),
        }
    }

    /// Transitions to `Authorizing` with the given registration and nonce.
    ///
    /// Valid from any state: starting a new login attempt abandons
    /// whatever progress the previous value captured.
    #[must_use]
    pub fn state_authorizing(&self, registration_name: &str, nonce: String) -> Self {
        Self::Authorizing {
            client_endpoint: self.client_endpoint().to_string(),
            registration_name: registration_name.to_string(),
            nonce,
        }
    }

    /// Transitions to `Authorized` after a successful code exchange.
    ///
    /// Returns `None` unless the session is currently authorizing: there
    /// is no registration to bind the tokens to otherwise.
    #[must_use]
    pub fn state_authorized(&self, token_response: TokenResponse) -> Option<Self> {
        match self {
            Self::Authorizing {
                client_endpoint,
                registration_name,
                ..
            } => Some(Self::Authorized {
                client_endpoint: client_endpoint.clone(),
                registration_name: registration_name.clone(),
                expires_at: expiry_of(&token_response),
                token_response,
            }),
            _ => None,
        }
    }

    /// Transitions an authorized session to a refreshed one.
    ///
    /// The refresh response is overlaid on the previous one so that fields
    /// the authorization server omitted (commonly `refresh_token` and
    /// `id_token`) are retained. Returns `None` when not authorized.
    #[must_use]
    pub fn state_refreshed(&self, refresh_response: &TokenResponse) -> Option<Self> {
        match self {
            Self::Authorized {
                client_endpoint,
                registration_name,
                token_response,
                ..
            } => {
                let merged = token_response.merged_with(refresh_response);
                Some(Self::Authorized {
                    client_endpoint: client_endpoint.clone(),
                    registration_name: registration_name.clone(),
                    expires_at: expiry_of(&merged),
                    token_response: merged,
                })
            }
            _ => None,
        }
    }

    /// Returns true while an authorization redirect is outstanding.
    #[must_use]
    pub fn is_authorizing(&self) -> bool {
        matches!(self, Self::Authorizing { .. })
    }

    /// Returns true once tokens have been obtained.
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized { .. })
    }

    /// Returns the filter base path this session was created under.
    #[must_use]
    pub fn client_endpoint(&self) -> &str {
        match self {
            Self::New { client_endpoint }
            | Self::Authorizing {
                client_endpoint, ..
            }
            | Self::Authorized {
                client_endpoint, ..
            } => client_endpoint,
        }
    }

    /// Returns the registration this session is bound to, if any.
    #[must_use]
    pub fn registration_name(&self) -> Option<&str> {
        match self {
            Self::New { .. } => None,
            Self::Authorizing {
                registration_name, ..
            }
            | Self::Authorized {
                registration_name, ..
            } => Some(registration_name),
        }
    }

    /// Returns the outstanding authorization nonce, present only while
    /// authorizing.
    #[must_use]
    pub fn authorization_nonce(&self) -> Option<&str> {
        match self {
            Self::Authorizing { nonce, .. } => Some(nonce),
            _ => None,
        }
    }

    /// Returns the token response, present only once authorized.
    #[must_use]
    pub fn token_response(&self) -> Option<&TokenResponse> {
        match self {
            Self::Authorized { token_response, .. } => Some(token_response),
            _ => None,
        }
    }

    /// Returns the current access token, if authorized.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.token_response().and_then(TokenResponse::access_token)
    }

    /// Returns the refresh token, if one was granted.
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.token_response().and_then(TokenResponse::refresh_token)
    }

    /// Returns the remaining access token lifetime in whole seconds.
    ///
    /// Already-elapsed lifetimes report as zero rather than negative.
    #[must_use]
    pub fn expires_in(&self) -> Option<i64> {
        match self {
            Self::Authorized {
                expires_at: Some(expires_at),
                ..
            } => Some((*expires_at - Utc::now()).num_seconds().max(0)),
            _ => None,
        }
    }

    /// Returns the granted scopes, if authorized.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.token_response()
            .map(TokenResponse::scopes)
            .unwrap_or_default()
    }
}

fn expiry_of(token_response: &TokenResponse) -> Option<DateTime<Utc>> {
    token_response
        .expires_in()
        .map(|seconds| Utc::now() + Duration::seconds(seconds))
}
