//! OAuth 2.0 error vocabulary and startup-time configuration errors.
//!
//! `OAuth2Error` mirrors the RFC 6749 error representation: an error code
//! plus optional realm, scopes, description, and URI. Every per-request
//! failure in this crate is expressed as one of these and funnelled through
//! the filter's single failure path.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// The request is missing a parameter, uses an unsupported parameter, or is
/// otherwise malformed.
pub const E_INVALID_REQUEST: &str = "invalid_request";
/// The access token provided is expired, revoked, malformed, or otherwise
/// invalid.
pub const E_INVALID_TOKEN: &str = "invalid_token";
/// The authorization server encountered an unexpected condition.
pub const E_SERVER_ERROR: &str = "server_error";
/// Client authentication failed.
pub const E_INVALID_CLIENT: &str = "invalid_client";
/// The provided authorization grant is invalid, expired, or revoked.
pub const E_INVALID_GRANT: &str = "invalid_grant";
/// The request requires higher privileges than provided by the access token.
pub const E_INSUFFICIENT_SCOPE: &str = "insufficient_scope";

/// A structured OAuth 2.0 error.
///
/// All fields are optional because provider errors arrive from several
/// shapes: token endpoint JSON bodies, callback query parameters, and
/// `WWW-Authenticate` bearer challenges.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OAuth2Error {
    realm: Option<String>,
    scopes: Vec<String>,
    error: Option<String>,
    description: Option<String>,
    uri: Option<String>,
}

impl OAuth2Error {
    /// Creates an error with the given error code.
    #[must_use]
    pub fn new(error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    /// Creates an `invalid_request` error with a description.
    #[must_use]
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(E_INVALID_REQUEST).with_description(description)
    }

    /// Creates a `server_error` with a description.
    #[must_use]
    pub fn server_error(description: impl Into<String>) -> Self {
        Self::new(E_SERVER_ERROR).with_description(description)
    }

    /// Sets the human-readable description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Parses an error from a token endpoint JSON body.
    ///
    /// Unrecognized fields are ignored; a body without an `error` member
    /// still produces a value (with no code) so that callers can fall back
    /// to a generic error.
    #[must_use]
    pub fn from_json(body: &Map<String, Value>) -> Self {
        let string = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            realm: string("realm"),
            scopes: string("scope")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            error: string("error"),
            description: string("error_description"),
            uri: string("error_uri"),
        }
    }

    /// Parses a provider error object from callback query parameters.
    #[must_use]
    pub fn from_query(params: &HashMap<String, String>) -> Self {
        Self {
            realm: params.get("realm").cloned(),
            scopes: params
                .get("scope")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            error: params.get("error").cloned(),
            description: params.get("error_description").cloned(),
            uri: params.get("error_uri").cloned(),
        }
    }

    /// Parses a `WWW-Authenticate` bearer challenge, e.g.
    /// `Bearer realm="example", error="invalid_token", error_description="..."`.
    ///
    /// Returns `None` when the header does not carry a `Bearer` challenge.
    #[must_use]
    pub fn parse_bearer_challenge(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Bearer")?;
        let mut fields: HashMap<String, String> = HashMap::new();
        for part in split_challenge_params(rest) {
            if let Some((key, value)) = part.split_once('=') {
                let value = value.trim().trim_matches('"');
                fields.insert(key.trim().to_string(), value.to_string());
            }
        }
        Some(Self {
            realm: fields.remove("realm"),
            scopes: fields
                .remove("scope")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            error: fields.remove("error"),
            description: fields.remove("error_description"),
            uri: fields.remove("error_uri"),
        })
    }

    /// Returns true if this error carries the given error code.
    #[must_use]
    pub fn is(&self, code: &str) -> bool {
        self.error.as_deref() == Some(code)
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Returns the human-readable description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Renders the error as the JSON object placed in the failure binding.
    /// Absent fields are omitted.
    #[must_use]
    pub fn to_json(&self) -> Map<String, Value> {
        let mut json = Map::new();
        if let Some(realm) = &self.realm {
            json.insert("realm".to_string(), Value::String(realm.clone()));
        }
        if !self.scopes.is_empty() {
            json.insert(
                "scope".to_string(),
                Value::Array(self.scopes.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(error) = &self.error {
            json.insert("error".to_string(), Value::String(error.clone()));
        }
        if let Some(description) = &self.description {
            json.insert(
                "error_description".to_string(),
                Value::String(description.clone()),
            );
        }
        if let Some(uri) = &self.uri {
            json.insert("error_uri".to_string(), Value::String(uri.clone()));
        }
        json
    }
}

impl fmt::Display for OAuth2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, &self.description) {
            (Some(error), Some(description)) => {
                write!(f, "OAuth 2.0 error '{error}': {description}")
            }
            (Some(error), None) => write!(f, "OAuth 2.0 error '{error}'"),
            (None, Some(description)) => write!(f, "OAuth 2.0 error: {description}"),
            (None, None) => write!(f, "OAuth 2.0 error"),
        }
    }
}

impl std::error::Error for OAuth2Error {}

/// Splits challenge parameters on commas, honoring double-quoted values.
fn split_challenge_params(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Startup-time configuration failures.
///
/// These are raised while constructing the filter, never per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Two registrations share the same name.
    DuplicateRegistration { name: String },
    /// Zero or multiple registrations are configured and no chooser
    /// (login handler) is available to pick one.
    ChooserRequired { registrations: usize },
    /// A registration field failed validation.
    InvalidRegistration { name: String, reason: String },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateRegistration { name } => {
                write!(f, "duplicate client registration '{name}'")
            }
            Self::ChooserRequired { registrations } => {
                write!(
                    f,
                    "a login handler (chooser page) is required when there are {registrations} \
                     client registrations instead of exactly one"
                )
            }
            Self::InvalidRegistration { name, reason } => {
                write!(f, "invalid client registration '{name}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}
