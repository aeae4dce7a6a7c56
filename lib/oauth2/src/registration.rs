//! Client registrations: per-provider configuration and the repository
//! that resolves them.
//!
//! A registration is immutable after construction. The repository enforces
//! name uniqueness and exposes the "sole registration is the implicit
//! default" rule; whether a chooser page is mandatory is checked once when
//! the filter is built, never per request.

use crate::error::ConfigurationError;
use serde::Deserialize;

/// Endpoints of an authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Issuer {
    /// Where end-users are sent to authorize.
    authorization_endpoint: String,
    /// Where authorization codes and refresh tokens are exchanged.
    token_endpoint: String,
    /// Where profile claims can be fetched, when the provider offers one.
    #[serde(default)]
    user_info_endpoint: Option<String>,
}

impl Issuer {
    /// Creates an issuer from its endpoints.
    #[must_use]
    pub fn new(
        authorization_endpoint: String,
        token_endpoint: String,
        user_info_endpoint: Option<String>,
    ) -> Self {
        Self {
            authorization_endpoint,
            token_endpoint,
            user_info_endpoint,
        }
    }

    /// Returns the authorization endpoint URL.
    #[must_use]
    pub fn authorization_endpoint(&self) -> &str {
        &self.authorization_endpoint
    }

    /// Returns the token endpoint URL.
    #[must_use]
    pub fn token_endpoint(&self) -> &str {
        &self.token_endpoint
    }

    /// Returns the user-info endpoint URL, if the provider has one.
    #[must_use]
    pub fn user_info_endpoint(&self) -> Option<&str> {
        self.user_info_endpoint.as_deref()
    }
}

/// How the client authenticates against the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    /// HTTP Basic authentication (RFC 6749 section 2.3.1, recommended).
    #[default]
    ClientSecretBasic,
    /// Credentials in the form body.
    ClientSecretPost,
}

/// Configuration for one OAuth 2.0 / OpenID Connect provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientRegistration {
    name: String,
    client_id: String,
    client_secret: String,
    issuer: Issuer,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    redirect_uris: Vec<String>,
    #[serde(default)]
    token_endpoint_auth_method: TokenEndpointAuthMethod,
}

impl ClientRegistration {
    /// Creates a registration with the default (Basic) token endpoint
    /// authentication.
    #[must_use]
    pub fn new(
        name: String,
        client_id: String,
        client_secret: String,
        issuer: Issuer,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            name,
            client_id,
            client_secret,
            issuer,
            scopes,
            redirect_uris: Vec::new(),
            token_endpoint_auth_method: TokenEndpointAuthMethod::default(),
        }
    }

    /// Sets the registered redirect URIs.
    #[must_use]
    pub fn with_redirect_uris(mut self, redirect_uris: Vec<String>) -> Self {
        self.redirect_uris = redirect_uris;
        self
    }

    /// Sets the token endpoint authentication method.
    #[must_use]
    pub fn with_token_endpoint_auth_method(mut self, method: TokenEndpointAuthMethod) -> Self {
        self.token_endpoint_auth_method = method;
        self
    }

    /// Returns the registration name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the OAuth 2.0 client ID.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the OAuth 2.0 client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Returns the authorization server endpoints.
    #[must_use]
    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    /// Returns the scopes requested at authorization time.
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Returns the registered redirect URIs.
    #[must_use]
    pub fn redirect_uris(&self) -> &[String] {
        &self.redirect_uris
    }

    /// Returns the token endpoint authentication method.
    #[must_use]
    pub fn token_endpoint_auth_method(&self) -> TokenEndpointAuthMethod {
        self.token_endpoint_auth_method
    }
}

/// Ordered collection of client registrations with unique names.
#[derive(Debug, Clone)]
pub struct ClientRegistrationRepository {
    registrations: Vec<ClientRegistration>,
}

impl ClientRegistrationRepository {
    /// Creates a repository, rejecting duplicate registration names.
    pub fn new(
        registrations: Vec<ClientRegistration>,
    ) -> Result<Self, ConfigurationError> {
        for (index, registration) in registrations.iter().enumerate() {
            if registrations[..index]
                .iter()
                .any(|other| other.name() == registration.name())
            {
                return Err(ConfigurationError::DuplicateRegistration {
                    name: registration.name().to_string(),
                });
            }
        }
        Ok(Self { registrations })
    }

    /// Resolves a registration by name.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&ClientRegistration> {
        self.registrations.iter().find(|r| r.name() == name)
    }

    /// Returns the implicit default: the sole registration, when exactly
    /// one is configured.
    #[must_use]
    pub fn find_default(&self) -> Option<&ClientRegistration> {
        match self.registrations.as_slice() {
            [single] => Some(single),
            _ => None,
        }
    }

    /// Returns true when a chooser page is required: zero or multiple
    /// registrations leave no implicit default to redirect to.
    #[must_use]
    pub fn needs_chooser(&self) -> bool {
        self.registrations.len() != 1
    }

    /// Returns all registrations in configuration order.
    #[must_use]
    pub fn registrations(&self) -> &[ClientRegistration] {
        &self.registrations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(name: &str) -> ClientRegistration {
        ClientRegistration::new(
            name.to_string(),
            format!("{name}-client-id"),
            "secret".to_string(),
            Issuer::new(
                "https://as.example.com/authorize".to_string(),
                "https://as.example.com/token".to_string(),
                Some("https://as.example.com/userinfo".to_string()),
            ),
            vec!["openid".to_string(), "profile".to_string()],
        )
    }

    #[test]
    fn sole_registration_is_the_default() {
        let repo = ClientRegistrationRepository::new(vec![registration("openam")])
            .expect("valid repository");

        assert!(!repo.needs_chooser());
        assert_eq!(repo.find_default().map(ClientRegistration::name), Some("openam"));
    }

    #[test]
    fn multiple_registrations_have_no_default() {
        let repo =
            ClientRegistrationRepository::new(vec![registration("openam"), registration("google")])
                .expect("valid repository");

        assert!(repo.needs_chooser());
        assert!(repo.find_default().is_none());
        assert!(repo.find_by_name("google").is_some());
        assert!(repo.find_by_name("linkedin").is_none());
    }

    #[test]
    fn empty_repository_needs_chooser() {
        let repo = ClientRegistrationRepository::new(Vec::new()).expect("valid repository");
        assert!(repo.needs_chooser());
        assert!(repo.find_default().is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result =
            ClientRegistrationRepository::new(vec![registration("openam"), registration("openam")]);

        assert_eq!(
            result.err(),
            Some(ConfigurationError::DuplicateRegistration {
                name: "openam".to_string()
            })
        );
    }

    #[test]
    fn registration_deserializes_from_config() {
        let registration: ClientRegistration = serde_json::from_str(
            r#"{
                "name": "google",
                "client_id": "id",
                "client_secret": "secret",
                "issuer": {
                    "authorization_endpoint": "https://accounts.google.com/o/oauth2/v2/auth",
                    "token_endpoint": "https://oauth2.googleapis.com/token"
                },
                "scopes": ["openid", "email"],
                "token_endpoint_auth_method": "client_secret_post"
            }"#,
        )
        .expect("deserialize");

        assert_eq!(registration.name(), "google");
        assert_eq!(
            registration.token_endpoint_auth_method(),
            TokenEndpointAuthMethod::ClientSecretPost
        );
        assert!(registration.issuer().user_info_endpoint().is_none());
    }

    #[test]
    fn auth_method_defaults_to_basic() {
        let registration = registration("openam");
        assert_eq!(
            registration.token_endpoint_auth_method(),
            TokenEndpointAuthMethod::ClientSecretBasic
        );
    }
}
