//! Centralized gateway configuration.
//!
//! Strongly-typed configuration loaded via the `config` crate: an optional
//! `gateway` file (any supported format) layered under environment
//! variables with a `__` separator, e.g. `SESSION__COOKIE_NAME`. Client
//! registrations are usually supplied through the file source.

use glowing_turnstile_oauth2::ClientRegistration;
use serde::Deserialize;

/// Gateway configuration.
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    /// Address the gateway listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Base URL of the protected upstream application.
    pub upstream_url: String,

    /// Base path the filter's login/callback/logout endpoints live under.
    #[serde(default = "default_client_endpoint")]
    pub client_endpoint: String,

    /// Timeout for outbound calls to the authorization server and the
    /// upstream, in seconds.
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,

    /// Session cookie configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Delegated-login behavior.
    #[serde(default)]
    pub oauth2: OAuth2Config,

    /// Configured identity providers.
    #[serde(default)]
    pub registrations: Vec<ClientRegistration>,
}

/// Session cookie configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Name of the session cookie.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Whether to set the Secure flag on cookies (requires HTTPS).
    /// Defaults to true for production safety; set to false for local HTTP
    /// development.
    #[serde(default = "default_secure_cookies")]
    pub secure_cookies: bool,
}

/// Delegated-login behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuth2Config {
    /// Whether login and callback requests must arrive over HTTPS.
    #[serde(default = "default_require_https")]
    pub require_https: bool,

    /// Whether unauthorized requests trigger a login instead of passing
    /// through.
    #[serde(default = "default_require_login")]
    pub require_login: bool,

    /// User-info cache lifetime in seconds; 0 disables the cache.
    #[serde(default = "default_cache_expiration_seconds")]
    pub cache_expiration_seconds: u64,

    /// Where the callback sends the browser when the login carried no
    /// return URI.
    #[serde(default)]
    pub default_login_goto: Option<String>,

    /// Where logout sends the browser when the request carried no return
    /// URI.
    #[serde(default)]
    pub default_logout_goto: Option<String>,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_client_endpoint() -> String {
    "/openid".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_cookie_name() -> String {
    "glowing-turnstile-session".to_string()
}

fn default_secure_cookies() -> bool {
    true
}

fn default_require_https() -> bool {
    true
}

fn default_require_login() -> bool {
    true
}

fn default_cache_expiration_seconds() -> u64 {
    20
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            secure_cookies: default_secure_cookies(),
        }
    }
}

impl Default for OAuth2Config {
    fn default() -> Self {
        Self {
            require_https: default_require_https(),
            require_login: default_require_login(),
            cache_expiration_seconds: default_cache_expiration_seconds(),
            default_login_goto: None,
            default_logout_goto: None,
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from the optional `gateway` file and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("gateway").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
