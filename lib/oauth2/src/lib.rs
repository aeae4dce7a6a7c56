//! OAuth 2.0 delegated login for the glowing-turnstile gateway.
//!
//! This crate provides:
//!
//! - **`OAuth2ClientFilter`**: drives the authorization-code flow in front
//!   of a protected application (login, callback, logout, token refresh)
//! - **Session state machine**: `OAuth2Session`, round-tripped through a
//!   pluggable [`SessionCodec`]
//! - **Client registrations**: per-provider configuration and resolution
//! - **Token exchange**: [`TokenExchangeClient`] over `reqwest`
//! - **Target binding**: token data and lazily fetched user info exposed to
//!   the downstream stage via request extensions
//!
//! # Example
//!
//! ```no_run
//! use glowing_turnstile_oauth2::{
//!     ClientRegistration, ClientRegistrationRepository, CookieSessionCodec,
//!     HttpTokenExchangeClient, Issuer, OAuth2ClientFilter,
//! };
//! use std::sync::Arc;
//!
//! # fn failure_handler() -> Arc<dyn glowing_turnstile_oauth2::Handler> { unimplemented!() }
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registration = ClientRegistration::new(
//!     "openam".to_string(),
//!     "client-id".to_string(),
//!     "client-secret".to_string(),
//!     Issuer::new(
//!         "https://as.example.com/authorize".to_string(),
//!         "https://as.example.com/token".to_string(),
//!         Some("https://as.example.com/userinfo".to_string()),
//!     ),
//!     vec!["openid".to_string()],
//! );
//!
//! let filter = OAuth2ClientFilter::builder(
//!     "/openid",
//!     ClientRegistrationRepository::new(vec![registration])?,
//!     Arc::new(HttpTokenExchangeClient::new(reqwest::Client::new())),
//!     Arc::new(CookieSessionCodec::new("federation", true)),
//!     failure_handler(),
//! )
//! .build()?;
//! # let _ = filter;
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod cache;
pub mod codec;
pub mod error;
pub mod filter;
pub mod redirect;
pub mod registration;
pub mod session;
pub mod token;

pub use binding::{PendingSessionWrite, TargetBinding, UserInfoHandle};
pub use cache::{SingleFlightCache, UserInfoCache};
pub use codec::{CookieSessionCodec, SessionCodec};
pub use error::{ConfigurationError, OAuth2Error};
pub use filter::{Handler, OAuth2ClientFilter, OAuth2ClientFilterBuilder};
pub use redirect::{AuthorizationRedirect, AuthorizationRedirectHandler, new_nonce, nonce_hash};
pub use registration::{
    ClientRegistration, ClientRegistrationRepository, Issuer, TokenEndpointAuthMethod,
};
pub use session::OAuth2Session;
pub use token::{HttpTokenExchangeClient, TokenExchangeClient, TokenResponse};
