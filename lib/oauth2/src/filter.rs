//! The delegated-login filter.
//!
//! Sits in front of a protected application and drives the OAuth 2.0
//! authorization-code flow against a configured provider: it issues the
//! login redirect, services the provider callback, forwards authorized
//! requests with a [`TargetBinding`] attached, refreshes rejected access
//! tokens at most once, and funnels every failure through one handler.
//!
//! Routing under the configured base path, in precedence order:
//! 1. `{base}/login?discovery=...` to the discovery chain (when configured);
//! 2. `{base}/login?registration=NAME` issues the authorization redirect;
//! 3. `{base}/callback` completes the code exchange;
//! 4. `{base}/logout` drops the session;
//! 5. everything else is treated as a protected resource.

use crate::binding::{PendingSessionWrite, TargetBinding, UserInfoHandle};
use crate::cache::UserInfoCache;
use crate::codec::SessionCodec;
use crate::error::{ConfigurationError, E_INVALID_TOKEN, OAuth2Error};
use crate::redirect::{AuthorizationRedirectHandler, nonce_hash, request_scheme};
use crate::registration::{ClientRegistration, ClientRegistrationRepository};
use crate::session::OAuth2Session;
use crate::token::TokenExchangeClient;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{
    HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version, header,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on how much of a request body is buffered for replay.
const MAX_REPLAY_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Default user-info cache lifetime.
const DEFAULT_CACHE_EXPIRATION: Duration = Duration::from_secs(20);

/// An HTTP stage: the downstream application as well as the pluggable
/// failure, chooser, and discovery collaborators.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request<Body>) -> Response<Body>;
}

/// A request whose body has been buffered so it can be sent more than once.
///
/// The refresh-and-retry path forwards the same request twice; streaming
/// bodies cannot be replayed, so the body is drained into memory up front.
struct ReplayableRequest {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl ReplayableRequest {
    async fn buffer(request: Request<Body>) -> Result<Self, OAuth2Error> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_REPLAY_BODY_BYTES)
            .await
            .map_err(|e| {
                OAuth2Error::invalid_request(format!("unable to buffer the request body: {e}"))
            })?;
        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
        })
    }

    fn to_request(&self) -> Request<Body> {
        let mut request = Request::new(Body::from(self.body.clone()));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers.clone();
        request
    }

    fn query_params(&self) -> HashMap<String, String> {
        self.uri
            .query()
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A dispatch failure, together with any session write recorded before the
/// failure surfaced.
///
/// The user-info loader can reset or refresh the session while the
/// downstream stage runs; that write must reach the client even when the
/// downstream response turns into a terminal failure, so it rides along to
/// the failure funnel.
struct FilterFailure {
    error: OAuth2Error,
    pending: Option<PendingSessionWrite>,
}

impl From<OAuth2Error> for FilterFailure {
    fn from(error: OAuth2Error) -> Self {
        Self {
            error,
            pending: None,
        }
    }
}

/// Configures and validates an [`OAuth2ClientFilter`].
pub struct OAuth2ClientFilterBuilder {
    client_endpoint: String,
    registrations: ClientRegistrationRepository,
    token_client: Arc<dyn TokenExchangeClient>,
    session_codec: Arc<dyn SessionCodec>,
    failure_handler: Arc<dyn Handler>,
    login_handler: Option<Arc<dyn Handler>>,
    discovery_handler: Option<Arc<dyn Handler>>,
    default_login_goto: Option<String>,
    default_logout_goto: Option<String>,
    require_https: bool,
    require_login: bool,
    cache_expiration: Duration,
}

impl OAuth2ClientFilterBuilder {
    /// Starts a builder from the required collaborators.
    #[must_use]
    pub fn new(
        client_endpoint: impl Into<String>,
        registrations: ClientRegistrationRepository,
        token_client: Arc<dyn TokenExchangeClient>,
        session_codec: Arc<dyn SessionCodec>,
        failure_handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            client_endpoint: client_endpoint.into(),
            registrations,
            token_client,
            session_codec,
            failure_handler,
            login_handler: None,
            discovery_handler: None,
            default_login_goto: None,
            default_logout_goto: None,
            require_https: true,
            require_login: true,
            cache_expiration: DEFAULT_CACHE_EXPIRATION,
        }
    }

    /// Sets the chooser page shown when no default registration exists.
    #[must_use]
    pub fn login_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.login_handler = Some(handler);
        self
    }

    /// Sets the provider discovery chain.
    #[must_use]
    pub fn discovery_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.discovery_handler = Some(handler);
        self
    }

    /// Sets where the callback redirects when the state carries no goto.
    #[must_use]
    pub fn default_login_goto(mut self, goto_uri: impl Into<String>) -> Self {
        self.default_login_goto = Some(goto_uri.into());
        self
    }

    /// Sets where logout redirects when the request carries no goto.
    #[must_use]
    pub fn default_logout_goto(mut self, goto_uri: impl Into<String>) -> Self {
        self.default_logout_goto = Some(goto_uri.into());
        self
    }

    /// Controls whether login and callback requests must arrive over HTTPS.
    #[must_use]
    pub fn require_https(mut self, require_https: bool) -> Self {
        self.require_https = require_https;
        self
    }

    /// Controls whether unauthorized protected requests trigger a login.
    #[must_use]
    pub fn require_login(mut self, require_login: bool) -> Self {
        self.require_login = require_login;
        self
    }

    /// Sets the user-info cache lifetime; zero disables caching.
    #[must_use]
    pub fn cache_expiration(mut self, cache_expiration: Duration) -> Self {
        self.cache_expiration = cache_expiration;
        self
    }

    /// Validates the configuration and builds the filter.
    ///
    /// Fails when the registration repository has no implicit default and
    /// no login handler is configured to choose one.
    pub fn build(self) -> Result<OAuth2ClientFilter, ConfigurationError> {
        if self.registrations.needs_chooser() && self.login_handler.is_none() {
            return Err(ConfigurationError::ChooserRequired {
                registrations: self.registrations.registrations().len(),
            });
        }
        let user_info_cache = if self.cache_expiration.is_zero() {
            None
        } else {
            Some(Arc::new(UserInfoCache::new(Some(self.cache_expiration))))
        };
        Ok(OAuth2ClientFilter {
            redirect: AuthorizationRedirectHandler::new(self.client_endpoint.clone()),
            client_endpoint: self.client_endpoint,
            registrations: self.registrations,
            token_client: self.token_client,
            session_codec: self.session_codec,
            failure_handler: self.failure_handler,
            login_handler: self.login_handler,
            discovery_handler: self.discovery_handler,
            default_login_goto: self.default_login_goto,
            default_logout_goto: self.default_logout_goto,
            require_https: self.require_https,
            require_login: self.require_login,
            user_info_cache,
        })
    }
}

/// Delegated-login filter in front of a protected application.
pub struct OAuth2ClientFilter {
    client_endpoint: String,
    registrations: ClientRegistrationRepository,
    token_client: Arc<dyn TokenExchangeClient>,
    session_codec: Arc<dyn SessionCodec>,
    failure_handler: Arc<dyn Handler>,
    login_handler: Option<Arc<dyn Handler>>,
    discovery_handler: Option<Arc<dyn Handler>>,
    redirect: AuthorizationRedirectHandler,
    default_login_goto: Option<String>,
    default_logout_goto: Option<String>,
    require_https: bool,
    require_login: bool,
    user_info_cache: Option<Arc<UserInfoCache>>,
}

impl OAuth2ClientFilter {
    /// Starts a builder; see [`OAuth2ClientFilterBuilder`].
    #[must_use]
    pub fn builder(
        client_endpoint: impl Into<String>,
        registrations: ClientRegistrationRepository,
        token_client: Arc<dyn TokenExchangeClient>,
        session_codec: Arc<dyn SessionCodec>,
        failure_handler: Arc<dyn Handler>,
    ) -> OAuth2ClientFilterBuilder {
        OAuth2ClientFilterBuilder::new(
            client_endpoint,
            registrations,
            token_client,
            session_codec,
            failure_handler,
        )
    }

    /// Filters one request, forwarding to `next` where appropriate.
    ///
    /// Every failure on the way is routed through the failure handler; this
    /// method itself always produces a response.
    pub async fn filter(&self, request: Request<Body>, next: &dyn Handler) -> Response<Body> {
        let replay = match ReplayableRequest::buffer(request).await {
            Ok(replay) => replay,
            Err(error) => return self.failure_response(None, error).await,
        };

        match self.dispatch(&replay, next).await {
            Ok(response) => response,
            Err(failure) => {
                // Best-effort: a broken session still gives the failure
                // handler partial context.
                let session = self.session_codec.load(&replay.to_request());
                let mut response = self
                    .failure_response_with(&replay, session, failure.error)
                    .await;
                if let Some(pending) = failure.pending {
                    self.flush_pending(&pending, &mut response);
                }
                response
            }
        }
    }

    async fn dispatch(
        &self,
        replay: &ReplayableRequest,
        next: &dyn Handler,
    ) -> Result<Response<Body>, FilterFailure> {
        let path = replay.uri.path();
        if path == format!("{}/login", self.client_endpoint) {
            let params = replay.query_params();
            if params.contains_key("discovery") {
                return self.handle_discovery(replay).await.map_err(Into::into);
            }
            self.check_https(replay)?;
            return self
                .handle_user_initiated_login(replay, &params)
                .await
                .map_err(Into::into);
        }
        if path == format!("{}/callback", self.client_endpoint) {
            self.check_https(replay)?;
            return self.handle_callback(replay).await.map_err(Into::into);
        }
        if path == format!("{}/logout", self.client_endpoint) {
            return self.handle_logout(replay).map_err(Into::into);
        }
        self.handle_protected_resource(replay, next).await
    }

    fn check_https(&self, replay: &ReplayableRequest) -> Result<(), OAuth2Error> {
        let request = replay.to_request();
        if self.require_https && request_scheme(&request) != "https" {
            return Err(OAuth2Error::invalid_request(
                "HTTPS is required for login and callback requests",
            ));
        }
        Ok(())
    }

    async fn handle_discovery(
        &self,
        replay: &ReplayableRequest,
    ) -> Result<Response<Body>, OAuth2Error> {
        let Some(discovery) = &self.discovery_handler else {
            return Err(OAuth2Error::invalid_request(
                "provider discovery is not configured",
            ));
        };
        Ok(discovery.handle(replay.to_request()).await)
    }

    async fn handle_user_initiated_login(
        &self,
        replay: &ReplayableRequest,
        params: &HashMap<String, String>,
    ) -> Result<Response<Body>, OAuth2Error> {
        let name = params.get("registration").ok_or_else(|| {
            OAuth2Error::invalid_request("login requires a registration parameter")
        })?;
        let registration = self.registrations.find_by_name(name).ok_or_else(|| {
            OAuth2Error::invalid_request(format!("unknown client registration '{name}'"))
        })?;
        let goto_uri = params.get("goto").map(String::as_str);
        self.authorization_redirect(replay, registration, goto_uri)
    }

    /// Issues the provider redirect and persists the authorizing session
    /// onto it.
    fn authorization_redirect(
        &self,
        replay: &ReplayableRequest,
        registration: &ClientRegistration,
        goto_uri: Option<&str>,
    ) -> Result<Response<Body>, OAuth2Error> {
        let request = replay.to_request();
        let session = self.load_or_create(&request);
        let mut redirect =
            self.redirect
                .authorization_redirect(&request, registration, &session, goto_uri)?;
        self.session_codec.save(&mut redirect.response, &redirect.session);
        Ok(redirect.response)
    }

    async fn handle_callback(
        &self,
        replay: &ReplayableRequest,
    ) -> Result<Response<Body>, OAuth2Error> {
        if replay.method != Method::GET {
            return Err(OAuth2Error::invalid_request(
                "the callback only accepts GET requests",
            ));
        }
        let params = replay.query_params();
        let state = params
            .get("state")
            .ok_or_else(|| OAuth2Error::invalid_request("state parameter missing"))?;

        let request = replay.to_request();
        let session = self.load_or_create(&request);
        let Some(nonce) = session.authorization_nonce() else {
            return Err(OAuth2Error::invalid_request(
                "no authorization request is in progress",
            ));
        };

        let (hash, goto_uri) = match state.split_once(':') {
            Some((hash, goto_uri)) => (hash, Some(goto_uri)),
            None => (state.as_str(), None),
        };
        if hash != nonce_hash(nonce) {
            return Err(OAuth2Error::invalid_request(
                "state does not match the authorization request",
            ));
        }

        let Some(code) = params.get("code") else {
            if params.contains_key("error") {
                return Err(OAuth2Error::from_query(&params));
            }
            return Err(OAuth2Error::invalid_request("authorization code required"));
        };

        let name = session.registration_name().unwrap_or_default();
        let registration = self.registrations.find_by_name(name).ok_or_else(|| {
            OAuth2Error::invalid_request(format!("unknown client registration '{name}'"))
        })?;

        let callback_uri = self.redirect.callback_uri(&request)?;
        let token_response = self
            .token_client
            .exchange_code(registration, code, &callback_uri)
            .await?;

        // Build the response first; the session write rides on it.
        let mut response = redirect_or_ok(
            goto_uri.filter(|g| !g.is_empty()),
            self.default_login_goto.as_deref(),
        )?;
        let authorized = session.state_authorized(token_response).ok_or_else(|| {
            OAuth2Error::server_error("session left the authorizing state during the exchange")
        })?;
        self.session_codec.save(&mut response, &authorized);
        tracing::debug!(registration = name, "Authorization code exchange completed");
        Ok(response)
    }

    fn handle_logout(&self, replay: &ReplayableRequest) -> Result<Response<Body>, OAuth2Error> {
        let params = replay.query_params();
        let goto_uri = params.get("goto").map(String::as_str);
        let mut response = redirect_or_ok(
            goto_uri.filter(|g| !g.is_empty()),
            self.default_logout_goto.as_deref(),
        )?;
        self.session_codec.remove(&replay.to_request(), &mut response);
        Ok(response)
    }

    async fn handle_protected_resource(
        &self,
        replay: &ReplayableRequest,
        next: &dyn Handler,
    ) -> Result<Response<Body>, FilterFailure> {
        let session = self.load_or_create(&replay.to_request());

        if !session.is_authorized() {
            if !self.require_login {
                return Ok(next.handle(replay.to_request()).await);
            }
            return match self.registrations.find_default() {
                Some(registration) => self
                    .authorization_redirect(replay, registration, Some(&replay.uri.to_string()))
                    .map_err(Into::into),
                None => match &self.login_handler {
                    Some(chooser) => Ok(chooser.handle(replay.to_request()).await),
                    // Unreachable under build(); kept as an error, not a panic.
                    None => Err(OAuth2Error::server_error(
                        "no default registration and no login handler",
                    )
                    .into()),
                },
            };
        }

        // An unresolvable name still forwards with the binding; it only
        // disables user info and the refresh retry.
        let registration = session
            .registration_name()
            .and_then(|name| self.registrations.find_by_name(name));

        let pending = PendingSessionWrite::new();
        let response = self
            .forward(replay, next, registration, &session, &pending)
            .await;
        self.pass_through_or_refresh(replay, next, registration, &session, &pending, response)
            .await
            .map_err(|error| FilterFailure {
                error,
                pending: Some(pending),
            })
    }

    /// Forwards the request downstream with the target binding attached.
    async fn forward(
        &self,
        replay: &ReplayableRequest,
        next: &dyn Handler,
        registration: Option<&ClientRegistration>,
        session: &OAuth2Session,
        pending: &PendingSessionWrite,
    ) -> Response<Body> {
        let user_info =
            registration.and_then(|r| self.user_info_handle(r, session, pending));
        let binding = TargetBinding::authorized(session, user_info);
        let mut request = replay.to_request();
        request.extensions_mut().insert(binding);
        next.handle(request).await
    }

    /// User info is only offered when the provider exposes an endpoint and
    /// the registration asked for the `openid` scope.
    fn user_info_handle(
        &self,
        registration: &ClientRegistration,
        session: &OAuth2Session,
        pending: &PendingSessionWrite,
    ) -> Option<UserInfoHandle> {
        if registration.issuer().user_info_endpoint().is_none()
            || !registration.scopes().iter().any(|s| s == "openid")
        {
            return None;
        }
        Some(UserInfoHandle::new(
            registration.clone(),
            session.clone(),
            Arc::clone(&self.token_client),
            self.user_info_cache.clone(),
            pending.clone(),
        ))
    }

    /// Inspects the downstream response, refreshing a rejected access token
    /// at most once.
    async fn pass_through_or_refresh(
        &self,
        replay: &ReplayableRequest,
        next: &dyn Handler,
        registration: Option<&ClientRegistration>,
        session: &OAuth2Session,
        pending: &PendingSessionWrite,
        mut response: Response<Body>,
    ) -> Result<Response<Body>, OAuth2Error> {
        let status = response.status();
        if !status.is_client_error() && !status.is_server_error() {
            self.flush_pending(pending, &mut response);
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(OAuth2Error::parse_bearer_challenge);
        let error = challenge.unwrap_or_else(|| {
            OAuth2Error::server_error(format!(
                "the protected resource responded with status {status}"
            ))
        });

        if status != StatusCode::UNAUTHORIZED
            || !error.is(E_INVALID_TOKEN)
            || session.refresh_token().is_none()
        {
            return Err(error);
        }
        let Some(registration) = registration else {
            return Err(error);
        };

        let refresh_token = session
            .refresh_token()
            .ok_or_else(|| OAuth2Error::server_error("refresh token vanished"))?;
        tracing::debug!(
            registration = registration.name(),
            "Access token rejected downstream; attempting refresh"
        );
        let refresh_response = self
            .token_client
            .refresh(registration, refresh_token)
            .await?;
        let refreshed = session.state_refreshed(&refresh_response).ok_or_else(|| {
            OAuth2Error::server_error("session left the authorized state during the refresh")
        })?;
        pending.record(refreshed.clone());

        // One retry; its response passes through uninspected.
        let mut retried = self
            .forward(replay, next, Some(registration), &refreshed, pending)
            .await;
        self.flush_pending(pending, &mut retried);
        Ok(retried)
    }

    /// Flushes a deferred session write (refresh or reset from the
    /// user-info loader) onto the outgoing response.
    fn flush_pending(&self, pending: &PendingSessionWrite, response: &mut Response<Body>) {
        if let Some(session) = pending.take() {
            self.session_codec.save(response, &session);
        }
    }

    fn load_or_create(&self, request: &Request<Body>) -> OAuth2Session {
        self.session_codec
            .load(request)
            .unwrap_or_else(|| OAuth2Session::state_new(&self.client_endpoint))
    }

    async fn failure_response(
        &self,
        session: Option<OAuth2Session>,
        error: OAuth2Error,
    ) -> Response<Body> {
        tracing::error!(error = %error, "Delegated login failed");
        let binding = TargetBinding::failure(session.as_ref(), &error, &error);
        let mut request = Request::new(Body::empty());
        request.extensions_mut().insert(binding);
        self.failure_handler.handle(request).await
    }

    async fn failure_response_with(
        &self,
        replay: &ReplayableRequest,
        session: Option<OAuth2Session>,
        error: OAuth2Error,
    ) -> Response<Body> {
        tracing::error!(
            method = %replay.method,
            uri = %replay.uri,
            error = %error,
            "Delegated login failed"
        );
        let binding = TargetBinding::failure(session.as_ref(), &error, &error);
        let mut request = replay.to_request();
        request.extensions_mut().insert(binding);
        self.failure_handler.handle(request).await
    }
}

/// Builds a 302 to the first available target, or a bare 200 when neither
/// is set.
fn redirect_or_ok(
    goto_uri: Option<&str>,
    default_goto: Option<&str>,
) -> Result<Response<Body>, OAuth2Error> {
    let Some(target) = goto_uri.or(default_goto) else {
        return Ok(Response::new(Body::empty()));
    };
    let location = HeaderValue::from_str(target)
        .map_err(|e| OAuth2Error::invalid_request(format!("unencodable goto URI: {e}")))?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(header::LOCATION, location);
    Ok(response)
}
