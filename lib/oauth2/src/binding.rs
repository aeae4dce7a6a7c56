//! The values exposed to the protected application.
//!
//! Once a request is authorized, the filter attaches a [`TargetBinding`] to
//! the forwarded request's extensions: the registration name, token data,
//! decoded ID token claims, and a lazy [`UserInfoHandle`]. User info is
//! only fetched when the downstream stage asks for it, and a failed fetch
//! degrades to an empty claim set rather than failing the request.

use crate::cache::UserInfoCache;
use crate::error::{E_INVALID_TOKEN, OAuth2Error};
use crate::registration::ClientRegistration;
use crate::session::OAuth2Session;
use crate::token::TokenExchangeClient;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// A session write that must be flushed onto the outgoing response.
///
/// The user-info loader can refresh the access token (or reset the session
/// after an unrecoverable refresh) while the downstream stage is running.
/// The new session value is recorded here and the filter persists it after
/// the downstream response is available.
#[derive(Clone, Default)]
pub struct PendingSessionWrite(Arc<Mutex<Option<OAuth2Session>>>);

impl PendingSessionWrite {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a session value, replacing any earlier one.
    pub fn record(&self, session: OAuth2Session) {
        let mut slot = match self.0.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(session);
    }

    /// Takes the recorded session, leaving the slot empty.
    #[must_use]
    pub fn take(&self) -> Option<OAuth2Session> {
        let mut slot = match self.0.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take()
    }
}

struct UserInfoInner {
    registration: ClientRegistration,
    session: OAuth2Session,
    token_client: Arc<dyn TokenExchangeClient>,
    cache: Option<Arc<UserInfoCache>>,
    pending_session: PendingSessionWrite,
    resolved: OnceCell<Map<String, Value>>,
}

/// Lazy, memoized access to the user's profile claims.
///
/// The first `resolve` call fetches (or serves from the shared cache); later
/// calls on the same handle return the memoized value. Inside the loader, an
/// `invalid_token` rejection with a refresh token at hand triggers exactly
/// one refresh-and-retry; a failed refresh resets the session to new.
#[derive(Clone)]
pub struct UserInfoHandle {
    inner: Arc<UserInfoInner>,
}

impl UserInfoHandle {
    /// Creates a handle bound to an authorized session.
    #[must_use]
    pub fn new(
        registration: ClientRegistration,
        session: OAuth2Session,
        token_client: Arc<dyn TokenExchangeClient>,
        cache: Option<Arc<UserInfoCache>>,
        pending_session: PendingSessionWrite,
    ) -> Self {
        Self {
            inner: Arc::new(UserInfoInner {
                registration,
                session,
                token_client,
                cache,
                pending_session,
                resolved: OnceCell::new(),
            }),
        }
    }

    /// Returns the user's claims, fetching them on first use.
    ///
    /// Never fails the request: an unrecoverable load error is logged and
    /// yields an empty claim set.
    pub async fn resolve(&self) -> Map<String, Value> {
        self.inner
            .resolved
            .get_or_init(|| async {
                match self.load().await {
                    Ok(claims) => claims,
                    Err(e) => {
                        tracing::warn!(
                            registration = self.inner.registration.name(),
                            error = %e,
                            "Unable to retrieve user info; continuing without claims"
                        );
                        Map::new()
                    }
                }
            })
            .await
            .clone()
    }

    async fn load(&self) -> Result<Map<String, Value>, OAuth2Error> {
        let access_token = self
            .inner
            .session
            .access_token()
            .ok_or_else(|| OAuth2Error::server_error("session holds no access token"))?
            .to_string();

        match &self.inner.cache {
            Some(cache) => {
                cache
                    .get_or_load(&access_token, || self.load_uncached(access_token.clone()))
                    .await
            }
            None => self.load_uncached(access_token).await,
        }
    }

    /// One load attempt, with at most one inline refresh-and-retry.
    async fn load_uncached(&self, access_token: String) -> Result<Map<String, Value>, OAuth2Error> {
        let inner = &self.inner;
        let first = inner
            .token_client
            .user_info(&inner.registration, &access_token)
            .await;

        let error = match first {
            Ok(claims) => return Ok(claims),
            Err(error) => error,
        };

        let refresh_token = inner.session.refresh_token();
        let (Some(refresh_token), true) = (refresh_token, error.is(E_INVALID_TOKEN)) else {
            return Err(error);
        };

        tracing::debug!(
            registration = inner.registration.name(),
            "Access token rejected by the user-info endpoint; attempting refresh"
        );
        match inner
            .token_client
            .refresh(&inner.registration, refresh_token)
            .await
        {
            Ok(refresh_response) => {
                let Some(refreshed) = inner.session.state_refreshed(&refresh_response) else {
                    return Err(error);
                };
                let Some(new_token) = refreshed.access_token().map(str::to_string) else {
                    return Err(error);
                };
                inner.pending_session.record(refreshed);
                inner
                    .token_client
                    .user_info(&inner.registration, &new_token)
                    .await
            }
            Err(refresh_error) => {
                tracing::warn!(
                    registration = inner.registration.name(),
                    error = %refresh_error,
                    "Refresh failed while loading user info; resetting the session"
                );
                inner
                    .pending_session
                    .record(OAuth2Session::state_new(inner.session.client_endpoint()));
                Err(error)
            }
        }
    }
}

impl fmt::Debug for UserInfoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserInfoHandle")
            .field("registration", &self.inner.registration.name())
            .field("resolved", &self.inner.resolved.initialized())
            .finish()
    }
}

/// Token data exposed to the downstream stage via request extensions.
#[derive(Debug, Clone)]
pub struct TargetBinding {
    values: Map<String, Value>,
    user_info: Option<UserInfoHandle>,
}

impl TargetBinding {
    /// Builds the binding for an authorized session.
    ///
    /// The registration name is taken from the session, so the binding can
    /// be built even when the named registration no longer resolves.
    #[must_use]
    pub fn authorized(session: &OAuth2Session, user_info: Option<UserInfoHandle>) -> Self {
        let mut values = Map::new();
        if let Some(name) = session.registration_name() {
            values.insert(
                "client_registration".to_string(),
                Value::String(name.to_string()),
            );
        }
        values.insert(
            "client_endpoint".to_string(),
            Value::String(session.client_endpoint().to_string()),
        );
        Self::fill_token_values(&mut values, session);
        Self { values, user_info }
    }

    /// Builds the binding handed to the failure handler.
    ///
    /// Carries whatever partial token data the (best-effort decoded)
    /// session still holds, the structured error, and the display form of
    /// the underlying failure.
    #[must_use]
    pub fn failure(
        session: Option<&OAuth2Session>,
        error: &OAuth2Error,
        detail: &(impl fmt::Display + ?Sized),
    ) -> Self {
        let mut values = Map::new();
        if let Some(session) = session {
            values.insert(
                "client_endpoint".to_string(),
                Value::String(session.client_endpoint().to_string()),
            );
            if let Some(name) = session.registration_name() {
                values.insert(
                    "client_registration".to_string(),
                    Value::String(name.to_string()),
                );
            }
            Self::fill_token_values(&mut values, session);
        }
        values.insert("error".to_string(), Value::Object(error.to_json()));
        values.insert(
            "failure_detail".to_string(),
            Value::String(detail.to_string()),
        );
        Self {
            values,
            user_info: None,
        }
    }

    fn fill_token_values(values: &mut Map<String, Value>, session: &OAuth2Session) {
        let Some(token_response) = session.token_response() else {
            return;
        };
        let string_fields = [
            ("access_token", token_response.access_token()),
            ("id_token", token_response.id_token()),
            ("token_type", token_response.token_type()),
        ];
        for (key, value) in string_fields {
            if let Some(value) = value {
                values.insert(key.to_string(), Value::String(value.to_string()));
            }
        }
        if let Some(expires_in) = session.expires_in() {
            values.insert("expires_in".to_string(), Value::from(expires_in));
        }
        let scopes = session.scopes();
        if !scopes.is_empty() {
            values.insert(
                "scope".to_string(),
                Value::Array(scopes.into_iter().map(Value::String).collect()),
            );
        }
        if let Some(claims) = token_response.id_token_claims() {
            values.insert("id_token_claims".to_string(), Value::Object(claims));
        }
    }

    /// Returns one bound value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns all bound values.
    #[must_use]
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Returns the lazy user-info handle, when the provider supports it.
    #[must_use]
    pub fn user_info(&self) -> Option<&UserInfoHandle> {
        self.user_info.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::E_SERVER_ERROR;
    use crate::registration::Issuer;
    use crate::token::TokenResponse;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockTokenClient {
        user_info_responses: Mutex<VecDeque<Result<Map<String, Value>, OAuth2Error>>>,
        refresh_response: Option<Result<TokenResponse, OAuth2Error>>,
        user_info_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
    }

    impl MockTokenClient {
        fn new(
            user_info_responses: Vec<Result<Map<String, Value>, OAuth2Error>>,
            refresh_response: Option<Result<TokenResponse, OAuth2Error>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                user_info_responses: Mutex::new(user_info_responses.into()),
                refresh_response,
                user_info_calls: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TokenExchangeClient for MockTokenClient {
        async fn exchange_code(
            &self,
            _registration: &ClientRegistration,
            _code: &str,
            _callback_uri: &str,
        ) -> Result<TokenResponse, OAuth2Error> {
            Err(OAuth2Error::server_error("not under test"))
        }

        async fn refresh(
            &self,
            _registration: &ClientRegistration,
            _refresh_token: &str,
        ) -> Result<TokenResponse, OAuth2Error> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_response
                .clone()
                .unwrap_or_else(|| Err(OAuth2Error::server_error("no refresh configured")))
        }

        async fn user_info(
            &self,
            _registration: &ClientRegistration,
            _access_token: &str,
        ) -> Result<Map<String, Value>, OAuth2Error> {
            self.user_info_calls.fetch_add(1, Ordering::SeqCst);
            self.user_info_responses
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err(OAuth2Error::server_error("unexpected user-info call")))
        }
    }

    fn registration() -> ClientRegistration {
        ClientRegistration::new(
            "openam".to_string(),
            "gateway-client".to_string(),
            "secret".to_string(),
            Issuer::new(
                "https://as.example.com/authorize".to_string(),
                "https://as.example.com/token".to_string(),
                Some("https://as.example.com/userinfo".to_string()),
            ),
            vec!["openid".to_string()],
        )
    }

    fn authorized_session(json: &str) -> OAuth2Session {
        OAuth2Session::state_new("/openid")
            .state_authorizing("openam", "nonce-1".to_string())
            .state_authorized(TokenResponse::new(
                serde_json::from_str(json).expect("valid json"),
            ))
            .expect("authorized")
    }

    fn claims(json: &str) -> Map<String, Value> {
        serde_json::from_str(json).expect("valid json")
    }

    fn handle(
        client: Arc<MockTokenClient>,
        session: OAuth2Session,
        pending: PendingSessionWrite,
    ) -> UserInfoHandle {
        UserInfoHandle::new(registration(), session, client, None, pending)
    }

    #[test]
    fn authorized_binding_exposes_token_values() {
        let session = authorized_session(
            r#"{
                "access_token": "at-1",
                "token_type": "Bearer",
                "expires_in": 3600,
                "scope": "openid profile"
            }"#,
        );

        let binding = TargetBinding::authorized(&session, None);
        assert_eq!(
            binding.get("client_registration"),
            Some(&Value::String("openam".into()))
        );
        assert_eq!(
            binding.get("client_endpoint"),
            Some(&Value::String("/openid".into()))
        );
        assert_eq!(binding.get("access_token"), Some(&Value::String("at-1".into())));
        assert_eq!(binding.get("token_type"), Some(&Value::String("Bearer".into())));
        assert!(binding.get("expires_in").and_then(Value::as_i64).is_some());
        assert_eq!(
            binding.get("scope"),
            Some(&Value::Array(vec![
                Value::String("openid".into()),
                Value::String("profile".into())
            ]))
        );
        assert!(binding.get("id_token_claims").is_none());
        assert!(binding.user_info().is_none());
    }

    #[test]
    fn failure_binding_carries_error_and_partial_data() {
        let session = authorized_session(r#"{"access_token": "at-1"}"#);
        let error = OAuth2Error::invalid_request("state parameter missing");

        let binding = TargetBinding::failure(Some(&session), &error, &error);
        assert_eq!(binding.get("access_token"), Some(&Value::String("at-1".into())));
        let error_json = binding.get("error").and_then(Value::as_object).expect("error");
        assert_eq!(
            error_json.get("error"),
            Some(&Value::String("invalid_request".into()))
        );
        assert!(
            binding
                .get("failure_detail")
                .and_then(Value::as_str)
                .expect("detail")
                .contains("state parameter missing")
        );
    }

    #[test]
    fn failure_binding_without_session_still_has_the_error() {
        let error = OAuth2Error::server_error("exchange failed");
        let binding = TargetBinding::failure(None, &error, &error);
        assert!(binding.get("access_token").is_none());
        assert!(binding.get("error").is_some());
    }

    #[tokio::test]
    async fn resolve_fetches_once_and_memoizes() {
        let client = MockTokenClient::new(vec![Ok(claims(r#"{"sub": "user-1"}"#))], None);
        let handle = handle(
            Arc::clone(&client),
            authorized_session(r#"{"access_token": "at-1"}"#),
            PendingSessionWrite::new(),
        );

        let first = handle.resolve().await;
        let second = handle.resolve().await;
        assert_eq!(first.get("sub"), Some(&Value::String("user-1".into())));
        assert_eq!(first, second);
        assert_eq!(client.user_info_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unrecoverable_failure_yields_empty_claims() {
        let client =
            MockTokenClient::new(vec![Err(OAuth2Error::new(E_SERVER_ERROR))], None);
        let pending = PendingSessionWrite::new();
        let handle = handle(
            Arc::clone(&client),
            authorized_session(r#"{"access_token": "at-1"}"#),
            pending.clone(),
        );

        assert!(handle.resolve().await.is_empty());
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 0);
        assert!(pending.take().is_none());
    }

    #[tokio::test]
    async fn invalid_token_triggers_one_refresh_and_retry() {
        let client = MockTokenClient::new(
            vec![
                Err(OAuth2Error::new(E_INVALID_TOKEN)),
                Ok(claims(r#"{"sub": "user-1"}"#)),
            ],
            Some(Ok(TokenResponse::new(claims(
                r#"{"access_token": "at-2", "expires_in": 60}"#,
            )))),
        );
        let pending = PendingSessionWrite::new();
        let handle = handle(
            Arc::clone(&client),
            authorized_session(r#"{"access_token": "at-1", "refresh_token": "rt-1"}"#),
            pending.clone(),
        );

        let resolved = handle.resolve().await;
        assert_eq!(resolved.get("sub"), Some(&Value::String("user-1".into())));
        assert_eq!(client.user_info_calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 1);

        let refreshed = pending.take().expect("refreshed session recorded");
        assert_eq!(refreshed.access_token(), Some("at-2"));
        assert_eq!(refreshed.refresh_token(), Some("rt-1"));
    }

    #[tokio::test]
    async fn refresh_failure_resets_the_session() {
        let client = MockTokenClient::new(
            vec![Err(OAuth2Error::new(E_INVALID_TOKEN))],
            Some(Err(OAuth2Error::new("invalid_grant"))),
        );
        let pending = PendingSessionWrite::new();
        let handle = handle(
            Arc::clone(&client),
            authorized_session(r#"{"access_token": "at-1", "refresh_token": "rt-1"}"#),
            pending.clone(),
        );

        assert!(handle.resolve().await.is_empty());
        let reset = pending.take().expect("session reset recorded");
        assert!(!reset.is_authorized());
        assert_eq!(reset.client_endpoint(), "/openid");
    }

    #[tokio::test]
    async fn no_refresh_without_a_refresh_token() {
        let client =
            MockTokenClient::new(vec![Err(OAuth2Error::new(E_INVALID_TOKEN))], None);
        let pending = PendingSessionWrite::new();
        let handle = handle(
            Arc::clone(&client),
            authorized_session(r#"{"access_token": "at-1"}"#),
            pending.clone(),
        );

        assert!(handle.resolve().await.is_empty());
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 0);
        assert!(pending.take().is_none());
    }

    #[tokio::test]
    async fn shared_cache_serves_other_handles() {
        let cache = Arc::new(UserInfoCache::new(Some(std::time::Duration::from_secs(20))));
        let client = MockTokenClient::new(vec![Ok(claims(r#"{"sub": "user-1"}"#))], None);
        let session = authorized_session(r#"{"access_token": "at-1"}"#);

        let first = UserInfoHandle::new(
            registration(),
            session.clone(),
            Arc::clone(&client) as Arc<dyn TokenExchangeClient>,
            Some(Arc::clone(&cache)),
            PendingSessionWrite::new(),
        );
        let second = UserInfoHandle::new(
            registration(),
            session,
            Arc::clone(&client) as Arc<dyn TokenExchangeClient>,
            Some(cache),
            PendingSessionWrite::new(),
        );

        assert_eq!(first.resolve().await, second.resolve().await);
        assert_eq!(client.user_info_calls.load(Ordering::SeqCst), 1);
    }
}
