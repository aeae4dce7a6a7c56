//! Delegated-login gateway.
//!
//! Every inbound request runs through the OAuth 2.0 client filter; requests
//! that survive it are reverse-proxied to the configured upstream.

mod config;
mod handlers;

use crate::config::GatewayConfig;
use crate::handlers::{FailureResponseHandler, RegistrationChooserHandler, UpstreamHandler};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response};
use glowing_turnstile_oauth2::{
    ClientRegistrationRepository, CookieSessionCodec, Handler, HttpTokenExchangeClient,
    OAuth2ClientFilter,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

#[derive(Clone)]
struct AppState {
    filter: Arc<OAuth2ClientFilter>,
    upstream: Arc<UpstreamHandler>,
}

async fn proxy(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    state.filter.filter(request, state.upstream.as_ref()).await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from the gateway file and environment
    let config = GatewayConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_seconds))
        .build()
        .expect("failed to build the HTTP client");

    let upstream_url = Url::parse(&config.upstream_url).expect("invalid upstream URL");
    let registration_names: Vec<String> = config
        .registrations
        .iter()
        .map(|r| r.name().to_string())
        .collect();
    let registrations = ClientRegistrationRepository::new(config.registrations)
        .expect("invalid client registrations");

    let mut builder = OAuth2ClientFilter::builder(
        config.client_endpoint.clone(),
        registrations.clone(),
        Arc::new(HttpTokenExchangeClient::new(http.clone())),
        Arc::new(CookieSessionCodec::new(
            config.session.cookie_name.clone(),
            config.session.secure_cookies,
        )),
        Arc::new(FailureResponseHandler),
    )
    .require_https(config.oauth2.require_https)
    .require_login(config.oauth2.require_login)
    .cache_expiration(Duration::from_secs(config.oauth2.cache_expiration_seconds));

    if let Some(goto_uri) = config.oauth2.default_login_goto.clone() {
        builder = builder.default_login_goto(goto_uri);
    }
    if let Some(goto_uri) = config.oauth2.default_logout_goto.clone() {
        builder = builder.default_logout_goto(goto_uri);
    }
    if registrations.needs_chooser() {
        builder = builder.login_handler(Arc::new(RegistrationChooserHandler::new(
            config.client_endpoint.clone(),
            registration_names,
        )) as Arc<dyn Handler>);
    }

    let filter = builder.build().expect("invalid delegated-login configuration");

    let state = AppState {
        filter: Arc::new(filter),
        upstream: Arc::new(UpstreamHandler::new(http, upstream_url)),
    };

    let app = Router::new()
        .fallback(proxy)
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind the listen address");
    tracing::info!(addr = %config.listen_addr, "Gateway listening");
    axum::serve(listener, app).await.expect("server error");
}
