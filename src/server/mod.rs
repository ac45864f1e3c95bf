//! HTTP/WebSocket server bootstrap: wires the Client Gateway, the auth and
//! supporting HTTP routes, and TLS/CORS/tracing middleware around them
//! (spec.md §6).

pub mod auth;
pub mod gateway;
pub mod http;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{middleware, routing::{get, post}, Router};
use reqwest::Client;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::broker::UpstreamBroker;
use crate::config::Config;
use auth::AuthState;

/// Shared server state, cloned into every handler (spec.md §4.4, §6).
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub auth: Arc<AuthState>,
    pub broker: Arc<UpstreamBroker>,
    pub http: Client,
}

/// Start the web server with the given configuration.
pub async fn start(config: Config) -> Result<()> {
    crate::metrics::init();

    let auth = AuthState::new(config.auth.clone());
    let state = ServerState {
        config: Arc::new(config),
        auth,
        broker: UpstreamBroker::new(),
        http: Client::new(),
    };

    let addr: SocketAddr = state.config.server.bind.parse().context("parsing server bind address")?;

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let protected = Router::new()
        .route("/api/user", get(http::get_user_handler).put(http::update_user_handler))
        .layer(middleware::from_fn_with_state(state.auth.clone(), auth::auth_middleware));

    let public = Router::new()
        .route("/api/auth/login", post(http::login_handler))
        .route("/api/auth/google", post(http::google_login_handler))
        .route("/api/auth/refresh", post(http::refresh_handler))
        .route("/api/auth/logout", post(http::logout_handler))
        .route("/api/health", get(http::health_handler))
        .route("/metrics", get(http::metrics_handler))
        .route("/api/voices", get(http::voices_handler))
        .route("/api/tts", post(http::tts_handler))
        .route("/api/voices/upload", post(http::voice_upload_handler))
        .route("/ws/realtime", get(gateway::voice_gateway_handler));

    let app = Router::new()
        .merge(protected)
        .merge(public)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    info!(%addr, "starting server");

    if let (Some(cert_path), Some(key_path)) = (&state.config.server.tls_cert, &state.config.server.tls_key) {
        let cert_data = tokio::fs::read(cert_path).await.context("reading TLS certificate")?;
        let key_data = tokio::fs::read(key_path).await.context("reading TLS key")?;
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem(cert_data, key_data).await?;
        axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
        return Ok(());
    }

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
