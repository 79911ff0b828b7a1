mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod services;

use axum::{
    http::HeaderValue,
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foliogate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting FolioGate...");

    // Load configuration
    let config = Arc::new(Config::load()?);
    tracing::info!("Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database.path).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    let state = AppState {
        db,
        config: config.clone(),
    };

    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn create_router(state: AppState) -> Router {
    // Dev posture allows any origin; production pins the configured list.
    let cors = if state.config.server.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/auth/setup-status", get(handlers::auth::setup_status))
        .route("/auth/setup", post(handlers::auth::setup))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/login/totp", post(handlers::auth::login_totp))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/security/mfa/check", post(handlers::auth::mfa_check))
        .route("/security/otp/send", post(handlers::two_factor::otp_send))
        .route("/security/otp/verify", post(handlers::two_factor::otp_verify))
        .route("/security/totp/verify", post(handlers::two_factor::totp_verify))
        .route(
            "/security/passkey/authenticate-options",
            post(handlers::passkey::authenticate_options),
        )
        .route(
            "/security/passkey/authenticate",
            post(handlers::passkey::authenticate),
        );

    // Admin routes (valid access token + admin flag)
    let admin_routes = Router::new()
        .route("/auth/me", get(handlers::auth::me))
        .route(
            "/security/change-password",
            post(handlers::auth::change_password),
        )
        .route(
            "/security/settings",
            get(handlers::security::get_settings).put(handlers::security::update_settings),
        )
        .route(
            "/security/smtp-config",
            get(handlers::security::get_smtp_config).post(handlers::security::update_smtp_config),
        )
        .route("/security/smtp-test", post(handlers::security::smtp_test))
        .route("/security/totp/setup", get(handlers::two_factor::totp_setup))
        .route("/security/totp/enable", post(handlers::two_factor::totp_enable))
        .route("/security/totp", delete(handlers::two_factor::totp_disable))
        .route(
            "/security/passkey/register-options",
            get(handlers::passkey::register_options),
        )
        .route("/security/passkey/register", post(handlers::passkey::register))
        .route("/security/passkey/list", get(handlers::passkey::list))
        .route(
            "/security/passkey/:id",
            put(handlers::passkey::rename).delete(handlers::passkey::delete),
        )
        .route(
            "/security/cleanup/challenges",
            post(handlers::security::cleanup_challenges),
        )
        .route("/security/audit-logs", get(handlers::security::audit_logs))
        .layer(axum::middleware::from_fn(middleware::auth::require_admin))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    Router::new()
        .nest("/api", public_routes.merge(admin_routes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
