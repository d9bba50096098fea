pub mod auth;
pub mod config;
pub mod metrics;
pub mod routes;
pub mod session;
pub mod state;

use std::process;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use self::auth::require_auth;
use self::config::PanelConfig;
use self::metrics::{handle_health, handle_metrics, handle_readyz, track_metrics};
use self::routes::{
    handle_delete_blank_key, handle_delete_flag, handle_delete_many, handle_list_flags,
    handle_session, handle_sign_in, handle_sign_out, handle_upsert_flags,
};
use self::state::{open_store, AppState};

/// All routes. `/flags` routes sit behind [`require_auth`].
pub fn build_router(state: Arc<AppState>) -> Router {
    let flags = Router::new()
        .route("/flags", get(handle_list_flags).post(handle_upsert_flags))
        .route("/flags/delete", post(handle_delete_many))
        .route("/flags/", delete(handle_delete_blank_key))
        .route("/flags/{key}", delete(handle_delete_flag))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(flags)
        .route("/auth/sign-in", post(handle_sign_in))
        .route("/auth/sign-out", post(handle_sign_out))
        .route("/auth/session", get(handle_session))
        .route("/health", get(handle_health))
        .route("/readyz", get(handle_readyz))
        .route("/metrics", get(handle_metrics))
        .layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .with_state(state)
}

pub async fn run_serve(
    mut config: PanelConfig,
    port_arg: Option<u16>,
    hostname_arg: Option<String>,
) {
    // CLI args override env, which overrides the config file
    if let Some(port) = port_arg {
        config.server.port = port;
    }
    if let Some(hostname) = hostname_arg {
        config.server.hostname = hostname;
    }

    if !config.auth.is_configured() {
        warn!("no api_tokens or operators configured, every /flags request will be rejected");
    }

    let store = match open_store(&config.storage) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open storage: {}", e);
            process::exit(1);
        }
    };
    let backend = store.backend_name();

    let addr = format!("{}:{}", config.server.hostname, config.server.port);
    let state = Arc::new(AppState::new(store, config));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        });

    info!(%addr, backend, "serving flag panel");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Server error: {}", e);
            process::exit(1);
        });

    info!("server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await.ok();

    info!("shutdown signal received, finishing in-flight requests");
}
