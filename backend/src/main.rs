mod anchors;
mod app;
mod auth;
mod codes;
mod config;
mod error;
mod fanout;
mod gateway;
mod persistence;
mod protocol;
mod ratelimit;
mod registry;
mod routes;
mod sessions;
mod sync;
mod util;

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::response::Response;
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use app::AppState;
use config::AppConfig;
use sync::AnchorEvent;

// ─── Background Sweepers ──────────────────────────────────────────────────────

/// Heartbeat sweep: reap idle players (and their sync registrations) and
/// announce departures/host transfers.
async fn run_heartbeat_sweeper(app: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(app.config.heartbeat_interval);
    let idle_secs = app.config.idle_timeout.as_secs_f64();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removals = app.sessions.sweep_idle(idle_secs).await;
                for removal in &removals {
                    fanout::announce_removal(&app, removal).await;
                }
                for client_id in app.sync.idle_clients(idle_secs).await {
                    app.sync.unregister(&client_id).await;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Share-code reaper: expired codes are dropped, and sessions that nobody
/// ever joined (or that drained already) go with them.
async fn run_code_reaper(app: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for session_id in app.codes.reap_expired().await {
                    let empty = app
                        .sessions
                        .summary(session_id)
                        .await
                        .map(|s| s.player_count == 0)
                        .unwrap_or(false);
                    if empty && app.sessions.delete_session(session_id).await {
                        info!("Reaped expired anonymous session {session_id}");
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Anchor expiry sweep: delete overdue anchors and tell subscribers.
async fn run_anchor_sweeper(app: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(app.config.anchor_cleanup_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for anchor in app.anchors.sweep_expired().await {
                    app.sync
                        .broadcast(&anchor.session_id, AnchorEvent::Deleted(anchor.id), None)
                        .await;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

// ─── Gateway Fallback ─────────────────────────────────────────────────────────

/// Anything the control plane doesn't own goes through the gateway's
/// prefix table (or 404s there).
async fn gateway_fallback(State(app): State<AppState>, request: Request) -> Response {
    app.router.route(request).await
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lattice_backend=info".into()),
        )
        .init();

    let config = AppConfig::from_env()?;
    info!(
        "Lattice spatial backend v{} starting — {:?} mode",
        env!("CARGO_PKG_VERSION"),
        config.environment
    );

    let port = config.port;
    let cors_origins = config.cors_origins.clone();
    let app = AppState::build(config).await?;

    // Background tasks, all bound to the shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(app.registry.clone().run(shutdown_rx.clone()));
    tokio::spawn(run_heartbeat_sweeper(app.clone(), shutdown_rx.clone()));
    tokio::spawn(run_code_reaper(app.clone(), shutdown_rx.clone()));
    tokio::spawn(run_anchor_sweeper(app.clone(), shutdown_rx.clone()));

    // CORS — local dev defaults to *, deployments pin origins
    let cors = if cors_origins.trim() == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins
            .split(',')
            .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    let router = Router::new()
        .merge(routes::control_plane())
        .fallback(gateway_fallback)
        .layer(cors)
        .with_state(app.clone());

    let addr = format!("0.0.0.0:{port}");
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Stop sweepers, flush dirty anchors, close the pool
    let _ = shutdown_tx.send(true);
    app.anchors.shutdown_flush().await;
    if let Some(pg) = &app.pg_store {
        pg.close().await;
    }
    info!("Shutdown complete");
    Ok(())
}
