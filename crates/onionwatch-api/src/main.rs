//! OnionWatch API Backend
//!
//! Axum HTTP surface over the monitoring platform: on-demand scans, scan
//! history and comparison, monitor CRUD and alert management. Exit codes:
//! 0 normal, 2 configuration error, 3 store unreachable at startup.

use onionwatch::{StartupError, WatchConfig, WatchService};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod handlers;
mod models;

#[tokio::main]
async fn main() {
    let config = match WatchConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(2);
        }
    };

    init_tracing(&config);

    let service = match WatchService::new(config) {
        Ok(service) => Arc::new(service),
        Err(StartupError::Config(e)) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(2);
        }
        Err(StartupError::Store(e)) => {
            eprintln!("store unreachable: {}", e);
            std::process::exit(3);
        }
    };

    let scheduler = service.scheduler.clone();
    tokio::spawn(scheduler.clone().run());

    let app = handlers::router(service.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let bind_addr = service.config.bind_addr.clone();
    let listener = match tokio::net::TcpListener::bind(bind_addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("configuration error: cannot bind {}: {}", bind_addr, e);
            std::process::exit(2);
        }
    };
    tracing::info!("OnionWatch API listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    // Drain in-flight monitor scans, then flush the store snapshot.
    scheduler.shutdown().await;
    if let Err(e) = service.store.persist() {
        tracing::warn!("store snapshot on shutdown failed: {}", e);
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}

fn init_tracing(config: &WatchConfig) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

    // Optional plain log file next to the console layer; rotation is left to
    // the operator.
    let file_layer = config.log_dir.as_ref().and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("onionwatch.log"))
            .ok()?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file)),
        )
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
}
