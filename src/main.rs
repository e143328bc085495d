//! Oxidrop server binary.
//!
//! A small HTTP file-storage backend: multipart uploads land under a storage
//! root, every file gets a timestamp-keyed name and a retrievable URL, and
//! metadata is tracked in a flat JSON ledger (or re-derived by scanning the
//! storage root, selected by configuration). The main entry point builds the
//! Axum router and starts the HTTP listener.

mod atomic;
mod config;
mod error;
mod files;
mod http;
mod ledger;
mod locking;
mod logging;
mod storage;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::{ApiConfig, Args};
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::ledger::Ledger;
use crate::locking::LockManager;
use crate::storage::Storage;

shadow!(build);

/// Starts the Oxidrop server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;
    let ledger = Arc::new(Ledger::new(PathBuf::from(&args.ledger_file)));
    let lock_manager = Arc::new(LockManager::new());
    let api_config = Arc::new(ApiConfig {
        public_url: args.public_url.clone(),
        list_backend: args.list_backend,
        upload_max_size: args.upload_max_size,
    });

    let mut app = Router::new()
        .route(
            "/api/upload",
            post(upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/files/list", get(files::list_files))
        .route("/api/files/delete", delete(files::delete_file))
        .route("/api/files/rename", post(files::rename_file))
        .route("/uploads/{*path}", get(files::serve_file))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(ledger))
        .layer(Extension(lock_manager))
        .layer(Extension(api_config));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("🚀 Storage backend running at {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
}
