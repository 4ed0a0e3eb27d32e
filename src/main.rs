//! tus-drive server binary.
//!
//! Serves resumable (tus 1.0.0) uploads on one or more URL templates and
//! stores them below per-endpoint storage paths. The main entry point builds
//! the Axum router from the configured endpoints and starts the HTTP listener.

mod atomic;
mod background;
mod checksum;
mod config;
mod engine;
mod error;
mod http;
mod locking;
mod logging;
mod protocol;
mod resolver;
mod storage;
mod upload;

use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum::middleware;
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::{Args, TusConfig};
use crate::engine::UploadEngine;
use crate::http::{build_cors_layer, extract_forwarded_ip};
use crate::protocol::ProtocolAdapter;
use crate::upload::tus_router;

/// Starts the tus-drive server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let config = TusConfig::from_args(&args)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    for endpoint in &config.endpoints {
        tokio::fs::create_dir_all(endpoint.root()).await?;
        info!(
            url = endpoint.url_template(),
            root = %endpoint.root().display(),
            "upload endpoint mounted"
        );
    }
    let config = Arc::new(config);
    let engine = Arc::new(UploadEngine::new(config.clone()));
    let adapter = Arc::new(ProtocolAdapter::new(engine.clone()));

    let mut app = tus_router(&config, adapter)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = extract_forwarded_ip(request.headers()).map(|ip| ip.to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip().to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
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
        );

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(engine);
    tokio::select! {
        result = http_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
