mod access;
mod auth;
mod config;
mod directory;
mod oauth;
mod registry;
mod session;
mod tls;
mod web;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use tmi_common::SigningKeySet;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::directory::{InMemoryDirectory, LoggingSnapshotWriter};
use crate::web::AppState;

const JWT_ISSUER: &str = "tmi";
const JWT_AUDIENCE: &str = "tmi-clients";
const JWT_SECRET_PATH: &str = "/var/lib/tmi/jwt_secret";

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/tmi.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Load the persisted JWT signing secret, or generate and persist a fresh
/// one. Keeping it stable across restarts means previously-issued access
/// tokens stay valid instead of every restart forcing every client to
/// re-authenticate.
fn load_or_generate_jwt_secret() -> String {
    let secret_path = std::path::Path::new(JWT_SECRET_PATH);
    if let Ok(existing) = std::fs::read_to_string(secret_path) {
        let trimmed = existing.trim().to_string();
        if !trimmed.is_empty() {
            tracing::info!("loaded JWT secret from {}", secret_path.display());
            return trimmed;
        }
    }

    let secret = generate_secret();
    if let Err(e) = std::fs::create_dir_all("/var/lib/tmi") {
        tracing::warn!("failed to create /var/lib/tmi: {e}");
    } else {
        use std::os::unix::fs::OpenOptionsExt;
        match std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(secret_path)
        {
            Ok(mut f) => {
                use std::io::Write;
                let _ = f.write_all(secret.as_bytes());
                tracing::info!("persisted JWT secret to {}", secret_path.display());
            }
            Err(e) => {
                tracing::warn!("failed to persist JWT secret: {e}");
            }
        }
    }
    secret
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "configuration has {} issue(s); fix the ERROR(s) above and restart",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let port = config.server.port;
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, port)
        .parse()
        .context("invalid bind address")?;

    let tls_server_config =
        tls::build_tls_config(config.server.tls_cert.as_deref(), config.server.tls_key.as_deref())?;
    let tls_acceptor = tls::make_acceptor(tls_server_config);

    let jwt_secret = load_or_generate_jwt_secret();
    let signing_keys = SigningKeySet::new(JWT_ISSUER, JWT_AUDIENCE, jwt_secret);

    let directory = Arc::new(InMemoryDirectory::new());
    let snapshot_writer = Arc::new(LoggingSnapshotWriter);
    let registry = registry::new_session_registry();
    let session_config = Arc::new(config.session.clone());

    let oauth_state = Arc::new(oauth::OAuthState::new(config.oauth.clone(), signing_keys.clone()));

    let state = Arc::new(AppState {
        directory,
        snapshot_writer,
        registry: registry.clone(),
        session_config,
        signing_keys: StdRwLock::new(signing_keys),
        started_at: std::time::Instant::now(),
    });

    let cors_layer = if config.server.cors_allowed_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<_> = config
            .server
            .cors_allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    let app = web::build_router(Arc::clone(&state))
        .merge(oauth::routes(oauth_state))
        .layer(cors_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  TMI Collaboration Server v0.1.0");
    tracing::info!("  Listening on https://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("server ready, accepting connections");

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, initiating graceful shutdown"),
        }
        signal_token.cancel();
    });

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                let app = app.clone();

                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(Duration::from_secs(10), acceptor.accept(stream)).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "TLS handshake timed out");
                            return;
                        }
                    };

                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());

                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "connection error: {e}");
                    }
                });
            }
            _ = shutdown_token.cancelled() => {
                break;
            }
        }
    }

    tracing::info!("ending all live collaboration sessions for shutdown");
    registry::terminate_all(&registry, "server_shutdown").await;
    if tokio::time::timeout(Duration::from_secs(5), registry::wait_until_drained(&registry))
        .await
        .is_err()
    {
        tracing::warn!("graceful shutdown timed out waiting for sessions to drain");
    }

    tracing::info!("TMI server shut down cleanly");

    Ok(())
}
