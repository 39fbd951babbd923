mod auth;
mod client;
mod config;
mod error;
mod permission;
mod session;
mod store;
mod supervisor;
mod terminal;
mod tls;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::session::SessionManager;
use crate::store::Store;
use crate::terminal::TerminalManager;
use crate::web::AppState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/gateway.toml");
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

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

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
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    if !std::path::Path::new(&config.server.web_root).is_dir() {
        tracing::warn!(
            "Web root '{}' does not exist — the UI will not load.",
            config.server.web_root
        );
    }

    std::fs::create_dir_all(&config.server.data_dir)
        .with_context(|| format!("Failed to create data dir {}", config.server.data_dir))?;

    let port = config.server.port;
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, port)
        .parse()
        .context("Invalid bind address")?;

    let tls_result = tls::build_tls_config(
        config.server.tls_cert.as_deref(),
        config.server.tls_key.as_deref(),
        &config.server.data_dir,
    )?;
    let tls_acceptor = tls::make_acceptor(tls_result.config);

    let db_path = std::path::Path::new(&config.server.data_dir).join("gateway.sqlite3");
    let store = Store::open(&db_path).await?;

    let terminals = TerminalManager::new();
    let session_manager = SessionManager::new(store.clone(), Arc::clone(&terminals), config.clone()).await?;

    let state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        session_manager: Arc::clone(&session_manager),
        started_at: std::time::Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state))
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
    tracing::info!("  Session & Agent Coordination Gateway");
    tracing::info!("  Listening on https://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("Server ready, accepting connections");

    // Session idle sweep: terminate sessions past session_timeout_ms.
    let sweep_sessions = Arc::clone(&session_manager);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            match sweep_sessions.idle_sweep().await {
                Ok(expired) if !expired.is_empty() => {
                    tracing::info!(count = expired.len(), "idle-swept sessions");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "idle sweep failed"),
            }
        }
    });

    // Terminal idle sweep: close PTYs past terminal_idle_ms.
    let sweep_terminals = Arc::clone(&terminals);
    let terminal_idle_ms = config.session.terminal_idle_ms;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(5 * 60)).await;
            let closed = sweep_terminals
                .sweep_idle(std::time::Duration::from_millis(terminal_idle_ms))
                .await;
            if !closed.is_empty() {
                tracing::info!(count = closed.len(), "idle-swept terminals");
            }
        }
    });

    // Periodic WAL checkpoint, in addition to the final truncating one
    // at shutdown.
    let checkpoint_store = store.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(5 * 60)).await;
            if let Err(e) = checkpoint_store.checkpoint().await {
                tracing::warn!("Periodic WAL checkpoint failed: {e}");
            }
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                let app = app.clone();

                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(
                        std::time::Duration::from_secs(10),
                        acceptor.accept(stream),
                    ).await {
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
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );

                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "Connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    // A second interrupt during the grace period below forces an
    // immediate exit instead of waiting out the deadline.
    tokio::spawn(async move {
        let mut sigterm2 = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm2.recv() => {}
        }
        tracing::warn!("Received a second interrupt, forcing immediate exit");
        std::process::exit(1);
    });

    tracing::info!("Interrupting live agents before shutdown");
    session_manager.interrupt_all().await;
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    session_manager.shutdown_all_supervisors().await;

    tracing::info!("Checkpointing database before shutdown...");
    if let Err(e) = store.checkpoint().await {
        tracing::warn!("Failed to checkpoint store on shutdown: {e}");
    }

    tracing::info!("Gateway shut down cleanly (sessions remain active for reattachment)");

    Ok(())
}
