//! # Phone Relay - Main Application Entry Point
//!
//! Bridges telephony media streams to voice conversation sessions. A telephony provider
//! opens a WebSocket to `/media` for every call leg; the relay decodes the caller's mu-law
//! audio into a conversation session and streams the session's replies back, measuring
//! playback latency with marks along the way.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, `APP_*` environment)
//! - **state**: shared state, HTTP metrics and the call limit
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and metrics
//! - **handlers**: runtime configuration API
//! - **error**: HTTP error type and JSON error responses
//! - **audio**: frames, mu-law codec, resampling, bounded queues, phone endpoints
//! - **conversation**: the conversation session seam and the bundled loopback backend
//! - **relay**: protocol, per-call state machine, outbound sender, latency, observers
//! - **websocket**: the `/media` socket actor

mod audio;
mod config;
mod conversation;
mod error;
mod handlers;
mod health;
mod middleware;
mod relay;
mod state;
mod websocket;

use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::Result;
use config::AppConfig;
use conversation::LoopbackSessionFactory;
use relay::{RelayObserver, TranscriptConsole};
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;

    info!("Starting phone-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        agent_id = %config.session.agent_id,
        session_rate = config.session.sample_rate,
        telephony_rate = config.telephony.sample_rate,
        mark_interval = config.telephony.mark_interval,
        "Configuration loaded"
    );

    let console: Option<Arc<dyn RelayObserver>> = config
        .observer
        .console_transcripts
        .then(|| Arc::new(TranscriptConsole::stdout()) as Arc<dyn RelayObserver>);

    let app_state = AppState::new(config.clone(), Arc::new(LoopbackSessionFactory), console);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse order of registration for responses
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/", web::get().to(index))
            .route("/media", web::get().to(websocket::media_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    // Signals are handled below. A graceful stop waits up to the shutdown timeout for
    // open sockets; calls still open after that are dropped with their worker, without
    // a session stop.
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

async fn index() -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body("Hello from phone-relay!")
}

/// Initialize tracing.
///
/// `RUST_LOG` controls the filter; the default is `phone_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "phone_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
///
/// If a handler cannot be installed the other one is still awaited; if neither can, the
/// server runs until its own task ends.
#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let sigterm = signal(SignalKind::terminate());
    let sigint = signal(SignalKind::interrupt());

    match (sigterm, sigint) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        (Ok(mut sigterm), Err(e)) => {
            warn!("Failed to install SIGINT handler: {}", e);
            sigterm.recv().await;
            info!("Received SIGTERM");
        }
        (Err(e), Ok(mut sigint)) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            sigint.recv().await;
            info!("Received SIGINT");
        }
        (Err(term), Err(int)) => {
            warn!("Failed to install signal handlers: {}, {}", term, int);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
