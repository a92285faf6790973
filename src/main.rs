//! # Live Translation Relay
//!
//! A teacher speaks into a WebSocket, students listen in their own languages.
//!
//! ## Startup:
//! 1. Load `.env`, initialize tracing, load and validate configuration
//! 2. Start the translation log task and wire the relay (`AppState`)
//! 3. Start the realtime dispatcher and the session lifecycle sweeper
//! 4. Serve HTTP: health, config and session endpoints plus the gated `/ws`
//! 5. On SIGTERM/SIGINT stop the dispatcher, the sweeper and the server

mod audio;
mod config;
mod delivery;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod realtime;
mod session;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use delivery::ChannelTranslationStore;
use middleware::ConnectionGate;
use realtime::websocket_endpoint;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TRANSLATION_LOG_CAPACITY: usize = 256;

static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let (translation_store, translation_log) = ChannelTranslationStore::channel(TRANSLATION_LOG_CAPACITY);
    let translation_log_task = tokio::spawn(translation_log.run());

    let app_state = AppState::new(config.clone(), Arc::new(translation_store))?;
    app_state.dispatcher.start()?;
    let sweeper = app_state
        .lifecycle
        .clone()
        .spawn_sweeper(config.lifecycle.sweep_interval());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let gate = config.gate.clone();

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}/end", web::post().to(handlers::end_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .service(
                web::resource("/ws")
                    .wrap(ConnectionGate::new(gate.clone()))
                    .route(web::get().to(websocket_endpoint)),
            )
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    app_state.dispatcher.stop();
    sweeper.abort();
    translation_log_task.abort();

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_translation_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
