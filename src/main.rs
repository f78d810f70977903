//! # Interview Agent Worker
//!
//! Joins interview rooms as an AI interviewer. For each room it transcribes the
//! candidate, asks a language model for a short Socratic reply grounded in the problem
//! and the candidate's live code, and speaks the reply back into the room.
//!
//! ## Composition:
//! - **config**: layered configuration, validated before anything starts
//! - **speech / llm / problem / room**: provider clients, built once here and injected
//! - **session**: the registry of per-room session actors
//! - **handlers / health / middleware**: the HTTP control surface
//!
//! On SIGINT or SIGTERM every session is stopped (adapters ended, room left) before
//! the HTTP server shuts down.

mod config;
mod error;
mod handlers;
mod health;
mod llm;
mod middleware;
mod pipeline;
mod problem;
mod room;
mod session;
mod speech;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use llm::gemini::GeminiModel;
use llm::generator::ResponseGenerator;
use pipeline::InteractionPipeline;
use room::bridge::BridgeConnector;
use session::registry::SessionRegistry;
use session::SessionDeps;
use speech::deepgram::DeepgramRecognizer;
use speech::synthesis::ElevenLabsSynthesizer;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    // Missing credentials are fatal: the worker must not start half-configured.
    config.validate()?;
    let config = Arc::new(config);

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        room_url = %config.room.url,
        problems = ?config.problems.source,
        rotation = ?config.rotation_interval(),
        stream_limit = ?config.stream_limit(),
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let registry = Arc::new(SessionRegistry::new(Arc::new(build_session_deps(&config)?)));
    let app_state = AppState::new(Arc::clone(&config), Arc::clone(&registry));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(handlers::json_config())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::RequestTelemetry)
            .route("/join", web::post().to(handlers::join_room))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
    })
    .bind(&bind_addr)?
    .disable_signals()
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
            registry.stop_all().await;
        }
        _ = wait_for_shutdown() => {
            info!(active_rooms = registry.len(), "Shutdown signal received, stopping sessions...");
            registry.stop_all().await;
            server_handle.stop(true).await;
        }
    }

    info!("Worker stopped gracefully");
    Ok(())
}

/// Build every provider client once and bundle them for the sessions.
fn build_session_deps(config: &AppConfig) -> Result<SessionDeps> {
    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let generator = ResponseGenerator::new(Arc::new(GeminiModel::new(http.clone(), config.llm.clone())));
    let synthesizer = ElevenLabsSynthesizer::new(http.clone(), config.synthesis.clone());
    let pipeline = InteractionPipeline::new(Arc::new(generator), Arc::new(synthesizer));

    Ok(SessionDeps::new(
        config,
        Arc::new(BridgeConnector::new(config.room.clone())),
        problem::build_store(http, &config.problems),
        Arc::new(DeepgramRecognizer::new(config.speech.clone())),
        pipeline,
    ))
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "interview_agent_worker=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on the first SIGTERM or SIGINT.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
