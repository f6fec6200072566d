//! Counsel Assist Server - Main Entry Point
//!
//! Real-time counselor-assist platform backend.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use ca_server::agent::{CustomerDirectory, HttpCustomerDirectory, UnconfiguredCustomerDirectory};
use ca_server::app::{create_router, AppState};
use ca_server::config::Config;
use ca_server::llm::{HttpLlmClient, LlmClient, UnconfiguredLlm};
use ca_server::persistence::PgPersistence;
use ca_server::room::{Collaborators, RoomManager};
use ca_server::stt::{SttProvider, WsSttProvider};
use ca_server::vector::{
    Embedder, HttpEmbedder, HttpVectorStore, UnconfiguredEmbedder, UnconfiguredVectorStore,
    VectorStore,
};
use ca_server::{db, persistence::Persistence};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required for WebRTC DTLS)
    // before any TLS/WebRTC operations.
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ca_server=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Counsel Assist Server"
    );

    let db_pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&db_pool).await?;

    let persistence: Arc<dyn Persistence> = Arc::new(PgPersistence::new(db_pool));

    let llm: Arc<dyn LlmClient> = match &config.llm_endpoint {
        Some(endpoint) => Arc::new(HttpLlmClient::new(endpoint.clone(), config.llm_model.clone())?),
        None => {
            tracing::warn!("LLM_ENDPOINT not set; analysis nodes will report skipped results");
            Arc::new(UnconfiguredLlm)
        }
    };
    let vector: Arc<dyn VectorStore> = match &config.vector_endpoint {
        Some(endpoint) => Arc::new(HttpVectorStore::new(endpoint.clone())?),
        None => Arc::new(UnconfiguredVectorStore),
    };
    let embedder: Arc<dyn Embedder> = match &config.embedding_endpoint {
        Some(endpoint) => Arc::new(HttpEmbedder::new(endpoint.clone())?),
        None => Arc::new(UnconfiguredEmbedder),
    };
    let customers: Arc<dyn CustomerDirectory> = match &config.customer_directory_endpoint {
        Some(endpoint) => Arc::new(HttpCustomerDirectory::new(endpoint.clone())?),
        None => Arc::new(UnconfiguredCustomerDirectory),
    };
    let stt: Option<Arc<dyn SttProvider>> = config
        .stt_endpoint
        .as_ref()
        .map(|endpoint| Arc::new(WsSttProvider::new(endpoint.clone())) as Arc<dyn SttProvider>);
    if stt.is_none() {
        tracing::warn!("STT_ENDPOINT not set; rooms will run without transcription");
    }

    let manager = Arc::new(RoomManager::new(
        Arc::clone(&config),
        Collaborators {
            persistence,
            llm,
            vector,
            embedder,
            customers,
            stt,
        },
    )?);
    manager.probe_llm().await;

    let state = AppState::new(Arc::clone(&config), Arc::clone(&manager));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Server listening");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    // Rooms first, then clients are gone with the server, then pending
    // write-through tasks drain.
    manager.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
