use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attachment_store::{
    api,
    backend::{BackendSet, BlobStoreBackend, FilesystemBackend, ObjectStoreBackend},
    config::Config,
    lifecycle::AttachmentLifecycle,
    storage::Database,
    validation::ValidationPipeline,
    AppState,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "attachment-store starting"
    );

    // Load configuration; a missing landing path is fatal here, before
    // anything is served.
    let config = Config::load()?;

    // Initialize the metadata database
    let db = Database::open(&config.node.data_dir)?;
    info!("Database opened at: {}", config.node.data_dir);

    // Landing backend; creates the landing root recursively.
    let landing = FilesystemBackend::new(&config.storage.landing_path)?;
    info!(
        "Landing storage at: {}",
        config.storage.landing_path.display()
    );

    let mut backends = BackendSet::new(Arc::new(landing));

    // The blob store shares the metadata database and is always available.
    backends.register(Arc::new(BlobStoreBackend::new(db.clone())));

    if let Some(ref s3) = config.storage.s3 {
        let store = ObjectStoreBackend::new(s3.clone())?;
        info!(bucket = %s3.bucket, "Object store backend configured");
        backends.register(Arc::new(store));
    }

    let validator = ValidationPipeline::new(config.validation.clone());
    let lifecycle = Arc::new(AttachmentLifecycle::new(
        db.clone(),
        Arc::new(backends),
        validator,
        config.storage.permanent_backend,
    ));
    info!(
        permanent_backend = %config.storage.permanent_backend,
        "Lifecycle coordinator ready"
    );

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        lifecycle,
    });

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
