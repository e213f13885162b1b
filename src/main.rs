use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting trigger-store with config: {:?}", cfg);

    // --- Storage directory: must exist and must hold extended attributes,
    //     since that is where every trigger binding lives. A filesystem
    //     without them cannot run this service at all, so fail at boot
    //     rather than on the first assignment request.
    fs::create_dir_all(&cfg.storage_dir)
        .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
    services::metadata_codec::probe_attribute_support(Path::new(&cfg.storage_dir)).with_context(
        || {
            format!(
                "storage directory {} cannot hold trigger metadata",
                cfg.storage_dir
            )
        },
    )?;
    tracing::debug!("Attribute probe passed for {}", cfg.storage_dir);

    // --- Initialize SQLite connection ---
    // SQLx does not create the database file on its own; make sure the
    // parent directory and an openable file are there before connecting.
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {:?}", parent))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(db_path)
        .with_context(|| format!("opening SQLite database at {}", db_path))?;

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // --- Handle migration mode ---
    if migrate {
        run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Wire the engine core around the storage collaborator ---
    let storage =
        services::storage_service::StorageService::new(db.clone(), cfg.storage_dir.clone());
    let registry = services::trigger_registry::TriggerRegistry::new(cfg.max_slot_bytes);
    let backend: Arc<dyn services::backend::ObjectBackend> = Arc::new(
        services::backend::LocalStore::new(storage.clone(), registry.clone()),
    );
    let verifier: Arc<dyn services::backend::AccessVerifier> = Arc::new(
        services::backend::BackendAccessVerifier::new(backend.clone()),
    );
    let cache_backend: Arc<dyn services::cache_gateway::CacheBackend> = match cfg.cache.as_str() {
        "memory" => Arc::new(services::cache_gateway::InMemoryCache::new()),
        _ => Arc::new(services::cache_gateway::NullCache),
    };
    let cache = services::cache_gateway::CacheGateway::new(cache_backend);
    let links = services::link_resolver::LinkResolver::new(
        backend.clone(),
        verifier.clone(),
        cache.clone(),
    );
    let executor: Arc<dyn services::backend::HandlerExecutor> = Arc::new(
        services::backend::LoggingExecutor::new(cfg.run_handlers),
    );
    let pipeline = Arc::new(services::request_pipeline::RequestPipeline::new(
        backend,
        verifier,
        executor,
        cache,
        links,
        registry,
        cfg.handler_container.clone(),
    ));

    // --- Build router ---
    let state = handlers::AppState { pipeline, storage };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Run SQLite migrations manually from the embedded SQL file.
async fn run_migrations(db: &Arc<sqlx::Pool<sqlx::Sqlite>>) -> Result<()> {
    let path = "migrations/0001_init.sql";

    if !Path::new(path).exists() {
        anyhow::bail!("Migration file not found: {}", path);
    }

    let sql = fs::read_to_string(path)?;
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(&**db).await?;
    }

    Ok(())
}
