use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Container holding handler artifacts; trigger assignments verify
    /// access to the named handler object inside it.
    pub handler_container: String,
    /// Cache collaborator: `none` or `memory`.
    pub cache: String,
    /// Whether the handler-execution collaborator is enabled at all.
    pub run_handlers: bool,
    /// Per-slot ceiling for chunked attribute writes.
    pub max_slot_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Object store with per-object trigger bindings")]
pub struct Args {
    /// Host to bind to (overrides TRIGGER_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TRIGGER_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides TRIGGER_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides TRIGGER_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Container holding handler artifacts (overrides TRIGGER_STORE_HANDLER_CONTAINER)
    #[arg(long)]
    pub handler_container: Option<String>,

    /// Cache collaborator, `none` or `memory` (overrides TRIGGER_STORE_CACHE)
    #[arg(long)]
    pub cache: Option<String>,

    /// Enable/disable handler execution (overrides TRIGGER_STORE_RUN_HANDLERS)
    #[arg(long)]
    pub run_handlers: Option<bool>,

    /// Per-slot ceiling for attribute chunks (overrides TRIGGER_STORE_MAX_SLOT_BYTES)
    #[arg(long)]
    pub max_slot_bytes: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("TRIGGER_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parsed_env("TRIGGER_STORE_PORT", 3000)?;
        let env_storage =
            env::var("TRIGGER_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("TRIGGER_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/trigger_store.db".into());
        let env_handler_container =
            env::var("TRIGGER_STORE_HANDLER_CONTAINER").unwrap_or_else(|_| "handlers".into());
        let env_cache = env::var("TRIGGER_STORE_CACHE").unwrap_or_else(|_| "none".into());
        let env_run_handlers = parsed_env("TRIGGER_STORE_RUN_HANDLERS", true)?;
        let env_max_slot_bytes = parsed_env(
            "TRIGGER_STORE_MAX_SLOT_BYTES",
            crate::services::metadata_codec::DEFAULT_SLOT_BYTES,
        )?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            handler_container: args.handler_container.unwrap_or(env_handler_container),
            cache: args.cache.unwrap_or(env_cache),
            run_handlers: args.run_handlers.unwrap_or(env_run_handlers),
            max_slot_bytes: args.max_slot_bytes.unwrap_or(env_max_slot_bytes),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse one environment variable, falling back to `default` when
/// it is unset.
fn parsed_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
