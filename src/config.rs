use crate::services::storage_service::{DEFAULT_MAX_OBJECT_BYTES, StoreOptions};
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
    pub max_upload_bytes: u64,
    pub delete_secret: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Single-slot image store")]
pub struct Args {
    /// Host to bind to (overrides SLOT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SLOT_STORE_PORT and PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where images are stored (overrides SLOT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Largest accepted upload in bytes (overrides SLOT_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Shared secret required to delete all images (overrides SLOT_STORE_DELETE_SECRET)
    #[arg(long)]
    pub delete_secret: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::resolve(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge parsed CLI args over values from `lookup` (an environment
    /// reader), then over defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = lookup("SLOT_STORE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = match lookup("SLOT_STORE_PORT").or_else(|| lookup("PORT")) {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing port value `{}`", value))?,
            None => 8080,
        };
        let env_storage = lookup("SLOT_STORE_STORAGE_DIR").unwrap_or_else(|| "./images".into());
        let env_max = match lookup("SLOT_STORE_MAX_UPLOAD_BYTES") {
            Some(value) => value
                .parse::<u64>()
                .with_context(|| format!("parsing SLOT_STORE_MAX_UPLOAD_BYTES value `{}`", value))?,
            None => DEFAULT_MAX_OBJECT_BYTES,
        };
        let env_secret = lookup("SLOT_STORE_DELETE_SECRET");

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max),
            delete_secret: args
                .delete_secret
                .or(env_secret)
                .filter(|secret| !secret.is_empty()),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_object_bytes: self.max_upload_bytes,
            delete_secret: self.delete_secret.clone(),
        }
    }
}
