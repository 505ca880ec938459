//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with zero
//! configuration for local development. The configuration is read once in
//! `main` and shared read-only afterwards.

use std::net::SocketAddr;
use std::path::PathBuf;

use pdiff_shared::constants::{DEFAULT_HTTP_PORT, MAX_BLOB_SIZE, MAX_IMAGE_SIZE};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite metadata database file.
    /// Env: `DATABASE_PATH`
    /// Default: `None`, i.e. `pdiff.db` in the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Directory holding image and diff PNG blobs.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./blobs`
    pub blob_storage_path: PathBuf,

    /// Largest accepted upload image, in bytes, as sent by the client
    /// (before decoding).
    /// Env: `MAX_IMAGE_SIZE`
    /// Default: 20 MiB
    pub max_image_size: usize,

    /// Largest PNG blob the server writes. Uploads are re-encoded, so this
    /// is independent of `max_image_size`.
    /// Env: `MAX_BLOB_SIZE`
    /// Default: 8 x `MAX_IMAGE_SIZE`
    pub max_blob_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            blob_storage_path: PathBuf::from("./blobs"),
            max_image_size: MAX_IMAGE_SIZE,
            max_blob_size: MAX_BLOB_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = var("DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Some(path) = var("BLOB_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.blob_storage_path = PathBuf::from(path);
        }

        if let Some(val) = var("MAX_IMAGE_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_image_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_IMAGE_SIZE, using default"),
            }
        }

        if let Some(val) = var("MAX_BLOB_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_blob_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_BLOB_SIZE, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// HTTP body limit for an upload: the image travels base64-encoded
    /// inside JSON, so allow for the 4/3 expansion plus the other fields.
    pub fn upload_body_limit(&self) -> usize {
        self.max_image_size / 3 * 4 + 64 * 1024
    }
}
