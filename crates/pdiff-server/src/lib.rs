//! # pdiff-server
//!
//! Image perceptual-diff tracking service.
//!
//! - **Site registration** issuing a random key/secret pair per site
//! - **Authenticated image upload** (HMAC-SHA256 over a canonical string)
//! - **Image history** per group, ordered by caller-supplied ids, with the
//!   previous image available for diffing
//! - **Unreviewed-diff queue** for human triage
//!
//! Metadata lives in SQLite (`pdiff-store`), pixel payloads in a PNG blob
//! directory.

pub mod api;
pub mod backend;
pub mod blob_store;
pub mod config;
pub mod error;

pub use backend::Backend;
pub use config::ServerConfig;
pub use error::ServiceError;
