//! # pdiff-store
//!
//! Metadata storage for the pdiff service, backed by SQLite.
//!
//! Sites own groups, groups own images and diffs. Image and diff pixel
//! payloads live out-of-line in a blob store; the rows here only carry the
//! blob id. The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every record kind.
//! Read-then-write operations run inside immediate transactions.

pub mod database;
pub mod diffs;
pub mod groups;
pub mod images;
pub mod migrations;
pub mod models;
pub mod sites;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
