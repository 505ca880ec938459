//! Record structs persisted in the metadata database.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Site
// ---------------------------------------------------------------------------

/// A registered tenant. The name is the primary key.
///
/// `key` and `secret` stay empty between registration and key assignment;
/// such a site cannot authenticate anything.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Site {
    pub name: String,
    /// Public key sent along with every upload, stored as hex.
    pub key: Vec<u8>,
    /// HMAC secret, stored as hex. Never serialized.
    #[serde(skip_serializing)]
    pub secret: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Site {
    pub fn has_credentials(&self) -> bool {
        !self.key.is_empty() && !self.secret.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// Metadata of one stored image. The pixels live in the blob store.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Image {
    pub site: String,
    pub group: String,
    /// Caller-supplied ordering id (build number or timestamp).
    pub id: i64,
    pub width: u32,
    pub height: u32,
    pub blob_id: Uuid,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// A recorded comparison of two images in the same group.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DiffImage {
    pub site: String,
    pub group: String,
    pub id1: i64,
    pub id2: i64,
    pub pixel_diff_count: i64,
    /// PNG visualisation of the difference, if the caller stored one.
    pub blob_id: Option<Uuid>,
    pub reviewed: bool,
    pub created_at: DateTime<Utc>,
}

/// One entry of the unreviewed-diff queue.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub group: String,
    pub id1: i64,
    pub id2: i64,
    #[serde(rename = "pixels")]
    pub pixel_diff_count: i64,
}
