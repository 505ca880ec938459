//! Image metadata records.
//!
//! Images are ordered by their caller-supplied id within a group. The
//! "previous image" lookup used for diffing is the second-highest id in the
//! group, which only equals "the image before id N" when N is the group's
//! current maximum (the usual write-then-query flow).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::groups::upsert_group;
use crate::models::Image;
use crate::sites::ensure_site;

const IMAGE_COLUMNS: &str = "site_name, group_name, image_id, width, height, blob_id, created_at";

impl Database {
    /// Insert an image record, creating its group on first use.
    ///
    /// Fails with [`StoreError::NotFound`] for an unknown site and with
    /// [`StoreError::AlreadyExists`] if the group already holds this id.
    pub fn insert_image(&mut self, image: &Image) -> Result<()> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        ensure_site(&tx, &image.site)?;
        if image_exists(&tx, &image.site, &image.group, image.id)? {
            return Err(StoreError::AlreadyExists);
        }

        upsert_group(&tx, &image.site, &image.group, image.created_at)?;
        tx.execute(
            "INSERT INTO images (site_name, group_name, image_id, width, height, blob_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                image.site,
                image.group,
                image.id,
                image.width,
                image.height,
                image.blob_id.to_string(),
                image.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        tracing::debug!(
            site = %image.site,
            group = %image.group,
            id = image.id,
            blob = %image.blob_id,
            "image recorded"
        );
        Ok(())
    }

    pub fn image_exists(&self, site: &str, group: &str, id: i64) -> Result<bool> {
        image_exists(self.conn(), site, group, id)
    }

    /// The image just below the group's highest id: sort by id descending,
    /// skip one, take one. `NotFound` when the group has fewer than two images.
    pub fn get_image_before(&self, site: &str, group: &str) -> Result<Image> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {IMAGE_COLUMNS} FROM images
                     WHERE site_name = ?1 AND group_name = ?2
                     ORDER BY image_id DESC
                     LIMIT 1 OFFSET 1"
                ),
                params![site, group],
                row_to_image,
            )
            .map_err(not_found)
    }
}

fn image_exists(conn: &Connection, site: &str, group: &str, id: i64) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM images WHERE site_name = ?1 AND group_name = ?2 AND image_id = ?3",
            params![site, group, id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn row_to_image(row: &rusqlite::Row<'_>) -> rusqlite::Result<Image> {
    let site: String = row.get(0)?;
    let group: String = row.get(1)?;
    let id: i64 = row.get(2)?;
    let width: u32 = row.get(3)?;
    let height: u32 = row.get(4)?;
    let blob_str: String = row.get(5)?;
    let created_str: String = row.get(6)?;

    let blob_id = Uuid::parse_str(&blob_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Image {
        site,
        group,
        id,
        width,
        height,
        blob_id,
        created_at,
    })
}
