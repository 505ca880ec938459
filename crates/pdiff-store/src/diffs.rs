//! Diff records and the unreviewed-diff queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::groups::upsert_group;
use crate::models::{DiffImage, DiffSummary};
use crate::sites::ensure_site;

impl Database {
    /// Record a diff between images `id1` and `id2` of a group.
    ///
    /// Storing the same pair again replaces the pixel count and blob and puts
    /// the diff back into the unreviewed queue. Returns the blob id of the
    /// replaced diff image, if there was one, so the caller can drop it.
    pub fn upsert_diff(&mut self, diff: &DiffImage) -> Result<Option<Uuid>> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        ensure_site(&tx, &diff.site)?;
        upsert_group(&tx, &diff.site, &diff.group, diff.created_at)?;

        let previous: Option<Option<String>> = tx
            .query_row(
                "SELECT blob_id FROM diffs
                 WHERE site_name = ?1 AND group_name = ?2 AND id1 = ?3 AND id2 = ?4",
                params![diff.site, diff.group, diff.id1, diff.id2],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO diffs (site_name, group_name, id1, id2, pixels, blob_id, reviewed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (site_name, group_name, id1, id2) DO UPDATE SET
                 pixels = excluded.pixels,
                 blob_id = excluded.blob_id,
                 reviewed = excluded.reviewed,
                 created_at = excluded.created_at",
            params![
                diff.site,
                diff.group,
                diff.id1,
                diff.id2,
                diff.pixel_diff_count,
                diff.blob_id.map(|b| b.to_string()),
                diff.reviewed as i32,
                diff.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        let replaced_blob = previous
            .flatten()
            .and_then(|s| Uuid::parse_str(&s).ok())
            .filter(|old| Some(*old) != diff.blob_id);

        tracing::debug!(
            site = %diff.site,
            group = %diff.group,
            id1 = diff.id1,
            id2 = diff.id2,
            pixels = diff.pixel_diff_count,
            "diff recorded"
        );
        Ok(replaced_blob)
    }

    pub fn get_diff(&self, site: &str, group: &str, id1: i64, id2: i64) -> Result<DiffImage> {
        self.conn()
            .query_row(
                "SELECT site_name, group_name, id1, id2, pixels, blob_id, reviewed, created_at
                 FROM diffs
                 WHERE site_name = ?1 AND group_name = ?2 AND id1 = ?3 AND id2 = ?4",
                params![site, group, id1, id2],
                row_to_diff,
            )
            .map_err(not_found)
    }

    /// Every diff of `site` still awaiting review, grouped by group name and
    /// ordered by the newer image id. The order is a convenience only.
    pub fn list_unreviewed(&self, site: &str) -> Result<Vec<DiffSummary>> {
        ensure_site(self.conn(), site)?;

        let mut stmt = self.conn().prepare(
            "SELECT group_name, id1, id2, pixels
             FROM diffs
             WHERE site_name = ?1 AND reviewed = 0
             ORDER BY group_name ASC, id2 ASC, id1 ASC",
        )?;

        let rows = stmt.query_map(params![site], |row| {
            Ok(DiffSummary {
                group: row.get(0)?,
                id1: row.get(1)?,
                id2: row.get(2)?,
                pixel_diff_count: row.get(3)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Flip a diff to reviewed. Returns `false` if it was already reviewed.
    pub fn mark_reviewed(&self, site: &str, group: &str, id1: i64, id2: i64) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE diffs SET reviewed = 1
             WHERE site_name = ?1 AND group_name = ?2 AND id1 = ?3 AND id2 = ?4 AND reviewed = 0",
            params![site, group, id1, id2],
        )?;
        if affected == 0 {
            // Distinguish "already reviewed" from "no such diff".
            self.get_diff(site, group, id1, id2)?;
        }
        Ok(affected > 0)
    }
}

fn row_to_diff(row: &rusqlite::Row<'_>) -> rusqlite::Result<DiffImage> {
    let site: String = row.get(0)?;
    let group: String = row.get(1)?;
    let id1: i64 = row.get(2)?;
    let id2: i64 = row.get(3)?;
    let pixel_diff_count: i64 = row.get(4)?;
    let blob_str: Option<String> = row.get(5)?;
    let reviewed_int: i32 = row.get(6)?;
    let created_str: String = row.get(7)?;

    let blob_id = blob_str
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(DiffImage {
        site,
        group,
        id1,
        id2,
        pixel_diff_count,
        blob_id,
        reviewed: reviewed_int != 0,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::database::tests::test_db;
    use crate::database::Database;
    use crate::error::StoreError;
    use crate::images::tests::image;
    use crate::models::{DiffImage, DiffSummary};

    fn diff(group: &str, id1: i64, id2: i64, pixels: i64, blob: Option<Uuid>) -> DiffImage {
        DiffImage {
            site: "demo".to_string(),
            group: group.to_string(),
            id1,
            id2,
            pixel_diff_count: pixels,
            blob_id: blob,
            reviewed: false,
            created_at: Utc::now(),
        }
    }

    fn db_with_site() -> (Database, tempfile::TempDir) {
        let (mut db, dir) = test_db();
        db.create_site("demo").unwrap();
        (db, dir)
    }

    #[test]
    fn stored_diff_is_unreviewed() {
        let (mut db, _dir) = db_with_site();
        db.insert_image(&image("demo", "g", 100)).unwrap();
        db.insert_image(&image("demo", "g", 200)).unwrap();
        db.upsert_diff(&diff("g", 100, 200, 42, None)).unwrap();

        assert_eq!(
            db.list_unreviewed("demo").unwrap(),
            vec![DiffSummary {
                group: "g".to_string(),
                id1: 100,
                id2: 200,
                pixel_diff_count: 42,
            }]
        );

        let stored = db.get_diff("demo", "g", 100, 200).unwrap();
        assert!(!stored.reviewed);
        assert!(stored.blob_id.is_none());
    }

    #[test]
    fn reviewed_diffs_leave_the_queue() {
        let (mut db, _dir) = db_with_site();
        db.upsert_diff(&diff("g", 1, 2, 10, None)).unwrap();
        db.upsert_diff(&diff("g", 2, 3, 20, None)).unwrap();

        assert!(db.mark_reviewed("demo", "g", 1, 2).unwrap());
        assert!(!db.mark_reviewed("demo", "g", 1, 2).unwrap());

        let queue = db.list_unreviewed("demo").unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!((queue[0].id1, queue[0].id2), (2, 3));
        assert!(queue.iter().all(|d| !db.get_diff("demo", &d.group, d.id1, d.id2).unwrap().reviewed));
    }

    #[test]
    fn mark_reviewed_unknown_diff() {
        let (db, _dir) = db_with_site();
        assert!(matches!(
            db.mark_reviewed("demo", "g", 1, 2),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn restore_resets_review_and_returns_old_blob() {
        let (mut db, _dir) = db_with_site();
        let first_blob = Uuid::new_v4();
        assert_eq!(db.upsert_diff(&diff("g", 1, 2, 5, Some(first_blob))).unwrap(), None);
        db.mark_reviewed("demo", "g", 1, 2).unwrap();

        let second_blob = Uuid::new_v4();
        let replaced = db.upsert_diff(&diff("g", 1, 2, 9, Some(second_blob))).unwrap();
        assert_eq!(replaced, Some(first_blob));

        let stored = db.get_diff("demo", "g", 1, 2).unwrap();
        assert_eq!(stored.pixel_diff_count, 9);
        assert_eq!(stored.blob_id, Some(second_blob));
        assert!(!stored.reviewed);
    }

    #[test]
    fn queue_is_scoped_to_site() {
        let (mut db, _dir) = db_with_site();
        db.create_site("other").unwrap();
        db.upsert_diff(&diff("g", 1, 2, 5, None)).unwrap();

        assert!(db.list_unreviewed("other").unwrap().is_empty());
        assert!(matches!(
            db.list_unreviewed("ghost"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn diff_for_unknown_site() {
        let (mut db, _dir) = test_db();
        let mut d = diff("g", 1, 2, 5, None);
        d.site = "ghost".to_string();
        assert!(matches!(db.upsert_diff(&d), Err(StoreError::NotFound)));
    }
}
