use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::Result;

// Groups have no attributes of their own; the first write into one creates it.
pub(crate) fn upsert_group(
    conn: &Connection,
    site: &str,
    group: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO image_groups (site_name, group_name, created_at)
         VALUES (?1, ?2, ?3)",
        params![site, group, now.to_rfc3339()],
    )?;
    Ok(())
}
