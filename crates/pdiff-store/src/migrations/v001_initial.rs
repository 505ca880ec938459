//! v001 -- Initial schema creation.
//!
//! Creates the four tables of the ownership chain: `sites`, `image_groups`,
//! `images` and `diffs`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Sites
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sites (
    name        TEXT PRIMARY KEY NOT NULL,
    key_hex     TEXT NOT NULL DEFAULT '',    -- hex-encoded 32-byte key, '' until assigned
    secret_hex  TEXT NOT NULL DEFAULT '',    -- hex-encoded 32-byte secret, '' until assigned
    created_at  TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Groups (implicitly created on first write)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS image_groups (
    site_name   TEXT NOT NULL,
    group_name  TEXT NOT NULL,
    created_at  TEXT NOT NULL,

    PRIMARY KEY (site_name, group_name),
    FOREIGN KEY (site_name) REFERENCES sites(name)
);

-- ----------------------------------------------------------------
-- Images (ordered by the caller-supplied id, not write time)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS images (
    site_name   TEXT NOT NULL,
    group_name  TEXT NOT NULL,
    image_id    INTEGER NOT NULL,
    width       INTEGER NOT NULL,
    height      INTEGER NOT NULL,
    blob_id     TEXT NOT NULL,               -- UUID of the PNG payload
    created_at  TEXT NOT NULL,

    PRIMARY KEY (site_name, group_name, image_id),
    FOREIGN KEY (site_name, group_name) REFERENCES image_groups(site_name, group_name)
);

-- ----------------------------------------------------------------
-- Diffs
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS diffs (
    site_name   TEXT NOT NULL,
    group_name  TEXT NOT NULL,
    id1         INTEGER NOT NULL,
    id2         INTEGER NOT NULL,
    pixels      INTEGER NOT NULL,
    blob_id     TEXT,                        -- nullable: no visual diff stored
    reviewed    INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    created_at  TEXT NOT NULL,

    PRIMARY KEY (site_name, group_name, id1, id2),
    FOREIGN KEY (site_name, group_name) REFERENCES image_groups(site_name, group_name)
);

CREATE INDEX IF NOT EXISTS idx_diffs_site_reviewed ON diffs(site_name, reviewed);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
