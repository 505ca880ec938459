//! Site registration and credential lookup.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::models::Site;

impl Database {
    /// Register a new site with empty credentials.
    ///
    /// The existence check and the insert share one immediate transaction, so
    /// two concurrent registrations of the same name cannot both succeed.
    pub fn create_site(&mut self, name: &str) -> Result<Site> {
        let created_at = Utc::now();
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if site_exists(&tx, name)? {
            return Err(StoreError::AlreadyExists);
        }

        tx.execute(
            "INSERT INTO sites (name, key_hex, secret_hex, created_at)
             VALUES (?1, '', '', ?2)",
            params![name, created_at.to_rfc3339()],
        )?;
        tx.commit()?;

        tracing::debug!(site = name, "site created");

        Ok(Site {
            name: name.to_string(),
            key: Vec::new(),
            secret: Vec::new(),
            created_at,
        })
    }

    /// Attach a key/secret pair to an existing site.
    pub fn assign_key(&mut self, name: &str, key: &[u8], secret: &[u8]) -> Result<()> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !site_exists(&tx, name)? {
            return Err(StoreError::NotFound);
        }

        tx.execute(
            "UPDATE sites SET key_hex = ?2, secret_hex = ?3 WHERE name = ?1",
            params![name, hex::encode(key), hex::encode(secret)],
        )?;
        tx.commit()?;

        tracing::debug!(site = name, "site key assigned");
        Ok(())
    }

    pub fn get_site(&self, name: &str) -> Result<Site> {
        self.conn()
            .query_row(
                "SELECT name, key_hex, secret_hex, created_at FROM sites WHERE name = ?1",
                params![name],
                row_to_site,
            )
            .map_err(not_found)
    }
}

pub(crate) fn site_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sites WHERE name = ?1",
            params![name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Fail with [`StoreError::NotFound`] unless the site exists.
pub(crate) fn ensure_site(conn: &Connection, name: &str) -> Result<()> {
    if site_exists(conn, name)? {
        Ok(())
    } else {
        Err(StoreError::NotFound)
    }
}

fn row_to_site(row: &rusqlite::Row<'_>) -> rusqlite::Result<Site> {
    let name: String = row.get(0)?;
    let key_hex: String = row.get(1)?;
    let secret_hex: String = row.get(2)?;
    let created_str: String = row.get(3)?;

    let key = hex::decode(&key_hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let secret = hex::decode(&secret_hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Site {
        name,
        key,
        secret,
        created_at,
    })
}
