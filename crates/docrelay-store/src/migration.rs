//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use docrelay_core::{document_id, now_millis, Document};

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Initialize or migrate the database schema.
///
/// Idempotent: running it on an up-to-date database does nothing.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "migrated relay store schema");
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: documents and the relay queue.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Replicated documents, keyed by (collection, _id)
        CREATE TABLE documents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,  -- insertion order
            collection TEXT NOT NULL,
            doc_id BLOB NOT NULL,                   -- 12-byte ObjectId
            body BLOB NOT NULL,                     -- CBOR document, _id included
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,

            UNIQUE(collection, doc_id)
        );

        -- Pending cross-node deliveries
        CREATE TABLE relay_queue (
            queue_id INTEGER PRIMARY KEY AUTOINCREMENT,  -- never reused
            collection TEXT NOT NULL,
            document BLOB NOT NULL,                      -- CBOR document
            origin_location TEXT NOT NULL,
            destination_location TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            error INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            retry_at INTEGER,
            dead_letter INTEGER NOT NULL DEFAULT 0,
            claimed_until INTEGER,
            enqueued_at INTEGER NOT NULL
        );

        CREATE INDEX idx_relay_queue_destination ON relay_queue(destination_location, queue_id);
        "#,
    )?;

    Ok(())
}

/// Migration v2: per-document ordering in the relay queue.
///
/// Adds the queued document's `_id` as a column and backfills it from the
/// stored bodies. Rows without a readable `_id` keep NULL and are never
/// held back.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        ALTER TABLE relay_queue ADD COLUMN doc_id BLOB;  -- 12-byte ObjectId
        CREATE INDEX idx_relay_queue_document
            ON relay_queue(destination_location, collection, doc_id, queue_id);
        "#,
    )?;

    let rows: Vec<(i64, Vec<u8>)> = conn
        .prepare("SELECT queue_id, document FROM relay_queue")?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    for (queue_id, body) in rows {
        let Ok(document) = ciborium::from_reader::<Document, _>(&body[..]) else {
            continue;
        };
        if let Ok(id) = document_id(&document) {
            conn.execute(
                "UPDATE relay_queue SET doc_id = ?2 WHERE queue_id = ?1",
                rusqlite::params![queue_id, id.as_bytes().as_slice()],
            )?;
        }
    }

    Ok(())
}
