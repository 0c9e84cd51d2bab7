// src/store.rs

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::normalize::CanonicalDocument;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info};

/// Relational store for extracted documents and their line items.
///
/// One connection per store; dropped (or [`DocumentStore::close`]d) when the
/// batch is done.
pub struct DocumentStore {
    conn: Connection,
}

/// A persisted `documents` row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRow {
    pub id: i64,
    pub filename: String,
    pub document_id: String,
    pub name: String,
    pub description: String,
}

/// A persisted `line_items` row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItemRow {
    pub id: i64,
    pub document_id: i64,
    pub item: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
}

/// A document row together with its line items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDocument {
    #[serde(flatten)]
    pub document: DocumentRow,
    pub line_items: Vec<LineItemRow>,
}

/// Every row in the store, as handed to the report collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub documents: Vec<DocumentRow>,
    pub line_items: Vec<LineItemRow>,
}

impl DocumentStore {
    /// Open (creating if needed) the SQLite database named in `config`.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(&config.db_path)?;
        info!(db_path = %config.db_path.display(), "Opening document store");
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                document_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        // Decimals are kept as text: NUMERIC affinity would turn them into floats.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS line_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL,
                item TEXT NOT NULL,
                quantity TEXT NOT NULL,
                unit_price TEXT NOT NULL,
                total TEXT NOT NULL,
                FOREIGN KEY (document_id) REFERENCES documents(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_line_items_document_id ON line_items(document_id)",
            [],
        )?;

        info!("Database initialized successfully");
        Ok(Self { conn })
    }

    /// Upsert a whole batch, keyed by filename, in a single transaction.
    ///
    /// Existing documents keep their row and get their scalar fields updated;
    /// their line items are deleted and reinserted. Any error rolls back the
    /// entire batch.
    pub fn load(&mut self, batch: &BTreeMap<String, CanonicalDocument>) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;

        for (filename, doc) in batch {
            let id = upsert_document(&tx, filename, doc)?;
            debug!(filename = %filename, id, line_items = doc.line_items.len(), "Document upserted");
        }

        tx.commit()?;
        info!(documents = batch.len(), "Batch loaded");
        Ok(batch.len())
    }

    /// All documents and line items, ordered by surrogate key.
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, filename, document_id, name, description FROM documents ORDER BY id",
        )?;
        let documents = stmt
            .query_map([], Self::row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, item, quantity, unit_price, total FROM line_items ORDER BY id",
        )?;
        let line_items = stmt
            .query_map([], Self::row_to_line_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Snapshot {
            documents,
            line_items,
        })
    }

    /// Look up one document by filename.
    pub fn document(&self, filename: &str) -> Result<Option<StoredDocument>, StoreError> {
        let document = self
            .conn
            .query_row(
                "SELECT id, filename, document_id, name, description
                 FROM documents
                 WHERE filename = ?1",
                params![filename],
                Self::row_to_document,
            )
            .optional()?;

        let Some(document) = document else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, item, quantity, unit_price, total
             FROM line_items
             WHERE document_id = ?1
             ORDER BY id",
        )?;
        let line_items = stmt
            .query_map(params![document.id], Self::row_to_line_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(StoredDocument {
            document,
            line_items,
        }))
    }

    /// Get count of documents and line items
    pub fn counts(&self) -> Result<(usize, usize), StoreError> {
        let documents: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        let line_items: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM line_items", [], |row| row.get(0))?;
        Ok((documents, line_items))
    }

    /// Release the connection, surfacing any error SQLite reports on close.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::from(e))
    }

    fn row_to_document(row: &Row<'_>) -> rusqlite::Result<DocumentRow> {
        Ok(DocumentRow {
            id: row.get(0)?,
            filename: row.get(1)?,
            document_id: row.get(2)?,
            name: row.get(3)?,
            description: row.get(4)?,
        })
    }

    fn row_to_line_item(row: &Row<'_>) -> rusqlite::Result<LineItemRow> {
        Ok(LineItemRow {
            id: row.get(0)?,
            document_id: row.get(1)?,
            item: row.get(2)?,
            quantity: get_decimal(row, 3)?,
            unit_price: get_decimal(row, 4)?,
            total: get_decimal(row, 5)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn upsert_document(conn: &Connection, filename: &str, doc: &CanonicalDocument) -> Result<i64, StoreError> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM documents WHERE filename = ?1",
            params![filename],
            |row| row.get(0),
        )
        .optional()?;

    let id = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE documents
                 SET document_id = ?1, name = ?2, description = ?3, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?4",
                params![doc.document_id, doc.name, doc.description, id],
            )?;
            let removed = conn.execute("DELETE FROM line_items WHERE document_id = ?1", params![id])?;
            debug!(filename = %filename, id, removed, "Replacing line items");
            id
        }
        None => {
            conn.execute(
                "INSERT INTO documents (filename, document_id, name, description)
                 VALUES (?1, ?2, ?3, ?4)",
                params![filename, doc.document_id, doc.name, doc.description],
            )?;
            conn.last_insert_rowid()
        }
    };

    let mut stmt = conn.prepare_cached(
        "INSERT INTO line_items (document_id, item, quantity, unit_price, total)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for item in &doc.line_items {
        stmt.execute(params![
            id,
            item.item,
            decimal_text(item.quantity),
            decimal_text(item.unit_price),
            decimal_text(item.total),
        ])?;
    }

    Ok(id)
}

/// Two decimal places, rounding half away from zero.
fn decimal_text(value: Decimal) -> String {
    value
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .to_string()
}

fn get_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
