//! SQLite-backed identity store.

use chrono::{DateTime, Utc};
use facetrack_core::{Embedding, Identity, IdentityStore, StoreError};
use rusqlite::{params, Connection, ErrorCode, Row};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id          TEXT PRIMARY KEY,
    name        TEXT,
    email       TEXT,
    embedding   BLOB,
    last_visit  TEXT NOT NULL,
    visit_count INTEGER NOT NULL DEFAULT 1
);
";

pub struct SqliteStore {
    conn: Connection,
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        tracing::info!(path = %path.display(), "identity database opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self { conn })
    }

    fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<Identity> {
        let id: String = row.get(0)?;
        let blob: Option<Vec<u8>> = row.get(3)?;
        let last_visit: String = row.get(4)?;
        let visit_count: i64 = row.get(5)?;

        let embedding = blob.and_then(|bytes| {
            let decoded = Embedding::from_le_bytes(&bytes);
            if decoded.is_none() {
                tracing::warn!(id = %id, len = bytes.len(), "undecodable embedding blob");
            }
            decoded
        });
        let last_visit = DateTime::parse_from_rfc3339(&last_visit)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|e| {
                tracing::warn!(id = %id, error = %e, "bad last_visit timestamp");
                DateTime::<Utc>::default()
            });

        Ok(Identity {
            name: row.get(1)?,
            email: row.get(2)?,
            embedding,
            last_visit,
            visit_count: u32::try_from(visit_count.max(1)).unwrap_or(u32::MAX),
            id,
        })
    }
}

impl IdentityStore for SqliteStore {
    fn fetch_all(&mut self) -> Result<Vec<Identity>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, email, embedding, last_visit, visit_count
                 FROM identities ORDER BY rowid",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], Self::row_to_identity)
            .map_err(backend)?;
        let identities = rows.collect::<Result<Vec<_>, _>>().map_err(backend)?;
        Ok(identities)
    }

    fn insert(&mut self, identity: &Identity) -> Result<String, StoreError> {
        let blob = identity.embedding.as_ref().map(Embedding::to_le_bytes);
        let result = self.conn.execute(
            "INSERT INTO identities (id, name, email, embedding, last_visit, visit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                identity.id,
                identity.name,
                identity.email,
                blob,
                identity.last_visit.to_rfc3339(),
                identity.visit_count,
            ],
        );
        match result {
            Ok(_) => Ok(identity.id.clone()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::Duplicate(identity.id.clone()))
            }
            Err(e) => Err(backend(e)),
        }
    }

    fn update_visit(&mut self, id: &str) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE identities
                 SET last_visit = ?1, visit_count = visit_count + 1
                 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_fetch_update() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let first = Identity::first_sighting(Embedding::new(vec![0.25, -0.5, 1.0]));
        let second = Identity::first_sighting(Embedding::new(vec![1.0, 1.0, 1.0]));
        store.insert(&first).unwrap();
        store.insert(&second).unwrap();

        store.update_visit(&first.id).unwrap();
        let all = store.fetch_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first.id);
        assert_eq!(all[0].visit_count, 2);
        assert_eq!(all[0].embedding, first.embedding);
        assert!(all[0].last_visit >= first.last_visit);
        assert_eq!(all[1].id, second.id);
        assert_eq!(all[1].visit_count, 1);
    }

    #[test]
    fn test_update_unknown_identity() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(store.update_visit("nobody"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_insert() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let identity = Identity::first_sighting(Embedding::new(vec![0.0; 4]));
        store.insert(&identity).unwrap();
        assert!(matches!(store.insert(&identity), Err(StoreError::Duplicate(_))));
    }

    #[test]
    fn test_rows_without_embedding() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO identities (id, name, email, embedding, last_visit)
                 VALUES ('walk-in', 'Ada', 'ada@example.com', NULL, '2024-05-01T10:00:00+00:00')",
                [],
            )
            .unwrap();
        let all = store.fetch_all().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].embedding.is_none());
        assert_eq!(all[0].name.as_deref(), Some("Ada"));
        assert_eq!(all[0].visit_count, 1);
    }

    #[test]
    fn test_last_visit_is_required() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.conn.execute(
            "INSERT INTO identities (id, last_visit) VALUES ('ghost', NULL)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identities.db");
        let identity = Identity::first_sighting(Embedding::new(vec![0.5; 8]));
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.insert(&identity).unwrap();
        }
        let mut store = SqliteStore::open(&path).unwrap();
        let all = store.fetch_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, identity.id);
    }
}
