// Legacy (non-secure) key/value storage read during migration

use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{StorageError, StorageResult};

/// Legacy key holding the plaintext access token
pub const LEGACY_ACCESS_TOKEN_KEY: &str = "legacy_access_token";

/// Legacy key holding the stringified user id
pub const LEGACY_USER_ID_KEY: &str = "legacy_user_id";

/// Non-secure key/value store that older releases kept credentials in
pub trait LegacyStore: Send + Sync {
    fn read(&self, key: &str) -> StorageResult<Option<String>>;

    fn remove(&self, key: &str) -> StorageResult<()>;
}

/// Legacy store kept in a SQLite `auth_kv` table
pub struct SqliteLegacyStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteLegacyStore {
    /// Open the database at `path`, creating the table if it is missing
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path).map_err(|e| sqlite_error("auth_kv", e))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .map_err(|e| sqlite_error("auth_kv", e))?;

        tracing::debug!("Opened legacy store: {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a legacy entry (used to seed fixtures and by older tooling)
    pub fn insert(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.connection(key)?;
        conn.execute(
            "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
            [key, value],
        )
        .map_err(|e| sqlite_error(key, e))?;
        Ok(())
    }

    fn connection(&self, key: &str) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Backend {
            key: key.to_string(),
            message: "legacy store connection poisoned".to_string(),
        })
    }
}

impl LegacyStore for SqliteLegacyStore {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.connection(key)?;
        conn.query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| sqlite_error(key, e))
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let conn = self.connection(key)?;
        conn.execute("DELETE FROM auth_kv WHERE key = ?", [key])
            .map_err(|e| sqlite_error(key, e))?;
        Ok(())
    }
}

fn sqlite_error(key: &str, err: rusqlite::Error) -> StorageError {
    match err {
        rusqlite::Error::FromSqlConversionFailure(_, _, inner) => StorageError::Corrupt {
            key: key.to_string(),
            reason: inner.to_string(),
        },
        rusqlite::Error::InvalidColumnType(_, _, ty) => StorageError::Corrupt {
            key: key.to_string(),
            reason: format!("unexpected column type {}", ty),
        },
        other => StorageError::Backend {
            key: key.to_string(),
            message: other.to_string(),
        },
    }
}
