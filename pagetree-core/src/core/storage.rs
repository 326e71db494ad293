use crate::Result;
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const REQUIRED_TABLES: [&str; 6] = [
    "pages",
    "page_grantees",
    "revisions",
    "page_operations",
    "page_operation_members",
    "operations",
];

pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| crate::PageTreeError::from(e).classify())?;
        Self::init(conn)
    }

    /// Creates a private, non-persistent store.
    pub fn create_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| crate::PageTreeError::from(e).classify())?;

        // Validate database structure
        let placeholders = vec!["?"; REQUIRED_TABLES.len()].join(", ");
        let table_count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ({placeholders})"
            ),
            rusqlite::params_from_iter(REQUIRED_TABLES.iter()),
            |row| row.get(0),
        )?;

        if table_count != REQUIRED_TABLES.len() as i64 {
            return Err(crate::PageTreeError::NotFound(
                "Not a valid page tree database".to_string(),
            ));
        }

        register_regexp(&conn)?;
        Ok(Self { conn })
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        register_regexp(&conn)?;
        Ok(Self { conn })
    }

    /// Sets how long a writer waits for a competing connection's lock.
    pub fn set_busy_timeout(&self, millis: u64) -> Result<()> {
        self.conn.busy_timeout(Duration::from_millis(millis))?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Registers `regexp(pattern, text)` so that `text REGEXP pattern` works in queries.
///
/// The compiled pattern is cached per statement argument by SQLite's aux-data slot.
fn register_regexp(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let regex: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> std::result::Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            let text = ctx
                .get_raw(1)
                .as_str()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            Ok(regex.is_match(text))
        },
    )?;
    Ok(())
}

/// Runs an idempotent read, retrying up to `retries` extra times while the store is busy.
pub(crate) fn with_read_retries<T>(retries: u32, mut read: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match read().map_err(crate::PageTreeError::classify) {
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                log::warn!("store busy, retrying read ({attempt}/{retries}): {e}");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn table_names(storage: &Storage) -> Vec<String> {
        storage
            .connection()
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_create_storage() {
        let temp = NamedTempFile::new().unwrap();
        let storage = Storage::create(temp.path()).unwrap();

        let tables = table_names(&storage);
        for table in REQUIRED_TABLES {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_open_existing_storage() {
        let temp = NamedTempFile::new().unwrap();
        Storage::create(temp.path()).unwrap();

        let storage = Storage::open(temp.path()).unwrap();
        assert!(table_names(&storage).contains(&"pages".to_string()));
    }

    #[test]
    fn test_open_invalid_database() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), "not a database").unwrap();

        assert!(Storage::open(temp.path()).is_err());
    }

    #[test]
    fn test_published_path_is_unique_but_trash_may_repeat() {
        let storage = Storage::create_in_memory().unwrap();
        let conn = storage.connection();
        let insert = "INSERT INTO pages (id, path, status, created_at, updated_at) VALUES (?1, ?2, ?3, 0, 0)";
        conn.execute(insert, ["a", "/x", "published"]).unwrap();
        assert!(conn.execute(insert, ["b", "/x", "published"]).is_err());
        conn.execute(insert, ["c", "/trash/x", "deleted"]).unwrap();
        conn.execute(insert, ["d", "/trash/x", "deleted"]).unwrap();
    }

    #[test]
    fn test_regexp_function() {
        let storage = Storage::create_in_memory().unwrap();
        let matched: bool = storage
            .connection()
            .query_row("SELECT '/a/b' REGEXP '^/a/[^/]+$'", [], |row| row.get(0))
            .unwrap();
        assert!(matched);
    }

    #[test]
    fn test_restricted_pages_may_share_a_tree_path() {
        let storage = Storage::create_in_memory().unwrap();
        let conn = storage.connection();
        let insert = "INSERT INTO pages (id, path, grant_code, created_at, updated_at) VALUES (?1, ?2, ?3, 0, 0)";
        conn.execute(insert, rusqlite::params!["a", "/x", 1]).unwrap();
        conn.execute(insert, rusqlite::params!["b", "/x", 2]).unwrap();
        conn.execute(insert, rusqlite::params!["c", "/x", 2]).unwrap();
        assert!(conn.execute(insert, rusqlite::params!["d", "/x", 4]).is_err());
    }

    #[test]
    fn test_open_rejects_database_missing_tables() {
        let temp = NamedTempFile::new().unwrap();
        {
            let conn = Connection::open(temp.path()).unwrap();
            conn.execute_batch("CREATE TABLE pages (id TEXT PRIMARY KEY);").unwrap();
        }

        assert!(matches!(
            Storage::open(temp.path()),
            Err(crate::PageTreeError::NotFound(_))
        ));
    }

    #[test]
    fn test_read_retries_give_up_after_limit() {
        let mut calls = 0;
        let result: Result<()> = with_read_retries(2, || {
            calls += 1;
            Err(crate::PageTreeError::StoreUnavailable("busy".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}
