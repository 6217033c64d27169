//! SQLite implementations of [`DurableStore`] and [`SharedCache`].
//!
//! Rows are stored as JSON TEXT keyed by storage key; filters are evaluated
//! with `json_extract`, with both the JSON path and the param bound as SQL
//! parameters. Every multi-row write runs in a transaction. Several
//! processes may open the same file: WAL mode plus a busy timeout lets them
//! share it as a durable store and as a shared cache tier.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};

use keystone_core::{CacheValue, Clock, EntityIdentity, FieldValue, Filter, Record, StorageKey};

use crate::error::{CacheError, StorageError};
use crate::traits::{expiry, DurableStore, SharedCache};

/// Converts a field value into a bindable SQLite value. Booleans bind as
/// integers because that is what `json_extract` yields for JSON booleans.
fn to_sql_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(v) => Value::Integer(i64::from(*v)),
        FieldValue::Int(v) => Value::Integer(*v),
        FieldValue::Float(v) => Value::Real(*v),
        FieldValue::Text(v) => Value::Text(v.clone()),
    }
}

/// Builds `WHERE collection = ?1 AND json_extract(record_json, ?n) IS ?m ...`
/// and its bound values.
fn where_clause(collection: &str, filter: &Filter) -> (String, Vec<Value>) {
    let mut sql = String::from(" WHERE collection = ?1");
    let mut values = vec![Value::Text(collection.to_string())];
    for (field, param) in filter.clauses() {
        values.push(Value::Text(format!("$.{}", field)));
        let path_index = values.len();
        values.push(to_sql_value(param));
        sql.push_str(&format!(
            " AND json_extract(record_json, ?{}) IS ?{}",
            path_index,
            path_index + 1
        ));
    }
    (sql, values)
}

/// SQLite-backed durable store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at `path`.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DurableStore for SqliteStore {
    fn find(&self, collection: &str, filter: &Filter) -> Result<Record, StorageError> {
        let (clause, values) = where_clause(collection, filter);
        let sql = format!(
            "SELECT record_json FROM entities{} ORDER BY storage_key LIMIT 1",
            clause
        );

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let json: Option<String> = stmt
            .query_row(params_from_iter(values.iter()), |row| row.get(0))
            .optional()?;

        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StorageError::NotFound {
                collection: collection.to_string(),
                filter: filter.to_string(),
            }),
        }
    }

    fn insert(&self, identity: &EntityIdentity, record: &Record) -> Result<usize, StorageError> {
        let key = identity.storage_key();
        let json = serde_json::to_string(record)?;

        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO entities (storage_key, collection, record_json) VALUES (?1, ?2, ?3)",
            params![key.as_str(), identity.collection(), json],
        );
        match result {
            Ok(rows) => Ok(rows),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::Duplicate {
                    key: key.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn update(
        &self,
        collection: &str,
        changes: &Record,
        key: &Filter,
    ) -> Result<usize, StorageError> {
        let (clause, values) = where_clause(collection, key);
        let select = format!("SELECT storage_key, record_json FROM entities{}", clause);

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let matching: Vec<(String, String)> = {
            let mut stmt = tx.prepare_cached(&select)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        {
            let mut stmt =
                tx.prepare_cached("UPDATE entities SET record_json = ?1 WHERE storage_key = ?2")?;
            for (storage_key, json) in &matching {
                let mut record: Record = serde_json::from_str(json)?;
                for (field, value) in changes {
                    record.insert(field.clone(), value.clone());
                }
                stmt.execute(params![serde_json::to_string(&record)?, storage_key])?;
            }
        }

        tx.commit()?;
        Ok(matching.len())
    }
}

/// SQLite-backed shared cache tier.
///
/// Entries carry an absolute expiry in unix millis read from the injected
/// clock; expired entries are dropped lazily on read or by
/// [`SqliteCache::purge_expired`].
pub struct SqliteCache {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteCache {
    /// Opens (or creates) a cache database at `path`.
    pub fn new(path: &str, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteCache {
            conn: Mutex::new(conn),
            clock,
        })
    }

    /// Opens an in-memory cache database (for testing).
    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteCache {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deletes every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.now_millis();
        let conn = self.lock();
        let purged = conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?1",
            params![now],
        )?;
        tracing::debug!(purged, "expired cache entries purged");
        Ok(purged)
    }
}

impl SharedCache for SqliteCache {
    fn get(&self, key: &StorageKey) -> Result<Option<CacheValue>, CacheError> {
        let now = self.clock.now_millis();
        let conn = self.lock();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value_json, expires_at FROM cache_entries WHERE cache_key = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((_, expires_at)) if expires_at <= now => {
                conn.execute(
                    "DELETE FROM cache_entries WHERE cache_key = ?1 AND expires_at <= ?2",
                    params![key.as_str(), now],
                )?;
                Ok(None)
            }
            Some((json, _)) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    fn set(&self, key: &StorageKey, value: &CacheValue, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = expiry(self.clock.now_millis(), ttl);
        let json = serde_json::to_string(value)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO cache_entries (cache_key, value_json, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(cache_key) DO UPDATE SET value_json = excluded.value_json, expires_at = excluded.expires_at",
            params![key.as_str(), json, expires_at],
        )?;
        Ok(())
    }

    fn delete(&self, key: &StorageKey) -> Result<(), CacheError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM cache_entries WHERE cache_key = ?1",
            params![key.as_str()],
        )?;
        Ok(())
    }
}
