//! SQLite storage
//!
//! This module handles:
//! - Database initialization and migrations
//! - The document store used as the remote store for user records and downloads
//! - Account rows for the local identity provider
//!
//! Documents are stored one row per `collection/key`; deeper paths are
//! resolved inside the row's JSON value.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{
    now_millis, push_key, resolve_server_values, tree_get, tree_set, tree_update,
    validate_fields, RemoteStore,
};
use crate::types::DocPath;

/// Schema migrations, applied in order and recorded in `schema_migrations`
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema",
    include_str!("../db/migrations/001_initial_schema.sql"),
)];

/// Open the database at the given path, running any pending migrations
pub fn init_db(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    // Enable foreign keys
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let count = run_migrations(&conn)?;
    if count > 0 {
        info!(count = count, "Applied migrations");
    }

    Ok(conn)
}

/// Run pending migrations, returning how many were applied
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    let mut applied = 0;

    for (version, sql) in MIGRATIONS {
        let already_applied: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
            [version],
            |row| row.get(0),
        )?;

        if already_applied {
            continue;
        }

        conn.execute_batch(sql)
            .with_context(|| format!("Failed to apply migration: {}", version))?;

        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            [version],
        )?;

        debug!(version = %version, "Applied migration");
        applied += 1;
    }

    Ok(applied)
}

// ========== documents ==========

/// Row key (`collection/key`) and the remaining segments inside the row.
fn split_doc_path(path: &DocPath) -> Option<(String, &[String])> {
    match path.segments() {
        [collection, key, rest @ ..] => Some((format!("{}/{}", collection, key), rest)),
        _ => None,
    }
}

fn read_doc(conn: &Connection, key: &str) -> Result<Option<Value>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM documents WHERE path = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;

    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(StoreError::from)
}

/// Store a document; absent values (null or empty object) delete the row
fn write_doc(conn: &Connection, key: &str, value: &Value) -> Result<(), StoreError> {
    let absent = match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };

    if absent {
        conn.execute("DELETE FROM documents WHERE path = ?1", [key])?;
        return Ok(());
    }

    conn.execute(
        "INSERT INTO documents (path, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(path) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

/// All documents of a collection as one object keyed by document key
fn read_collection(conn: &Connection, collection: &str) -> Result<Option<Value>, StoreError> {
    let prefix = format!("{}/", collection);
    let mut stmt = conn.prepare(
        "SELECT path, value FROM documents WHERE substr(path, 1, ?1) = ?2 ORDER BY path ASC",
    )?;

    let rows = stmt
        .query_map(params![prefix.len() as i64, prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut children = Map::new();
    for (path, raw) in rows {
        let key = path[prefix.len()..].to_string();
        children.insert(key, serde_json::from_str(&raw)?);
    }

    if children.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Value::Object(children)))
    }
}

fn delete_collection(conn: &Connection, collection: &str) -> Result<usize, StoreError> {
    let prefix = format!("{}/", collection);
    let deleted = conn.execute(
        "DELETE FROM documents WHERE substr(path, 1, ?1) = ?2",
        params![prefix.len() as i64, prefix],
    )?;
    Ok(deleted)
}

fn once_blocking(conn: &Connection, path: &DocPath) -> Result<Option<Value>, StoreError> {
    match path.segments() {
        [] => Err(StoreError::InvalidPath(path.to_string())),
        [collection] => read_collection(conn, collection),
        _ => {
            let Some((key, rest)) = split_doc_path(path) else {
                return Err(StoreError::InvalidPath(path.to_string()));
            };
            Ok(read_doc(conn, &key)?.and_then(|doc| tree_get(&doc, rest).cloned()))
        }
    }
}

fn set_blocking(conn: &mut Connection, path: &DocPath, value: Value) -> Result<(), StoreError> {
    match path.segments() {
        [] => Err(StoreError::InvalidPath(path.to_string())),
        [collection] => {
            let tx = conn.transaction()?;
            delete_collection(&tx, collection)?;
            if let Value::Object(children) = value {
                for (key, child) in children {
                    write_doc(&tx, &format!("{}/{}", collection, key), &child)?;
                }
            }
            tx.commit()?;
            Ok(())
        }
        _ => {
            let Some((key, rest)) = split_doc_path(path) else {
                return Err(StoreError::InvalidPath(path.to_string()));
            };
            let tx = conn.transaction()?;
            let mut doc = read_doc(&tx, &key)?.unwrap_or(Value::Null);
            tree_set(&mut doc, rest, value);
            write_doc(&tx, &key, &doc)?;
            tx.commit()?;
            Ok(())
        }
    }
}

fn update_blocking(
    conn: &mut Connection,
    path: &DocPath,
    fields: Map<String, Value>,
) -> Result<(), StoreError> {
    match path.segments() {
        [] => Err(StoreError::InvalidPath(path.to_string())),
        [collection] => {
            let tx = conn.transaction()?;
            for (key, child) in fields {
                write_doc(&tx, &format!("{}/{}", collection, key), &child)?;
            }
            tx.commit()?;
            Ok(())
        }
        _ => {
            let Some((key, rest)) = split_doc_path(path) else {
                return Err(StoreError::InvalidPath(path.to_string()));
            };
            let tx = conn.transaction()?;
            let mut doc = read_doc(&tx, &key)?.unwrap_or(Value::Null);
            tree_update(&mut doc, rest, fields);
            write_doc(&tx, &key, &doc)?;
            tx.commit()?;
            Ok(())
        }
    }
}

/// Document store kept in the local SQLite database.
///
/// Calls run on the blocking pool; the connection is shared with the
/// local identity provider.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    online: Arc<watch::Sender<bool>>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            conn: Arc::new(Mutex::new(conn)),
            online: Arc::new(online),
        }
    }

    /// Open (and migrate) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::new(init_db(db_path)?))
    }

    /// The underlying connection, for account queries.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn once(&self, path: &DocPath) -> Result<Option<Value>, StoreError> {
        path.validate()?;
        let path = path.clone();
        self.with_conn(move |conn| once_blocking(conn, &path)).await
    }

    async fn set(&self, path: &DocPath, mut value: Value) -> Result<(), StoreError> {
        path.validate()?;
        resolve_server_values(&mut value, now_millis());
        let target = path.clone();
        self.with_conn(move |conn| set_blocking(conn, &target, value))
            .await?;
        debug!(path = %path, "sqlite set");
        Ok(())
    }

    async fn update(
        &self,
        path: &DocPath,
        mut fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        path.validate()?;
        validate_fields(path, &fields)?;
        let now = now_millis();
        fields
            .values_mut()
            .for_each(|v| resolve_server_values(v, now));
        let target = path.clone();
        self.with_conn(move |conn| update_blocking(conn, &target, fields))
            .await?;
        debug!(path = %path, "sqlite update");
        Ok(())
    }

    async fn push(&self, path: &DocPath, value: Value) -> Result<String, StoreError> {
        let key = push_key();
        self.set(&path.clone().child(&key), value).await?;
        Ok(key)
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

// ========== accounts ==========

/// A row of the `accounts` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub uid: String,
    pub email: String,
    /// `None` for accounts created through an OAuth provider
    pub password_hash: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub email_verified: bool,
    pub disabled: bool,
    pub failed_attempts: u32,
}

const ACCOUNT_COLUMNS: &str =
    "uid, email, password_hash, display_name, photo_url, email_verified, disabled, failed_attempts";

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        uid: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        display_name: row.get(3)?,
        photo_url: row.get(4)?,
        email_verified: row.get::<_, i32>(5)? != 0,
        disabled: row.get::<_, i32>(6)? != 0,
        failed_attempts: row.get(7)?,
    })
}

pub fn insert_account(conn: &Connection, account: &Account) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO accounts (uid, email, password_hash, display_name, photo_url, email_verified, disabled, failed_attempts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            account.uid,
            account.email,
            account.password_hash,
            account.display_name,
            account.photo_url,
            account.email_verified as i32,
            account.disabled as i32,
            account.failed_attempts,
        ],
    )?;
    Ok(())
}

/// Look up an account by email (case-insensitive)
pub fn get_account_by_email(conn: &Connection, email: &str) -> rusqlite::Result<Option<Account>> {
    conn.query_row(
        &format!("SELECT {} FROM accounts WHERE email = ?1", ACCOUNT_COLUMNS),
        [email],
        account_from_row,
    )
    .optional()
}

pub fn get_account(conn: &Connection, uid: &str) -> rusqlite::Result<Option<Account>> {
    conn.query_row(
        &format!("SELECT {} FROM accounts WHERE uid = ?1", ACCOUNT_COLUMNS),
        [uid],
        account_from_row,
    )
    .optional()
}

/// Count a failed sign-in and return the new consecutive failure count
pub fn record_failed_attempt(conn: &Connection, uid: &str) -> rusqlite::Result<u32> {
    conn.execute(
        "UPDATE accounts SET failed_attempts = failed_attempts + 1 WHERE uid = ?1",
        [uid],
    )?;
    conn.query_row(
        "SELECT failed_attempts FROM accounts WHERE uid = ?1",
        [uid],
        |row| row.get(0),
    )
}

pub fn reset_failed_attempts(conn: &Connection, uid: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE accounts SET failed_attempts = 0 WHERE uid = ?1",
        [uid],
    )?;
    Ok(())
}

pub fn set_display_name(
    conn: &Connection,
    uid: &str,
    display_name: &str,
) -> rusqlite::Result<bool> {
    let affected = conn.execute(
        "UPDATE accounts SET display_name = ?1 WHERE uid = ?2",
        params![display_name, uid],
    )?;
    Ok(affected > 0)
}

#[cfg(test)]
pub fn set_disabled(conn: &Connection, uid: &str, disabled: bool) -> rusqlite::Result<bool> {
    let affected = conn.execute(
        "UPDATE accounts SET disabled = ?1 WHERE uid = ?2",
        params![disabled as i32, uid],
    )?;
    Ok(affected > 0)
}

pub fn insert_password_reset(conn: &Connection, token: &str, uid: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO password_resets (token, uid) VALUES (?1, ?2)",
        params![token, uid],
    )?;
    Ok(())
}

#[cfg(test)]
pub fn count_password_resets(conn: &Connection, uid: &str) -> rusqlite::Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM password_resets WHERE uid = ?1",
        [uid],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup_test_db() -> (TempDir, Connection) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let conn = init_db(&db_path).unwrap();
        (temp_dir, conn)
    }

    fn setup_test_store() -> (TempDir, SqliteStore) {
        let (temp_dir, conn) = setup_test_db();
        (temp_dir, SqliteStore::new(conn))
    }

    fn path(raw: &str) -> DocPath {
        DocPath::parse(raw).unwrap()
    }

    fn make_account(uid: &str, email: &str) -> Account {
        Account {
            uid: uid.to_string(),
            email: email.to_string(),
            password_hash: Some("hash".to_string()),
            display_name: None,
            photo_url: None,
            email_verified: false,
            disabled: false,
            failed_attempts: 0,
        }
    }

    // ========== init_db tests ==========

    #[test]
    fn test_init_db_creates_tables() {
        let (_temp_dir, conn) = setup_test_db();

        for table in ["documents", "accounts", "password_resets", "schema_migrations"] {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "missing table {}", table);
        }
    }

    #[test]
    fn test_init_db_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let conn1 = init_db(&db_path).unwrap();
        drop(conn1);
        let conn2 = init_db(&db_path).unwrap();

        assert_eq!(run_migrations(&conn2).unwrap(), 0);
    }

    // ========== document store tests ==========

    #[tokio::test]
    async fn test_set_and_once_nested_path() {
        let (_temp_dir, store) = setup_test_store();

        store
            .set(&path("users/u1/favorites"), json!(["EENG 101", "EENG 202"]))
            .await
            .unwrap();

        let favorites = store.once(&path("users/u1/favorites")).await.unwrap();
        assert_eq!(favorites, Some(json!(["EENG 101", "EENG 202"])));

        let user = store.once(&DocPath::user("u1")).await.unwrap().unwrap();
        assert_eq!(user, json!({ "favorites": ["EENG 101", "EENG 202"] }));
    }

    #[tokio::test]
    async fn test_once_missing_is_none() {
        let (_temp_dir, store) = setup_test_store();
        assert_eq!(store.once(&path("users/nobody")).await.unwrap(), None);
        assert_eq!(store.once(&path("users/nobody/name")).await.unwrap(), None);
        assert_eq!(store.once(&path("users")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_root_path_rejected() {
        let (_temp_dir, store) = setup_test_store();
        assert!(matches!(
            store.once(&DocPath::root()).await,
            Err(StoreError::InvalidPath(_))
        ));
        assert!(matches!(
            store.set(&DocPath::root(), json!(1)).await,
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_update_merges_and_resolves_timestamps() {
        let (_temp_dir, store) = setup_test_store();
        store
            .set(
                &DocPath::user("u1"),
                json!({ "name": "Ada", "sessionsCompleted": 3, "totalMinutes": 75 }),
            )
            .await
            .unwrap();

        let mut fields = Map::new();
        fields.insert("sessionsCompleted".into(), json!(4));
        fields.insert("totalMinutes".into(), json!(100));
        fields.insert("lastActivity".into(), json!({ ".sv": "timestamp" }));
        store.update(&DocPath::user("u1"), fields).await.unwrap();

        let user = store.once(&DocPath::user("u1")).await.unwrap().unwrap();
        assert_eq!(user["name"], json!("Ada"));
        assert_eq!(user["sessionsCompleted"], json!(4));
        assert_eq!(user["totalMinutes"], json!(100));
        assert!(user["lastActivity"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_set_null_deletes_document() {
        let (_temp_dir, store) = setup_test_store();
        store.set(&path("users/u1/name"), json!("Ada")).await.unwrap();
        store.set(&path("users/u1/name"), Value::Null).await.unwrap();

        assert_eq!(store.once(&DocPath::user("u1")).await.unwrap(), None);
        let conn = store.connection();
        let rows: i64 = conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_push_and_read_collection() {
        let (_temp_dir, store) = setup_test_store();

        let k1 = store
            .push(&DocPath::downloads(), json!({ "courseName": "A" }))
            .await
            .unwrap();
        let k2 = store
            .push(&DocPath::downloads(), json!({ "courseName": "B" }))
            .await
            .unwrap();

        let all = store.once(&DocPath::downloads()).await.unwrap().unwrap();
        let all = all.as_object().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&k1]["courseName"], json!("A"));
        assert_eq!(all[&k2]["courseName"], json!("B"));
    }

    #[tokio::test]
    async fn test_collection_prefix_does_not_leak() {
        let (_temp_dir, store) = setup_test_store();
        store.set(&path("users/u1/name"), json!("Ada")).await.unwrap();
        store.set(&path("users_archive/u9/name"), json!("Old")).await.unwrap();

        let users = store.once(&DocPath::users()).await.unwrap().unwrap();
        assert_eq!(users.as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_collection_replaces_children() {
        let (_temp_dir, store) = setup_test_store();
        store.set(&path("users/u1/name"), json!("Ada")).await.unwrap();
        store
            .set(&DocPath::users(), json!({ "u2": { "name": "Grace" } }))
            .await
            .unwrap();

        let users = store.once(&DocPath::users()).await.unwrap().unwrap();
        assert_eq!(users, json!({ "u2": { "name": "Grace" } }));
    }

    // ========== account tests ==========

    #[test]
    fn test_insert_and_get_account() {
        let (_temp_dir, conn) = setup_test_db();
        insert_account(&conn, &make_account("u1", "ada@uni.edu")).unwrap();

        let by_email = get_account_by_email(&conn, "ADA@uni.edu").unwrap().unwrap();
        assert_eq!(by_email.uid, "u1");
        let by_uid = get_account(&conn, "u1").unwrap().unwrap();
        assert_eq!(by_uid, by_email);
        assert!(get_account(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_email_rejected() {
        let (_temp_dir, conn) = setup_test_db();
        insert_account(&conn, &make_account("u1", "ada@uni.edu")).unwrap();
        assert!(insert_account(&conn, &make_account("u2", "Ada@Uni.edu")).is_err());
    }

    #[test]
    fn test_failed_attempts_counter() {
        let (_temp_dir, conn) = setup_test_db();
        insert_account(&conn, &make_account("u1", "ada@uni.edu")).unwrap();

        assert_eq!(record_failed_attempt(&conn, "u1").unwrap(), 1);
        assert_eq!(record_failed_attempt(&conn, "u1").unwrap(), 2);
        reset_failed_attempts(&conn, "u1").unwrap();
        assert_eq!(get_account(&conn, "u1").unwrap().unwrap().failed_attempts, 0);
    }

    #[test]
    fn test_set_display_name_and_disabled() {
        let (_temp_dir, conn) = setup_test_db();
        insert_account(&conn, &make_account("u1", "ada@uni.edu")).unwrap();

        assert!(set_display_name(&conn, "u1", "Ada L").unwrap());
        assert!(!set_display_name(&conn, "missing", "x").unwrap());
        assert!(set_disabled(&conn, "u1", true).unwrap());

        let account = get_account(&conn, "u1").unwrap().unwrap();
        assert_eq!(account.display_name.as_deref(), Some("Ada L"));
        assert!(account.disabled);
    }

    #[test]
    fn test_password_resets_cascade_with_account() {
        let (_temp_dir, conn) = setup_test_db();
        insert_account(&conn, &make_account("u1", "ada@uni.edu")).unwrap();
        insert_password_reset(&conn, "tok-1", "u1").unwrap();
        assert_eq!(count_password_resets(&conn, "u1").unwrap(), 1);

        conn.execute("DELETE FROM accounts WHERE uid = 'u1'", [])
            .unwrap();
        assert_eq!(count_password_resets(&conn, "u1").unwrap(), 0);
    }
}
