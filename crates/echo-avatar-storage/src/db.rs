use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use echo_avatar_core::error::EchoAvatarError;

pub const SCHEMA_VERSION_CURRENT: i64 = 2;
pub const NICKNAME_KEY: &str = "nickname";
pub const SUPPORTED_PROFILE_KEYS: &[&str] = &[NICKNAME_KEY];

const STORE_FILE_EXTENSION: &str = "db";
const SIDECAR_SUFFIXES: &[&str] = &["-journal", "-wal", "-shm"];
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_USER_ID_LEN: usize = 128;

pub async fn call_blocking<T, F>(root: Arc<StoreRoot>, f: F) -> Result<T, EchoAvatarError>
where
    T: Send + 'static,
    F: FnOnce(&StoreRoot) -> Result<T, EchoAvatarError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(root.as_ref()))
        .await
        .map_err(|e| EchoAvatarError::TaskJoin(format!("store task join error: {e}")))?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn sql(self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub id: i64,
    pub user_id: String,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileField {
    pub key: String,
    pub value: String,
}

/// Privileged, highest-trust note about a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub id: i64,
    pub text: String,
    pub added_by: String,
    pub timestamp: i64,
}

/// Open-authored, lowest-trust note about a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Memory {
    pub id: i64,
    pub text: String,
    pub added_by: String,
    pub timestamp: i64,
}

/// User ids become file names, so only a conservative character set is allowed.
pub fn validate_user_id(user_id: &str) -> Result<(), EchoAvatarError> {
    if user_id.is_empty() {
        return Err(EchoAvatarError::Validation("user id is required".into()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EchoAvatarError::Validation(format!(
            "user id is longer than {MAX_USER_ID_LEN} characters"
        )));
    }
    if user_id.starts_with('.')
        || !user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@' | ':'))
    {
        return Err(EchoAvatarError::Validation(format!(
            "invalid user id: {user_id}"
        )));
    }
    Ok(())
}

pub fn validate_profile_key(key: &str) -> Result<(), EchoAvatarError> {
    if SUPPORTED_PROFILE_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(EchoAvatarError::UnsupportedProfileKey(key.to_string()))
    }
}

fn get_schema_version(conn: &Connection) -> Result<i64, EchoAvatarError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<(), EchoAvatarError> {
    conn.execute(
        "INSERT INTO db_meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    Ok(())
}

/// Additive only: tables are created when missing, existing ones are never altered or dropped.
fn apply_schema_migrations(conn: &Connection) -> Result<(), EchoAvatarError> {
    let mut version = get_schema_version(conn)?;
    if version < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chat_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );",
        )?;
        set_schema_version(conn, 1)?;
        version = 1;
    }
    if version < 2 {
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_chat_history_timestamp
                ON chat_history(timestamp, id);

            CREATE TABLE IF NOT EXISTS profile (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS annotations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                added_by TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                added_by TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );",
        )?;
        set_schema_version(conn, 2)?;
        version = 2;
    }
    if version != SCHEMA_VERSION_CURRENT {
        set_schema_version(conn, SCHEMA_VERSION_CURRENT)?;
    }
    Ok(())
}

/// Read-only probe of the stored schema version; 0 when `db_meta` does not exist yet.
fn peek_schema_version(conn: &Connection) -> Result<i64, EchoAvatarError> {
    let has_meta: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'db_meta')",
        [],
        |row| row.get(0),
    )?;
    if !has_meta {
        return Ok(0);
    }
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
}

/// Only stores behind `SCHEMA_VERSION_CURRENT` take the write lock to migrate.
fn prepare_connection(mut conn: Connection) -> Result<Connection, EchoAvatarError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    if peek_schema_version(&conn)? >= SCHEMA_VERSION_CURRENT {
        return Ok(conn);
    }
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    apply_schema_migrations(&tx)?;
    tx.commit()?;
    Ok(conn)
}

fn require_text(field: &str, text: &str) -> Result<(), EchoAvatarError> {
    if text.trim().is_empty() {
        return Err(EchoAvatarError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Directory holding one `<user_id>.db` file per monitored user.
#[derive(Debug, Clone)]
pub struct StoreRoot {
    dir: PathBuf,
}

impl StoreRoot {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, EchoAvatarError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(StoreRoot { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn store_path(&self, user_id: &str) -> Result<PathBuf, EchoAvatarError> {
        validate_user_id(user_id)?;
        Ok(self
            .dir
            .join(format!("{user_id}.{STORE_FILE_EXTENSION}")))
    }

    pub fn store_exists(&self, user_id: &str) -> Result<bool, EchoAvatarError> {
        Ok(self.store_path(user_id)?.is_file())
    }

    /// Open a store that must already exist. The schema is brought up to date on open.
    pub fn open_existing(&self, user_id: &str) -> Result<UserStore, EchoAvatarError> {
        let path = self.store_path(user_id)?;
        if !path.is_file() {
            return Err(EchoAvatarError::NotFound(user_id.to_string()));
        }
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(UserStore {
            user_id: user_id.to_string(),
            conn: prepare_connection(conn)?,
        })
    }

    /// Open a store, creating the file and all tables on first access.
    pub fn open_or_create(&self, user_id: &str) -> Result<UserStore, EchoAvatarError> {
        let path = self.store_path(user_id)?;
        std::fs::create_dir_all(&self.dir)?;
        let conn = Connection::open(&path)?;
        Ok(UserStore {
            user_id: user_id.to_string(),
            conn: prepare_connection(conn)?,
        })
    }

    pub fn ensure_schema(&self, user_id: &str) -> Result<(), EchoAvatarError> {
        self.open_or_create(user_id).map(drop)
    }

    /// Append one chat message. Blank text is ignored and yields `None`.
    pub fn append_message(
        &self,
        user_id: &str,
        text: &str,
        timestamp: i64,
    ) -> Result<Option<i64>, EchoAvatarError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let store = self.open_or_create(user_id)?;
        store.append_message(text, timestamp).map(Some)
    }

    pub fn set_profile_field(
        &self,
        user_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), EchoAvatarError> {
        validate_user_id(user_id)?;
        validate_profile_key(key)?;
        require_text("profile value", value)?;
        self.open_or_create(user_id)?.set_profile_field(key, value)
    }

    pub fn add_annotation(
        &self,
        user_id: &str,
        text: &str,
        author: &str,
    ) -> Result<i64, EchoAvatarError> {
        validate_user_id(user_id)?;
        require_text("annotation", text)?;
        self.open_or_create(user_id)?.add_annotation(text, author)
    }

    pub fn add_memory(
        &self,
        user_id: &str,
        text: &str,
        author: &str,
    ) -> Result<i64, EchoAvatarError> {
        validate_user_id(user_id)?;
        require_text("memory", text)?;
        self.open_or_create(user_id)?.add_memory(text, author)
    }

    pub fn count_messages(&self, user_id: &str) -> Result<i64, EchoAvatarError> {
        self.open_existing(user_id)?.count_messages()
    }

    /// Remove the user's store file and any SQLite sidecars. Irreversible.
    pub fn delete_store(&self, user_id: &str) -> Result<(), EchoAvatarError> {
        let path = self.store_path(user_id)?;
        if !path.is_file() {
            return Err(EchoAvatarError::NotFound(user_id.to_string()));
        }
        std::fs::remove_file(&path)?;
        for suffix in SIDECAR_SUFFIXES {
            let mut sidecar = path.clone().into_os_string();
            sidecar.push(suffix);
            let sidecar = PathBuf::from(sidecar);
            if sidecar.exists() {
                std::fs::remove_file(&sidecar)?;
            }
        }
        info!(user_id, path = %path.display(), "deleted user store");
        Ok(())
    }

    pub fn list_all_user_ids(&self) -> Result<Vec<String>, EchoAvatarError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(STORE_FILE_EXTENSION)
            {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_user_id(stem).is_ok() {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// One open connection to a user's store. The connection closes when this value drops.
#[derive(Debug)]
pub struct UserStore {
    user_id: String,
    conn: Connection,
}

impl UserStore {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn append_message(&self, text: &str, timestamp: i64) -> Result<i64, EchoAvatarError> {
        require_text("message", text)?;
        self.conn.execute(
            "INSERT INTO chat_history (user_id, message, timestamp) VALUES (?1, ?2, ?3)",
            params![self.user_id, text, timestamp],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_profile_field(&self, key: &str, value: &str) -> Result<(), EchoAvatarError> {
        validate_profile_key(key)?;
        require_text("profile value", value)?;
        self.conn.execute(
            "INSERT INTO profile (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn add_annotation(&self, text: &str, author: &str) -> Result<i64, EchoAvatarError> {
        require_text("annotation", text)?;
        self.conn.execute(
            "INSERT INTO annotations (content, added_by, timestamp) VALUES (?1, ?2, ?3)",
            params![text, author, chrono::Utc::now().timestamp()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_memory(&self, text: &str, author: &str) -> Result<i64, EchoAvatarError> {
        require_text("memory", text)?;
        self.conn.execute(
            "INSERT INTO memories (content, added_by, timestamp) VALUES (?1, ?2, ?3)",
            params![text, author, chrono::Utc::now().timestamp()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn count_messages(&self) -> Result<i64, EchoAvatarError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM chat_history", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn list_recent_messages(
        &self,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<ChatMessage>, EchoAvatarError> {
        // Newest `limit` rows first, then re-ordered as requested.
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, message, timestamp
             FROM chat_history
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
        )?;
        let mut messages = stmt
            .query_map(params![limit as i64], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        if order == SortOrder::Ascending {
            messages.reverse();
        }
        Ok(messages)
    }

    pub fn list_all_messages(&self) -> Result<Vec<ChatMessage>, EchoAvatarError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, message, timestamp
             FROM chat_history
             ORDER BY timestamp ASC, id ASC",
        )?;
        let messages = stmt
            .query_map([], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn list_annotations(&self, order: SortOrder) -> Result<Vec<Annotation>, EchoAvatarError> {
        let sql = format!(
            "SELECT id, content, added_by, timestamp FROM annotations ORDER BY timestamp {0}, id {0}",
            order.sql()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Annotation {
                    id: row.get(0)?,
                    text: row.get(1)?,
                    added_by: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_memories(&self, order: SortOrder) -> Result<Vec<Memory>, EchoAvatarError> {
        let sql = format!(
            "SELECT id, content, added_by, timestamp FROM memories ORDER BY timestamp {0}, id {0}",
            order.sql()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Memory {
                    id: row.get(0)?,
                    text: row.get(1)?,
                    added_by: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_profile(&self) -> Result<Vec<ProfileField>, EchoAvatarError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM profile ORDER BY key ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ProfileField {
                    key: row.get(0)?,
                    value: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn nickname(&self) -> Result<Option<String>, EchoAvatarError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM profile WHERE key = ?1",
                params![NICKNAME_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        user_id: row.get(1)?,
        text: row.get(2)?,
        timestamp: row.get(3)?,
    })
}
