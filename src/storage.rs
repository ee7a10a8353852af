use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// Кто пишет боту; снимок берётся при первом появлении и больше не меняется.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Favorite {
    pub movie_id: u64,
    pub title: String,
}

const UNKNOWN_TITLE: &str = "Без названия";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id    INTEGER PRIMARY KEY,
    first_name TEXT,
    last_name  TEXT,
    handle     TEXT,
    joined_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS favorites (
    user_id     INTEGER NOT NULL,
    movie_id    INTEGER NOT NULL,
    movie_title TEXT,
    added_at    TEXT,
    PRIMARY KEY (user_id, movie_id),
    FOREIGN KEY (user_id) REFERENCES users(user_id)
);
";

/// Пользователи и их избранное в SQLite.
///
/// Соединение открывается на каждую операцию и живёт только внутри неё,
/// поэтому атомарность есть лишь на уровне одного оператора.
#[derive(Clone)]
pub struct FavoritesStore {
    path: PathBuf,
}

impl FavoritesStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let store = Self { path };
        store.run(migrate).await?;
        tracing::info!(path = %store.path.display(), "favorites store ready");
        Ok(store)
    }

    pub async fn ensure_user(&self, user: &UserProfile) -> Result<(), StoreError> {
        let user = user.clone();
        let inserted = self
            .run(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO users (user_id, first_name, last_name, handle, joined_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![user.user_id, user.first_name, user.last_name, user.handle, now()],
                )
            })
            .await
            .inspect_err(|e| tracing::error!(error = %e, "ensure_user failed"))?;
        if inserted > 0 {
            tracing::info!("new user registered");
        }
        Ok(())
    }

    /// Сначала проверка, потом вставка. Параллельный дубль упрётся в PK
    /// и тоже вернётся как `AlreadyExists`.
    pub async fn add_favorite(&self, user_id: i64, movie_id: u64, title: &str) -> Result<AddOutcome, StoreError> {
        let title = title.to_string();
        let movie = to_sql_id(movie_id);
        let outcome = self
            .run(move |conn| {
                let exists = conn
                    .query_row(
                        "SELECT 1 FROM favorites WHERE user_id = ?1 AND movie_id = ?2",
                        params![user_id, movie],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if exists {
                    return Ok(AddOutcome::AlreadyExists);
                }
                let res = conn.execute(
                    "INSERT INTO favorites (user_id, movie_id, movie_title, added_at) VALUES (?1, ?2, ?3, ?4)",
                    params![user_id, movie, title, now()],
                );
                match res {
                    Ok(_) => Ok(AddOutcome::Added),
                    Err(e) if is_duplicate(&e) => Ok(AddOutcome::AlreadyExists),
                    Err(e) => Err(e),
                }
            })
            .await
            .inspect_err(|e| tracing::error!(user_id, movie_id, error = %e, "add_favorite failed"))?;
        tracing::info!(user_id, movie_id, ?outcome, "add_favorite");
        Ok(outcome)
    }

    pub async fn remove_favorite(&self, user_id: i64, movie_id: u64) -> Result<RemoveOutcome, StoreError> {
        let movie = to_sql_id(movie_id);
        let deleted = self
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM favorites WHERE user_id = ?1 AND movie_id = ?2",
                    params![user_id, movie],
                )
            })
            .await
            .inspect_err(|e| tracing::error!(user_id, movie_id, error = %e, "remove_favorite failed"))?;
        if deleted > 0 {
            Ok(RemoveOutcome::Removed)
        } else {
            tracing::warn!(user_id, movie_id, "remove_favorite: not in favorites");
            Ok(RemoveOutcome::NotFound)
        }
    }

    /// Новые сверху.
    pub async fn list_favorites(&self, user_id: i64) -> Result<Vec<Favorite>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT movie_id, movie_title FROM favorites
                 WHERE user_id = ?1
                 ORDER BY added_at DESC, rowid DESC",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                let id: i64 = row.get(0)?;
                let title: Option<String> = row.get(1)?;
                Ok(Favorite {
                    movie_id: u64::try_from(id).unwrap_or_default(),
                    title: title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
        .inspect_err(|e| tracing::error!(user_id, error = %e, "list_favorites failed"))
    }

    /* ====== агрегаты для админки: при сбое ноль или пусто ====== */

    pub async fn count_users(&self) -> u64 {
        self.count("SELECT COUNT(*) FROM users").await
    }

    pub async fn count_favorites(&self) -> u64 {
        self.count("SELECT COUNT(*) FROM favorites").await
    }

    pub async fn all_user_ids(&self) -> Vec<i64> {
        let res = self
            .run(|conn| {
                let mut stmt = conn.prepare("SELECT user_id FROM users ORDER BY user_id")?;
                let ids = stmt.query_map([], |row| row.get::<_, i64>(0))?;
                ids.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await;
        res.unwrap_or_else(|e| {
            tracing::error!(error = %e, "all_user_ids failed");
            Vec::new()
        })
    }

    async fn count(&self, sql: &'static str) -> u64 {
        match self.run(move |conn| conn.query_row(sql, [], |row| row.get::<_, i64>(0))).await {
            Ok(n) => u64::try_from(n).unwrap_or_default(),
            Err(e) => {
                tracing::error!(%sql, error = %e, "count failed");
                0
            }
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let conn = connect(&path)?;
            Ok(f(&conn)?)
        })
        .await?
    }
}

fn connect(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Создаёт таблицы и дотягивает старые схемы: колонки добавляются,
/// значения переносятся из прежних `username` / `join_date` / `add_date`.
fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;

    let users = table_columns(conn, "users")?;
    add_missing_columns(conn, "users", &users, &[("handle", "TEXT"), ("joined_at", "TEXT")])?;
    if users.iter().any(|c| c == "username") {
        conn.execute("UPDATE users SET handle = username WHERE handle IS NULL", [])?;
    }
    backfill_timestamp(conn, "users", "joined_at", &users, &["join_date", "first_seen_timestamp"])?;
    conn.execute("UPDATE users SET joined_at = ?1 WHERE joined_at IS NULL", params![now()])?;

    let favorites = table_columns(conn, "favorites")?;
    add_missing_columns(conn, "favorites", &favorites, &[("movie_title", "TEXT"), ("added_at", "TEXT")])?;
    backfill_timestamp(conn, "favorites", "added_at", &favorites, &["add_date", "added_timestamp"])?;

    conn.execute("CREATE INDEX IF NOT EXISTS favorites_by_user ON favorites(user_id, added_at)", [])?;
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    names.collect()
}

fn add_missing_columns(
    conn: &Connection,
    table: &str,
    existing: &[String],
    wanted: &[(&str, &str)],
) -> rusqlite::Result<()> {
    for (column, ty) in wanted {
        if !existing.iter().any(|c| c == column) {
            tracing::info!(table, column, "adding missing column");
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {ty}"), [])?;
        }
    }
    Ok(())
}

/// Старые даты вида `2024-01-01 10:00:00` приводятся к тому же RFC 3339
/// с микросекундами, что пишет `now()`, иначе сортировка поедет.
fn backfill_timestamp(
    conn: &Connection,
    table: &str,
    column: &str,
    existing: &[String],
    legacy: &[&str],
) -> rusqlite::Result<()> {
    for old in legacy.iter().filter(|old| existing.iter().any(|c| c == *old)) {
        let moved = conn.execute(
            &format!(
                "UPDATE {table} SET {column} = strftime('%Y-%m-%dT%H:%M:%f000Z', {old})
                 WHERE {column} IS NULL AND {old} IS NOT NULL"
            ),
            [],
        )?;
        if moved > 0 {
            tracing::info!(table, from = *old, to = column, rows = moved, "backfilled timestamps");
        }
    }
    Ok(())
}

fn is_duplicate(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn to_sql_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
