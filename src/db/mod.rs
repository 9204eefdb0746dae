use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

pub mod models;

use models::perms;

/// Opens the service database, creating its directory on a fresh install,
/// and brings the schema up to date.
///
/// Connection tuning follows the write patterns of this service: uploads
/// commit through short per-request transactions while the retention
/// sweeper and bulk deleter batch their writes in the background. WAL mode
/// lets those writers proceed under concurrent list queries, and the busy
/// timeout absorbs the moments where a sweep and an upload still collide
/// on the single writer slot.
pub async fn open(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    // `database/db.sqlite3` ships as nothing but a config default; the
    // directory has to appear before SQLite can create the file.
    if let Some(file) = database_file(database_url) {
        if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    // Migrations are embedded at compile time; the binary carries its own
    // schema history.
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Extracts the on-disk file behind a SQLite URL, if there is one.
/// `sqlite:database/db.sqlite3?mode=rwc` → `database/db.sqlite3`.
fn database_file(database_url: &str) -> Option<&Path> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(Path::new(path))
}

/// Re-creates the root account whenever the users table is empty.
///
/// The generated password is logged exactly once; there is no other way to
/// retrieve it. Root cannot be renamed, disabled, or deleted through the
/// API, so a wiped table is the only state in which this runs.
pub async fn ensure_root_user(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;
    if count > 0 {
        return Ok(());
    }

    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    let salt: Vec<u8> = rand::thread_rng()
        .sample_iter(&rand::distributions::Standard)
        .take(16)
        .collect();
    let hash = argon2::hash_encoded(password.as_bytes(), &salt, &argon2::Config::default())
        .map_err(|e| sqlx::Error::Protocol(format!("argon2: {e}")))?;
    let token = crate::auth::generate_token();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO users (username, password, token, enabled, permission, timestamp, registration) \
         VALUES ('root', ?, ?, 1, ?, ?, ?)",
    )
    .bind(&hash)
    .bind(&token)
    .bind(perms::SUPERADMIN)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    tracing::info!("created root account with password: {password}");

    Ok(())
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::from_str("sqlite::memory:")
                .unwrap()
                .foreign_keys(true),
        )
        .await
        .expect("in-memory pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}
