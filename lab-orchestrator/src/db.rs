use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use tracing::instrument;

use crate::error::Result;

/// Initialize database connection pool
#[instrument(fields(db_path = %db_path.display()))]
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(options).await?;

    Ok(pool)
}

/// Run database migrations
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Copy the database file aside before migrating. Returns `None` when there
/// is nothing to back up yet.
pub fn backup_database(db_path: &Path) -> Result<Option<PathBuf>> {
    if !db_path.exists() {
        return Ok(None);
    }

    let backup_path = db_path.with_extension(format!("db.backup.{}", Utc::now().timestamp()));
    std::fs::copy(db_path, &backup_path)?;

    Ok(Some(backup_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_pool_and_migrate_on_disk() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("labd.db");

        let pool = create_pool(&db_path).await.unwrap();
        run_migrations(&pool).await.unwrap();
        // Idempotent
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM labs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(db_path.exists());
    }

    #[test]
    fn test_backup_missing_database_is_noop() {
        let dir = TempDir::new().unwrap();
        let result = backup_database(&dir.path().join("absent.db")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_backup_copies_existing_file() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("labd.db");
        std::fs::write(&db_path, b"sqlite").unwrap();

        let backup = backup_database(&db_path).unwrap().unwrap();
        assert_eq!(std::fs::read(backup).unwrap(), b"sqlite");
    }
}
