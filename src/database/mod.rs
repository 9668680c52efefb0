use crate::config::SandboxSettings;
use crate::database::migration::Migrator;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use std::path::PathBuf;
use tracing::debug;

pub mod migration;

pub fn get_database_path(settings: &SandboxSettings) -> std::result::Result<PathBuf, String> {
    std::fs::create_dir_all(&settings.data_dir)
        .map_err(|e| format!("Failed to create data directory: {e}"))?;

    Ok(settings.database_path())
}

pub async fn get_database_connection(
    settings: &SandboxSettings,
) -> Result<DatabaseConnection, DbErr> {
    let db_path = get_database_path(settings)
        .map_err(|e| DbErr::Custom(format!("Failed to get database path: {e}")))?;

    let db_url = format!("sqlite:{}?mode=rwc", db_path.to_string_lossy());

    // Disable SQLx logging - https://www.sea-ql.org/SeaORM/docs/next/install-and-config/debug-log/#sqlx-logging
    let mut opt = ConnectOptions::new(db_url);
    opt.sqlx_logging(false);

    Database::connect(opt).await
}

/// Open the database and bring the schema up to date
pub async fn init_database(settings: &SandboxSettings) -> Result<DatabaseConnection, String> {
    debug!("🏁 Initializing database...");

    let db = get_database_connection(settings)
        .await
        .map_err(|e| format!("Failed to initialize database: {e}"))?;

    debug!("📊 Running database migrations...");
    Migrator::up(&db, None)
        .await
        .map_err(|e| format!("Failed to run migrations: {e}"))?;

    debug!("✅ Database connection established and migrations completed");

    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_database_creates_file() {
        let temp_dir = TempDir::new().unwrap();
        let settings = SandboxSettings {
            data_dir: temp_dir.path().join("nested"),
            ..SandboxSettings::default()
        };

        let db = init_database(&settings).await.unwrap();
        assert!(settings.database_path().exists());

        // Migrations are idempotent
        Migrator::up(&db, None).await.unwrap();
    }
}
