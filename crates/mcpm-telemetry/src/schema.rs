use sqlx::SqlitePool;

use crate::error::TelemetryError;

/// Current schema version. Bump this and add a branch in [`migrate`] when
/// the `events` table shape changes; the original Python store used ad-hoc
/// `ALTER TABLE` probing, which this table replaces with an explicit,
/// checked version number.
pub const SCHEMA_VERSION: i64 = 1;

pub async fn migrate(pool: &SqlitePool) -> Result<(), TelemetryError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            server_name TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            duration_ms INTEGER,
            success INTEGER NOT NULL,
            error_message TEXT,
            metadata TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(TelemetryError::Migrate)?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp_ms)",
        "CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id)",
        "CREATE INDEX IF NOT EXISTS idx_events_server ON events(server_name)",
        "CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)",
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
    ] {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .map_err(TelemetryError::Migrate)?;
    }

    let current: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(TelemetryError::Migrate)?;

    match current {
        None => {
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(SCHEMA_VERSION)
                .execute(pool)
                .await
                .map_err(TelemetryError::Migrate)?;
        }
        Some(v) if v < SCHEMA_VERSION => {
            sqlx::query("UPDATE schema_version SET version = ?")
                .bind(SCHEMA_VERSION)
                .execute(pool)
                .await
                .map_err(TelemetryError::Migrate)?;
        }
        Some(_) => {}
    }

    Ok(())
}
