use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::error::TelemetryError;

#[derive(Debug, Clone, Serialize)]
pub struct UsageSession {
    pub session_id: String,
    pub server_name: String,
    pub profile_name: Option<String>,
    pub action: String,
    pub transport: Option<String>,
    pub source: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub server_name: String,
    pub total_sessions: i64,
    pub total_runs: i64,
    pub first_used: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub success_rate: f64,
    pub primary_transport: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileStats {
    pub profile_name: String,
    pub total_sessions: i64,
    pub total_runs: i64,
    pub first_used: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub server_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub servers: Vec<ServerStats>,
    pub profiles: Vec<ProfileStats>,
    pub recent_sessions: Vec<UsageSession>,
    pub total_servers: i64,
    pub total_profiles: i64,
    pub total_sessions: i64,
    pub window: Duration,
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Computes usage statistics for the trailing `window`, matching the
/// session-pairing and aggregate shape of the original's
/// `_get_computed_usage_stats_impl`: sessions are derived by joining
/// `SESSION_START` rows with their matching `SESSION_END` row via a
/// correlated subquery on `session_id`.
pub async fn usage_stats(pool: &SqlitePool, window: Duration) -> Result<UsageStats, TelemetryError> {
    let threshold_ms = (Utc::now() - chrono::Duration::from_std(window).unwrap_or_default())
        .timestamp_millis();

    let session_rows = sqlx::query(
        r#"
        SELECT
            e1.session_id as session_id,
            e1.server_name as server_name,
            json_extract(e1.metadata, '$.action') as action,
            json_extract(e1.metadata, '$.profile_name') as profile_name,
            json_extract(e1.metadata, '$.transport') as transport,
            json_extract(e1.metadata, '$.source') as source,
            e1.timestamp_ms as start_ms,
            (SELECT e2.timestamp_ms FROM events e2
             WHERE e2.session_id = e1.session_id AND e2.event_type = 'SESSION_END'
             LIMIT 1) as end_ms,
            (SELECT e2.success FROM events e2
             WHERE e2.session_id = e1.session_id AND e2.event_type = 'SESSION_END'
             LIMIT 1) as session_success
        FROM events e1
        WHERE e1.event_type = 'SESSION_START' AND e1.timestamp_ms >= ?
        ORDER BY e1.timestamp_ms DESC
        LIMIT 50
        "#,
    )
    .bind(threshold_ms)
    .fetch_all(pool)
    .await
    .map_err(TelemetryError::Query)?;

    let mut recent_sessions = Vec::with_capacity(session_rows.len());
    for row in session_rows {
        let start_ms: i64 = row.try_get("start_ms").map_err(TelemetryError::Query)?;
        let end_ms: Option<i64> = row.try_get("end_ms").map_err(TelemetryError::Query)?;
        let session_success: Option<bool> =
            row.try_get("session_success").map_err(TelemetryError::Query)?;
        recent_sessions.push(UsageSession {
            session_id: row.try_get("session_id").map_err(TelemetryError::Query)?,
            server_name: row.try_get("server_name").map_err(TelemetryError::Query)?,
            profile_name: row.try_get("profile_name").map_err(TelemetryError::Query)?,
            action: row
                .try_get::<Option<String>, _>("action")
                .map_err(TelemetryError::Query)?
                .unwrap_or_else(|| "unknown".to_string()),
            transport: row.try_get("transport").map_err(TelemetryError::Query)?,
            source: row.try_get("source").map_err(TelemetryError::Query)?,
            started_at: millis_to_datetime(start_ms),
            duration_ms: end_ms.map(|end| end - start_ms),
            success: session_success.unwrap_or(true),
        });
    }

    let server_rows = sqlx::query(
        r#"
        SELECT
            server_name,
            COUNT(DISTINCT session_id) as total_sessions,
            COUNT(DISTINCT CASE
                WHEN json_extract(metadata, '$.action') IN ('run', 'run_http', 'profile_run')
                THEN session_id
            END) as total_runs,
            MIN(timestamp_ms) as first_used_ms,
            MAX(timestamp_ms) as last_used_ms,
            AVG(CASE WHEN success THEN 1.0 ELSE 0.0 END) * 100 as success_rate,
            json_extract(metadata, '$.transport') as primary_transport
        FROM events
        WHERE event_type = 'SESSION_START' AND timestamp_ms >= ?
        GROUP BY server_name
        ORDER BY total_sessions DESC
        "#,
    )
    .bind(threshold_ms)
    .fetch_all(pool)
    .await
    .map_err(TelemetryError::Query)?;

    let mut servers = Vec::with_capacity(server_rows.len());
    for row in server_rows {
        let first_used_ms: Option<i64> = row.try_get("first_used_ms").map_err(TelemetryError::Query)?;
        let last_used_ms: Option<i64> = row.try_get("last_used_ms").map_err(TelemetryError::Query)?;
        servers.push(ServerStats {
            server_name: row.try_get("server_name").map_err(TelemetryError::Query)?,
            total_sessions: row.try_get("total_sessions").map_err(TelemetryError::Query)?,
            total_runs: row.try_get("total_runs").map_err(TelemetryError::Query)?,
            first_used: first_used_ms.map(millis_to_datetime),
            last_used: last_used_ms.map(millis_to_datetime),
            success_rate: row
                .try_get::<Option<f64>, _>("success_rate")
                .map_err(TelemetryError::Query)?
                .unwrap_or(0.0),
            primary_transport: row.try_get("primary_transport").map_err(TelemetryError::Query)?,
        });
    }

    let profile_rows = sqlx::query(
        r#"
        SELECT
            json_extract(metadata, '$.profile_name') as profile_name,
            COUNT(DISTINCT session_id) as total_sessions,
            COUNT(DISTINCT session_id) as total_runs,
            MIN(timestamp_ms) as first_used_ms,
            MAX(timestamp_ms) as last_used_ms,
            COUNT(DISTINCT server_name) as server_count
        FROM events
        WHERE event_type = 'SESSION_START'
          AND timestamp_ms >= ?
          AND json_extract(metadata, '$.profile_name') IS NOT NULL
        GROUP BY json_extract(metadata, '$.profile_name')
        ORDER BY total_sessions DESC
        "#,
    )
    .bind(threshold_ms)
    .fetch_all(pool)
    .await
    .map_err(TelemetryError::Query)?;

    let mut profiles = Vec::with_capacity(profile_rows.len());
    for row in profile_rows {
        let profile_name: Option<String> =
            row.try_get("profile_name").map_err(TelemetryError::Query)?;
        let Some(profile_name) = profile_name else {
            continue;
        };
        let first_used_ms: Option<i64> = row.try_get("first_used_ms").map_err(TelemetryError::Query)?;
        let last_used_ms: Option<i64> = row.try_get("last_used_ms").map_err(TelemetryError::Query)?;
        profiles.push(ProfileStats {
            profile_name,
            total_sessions: row.try_get("total_sessions").map_err(TelemetryError::Query)?,
            total_runs: row.try_get("total_runs").map_err(TelemetryError::Query)?,
            first_used: first_used_ms.map(millis_to_datetime),
            last_used: last_used_ms.map(millis_to_datetime),
            server_count: row.try_get("server_count").map_err(TelemetryError::Query)?,
        });
    }

    let totals = sqlx::query(
        r#"
        SELECT
            COUNT(DISTINCT server_name) as total_servers,
            COUNT(DISTINCT json_extract(metadata, '$.profile_name')) as total_profiles,
            COUNT(DISTINCT session_id) as total_sessions
        FROM events
        WHERE event_type = 'SESSION_START' AND timestamp_ms >= ?
        "#,
    )
    .bind(threshold_ms)
    .fetch_one(pool)
    .await
    .map_err(TelemetryError::Query)?;

    Ok(UsageStats {
        servers,
        profiles,
        recent_sessions,
        total_servers: totals.try_get("total_servers").map_err(TelemetryError::Query)?,
        total_profiles: totals.try_get("total_profiles").map_err(TelemetryError::Query)?,
        total_sessions: totals.try_get("total_sessions").map_err(TelemetryError::Query)?,
        window,
    })
}
