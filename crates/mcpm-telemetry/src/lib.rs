//! SQLite-backed telemetry store: a bounded in-memory queue feeding a
//! single writer task, plus the derived-statistics queries used by
//! `mcpm run`/`mcpm usage`.

mod error;
mod queries;
mod queue;
mod schema;
mod store;

pub use error::TelemetryError;
pub use queries::{usage_stats, ProfileStats, ServerStats, UsageSession, UsageStats};
pub use store::TelemetryStore;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mcpm_core::{Event, EventType};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn event(ty: EventType, session: &str, server: &str, metadata: serde_json::Value) -> Event {
        Event {
            id: None,
            session_id: session.to_string(),
            event_type: ty,
            server_name: server.to_string(),
            resource_id: server.to_string(),
            timestamp: Utc::now(),
            duration_ms: None,
            success: true,
            error_message: None,
            metadata,
        }
    }

    #[tokio::test]
    async fn records_and_reads_back_session_pair() {
        let dir = TempDir::new().unwrap();
        let store = TelemetryStore::open(dir.path().join("telemetry.db")).await.unwrap();

        store.record(event(
            EventType::SessionStart,
            "s1",
            "alpha",
            json!({"action": "run", "transport": "stdio", "source": "local"}),
        ));
        store.record(event(EventType::SessionEnd, "s1", "alpha", json!({})));

        // Give the writer task a chance to drain the queue.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = usage_stats(store.pool(), Duration::from_secs(30 * 86400)).await.unwrap();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.recent_sessions.len(), 1);
        assert_eq!(stats.recent_sessions[0].session_id, "s1");
        assert!(stats.recent_sessions[0].duration_ms.is_some());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn record_never_blocks_even_under_backpressure() {
        let dir = TempDir::new().unwrap();
        let store = TelemetryStore::open(dir.path().join("telemetry.db")).await.unwrap();
        for i in 0..10_000 {
            store.record(event(
                EventType::ToolInvocation,
                &format!("s{i}"),
                "alpha",
                json!({}),
            ));
        }
        // The queue must never grow unbounded for non-session events.
        assert!(store.queue_len() <= 10_000);
        store.shutdown().await;
    }
}
