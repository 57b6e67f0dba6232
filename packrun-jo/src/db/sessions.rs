//! Session snapshot persistence
//!
//! A save replaces the whole snapshot in one transaction, so a reader
//! never sees sessions from two different saves.

use chrono::{DateTime, Utc};
use packrun_common::{Error, JobId, PackId, Result, SourceId, Stage};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use crate::models::{LogEntry, LogLevel, ProcessingSession, SessionSnapshot};
use crate::utils::retry_on_lock;

/// Entries of the activity log kept on disk
pub const LOG_TAIL_LIMIT: usize = 50;

/// Replace the stored snapshot
///
/// Uses retry_on_lock to ride out transient lock contention
pub async fn save_snapshot(pool: &SqlitePool, snapshot: &SessionSnapshot, max_wait: Duration) -> Result<()> {
    retry_on_lock("save_snapshot", max_wait, || write_snapshot(pool, snapshot)).await
}

async fn write_snapshot(pool: &SqlitePool, snapshot: &SessionSnapshot) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM processing_sessions")
        .execute(&mut *tx)
        .await?;

    for session in &snapshot.sessions {
        sqlx::query(
            r#"
            INSERT INTO processing_sessions (
                source_id, pack_id, stage, job_id, started_at,
                estimated_seconds, processed_units, total_units, progress
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.source_id.as_str())
        .bind(session.pack_id.as_ref().map(|p| p.as_str()))
        .bind(session.stage.as_str())
        .bind(session.job_id.as_ref().map(|j| j.as_str()))
        .bind(session.started_at)
        .bind(to_i64(session.estimated_seconds))
        .bind(to_i64(session.processed_units))
        .bind(session.total_units.map(to_i64))
        .bind(session.progress as i64)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("DELETE FROM activity_log").execute(&mut *tx).await?;

    let skip = snapshot.log_tail.len().saturating_sub(LOG_TAIL_LIMIT);
    for entry in snapshot.log_tail.iter().skip(skip) {
        sqlx::query("INSERT INTO activity_log (at, source_id, level, message) VALUES (?, ?, ?, ?)")
            .bind(entry.at.to_rfc3339())
            .bind(entry.source_id.as_ref().map(|s| s.as_str()))
            .bind(entry.level.as_str())
            .bind(&entry.message)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO snapshot_meta (id, saved_at) VALUES (1, ?)
        ON CONFLICT(id) DO UPDATE SET saved_at = excluded.saved_at
        "#,
    )
    .bind(snapshot.saved_at.to_rfc3339())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Load the stored snapshot, `None` if nothing was ever saved
pub async fn load_snapshot(pool: &SqlitePool) -> Result<Option<SessionSnapshot>> {
    let saved_at: Option<String> = sqlx::query_scalar("SELECT saved_at FROM snapshot_meta WHERE id = 1")
        .fetch_optional(pool)
        .await?;

    let Some(saved_at) = saved_at else {
        return Ok(None);
    };
    let saved_at = parse_timestamp(&saved_at, "saved_at")?;

    let rows = sqlx::query(
        r#"
        SELECT source_id, pack_id, stage, job_id, started_at,
               estimated_seconds, processed_units, total_units, progress
        FROM processing_sessions
        ORDER BY started_at, source_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut sessions = Vec::with_capacity(rows.len());
    for row in rows {
        let source_id: String = row.get("source_id");
        let stage_name: String = row.get("stage");
        let Some(stage) = Stage::from_wire(&stage_name) else {
            tracing::warn!(source_id = %source_id, stage = %stage_name, "Skipping session with unknown stage");
            continue;
        };

        sessions.push(ProcessingSession {
            source_id: SourceId::new(source_id),
            pack_id: row.get::<Option<String>, _>("pack_id").map(PackId::new),
            stage,
            job_id: row.get::<Option<String>, _>("job_id").map(JobId::new),
            started_at: row.get("started_at"),
            estimated_seconds: from_i64(row.get("estimated_seconds")),
            processed_units: from_i64(row.get("processed_units")),
            total_units: row.get::<Option<i64>, _>("total_units").map(from_i64),
            progress: row.get::<i64, _>("progress").clamp(0, 100) as u8,
        });
    }

    let log_rows = sqlx::query("SELECT at, source_id, level, message FROM activity_log ORDER BY id")
        .fetch_all(pool)
        .await?;

    let mut log_tail = Vec::with_capacity(log_rows.len());
    for row in log_rows {
        let at: String = row.get("at");
        let level: String = row.get("level");
        log_tail.push(LogEntry {
            at: parse_timestamp(&at, "activity_log.at")?,
            source_id: row.get::<Option<String>, _>("source_id").map(SourceId::new),
            level: LogLevel::parse(&level),
            message: row.get("message"),
        });
    }

    Ok(Some(SessionSnapshot {
        sessions,
        log_tail,
        saved_at,
    }))
}

/// Delete everything
pub async fn clear_snapshot(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM processing_sessions").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM activity_log").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM snapshot_meta").execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database_pool;
    use crate::utils::DEFAULT_MAX_LOCK_WAIT;
    use tempfile::TempDir;

    async fn pool() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = init_database_pool(&dir.path().join("packrun.db")).await.unwrap();
        (dir, pool)
    }

    fn session(id: &str, stage: Stage) -> ProcessingSession {
        ProcessingSession {
            source_id: SourceId::new(id),
            pack_id: Some(PackId::new("pack")),
            stage,
            job_id: Some(JobId::new(format!("job-{}", id))),
            started_at: 1_700_000_000_000,
            estimated_seconds: 600,
            processed_units: 5,
            total_units: Some(15),
            progress: 33,
        }
    }

    fn entry(n: usize) -> LogEntry {
        LogEntry {
            at: Utc::now(),
            source_id: None,
            level: LogLevel::Info,
            message: format!("entry {}", n),
        }
    }

    #[tokio::test]
    async fn test_empty_database_loads_none() {
        let (_dir, pool) = pool().await;
        assert!(load_snapshot(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_snapshot() {
        let (_dir, pool) = pool().await;

        let first = SessionSnapshot::new(vec![session("a", Stage::Analyzing), session("b", Stage::Extracting)], vec![]);
        save_snapshot(&pool, &first, DEFAULT_MAX_LOCK_WAIT).await.unwrap();

        let second = SessionSnapshot::new(vec![session("b", Stage::Completed)], vec![entry(1)]);
        save_snapshot(&pool, &second, DEFAULT_MAX_LOCK_WAIT).await.unwrap();

        let loaded = load_snapshot(&pool).await.unwrap().unwrap();
        assert_eq!(loaded.sessions, second.sessions);
        assert_eq!(loaded.log_tail.len(), 1);
        assert_eq!(loaded.log_tail[0].message, "entry 1");
    }

    #[tokio::test]
    async fn test_log_tail_bounded() {
        let (_dir, pool) = pool().await;
        let log: Vec<LogEntry> = (0..80).map(entry).collect();
        save_snapshot(&pool, &SessionSnapshot::new(vec![], log), DEFAULT_MAX_LOCK_WAIT)
            .await
            .unwrap();

        let loaded = load_snapshot(&pool).await.unwrap().unwrap();
        assert_eq!(loaded.log_tail.len(), LOG_TAIL_LIMIT);
        assert_eq!(loaded.log_tail.first().unwrap().message, "entry 30");
        assert_eq!(loaded.log_tail.last().unwrap().message, "entry 79");
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let (_dir, pool) = pool().await;
        let snapshot = SessionSnapshot::new(vec![session("a", Stage::Analyzing)], vec![entry(0)]);
        save_snapshot(&pool, &snapshot, DEFAULT_MAX_LOCK_WAIT).await.unwrap();

        clear_snapshot(&pool).await.unwrap();
        assert!(load_snapshot(&pool).await.unwrap().is_none());
    }
}
