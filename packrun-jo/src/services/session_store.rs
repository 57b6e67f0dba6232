//! Session store
//!
//! `save` never blocks the caller: snapshots go to a writer task that
//! coalesces everything arriving within the debounce window and writes
//! only the latest one. `flush` writes the pending snapshot right away and
//! waits for it, for shutdown and signal handling.

use crate::db::{self, sessions};
use crate::models::SessionSnapshot;
use crate::utils::DEFAULT_MAX_LOCK_WAIT;
use packrun_common::{Error, Result};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

enum StoreCommand {
    Save(SessionSnapshot),
    Flush(oneshot::Sender<Result<()>>),
    Clear(oneshot::Sender<Result<()>>),
}

/// Debounced snapshot persistence backed by SQLite
pub struct SessionStore {
    pool: SqlitePool,
    commands: mpsc::UnboundedSender<StoreCommand>,
    writer: JoinHandle<()>,
}

impl SessionStore {
    /// Open `packrun.db` at `db_path`
    pub async fn open(db_path: &Path, debounce: Duration) -> Result<Self> {
        let pool = db::init_database_pool(db_path).await?;
        Ok(Self::with_pool(pool, debounce))
    }

    /// Use an initialized pool
    pub fn with_pool(pool: SqlitePool, debounce: Duration) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(pool.clone(), debounce, rx));
        Self { pool, commands, writer }
    }

    /// Queue a snapshot; fire-and-forget
    pub fn save(&self, snapshot: SessionSnapshot) {
        if self.commands.send(StoreCommand::Save(snapshot)).is_err() {
            error!("Session writer is gone, snapshot dropped");
        }
    }

    /// Write any pending snapshot now
    pub async fn flush(&self) -> Result<()> {
        self.request(StoreCommand::Flush).await
    }

    /// Drop pending writes and delete the stored snapshot
    pub async fn clear(&self) -> Result<()> {
        self.request(StoreCommand::Clear).await
    }

    /// Last written snapshot; pending saves are not included
    pub async fn load(&self) -> Result<Option<SessionSnapshot>> {
        sessions::load_snapshot(&self.pool).await
    }

    /// Flush and stop the writer task
    pub async fn close(self) -> Result<()> {
        let result = self.flush().await;
        drop(self.commands);
        if let Err(e) = self.writer.await {
            error!(error = %e, "Session writer ended abnormally");
        }
        self.pool.close().await;
        result
    }

    async fn request(&self, make: fn(oneshot::Sender<Result<()>>) -> StoreCommand) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| Error::Internal("session writer is gone".to_string()))?;
        done.await
            .map_err(|_| Error::Internal("session writer dropped the request".to_string()))?
    }
}

async fn run_writer(pool: SqlitePool, debounce: Duration, mut rx: mpsc::UnboundedReceiver<StoreCommand>) {
    let mut pending: Option<SessionSnapshot> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                command = rx.recv() => command,
                _ = tokio::time::sleep_until(at) => {
                    deadline = None;
                    write_pending(&pool, &mut pending).await.ok();
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(StoreCommand::Save(snapshot)) => {
                pending = Some(snapshot);
                deadline.get_or_insert_with(|| Instant::now() + debounce);
            }
            Some(StoreCommand::Flush(reply)) => {
                deadline = None;
                let _ = reply.send(write_pending(&pool, &mut pending).await);
            }
            Some(StoreCommand::Clear(reply)) => {
                deadline = None;
                pending = None;
                let _ = reply.send(sessions::clear_snapshot(&pool).await);
            }
            None => {
                write_pending(&pool, &mut pending).await.ok();
                debug!("Session writer stopped");
                return;
            }
        }
    }
}

async fn write_pending(pool: &SqlitePool, pending: &mut Option<SessionSnapshot>) -> Result<()> {
    let Some(snapshot) = pending.take() else {
        return Ok(());
    };
    match sessions::save_snapshot(pool, &snapshot, DEFAULT_MAX_LOCK_WAIT).await {
        Ok(()) => {
            debug!(sessions = snapshot.sessions.len(), "Session snapshot written");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Failed to write session snapshot");
            Err(e)
        }
    }
}
