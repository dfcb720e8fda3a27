use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::{error, info};
use rusqlite::{params, Connection, Row};
use tokio::sync::oneshot;

mod migrations;

use crate::models::{BrowserContext, Session};
use migrations::run_migrations;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

pub fn to_epoch_ms(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

pub fn from_epoch_ms(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("epoch milliseconds {ms} out of range"))
}

fn row_to_session(row: &Row<'_>) -> Result<Session> {
    let url: Option<String> = row.get(4)?;
    let browser = match url {
        Some(url) => Some(BrowserContext {
            url,
            tab_title: row.get(5)?,
            tab_count: row.get(6)?,
        }),
        None => None,
    };

    Ok(Session {
        id: row.get(0)?,
        app_name: row.get(1)?,
        bundle_id: row.get(2)?,
        window_title: row.get(3)?,
        browser,
        document_path: row.get(7)?,
        is_full_screen: row.get(8)?,
        is_minimized: row.get(9)?,
        start_time: from_epoch_ms(row.get(10)?)?,
        end_time: from_epoch_ms(row.get(11)?)?,
        duration_ms: row.get(12)?,
    })
}

const SESSION_COLUMNS: &str = "id, app_name, bundle_id, window_title, url, tab_title, tab_count, \
     document_path, is_full_screen, is_minimized, start_time_ms, end_time_ms, duration_ms";

/// Handle to the dedicated SQLite worker thread. All access runs through the
/// worker's mailbox, so statement execution is serialized in send order.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Option<Arc<PathBuf>>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
        Self::spawn(Some(db_path))
    }

    /// Volatile store; used as the startup fallback and by tests.
    pub fn in_memory() -> Result<Self> {
        Self::spawn(None)
    }

    fn spawn(db_path: Option<PathBuf>) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("focustrace-db".into())
            .spawn(move || {
                let open_result = match &path_for_thread {
                    Some(path) => Connection::open(path),
                    None => Connection::open_in_memory(),
                };
                let mut conn = match open_result {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(
                            anyhow::Error::new(err).context("failed to open SQLite database")
                        ));
                        return;
                    }
                };

                if path_for_thread.is_some() {
                    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                        error!("Failed to enable WAL mode: {err}");
                    }
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        if let Some(path) = &db_path {
            info!("Database initialized at {}", path.display());
        } else {
            info!("In-memory database initialized");
        }

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: db_path.map(Arc::new),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref().map(PathBuf::as_path)
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    /// Enqueue a write without waiting for the outcome. The task lands in the
    /// worker mailbox before this returns, so detached writes issued in order
    /// run in order; failures are logged on the worker thread.
    pub fn execute_detached<F>(&self, label: &'static str, task: F)
    where
        F: FnOnce(&mut Connection) -> Result<()> + Send + 'static,
    {
        let command = DbCommand::Execute(Box::new(move |conn| {
            if let Err(err) = task(conn) {
                error!("Detached DB write '{label}' failed: {err:#}");
            }
        }));

        if self.inner.sender.send(command).is_err() {
            error!("Detached DB write '{label}' dropped: worker unavailable");
        }
    }

    /// No-op round trip through the worker mailbox; everything enqueued
    /// before this call has run once it resolves.
    pub async fn barrier(&self) -> Result<()> {
        self.execute(|_conn| Ok(())).await
    }

    fn insert_session_sql(conn: &mut Connection, record: &Session) -> Result<()> {
        conn.execute(
            "INSERT INTO sessions (id, app_name, bundle_id, window_title, url, tab_title, \
             tab_count, document_path, is_full_screen, is_minimized, start_time_ms, \
             end_time_ms, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.id,
                record.app_name,
                record.bundle_id,
                record.window_title,
                record.browser.as_ref().map(|b| b.url.clone()),
                record.browser.as_ref().and_then(|b| b.tab_title.clone()),
                record.browser.as_ref().and_then(|b| b.tab_count),
                record.document_path,
                record.is_full_screen,
                record.is_minimized,
                to_epoch_ms(record.start_time),
                to_epoch_ms(record.end_time),
                record.duration_ms,
            ],
        )
        .with_context(|| "failed to insert session")?;
        Ok(())
    }

    fn update_session_sql(conn: &mut Connection, record: &Session) -> Result<()> {
        conn.execute(
            "UPDATE sessions
             SET end_time_ms = ?1,
                 duration_ms = ?2
             WHERE id = ?3",
            params![
                to_epoch_ms(record.end_time),
                record.duration_ms,
                record.id,
            ],
        )
        .with_context(|| "failed to update session")?;
        Ok(())
    }

    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| Self::insert_session_sql(conn, &record))
            .await
    }

    pub fn insert_session_detached(&self, session: &Session) {
        let record = session.clone();
        self.execute_detached("insert session", move |conn| {
            Self::insert_session_sql(conn, &record)
        });
    }

    pub async fn update_session(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| Self::update_session_sql(conn, &record))
            .await
    }

    pub fn update_session_detached(&self, session: &Session) {
        let record = session.clone();
        self.execute_detached("update session", move |conn| {
            Self::update_session_sql(conn, &record)
        });
    }

    /// Most recent sessions first.
    pub async fn fetch_recent(&self, limit: u32) -> Result<Vec<Session>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 ORDER BY start_time_ms DESC, rowid DESC
                 LIMIT ?1"
            ))?;

            let mut rows = stmt.query(params![limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    /// Finalized sessions past the watermark, ascending by start time.
    /// Active rows (duration 0) and negative-skew rows never qualify.
    pub async fn fetch_unsynced(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Session>> {
        let since_ms = to_epoch_ms(since);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE start_time_ms > ?1 AND duration_ms > 0
                 ORDER BY start_time_ms ASC, rowid ASC
                 LIMIT ?2"
            ))?;

            let mut rows = stmt.query(params![since_ms, limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    pub async fn count_sessions(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| {
                row.get(0)
            })?;
            Ok(count as u64)
        })
        .await
    }

    /// User-initiated purge of every session.
    pub async fn delete_all_sessions(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute("DELETE FROM sessions", [])
                .with_context(|| "failed to delete sessions")?;
            Ok(())
        })
        .await
    }

    pub async fn watermark(&self) -> Result<DateTime<Utc>> {
        self.execute(|conn| {
            let ms: i64 = conn.query_row(
                "SELECT last_synced_start_time_ms FROM sync_state WHERE id = 1",
                [],
                |row| row.get(0),
            )?;
            from_epoch_ms(ms)
        })
        .await
    }

    /// Monotonic advance; a value at or behind the current watermark is a
    /// no-op rather than a rollback.
    pub async fn advance_watermark(&self, to: DateTime<Utc>) -> Result<()> {
        let to_ms = to_epoch_ms(to);
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sync_state
                 SET last_synced_start_time_ms = MAX(last_synced_start_time_ms, ?1)
                 WHERE id = 1",
                params![to_ms],
            )
            .with_context(|| "failed to advance sync watermark")?;
            Ok(())
        })
        .await
    }

    /// Admin operation: forces a full re-send on the next cycle.
    pub async fn reset_watermark(&self) -> Result<()> {
        self.execute(|conn| {
            conn.execute(
                "UPDATE sync_state SET last_synced_start_time_ms = 0 WHERE id = 1",
                [],
            )
            .with_context(|| "failed to reset sync watermark")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::models::{AppIdentity, FocusContext};

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn finalized(app: &str, start_ms: i64, duration_ms: i64) -> Session {
        let ctx = FocusContext::bare(AppIdentity::new(app, None));
        let mut session = Session::open(&ctx, at_ms(start_ms));
        session.finalize(at_ms(start_ms + duration_ms));
        session
    }

    #[tokio::test]
    async fn insert_fetch_round_trip_preserves_every_field() {
        let db = Database::in_memory().unwrap();

        let session = Session {
            id: "roundtrip-1".into(),
            app_name: "ブラウザ".into(),
            bundle_id: Some("com.example.browser".into()),
            window_title: "résumé — draft".into(),
            browser: Some(BrowserContext {
                url: "https://example.com/ページ".into(),
                // Empty string is distinct from absent and must survive.
                tab_title: Some(String::new()),
                tab_count: Some(42),
            }),
            document_path: None,
            is_full_screen: true,
            is_minimized: false,
            start_time: at_ms(1_700_000_000_123),
            end_time: at_ms(1_700_000_060_123),
            duration_ms: 60_000,
        };

        db.insert_session(&session).await.unwrap();
        let fetched = db.fetch_recent(10).await.unwrap();
        assert_eq!(fetched, vec![session]);
    }

    #[tokio::test]
    async fn absent_browser_group_stays_absent() {
        let db = Database::in_memory().unwrap();
        let session = finalized("Terminal", 1_000, 5_000);
        db.insert_session(&session).await.unwrap();

        let fetched = db.fetch_recent(1).await.unwrap();
        assert_eq!(fetched[0].browser, None);
        assert_eq!(fetched[0].document_path, None);
    }

    #[tokio::test]
    async fn fetch_unsynced_filters_orders_and_bounds() {
        let db = Database::in_memory().unwrap();

        // Inserted out of order; one active, one negative-skew, one behind
        // the watermark.
        db.insert_session(&finalized("c", 3_000, 10)).await.unwrap();
        db.insert_session(&finalized("a", 1_000, 10)).await.unwrap();
        db.insert_session(&finalized("b", 2_000, 10)).await.unwrap();
        db.insert_session(&finalized("old", 500, 10)).await.unwrap();
        db.insert_session(&Session::open(
            &FocusContext::bare(AppIdentity::new("active", None)),
            at_ms(4_000),
        ))
        .await
        .unwrap();
        db.insert_session(&finalized("skewed", 5_000, -50)).await.unwrap();

        let rows = db.fetch_unsynced(at_ms(500), 10).await.unwrap();
        let names: Vec<&str> = rows.iter().map(|s| s.app_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(rows.windows(2).all(|w| w[0].start_time < w[1].start_time));

        let bounded = db.fetch_unsynced(at_ms(0), 2).await.unwrap();
        assert_eq!(bounded.len(), 2);
        assert_eq!(bounded[0].app_name, "old");
    }

    #[tokio::test]
    async fn update_finalizes_inserted_row() {
        let db = Database::in_memory().unwrap();
        let ctx = FocusContext::bare(AppIdentity::new("editor", None));
        let mut session = Session::open(&ctx, at_ms(10_000));
        db.insert_session(&session).await.unwrap();

        session.finalize(at_ms(12_500));
        db.update_session(&session).await.unwrap();

        let fetched = db.fetch_recent(1).await.unwrap();
        assert_eq!(fetched[0].duration_ms, 2_500);
        assert_eq!(fetched[0].end_time, at_ms(12_500));
    }

    #[tokio::test]
    async fn detached_writes_run_in_send_order() {
        let db = Database::in_memory().unwrap();
        let ctx = FocusContext::bare(AppIdentity::new("editor", None));
        let mut session = Session::open(&ctx, at_ms(10_000));

        db.insert_session_detached(&session);
        session.finalize(at_ms(11_000));
        db.update_session_detached(&session);
        db.barrier().await.unwrap();

        let fetched = db.fetch_recent(1).await.unwrap();
        assert_eq!(fetched[0].duration_ms, 1_000);
    }

    #[tokio::test]
    async fn watermark_is_monotonic_until_reset() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.watermark().await.unwrap(), at_ms(0));

        db.advance_watermark(at_ms(5_000)).await.unwrap();
        db.advance_watermark(at_ms(3_000)).await.unwrap();
        assert_eq!(db.watermark().await.unwrap(), at_ms(5_000));

        db.reset_watermark().await.unwrap();
        assert_eq!(db.watermark().await.unwrap(), at_ms(0));
    }

    #[tokio::test]
    async fn count_and_delete_all() {
        let db = Database::in_memory().unwrap();
        db.insert_session(&finalized("a", 1_000, 10)).await.unwrap();
        db.insert_session(&finalized("b", 2_000, 10)).await.unwrap();
        assert_eq!(db.count_sessions().await.unwrap(), 2);

        db.delete_all_sessions().await.unwrap();
        assert_eq!(db.count_sessions().await.unwrap(), 0);
    }
}
