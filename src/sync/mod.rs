use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use log::{debug, error, info, warn};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

mod client;

pub use client::{SyncAck, SyncClient, SyncError, Uploader};

use crate::{
    config::{SyncSettings, DEFAULT_BATCH_LIMIT},
    db::Database,
};

/// Result of one sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub batches: u32,
    pub uploaded: u64,
    /// True when the cycle was a no-op because another one was in flight.
    pub skipped: bool,
}

impl SyncOutcome {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Watermark-based incremental uploader. Finalized sessions past the
/// persisted watermark are drained in bounded ascending batches; the
/// watermark advances only after the collector confirms a batch, so delivery
/// is at-least-once and the collector deduplicates by session id.
#[derive(Clone)]
pub struct SyncService {
    db: Database,
    uploader: Arc<dyn Uploader>,
    batch_limit: Arc<AtomicU32>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    in_flight: Arc<Mutex<()>>,
}

impl SyncService {
    pub fn new(db: Database, uploader: Arc<dyn Uploader>) -> Self {
        Self {
            db,
            uploader,
            batch_limit: Arc::new(AtomicU32::new(DEFAULT_BATCH_LIMIT)),
            ticker: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    /// Start or stop the periodic timer purely as a function of the
    /// configuration. Also the way to resume after an `Unauthorized` stop,
    /// once the credential has been fixed.
    pub async fn apply_settings(&self, settings: &SyncSettings) {
        self.batch_limit
            .store(settings.batch_limit.max(1), Ordering::Relaxed);

        let mut guard = self.ticker.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }

        if !settings.sync_ready() {
            info!("Sync disabled or unconfigured; periodic timer stopped");
            return;
        }

        let service = self.clone();
        let interval = settings.interval();
        info!("Sync timer started; interval {}s", interval.as_secs());

        *guard = Some(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match service.sync_now().await {
                    Ok(outcome) if outcome.skipped => {}
                    Ok(outcome) => {
                        if outcome.uploaded > 0 {
                            info!(
                                "Sync cycle uploaded {} sessions in {} batches",
                                outcome.uploaded, outcome.batches
                            );
                        }
                    }
                    Err(SyncError::Unauthorized) => {
                        // A known-bad credential will not get better on a
                        // timer; stop hammering the collector.
                        error!("Collector rejected the credential; sync timer stopped until reconfigured");
                        break;
                    }
                    Err(SyncError::BatchTooLarge) => {
                        error!("Batch exceeded collector limit despite local ceiling; this is a bug");
                    }
                    Err(err) => {
                        warn!("Sync cycle failed; will retry next interval: {err}");
                    }
                }
            }
        }));
    }

    pub async fn is_timer_running(&self) -> bool {
        self.ticker
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    /// Admin operation forcing a full re-send on the next cycle.
    pub async fn reset_watermark(&self) -> Result<(), SyncError> {
        self.db.reset_watermark().await.map_err(SyncError::Storage)
    }

    /// One full cycle: drain finalized-but-unsynced sessions in ascending
    /// batches, advancing the watermark after each confirmed batch. Never
    /// overlaps itself; a call during a running cycle is a skip.
    pub async fn sync_now(&self) -> Result<SyncOutcome, SyncError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Sync cycle already in flight; skipping");
            return Ok(SyncOutcome::skipped());
        };

        let limit = self.batch_limit.load(Ordering::Relaxed);
        let mut outcome = SyncOutcome::default();

        loop {
            let watermark = self.db.watermark().await.map_err(SyncError::Storage)?;
            let batch = self
                .db
                .fetch_unsynced(watermark, limit)
                .await
                .map_err(SyncError::Storage)?;

            let Some(last) = batch.last() else {
                break;
            };
            let batch_max_start = last.start_time;
            let full_batch = batch.len() as u32 >= limit;

            let ack = self.uploader.upload(&batch).await?;
            debug!(
                "Batch of {} accepted ({} rows, sync_id {})",
                batch.len(),
                ack.accepted,
                ack.sync_id
            );

            self.db
                .advance_watermark(batch_max_start)
                .await
                .map_err(SyncError::Storage)?;

            outcome.batches += 1;
            outcome.uploaded += ack.accepted;

            if !full_batch {
                break;
            }
        }

        Ok(outcome)
    }
}
