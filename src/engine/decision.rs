use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, error, info, warn};
use tokio::{
    sync::mpsc,
    time::{sleep, Instant},
};

use crate::{
    db::Database,
    models::{AppIdentity, FocusContext, Session},
    reader::ContextReader,
};

use super::{
    EngineCommand, EngineSnapshot, EngineState, EngineTuning, FallbackPoller, FocusSignal,
    PollShared,
};

/// Clock reads are truncated to millisecond precision so in-memory values
/// round-trip the store exactly.
fn now_ms() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

fn session_identity(session: &Session) -> AppIdentity {
    AppIdentity::new(session.app_name.clone(), session.bundle_id.clone())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ObserveSource {
    /// OS activation, start, or post-resume recapture: the target really is
    /// frontmost, so a reader failure still opens a bare session.
    Push,
    /// Fallback poll: a failure is no evidence of change, so skip.
    Poll,
}

struct PendingTitleSwitch {
    context: FocusContext,
    token: u64,
}

/// The single serialized decision path. Push notifications, poll ticks,
/// debounce expirations, and lifecycle commands all arrive through one
/// mailbox; nothing else may touch the current-session pointer.
pub(crate) struct DecisionLoop {
    db: Database,
    reader: Arc<dyn ContextReader>,
    rx: mpsc::UnboundedReceiver<EngineCommand>,
    tx: mpsc::UnboundedSender<EngineCommand>,
    activation_gen: Arc<AtomicU64>,
    state: EngineState,
    current: Option<Session>,
    last_identity: Option<AppIdentity>,
    last_input: Instant,
    pending_title: Option<PendingTitleSwitch>,
    debounce_seq: u64,
    poller: Option<FallbackPoller>,
    shared: Arc<PollShared>,
    tuning: EngineTuning,
}

impl DecisionLoop {
    pub(crate) fn new(
        db: Database,
        reader: Arc<dyn ContextReader>,
        rx: mpsc::UnboundedReceiver<EngineCommand>,
        tx: mpsc::UnboundedSender<EngineCommand>,
        activation_gen: Arc<AtomicU64>,
        tuning: EngineTuning,
    ) -> Self {
        Self {
            db,
            reader,
            rx,
            tx,
            activation_gen,
            state: EngineState::Stopped,
            current: None,
            last_identity: None,
            last_input: Instant::now(),
            pending_title: None,
            debounce_seq: 0,
            poller: None,
            shared: Arc::new(PollShared::new()),
            tuning,
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                EngineCommand::Start { frontmost, ack } => {
                    let result = self.handle_start(frontmost).await;
                    let _ = ack.send(result);
                }
                EngineCommand::Stop { ack } => {
                    let result = self.handle_stop().await;
                    let _ = ack.send(result);
                }
                EngineCommand::Signal(signal) => self.handle_signal(signal).await,
                EngineCommand::PollTick => self.handle_poll_tick().await,
                EngineCommand::DebounceElapsed { token } => self.handle_debounce(token),
                EngineCommand::Snapshot { ack } => {
                    let _ = ack.send(EngineSnapshot {
                        state: self.state,
                        current: self.current.clone(),
                    });
                }
                EngineCommand::Barrier { ack } => {
                    let _ = ack.send(());
                }
            }
        }

        // Handle dropped: shut the poller down and close out the session.
        if let Some(poller) = self.poller.take() {
            if let Err(err) = poller.cancel().await {
                error!("Failed to cancel fallback poller on shutdown: {err:#}");
            }
        }
        self.close_current(now_ms());
        info!("Decision loop exited");
    }

    async fn handle_start(&mut self, frontmost: AppIdentity) -> Result<()> {
        if self.state != EngineState::Stopped {
            return Err(anyhow!("tracking already running"));
        }

        self.state = EngineState::Active;
        self.last_input = Instant::now();
        self.last_identity = Some(frontmost.clone());
        self.shared.mark_switched();
        self.poller = Some(FallbackPoller::spawn(self.tx.clone(), self.shared.clone()));

        info!("Tracking started; first target {}", frontmost.app_name);
        self.observe(frontmost, ObserveSource::Push).await;
        Ok(())
    }

    async fn handle_stop(&mut self) -> Result<()> {
        if self.state == EngineState::Stopped {
            return Err(anyhow!("tracking is not running"));
        }

        self.close_current(now_ms());
        if let Some(poller) = self.poller.take() {
            poller.cancel().await?;
        }
        self.state = EngineState::Stopped;
        self.last_identity = None;
        info!("Tracking stopped");
        Ok(())
    }

    async fn handle_signal(&mut self, signal: FocusSignal) {
        match signal {
            FocusSignal::AppActivated(app) => match self.state {
                EngineState::Active | EngineState::Idle => {
                    self.observe(app, ObserveSource::Push).await;
                }
                EngineState::Locked | EngineState::Asleep => {
                    // Remember the target so the post-resume recapture asks
                    // about the right app.
                    self.last_identity = Some(app);
                }
                EngineState::Stopped => {}
            },
            FocusSignal::UserInput => {
                self.last_input = Instant::now();
                if self.state == EngineState::Idle {
                    self.state = EngineState::Active;
                    self.resume_poller();
                    info!("Input after idle; resuming focus tracking");
                    self.recapture().await;
                }
            }
            FocusSignal::ScreenLocked => {
                if matches!(self.state, EngineState::Active | EngineState::Idle) {
                    self.close_current(now_ms());
                    self.suspend_poller();
                    self.state = EngineState::Locked;
                    info!("Screen locked; session closed");
                }
            }
            FocusSignal::ScreenUnlocked => {
                if self.state == EngineState::Locked {
                    self.state = EngineState::Active;
                    self.last_input = Instant::now();
                    self.resume_poller();
                    self.recapture().await;
                }
            }
            FocusSignal::SystemWillSleep => {
                if self.state != EngineState::Stopped && self.state != EngineState::Asleep {
                    self.close_current(now_ms());
                    self.suspend_poller();
                    self.state = EngineState::Asleep;
                    info!("System sleeping; session closed");
                }
            }
            FocusSignal::SystemWoke => {
                if self.state == EngineState::Asleep {
                    self.state = EngineState::Active;
                    self.last_input = Instant::now();
                    self.resume_poller();
                    self.recapture().await;
                }
            }
            FocusSignal::PowerStateChanged { low_power } => {
                self.shared.set_low_power(low_power);
                debug!("Power state changed; low_power={low_power}");
            }
        }
    }

    async fn handle_poll_tick(&mut self) {
        if self.state != EngineState::Active {
            return;
        }

        if self.last_input.elapsed() >= self.tuning.idle_after {
            // No input means no in-app change can have happened; polling
            // pauses entirely until input returns.
            self.state = EngineState::Idle;
            self.suspend_poller();
            info!(
                "No input for {:?}; polling paused",
                self.tuning.idle_after
            );
            return;
        }

        if let Some(target) = self.last_identity.clone() {
            self.observe(target, ObserveSource::Poll).await;
        }
    }

    fn handle_debounce(&mut self, token: u64) {
        let Some(pending) = &self.pending_title else {
            return;
        };
        if pending.token != token {
            return;
        }
        if !matches!(self.state, EngineState::Active | EngineState::Idle) {
            self.pending_title = None;
            return;
        }

        let pending = self.pending_title.take().unwrap();
        self.commit_switch(pending.context, now_ms());
    }

    /// The context lookup is the only await in the decision path that can
    /// suspend for long. The activation generation is snapshotted first and
    /// re-checked after: if a newer app activation arrived while the reader
    /// was working, this result describes a target that is no longer
    /// frontmost and is discarded.
    async fn observe(&mut self, target: AppIdentity, source: ObserveSource) {
        let generation = self.activation_gen.load(Ordering::Acquire);
        let fetched = self.reader.fetch(&target).await;

        if self.activation_gen.load(Ordering::Acquire) != generation {
            debug!(
                "Discarding stale context for {}; focus moved during lookup",
                target.app_name
            );
            return;
        }

        let context = match fetched {
            Ok(context) => context,
            Err(err) => {
                warn!("Context lookup for {} failed: {err:#}", target.app_name);
                match source {
                    ObserveSource::Push => FocusContext::bare(target),
                    ObserveSource::Poll => return,
                }
            }
        };

        self.decide(context);
    }

    /// Compare against the last-committed `(app, url, title)` tuple and act.
    fn decide(&mut self, context: FocusContext) {
        let now = now_ms();

        let Some(current) = &self.current else {
            self.commit_switch(context, now);
            return;
        };

        let app_changed = !session_identity(current).same_app(&context.app);
        let current_url = current.browser.as_ref().map(|b| b.url.as_str());
        let url_changed = current_url != context.url();

        if app_changed || url_changed {
            // Higher-priority switch supersedes any pending retitle.
            self.pending_title = None;
            self.commit_switch(context, now);
        } else if current.window_title != context.window_title {
            self.schedule_title_switch(context);
        } else {
            // Back to the committed title; retitle churn settled to a no-op.
            self.pending_title = None;
        }
    }

    /// Title-only changes are held briefly so rapid retitles (progress
    /// counters, editors marking dirty state) coalesce into one write.
    fn schedule_title_switch(&mut self, context: FocusContext) {
        if let Some(pending) = &self.pending_title {
            if pending.context.window_title == context.window_title {
                return;
            }
        }

        self.debounce_seq += 1;
        let token = self.debounce_seq;
        self.pending_title = Some(PendingTitleSwitch { context, token });

        let tx = self.tx.clone();
        let debounce = self.tuning.title_debounce;
        tokio::spawn(async move {
            sleep(debounce).await;
            let _ = tx.send(EngineCommand::DebounceElapsed { token });
        });
    }

    /// Finalize the outgoing session and open the next one. Both writes are
    /// detached: the store worker runs them in this order without the
    /// decision path waiting, and a failed write never rolls back the
    /// in-memory switch.
    fn commit_switch(&mut self, context: FocusContext, now: DateTime<Utc>) {
        if let Some(mut outgoing) = self.current.take() {
            outgoing.finalize(now);
            self.db.update_session_detached(&outgoing);
            debug!(
                "Session closed: {} ({} ms)",
                outgoing.app_name, outgoing.duration_ms
            );
        }

        let session = Session::open(&context, now);
        self.db.insert_session_detached(&session);
        info!("Session opened: {}", session.app_name);

        self.last_identity = Some(context.app.clone());
        self.current = Some(session);
        self.pending_title = None;
        self.shared.mark_switched();
    }

    fn close_current(&mut self, now: DateTime<Utc>) {
        self.pending_title = None;
        if let Some(mut outgoing) = self.current.take() {
            outgoing.finalize(now);
            self.db.update_session_detached(&outgoing);
        }
    }

    async fn recapture(&mut self) {
        if let Some(target) = self.last_identity.clone() {
            self.observe(target, ObserveSource::Push).await;
        }
    }

    fn suspend_poller(&mut self) {
        if let Some(poller) = &self.poller {
            if let Err(err) = poller.suspend() {
                error!("Failed to suspend fallback poller: {err:#}");
            }
        }
    }

    fn resume_poller(&mut self) {
        if let Some(poller) = &self.poller {
            if let Err(err) = poller.resume() {
                error!("Failed to resume fallback poller: {err:#}");
            }
        }
    }
}
