use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use log::warn;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

mod decision;
mod poller;

pub use poller::{poll_interval, FallbackPoller, PollShared, TimerPhase};

use crate::{
    db::Database,
    models::{AppIdentity, Session},
    reader::ContextReader,
};
use decision::DecisionLoop;

/// Lifecycle states of the tracking engine. `Idle` still counts as tracking
/// (the active session stays open); `Locked`/`Asleep` close it.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EngineState {
    Stopped,
    Active,
    Idle,
    Locked,
    Asleep,
}

/// Observations delivered by the platform glue (OS notifications, input
/// monitors, power events). Everything funnels into the one decision path.
#[derive(Debug, Clone)]
pub enum FocusSignal {
    AppActivated(AppIdentity),
    UserInput,
    ScreenLocked,
    ScreenUnlocked,
    SystemWillSleep,
    SystemWoke,
    PowerStateChanged { low_power: bool },
}

pub(crate) enum EngineCommand {
    Start {
        frontmost: AppIdentity,
        ack: oneshot::Sender<Result<()>>,
    },
    Stop {
        ack: oneshot::Sender<Result<()>>,
    },
    Signal(FocusSignal),
    PollTick,
    DebounceElapsed {
        token: u64,
    },
    Snapshot {
        ack: oneshot::Sender<EngineSnapshot>,
    },
    /// Resolves once every command ahead of it has been processed.
    Barrier {
        ack: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub current: Option<Session>,
}

/// Thresholds of the decision path, pulled out so tests can shrink them.
#[derive(Debug, Clone, Copy)]
pub struct EngineTuning {
    /// No input for this long parks the engine in `Idle`.
    pub idle_after: std::time::Duration,
    /// How long a title-only change is held before committing.
    pub title_debounce: std::time::Duration,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            idle_after: std::time::Duration::from_secs(60),
            title_debounce: std::time::Duration::from_secs(2),
        }
    }
}

/// Handle to the Session Lifecycle Manager. Cheap to clone; all state lives
/// in the single decision task, so there is exactly one writer and no locks
/// around session state.
#[derive(Clone)]
pub struct FocusEngine {
    tx: mpsc::UnboundedSender<EngineCommand>,
    activation_gen: Arc<AtomicU64>,
}

impl FocusEngine {
    pub fn spawn(db: Database, reader: Arc<dyn ContextReader>) -> Self {
        Self::spawn_tuned(db, reader, EngineTuning::default())
    }

    pub fn spawn_tuned(
        db: Database,
        reader: Arc<dyn ContextReader>,
        tuning: EngineTuning,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let activation_gen = Arc::new(AtomicU64::new(0));

        let decision_loop =
            DecisionLoop::new(db, reader, rx, tx.clone(), activation_gen.clone(), tuning);
        tokio::spawn(decision_loop.run());

        Self { tx, activation_gen }
    }

    /// Begin tracking with `frontmost` as the first captured target.
    pub async fn start(&self, frontmost: AppIdentity) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send(EngineCommand::Start { frontmost, ack })?;
        rx.await.map_err(|_| anyhow!("engine task terminated"))?
    }

    /// Finalize the active session (if any) and release observers and timers.
    pub async fn stop(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send(EngineCommand::Stop { ack })?;
        rx.await.map_err(|_| anyhow!("engine task terminated"))?
    }

    /// Deliver an observation. App activations bump the activation
    /// generation at enqueue time, which is what lets the decision path
    /// discard context lookups that a faster focus change has overtaken.
    pub fn signal(&self, signal: FocusSignal) {
        if matches!(signal, FocusSignal::AppActivated(_)) {
            self.activation_gen.fetch_add(1, Ordering::AcqRel);
        }
        if self.send(EngineCommand::Signal(signal)).is_err() {
            warn!("Focus signal dropped: engine task unavailable");
        }
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        let (ack, rx) = oneshot::channel();
        self.send(EngineCommand::Snapshot { ack })?;
        rx.await.map_err(|_| anyhow!("engine task terminated"))
    }

    /// Wait for the decision queue to drain. Used by shutdown (and tests)
    /// before flushing the store.
    pub async fn settle(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send(EngineCommand::Barrier { ack })?;
        rx.await.map_err(|_| anyhow!("engine task terminated"))
    }

    fn send(&self, command: EngineCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| anyhow!("engine task unavailable"))
    }
}
