use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::{bail, Context, Result};
use log::info;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, Duration, Instant},
};

use super::EngineCommand;

const BASE_INTERVAL: Duration = Duration::from_secs(3);
const SETTLED_INTERVAL: Duration = Duration::from_secs(6);
const DEEP_FOCUS_INTERVAL: Duration = Duration::from_secs(12);
const SETTLED_AFTER: Duration = Duration::from_secs(30);
const DEEP_FOCUS_AFTER: Duration = Duration::from_secs(300);

/// Fallback interval for catching in-app changes the OS never announces
/// (browser tab switches). The longer the target has been stable, the less
/// likely such a change is, so the interval widens; reduced power widens
/// everything by half again.
pub fn poll_interval(stable_for: Duration, low_power: bool) -> Duration {
    let base = if stable_for >= DEEP_FOCUS_AFTER {
        DEEP_FOCUS_INTERVAL
    } else if stable_for >= SETTLED_AFTER {
        SETTLED_INTERVAL
    } else {
        BASE_INTERVAL
    };

    if low_power {
        base.mul_f64(1.5)
    } else {
        base
    }
}

/// Inputs the decision loop refreshes on every committed switch.
pub struct PollShared {
    stable_since: Mutex<Instant>,
    low_power: AtomicBool,
}

impl PollShared {
    pub fn new() -> Self {
        Self {
            stable_since: Mutex::new(Instant::now()),
            low_power: AtomicBool::new(false),
        }
    }

    pub fn mark_switched(&self) {
        *self.stable_since.lock().unwrap() = Instant::now();
    }

    pub fn set_low_power(&self, low_power: bool) {
        self.low_power.store(low_power, Ordering::Relaxed);
    }

    fn current_interval(&self) -> Duration {
        let stable_for = self.stable_since.lock().unwrap().elapsed();
        poll_interval(stable_for, self.low_power.load(Ordering::Relaxed))
    }
}

impl Default for PollShared {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Running,
    Suspended,
    Cancelled,
}

/// Adaptive fallback timer feeding `PollTick` commands into the engine.
///
/// The phase machine exists because at least one platform timer API makes
/// cancelling a suspended timer undefined; `cancel` therefore performs the
/// resume leg itself when needed, so callers cannot get the ordering wrong.
pub struct FallbackPoller {
    phase_tx: watch::Sender<TimerPhase>,
    handle: Option<JoinHandle<()>>,
}

impl FallbackPoller {
    pub fn spawn(
        command_tx: mpsc::UnboundedSender<EngineCommand>,
        shared: Arc<PollShared>,
    ) -> Self {
        let (phase_tx, mut phase_rx) = watch::channel(TimerPhase::Running);

        let handle = tokio::spawn(async move {
            loop {
                let phase = *phase_rx.borrow();
                match phase {
                    TimerPhase::Cancelled => break,
                    TimerPhase::Suspended => {
                        // Sleep until the phase moves; no ticks while suspended.
                        if phase_rx.changed().await.is_err() {
                            break;
                        }
                        continue;
                    }
                    TimerPhase::Running => {}
                }

                let interval = shared.current_interval();
                tokio::select! {
                    _ = sleep(interval) => {
                        if command_tx.send(EngineCommand::PollTick).is_err() {
                            break;
                        }
                    }
                    changed = phase_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("Fallback poller exited");
        });

        Self {
            phase_tx,
            handle: Some(handle),
        }
    }

    pub fn phase(&self) -> TimerPhase {
        *self.phase_tx.borrow()
    }

    pub fn suspend(&self) -> Result<()> {
        match self.phase() {
            TimerPhase::Cancelled => bail!("cannot suspend a cancelled timer"),
            TimerPhase::Suspended => Ok(()),
            TimerPhase::Running => {
                let _ = self.phase_tx.send(TimerPhase::Suspended);
                Ok(())
            }
        }
    }

    pub fn resume(&self) -> Result<()> {
        match self.phase() {
            TimerPhase::Cancelled => bail!("cannot resume a cancelled timer"),
            TimerPhase::Running => Ok(()),
            TimerPhase::Suspended => {
                let _ = self.phase_tx.send(TimerPhase::Running);
                Ok(())
            }
        }
    }

    /// Terminal transition. A suspended timer is resumed first; callers never
    /// have to sequence that themselves.
    pub async fn cancel(mut self) -> Result<()> {
        if self.phase() == TimerPhase::Suspended {
            self.resume()?;
        }
        let _ = self.phase_tx.send(TimerPhase::Cancelled);

        if let Some(handle) = self.handle.take() {
            handle.await.context("fallback poller task failed to join")?;
        }
        Ok(())
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            let _ = self.phase_tx.send(TimerPhase::Cancelled);
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_widens_with_stability() {
        assert_eq!(
            poll_interval(Duration::from_secs(0), false),
            Duration::from_secs(3)
        );
        assert_eq!(
            poll_interval(Duration::from_secs(29), false),
            Duration::from_secs(3)
        );
        assert_eq!(
            poll_interval(Duration::from_secs(30), false),
            Duration::from_secs(6)
        );
        assert_eq!(
            poll_interval(Duration::from_secs(299), false),
            Duration::from_secs(6)
        );
        assert_eq!(
            poll_interval(Duration::from_secs(300), false),
            Duration::from_secs(12)
        );
    }

    #[test]
    fn low_power_widens_by_half() {
        assert_eq!(
            poll_interval(Duration::from_secs(0), true),
            Duration::from_secs_f64(4.5)
        );
        assert_eq!(
            poll_interval(Duration::from_secs(600), true),
            Duration::from_secs(18)
        );
    }

    #[tokio::test]
    async fn ticks_flow_only_while_running() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PollShared::new());
        let poller = FallbackPoller::spawn(tx, shared);

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(matches!(rx.recv().await, Some(EngineCommand::PollTick)));

        poller.suspend().unwrap();
        assert_eq!(poller.phase(), TimerPhase::Suspended);
        // Let the poller task observe the phase change before time moves.
        tokio::task::yield_now().await;
        while rx.try_recv().is_ok() {}
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());

        poller.resume().unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(matches!(rx.recv().await, Some(EngineCommand::PollTick)));

        poller.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_of_suspended_timer_resumes_first() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let poller = FallbackPoller::spawn(tx, Arc::new(PollShared::new()));

        poller.suspend().unwrap();
        // Must not hang or error; the guarded cancel owns the resume leg.
        poller.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn transitions_after_cancel_are_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let poller = FallbackPoller::spawn(tx, Arc::new(PollShared::new()));

        // Force the terminal phase without consuming the struct.
        let _ = poller.phase_tx.send(TimerPhase::Cancelled);
        assert!(poller.suspend().is_err());
        assert!(poller.resume().is_err());
    }
}
