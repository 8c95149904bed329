//! Trigger scheduling.
//!
//! Maps application events onto debounced sync cycles. Each trigger kind
//! carries its own debounce; firing a trigger while its timer is armed
//! resets the timer, so a burst of writes coalesces into a single cycle
//! after quiescence. The engine's in-flight flag remains the sole
//! concurrency guard, so an eager caller can still invoke
//! [`SyncEngine::sync`] directly without going through the scheduler.

use crate::backend::BackendClient;
use crate::engine::{CycleOutcome, SyncEngine};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Events that request a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    /// A local mutation committed.
    AfterWrite,
    /// The background interval elapsed.
    Interval,
    /// The app regained foreground visibility.
    Visibility,
    /// Network connectivity returned.
    Reconnect,
    /// The user asked for a sync explicitly.
    Manual,
    /// The backend hinted that remote data changed.
    RemoteHint,
}

impl SyncTrigger {
    /// Returns true for user-attributable triggers whose failures should
    /// surface; background triggers fail silently into
    /// [`TriggerScheduler::last_error`].
    pub fn surfaces_errors(&self) -> bool {
        matches!(
            self,
            SyncTrigger::AfterWrite | SyncTrigger::Reconnect | SyncTrigger::Manual
        )
    }
}

/// Schedules debounced sync cycles on a Tokio runtime.
///
/// Dropping the scheduler aborts all armed timers and the background
/// interval.
pub struct TriggerScheduler<B: BackendClient + 'static> {
    engine: Arc<SyncEngine<B>>,
    timers: Mutex<HashMap<SyncTrigger, JoinHandle<()>>>,
    interval: Mutex<Option<JoinHandle<()>>>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl<B: BackendClient + 'static> TriggerScheduler<B> {
    /// Creates a scheduler driving the given engine.
    pub fn new(engine: Arc<SyncEngine<B>>) -> Self {
        Self {
            engine,
            timers: Mutex::new(HashMap::new()),
            interval: Mutex::new(None),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// The engine this scheduler drives.
    pub fn engine(&self) -> &Arc<SyncEngine<B>> {
        &self.engine
    }

    /// Debounce for a trigger kind, from the engine configuration.
    fn debounce(&self, trigger: SyncTrigger) -> Duration {
        let config = self.engine.config();
        match trigger {
            SyncTrigger::AfterWrite => config.write_debounce,
            SyncTrigger::Visibility => config.visibility_debounce,
            _ => Duration::ZERO,
        }
    }

    /// Fires a trigger: arms (or re-arms) its debounce timer, then runs
    /// one cycle when the timer elapses.
    ///
    /// Re-firing before the timer elapses resets it, so bursts coalesce.
    pub fn fire(&self, trigger: SyncTrigger) {
        let debounce = self.debounce(trigger);
        let engine = Arc::clone(&self.engine);
        let last_error = Arc::clone(&self.last_error);

        let handle = tokio::spawn(async move {
            if !debounce.is_zero() {
                tokio::time::sleep(debounce).await;
            }
            run_cycle_for(trigger, &engine, &last_error).await;
        });

        if let Some(previous) = self.timers.lock().insert(trigger, handle) {
            previous.abort();
        }
    }

    /// Starts the fixed-cadence background loop. The first cycle runs one
    /// full period from now, not immediately. Restarting replaces any
    /// existing loop.
    pub fn start_interval(&self) {
        let period = self.engine.config().interval_period;
        let engine = Arc::clone(&self.engine);
        let last_error = Arc::clone(&self.last_error);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // interval's first tick is immediate; swallow it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                run_cycle_for(SyncTrigger::Interval, &engine, &last_error).await;
            }
        });

        if let Some(previous) = self.interval.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the background loop.
    pub fn stop_interval(&self) {
        if let Some(handle) = self.interval.lock().take() {
            handle.abort();
        }
    }

    /// The most recent background-trigger error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Clears the recorded background error.
    pub fn clear_last_error(&self) {
        *self.last_error.write() = None;
    }

    /// Aborts every armed timer and the background loop.
    pub fn shutdown(&self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
        self.stop_interval();
    }
}

impl<B: BackendClient + 'static> Drop for TriggerScheduler<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs one cycle on behalf of a trigger and records the outcome.
async fn run_cycle_for<B: BackendClient>(
    trigger: SyncTrigger,
    engine: &SyncEngine<B>,
    last_error: &RwLock<Option<String>>,
) {
    match engine.sync().await {
        Ok(CycleOutcome::Completed(_)) => {
            debug!(?trigger, "triggered cycle completed");
            *last_error.write() = None;
        }
        Ok(CycleOutcome::Skipped) => {
            debug!(?trigger, "triggered cycle skipped, one already in flight");
        }
        Err(error) => {
            if trigger.surfaces_errors() {
                warn!(?trigger, "triggered cycle failed: {error}");
                *last_error.write() = Some(error.to_string());
            } else {
                // Background triggers fail silently; the next trigger
                // retries the same pending work.
                debug!(?trigger, "background cycle failed: {error}");
            }
        }
    }
}
