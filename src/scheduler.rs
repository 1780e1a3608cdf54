//! Timers for automatic backup and sync
//!
//! One background task per concern. Restarting a timer aborts the previous
//! task before spawning the new one, so reconfiguration never leaves two
//! timers running. Each tick runs its job in a task of its own: aborting a
//! timer stops future ticks but never cancels a run already in flight.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// A job the scheduler runs on each tick
pub type Job = Arc<dyn Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Build a [`Job`] from an async closure
pub fn job<F, Fut>(f: F) -> Job
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Default)]
pub struct Scheduler {
    backup: Mutex<Option<JoinHandle<()>>>,
    sync: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)start the backup timer; `None` only stops it
    pub fn start_backup(&self, every: Option<Duration>, job: Job) {
        Self::install(&self.backup, "backup", every, job);
    }

    pub fn stop_backup(&self) {
        Self::install_none(&self.backup, "backup");
    }

    /// (Re)start the sync timer; `None` only stops it
    pub fn start_sync(&self, every: Option<Duration>, job: Job) {
        Self::install(&self.sync, "sync", every, job);
    }

    pub fn stop_sync(&self) {
        Self::install_none(&self.sync, "sync");
    }

    pub fn backup_active(&self) -> bool {
        Self::active(&self.backup)
    }

    pub fn sync_active(&self) -> bool {
        Self::active(&self.sync)
    }

    pub fn stop_all(&self) {
        self.stop_backup();
        self.stop_sync();
    }

    fn active(slot: &Mutex<Option<JoinHandle<()>>>) -> bool {
        slot.lock().as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    fn install_none(slot: &Mutex<Option<JoinHandle<()>>>, name: &str) {
        if let Some(handle) = slot.lock().take() {
            handle.abort();
            tracing::debug!("Stopped {} timer", name);
        }
    }

    fn install(slot: &Mutex<Option<JoinHandle<()>>>, name: &'static str, every: Option<Duration>, job: Job) {
        let mut slot = slot.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let Some(period) = every.filter(|d| !d.is_zero()) else {
            tracing::debug!("{} timer disabled", name);
            return;
        };

        *slot = Some(tokio::spawn(async move {
            // First tick one full period from now, not immediately
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                tracing::debug!("{} timer fired", name);
                tokio::spawn(job());
            }
        }));
        tracing::info!("{} timer set to every {:?}", name, period);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}
