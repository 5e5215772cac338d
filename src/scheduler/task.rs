//! Periodic background tasks with a skip-if-busy guard.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Marks a job as running so that overlapping invocations can be skipped.
#[derive(Debug, Default)]
pub struct RunFlag(AtomicBool);

impl RunFlag {
    /// Claim the flag. Returns `None` if a run is already in progress.
    pub fn try_begin(&self) -> Option<RunGuard<'_>> {
        if self.0.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(RunGuard(&self.0))
        }
    }
}

/// Releases the [`RunFlag`] when dropped.
#[derive(Debug)]
pub struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A job run on a fixed period until stopped.
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    stop: Mutex<Option<broadcast::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            stop: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the loop. Calling `start` on a running task does nothing.
    ///
    /// Ticks that fall due while `job` is still running are dropped rather
    /// than queued.
    pub fn start<F, Fut>(&self, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        if stop.is_some() {
            tracing::warn!("{} is already running", self.name);
            return;
        }

        let (tx, mut rx) = broadcast::channel(1);
        *stop = Some(tx);

        let name = self.name;
        let period = self.period;
        let handle = tokio::spawn(async move {
            tracing::info!("{}: started (every {:?})", name, period);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => job().await,
                }
            }

            tracing::info!("{}: stopped", name);
        });

        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Signal the loop to stop and wait for any in-flight run to finish.
    pub async fn stop(&self) {
        let tx = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("{}: task ended abnormally: {}", self.name, e);
            }
        }
    }
}
