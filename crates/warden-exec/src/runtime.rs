//! Background tasks: the periodic reclaimer and the enforcement tick.
//!
//! Each task runs on its own interval and does its work on the blocking
//! pool, since sweeps take std locks. Neither task calls the other.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::governor::Governor;

pub struct GovernorRuntime {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl GovernorRuntime {
    /// Start both background tasks on the current tokio runtime.
    pub fn spawn(governor: Arc<Governor>) -> Self {
        let (shutdown, stop) = watch::channel(false);
        let reclaim_every = governor.config().reclaim_interval();
        let enforce_every = governor.config().enforcement_interval();

        let tasks = vec![
            tokio::spawn(run_periodic(
                Arc::clone(&governor),
                reclaim_every,
                stop.clone(),
                reclaim_tick,
                "reclaimer",
            )),
            tokio::spawn(run_periodic(
                governor,
                enforce_every,
                stop,
                enforce_tick,
                "enforcement",
            )),
        ];
        Self { shutdown, tasks }
    }

    /// Stop both tasks and wait for them to finish their current tick.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(_err) = task.await {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_err, "governor task ended abnormally");
            }
        }
    }
}

impl Drop for GovernorRuntime {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn reclaim_tick(governor: &Governor) {
    governor.reclaim_now();
}

fn enforce_tick(governor: &Governor) {
    governor.enforce_isolation();
}

async fn run_periodic(
    governor: Arc<Governor>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    tick: fn(&Governor),
    _name: &'static str,
) {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    #[cfg(feature = "tracing")]
    tracing::debug!(task = _name, period_ms = period.as_millis() as u64, "governor task started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let governor = Arc::clone(&governor);
                if let Err(_err) = tokio::task::spawn_blocking(move || tick(&governor)).await {
                    #[cfg(feature = "tracing")]
                    tracing::error!(task = _name, error = %_err, "governor tick panicked");
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(task = _name, "governor task stopped");
}
