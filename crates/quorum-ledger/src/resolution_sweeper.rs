//! Periodic background resolution.
//!
//! Votes resolve opportunistically, but a round whose deadline passes with no
//! further activity only resolves when someone polls it. The sweeper does that
//! polling on a fixed interval until told to stop.

use crate::subject_registry::{SubjectRegistry, SweepReport};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

pub struct ResolutionSweeper {
    registry: Arc<SubjectRegistry>,
    interval: Duration,
}

/// Running sweeper task
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<u64>,
}

impl SweeperHandle {
    /// Stop after the current pass, returning how many passes ran
    pub async fn stop(self) -> u64 {
        // the receiver is gone only if the task already ended
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(passes) => passes,
            Err(e) => {
                warn!("Resolution sweeper task ended abnormally: {}", e);
                0
            }
        }
    }
}

impl ResolutionSweeper {
    pub fn new(registry: Arc<SubjectRegistry>, interval: Duration) -> Self {
        ResolutionSweeper { registry, interval }
    }

    /// Run one pass immediately
    pub fn sweep_once(&self) -> SweepReport {
        let report = self.registry.sweep();
        for (subject_id, reason) in &report.failures {
            warn!("Sweep failure on {}: {}", subject_id, reason);
        }
        report
    }

    /// Spawn the periodic task on the current tokio runtime
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut passes: u64 = 0;

            info!("Resolution sweeper started, interval {:?}", self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.sweep_once();
                        passes += 1;
                        debug!(
                            "Sweep pass {}: {} resolved, {} finalized",
                            passes,
                            report.resolved.len(),
                            report.finalized.len()
                        );
                    }
                    // a stop signal or a dropped handle both end the loop
                    _ = stop.changed() => break,
                }
            }
            info!("Resolution sweeper stopped after {} passes", passes);
            passes
        });

        SweeperHandle { shutdown, task }
    }
}
