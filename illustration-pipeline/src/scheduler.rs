use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::coordinator::PipelineCoordinator;
use crate::types::{PipelineRun, SourceId};

const MIN_TICK: Duration = Duration::from_secs(1);

/// Re-runs the coordinator for whichever sources are due.
pub struct Scheduler {
    coordinator: Arc<PipelineCoordinator>,
    tick: Duration,
    last_fetched: HashMap<SourceId, DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(coordinator: Arc<PipelineCoordinator>) -> Self {
        let tick = coordinator
            .registry()
            .shortest_interval()
            .unwrap_or(Duration::from_secs(3600))
            .max(MIN_TICK);
        Self::with_tick(coordinator, tick)
    }

    pub fn with_tick(coordinator: Arc<PipelineCoordinator>, tick: Duration) -> Self {
        Self {
            coordinator,
            tick: tick.max(MIN_TICK),
            last_fetched: HashMap::new(),
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// One scheduling decision at `now`: runs the due sources, if any.
    pub async fn run_due(&mut self, now: DateTime<Utc>) -> Option<PipelineRun> {
        let due = self.coordinator.registry().due(now, &self.last_fetched);
        if due.is_empty() {
            debug!("No sources due");
            return None;
        }
        for source in &due {
            self.last_fetched.insert(source.id.clone(), now);
        }
        Some(self.coordinator.run_sources(due).await)
    }

    /// Ticks until `shutdown` resolves. A run in progress is finished first.
    pub async fn run_until<F>(mut self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(tick = ?self.tick, "Scheduler started");
        let mut runs = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if self.run_due(Utc::now()).await.is_some() {
                        runs += 1;
                    }
                }
            }
        }
        info!(runs, "Scheduler stopped");
        runs
    }
}
