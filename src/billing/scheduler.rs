use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration as TokioDuration, MissedTickBehavior};
use tracing::{debug, warn};

use super::worker::{BillingWorker, RunSummary};

/// key: billing-reconcile-scheduler -> periodic reconciliation passes
pub fn spawn(worker: Arc<BillingWorker>, interval: TokioDuration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            match process_tick(&worker, now).await {
                Ok(summary) => debug!(?summary, "billing reconciliation tick completed"),
                Err(err) => warn!(?err, "billing reconciliation tick failed"),
            }
        }
    })
}

/// key: billing-reconcile-scheduler -> tick handler
pub async fn process_tick(worker: &BillingWorker, now: DateTime<Utc>) -> Result<RunSummary> {
    worker
        .reconcile_all(now)
        .await
        .context("failed to list billable workspaces")
}
