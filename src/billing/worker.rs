use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, error, info};

use crate::error::{BillingError, BillingResult};

use super::health::{BillingHealthMonitor, HealthTransition};
use super::marketplace::{MarketplaceReport, MarketplaceReporter, MarketplaceUsage};
use super::models::Workspace;
use super::notifications::{send_logged, NotificationSender, NotificationType};
use super::overage::OverageCalculator;
use super::reconciliation::{LedgerChanges, LedgerReconciler};
use super::store::WorkspaceStore;

/// Result of one workspace pass.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceOutcome {
    Reconciled {
        changes: LedgerChanges,
        health: Option<HealthTransition>,
    },
    /// Free plan or nothing upcoming on the ledger.
    Skipped,
    Marketplace(MarketplaceUsage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub reconciled: usize,
    pub skipped: usize,
    pub failed: usize,
    pub marketplace_workspaces: usize,
    pub marketplace: MarketplaceReport,
}

/// key: billing-worker -> per-workspace driver and fan-out
pub struct BillingWorker {
    store: Arc<dyn WorkspaceStore>,
    overages: OverageCalculator,
    health: BillingHealthMonitor,
    reconciler: LedgerReconciler,
    marketplace: MarketplaceReporter,
    notifier: Arc<dyn NotificationSender>,
    concurrency: usize,
}

impl BillingWorker {
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        overages: OverageCalculator,
        health: BillingHealthMonitor,
        reconciler: LedgerReconciler,
        marketplace: MarketplaceReporter,
        notifier: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            store,
            overages,
            health,
            reconciler,
            marketplace,
            notifier,
            concurrency: 1,
        }
    }

    /// Workspaces reconciled at once; steps within one workspace always run in order.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn reconcile_workspace_by_id(
        &self,
        workspace_id: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<WorkspaceOutcome> {
        let workspace = self
            .store
            .get_workspace(workspace_id)
            .await
            .map_err(BillingError::Store)?
            .ok_or(BillingError::WorkspaceNotFound(workspace_id))?;
        self.reconcile_workspace(&workspace, now).await
    }

    /// Trial notices, then ledger preconditions, billing health, overage and ledger writes.
    pub async fn reconcile_workspace(
        &self,
        workspace: &Workspace,
        now: DateTime<Utc>,
    ) -> BillingResult<WorkspaceOutcome> {
        self.notify_workspace_trial(workspace, now).await;

        let Some(context) = self.reconciler.prepare(workspace, now).await? else {
            return Ok(WorkspaceOutcome::Skipped);
        };

        let health = self
            .health
            .check(
                workspace,
                &context.customer_id,
                &context.subscription,
                Some(&context.invoice),
                now,
            )
            .await;

        let summary = self.overages.summarize(workspace, now).await?;
        let changes = self.reconciler.apply(&context, &summary.overages()).await?;
        info!(
            workspace_id = workspace.id,
            customer = %context.customer_id,
            tier = %context.tier,
            ?changes,
            "reconciled ledger overage"
        );
        Ok(WorkspaceOutcome::Reconciled { changes, health })
    }

    async fn marketplace_usage(
        &self,
        workspace: &Workspace,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<MarketplaceUsage>> {
        let Some(customer) = workspace.marketplace_customer.clone() else {
            return Ok(None);
        };
        let summary = self.overages.summarize(workspace, now).await?;
        let overages = summary.overages();
        info!(workspace_id = workspace.id, ?overages, "reporting marketplace overages");
        Ok(Some(MarketplaceUsage {
            workspace_id: workspace.id,
            customer,
            overages,
        }))
    }

    async fn process(
        &self,
        workspace: &Workspace,
        now: DateTime<Utc>,
    ) -> BillingResult<WorkspaceOutcome> {
        match self.marketplace_usage(workspace, now).await? {
            Some(usage) => Ok(WorkspaceOutcome::Marketplace(usage)),
            None => self.reconcile_workspace(workspace, now).await,
        }
    }

    /// One workspace failing never stops the others.
    pub async fn reconcile_all(&self, now: DateTime<Utc>) -> BillingResult<RunSummary> {
        let workspaces = self
            .store
            .list_billable_workspaces()
            .await
            .map_err(BillingError::Store)?;
        debug!(workspaces = workspaces.len(), "starting billing reconciliation pass");

        let outcomes: Vec<(i32, BillingResult<WorkspaceOutcome>)> = stream::iter(workspaces)
            .map(|workspace| async move {
                let outcome = self.process(&workspace, now).await;
                (workspace.id, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = RunSummary::default();
        let mut marketplace_usages = Vec::new();
        for (workspace_id, outcome) in outcomes {
            match outcome {
                Ok(WorkspaceOutcome::Reconciled { .. }) => summary.reconciled += 1,
                Ok(WorkspaceOutcome::Skipped) => summary.skipped += 1,
                Ok(WorkspaceOutcome::Marketplace(usage)) => marketplace_usages.push(usage),
                Err(err) => {
                    summary.failed += 1;
                    error!(
                        ?err,
                        workspace_id,
                        kind = err.kind().as_str(),
                        retryable = err.is_retryable(),
                        "error reporting usage for workspace"
                    );
                }
            }
        }

        marketplace_usages.sort_by_key(|usage| usage.workspace_id);
        summary.marketplace_workspaces = marketplace_usages.len();
        if !marketplace_usages.is_empty() {
            summary.marketplace = self.marketplace.report(&marketplace_usages, now).await;
        }

        info!(
            reconciled = summary.reconciled,
            skipped = summary.skipped,
            failed = summary.failed,
            marketplace = summary.marketplace_workspaces,
            "billing reconciliation pass finished"
        );
        Ok(summary)
    }

    /// Only trials that ended within the last week or have not ended yet are considered.
    async fn notify_workspace_trial(&self, workspace: &Workspace, now: DateTime<Utc>) {
        let Some(trial_end) = workspace.trial_end_date else {
            return;
        };
        if trial_end <= now - Duration::days(7) {
            return;
        }
        let notification = if trial_end < now {
            NotificationType::TrialEnded
        } else if trial_end < now + Duration::days(7) {
            NotificationType::TrialEnding7Days
        } else {
            return;
        };
        send_logged(self.notifier.as_ref(), notification, workspace, None).await;
    }
}
