use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{BillingError, BillingResult};

use super::models::{ProductType, ProductUsage, UsageSummary, Workspace};
use super::notifications::{send_logged, NotificationSender, NotificationType};
use super::pricing::{member_limit, PricingTable};
use super::store::WorkspaceStore;
use super::usage::UsageAggregator;

/// Billable quantity above `limit`; zero unless the workspace is paying and has opted into overage.
pub fn calculate_overage(workspace: &Workspace, limit: Option<i64>, meter: i64) -> i64 {
    match limit {
        Some(limit) if !workspace.is_free() && workspace.allow_meter_overage && meter > limit => {
            meter - limit
        }
        _ => 0,
    }
}

/// Seat cap for a workspace. The explicit monthly override only replaces a finite plan cap.
pub fn members_limit(workspace: &Workspace) -> Option<i64> {
    member_limit(workspace.plan_tier, workspace.unlimited_members)
        .map(|cap| workspace.monthly_members_limit.unwrap_or(cap))
}

/// key: billing-product-quota -> per-product overage strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductQuota {
    pub product: ProductType,
    pub notification: NotificationType,
    /// Units above the limit before the overage notification fires.
    pub notify_threshold: i64,
}

impl ProductQuota {
    /// Explicit monthly limit, else the plan's included amount.
    pub fn limit(&self, pricing: &PricingTable, workspace: &Workspace) -> Option<i64> {
        workspace
            .settings(self.product)
            .monthly_limit
            .or_else(|| {
                pricing
                    .schedule(workspace.plan_tier, self.product)
                    .map(|schedule| schedule.included)
            })
    }

    pub fn ingest_quota(&self, pricing: &PricingTable, workspace: &Workspace) -> Option<i64> {
        pricing.limit_amount(
            workspace.settings(self.product).max_cost_cents,
            self.product,
            workspace.plan_tier,
            workspace.retention(self.product),
        )
    }
}

pub const PRODUCT_QUOTAS: [ProductQuota; 5] = [
    ProductQuota {
        product: ProductType::Sessions,
        notification: NotificationType::SessionsOverage,
        notify_threshold: 1_000,
    },
    ProductQuota {
        product: ProductType::Errors,
        notification: NotificationType::ErrorsOverage,
        notify_threshold: 1_000,
    },
    ProductQuota {
        product: ProductType::Logs,
        notification: NotificationType::LogsOverage,
        notify_threshold: 1_000_000,
    },
    ProductQuota {
        product: ProductType::Traces,
        notification: NotificationType::TracesOverage,
        notify_threshold: 1_000_000,
    },
    ProductQuota {
        product: ProductType::Metrics,
        notification: NotificationType::MetricsOverage,
        notify_threshold: 1_000,
    },
];

/// key: billing-overage-calculator -> one usage summary per workspace pass
pub struct OverageCalculator {
    pricing: Arc<PricingTable>,
    usage: Arc<UsageAggregator>,
    store: Arc<dyn WorkspaceStore>,
    notifier: Arc<dyn NotificationSender>,
}

impl OverageCalculator {
    pub fn new(
        pricing: Arc<PricingTable>,
        usage: Arc<UsageAggregator>,
        store: Arc<dyn WorkspaceStore>,
        notifier: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            pricing,
            usage,
            store,
            notifier,
        }
    }

    pub async fn summarize(
        &self,
        workspace: &Workspace,
        now: DateTime<Utc>,
    ) -> BillingResult<UsageSummary> {
        let mut products = BTreeMap::new();

        let members = self
            .store
            .admin_count(workspace.id)
            .await
            .map_err(BillingError::Store)?;
        let limit = members_limit(workspace);
        products.insert(
            ProductType::Members,
            ProductUsage {
                meter: members,
                limit,
                overage: calculate_overage(workspace, limit, members),
                ingest_quota: None,
            },
        );

        for quota in PRODUCT_QUOTAS {
            let meter = self.usage.meter(workspace, quota.product, now).await?;
            let limit = quota.limit(&self.pricing, workspace);
            let overage = calculate_overage(workspace, limit, meter);

            if let Some(limit) = limit {
                if meter > limit.saturating_add(quota.notify_threshold) {
                    info!(
                        workspace_id = workspace.id,
                        product = %quota.product,
                        meter,
                        limit,
                        "usage passed overage notification threshold"
                    );
                    send_logged(
                        self.notifier.as_ref(),
                        quota.notification,
                        workspace,
                        None,
                    )
                    .await;
                }
            }

            products.insert(
                quota.product,
                ProductUsage {
                    meter,
                    limit,
                    overage,
                    ingest_quota: quota.ingest_quota(&self.pricing, workspace),
                },
            );
        }

        debug!(workspace_id = workspace.id, ?products, "computed usage summary");
        Ok(UsageSummary {
            workspace_id: workspace.id,
            products,
        })
    }
}
