use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use super::models::{
    MarketplaceCustomer, PlanType, ProductSettings, ProductType, RetentionPeriod, Workspace,
};

/// key: billing-workspace-store -> tenant snapshots and the few fields billing writes back
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn get_workspace(&self, workspace_id: i32) -> Result<Option<Workspace>>;
    /// Workspaces with both billing period bounds set, marketplace linkage included.
    async fn list_billable_workspaces(&self) -> Result<Vec<Workspace>>;
    /// Members meter.
    async fn admin_count(&self, workspace_id: i32) -> Result<i64>;
    async fn set_next_invoice_date(
        &self,
        workspace_id: i32,
        next_invoice_date: DateTime<Utc>,
    ) -> Result<()>;
}

const WORKSPACE_SELECT: &str = r#"
    SELECT
        w.id,
        w.name,
        w.plan_tier,
        w.unlimited_members,
        w.allow_meter_overage,
        w.billing_period_start,
        w.billing_period_end,
        w.next_invoice_date,
        w.trial_end_date,
        w.stripe_customer_id,
        w.monthly_members_limit,
        w.can_show_billing_issue_banner,
        mc.customer_identifier AS marketplace_customer_identifier,
        mc.product_code AS marketplace_product_code
    FROM workspaces w
    LEFT JOIN marketplace_customers mc ON mc.workspace_id = w.id
"#;

#[derive(Debug, FromRow)]
struct WorkspaceRow {
    id: i32,
    name: String,
    plan_tier: String,
    unlimited_members: bool,
    allow_meter_overage: bool,
    billing_period_start: Option<DateTime<Utc>>,
    billing_period_end: Option<DateTime<Utc>>,
    next_invoice_date: Option<DateTime<Utc>>,
    trial_end_date: Option<DateTime<Utc>>,
    stripe_customer_id: Option<String>,
    monthly_members_limit: Option<i64>,
    can_show_billing_issue_banner: bool,
    marketplace_customer_identifier: Option<String>,
    marketplace_product_code: Option<String>,
}

#[derive(Debug, FromRow)]
struct ProductSettingsRow {
    workspace_id: i32,
    product: String,
    monthly_limit: Option<i64>,
    max_cost_cents: Option<i64>,
    retention_period: Option<String>,
    overage_price_id: Option<String>,
}

impl WorkspaceRow {
    fn into_workspace(self) -> Result<Workspace> {
        let plan_tier = self
            .plan_tier
            .parse::<PlanType>()
            .with_context(|| format!("workspace {} has an invalid plan tier", self.id))?;
        Ok(Workspace {
            id: self.id,
            name: self.name,
            plan_tier,
            unlimited_members: self.unlimited_members,
            allow_meter_overage: self.allow_meter_overage,
            billing_period_start: self.billing_period_start,
            billing_period_end: self.billing_period_end,
            next_invoice_date: self.next_invoice_date,
            trial_end_date: self.trial_end_date,
            stripe_customer_id: self.stripe_customer_id,
            monthly_members_limit: self.monthly_members_limit,
            can_show_billing_issue_banner: self.can_show_billing_issue_banner,
            marketplace_customer: self.marketplace_customer_identifier.map(
                |customer_identifier| MarketplaceCustomer {
                    customer_identifier,
                    product_code: self.marketplace_product_code,
                },
            ),
            products: Default::default(),
        })
    }
}

/// key: billing-workspace-store-pg -> Postgres implementation
#[derive(Clone)]
pub struct PgWorkspaceStore {
    pool: PgPool,
}

impl PgWorkspaceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn attach_settings(&self, mut workspaces: Vec<Workspace>) -> Result<Vec<Workspace>> {
        if workspaces.is_empty() {
            return Ok(workspaces);
        }
        let ids: Vec<i32> = workspaces.iter().map(|workspace| workspace.id).collect();
        let rows = sqlx::query_as::<_, ProductSettingsRow>(
            r#"
            SELECT workspace_id, product, monthly_limit, max_cost_cents, retention_period, overage_price_id
            FROM workspace_product_settings
            WHERE workspace_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .context("failed to load workspace product settings")?;

        let mut by_workspace: HashMap<i32, &mut Workspace> = workspaces
            .iter_mut()
            .map(|workspace| (workspace.id, workspace))
            .collect();
        for row in rows {
            let Some(workspace) = by_workspace.get_mut(&row.workspace_id) else {
                continue;
            };
            let product = row.product.parse::<ProductType>().with_context(|| {
                format!("workspace {} has settings for an unknown product", row.workspace_id)
            })?;
            let retention_period = row
                .retention_period
                .map(|period| period.parse::<RetentionPeriod>())
                .transpose()
                .with_context(|| {
                    format!("workspace {} has an invalid retention period", row.workspace_id)
                })?;
            workspace.products.insert(
                product,
                ProductSettings {
                    monthly_limit: row.monthly_limit,
                    max_cost_cents: row.max_cost_cents,
                    retention_period,
                    overage_price_id: row.overage_price_id,
                },
            );
        }
        Ok(workspaces)
    }
}

#[async_trait]
impl WorkspaceStore for PgWorkspaceStore {
    async fn get_workspace(&self, workspace_id: i32) -> Result<Option<Workspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>(&format!("{WORKSPACE_SELECT} WHERE w.id = $1"))
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load workspace")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let workspaces = self.attach_settings(vec![row.into_workspace()?]).await?;
        Ok(workspaces.into_iter().next())
    }

    async fn list_billable_workspaces(&self) -> Result<Vec<Workspace>> {
        let rows = sqlx::query_as::<_, WorkspaceRow>(&format!(
            "{WORKSPACE_SELECT} WHERE w.billing_period_start IS NOT NULL AND w.billing_period_end IS NOT NULL ORDER BY w.id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list billable workspaces")?;
        let workspaces = rows
            .into_iter()
            .map(WorkspaceRow::into_workspace)
            .collect::<Result<Vec<_>>>()?;
        self.attach_settings(workspaces).await
    }

    async fn admin_count(&self, workspace_id: i32) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM workspace_admins WHERE workspace_id = $1")
                .bind(workspace_id)
                .fetch_one(&self.pool)
                .await
                .context("failed to count workspace admins")?;
        Ok(count)
    }

    async fn set_next_invoice_date(
        &self,
        workspace_id: i32,
        next_invoice_date: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE workspaces SET next_invoice_date = $2 WHERE id = $1")
            .bind(workspace_id)
            .bind(next_invoice_date)
            .execute(&self.pool)
            .await
            .context("failed to update next invoice date")?;
        Ok(())
    }
}
