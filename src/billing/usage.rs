use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, Utc};
use tracing::debug;

use crate::error::{BillingError, BillingResult};

use super::cache::MeterCache;
use super::models::{ProductType, Workspace};

/// key: billing-window -> [start, end) used for every meter of a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingWindow {
    /// Next invoice date wins, then the explicit billing period, then the calendar month.
    pub fn for_workspace(workspace: &Workspace, now: DateTime<Utc>) -> Self {
        let month_start = first_of_month(now);
        let start = workspace
            .next_invoice_date
            .and_then(|next| next.checked_sub_months(Months::new(1)))
            .or(workspace.billing_period_start)
            .unwrap_or(month_start);
        let end = workspace
            .next_invoice_date
            .or(workspace.billing_period_end)
            .unwrap_or_else(|| {
                month_start
                    .checked_add_months(Months::new(1))
                    .unwrap_or(month_start)
            });
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

fn first_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .with_day(1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

/// One pre-aggregated day of usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyCount {
    pub date: DateTime<Utc>,
    pub count: i64,
}

/// key: billing-meter-source -> raw usage counts for one product family
#[async_trait]
pub trait MeterSource: Send + Sync {
    /// Pre-aggregated daily counts whose date falls inside `window`.
    async fn daily_counts(
        &self,
        workspace_id: i32,
        product: ProductType,
        window: BillingWindow,
    ) -> anyhow::Result<Vec<DailyCount>>;

    /// Billable raw events in `[from, to)`.
    async fn live_count(
        &self,
        workspace_id: i32,
        product: ProductType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<i64>;

    /// Mean of the daily counts in `[from, to)`, zero when there are none.
    async fn daily_average(
        &self,
        workspace_id: i32,
        product: ProductType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<f64>;
}

/// Daily aggregates strictly before the latest aggregated day, plus a live count from that day on.
pub async fn combine_meter(
    source: &dyn MeterSource,
    workspace_id: i32,
    product: ProductType,
    window: BillingWindow,
) -> anyhow::Result<i64> {
    let daily: Vec<DailyCount> = source
        .daily_counts(workspace_id, product, window)
        .await?
        .into_iter()
        .filter(|day| window.contains(day.date))
        .collect();

    let (historical, live_from) = match daily.iter().map(|day| day.date).max() {
        Some(latest) => (
            daily
                .iter()
                .filter(|day| day.date < latest)
                .map(|day| day.count)
                .sum::<i64>(),
            latest,
        ),
        None => (0, window.start),
    };
    let live = source
        .live_count(workspace_id, product, live_from, window.end)
        .await?;

    debug!(
        workspace_id,
        product = %product,
        historical,
        live,
        live_from = %live_from,
        "combined usage meter"
    );
    Ok(historical + live)
}

/// key: billing-usage-aggregator -> cached per (workspace, product) meters
pub struct UsageAggregator {
    sources: BTreeMap<ProductType, Arc<dyn MeterSource>>,
    cache: MeterCache<(i32, ProductType), i64>,
}

impl UsageAggregator {
    pub fn new(fresh_for: Duration, expire_after: Duration) -> Self {
        Self {
            sources: BTreeMap::new(),
            cache: MeterCache::new(fresh_for, expire_after),
        }
    }

    /// Routes the given products to `source`.
    pub fn route(mut self, products: &[ProductType], source: Arc<dyn MeterSource>) -> Self {
        for product in products {
            self.sources.insert(*product, source.clone());
        }
        self
    }

    fn source(&self, product: ProductType) -> BillingResult<&Arc<dyn MeterSource>> {
        self.sources.get(&product).ok_or_else(|| BillingError::Meter {
            product,
            source: anyhow!("no meter source configured"),
        })
    }

    pub async fn meter(
        &self,
        workspace: &Workspace,
        product: ProductType,
        now: DateTime<Utc>,
    ) -> BillingResult<i64> {
        let source = self.source(product)?.clone();
        let window = BillingWindow::for_workspace(workspace, now);
        let workspace_id = workspace.id;
        self.cache
            .get_or_compute((workspace_id, product), || async move {
                combine_meter(source.as_ref(), workspace_id, product, window).await
            })
            .await
            .map_err(|source| BillingError::Meter { product, source })
    }

    /// Average daily usage from eight days ago up to yesterday. Diagnostic only.
    pub async fn trailing_average(
        &self,
        workspace: &Workspace,
        product: ProductType,
        now: DateTime<Utc>,
    ) -> BillingResult<f64> {
        let source = self.source(product)?;
        source
            .daily_average(
                workspace.id,
                product,
                now - ChronoDuration::days(8),
                now - ChronoDuration::days(1),
            )
            .await
            .map_err(|source| BillingError::Meter { product, source })
    }
}
