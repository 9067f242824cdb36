use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{FromRow, PgPool};

use super::models::ProductType;
use super::usage::{BillingWindow, DailyCount, MeterSource};

struct RelationalMeter {
    daily_table: &'static str,
    live_query: &'static str,
}

fn relational_meter(product: ProductType) -> Result<RelationalMeter> {
    match product {
        ProductType::Sessions => Ok(RelationalMeter {
            daily_table: "daily_session_counts",
            live_query: r#"
                SELECT COUNT(*)
                FROM sessions s
                JOIN projects p ON p.id = s.project_id
                WHERE p.workspace_id = $1
                  AND s.created_at >= $2
                  AND s.created_at < $3
                  AND s.processed
                  AND NOT s.excluded
                  AND s.within_billing_quota
                  AND (s.active_length >= 1000 OR (s.active_length IS NULL AND s.length >= 1000))
            "#,
        }),
        ProductType::Errors => Ok(RelationalMeter {
            daily_table: "daily_error_counts",
            live_query: r#"
                SELECT COUNT(*)
                FROM error_objects e
                JOIN projects p ON p.id = e.project_id
                WHERE p.workspace_id = $1
                  AND e.created_at >= $2
                  AND e.created_at < $3
                  AND NOT e.is_beacon
            "#,
        }),
        other => Err(anyhow!("{other} is not metered from Postgres")),
    }
}

#[derive(Debug, FromRow)]
struct DailyCountRow {
    date: DateTime<Utc>,
    count: i64,
}

/// key: billing-meter-pg -> sessions and errors from daily rollups plus raw rows
#[derive(Clone)]
pub struct PgMeterSource {
    pool: PgPool,
}

impl PgMeterSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MeterSource for PgMeterSource {
    async fn daily_counts(
        &self,
        workspace_id: i32,
        product: ProductType,
        window: BillingWindow,
    ) -> Result<Vec<DailyCount>> {
        let meter = relational_meter(product)?;
        let rows = sqlx::query_as::<_, DailyCountRow>(&format!(
            r#"
            SELECT d.date, SUM(d.count)::BIGINT AS count
            FROM {} d
            JOIN projects p ON p.id = d.project_id
            WHERE p.workspace_id = $1 AND d.date >= $2 AND d.date < $3
            GROUP BY d.date
            ORDER BY d.date
            "#,
            meter.daily_table
        ))
        .bind(workspace_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load daily {product} counts"))?;
        Ok(rows
            .into_iter()
            .map(|row| DailyCount {
                date: row.date,
                count: row.count,
            })
            .collect())
    }

    async fn live_count(
        &self,
        workspace_id: i32,
        product: ProductType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let meter = relational_meter(product)?;
        let count: i64 = sqlx::query_scalar(meter.live_query)
            .bind(workspace_id)
            .bind(from)
            .bind(to)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to count live {product}"))?;
        Ok(count)
    }

    async fn daily_average(
        &self,
        workspace_id: i32,
        product: ProductType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<f64> {
        let meter = relational_meter(product)?;
        let average: f64 = sqlx::query_scalar(&format!(
            r#"
            SELECT COALESCE(AVG(daily.count), 0)::FLOAT8
            FROM (
                SELECT d.date, SUM(d.count) AS count
                FROM {} d
                JOIN projects p ON p.id = d.project_id
                WHERE p.workspace_id = $1 AND d.date >= $2 AND d.date < $3
                GROUP BY d.date
            ) daily
            "#,
            meter.daily_table
        ))
        .bind(workspace_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to average daily {product} counts"))?;
        Ok(average)
    }
}

#[derive(Debug, Deserialize)]
struct DailyCountsResponse {
    #[serde(default)]
    days: Vec<DailyCountEntry>,
}

#[derive(Debug, Deserialize)]
struct DailyCountEntry {
    date: DateTime<Utc>,
    count: i64,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct AverageResponse {
    average: f64,
}

/// key: billing-meter-http -> columnar usage service for logs, traces and metrics
pub struct HttpMeterSource {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpMeterSource {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build meter client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_token,
        })
    }

    fn endpoint(&self, workspace_id: i32, product: ProductType, path: &str) -> String {
        format!(
            "{}/workspaces/{workspace_id}/usage/{}/{}",
            self.base_url.trim_end_matches('/'),
            product.as_str().to_lowercase(),
            path.trim_start_matches('/')
        )
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        url: String,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<T> {
        let mut request = self
            .client
            .get(url)
            .query(&[("from", from.to_rfc3339()), ("to", to.to_rfc3339())]);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .context("failed to reach meter service")?
            .error_for_status()
            .context("meter service rejected request")?
            .json()
            .await
            .context("failed to decode meter response")
    }
}

#[async_trait]
impl MeterSource for HttpMeterSource {
    async fn daily_counts(
        &self,
        workspace_id: i32,
        product: ProductType,
        window: BillingWindow,
    ) -> Result<Vec<DailyCount>> {
        let response: DailyCountsResponse = self
            .get(
                self.endpoint(workspace_id, product, "daily"),
                window.start,
                window.end,
            )
            .await?;
        Ok(response
            .days
            .into_iter()
            .map(|day| DailyCount {
                date: day.date,
                count: day.count,
            })
            .collect())
    }

    async fn live_count(
        &self,
        workspace_id: i32,
        product: ProductType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let response: CountResponse = self
            .get(self.endpoint(workspace_id, product, "count"), from, to)
            .await?;
        Ok(response.count)
    }

    async fn daily_average(
        &self,
        workspace_id: i32,
        product: ProductType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<f64> {
        let response: AverageResponse = self
            .get(self.endpoint(workspace_id, product, "average"), from, to)
            .await?;
        Ok(response.average)
    }
}
