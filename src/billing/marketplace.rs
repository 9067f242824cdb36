use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::BillingError;

use super::models::{MarketplaceCustomer, WorkspaceOverages};

/// Hard limit of the metering service per call.
pub const MAX_BATCH_SIZE: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UsageRecord {
    pub customer_identifier: String,
    pub dimension: String,
    pub quantity: i32,
    pub timestamp: DateTime<Utc>,
}

/// key: billing-marketplace-metering -> batch usage submission
#[async_trait]
pub trait MarketplaceMetering: Send + Sync {
    async fn batch_meter_usage(&self, product_code: &str, records: &[UsageRecord]) -> Result<()>;
}

/// Overages of one marketplace-linked workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketplaceUsage {
    pub workspace_id: i32,
    pub customer: MarketplaceCustomer,
    pub overages: WorkspaceOverages,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketplaceReport {
    pub batches_submitted: usize,
    pub batches_failed: usize,
    pub records_submitted: usize,
    pub records_skipped: usize,
}

/// One record per (workspace, product), grouped by the product code the customer subscribed
/// through. Customers without a code fall back to `default_product_code`. Quantities outside
/// the i32 range are skipped.
pub fn usage_records(
    usages: &[MarketplaceUsage],
    default_product_code: &str,
    now: DateTime<Utc>,
) -> (BTreeMap<String, Vec<UsageRecord>>, usize) {
    let mut records: BTreeMap<String, Vec<UsageRecord>> = BTreeMap::new();
    let mut skipped = 0;
    for usage in usages {
        let product_code = usage
            .customer
            .product_code
            .as_deref()
            .filter(|code| !code.is_empty())
            .unwrap_or(default_product_code);
        for (product, overage) in &usage.overages {
            let Ok(quantity) = i32::try_from(*overage) else {
                let err = BillingError::Overflow {
                    product: *product,
                    quantity: *overage,
                };
                error!(
                    %err,
                    workspace_id = usage.workspace_id,
                    "BILLING_ERROR skipping marketplace usage record"
                );
                skipped += 1;
                continue;
            };
            records
                .entry(product_code.to_string())
                .or_default()
                .push(UsageRecord {
                    customer_identifier: usage.customer.customer_identifier.clone(),
                    dimension: product.as_str().to_lowercase(),
                    quantity,
                    timestamp: now,
                });
        }
    }
    (records, skipped)
}

/// key: billing-marketplace-reporter -> best effort per batch
pub struct MarketplaceReporter {
    client: Arc<dyn MarketplaceMetering>,
    product_code: String,
}

impl MarketplaceReporter {
    pub fn new(client: Arc<dyn MarketplaceMetering>, product_code: impl Into<String>) -> Self {
        Self {
            client,
            product_code: product_code.into(),
        }
    }

    pub async fn report(&self, usages: &[MarketplaceUsage], now: DateTime<Utc>) -> MarketplaceReport {
        let (records, records_skipped) = usage_records(usages, &self.product_code, now);
        let mut report = MarketplaceReport {
            records_skipped,
            ..Default::default()
        };

        for (product_code, records) in &records {
            for chunk in records.chunks(MAX_BATCH_SIZE) {
                match self.client.batch_meter_usage(product_code, chunk).await {
                    Ok(()) => {
                        report.batches_submitted += 1;
                        report.records_submitted += chunk.len();
                        info!(
                            %product_code,
                            records = chunk.len(),
                            "reported marketplace usage batch"
                        );
                    }
                    Err(err) => {
                        report.batches_failed += 1;
                        error!(
                            ?err,
                            %product_code,
                            records = chunk.len(),
                            "BILLING_ERROR failed to report marketplace usage batch"
                        );
                    }
                }
            }
        }
        report
    }
}

/// Stands in when no metering endpoint is configured; every batch fails and is logged.
pub struct UnconfiguredMarketplaceMetering;

#[async_trait]
impl MarketplaceMetering for UnconfiguredMarketplaceMetering {
    async fn batch_meter_usage(&self, _product_code: &str, records: &[UsageRecord]) -> Result<()> {
        anyhow::bail!(
            "marketplace metering endpoint not configured, dropping {} records",
            records.len()
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct BatchMeterUsageRequest<'a> {
    product_code: &'a str,
    usage_records: &'a [UsageRecord],
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BatchMeterUsageResponse {
    #[serde(default)]
    unprocessed_records: Vec<Value>,
}

/// key: billing-marketplace-http -> JSON batch endpoint
pub struct HttpMarketplaceMetering {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpMarketplaceMetering {
    pub fn new(endpoint: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build marketplace metering client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            auth_token,
        })
    }
}

#[async_trait]
impl MarketplaceMetering for HttpMarketplaceMetering {
    async fn batch_meter_usage(&self, product_code: &str, records: &[UsageRecord]) -> Result<()> {
        let mut request = self.client.post(&self.endpoint).json(&BatchMeterUsageRequest {
            product_code,
            usage_records: records,
        });
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response: BatchMeterUsageResponse = request
            .send()
            .await
            .context("failed to reach marketplace metering")?
            .error_for_status()
            .context("marketplace metering rejected batch")?
            .json()
            .await
            .context("failed to decode marketplace metering response")?;
        if !response.unprocessed_records.is_empty() {
            warn!(
                unprocessed = response.unprocessed_records.len(),
                "marketplace metering left records unprocessed"
            );
        }
        Ok(())
    }
}
