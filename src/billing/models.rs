use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// key: billing-models -> plan tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlanType {
    Free,
    Lite,
    Basic,
    Startup,
    Enterprise,
    UsageBased,
    Graduated,
}

impl PlanType {
    pub const ALL: [PlanType; 7] = [
        PlanType::Free,
        PlanType::Lite,
        PlanType::Basic,
        PlanType::Startup,
        PlanType::Enterprise,
        PlanType::UsageBased,
        PlanType::Graduated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Free => "Free",
            PlanType::Lite => "Lite",
            PlanType::Basic => "Basic",
            PlanType::Startup => "Startup",
            PlanType::Enterprise => "Enterprise",
            PlanType::UsageBased => "UsageBased",
            PlanType::Graduated => "Graduated",
        }
    }
}

/// key: billing-models -> metered products
///
/// Declaration order is the order products are reconciled against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    Base,
    Members,
    Sessions,
    Errors,
    Logs,
    Traces,
    Metrics,
}

impl ProductType {
    /// Products carrying overage, in ledger reconciliation order.
    pub const OVERAGE_ORDER: [ProductType; 6] = [
        ProductType::Members,
        ProductType::Sessions,
        ProductType::Errors,
        ProductType::Logs,
        ProductType::Traces,
        ProductType::Metrics,
    ];

    /// Products billed from usage meters (members are counted, not metered).
    pub const METERED: [ProductType; 5] = [
        ProductType::Sessions,
        ProductType::Errors,
        ProductType::Logs,
        ProductType::Traces,
        ProductType::Metrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Base => "BASE",
            ProductType::Members => "MEMBERS",
            ProductType::Sessions => "SESSIONS",
            ProductType::Errors => "ERRORS",
            ProductType::Logs => "LOGS",
            ProductType::Traces => "TRACES",
            ProductType::Metrics => "METRICS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RetentionPeriod {
    SevenDays,
    ThirtyDays,
    ThreeMonths,
    SixMonths,
    TwelveMonths,
    TwoYears,
    ThreeYears,
}

impl RetentionPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionPeriod::SevenDays => "SevenDays",
            RetentionPeriod::ThirtyDays => "ThirtyDays",
            RetentionPeriod::ThreeMonths => "ThreeMonths",
            RetentionPeriod::SixMonths => "SixMonths",
            RetentionPeriod::TwelveMonths => "TwelveMonths",
            RetentionPeriod::TwoYears => "TwoYears",
            RetentionPeriod::ThreeYears => "ThreeYears",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionInterval {
    Monthly,
    Annual,
}

impl SubscriptionInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionInterval::Monthly => "MONTHLY",
            SubscriptionInterval::Annual => "ANNUAL",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($ty:ty, $kind:literal, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|candidate: &$ty| candidate.as_str() == value)
                    .ok_or_else(|| ParseEnumError {
                        kind: $kind,
                        value: value.to_string(),
                    })
            }
        }
    };
}

string_enum!(
    PlanType,
    "plan type",
    [
        PlanType::Free,
        PlanType::Lite,
        PlanType::Basic,
        PlanType::Startup,
        PlanType::Enterprise,
        PlanType::UsageBased,
        PlanType::Graduated,
    ]
);
string_enum!(
    ProductType,
    "product type",
    [
        ProductType::Base,
        ProductType::Members,
        ProductType::Sessions,
        ProductType::Errors,
        ProductType::Logs,
        ProductType::Traces,
        ProductType::Metrics,
    ]
);
string_enum!(
    RetentionPeriod,
    "retention period",
    [
        RetentionPeriod::SevenDays,
        RetentionPeriod::ThirtyDays,
        RetentionPeriod::ThreeMonths,
        RetentionPeriod::SixMonths,
        RetentionPeriod::TwelveMonths,
        RetentionPeriod::TwoYears,
        RetentionPeriod::ThreeYears,
    ]
);
string_enum!(
    SubscriptionInterval,
    "subscription interval",
    [SubscriptionInterval::Monthly, SubscriptionInterval::Annual]
);

/// key: billing-workspace-settings -> per-product overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductSettings {
    /// Explicit monthly unit limit replacing the plan's included amount.
    pub monthly_limit: Option<i64>,
    /// Cost cap in cents used to derive the ingestion quota.
    pub max_cost_cents: Option<i64>,
    pub retention_period: Option<RetentionPeriod>,
    /// Custom ledger price that takes precedence over lookup-key resolution.
    pub overage_price_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceCustomer {
    pub customer_identifier: String,
    pub product_code: Option<String>,
}

/// key: billing-workspace-model -> read-mostly tenant snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i32,
    pub name: String,
    pub plan_tier: PlanType,
    pub unlimited_members: bool,
    pub allow_meter_overage: bool,
    pub billing_period_start: Option<DateTime<Utc>>,
    pub billing_period_end: Option<DateTime<Utc>>,
    pub next_invoice_date: Option<DateTime<Utc>>,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub stripe_customer_id: Option<String>,
    pub monthly_members_limit: Option<i64>,
    pub can_show_billing_issue_banner: bool,
    pub marketplace_customer: Option<MarketplaceCustomer>,
    #[serde(default)]
    pub products: BTreeMap<ProductType, ProductSettings>,
}

impl Workspace {
    pub fn new(id: i32, plan_tier: PlanType) -> Self {
        Self {
            id,
            name: format!("workspace-{id}"),
            plan_tier,
            unlimited_members: false,
            allow_meter_overage: false,
            billing_period_start: None,
            billing_period_end: None,
            next_invoice_date: None,
            trial_end_date: None,
            stripe_customer_id: None,
            monthly_members_limit: None,
            can_show_billing_issue_banner: true,
            marketplace_customer: None,
            products: BTreeMap::new(),
        }
    }

    pub fn settings(&self, product: ProductType) -> ProductSettings {
        self.products.get(&product).cloned().unwrap_or_default()
    }

    pub fn settings_mut(&mut self, product: ProductType) -> &mut ProductSettings {
        self.products.entry(product).or_default()
    }

    /// Retention applied to a product, falling back to the product's default window.
    pub fn retention(&self, product: ProductType) -> RetentionPeriod {
        self.products
            .get(&product)
            .and_then(|settings| settings.retention_period)
            .unwrap_or(match product {
                ProductType::Logs | ProductType::Traces | ProductType::Metrics => {
                    RetentionPeriod::ThirtyDays
                }
                _ => RetentionPeriod::ThreeMonths,
            })
    }

    pub fn is_free(&self) -> bool {
        self.plan_tier == PlanType::Free
    }
}

/// Overage quantity per product, computed fresh for every reconciliation pass.
pub type WorkspaceOverages = BTreeMap<ProductType, i64>;

/// key: billing-usage-summary -> one product's pass result
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProductUsage {
    pub meter: i64,
    pub limit: Option<i64>,
    pub overage: i64,
    pub ingest_quota: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub workspace_id: i32,
    pub products: BTreeMap<ProductType, ProductUsage>,
}

impl UsageSummary {
    pub fn overages(&self) -> WorkspaceOverages {
        self.products
            .iter()
            .map(|(product, usage)| (*product, usage.overage))
            .collect()
    }
}
