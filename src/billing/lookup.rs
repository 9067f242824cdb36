use std::collections::BTreeMap;

use super::ledger::Price;
use super::models::{PlanType, ProductType, RetentionPeriod, SubscriptionInterval};

pub const PRODUCT_TYPE_METADATA: &str = "highlightProductType";
pub const PRODUCT_TIER_METADATA: &str = "highlightProductTier";
pub const UNLIMITED_MEMBERS_METADATA: &str = "highlightProductUnlimitedMembers";
pub const RETENTION_METADATA: &str = "highlightRetentionPeriod";

/// Flat-rate tiers sold before prices carried metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyPriceIds {
    pub basic: Option<String>,
    pub startup: Option<String>,
    pub enterprise: Option<String>,
}

impl LegacyPriceIds {
    pub fn plan_for(&self, price_id: &str) -> Option<PlanType> {
        [
            (&self.basic, PlanType::Basic),
            (&self.startup, PlanType::Startup),
            (&self.enterprise, PlanType::Enterprise),
        ]
        .into_iter()
        .find(|(id, _)| id.as_deref() == Some(price_id))
        .map(|(_, plan)| plan)
    }
}

/// key: billing-lookup-keys -> base price key
///
/// Composition is frozen: every provisioned ledger price is addressed by these strings.
pub fn base_lookup_key(
    tier: PlanType,
    interval: SubscriptionInterval,
    unlimited_members: bool,
    retention: RetentionPeriod,
) -> String {
    match tier {
        PlanType::UsageBased | PlanType::Graduated => {
            format!("{}|{}", ProductType::Base, tier)
        }
        _ => {
            let mut key = format!("{}|{}|{}", ProductType::Base, tier, interval);
            if unlimited_members {
                key.push_str("|UNLIMITED_MEMBERS");
            }
            if retention != RetentionPeriod::ThreeMonths {
                key.push('|');
                key.push_str(retention.as_str());
            }
            key
        }
    }
}

/// key: billing-lookup-keys -> overage price key
pub fn overage_lookup_key(
    product: ProductType,
    retention: RetentionPeriod,
    plan: PlanType,
) -> String {
    let mut key = product.as_str().to_string();
    if retention != RetentionPeriod::ThreeMonths {
        key.push('|');
        key.push_str(retention.as_str());
    }
    if plan == PlanType::Graduated {
        key.push_str("|Graduated");
    } else if plan == PlanType::UsageBased && product == ProductType::Sessions {
        key.push_str("|UsageBased");
    }
    key
}

/// Every price the reconciler needs, keyed by product.
///
/// Logs, traces and metrics are only sold at the three month retention price.
pub fn price_lookup_keys(
    tier: PlanType,
    interval: SubscriptionInterval,
    unlimited_members: bool,
    sessions_retention: RetentionPeriod,
    errors_retention: RetentionPeriod,
) -> BTreeMap<ProductType, String> {
    BTreeMap::from([
        (
            ProductType::Base,
            base_lookup_key(tier, interval, unlimited_members, sessions_retention),
        ),
        (ProductType::Members, ProductType::Members.as_str().to_string()),
        (
            ProductType::Sessions,
            overage_lookup_key(ProductType::Sessions, sessions_retention, tier),
        ),
        (
            ProductType::Errors,
            overage_lookup_key(ProductType::Errors, errors_retention, tier),
        ),
        (
            ProductType::Logs,
            overage_lookup_key(ProductType::Logs, RetentionPeriod::ThreeMonths, tier),
        ),
        (
            ProductType::Traces,
            overage_lookup_key(ProductType::Traces, RetentionPeriod::ThreeMonths, tier),
        ),
        (
            ProductType::Metrics,
            overage_lookup_key(ProductType::Metrics, RetentionPeriod::ThreeMonths, tier),
        ),
    ])
}

/// What a ledger price says about the product it bills.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductMetadata {
    pub product: Option<ProductType>,
    pub tier: Option<PlanType>,
    pub unlimited_members: bool,
    pub interval: SubscriptionInterval,
    pub retention: RetentionPeriod,
}

pub fn product_metadata(price: &Price, legacy: &LegacyPriceIds) -> ProductMetadata {
    let interval = match price.recurring.as_ref() {
        Some(recurring) if recurring.interval == "year" => SubscriptionInterval::Annual,
        _ => SubscriptionInterval::Monthly,
    };

    if let Some(tier) = legacy.plan_for(&price.id) {
        return ProductMetadata {
            product: Some(ProductType::Base),
            tier: Some(tier),
            unlimited_members: false,
            interval,
            retention: RetentionPeriod::SixMonths,
        };
    }

    ProductMetadata {
        product: price
            .product
            .metadata(PRODUCT_TYPE_METADATA)
            .and_then(|value| value.parse().ok()),
        tier: price
            .product
            .metadata(PRODUCT_TIER_METADATA)
            .and_then(|value| value.parse().ok()),
        unlimited_members: price.product.metadata(UNLIMITED_MEMBERS_METADATA) == Some("true"),
        interval,
        retention: price
            .metadata
            .get(RETENTION_METADATA)
            .and_then(|value| value.parse().ok())
            .unwrap_or(RetentionPeriod::SixMonths),
    }
}
