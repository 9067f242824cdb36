//! Graduated pricing schedules and the arithmetic over them.
//!
//! The table is built once at startup and shared behind an `Arc`; nothing mutates it afterwards.

use std::collections::HashMap;

use thiserror::Error;

use super::models::{PlanType, ProductType, RetentionPeriod};

/// One bucket of a graduated schedule. `capacity == 0` means unbounded and is only valid last.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraduatedPriceItem {
    /// Dollars per unit.
    pub rate: f64,
    pub capacity: i64,
}

impl GraduatedPriceItem {
    pub const fn new(rate: f64, capacity: i64) -> Self {
        Self { rate, capacity }
    }

    pub const fn unbounded(rate: f64) -> Self {
        Self { rate, capacity: 0 }
    }

    fn is_unbounded(&self) -> bool {
        self.capacity == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductPricing {
    pub included: i64,
    pub items: Vec<GraduatedPriceItem>,
}

#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("schedule for {plan}/{product} is invalid: {reason}")]
    InvalidSchedule {
        plan: PlanType,
        product: ProductType,
        reason: &'static str,
    },
    #[error("no schedule configured for {plan}/{product}")]
    MissingSchedule { plan: PlanType, product: ProductType },
}

impl ProductPricing {
    pub fn new(included: i64, items: Vec<GraduatedPriceItem>) -> Self {
        Self { included, items }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.included < 0 {
            return Err("included amount is negative");
        }
        let Some((last, rest)) = self.items.split_last() else {
            return Err("schedule has no tiers");
        };
        if rest.iter().any(GraduatedPriceItem::is_unbounded) {
            return Err("unbounded tier must be last");
        }
        if last.capacity < 0 || rest.iter().any(|item| item.capacity < 0) {
            return Err("tier capacity is negative");
        }
        if self
            .items
            .iter()
            .any(|item| !item.rate.is_finite() || item.rate < 0.0)
        {
            return Err("tier rate is not a finite non-negative number");
        }
        Ok(())
    }

    /// Blended per-unit price in cents across the tiers consumed by `meter`.
    ///
    /// At or below the included amount this is the first tier's nominal rate.
    pub fn base_price_cents(&self, meter: i64) -> f64 {
        let remainder = meter - self.included;
        if remainder <= 0 {
            return self.items.first().map(|item| item.rate).unwrap_or(0.0) * 100.;
        }
        self.overage_cost(remainder, 1.0) / remainder as f64 * 100.
    }

    /// Total cost in cents of `usage`, charging only what exceeds the included amount.
    pub fn overage_cost_cents(&self, usage: i64, retention_multiplier: f64) -> f64 {
        let remainder = usage - self.included;
        if remainder <= 0 {
            return 0.;
        }
        self.overage_cost(remainder, retention_multiplier) * 100.
    }

    fn overage_cost(&self, mut remainder: i64, retention_multiplier: f64) -> f64 {
        let mut price = 0.;
        for item in &self.items {
            if remainder <= 0 {
                break;
            }
            let consumed = if item.is_unbounded() {
                remainder
            } else {
                remainder.min(item.capacity)
            };
            price += consumed as f64 * item.rate * retention_multiplier;
            remainder -= consumed;
        }
        price
    }

    /// Largest usage (included amount plus affordable overage) whose cost fits `budget_cents`.
    ///
    /// Units are bought at `rate × retention_multiplier` but the budget is drawn down at the
    /// nominal tier rate.
    pub fn quota_for_budget(&self, budget_cents: i64, retention_multiplier: f64) -> i64 {
        let budget = budget_cents as f64 / 100.;
        let mut spent = 0.;
        let mut quota = self.included;
        for item in &self.items {
            let unit_price = item.rate * retention_multiplier;
            let mut affordable = if unit_price > 0. {
                ((budget - spent) / unit_price) as i64
            } else {
                i64::MAX
            };
            affordable = affordable.max(0);
            if !item.is_unbounded() {
                affordable = affordable.min(item.capacity);
            }
            spent += affordable as f64 * item.rate;
            quota = quota.saturating_add(affordable);
            if item.is_unbounded() || affordable < item.capacity {
                break;
            }
        }
        quota
    }
}

/// Rate multiplier applied when turning a cost cap into a unit quota.
pub fn retention_multiplier(period: RetentionPeriod) -> f64 {
    match period {
        RetentionPeriod::SevenDays | RetentionPeriod::ThirtyDays | RetentionPeriod::ThreeMonths => {
            1.
        }
        RetentionPeriod::SixMonths => 1.5,
        RetentionPeriod::TwelveMonths => 2.,
        RetentionPeriod::TwoYears => 2.5,
        RetentionPeriod::ThreeYears => 3.,
    }
}

/// Seat cap for a plan; `None` means members are unlimited.
pub fn member_limit(plan: PlanType, unlimited_members: bool) -> Option<i64> {
    if unlimited_members {
        return None;
    }
    match plan {
        PlanType::Startup => Some(8),
        PlanType::Enterprise => Some(15),
        _ => Some(2),
    }
}

/// key: billing-pricing-table -> (plan, product) schedules
#[derive(Debug, Clone)]
pub struct PricingTable {
    schedules: HashMap<(PlanType, ProductType), ProductPricing>,
}

impl PricingTable {
    pub fn builder() -> PricingTableBuilder {
        PricingTableBuilder::default()
    }

    pub fn schedule(&self, plan: PlanType, product: ProductType) -> Option<&ProductPricing> {
        self.schedules.get(&(plan, product))
    }

    pub fn included(&self, plan: PlanType, product: ProductType) -> i64 {
        self.schedule(plan, product)
            .map(|pricing| pricing.included)
            .unwrap_or(0)
    }

    pub fn base_price_cents(&self, plan: PlanType, product: ProductType, meter: i64) -> Option<f64> {
        self.schedule(plan, product)
            .map(|pricing| pricing.base_price_cents(meter))
    }

    pub fn overage_cost_cents(
        &self,
        plan: PlanType,
        product: ProductType,
        usage: i64,
        retention_multiplier: f64,
    ) -> Option<f64> {
        self.schedule(plan, product)
            .map(|pricing| pricing.overage_cost_cents(usage, retention_multiplier))
    }

    /// Inverse pricing. Free plans always get their included amount regardless of budget.
    pub fn quota_for_budget(
        &self,
        plan: PlanType,
        product: ProductType,
        budget_cents: i64,
        retention_multiplier: f64,
    ) -> i64 {
        let Some(pricing) = self.schedule(plan, product) else {
            return 0;
        };
        if plan == PlanType::Free {
            return pricing.included;
        }
        pricing.quota_for_budget(budget_cents, retention_multiplier)
    }

    /// Ingestion quota derived from an optional cost cap.
    pub fn limit_amount(
        &self,
        max_cost_cents: Option<i64>,
        product: ProductType,
        plan: PlanType,
        retention: RetentionPeriod,
    ) -> Option<i64> {
        if plan == PlanType::Free {
            return Some(self.included(plan, product));
        }
        let budget = max_cost_cents?;
        Some(self.quota_for_budget(plan, product, budget, retention_multiplier(retention)))
    }

    /// The published price book.
    pub fn standard() -> Self {
        let mut schedules = HashMap::new();
        let graduated = [
            (
                ProductType::Sessions,
                ProductPricing::new(
                    500,
                    vec![
                        GraduatedPriceItem::new(20. / 1_000., 15_000),
                        GraduatedPriceItem::new(15. / 1_000., 50_000),
                        GraduatedPriceItem::new(12. / 1_000., 150_000),
                        GraduatedPriceItem::new(6.5 / 1_000., 500_000),
                        GraduatedPriceItem::new(3.5 / 1_000., 1_000_000),
                        GraduatedPriceItem::unbounded(2.5 / 1_000.),
                    ],
                ),
            ),
            (
                ProductType::Errors,
                ProductPricing::new(
                    1_000,
                    vec![
                        GraduatedPriceItem::new(2. / 1_000., 50_000),
                        GraduatedPriceItem::new(0.5 / 1_000., 100_000),
                        GraduatedPriceItem::new(0.25 / 1_000., 200_000),
                        GraduatedPriceItem::new(0.2 / 1_000., 500_000),
                        GraduatedPriceItem::new(0.1 / 1_000., 5_000_000),
                        GraduatedPriceItem::unbounded(0.05 / 1_000.),
                    ],
                ),
            ),
            (ProductType::Logs, per_million_schedule(1_000_000)),
            (ProductType::Traces, per_million_schedule(25_000_000)),
            (
                ProductType::Metrics,
                ProductPricing::new(
                    1_000,
                    vec![
                        GraduatedPriceItem::new(2.5 / 1_000., 1_000),
                        GraduatedPriceItem::new(2. / 1_000., 10_000),
                        GraduatedPriceItem::new(1.5 / 1_000., 100_000),
                        GraduatedPriceItem::new(1. / 1_000., 1_000_000),
                        GraduatedPriceItem::unbounded(0.5 / 1_000.),
                    ],
                ),
            ),
        ];
        for (product, pricing) in graduated {
            schedules.insert((PlanType::Graduated, product), pricing);
        }

        // (plan, [sessions, errors, logs, traces, metrics] included, [rates])
        let flat: [(PlanType, [i64; 5], [f64; 5]); 6] = [
            (
                PlanType::UsageBased,
                [500, 1_000, 1_000_000, 1_000_000, 1_000],
                [20. / 1_000., 2. / 1_000., 1.5 / 1_000_000., 1.5 / 1_000_000., 1.5 / 1_000.],
            ),
            (
                PlanType::Lite,
                [2_000, 4_000, 4_000_000, 4_000_000, 2_000],
                FIXED_TIER_RATES,
            ),
            (
                PlanType::Basic,
                [10_000, 20_000, 20_000_000, 20_000_000, 3_000],
                FIXED_TIER_RATES,
            ),
            (
                PlanType::Startup,
                [80_000, 160_000, 160_000_000, 160_000_000, 6_000],
                FIXED_TIER_RATES,
            ),
            (
                PlanType::Enterprise,
                [300_000, 600_000, 600_000_000, 600_000_000, 24_000],
                FIXED_TIER_RATES,
            ),
            (
                PlanType::Free,
                [500, 1_000, 1_000_000, 25_000_000, 1_000],
                FIXED_TIER_RATES,
            ),
        ];
        for (plan, included, rates) in flat {
            for (index, product) in ProductType::METERED.into_iter().enumerate() {
                schedules.insert(
                    (plan, product),
                    ProductPricing::new(
                        included[index],
                        vec![GraduatedPriceItem::unbounded(rates[index])],
                    ),
                );
            }
        }

        Self { schedules }
    }
}

const FIXED_TIER_RATES: [f64; 5] = [
    5. / 1_000.,
    0.2 / 1_000.,
    1.5 / 1_000_000.,
    1.5 / 1_000_000.,
    1.5 / 1_000.,
];

fn per_million_schedule(included: i64) -> ProductPricing {
    ProductPricing::new(
        included,
        vec![
            GraduatedPriceItem::new(2.5 / 1_000_000., 1_000_000),
            GraduatedPriceItem::new(2. / 1_000_000., 10_000_000),
            GraduatedPriceItem::new(1.5 / 1_000_000., 100_000_000),
            GraduatedPriceItem::new(1. / 1_000_000., 1_000_000_000),
            GraduatedPriceItem::unbounded(0.5 / 1_000_000.),
        ],
    )
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Builds alternate tables, starting empty or from the standard price book.
#[derive(Debug, Default)]
pub struct PricingTableBuilder {
    schedules: HashMap<(PlanType, ProductType), ProductPricing>,
}

impl PricingTableBuilder {
    pub fn with_standard(mut self) -> Self {
        self.schedules = PricingTable::standard().schedules;
        self
    }

    pub fn schedule(mut self, plan: PlanType, product: ProductType, pricing: ProductPricing) -> Self {
        self.schedules.insert((plan, product), pricing);
        self
    }

    /// Validates every schedule and requires one per (plan, metered product).
    pub fn build(self) -> Result<PricingTable, PricingError> {
        for ((plan, product), pricing) in &self.schedules {
            pricing
                .validate()
                .map_err(|reason| PricingError::InvalidSchedule {
                    plan: *plan,
                    product: *product,
                    reason,
                })?;
        }
        for plan in PlanType::ALL {
            for product in ProductType::METERED {
                if !self.schedules.contains_key(&(plan, product)) {
                    return Err(PricingError::MissingSchedule { plan, product });
                }
            }
        }
        Ok(PricingTable {
            schedules: self.schedules,
        })
    }
}
