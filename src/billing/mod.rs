pub mod cache;
pub mod health;
pub mod ledger;
pub mod lookup;
pub mod marketplace;
pub mod meters;
pub mod models;
pub mod notifications;
pub mod overage;
pub mod pricing;
pub mod reconciliation;
pub mod scheduler;
pub mod store;
pub mod stripe_ledger;
pub mod usage;
pub mod worker;

pub use health::{BillingHealthMonitor, HealthTransition, PaymentIssue, RedisWarningStore, WarningStore};
pub use ledger::{Ledger, LedgerError};
pub use lookup::LegacyPriceIds;
pub use marketplace::{
    HttpMarketplaceMetering, MarketplaceMetering, MarketplaceReport, MarketplaceReporter,
    UnconfiguredMarketplaceMetering,
};
pub use meters::{HttpMeterSource, PgMeterSource};
pub use models::{PlanType, ProductType, RetentionPeriod, UsageSummary, Workspace, WorkspaceOverages};
pub use notifications::{
    LogNotificationSender, NotificationSender, NotificationType, WebhookNotificationSender,
};
pub use overage::OverageCalculator;
pub use pricing::PricingTable;
pub use reconciliation::{LedgerChanges, LedgerReconciler, ReconcileContext};
pub use scheduler::{process_tick as run_billing_reconciliation_tick, spawn as spawn_billing_scheduler};
pub use store::{PgWorkspaceStore, WorkspaceStore};
pub use stripe_ledger::HttpLedger;
pub use usage::{BillingWindow, MeterSource, UsageAggregator};
pub use worker::{BillingWorker, RunSummary, WorkspaceOutcome};
