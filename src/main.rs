use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use usage_billing::billing::{
    self, BillingHealthMonitor, BillingWorker, HttpLedger, HttpMarketplaceMetering,
    HttpMeterSource, LedgerReconciler, LogNotificationSender, MarketplaceMetering,
    MarketplaceReporter, NotificationSender, OverageCalculator, PgMeterSource, PgWorkspaceStore,
    PricingTable, ProductType, RedisWarningStore, UnconfiguredMarketplaceMetering,
    UsageAggregator, WebhookNotificationSender, WorkspaceStore,
};
use usage_billing::config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let ledger_api_key = config::LEDGER_API_KEY
        .clone()
        .context("LEDGER_API_KEY must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("failed to connect to postgres")?;
    sqlx::migrate!()
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let store: Arc<dyn WorkspaceStore> = Arc::new(PgWorkspaceStore::new(pool.clone()));
    let ledger = Arc::new(HttpLedger::new(config::LEDGER_API_BASE.as_str(), ledger_api_key)?);
    let warnings = Arc::new(RedisWarningStore::connect(config::REDIS_URL.as_str()).await?);
    let notifier: Arc<dyn NotificationSender> = match config::NOTIFICATION_WEBHOOK_URL.as_deref() {
        Some(url) => Arc::new(WebhookNotificationSender::new(url)?),
        None => {
            tracing::warn!("NOTIFICATION_WEBHOOK_URL not set, notifications are only logged");
            Arc::new(LogNotificationSender)
        }
    };

    let mut usage = UsageAggregator::new(
        Duration::from_secs(*config::METER_CACHE_FRESH_SECS),
        Duration::from_secs(*config::METER_CACHE_EXPIRY_SECS),
    )
    .route(
        &[ProductType::Sessions, ProductType::Errors],
        Arc::new(PgMeterSource::new(pool.clone())),
    );
    match config::METER_API_BASE.as_deref() {
        Some(base) => {
            usage = usage.route(
                &[ProductType::Logs, ProductType::Traces, ProductType::Metrics],
                Arc::new(HttpMeterSource::new(base, config::METER_API_TOKEN.clone())?),
            );
        }
        None => tracing::warn!(
            "METER_API_BASE not set, logs, traces and metrics overage cannot be metered"
        ),
    }

    let metering: Arc<dyn MarketplaceMetering> =
        match config::MARKETPLACE_METERING_ENDPOINT.as_deref() {
            Some(endpoint) => Arc::new(HttpMarketplaceMetering::new(
                endpoint,
                config::MARKETPLACE_METERING_TOKEN.clone(),
            )?),
            None => Arc::new(UnconfiguredMarketplaceMetering),
        };

    let worker = BillingWorker::new(
        store.clone(),
        OverageCalculator::new(
            Arc::new(PricingTable::standard()),
            Arc::new(usage),
            store.clone(),
            notifier.clone(),
        ),
        BillingHealthMonitor::new(
            ledger.clone(),
            warnings,
            notifier.clone(),
            chrono::Duration::days(*config::BILLING_WARNING_PERIOD_DAYS),
        ),
        LedgerReconciler::new(
            ledger,
            store,
            notifier.clone(),
            config::LEGACY_PRICE_IDS.clone(),
        ),
        MarketplaceReporter::new(metering, config::MARKETPLACE_PRODUCT_CODE.as_str()),
        notifier,
    )
    .with_concurrency(*config::BILLING_RECONCILE_CONCURRENCY);
    let worker = Arc::new(worker);

    if *config::BILLING_RECONCILE_RUN_ONCE {
        let summary = billing::run_billing_reconciliation_tick(&worker, Utc::now()).await?;
        tracing::info!(?summary, "billing reconciliation finished");
        return Ok(());
    }

    let interval = Duration::from_secs(*config::BILLING_RECONCILE_INTERVAL_SECS);
    tracing::info!(?interval, "starting billing reconciliation scheduler");
    let handle = billing::spawn_billing_scheduler(worker, interval);
    tokio::select! {
        result = handle => result.context("billing scheduler stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            tracing::info!("shutting down billing reconciliation");
        }
    }
    Ok(())
}
