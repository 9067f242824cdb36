mod support;

use std::collections::BTreeMap;
use std::sync::Arc;

use httpmock::prelude::*;
use serde_json::json;
use usage_billing::billing::marketplace::{
    HttpMarketplaceMetering, MarketplaceMetering, MarketplaceReport, MarketplaceReporter,
    MarketplaceUsage, UsageRecord, MAX_BATCH_SIZE,
};
use usage_billing::billing::models::{MarketplaceCustomer, ProductType};

use support::{now, RecordingMetering};

fn usage(workspace_id: i32, overages: &[(ProductType, i64)]) -> MarketplaceUsage {
    MarketplaceUsage {
        workspace_id,
        customer: MarketplaceCustomer {
            customer_identifier: format!("mkt-{workspace_id}"),
            product_code: Some("prod-code".into()),
        },
        overages: overages.iter().copied().collect::<BTreeMap<_, _>>(),
    }
}

fn five_products(workspace_id: i32) -> MarketplaceUsage {
    usage(
        workspace_id,
        &[
            (ProductType::Sessions, 10),
            (ProductType::Errors, 20),
            (ProductType::Logs, 30),
            (ProductType::Traces, 0),
            (ProductType::Metrics, 5),
        ],
    )
}

// key: billing-marketplace-tests -> batching,best-effort
#[tokio::test]
async fn records_are_submitted_in_batches_of_twenty_five() {
    let metering = Arc::new(RecordingMetering::default());
    let reporter = MarketplaceReporter::new(metering.clone(), "prod-code");
    let usages: Vec<_> = (1..=6).map(five_products).collect();

    let report = reporter.report(&usages, now()).await;
    assert_eq!(
        report,
        MarketplaceReport {
            batches_submitted: 2,
            batches_failed: 0,
            records_submitted: 30,
            records_skipped: 0,
        }
    );
    let batches = metering.batches.lock().unwrap();
    assert_eq!(batches[0].1.len(), MAX_BATCH_SIZE);
    assert_eq!(batches[1].1.len(), 5);
    assert!(batches.iter().all(|(code, _)| code == "prod-code"));
    assert!(batches[0].1.iter().all(|record| record.timestamp == now()));
}

#[tokio::test]
async fn failed_batch_does_not_block_later_batches() {
    let metering = Arc::new(RecordingMetering::default());
    metering.failing_calls.lock().unwrap().insert(0);
    let reporter = MarketplaceReporter::new(metering.clone(), "prod-code");
    let usages: Vec<_> = (1..=11).map(five_products).collect();

    let report = reporter.report(&usages, now()).await;
    assert_eq!(report.batches_failed, 1);
    assert_eq!(report.batches_submitted, 2);
    assert_eq!(report.records_submitted, 30);
    let batches = metering.batches.lock().unwrap();
    assert_eq!(batches[0].1[0].customer_identifier, "mkt-6");
}

#[tokio::test]
async fn overflowing_quantities_are_skipped() {
    let metering = Arc::new(RecordingMetering::default());
    let reporter = MarketplaceReporter::new(metering.clone(), "prod-code");
    let usages = vec![usage(
        1,
        &[
            (ProductType::Sessions, i64::from(i32::MAX)),
            (ProductType::Errors, i64::from(i32::MAX) + 1),
        ],
    )];

    let report = reporter.report(&usages, now()).await;
    assert_eq!(report.records_skipped, 1);
    assert_eq!(report.records_submitted, 1);
    let batches = metering.batches.lock().unwrap();
    assert_eq!(batches[0].1[0].quantity, i32::MAX);
    assert_eq!(batches[0].1[0].dimension, "sessions");
}

#[tokio::test]
async fn customer_product_code_takes_precedence_over_reporter_default() {
    let metering = Arc::new(RecordingMetering::default());
    let reporter = MarketplaceReporter::new(metering.clone(), "fallback-code");
    let mut unlinked = usage(2, &[(ProductType::Errors, 7)]);
    unlinked.customer.product_code = None;
    let usages = vec![usage(1, &[(ProductType::Sessions, 3)]), unlinked];

    let report = reporter.report(&usages, now()).await;
    assert_eq!(report.batches_submitted, 2);
    let batches = metering.batches.lock().unwrap();
    let sent: Vec<(&str, &str)> = batches
        .iter()
        .map(|(code, records)| (code.as_str(), records[0].customer_identifier.as_str()))
        .collect();
    assert_eq!(sent, vec![("fallback-code", "mkt-2"), ("prod-code", "mkt-1")]);
}

#[tokio::test]
async fn batches_never_mix_product_codes() {
    let metering = Arc::new(RecordingMetering::default());
    let reporter = MarketplaceReporter::new(metering.clone(), "prod-code");
    let mut usages: Vec<_> = (1..=4).map(five_products).collect();
    for usage in usages.iter_mut().skip(2) {
        usage.customer.product_code = Some("other-listing".into());
    }

    let report = reporter.report(&usages, now()).await;
    assert_eq!(report.records_submitted, 20);
    let batches = metering.batches.lock().unwrap();
    let sizes: Vec<(&str, usize)> = batches
        .iter()
        .map(|(code, records)| (code.as_str(), records.len()))
        .collect();
    assert_eq!(sizes, vec![("other-listing", 10), ("prod-code", 10)]);
}

#[tokio::test]
async fn empty_input_submits_nothing() {
    let metering = Arc::new(RecordingMetering::default());
    let reporter = MarketplaceReporter::new(metering.clone(), "prod-code");
    let report = reporter.report(&[], now()).await;
    assert_eq!(report, MarketplaceReport::default());
    assert!(metering.batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn http_metering_posts_pascal_case_batch() {
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/meter")
            .header("authorization", "Bearer marketplace-token")
            .json_body_partial(r#"{"ProductCode":"prod-code"}"#);
        then.status(200)
            .json_body(json!({ "Results": [], "UnprocessedRecords": [] }));
    });

    let client = HttpMarketplaceMetering::new(
        server.url("/meter"),
        Some("marketplace-token".into()),
    )
    .unwrap();
    let records = vec![UsageRecord {
        customer_identifier: "mkt-1".into(),
        dimension: "errors".into(),
        quantity: 12,
        timestamp: now(),
    }];
    client.batch_meter_usage("prod-code", &records).await.unwrap();
    mock.assert();
}

#[tokio::test]
async fn http_metering_surfaces_rejections() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/meter");
        then.status(400).body("invalid dimension");
    });

    let client = HttpMarketplaceMetering::new(server.url("/meter"), None).unwrap();
    let err = client.batch_meter_usage("prod-code", &[]).await.unwrap_err();
    assert!(format!("{err:#}").contains("rejected"));
}
