//! Engine-level properties: single assignment, idempotent callbacks,
//! terminal monotonicity and the documented fallback paths.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use voucher_backend::config::VoucherConfig;
use voucher_backend::database::error::DbResult;
use voucher_backend::database::memory::MemoryStore;
use voucher_backend::database::payment_repository::{NewPayment, PaymentStatus};
use voucher_backend::database::repository::{CallbackLedger, PaymentStore, VoucherStore};
use voucher_backend::database::voucher_repository::{
    BulkInsertSummary, ConsumeOutcome, DenominationStock, VoucherCode, VoucherFilter,
};
use voucher_backend::payments::types::WebhookPayload;
use voucher_backend::services::notification::NotificationService;
use voucher_backend::services::reconciliation::{
    ReconciliationEngine, ReconciliationOutcome, ReconciliationRequest, Shortfall, StatusReport,
};

fn engine_with(
    store: &Arc<MemoryStore>,
    vouchers: Arc<dyn VoucherStore>,
    config: VoucherConfig,
) -> ReconciliationEngine {
    ReconciliationEngine::new(
        store.clone(),
        vouchers,
        store.clone(),
        Arc::new(NotificationService::log_only("UGX")),
        config,
    )
}

fn engine(store: &Arc<MemoryStore>) -> ReconciliationEngine {
    engine_with(store, store.clone(), VoucherConfig::default())
}

fn webhook(reference: &str, status: &str, uuid: &str) -> ReconciliationRequest {
    let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
        "event_type": format!("collection.{}", status),
        "transaction": {
            "uuid": uuid,
            "reference": reference,
            "status": status,
            "amount": { "formatted": "1,000.00", "raw": 1000, "currency": "UGX" },
            "phone_number": "+256712345678"
        },
        "collection": { "provider": "mtn" }
    }))
    .unwrap();
    ReconciliationRequest::from_webhook(&payload)
}

async fn seed_payment(store: &MemoryStore, reference: &str, denomination: i64) {
    store
        .insert(NewPayment {
            reference: reference.to_string(),
            subscriber: "256712345678".to_string(),
            denomination,
            provider: None,
        })
        .await
        .unwrap();
}

async fn vouchers_for(store: &MemoryStore, reference: &str) -> Vec<VoucherCode> {
    store
        .list(&VoucherFilter {
            consumed: Some(true),
            limit: 1_000,
            ..VoucherFilter::default()
        })
        .await
        .unwrap()
        .into_iter()
        .filter(|v| v.originating_reference.as_deref() == Some(reference))
        .collect()
}

#[tokio::test]
async fn completed_webhook_assigns_and_consumes_voucher() {
    let store = Arc::new(MemoryStore::new());
    store.add("V1000-AAAA", 1000).await.unwrap();
    seed_payment(&store, "R1", 1000).await;

    let outcome = engine(&store)
        .reconcile(webhook("R1", "completed", "U1"))
        .await
        .unwrap();

    let voucher = match outcome {
        ReconciliationOutcome::Completed {
            voucher: Some(voucher),
            shortfall: None,
            ..
        } => voucher,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(voucher.code, "V1000-AAAA");
    assert!(voucher.consumed);
    assert_eq!(voucher.assigned_to.as_deref(), Some("256712345678"));

    let record = store.find("R1").await.unwrap().unwrap();
    assert_eq!(record.status, PaymentStatus::Successful);
    assert_eq!(record.voucher_code.as_deref(), Some("V1000-AAAA"));
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn replayed_webhook_is_a_duplicate() {
    let store = Arc::new(MemoryStore::new());
    store.add("V1000-AAAA", 1000).await.unwrap();
    store.add("V1000-BBBB", 1000).await.unwrap();
    seed_payment(&store, "R1", 1000).await;
    let engine = engine(&store);

    engine
        .reconcile(webhook("R1", "completed", "U1"))
        .await
        .unwrap();
    let replay = engine.handle_callback(webhook("R1", "completed", "U1")).await;

    assert_eq!(replay, ReconciliationOutcome::Duplicate);
    assert_eq!(replay.acknowledgment()["success"], true);
    assert_eq!(vouchers_for(&store, "R1").await.len(), 1);
    assert!(store.find_available(1000).await.unwrap().is_some());
}

#[tokio::test]
async fn failed_webhook_is_permanent() {
    let store = Arc::new(MemoryStore::new());
    store.add("V1000-AAAA", 1000).await.unwrap();
    seed_payment(&store, "R1", 1000).await;
    let engine = engine(&store);

    let failed = engine
        .reconcile(webhook("R1", "failed", "U1"))
        .await
        .unwrap();
    assert!(matches!(failed, ReconciliationOutcome::Failed { .. }));

    // a later success report for the same reference changes nothing
    let late = engine
        .reconcile(webhook("R1", "completed", "U2"))
        .await
        .unwrap();
    assert!(matches!(late, ReconciliationOutcome::AlreadyTerminal { .. }));

    let record = store.find("R1").await.unwrap().unwrap();
    assert_eq!(record.status, PaymentStatus::Failed);
    assert!(record.voucher_code.is_none());
    assert!(vouchers_for(&store, "R1").await.is_empty());
}

#[tokio::test]
async fn successful_payment_is_never_downgraded() {
    let store = Arc::new(MemoryStore::new());
    store.add("V1000-AAAA", 1000).await.unwrap();
    seed_payment(&store, "R1", 1000).await;
    let engine = engine(&store);

    engine
        .reconcile(webhook("R1", "completed", "U1"))
        .await
        .unwrap();

    for request in [
        webhook("R1", "failed", "U2"),
        webhook("R1", "pending", "U3"),
        ReconciliationRequest::internal_failure("R1", "sweeper.expired"),
    ] {
        engine.handle_callback(request).await;
    }

    let record = store.find("R1").await.unwrap().unwrap();
    assert_eq!(record.status, PaymentStatus::Successful);
    assert_eq!(record.voucher_code.as_deref(), Some("V1000-AAAA"));
}

#[tokio::test]
async fn empty_inventory_completes_without_voucher() {
    let store = Arc::new(MemoryStore::new());
    store.add("V600-AAAA", 600).await.unwrap();
    seed_payment(&store, "R1", 1000).await;

    let outcome = engine(&store)
        .reconcile(webhook("R1", "completed", "U1"))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ReconciliationOutcome::Completed {
            voucher: None,
            shortfall: Some(Shortfall::InventoryExhausted),
            ..
        }
    ));
    let record = store.find("R1").await.unwrap().unwrap();
    assert_eq!(record.status, PaymentStatus::Successful);
    assert!(record.voucher_code.is_none());
    // the other denomination is untouched
    assert!(store.find_available(600).await.unwrap().is_some());
}

#[tokio::test]
async fn unknown_reference_is_synthesized_from_callback() {
    let store = Arc::new(MemoryStore::new());
    store.add("V1000-AAAA", 1000).await.unwrap();

    let outcome = engine(&store)
        .reconcile(webhook("LOST-1", "completed", "U1"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ReconciliationOutcome::Completed {
            voucher: Some(_),
            ..
        }
    ));

    let record = store.find("LOST-1").await.unwrap().unwrap();
    assert_eq!(record.subscriber, "256712345678");
    assert_eq!(record.denomination, 1000);
    assert_eq!(record.provider.as_deref(), Some("mtn"));
    assert_eq!(record.provider_transaction_id.as_deref(), Some("U1"));
    assert_eq!(record.status, PaymentStatus::Successful);
}

#[tokio::test]
async fn pending_callback_for_unknown_reference_keeps_gateway_id() {
    let store = Arc::new(MemoryStore::new());

    let outcome = engine(&store)
        .reconcile(webhook("LOST-3", "pending", "U-77"))
        .await
        .unwrap();
    assert!(matches!(outcome, ReconciliationOutcome::StillProcessing { .. }));

    let record = store.find("LOST-3").await.unwrap().unwrap();
    assert_eq!(record.status, PaymentStatus::Processing);
    assert_eq!(record.provider_transaction_id.as_deref(), Some("U-77"));
}

#[tokio::test]
async fn known_gateway_id_is_not_overwritten_by_callback() {
    let store = Arc::new(MemoryStore::new());
    seed_payment(&store, "R-KNOWN", 1000).await;
    store
        .set_provider_transaction_id("R-KNOWN", "T-ORIGINAL")
        .await
        .unwrap();

    engine(&store)
        .reconcile(webhook("R-KNOWN", "pending", "U-OTHER"))
        .await
        .unwrap();

    let record = store.find("R-KNOWN").await.unwrap().unwrap();
    assert_eq!(record.provider_transaction_id.as_deref(), Some("T-ORIGINAL"));
}

#[tokio::test]
async fn synthesis_without_phone_is_acknowledged_as_error() {
    let store = Arc::new(MemoryStore::new());
    store.add("V1000-AAAA", 1000).await.unwrap();
    let mut request = webhook("LOST-2", "completed", "U1");
    request.subscriber = None;

    let outcome = engine(&store).handle_callback(request).await;

    assert!(matches!(outcome, ReconciliationOutcome::Errored { .. }));
    assert_eq!(outcome.acknowledgment()["success"], false);
    assert!(store.find("LOST-2").await.unwrap().is_none());
    assert!(store.find_available(1000).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reports_assign_at_most_one_voucher() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..10 {
        store.add(&format!("V1000-{:04}", i), 1000).await.unwrap();
    }
    seed_payment(&store, "R1", 1000).await;
    let engine = Arc::new(engine(&store));

    // distinct uuids so none of them is deduplicated
    let tasks = (0..16).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .handle_callback(webhook("R1", "completed", &format!("U{}", i)))
                .await
        })
    });
    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, ReconciliationOutcome::Completed { .. }))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(vouchers_for(&store, "R1").await.len(), 1);
    assert_eq!(store.count_processed().await.unwrap(), 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_payload_replayed_concurrently_transitions_once() {
    let store = Arc::new(MemoryStore::new());
    store.add("V1000-AAAA", 1000).await.unwrap();
    store.add("V1000-BBBB", 1000).await.unwrap();
    seed_payment(&store, "R1", 1000).await;
    let engine = Arc::new(engine(&store));

    let tasks = (0..12).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.handle_callback(webhook("R1", "completed", "U1")).await })
    });
    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(outcomes.len(), 12);
    assert!(outcomes.iter().all(|o| o.acknowledgment()["success"] == true));
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == ReconciliationOutcome::Duplicate)
            .count(),
        11
    );
    assert_eq!(vouchers_for(&store, "R1").await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scarce_inventory_is_never_double_assigned() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..5 {
        store.add(&format!("V1500-{:04}", i), 1500).await.unwrap();
    }
    for i in 0..10 {
        seed_payment(&store, &format!("R{}", i), 1500).await;
    }
    let engine = Arc::new(engine(&store));

    let tasks = (0..10).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut request = webhook(&format!("R{}", i), "completed", &format!("U{}", i));
            request.amount = Some(1500);
            engine.handle_callback(request).await
        })
    });
    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let with_voucher: Vec<String> = outcomes
        .iter()
        .filter_map(|o| match o {
            ReconciliationOutcome::Completed {
                voucher: Some(v), ..
            } => Some(v.code.clone()),
            _ => None,
        })
        .collect();
    let exhausted = outcomes
        .iter()
        .filter(|o| {
            matches!(
                o,
                ReconciliationOutcome::Completed {
                    shortfall: Some(Shortfall::InventoryExhausted),
                    ..
                }
            )
        })
        .count();

    let mut unique = with_voucher.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(with_voucher.len(), 5);
    assert_eq!(unique.len(), 5);
    assert_eq!(exhausted, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consume_succeeds_once_across_callers() {
    let store = Arc::new(MemoryStore::new());
    store.add("V7000-AAAA", 7000).await.unwrap();

    let tasks = (0..16).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .consume("V7000-AAAA", "256712345678", &format!("R{}", i))
                .await
                .unwrap()
        })
    });
    let outcomes: Vec<ConsumeOutcome> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let consumed = outcomes
        .iter()
        .filter(|o| matches!(o, ConsumeOutcome::Consumed(_)))
        .count();
    assert_eq!(consumed, 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == ConsumeOutcome::AlreadyConsumed)
            .count(),
        15
    );
}

/// Inventory wrapper that lies about what it hands out
struct TamperedInventory {
    inner: Arc<MemoryStore>,
    mode: Tamper,
}

enum Tamper {
    WrongDenomination,
    AlwaysTaken,
}

#[async_trait]
impl VoucherStore for TamperedInventory {
    async fn find_available(&self, denomination: i64) -> DbResult<Option<VoucherCode>> {
        Ok(match self.mode {
            Tamper::WrongDenomination => self.inner.find_available(600).await?,
            Tamper::AlwaysTaken => Some(VoucherCode::available(
                "V1000-GONE",
                denomination,
                chrono::Utc::now(),
            )),
        })
    }

    async fn consume(
        &self,
        code: &str,
        subscriber: &str,
        reference: &str,
    ) -> DbResult<ConsumeOutcome> {
        self.inner.consume(code, subscriber, reference).await
    }

    async fn subscriber_holds_denomination(
        &self,
        subscriber: &str,
        denomination: i64,
        excluding_reference: &str,
    ) -> DbResult<bool> {
        self.inner
            .subscriber_holds_denomination(subscriber, denomination, excluding_reference)
            .await
    }

    async fn add(&self, code: &str, denomination: i64) -> DbResult<VoucherCode> {
        self.inner.add(code, denomination).await
    }

    async fn add_bulk(&self, codes: &[String], denomination: i64) -> DbResult<BulkInsertSummary> {
        self.inner.add_bulk(codes, denomination).await
    }

    async fn list(&self, filter: &VoucherFilter) -> DbResult<Vec<VoucherCode>> {
        self.inner.list(filter).await
    }

    async fn counts_by_denomination(&self) -> DbResult<Vec<DenominationStock>> {
        self.inner.counts_by_denomination().await
    }
}

#[tokio::test]
async fn mismatched_denomination_is_an_integrity_fault() {
    let store = Arc::new(MemoryStore::new());
    store.add("V600-AAAA", 600).await.unwrap();
    seed_payment(&store, "R1", 1000).await;

    let engine = engine_with(
        &store,
        Arc::new(TamperedInventory {
            inner: store.clone(),
            mode: Tamper::WrongDenomination,
        }),
        VoucherConfig::default(),
    );

    let outcome = engine.handle_callback(webhook("R1", "completed", "U1")).await;

    assert!(matches!(
        outcome,
        ReconciliationOutcome::Completed {
            voucher: None,
            shortfall: Some(Shortfall::IntegrityFault),
            ..
        }
    ));
    // the wrong voucher was not consumed
    assert!(store.find_available(600).await.unwrap().is_some());
    assert_eq!(
        store.find("R1").await.unwrap().unwrap().status,
        PaymentStatus::Successful
    );
}

#[tokio::test]
async fn endless_contention_gives_up_and_releases_claim() {
    let store = Arc::new(MemoryStore::new());
    seed_payment(&store, "R1", 1000).await;

    let engine = engine_with(
        &store,
        Arc::new(TamperedInventory {
            inner: store.clone(),
            mode: Tamper::AlwaysTaken,
        }),
        VoucherConfig {
            assignment_attempts: 3,
            ..VoucherConfig::default()
        },
    );

    let request = webhook("R1", "completed", "U1");
    let key = request.key().unwrap();
    let outcome = engine.handle_callback(request).await;

    assert!(matches!(outcome, ReconciliationOutcome::Errored { .. }));
    assert_eq!(
        store.find("R1").await.unwrap().unwrap().status,
        PaymentStatus::Processing
    );
    assert!(store
        .last_callback_error(&key)
        .await
        .is_some_and(|e| e.contains("3 attempts")));
}

#[tokio::test]
async fn airtel_codes_drive_transitions() {
    let store = Arc::new(MemoryStore::new());
    store.add("V1000-AAAA", 1000).await.unwrap();
    seed_payment(&store, "R1", 1000).await;

    let request = ReconciliationRequest {
        reference: Some("R1".to_string()),
        event_type: "collection.completed".to_string(),
        report: StatusReport::Provider {
            status: "TS".to_string(),
            network: Some("airtel".to_string()),
        },
        amount: Some(1000),
        subscriber: None,
        provider_transaction_uuid: Some("U1".to_string()),
    };

    let outcome = engine(&store).reconcile(request).await.unwrap();
    assert_eq!(
        outcome.payment().map(|p| p.status),
        Some(PaymentStatus::Successful)
    );
}
