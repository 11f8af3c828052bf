mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;

use common::{Behavior, channel, harness, token, user};
use mrelay_adapter::{AdapterRegistry, AdapterResponse, RelayRequest};
use mrelay_common::ChannelKind;
use mrelay_core::ledger::Ledger;
use mrelay_core::{PriceTable, TaskPoller};
use mrelay_storage::{LogKind, Store, TaskStatus};

fn json_response(body: &str) -> AdapterResponse {
    AdapterResponse::Json {
        status: http::StatusCode::OK,
        body: Bytes::from(body.to_string()),
        usage: None,
    }
}

fn mj_submit_request() -> RelayRequest {
    RelayRequest::MjSubmit {
        action: "imagine".to_string(),
        body: serde_json::from_value(serde_json::json!({"prompt": "a red fox"})).unwrap(),
    }
}

/// Behavior shared by submit (pipeline) and fetch (poller): accept the
/// submission, then answer fetches with the configured status.
fn mj_behavior(fetch_status: &'static str, fetch_calls: Arc<AtomicU32>) -> Behavior {
    Arc::new(move |_ctx, req| match req {
        RelayRequest::MjSubmit { .. } => Ok(json_response(
            r#"{"code":1,"description":"ok","result":"mj-174"}"#,
        )),
        RelayRequest::MjFetch { task_id } => {
            fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(json_response(&format!(
                r#"{{"id":"{task_id}","action":"IMAGINE","status":"{fetch_status}","progress":"100%","failReason":"content blocked"}}"#,
            )))
        }
        _ => panic!("unexpected request"),
    })
}

fn poller_for(h: &common::Harness, behavior: Behavior) -> TaskPoller {
    let mut registry = AdapterRegistry::builtin();
    for kind in [ChannelKind::Midjourney, ChannelKind::Suno] {
        let behavior = behavior.clone();
        registry.register(kind, move || {
            Box::new(common::MockAdapter::new(behavior.clone()))
        });
    }
    let store_dyn: Arc<dyn Store> = h.store.clone();
    let ledger = Arc::new(Ledger::new(store_dyn, None));
    TaskPoller::new(
        ledger,
        h.cache.clone(),
        registry,
        PriceTable::default(),
        Duration::from_secs(3600),
        Duration::from_secs(5),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_task_refunds_reservation_in_full() {
    let fetch_calls = Arc::new(AtomicU32::new(0));
    let behavior = mj_behavior("FAILURE", fetch_calls.clone());
    let h = harness(
        vec![user(1, 1_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![channel(5, ChannelKind::Midjourney, "midjourney", 0, 1)],
        behavior.clone(),
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    let body = h
        .pipeline
        .relay_task_submit(&caller, mj_submit_request())
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&body).contains("mj-174"));

    // mj_imagine carries a fixed price of 50.
    let u = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(u.quota, 950, "reservation held until the poller finalises");

    let poller = poller_for(&h, behavior);
    poller.tick().await.unwrap();

    let task = h.store.task("mj-174").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failure);
    assert!(task.quota_settled);
    assert_eq!(task.fail_reason.as_deref(), Some("content blocked"));

    let u = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(u.quota, 1_000, "failure refunds the full reservation");
    assert_eq!(u.used_quota, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let logs = h.store.logs();
    assert!(logs.iter().any(|log| log.kind == LogKind::TaskRefund));
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_task_keeps_the_charge() {
    let fetch_calls = Arc::new(AtomicU32::new(0));
    let behavior = mj_behavior("SUCCESS", fetch_calls.clone());
    let h = harness(
        vec![user(1, 1_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![channel(5, ChannelKind::Midjourney, "midjourney", 0, 1)],
        behavior.clone(),
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    h.pipeline
        .relay_task_submit(&caller, mj_submit_request())
        .await
        .unwrap();

    let poller = poller_for(&h, behavior);
    poller.tick().await.unwrap();

    let task = h.store.task("mj-174").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Success);

    let u = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(u.quota, 950);
    assert_eq!(u.used_quota, 50);
    assert_eq!(u.request_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn cheaper_terminal_action_refunds_surplus_on_success() {
    // Submitted as imagine (reserved 50); the upstream resolves the job to a
    // describe variant, priced 25.
    let behavior: Behavior = Arc::new(move |_ctx, req| match req {
        RelayRequest::MjSubmit { .. } => Ok(json_response(
            r#"{"code":1,"description":"ok","result":"mj-174"}"#,
        )),
        RelayRequest::MjFetch { task_id } => Ok(json_response(&format!(
            r#"{{"id":"{task_id}","action":"DESCRIBE","status":"SUCCESS","progress":"100%"}}"#,
        ))),
        _ => panic!("unexpected request"),
    });
    let h = harness(
        vec![user(1, 1_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![channel(5, ChannelKind::Midjourney, "midjourney", 0, 1)],
        behavior.clone(),
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    h.pipeline
        .relay_task_submit(&caller, mj_submit_request())
        .await
        .unwrap();
    let u = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(u.quota, 950);

    let poller = poller_for(&h, behavior);
    poller.tick().await.unwrap();

    let task = h.store.task("mj-174").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Success);

    let u = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(u.quota, 975, "the 25-unit surplus flowed back");
    assert_eq!(u.used_quota, 25, "only the cheaper action is spend");
    assert_eq!(u.request_count, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let logs = h.store.logs();
    let consume = logs
        .iter()
        .find(|log| log.kind == LogKind::Consume)
        .unwrap();
    assert_eq!(consume.quota, 25);
}

#[tokio::test(flavor = "multi_thread")]
async fn polling_a_terminal_task_is_idempotent() {
    let fetch_calls = Arc::new(AtomicU32::new(0));
    let behavior = mj_behavior("FAILURE", fetch_calls.clone());
    let h = harness(
        vec![user(1, 1_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![channel(5, ChannelKind::Midjourney, "midjourney", 0, 1)],
        behavior.clone(),
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    h.pipeline
        .relay_task_submit(&caller, mj_submit_request())
        .await
        .unwrap();

    let poller = poller_for(&h, behavior);
    for _ in 0..4 {
        poller.tick().await.unwrap();
    }

    let u = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(u.quota, 1_000, "repeated polls do not double-refund");
    // Terminal tasks drop out of the scan after the first finalisation.
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_submission_refunds_immediately() {
    let behavior: Behavior = Arc::new(move |_ctx, req| match req {
        RelayRequest::MjSubmit { .. } => Ok(json_response(
            r#"{"code":3,"description":"banned prompt"}"#,
        )),
        _ => panic!("unexpected request"),
    });
    let h = harness(
        vec![user(1, 1_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![channel(5, ChannelKind::Midjourney, "midjourney", 0, 1)],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    let body = h
        .pipeline
        .relay_task_submit(&caller, mj_submit_request())
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&body).contains("banned prompt"));

    let u = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(u.quota, 1_000, "refusal costs nothing");
    assert!(h.store.task("mj-174").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn task_fetch_is_scoped_to_the_owner() {
    let fetch_calls = Arc::new(AtomicU32::new(0));
    let behavior = mj_behavior("SUCCESS", fetch_calls);
    let h = harness(
        vec![user(1, 1_000), user(2, 1_000)],
        vec![
            token(7, 1, "sk-alpha", 0, true),
            token(8, 2, "sk-beta", 0, true),
        ],
        vec![channel(5, ChannelKind::Midjourney, "midjourney", 0, 1)],
        behavior,
    )
    .await;

    let owner = h.pipeline.authenticate("sk-alpha").await.unwrap();
    h.pipeline
        .relay_task_submit(&owner, mj_submit_request())
        .await
        .unwrap();

    assert!(h.pipeline.task_fetch(&owner, "mj-174").await.is_ok());
    let stranger = h.pipeline.authenticate("sk-beta").await.unwrap();
    let err = h.pipeline.task_fetch(&stranger, "mj-174").await.unwrap_err();
    assert_eq!(err.kind, mrelay_core::RelayErrorKind::Forbidden);
}
