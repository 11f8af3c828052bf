mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;

use common::{Behavior, channel, chat_request, harness, token, user};
use mrelay_adapter::{AdapterError, AdapterResponse, StreamHandle, UsageAccumulator};
use mrelay_common::{ChannelKind, ChannelStatus};
use mrelay_core::{RelayErrorKind, RelayOutcome};
use mrelay_protocol::Usage;
use mrelay_protocol::sse::data_frame;
use mrelay_storage::{LogKind, Store};

const MODEL: &str = "relay-test";

fn ok_json(usage: Usage) -> AdapterResponse {
    AdapterResponse::Json {
        status: http::StatusCode::OK,
        body: Bytes::from_static(b"{\"choices\":[]}"),
        usage: Some(usage),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn chat_happy_path_settles_exact_usage() {
    let calls = Arc::new(AtomicU32::new(0));
    let behavior: Behavior = {
        let calls = calls.clone();
        Arc::new(move |_ctx, _req| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ok_json(Usage::new(1, 1)))
        })
    };
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![channel(11, ChannelKind::OpenAI, MODEL, 0, 1)],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    let outcome = h
        .pipeline
        .relay(&caller, chat_request(MODEL, false))
        .await
        .unwrap();
    assert!(matches!(outcome, RelayOutcome::Json { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "upstream called once");

    // usage {1, 1} at model_ratio 0.5: round(1x0.5 + 1x0.5) = 1
    let user = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(user.used_quota, 1);
    assert_eq!(user.quota, 1_000_000 - 1);
    assert_eq!(user.request_count, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let logs = h.store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].kind, LogKind::Consume);
    assert_eq!(logs[0].prompt_tokens, 1);
    assert_eq!(logs[0].completion_tokens, 1);
    assert_eq!(logs[0].quota, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_walks_to_lower_priority_band() {
    let tried_channels = Arc::new(Mutex::new(Vec::new()));
    let behavior: Behavior = {
        let tried = tried_channels.clone();
        Arc::new(move |ctx, _req| {
            tried.lock().unwrap().push(ctx.channel_id);
            if ctx.channel_id == 1 {
                Err(AdapterError::upstream(503, "overloaded"))
            } else {
                Ok(ok_json(Usage::new(1, 1)))
            }
        })
    };
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![
            channel(1, ChannelKind::OpenAI, MODEL, 10, 1),
            channel(2, ChannelKind::OpenAI, MODEL, 0, 1),
        ],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    h.pipeline
        .relay(&caller, chat_request(MODEL, false))
        .await
        .unwrap();

    assert_eq!(*tried_channels.lock().unwrap(), vec![1, 2]);
    // 503 is retriable but not a disable code.
    let ch = h.store.channel(1).await.unwrap().unwrap();
    assert_eq!(ch.status, ChannelStatus::Enabled);
}

#[tokio::test(flavor = "multi_thread")]
async fn revoked_key_auto_disables_channel() {
    let behavior: Behavior = Arc::new(move |ctx, _req| {
        if ctx.channel_id == 1 {
            Err(AdapterError::upstream(
                401,
                r#"{"error":{"message":"API key revoked"}}"#,
            ))
        } else {
            Ok(ok_json(Usage::new(1, 1)))
        }
    });
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![
            channel(1, ChannelKind::OpenAI, MODEL, 10, 1),
            channel(2, ChannelKind::OpenAI, MODEL, 0, 1),
        ],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    let outcome = h
        .pipeline
        .relay(&caller, chat_request(MODEL, false))
        .await
        .unwrap();
    assert!(matches!(outcome, RelayOutcome::Json { .. }));

    // The disable write is best-effort and async.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let ch = h.store.channel(1).await.unwrap().unwrap();
    assert_eq!(ch.status, ChannelStatus::AutoDisabled);

    // The cache eviction is immediate: channel 1 is gone from selection.
    let tried = std::collections::HashSet::new();
    for _ in 0..10 {
        assert_eq!(h.cache.select("default", MODEL, 0, &tried).unwrap().id, 2);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn quota_exceeded_blocks_before_upstream() {
    let calls = Arc::new(AtomicU32::new(0));
    let behavior: Behavior = {
        let calls = calls.clone();
        Arc::new(move |_ctx, _req| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ok_json(Usage::new(1, 1)))
        })
    };
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![token(7, 1, "sk-alpha", 10, false)],
        vec![channel(1, ChannelKind::OpenAI, MODEL, 0, 1)],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    let err = h
        .pipeline
        .relay(&caller, chat_request(MODEL, false))
        .await
        .unwrap_err();
    assert_eq!(err.kind, RelayErrorKind::QuotaExceeded);
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no upstream call");

    let user = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(user.used_quota, 0);
    assert_eq!(user.quota, 1_000_000, "nothing was deducted");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.store.logs().iter().all(|log| log.kind != LogKind::Consume));
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_upstream_error_refunds_in_full() {
    let behavior: Behavior =
        Arc::new(move |_ctx, _req| Err(AdapterError::upstream(400, "bad request shape")));
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![channel(1, ChannelKind::OpenAI, MODEL, 0, 1)],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    let err = h
        .pipeline
        .relay(&caller, chat_request(MODEL, false))
        .await
        .unwrap_err();
    assert_eq!(err.kind, RelayErrorKind::UpstreamFatal);

    let user = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(user.quota, 1_000_000, "net quota delta is exactly zero");
    assert_eq!(user.used_quota, 0);
    assert_eq!(user.request_count, 0, "refunded request is not counted");
}

#[tokio::test(flavor = "multi_thread")]
async fn no_channel_for_model_is_503_and_refunds() {
    let behavior: Behavior = Arc::new(move |_ctx, _req| Ok(ok_json(Usage::new(1, 1))));
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![channel(1, ChannelKind::OpenAI, "other-model", 0, 1)],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    let err = h
        .pipeline
        .relay(&caller, chat_request(MODEL, false))
        .await
        .unwrap_err();
    assert_eq!(err.kind, RelayErrorKind::NoAvailableChannel);
    assert_eq!(err.status_code(), http::StatusCode::SERVICE_UNAVAILABLE);

    let user = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(user.quota, 1_000_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn token_model_allowlist_is_enforced() {
    let behavior: Behavior = Arc::new(move |_ctx, _req| Ok(ok_json(Usage::new(1, 1))));
    let mut restricted = token(7, 1, "sk-alpha", 0, true);
    restricted.allowed_models = Some(vec!["only-this-model".to_string()]);
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![restricted],
        vec![channel(1, ChannelKind::OpenAI, MODEL, 0, 1)],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    let err = h
        .pipeline
        .relay(&caller, chat_request(MODEL, false))
        .await
        .unwrap_err();
    assert_eq!(err.kind, RelayErrorKind::Forbidden);
}

#[tokio::test(flavor = "multi_thread")]
async fn specific_channel_id_pins_routing() {
    let picked = Arc::new(Mutex::new(Vec::new()));
    let behavior: Behavior = {
        let picked = picked.clone();
        Arc::new(move |ctx, _req| {
            picked.lock().unwrap().push(ctx.channel_id);
            Ok(ok_json(Usage::new(1, 1)))
        })
    };
    let mut pinned = token(7, 1, "sk-alpha", 0, true);
    pinned.specific_channel_id = Some(2);
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![pinned],
        vec![
            channel(1, ChannelKind::OpenAI, MODEL, 10, 100),
            channel(2, ChannelKind::OpenAI, MODEL, 0, 1),
        ],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    for _ in 0..5 {
        h.pipeline
            .relay(&caller, chat_request(MODEL, false))
            .await
            .unwrap();
    }
    assert!(picked.lock().unwrap().iter().all(|id| *id == 2));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_stream_settles_observed_usage() {
    // Unbounded upstream: one token of content per frame, forever.
    let behavior: Behavior = Arc::new(move |ctx, _req| {
        let usage = Arc::new(UsageAccumulator::with_prompt(ctx.prompt_tokens));
        let counting = usage.clone();
        let frames = futures_util::stream::unfold(0u32, move |n| {
            let counting = counting.clone();
            async move {
                counting.add_estimated_completion(1);
                let frame = data_frame(format!("{{\"n\":{n}}}").as_bytes());
                Some((Ok::<Bytes, std::io::Error>(frame), n + 1))
            }
        });
        Ok(AdapterResponse::Stream {
            status: http::StatusCode::OK,
            handle: StreamHandle {
                frames: Box::pin(frames),
                usage,
            },
        })
    });
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![channel(1, ChannelKind::OpenAI, MODEL, 0, 1)],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    let outcome = h
        .pipeline
        .relay(&caller, chat_request(MODEL, true))
        .await
        .unwrap();
    let RelayOutcome::Stream { mut frames, .. } = outcome else {
        panic!("expected a stream");
    };

    // Client reads three events, then disconnects.
    for _ in 0..3 {
        frames.next().await.unwrap().unwrap();
    }
    drop(frames);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let user = h.store.user(1).await.unwrap().unwrap();
    // prompt estimate 8 + 3 observed completion tokens at ratio 0.5:
    // round(8 x 0.5 + 3 x 0.5) = 6
    assert_eq!(user.used_quota, 6);
    assert_eq!(user.quota, 1_000_000 - 6);

    let logs = h.store.logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].is_stream);
    assert_eq!(logs[0].completion_tokens, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_exhaustion_surfaces_last_transient_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let behavior: Behavior = {
        let calls = calls.clone();
        Arc::new(move |_ctx, _req| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::upstream(500, "boom"))
        })
    };
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![
            channel(1, ChannelKind::OpenAI, MODEL, 0, 1),
            channel(2, ChannelKind::OpenAI, MODEL, 0, 1),
        ],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    let err = h
        .pipeline
        .relay(&caller, chat_request(MODEL, false))
        .await
        .unwrap_err();
    assert_eq!(err.kind, RelayErrorKind::UpstreamTransient);
    // Both channels tried once each; the tried-set blocks reselection.
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let user = h.store.user(1).await.unwrap().unwrap();
    assert_eq!(user.quota, 1_000_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_token_is_rejected() {
    let behavior: Behavior = Arc::new(move |_ctx, _req| Ok(ok_json(Usage::new(1, 1))));
    let mut expired = token(7, 1, "sk-alpha", 0, true);
    expired.expired_at = 1; // 1970
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![expired],
        vec![channel(1, ChannelKind::OpenAI, MODEL, 0, 1)],
        behavior,
    )
    .await;

    let err = h.pipeline.authenticate("sk-alpha").await.unwrap_err();
    assert_eq!(err.kind, RelayErrorKind::Unauthorized);
}

#[tokio::test(flavor = "multi_thread")]
async fn model_mapping_reaches_the_adapter() {
    let seen = Arc::new(Mutex::new(String::new()));
    let behavior: Behavior = {
        let seen = seen.clone();
        Arc::new(move |ctx, _req| {
            *seen.lock().unwrap() = ctx.upstream_model.clone();
            Ok(ok_json(Usage::new(1, 1)))
        })
    };
    let mut mapped = channel(1, ChannelKind::OpenAI, MODEL, 0, 1);
    mapped
        .model_mapping
        .insert(MODEL.to_string(), "native-name".to_string());
    let h = harness(
        vec![user(1, 1_000_000)],
        vec![token(7, 1, "sk-alpha", 0, true)],
        vec![mapped],
        behavior,
    )
    .await;

    let caller = h.pipeline.authenticate("sk-alpha").await.unwrap();
    h.pipeline
        .relay(&caller, chat_request(MODEL, false))
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), "native-name");
}
