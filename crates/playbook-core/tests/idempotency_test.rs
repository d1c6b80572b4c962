// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotent run starts, including the concurrent double-submit race.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;

use playbook_core::engine::INSTANCE_TRANSACTION_TYPE;
use playbook_core::idempotency::{CachedResponse, IdempotencyService};
use playbook_core::store::{Store, TransactionFilter};

async fn count_instances(t: &TestContext) -> i64 {
    t.store
        .count_transactions(
            t.org,
            &TransactionFilter {
                transaction_type: Some(INSTANCE_TRANSACTION_TYPE.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_idempotent_start_replays_without_second_instance() {
    let t = TestContext::new().await;
    let definition_id = t.publish(two_step_definition()).await;
    let ctx = t.operator();
    let store: Arc<dyn Store> = t.store.clone();
    let idempotency = IdempotencyService::new(store, 24);

    let body = json!({"definition_id": definition_id, "variables": {"customer_name": "Acme"}});

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let engine = t.engine.clone();
        let ctx = ctx.clone();
        let org = t.org;
        let variables = json!({"customer_name": "Acme"}).as_object().cloned().unwrap();
        let outcome = idempotency
            .process(t.org, Some("submit-1"), "start_run", &body, || async move {
                let run = engine.start(org, definition_id, variables, &ctx).await?;
                Ok(CachedResponse {
                    status_code: 201,
                    body: json!({"run_id": run.id}),
                })
            })
            .await
            .unwrap();
        outcomes.push(outcome);
    }

    assert!(!outcomes[0].cached);
    assert!(outcomes[1].cached);
    assert_eq!(outcomes[0].response, outcomes[1].response);
    assert_eq!(count_instances(&t).await, 1);
}

#[tokio::test]
async fn test_concurrent_double_submit_creates_one_instance() {
    let t = TestContext::new().await;
    let definition_id = t.publish(two_step_definition()).await;
    let ctx = t.operator();

    let body = json!({"definition_id": definition_id, "variables": {"customer_name": "Acme"}});

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = t.engine.clone();
        let store: Arc<dyn Store> = t.store.clone();
        let ctx = ctx.clone();
        let body = body.clone();
        let org = t.org;
        handles.push(tokio::spawn(async move {
            let idempotency = IdempotencyService::new(store, 24);
            let variables = json!({"customer_name": "Acme"}).as_object().cloned().unwrap();
            idempotency
                .process(org, Some("submit-race"), "start_run", &body, || async move {
                    let run = engine.start(org, definition_id, variables, &ctx).await?;
                    Ok(CachedResponse {
                        status_code: 201,
                        body: json!({"run_id": run.id}),
                    })
                })
                .await
        }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) if e.error_code() == "CONFLICT" => conflicts += 1,
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }

    // The winner executes; the loser either replays the persisted
    // response or observes the in-progress reservation as a conflict.
    // Either way the handler ran exactly once.
    assert!(successes >= 1, "at least the winner succeeds");
    assert_eq!(successes + conflicts, 2);
    assert_eq!(count_instances(&t).await, 1);
}

#[tokio::test]
async fn test_key_reuse_with_different_variables_conflicts() {
    let t = TestContext::new().await;
    let definition_id = t.publish(two_step_definition()).await;
    let ctx = t.operator();
    let store: Arc<dyn Store> = t.store.clone();
    let idempotency = IdempotencyService::new(store, 24);

    for (customer, expect_conflict) in [("Acme", false), ("Globex", true)] {
        let body = json!({"definition_id": definition_id, "variables": {"customer_name": customer}});
        let engine = t.engine.clone();
        let ctx = ctx.clone();
        let org = t.org;
        let variables = json!({"customer_name": customer}).as_object().cloned().unwrap();
        let result = idempotency
            .process(t.org, Some("submit-2"), "start_run", &body, || async move {
                let run = engine.start(org, definition_id, variables, &ctx).await?;
                Ok(CachedResponse {
                    status_code: 201,
                    body: json!({"run_id": run.id}),
                })
            })
            .await;

        if expect_conflict {
            let err = result.unwrap_err();
            assert_eq!(err.error_code(), "CONFLICT");
        } else {
            assert!(result.is_ok());
        }
    }

    assert_eq!(count_instances(&t).await, 1);
}
