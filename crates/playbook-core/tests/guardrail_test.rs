// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Guardrail fail-closed behavior.

mod common;

use common::*;
use serde_json::json;

use playbook_core::engine::{RunStatus, StepStatus};
use playbook_core::store::{EntityFilter, Store};

fn guarded_definition() -> serde_json::Value {
    json!({
        "name": "guarded-shipment",
        "version": 1,
        "variables": [{"name": "order_ref", "type": "string", "required": true}],
        "steps": [
            {
                "id": "prepare",
                "name": "Prepare shipment",
                "type": "action",
                "actions": [
                    {
                        "action": "create_entity",
                        "entity_type": "shipment",
                        "name": "Shipment",
                        "smart_code": "PLAYBOOK.LOGISTICS.SHIPMENT.V1",
                    }
                ],
            },
            {
                "id": "ship",
                "name": "Ship goods",
                "type": "action",
                "guardrails": [
                    {"kind": "payment_required", "subject": "${order_ref}"}
                ],
                "actions": [
                    {
                        "action": "create_entity",
                        "entity_type": "dispatch_note",
                        "name": "Dispatched",
                        "smart_code": "PLAYBOOK.LOGISTICS.DISPATCH.V1",
                    }
                ],
            },
        ],
    })
}

#[tokio::test]
async fn test_payment_required_blocks_without_payment() {
    let t = TestContext::new().await;
    let order = t.seed_entity("order", "unpaid order").await;
    let definition_id = t.publish(guarded_definition()).await;
    let ctx = t.operator();

    let run = t
        .start(definition_id, json!({"order_ref": order.to_string()}), &ctx)
        .await;

    // Guardrails fail closed: the instance fails, never skips silently
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("Payment required"));

    let rows = t.step_rows(run.id).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].step_id, "prepare");
    assert_eq!(rows[0].status, StepStatus::Completed);
    assert_eq!(rows[1].step_id, "ship");
    assert_eq!(rows[1].status, StepStatus::Failed);

    // The guarded step's actions never executed
    let notes = t
        .store
        .query_entities(
            t.org,
            &EntityFilter {
                entity_type: Some("dispatch_note".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(notes.is_empty());
}

#[tokio::test]
async fn test_payment_required_passes_with_settled_payment() {
    let t = TestContext::new().await;
    let order = t.seed_entity("order", "paid order").await;
    t.seed_payment(order, "settled").await;
    let definition_id = t.publish(guarded_definition()).await;
    let ctx = t.operator();

    let run = t
        .start(definition_id, json!({"order_ref": order.to_string()}), &ctx)
        .await;
    assert_eq!(run.status, RunStatus::Completed);

    let rows = t.step_rows(run.id).await;
    assert!(rows.iter().all(|r| r.status == StepStatus::Completed));
}

#[tokio::test]
async fn test_payment_required_rejects_pending_payment() {
    let t = TestContext::new().await;
    let order = t.seed_entity("order", "pending payment").await;
    t.seed_payment(order, "pending").await;
    let definition_id = t.publish(guarded_definition()).await;
    let ctx = t.operator();

    let run = t
        .start(definition_id, json!({"order_ref": order.to_string()}), &ctx)
        .await;
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_status_is_guardrail() {
    let t = TestContext::new().await;
    t.seed_status_entity("Approved", "PLAYBOOK.STATUS.APPROVED.V1")
        .await;
    t.seed_status_entity("Draft", "PLAYBOOK.STATUS.DRAFT.V1")
        .await;
    let order = t.seed_entity("order", "draft order").await;
    t.engine
        .status_manager()
        .set_status(t.org, order, "PLAYBOOK.STATUS.DRAFT.V1")
        .await
        .unwrap();

    let definition_id = t
        .publish(json!({
            "name": "requires-approval",
            "version": 1,
            "variables": [{"name": "order_ref", "type": "string", "required": true}],
            "steps": [
                {
                    "id": "finalize",
                    "name": "Finalize",
                    "type": "action",
                    "guardrails": [
                        {
                            "kind": "status_is",
                            "subject": "${order_ref}",
                            "status_smart_code": "PLAYBOOK.STATUS.APPROVED.V1",
                        }
                    ],
                    "actions": [],
                },
            ],
        }))
        .await;
    let ctx = t.operator();

    // Draft order: blocked
    let run = t
        .start(definition_id, json!({"order_ref": order.to_string()}), &ctx)
        .await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("expected status"));

    // Approve, then a fresh run passes
    t.engine
        .status_manager()
        .set_status(t.org, order, "PLAYBOOK.STATUS.APPROVED.V1")
        .await
        .unwrap();
    let run = t
        .start(definition_id, json!({"order_ref": order.to_string()}), &ctx)
        .await;
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_variable_present_guardrail() {
    let t = TestContext::new().await;
    let definition_id = t
        .publish(json!({
            "name": "needs-reference",
            "version": 1,
            "variables": [{"name": "external_ref", "type": "string"}],
            "steps": [
                {
                    "id": "record",
                    "name": "Record",
                    "type": "action",
                    "guardrails": [{"kind": "variable_present", "name": "external_ref"}],
                    "actions": [],
                },
            ],
        }))
        .await;
    let ctx = t.operator();

    let run = t.start(definition_id, json!({}), &ctx).await;
    assert_eq!(run.status, RunStatus::Failed);

    let run = t
        .start(definition_id, json!({"external_ref": "PO-1234"}), &ctx)
        .await;
    assert_eq!(run.status, RunStatus::Completed);
}
