//! Restart recovery: a second engine over the same store picks up where the first stopped

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

use common::*;
use stagehand::{
    Ambiance, ChildInstance, ExecutableResponse, ExecutionInputInstance, ExecutionInputStore,
    ExecutionMode, FailureType, InputState, MemoryStore, NodeExecution, NodeExecutionStore,
    NodeUpdate, Plan, Status,
};

/// Persist a node execution as if a previous process had left it in `status`
async fn seed(store: &MemoryStore, plan: &Plan, node_id: &str, id: &str, status: Status) -> NodeExecution {
    let plan_node = plan.node(node_id).unwrap();
    let mut exec = NodeExecution::queued(id, Ambiance::new(&plan.id, "pe-seed"), &plan.id, plan_node, None, None);
    exec.status = status;
    store.save(&exec).await.unwrap();
    exec
}

#[tokio::test]
async fn test_async_wait_survives_restart() {
    let plan = Plan::new("p", "wait").with_node(node("wait", "CALLBACK", ExecutionMode::Async));
    let store = Arc::new(MemoryStore::new());

    let (tasks, _rx) = task_channel();
    let first = engine_for(plan.clone(), store.clone(), tasks).await;
    let id = first
        .start_plan("p", Ambiance::new("p", "pe-restart"))
        .await
        .unwrap();
    wait_for_status(&first, &id, Status::AsyncWaiting).await;
    first.shutdown().await.unwrap();

    let (tasks, _rx) = task_channel();
    let second = engine_for(plan, store.clone(), tasks).await;
    assert!(!second.broker().is_waiting_on(&callback_id(&id)));
    let stats = second.recover().await.unwrap();
    assert_eq!(stats.waits_restored, 1);
    assert_eq!(stats.failed, 0);
    assert!(second.broker().is_waiting_on(&callback_id(&id)));

    // Sweeping again finds the wait already bound
    assert_eq!(second.recover().await.unwrap().waits_restored, 0);

    let payload = serde_json::to_vec(&json!({"status": "SUCCEEDED", "after": "restart"})).unwrap();
    second.notify_callback(&callback_id(&id), payload).unwrap();
    let exec = wait_for_concluded(&second, &id).await;
    assert_eq!(exec.status, Status::Succeeded);
    assert_eq!(exec.outcome.unwrap()["after"], json!("restart"));
}

#[tokio::test]
async fn test_finished_children_are_replayed() {
    let plan = Plan::new("p", "fork")
        .with_node(node("fork", "FORK", ExecutionMode::Children).with_children(["done", "pending"]))
        .with_node(node("done", "ECHO", ExecutionMode::Sync))
        .with_node(node("pending", "CALLBACK", ExecutionMode::Async));
    let store = Arc::new(MemoryStore::new());

    let (tasks, _rx) = task_channel();
    let first = engine_for(plan.clone(), store.clone(), tasks).await;
    let id = first
        .start_plan("p", Ambiance::new("p", "pe-replay"))
        .await
        .unwrap();
    let done = wait_for_child(&first, &id, "done").await;
    wait_for_concluded(&first, &done.id).await;
    let pending = wait_for_child(&first, &id, "pending").await;
    wait_for_status(&first, &pending.id, Status::AsyncWaiting).await;
    first.shutdown().await.unwrap();

    let (tasks, _rx) = task_channel();
    let second = engine_for(plan, store.clone(), tasks).await;
    let stats = second.recover().await.unwrap();
    assert_eq!(stats.waits_restored, 2);
    assert_eq!(stats.children_replayed, 1);

    let payload = serde_json::to_vec(&json!({"status": "SUCCEEDED"})).unwrap();
    second
        .notify_callback(&callback_id(&pending.id), payload)
        .unwrap();

    let exec = wait_for_concluded(&second, &id).await;
    assert_eq!(exec.status, Status::Succeeded);
    let outcome = exec.outcome.unwrap();
    assert_eq!(outcome["done"]["status"], json!("SUCCEEDED"));
    assert_eq!(outcome["pending"]["status"], json!("SUCCEEDED"));
}

#[tokio::test]
async fn test_running_node_without_state_is_errored() {
    let plan = Plan::new("p", "echo").with_node(node("echo", "ECHO", ExecutionMode::Sync));
    let store = Arc::new(MemoryStore::new());
    seed(&store, &plan, "echo", "crashed", Status::Running).await;

    let (tasks, _rx) = task_channel();
    let engine = engine_for(plan, store.clone(), tasks).await;
    let stats = engine.recover().await.unwrap();
    assert_eq!(stats.running_errored, 1);

    let exec = wait_for_concluded(&engine, "crashed").await;
    assert_eq!(exec.status, Status::Errored);
    assert_eq!(
        exec.failure.unwrap().failure_types,
        vec![FailureType::Interrupted]
    );
}

#[tokio::test]
async fn test_queued_node_is_resubmitted() {
    let plan = Plan::new("p", "echo")
        .with_node(node("echo", "ECHO", ExecutionMode::Sync).with_parameters(json!({"k": "v"})));
    let store = Arc::new(MemoryStore::new());
    seed(&store, &plan, "echo", "queued-before-crash", Status::Queued).await;

    let (tasks, _rx) = task_channel();
    let engine = engine_for(plan, store.clone(), tasks).await;
    assert_eq!(engine.recover().await.unwrap().queued_resubmitted, 1);

    let exec = wait_for_concluded(&engine, "queued-before-crash").await;
    assert_eq!(exec.status, Status::Succeeded);
    assert_eq!(exec.outcome, Some(json!({"k": "v"})));
}

#[tokio::test]
async fn test_unconcluded_advice_is_replayed() {
    let plan = Plan::new("p", "first")
        .with_node(node("first", "ECHO", ExecutionMode::Sync).with_next("second"))
        .with_node(node("second", "ECHO", ExecutionMode::Sync));
    let store = Arc::new(MemoryStore::new());
    seed(&store, &plan, "first", "finished", Status::Succeeded).await;

    let (tasks, _rx) = task_channel();
    let engine = engine_for(plan, store.clone(), tasks).await;
    assert_eq!(engine.recover().await.unwrap().advice_replayed, 1);

    let first = wait_for_concluded(&engine, "finished").await;
    assert_eq!(first.status, Status::Succeeded);

    let deadline = tokio::time::Instant::now() + WAIT;
    let second = loop {
        let runs = store.fetch_by_plan_execution("pe-seed").await.unwrap();
        if let Some(next) = runs.into_iter().find(|e| e.node.node_id == "second") {
            break next;
        }
        assert!(tokio::time::Instant::now() < deadline, "next node never created");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    assert_eq!(second.previous_id.as_deref(), Some("finished"));
    let second = wait_for_concluded(&engine, &second.id).await;
    assert_eq!(second.status, Status::Succeeded);
}

#[tokio::test]
async fn test_fulfilled_input_is_replayed() {
    let plan = Plan::new("p", "gate").with_node(
        node("gate", "ECHO", ExecutionMode::Sync).with_input_template(json!({"mode": "dry"})),
    );
    let store = Arc::new(MemoryStore::new());
    seed(&store, &plan, "gate", "gated", Status::InputWaiting).await;

    let mut instance =
        ExecutionInputInstance::new("in-1", "gated", "pe-seed", json!({"mode": "dry"}), 6);
    instance.state = InputState::Fulfilled;
    instance.merged_input = Some(json!({"mode": "live"}));
    store.save_input(&instance).await.unwrap();

    let (tasks, _rx) = task_channel();
    let engine = engine_for(plan, store.clone(), tasks).await;
    assert_eq!(engine.recover().await.unwrap().inputs_replayed, 1);

    let exec = wait_for_concluded(&engine, "gated").await;
    assert_eq!(exec.status, Status::Succeeded);
    assert_eq!(exec.outcome, Some(json!({"mode": "live"})));
}

#[tokio::test]
async fn test_waiting_input_is_rearmed() {
    let plan = Plan::new("p", "gate").with_node(
        node("gate", "ECHO", ExecutionMode::Sync).with_input_template(json!({"mode": "dry"})),
    );
    let store = Arc::new(MemoryStore::new());
    seed(&store, &plan, "gate", "gated", Status::InputWaiting).await;
    let instance =
        ExecutionInputInstance::new("in-2", "gated", "pe-seed", json!({"mode": "dry"}), 6);
    store.save_input(&instance).await.unwrap();

    let (tasks, _rx) = task_channel();
    let engine = engine_for(plan, store.clone(), tasks).await;
    assert_eq!(engine.recover().await.unwrap().inputs_rearmed, 1);
    assert!(engine.broker().is_waiting_on("in-2"));

    assert!(engine.supply_input("in-2", json!({"extra": true})).await.unwrap());
    let exec = wait_for_concluded(&engine, "gated").await;
    assert_eq!(exec.status, Status::Succeeded);
    assert_eq!(exec.outcome, Some(json!({"mode": "dry", "extra": true})));
}

#[tokio::test]
async fn test_unaccumulable_children_error_the_parent() {
    let plan = Plan::new("p", "fork")
        .with_node(node("fork", "FORK", ExecutionMode::Children).with_children(["a", "b"]))
        .with_node(node("a", "ECHO", ExecutionMode::Sync))
        .with_node(node("b", "ECHO", ExecutionMode::Sync));
    let store = Arc::new(MemoryStore::new());

    // Two finished runs of the same plan node under one parent
    let mut instances = Vec::new();
    for (id, status) in [("a-1", Status::Failed), ("a-2", Status::Succeeded)] {
        let mut child = NodeExecution::queued(
            id,
            Ambiance::new("p", "pe-seed"),
            "p",
            plan.node("a").unwrap(),
            Some("fork-run".to_string()),
            Some(id.to_string()),
        );
        child.status = status;
        child.concluded = true;
        store.save(&child).await.unwrap();
        instances.push(ChildInstance {
            node_id: "a".into(),
            execution_id: id.into(),
        });
    }
    seed(&store, &plan, "fork", "fork-run", Status::Running).await;
    store
        .apply(
            "fork-run",
            vec![NodeUpdate::AppendResponse(ExecutableResponse::Children {
                children: instances,
            })],
        )
        .await
        .unwrap();

    let (tasks, _rx) = task_channel();
    let engine = engine_for(plan, store.clone(), tasks).await;
    let stats = engine.recover().await.unwrap();
    assert_eq!(stats.waits_restored, 1);
    assert_eq!(stats.children_replayed, 2);

    let exec = wait_for_concluded(&engine, "fork-run").await;
    assert_eq!(exec.status, Status::Errored);
    assert_eq!(
        exec.failure.unwrap().failure_types,
        vec![FailureType::Configuration]
    );
}

