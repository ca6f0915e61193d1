//! Durable store: records and suspended nodes survive a reopen

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use common::*;
use stagehand::{
    Ambiance, Engine, EngineConfig, ExecutionInputInstance, ExecutionInputStore, ExecutionMode,
    InputState, NodeExecution, NodeExecutionStore, NodeUpdate, Plan, SledStore, Status,
};

fn sample(id: &str) -> NodeExecution {
    let plan_node = node("echo", "ECHO", ExecutionMode::Sync);
    NodeExecution::queued(id, Ambiance::new("p", "pe-sled"), "p", &plan_node, None, None)
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("engine.db");

    {
        let store = SledStore::open(&path).unwrap();
        store.save(&sample("n1")).await.unwrap();
        store
            .update_status_with_ops(
                "n1",
                &[Status::Queued],
                Status::Running,
                vec![NodeUpdate::SetOutcome(json!({"partial": true}))],
            )
            .await
            .unwrap()
            .unwrap();
        store
            .save_input(&ExecutionInputInstance::new("in-1", "n1", "pe-sled", json!({}), 6))
            .await
            .unwrap();
        store.flush().await.unwrap();
    }

    let store = SledStore::open(&path).unwrap();
    let exec = store.get("n1").await.unwrap().unwrap();
    assert_eq!(exec.status, Status::Running);
    assert_eq!(exec.outcome, Some(json!({"partial": true})));

    let running = store.fetch_by_status(&[Status::Running]).await.unwrap();
    assert_eq!(running.len(), 1);
    assert!(store.fetch_by_status(&[Status::Queued]).await.unwrap().is_empty());

    let waiting = store.fetch_inputs_by_state(InputState::Waiting).await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].node_execution_id, "n1");
}

#[tokio::test]
async fn test_terminal_record_rejects_status_change() {
    let store = SledStore::temporary().unwrap();
    store.save(&sample("n2")).await.unwrap();
    store
        .update_status("n2", &[Status::Queued], Status::Running)
        .await
        .unwrap()
        .unwrap();
    store
        .update_status("n2", &[Status::Running], Status::Succeeded)
        .await
        .unwrap()
        .unwrap();

    let again = store
        .update_status("n2", &Status::non_final(), Status::Failed)
        .await
        .unwrap();
    assert!(again.is_none());
    assert_eq!(store.get("n2").await.unwrap().unwrap().status, Status::Succeeded);
}

#[tokio::test]
async fn test_engine_resumes_wait_after_reopen() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::builder()
        .max_workers(4)
        .broker_partitions(2)
        .db_path(dir.path().join("engine.db"))
        .recovery(true)
        .build()
        .unwrap();
    let plan = Plan::new("p", "wait").with_node(node("wait", "CALLBACK", ExecutionMode::Async));

    let id = {
        let engine = Engine::builder()
            .config(config.clone())
            .steps(registry())
            .plan(plan.clone())
            .build()
            .await
            .unwrap();
        let id = engine
            .start_plan("p", Ambiance::new("p", "pe-durable"))
            .await
            .unwrap();
        wait_for_status(&engine, &id, Status::AsyncWaiting).await;
        engine.shutdown().await.unwrap();
        id
    };

    // Let the first engine's store handle close before reopening the same path
    let deadline = tokio::time::Instant::now() + WAIT;
    let engine = loop {
        match Engine::builder()
            .config(config.clone())
            .steps(registry())
            .plan(plan.clone())
            .build()
            .await
        {
            Ok(engine) => break engine,
            Err(e) if tokio::time::Instant::now() < deadline => {
                tracing::debug!(error = %e, "Store still locked, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            Err(e) => panic!("could not reopen store: {}", e),
        }
    };
    assert!(engine.broker().is_waiting_on(&callback_id(&id)));

    let payload = serde_json::to_vec(&json!({"status": "SUCCEEDED"})).unwrap();
    engine.notify_callback(&callback_id(&id), payload).unwrap();
    let exec = wait_for_concluded(&engine, &id).await;
    assert_eq!(exec.status, Status::Succeeded);
}
