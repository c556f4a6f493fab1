// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the startup recovery sweep.

mod common;

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use taskman_core::recovery::{INTERRUPTED_REASON, WORK_LOST_REASON};
use taskman_core::{EngineStatus, RecoverySweep, WaitKind};

use common::{TestContext, WAIT, stale_record};

fn long_ago() -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(2)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recovery_sweep_handles_each_state() {
    let ctx = TestContext::new().await;

    let init_id = ctx
        .insert_stale("EchoTask", EngineStatus::Init, "on_init", &[], None, long_ago())
        .await;
    let running_id = ctx
        .insert_stale(
            "PanicTask",
            EngineStatus::Running,
            "on_init",
            &["on_init"],
            None,
            long_ago(),
        )
        .await;
    let lost_work_id = ctx
        .insert_stale(
            "FlakyWorkTask",
            EngineStatus::StageComplete,
            "on_done",
            &["on_init"],
            Some(WaitKind::LocalWork),
            long_ago(),
        )
        .await;
    let waiting_id = ctx
        .insert_stale(
            "ParentTask",
            EngineStatus::StageComplete,
            "on_done",
            &["on_init"],
            Some(WaitKind::Subtask),
            long_ago(),
        )
        .await;
    let fresh_id = ctx
        .insert_stale("EchoTask", EngineStatus::Init, "on_init", &[], None, Utc::now())
        .await;

    let report = RecoverySweep::new(ctx.engine.clone(), Duration::from_secs(600))
        .run_once()
        .await
        .unwrap();
    assert_eq!(report.redispatched, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.resumed, 1);
    assert_eq!(report.skipped, 1);

    let init = ctx.engine.wait_terminal(&init_id, WAIT).await.unwrap();
    assert_eq!(init.engine_status, EngineStatus::Complete);

    let running = ctx.engine.get_task(&running_id).await.unwrap().unwrap();
    assert_eq!(running.engine_status, EngineStatus::Failed);
    assert_eq!(running.failure_reason.as_deref(), Some(INTERRUPTED_REASON));
    assert_eq!(
        ctx.journal
            .count(&format!("panic:compensate:true:{}", INTERRUPTED_REASON)),
        1
    );

    let lost = ctx.engine.wait_terminal(&lost_work_id, WAIT).await.unwrap();
    assert_eq!(lost.engine_status, EngineStatus::Failed);
    assert_eq!(
        lost.failure_reason,
        Some(format!("handled: {}", WORK_LOST_REASON))
    );

    let waiting = ctx.engine.get_task(&waiting_id).await.unwrap().unwrap();
    assert_eq!(waiting.engine_status, EngineStatus::StageComplete);

    let fresh = ctx.engine.get_task(&fresh_id).await.unwrap().unwrap();
    assert_eq!(fresh.engine_status, EngineStatus::Init);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recovery_sweep_on_empty_database() {
    let ctx = TestContext::new().await;

    let report = RecoverySweep::new(ctx.engine.clone(), Duration::from_secs(1))
        .run_once()
        .await
        .unwrap();
    assert_eq!(report, Default::default());

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tasks_from_before_start_are_recovered_inside_liveness() {
    let ctx = TestContext::new().await;

    // Written a minute before this engine existed: well inside the liveness
    // threshold, but nothing in this process will ever advance it.
    let lost_work_id = ctx
        .insert_stale(
            "FlakyWorkTask",
            EngineStatus::StageComplete,
            "on_done",
            &["on_init"],
            Some(WaitKind::LocalWork),
            ctx.engine.started_at() - chrono::Duration::seconds(60),
        )
        .await;

    let report = RecoverySweep::new(ctx.engine.clone(), Duration::from_secs(600))
        .run_once()
        .await
        .unwrap();
    assert_eq!(report.resumed, 1);

    let lost = ctx.engine.wait_terminal(&lost_work_id, WAIT).await.unwrap();
    assert_eq!(lost.engine_status, EngineStatus::Failed);
    assert_eq!(
        lost.failure_reason,
        Some(format!("handled: {}", WORK_LOST_REASON))
    );

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_work_still_running_here_is_left_alone() {
    let ctx = TestContext::new().await;
    let task_id = ctx
        .engine
        .start_task(ctx.spec("GatedWorkTask", "obj-1"))
        .await
        .unwrap();
    ctx.wait_status(&task_id, EngineStatus::StageComplete).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = RecoverySweep::new(ctx.engine.clone(), Duration::ZERO)
        .run_once()
        .await
        .unwrap();
    assert_eq!(report.resumed, 0);
    assert_eq!(report.skipped, 1);

    ctx.gate.open();
    let record = ctx.engine.wait_terminal(&task_id, WAIT).await.unwrap();
    assert_eq!(record.engine_status, EngineStatus::Complete);
    assert_eq!(record.result, Some(json!("released")));

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parent_of_finished_child_is_resumed() {
    let ctx = TestContext::new().await;

    let parent = stale_record(
        "ParentTask",
        EngineStatus::StageComplete,
        "on_done",
        &["on_init"],
        Some(WaitKind::Subtask),
        long_ago(),
    );
    ctx.persistence.insert_task(&parent).await.unwrap();

    let mut child = stale_record(
        "ChildTask",
        EngineStatus::Complete,
        "on_init",
        &["on_init"],
        None,
        long_ago(),
    );
    child.parent_id = Some(parent.id.clone());
    child.result = Some(json!("ok"));
    ctx.persistence.insert_task(&child).await.unwrap();

    let report = RecoverySweep::new(ctx.engine.clone(), Duration::from_secs(600))
        .run_once()
        .await
        .unwrap();
    assert_eq!(report.resumed, 1);

    let record = ctx.engine.wait_terminal(&parent.id, WAIT).await.unwrap();
    assert_eq!(record.engine_status, EngineStatus::Complete);
    assert_eq!(record.result, Some(json!({ "child": "ok" })));

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parent_of_failed_child_routes_to_failure_handler() {
    let ctx = TestContext::new().await;

    let parent = stale_record(
        "ParentTask",
        EngineStatus::StageComplete,
        "on_done",
        &["on_init"],
        Some(WaitKind::Subtask),
        long_ago(),
    );
    ctx.persistence.insert_task(&parent).await.unwrap();

    let mut child = stale_record(
        "ChildTask",
        EngineStatus::Failed,
        "on_init",
        &["on_init"],
        None,
        long_ago(),
    );
    child.parent_id = Some(parent.id.clone());
    child.failure_reason = Some("child refused".to_string());
    ctx.persistence.insert_task(&child).await.unwrap();

    RecoverySweep::new(ctx.engine.clone(), Duration::from_secs(600))
        .run_once()
        .await
        .unwrap();

    let record = ctx.engine.wait_terminal(&parent.id, WAIT).await.unwrap();
    assert_eq!(record.engine_status, EngineStatus::Failed);
    assert_eq!(
        record.failure_reason.as_deref(),
        Some("child failed: child refused")
    );
    assert_eq!(ctx.journal.count("parent:child_failed"), 1);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_loop_sweeps_until_shutdown() {
    let ctx = TestContext::new().await;

    let sweep = RecoverySweep::new(ctx.engine.clone(), Duration::from_secs(600))
        .with_interval(Duration::from_millis(50));
    let shutdown = sweep.shutdown_handle();
    let handle = tokio::spawn(sweep.run());

    // Appears after the first sweep; a later tick picks it up.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let init_id = ctx
        .insert_stale("EchoTask", EngineStatus::Init, "on_init", &[], None, long_ago())
        .await;

    let record = ctx.engine.wait_terminal(&init_id, WAIT).await.unwrap();
    assert_eq!(record.engine_status, EngineStatus::Complete);

    shutdown.notify_one();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();

    ctx.shutdown().await;
}
