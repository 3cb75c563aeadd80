mod common;

use common::*;
use serde_json::json;
use shard_write_exec::core::{ErrorCode, Status};
use shard_write_exec::sender::ScriptedReply;
use shard_write_exec::{BatchWriteExec, BatchWriteExecStats, WriteExecConfig};
use std::time::Duration;
use tokio_test::assert_ok;
use uuid::Uuid;

fn not_master() -> ScriptedReply {
    ScriptedReply::Reply(json!({
        "ok": 0,
        "code": ErrorCode::NotMaster.code(),
        "errmsg": "not master"
    }))
}

#[tokio::test]
async fn retryable_write_survives_not_master() {
    let cluster = TestCluster::new().await;
    cluster.transport.script(&host_a(), not_master()).await;
    let lsid = Uuid::new_v4();
    let ctx = cluster.context().with_retryable_write(lsid, 7);
    let mut targeter = cluster.targeter(unsharded_ns()).await;
    let request = insert(unsharded_ns(), vec![json!({"_id": 1})], true);
    let mut stats = BatchWriteExecStats::new();

    let response = assert_ok!(
        BatchWriteExec::execute_batch(&ctx, &mut targeter, &request, &mut stats).await
    );

    assert_eq!(response.n, 1);
    assert!(response.write_errors.is_empty());
    assert_eq!(stats.num_rounds, 1);

    let sent = cluster.transport.received_by(&host_a()).await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].command["txnNumber"], json!(7));
    assert_eq!(sent[1].command["lsid"]["id"], json!(lsid.to_string()));
    assert_eq!(sent[1].command["stmtIds"], json!([0]));
}

#[tokio::test]
async fn plain_write_reports_not_master() {
    let cluster = TestCluster::new().await;
    cluster.transport.script(&host_a(), not_master()).await;
    let ctx = cluster.context();
    let mut targeter = cluster.targeter(unsharded_ns()).await;
    let request = insert(unsharded_ns(), vec![json!({"_id": 1})], true);
    let mut stats = BatchWriteExecStats::new();

    let response = assert_ok!(
        BatchWriteExec::execute_batch(&ctx, &mut targeter, &request, &mut stats).await
    );

    assert_eq!(response.n, 0);
    assert_eq!(response.write_errors.len(), 1);
    assert_eq!(response.write_errors[0].code(), ErrorCode::NotMaster);
    assert_eq!(cluster.transport.received_by(&host_a()).await.len(), 1);
    let sent = &cluster.transport.received_by(&host_a()).await[0];
    assert!(sent.command.get("txnNumber").is_none());
    assert!(sent.command.get("stmtIds").is_none());
}

#[tokio::test]
async fn stale_epoch_command_error_is_not_retried() {
    let cluster = TestCluster::new().await;
    cluster
        .transport
        .script(
            &host_a(),
            ScriptedReply::Reply(json!({
                "ok": 0,
                "code": ErrorCode::StaleEpoch.code(),
                "errmsg": "collection was dropped and recreated"
            })),
        )
        .await;
    let ctx = cluster.context().with_retryable_write(Uuid::new_v4(), 1);
    let mut targeter = cluster.targeter(unsharded_ns()).await;
    let request = insert(unsharded_ns(), vec![json!({"_id": 1})], true);
    let mut stats = BatchWriteExecStats::new();

    let response = assert_ok!(
        BatchWriteExec::execute_batch(&ctx, &mut targeter, &request, &mut stats).await
    );

    assert_eq!(response.write_errors.len(), 1);
    assert_eq!(response.write_errors[0].code(), ErrorCode::StaleEpoch);
    assert_eq!(stats.num_rounds, 1);
    assert_eq!(cluster.transport.received_by(&host_a()).await.len(), 1);
}

#[tokio::test]
async fn sender_gives_up_after_max_attempts() {
    let cluster = TestCluster::new().await;
    for _ in 0..3 {
        cluster.transport.script(&host_a(), not_master()).await;
    }
    let ctx = cluster.context().with_retryable_write(Uuid::new_v4(), 2);
    let mut targeter = cluster.targeter(unsharded_ns()).await;
    let request = insert(unsharded_ns(), vec![json!({"_id": 1})], true);
    let mut stats = BatchWriteExecStats::new();

    let response = assert_ok!(
        BatchWriteExec::execute_batch(&ctx, &mut targeter, &request, &mut stats).await
    );

    assert_eq!(response.write_errors[0].code(), ErrorCode::NotMaster);
    assert_eq!(cluster.transport.received_by(&host_a()).await.len(), 3);
}

#[tokio::test]
async fn network_error_is_retried_for_retryable_writes() {
    let cluster = TestCluster::new().await;
    cluster
        .transport
        .script(
            &host_a(),
            ScriptedReply::Fail(Status::new(ErrorCode::HostUnreachable, "connection reset")),
        )
        .await;
    let ctx = cluster.context().with_retryable_write(Uuid::new_v4(), 3);
    let mut targeter = cluster.targeter(unsharded_ns()).await;
    let request = insert(unsharded_ns(), vec![json!({"_id": 1})], true);
    let mut stats = BatchWriteExecStats::new();

    let response = assert_ok!(
        BatchWriteExec::execute_batch(&ctx, &mut targeter, &request, &mut stats).await
    );

    assert_eq!(response.n, 1);
    assert!(response.write_errors.is_empty());
}

#[tokio::test]
async fn slow_shard_times_out() {
    let cluster = TestCluster::new().await;
    cluster
        .transport
        .script(
            &host_a(),
            ScriptedReply::Delayed(
                Duration::from_secs(5),
                Box::new(ScriptedReply::Reply(json!({"ok": 1, "n": 1}))),
            ),
        )
        .await;
    let ctx = cluster.context().with_config(
        WriteExecConfig::default().shard_request_timeout(Duration::from_millis(20)),
    );
    let mut targeter = cluster.targeter(unsharded_ns()).await;
    let request = insert(unsharded_ns(), vec![json!({"_id": 1})], true);
    let mut stats = BatchWriteExecStats::new();

    let response = assert_ok!(
        BatchWriteExec::execute_batch(&ctx, &mut targeter, &request, &mut stats).await
    );

    assert_eq!(response.write_errors.len(), 1);
    let error = &response.write_errors[0];
    assert_eq!(error.code(), ErrorCode::ExceededTimeLimit);
    assert!(error.status.reason.starts_with("Write results unavailable from"));
}
