//! End-to-end commit protocol tests against real servers

mod common;

use common::*;
use commitkv::coordinator::{Decision, DecisionLog, Protocol, ProtocolEngine};
use commitkv::participant::{Participant, TxnState, VotePhase};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_phase_happy_path() {
    let dir = TempDir::new().unwrap();
    let p1 = spawn_participant(dir.path(), "p1").await;
    let p2 = spawn_participant(dir.path(), "p2").await;
    let p3 = spawn_participant(dir.path(), "p3").await;
    let roster = vec![p1.url.clone(), p2.url.clone(), p3.url.clone()];
    let coord = spawn_coordinator(coordinator_config(dir.path(), roster, true)).await;

    let (status, body) = start_tx(
        &coord.url,
        "tA",
        "2PC",
        json!({"type": "SET", "key": "x", "value": "1"}),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["decision"], "COMMIT");
    for p in [&p1, &p2, &p3] {
        assert_eq!(p.state("tA"), Some(TxnState::Committed));
        assert_eq!(p.get("x").as_deref(), Some("1"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_dissent_aborts_everywhere() {
    let dir = TempDir::new().unwrap();
    let p1 = spawn_participant(dir.path(), "p1").await;
    let p2 = spawn_participant(dir.path(), "p2").await;
    let p3 = spawn_participant(dir.path(), "p3").await;

    // p2 already aborted this txid, so it votes NO
    p2.handle.lock().unwrap().abort("tB", None).unwrap();

    let roster = vec![p1.url.clone(), p2.url.clone(), p3.url.clone()];
    let coord = spawn_coordinator(coordinator_config(dir.path(), roster, true)).await;

    let (status, body) = start_tx(
        &coord.url,
        "tB",
        "2PC",
        json!({"type": "TRANSFER", "from": "a", "to": "b", "amount": 10}),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["decision"], "ABORT");
    for p in [&p1, &p2, &p3] {
        assert_eq!(p.state("tB"), Some(TxnState::Aborted));
        assert!(p.handle.lock().unwrap().store().is_empty());
    }
    // Participants that voted YES keep the operation on their aborted record
    for p in [&p1, &p3] {
        let guard = p.handle.lock().unwrap();
        assert!(guard.transaction("tB").unwrap().operation.is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_operation_aborts() {
    let dir = TempDir::new().unwrap();
    let p1 = spawn_participant(dir.path(), "p1").await;
    let p2 = spawn_participant(dir.path(), "p2").await;
    let roster = vec![p1.url.clone(), p2.url.clone()];
    let coord = spawn_coordinator(coordinator_config(dir.path(), roster, true)).await;

    let (_, body) = start_tx(&coord.url, "t1", "3PC", json!({"type": "SET", "key": ""})).await;

    assert_eq!(body["decision"], "ABORT");
    assert_eq!(p1.state("t1"), Some(TxnState::Aborted));
    assert_eq!(p2.state("t1"), Some(TxnState::Aborted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_participant_forces_abort() {
    let dir = TempDir::new().unwrap();
    let p1 = spawn_participant(dir.path(), "p1").await;
    let p2 = spawn_participant(dir.path(), "p2").await;
    let dead = format!("http://127.0.0.1:{}", free_port());
    let roster = vec![p1.url.clone(), dead, p2.url.clone()];

    // Delivery to the dead node never finishes, so don't wait for it
    let coord = spawn_coordinator(coordinator_config(dir.path(), roster, false)).await;

    let (status, body) = start_tx(
        &coord.url,
        "t1",
        "2PC",
        json!({"type": "SET", "key": "x", "value": "1"}),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["decision"], "ABORT");
    assert!(
        wait_for(Duration::from_secs(5), || {
            p1.state("t1") == Some(TxnState::Aborted) && p2.state("t1") == Some(TxnState::Aborted)
        })
        .await
    );
    assert!(p1.get("x").is_none());
    assert!(p2.get("x").is_none());
    assert_eq!(coord.engine.decision("t1").unwrap(), Some(Decision::Abort));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_phase_commit() {
    let dir = TempDir::new().unwrap();
    let p1 = spawn_participant(dir.path(), "p1").await;
    let p2 = spawn_participant(dir.path(), "p2").await;
    let p3 = spawn_participant(dir.path(), "p3").await;

    for p in [&p1, &p2, &p3] {
        let mut guard = p.handle.lock().unwrap();
        guard
            .vote(
                VotePhase::Prepare,
                "seed",
                &json!({"type": "SET", "key": "alice", "value": "100"}),
            )
            .unwrap();
        guard.commit("seed").unwrap();
    }

    let roster = vec![p1.url.clone(), p2.url.clone(), p3.url.clone()];
    let coord = spawn_coordinator(coordinator_config(dir.path(), roster, true)).await;

    let (_, body) = start_tx(
        &coord.url,
        "t3",
        "3PC",
        json!({"type": "TRANSFER", "from": "alice", "to": "bob", "amount": "25"}),
    )
    .await;

    assert_eq!(body["decision"], "COMMIT");
    for p in [&p1, &p2, &p3] {
        assert_eq!(p.state("t3"), Some(TxnState::Committed));
        let guard = p.handle.lock().unwrap();
        assert_eq!(guard.store().balance("alice"), 75.0);
        assert_eq!(guard.store().balance("bob"), 25.0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_start_returns_logged_decision() {
    let dir = TempDir::new().unwrap();
    let p1 = spawn_participant(dir.path(), "p1").await;
    let coord = spawn_coordinator(coordinator_config(dir.path(), vec![p1.url.clone()], true)).await;
    let op = json!({"type": "TRANSFER", "from": "a", "to": "b", "amount": 5});

    let (_, first) = start_tx(&coord.url, "t1", "2PC", op.clone()).await;
    let (_, second) = start_tx(&coord.url, "t1", "2PC", op).await;

    assert_eq!(first["decision"], "COMMIT");
    assert_eq!(second["decision"], "COMMIT");
    // Applied exactly once
    let guard = p1.handle.lock().unwrap();
    assert_eq!(guard.store().balance("a"), -5.0);
    assert_eq!(guard.store().balance("b"), 5.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_start_is_rejected() {
    let dir = TempDir::new().unwrap();
    let p1 = spawn_participant(dir.path(), "p1").await;
    let coord = spawn_coordinator(coordinator_config(dir.path(), vec![p1.url.clone()], true)).await;

    let response = reqwest::Client::new()
        .post(format!("{}/tx/start", coord.url))
        .json(&json!({"txid": "t1", "operation": {"type": "SET", "key": "x"}}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_client_error());

    let response = reqwest::Client::new()
        .post(format!("{}/tx/commit", coord.url))
        .json(&json!({"txid": "t1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    assert!(p1.state("t1").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_participant_offline_during_propagation_catches_up() {
    let dir = TempDir::new().unwrap();
    let online = spawn_participant(dir.path(), "online").await;
    let op = json!({"type": "SET", "key": "x", "value": "1"});

    // The offline participant voted YES, then went down
    let offline_port = free_port();
    let offline_url = format!("http://127.0.0.1:{}", offline_port);
    {
        let mut p = Participant::open("offline", dir.path().join("offline.wal")).unwrap();
        p.vote(VotePhase::Prepare, "tD", &op).unwrap();
    }
    online
        .handle
        .lock()
        .unwrap()
        .vote(VotePhase::Prepare, "tD", &op)
        .unwrap();

    let config = coordinator_config(
        dir.path(),
        vec![online.url.clone(), offline_url.clone()],
        false,
    );
    let mut log = DecisionLog::open(&config.wal_path).unwrap();
    log.record_decision("tD", Protocol::TwoPhase, Decision::Commit, &op)
        .unwrap();
    let engine = Arc::new(ProtocolEngine::new(&config, log).unwrap());
    assert_eq!(engine.resume_pending().unwrap(), 1);

    assert!(
        wait_for(Duration::from_secs(5), || online.state("tD") == Some(TxnState::Committed)).await
    );
    assert!(
        wait_for(Duration::from_secs(5), || {
            engine
                .stats()
                .delivery_retries
                .load(std::sync::atomic::Ordering::Relaxed)
                >= 2
        })
        .await
    );

    // Bring the participant back on its old address
    let listener = TcpListener::bind(("127.0.0.1", offline_port)).await.unwrap();
    let offline = spawn_participant_on(listener, dir.path(), "offline");
    assert_eq!(offline.state("tD"), Some(TxnState::Ready));

    assert!(
        wait_for(Duration::from_secs(10), || offline.state("tD") == Some(TxnState::Committed))
            .await
    );
    assert_eq!(offline.get("x").as_deref(), Some("1"));
}
