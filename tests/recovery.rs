//! Crash and restart tests for participants and the coordinator

mod common;

use common::*;
use commitkv::coordinator::{Decision, DecisionLog, Protocol};
use commitkv::participant::{Participant, TxnState, VotePhase};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;

async fn post(url: &str, path: &str, body: Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(format!("{}{}", url, path))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap_or(Value::Null))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_precommitted_participant_recovers_and_commits() {
    let dir = TempDir::new().unwrap();

    // CAN_COMMIT YES, then PRECOMMIT, then the process dies
    {
        let p = spawn_participant(dir.path(), "p1").await;
        let (status, body) = post(
            &p.url,
            "/can_commit",
            json!({"txid": "tC", "operation": {"type": "SET", "key": "x", "value": "1"}}),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["vote"], "YES");

        let (status, _) = post(&p.url, "/precommit", json!({"txid": "tC"})).await;
        assert_eq!(status, 200);
        p.task.abort();
    }

    let p = spawn_participant(dir.path(), "p1").await;
    assert_eq!(p.state("tC"), Some(TxnState::Precommit));
    assert!(p.handle.lock().unwrap().transaction("tC").unwrap().operation.is_some());
    assert!(p.get("x").is_none());

    let (status, _) = post(&p.url, "/commit", json!({"txid": "tC"})).await;
    assert_eq!(status, 200);
    assert_eq!(p.state("tC"), Some(TxnState::Committed));
    assert_eq!(p.get("x").as_deref(), Some("1"));

    // Duplicate commit is acknowledged and changes nothing
    let (status, _) = post(&p.url, "/commit", json!({"txid": "tC"})).await;
    assert_eq!(status, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicts_leave_state_unchanged_across_restart() {
    let dir = TempDir::new().unwrap();
    let wal_path = dir.path().join("p1.wal");

    {
        let mut p = Participant::open("p1", &wal_path).unwrap();
        p.vote(
            VotePhase::Prepare,
            "t1",
            &json!({"type": "SET", "key": "x", "value": "1"}),
        )
        .unwrap();
        p.abort("t1", None).unwrap();
        assert!(p.commit("t1").is_err());
        assert!(p.precommit("t1").is_err());
    }

    let p = spawn_participant(dir.path(), "p1").await;
    let (status, _) = post(&p.url, "/commit", json!({"txid": "t1"})).await;
    assert_eq!(status, 409);
    assert_eq!(p.state("t1"), Some(TxnState::Aborted));
    assert!(p.get("x").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_restart_redelivers_logged_decision() {
    let dir = TempDir::new().unwrap();
    let p1 = spawn_participant(dir.path(), "p1").await;
    let p2 = spawn_participant(dir.path(), "p2").await;
    let op = json!({"type": "TRANSFER", "from": "a", "to": "b", "amount": 10});

    for p in [&p1, &p2] {
        p.handle
            .lock()
            .unwrap()
            .vote(VotePhase::Prepare, "t1", &op)
            .unwrap();
    }

    // The coordinator logged COMMIT and crashed before telling anyone
    let config = coordinator_config(dir.path(), vec![p1.url.clone(), p2.url.clone()], false);
    {
        let mut log = DecisionLog::open(&config.wal_path).unwrap();
        log.record_decision("t1", Protocol::TwoPhase, Decision::Commit, &op)
            .unwrap();
    }
    assert_eq!(p1.state("t1"), Some(TxnState::Ready));

    let coord = spawn_coordinator(config.clone()).await;
    assert!(
        wait_for(Duration::from_secs(5), || {
            p1.state("t1") == Some(TxnState::Committed) && p2.state("t1") == Some(TxnState::Committed)
        })
        .await
    );
    for p in [&p1, &p2] {
        let guard = p.handle.lock().unwrap();
        assert_eq!(guard.store().balance("a"), -10.0);
        assert_eq!(guard.store().balance("b"), 10.0);
    }

    // Completion is recorded, so a second restart has nothing to resend
    let engine = coord.engine.clone();
    let mut complete = false;
    for _ in 0..100 {
        if engine.status().await.unwrap().pending_propagations == 0 {
            complete = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(complete);
    coord.task.abort();

    let log = DecisionLog::open(&config.wal_path).unwrap();
    assert_eq!(log.decision("t1"), Some(Decision::Commit));
    assert!(log.pending().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_restart_skips_acked_participants() {
    let dir = TempDir::new().unwrap();
    let p1 = spawn_participant(dir.path(), "p1").await;
    let p2 = spawn_participant(dir.path(), "p2").await;
    let op = json!({"type": "SET", "key": "k", "value": "v"});

    p2.handle
        .lock()
        .unwrap()
        .vote(VotePhase::Prepare, "t1", &op)
        .unwrap();

    // p1 acked before the crash; p1 never actually saw the vote, so a resend
    // to it would be rejected and leave no record
    let config = coordinator_config(dir.path(), vec![p1.url.clone(), p2.url.clone()], false);
    {
        let mut log = DecisionLog::open(&config.wal_path).unwrap();
        log.record_decision("t1", Protocol::TwoPhase, Decision::Commit, &op)
            .unwrap();
        log.record_ack("t1", &p1.url).unwrap();
    }

    let _coord = spawn_coordinator(config).await;
    assert!(
        wait_for(Duration::from_secs(5), || p2.state("t1") == Some(TxnState::Committed)).await
    );
    assert_eq!(p1.state("t1"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejected_commit_stays_pending() {
    let dir = TempDir::new().unwrap();
    let p1 = spawn_participant(dir.path(), "p1").await;
    let p2 = spawn_participant(dir.path(), "p2").await;
    let op = json!({"type": "SET", "key": "k", "value": "v"});

    // p1 aborted on its own, p2 is READY, yet COMMIT was logged
    p1.handle.lock().unwrap().abort("t1", None).unwrap();
    p2.handle
        .lock()
        .unwrap()
        .vote(VotePhase::Prepare, "t1", &op)
        .unwrap();
    let config = coordinator_config(dir.path(), vec![p1.url.clone(), p2.url.clone()], false);
    {
        let mut log = DecisionLog::open(&config.wal_path).unwrap();
        log.record_decision("t1", Protocol::TwoPhase, Decision::Commit, &op)
            .unwrap();
    }

    let coord = spawn_coordinator(config.clone()).await;
    assert!(
        wait_for(Duration::from_secs(5), || p2.state("t1") == Some(TxnState::Committed)).await
    );
    let stats = coord.engine.stats();
    assert!(
        wait_for(Duration::from_secs(5), || {
            stats.rejected_deliveries.load(std::sync::atomic::Ordering::Relaxed) == 1
                && stats
                    .propagations_in_flight
                    .load(std::sync::atomic::Ordering::Relaxed)
                    == 0
        })
        .await
    );
    assert_eq!(p1.state("t1"), Some(TxnState::Aborted));

    let status = coord.engine.status().await.unwrap();
    assert_eq!(status.pending_propagations, 1);
    assert_eq!(status.rejected_deliveries, 1);
    coord.task.abort();

    let log = DecisionLog::open(&config.wal_path).unwrap();
    let pending = log.pending();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].acked.contains(&p2.url));
    assert!(!pending[0].acked.contains(&p1.url));
}
