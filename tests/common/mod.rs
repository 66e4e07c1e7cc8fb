//! Helpers for starting in-process participants and coordinators

#![allow(dead_code)]

use commitkv::common::{CoordinatorConfig, ParticipantConfig};
use commitkv::coordinator::ProtocolEngine;
use commitkv::participant::{Participant, TxnState};
use commitkv::{Coordinator, ParticipantServer};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct TestParticipant {
    pub url: String,
    pub handle: Arc<Mutex<Participant>>,
    pub task: JoinHandle<commitkv::Result<()>>,
}

impl TestParticipant {
    pub fn state(&self, txid: &str) -> Option<TxnState> {
        self.handle.lock().unwrap().state_of(txid)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.handle
            .lock()
            .unwrap()
            .store()
            .get(key)
            .map(str::to_string)
    }
}

pub struct TestCoordinator {
    pub url: String,
    pub engine: Arc<ProtocolEngine>,
    pub task: JoinHandle<commitkv::Result<()>>,
}

/// A localhost port with nothing listening on it.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub async fn spawn_participant(dir: &Path, id: &str) -> TestParticipant {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    spawn_participant_on(listener, dir, id)
}

pub fn spawn_participant_on(listener: TcpListener, dir: &Path, id: &str) -> TestParticipant {
    let addr = listener.local_addr().unwrap();
    let config = ParticipantConfig {
        bind_addr: addr,
        wal_path: dir.join(format!("{}.wal", id)),
    };
    let server = ParticipantServer::open(config, id.to_string()).unwrap();
    let handle = server.participant();
    let task = tokio::spawn(server.run(listener));
    TestParticipant {
        url: format!("http://{}", addr),
        handle,
        task,
    }
}

pub fn coordinator_config(dir: &Path, participants: Vec<String>, await_propagation: bool) -> CoordinatorConfig {
    CoordinatorConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        wal_path: dir.join("coordinator.wal"),
        participants,
        vote_timeout_ms: 1000,
        attempt_timeout_ms: 500,
        retry_backoff_ms: 50,
        max_backoff_ms: 200,
        await_propagation,
    }
}

pub async fn spawn_coordinator(config: CoordinatorConfig) -> TestCoordinator {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let coordinator = Coordinator::open(config, "coord".to_string()).unwrap();
    let engine = coordinator.engine();
    let task = tokio::spawn(coordinator.run(listener));
    TestCoordinator { url, engine, task }
}

/// POST /tx/start and return (status, body).
pub async fn start_tx(coord_url: &str, txid: &str, protocol: &str, operation: Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(format!("{}/tx/start", coord_url))
        .json(&serde_json::json!({ "txid": txid, "protocol": protocol, "operation": operation }))
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
