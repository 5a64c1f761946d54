//! Polling node sub-operations to completion.

mod common;

use std::sync::{Arc, Mutex};

use remora::config::{CoordinatorNode, PollConfig};
use remora::coordinator::cluster::{Cluster, NodeCallResult, WaitResultError};
use remora::ipc::{NodeResult, SnapshotRequest, SnapshotResult};
use remora::progress::Progress;
use remora::stats::StatsClient;
use remora::storage::MemoryStorage;
use remora::tools::http::HttpClient;

use common::{StatusMode, StubNode};

async fn spawn_nodes(n: usize) -> Vec<StubNode> {
    let storage = Arc::new(MemoryStorage::new());
    let mut nodes = Vec::new();
    for i in 0..n {
        nodes.push(StubNode::spawn(&format!("db-{}", i), "", Arc::clone(&storage)).await);
    }
    nodes
}

fn cluster_for(nodes: &[StubNode], poll_config: PollConfig) -> Cluster {
    let node_configs: Vec<CoordinatorNode> = nodes
        .iter()
        .map(|node| CoordinatorNode { url: node.url.clone(), az: String::new() })
        .collect();
    Cluster::new(node_configs, poll_config, HttpClient::new(), Arc::new(StatsClient::disabled()))
}

fn fast_poll_config() -> PollConfig {
    PollConfig {
        delay_start: 0.01,
        delay_multiplier: 2.0,
        delay_max: 0.05,
        duration: 30.0,
        maximum_failures: 5,
        result_timeout: 2.0,
    }
}

#[tokio::test]
async fn test_wait_returns_results_in_input_order_and_merges_progress() {
    let nodes = spawn_nodes(2).await;
    nodes[0].set_files(vec![("data/a", b"aaaa")]);
    nodes[1].set_files(vec![("data/b", b"bb")]);
    let cluster = cluster_for(&nodes, fast_poll_config());

    let seen: Arc<Mutex<Vec<Progress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    cluster.set_progress_handler(Some(Box::new(move |progress| {
        sink.lock().unwrap().push(progress);
    })));

    let req = SnapshotRequest { root_globs: vec!["**/*".to_string()], ..Default::default() };
    let start_results = cluster.request_from_nodes("snapshot", "test", &req, None).await;
    let results: Vec<SnapshotResult> =
        cluster.wait_successful_results(&start_results, Some(2)).await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].hostname, "db-0");
    assert_eq!(results[1].hostname, "db-1");

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    // handled never regresses across handler invocations.
    for pair in seen.windows(2) {
        assert!(pair[1].handled >= pair[0].handled);
    }
    let last = seen.last().unwrap();
    assert!(last.final_);
    assert_eq!(last.handled, 2);
}

#[tokio::test]
async fn test_never_final_node_times_out() {
    let nodes = spawn_nodes(1).await;
    nodes[0].set_files(vec![("data/a", b"aaaa")]);
    *nodes[0].state.status_mode.lock().unwrap() = StatusMode::NeverFinal;
    let cluster = cluster_for(
        &nodes,
        PollConfig {
            delay_start: 0.1,
            delay_multiplier: 2.0,
            delay_max: 1.0,
            duration: 0.3,
            maximum_failures: 5,
            result_timeout: 0.1,
        },
    );

    let req = SnapshotRequest { root_globs: vec!["**/*".to_string()], ..Default::default() };
    let start_results = cluster.request_from_nodes("snapshot", "test", &req, None).await;
    let started = std::time::Instant::now();
    let err = cluster
        .wait_successful_results::<NodeResult>(&start_results, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WaitResultError::TimedOut));
    assert_eq!(err.to_string(), "timed out");
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
}

#[tokio::test]
async fn test_poll_errors_exhaust_failure_budget() {
    let nodes = spawn_nodes(1).await;
    *nodes[0].state.status_mode.lock().unwrap() = StatusMode::Error500;
    let cluster = cluster_for(
        &nodes,
        PollConfig { maximum_failures: 3, ..fast_poll_config() },
    );

    let req = SnapshotRequest { root_globs: vec![], ..Default::default() };
    let start_results = cluster.request_from_nodes("snapshot", "test", &req, None).await;
    let err = cluster
        .wait_successful_results::<NodeResult>(&start_results, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WaitResultError::TooManyFailures));
}

#[tokio::test]
async fn test_node_reporting_failure_fails_the_wait() {
    let nodes = spawn_nodes(1).await;
    *nodes[0].state.status_mode.lock().unwrap() = StatusMode::FinishedFailed;
    let cluster = cluster_for(&nodes, fast_poll_config());

    let req = SnapshotRequest { root_globs: vec![], ..Default::default() };
    let start_results = cluster.request_from_nodes("snapshot", "test", &req, None).await;
    let err = cluster
        .wait_successful_results::<NodeResult>(&start_results, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WaitResultError::NodeReportedFailure));
}

#[tokio::test]
async fn test_bad_start_results_fail_before_polling() {
    let nodes = spawn_nodes(1).await;
    nodes[0].set_files(vec![("data/a", b"aaaa")]);
    let cluster = cluster_for(&nodes, fast_poll_config());

    let start_results = vec![NodeCallResult::Unreachable("connection refused".to_string())];
    let err = cluster
        .wait_successful_results::<NodeResult>(&start_results, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WaitResultError::IncorrectStartResult { index: 1, count: 1, .. }));

    // Wrong number of start results against an exact expectation.
    let req = SnapshotRequest { root_globs: vec![], ..Default::default() };
    let start_results = cluster.request_from_nodes("snapshot", "test", &req, None).await;
    let err = cluster
        .wait_successful_results::<NodeResult>(&start_results, Some(2))
        .await
        .unwrap_err();
    assert!(matches!(err, WaitResultError::IncorrectCount { got: 1, required: 2 }));
}
