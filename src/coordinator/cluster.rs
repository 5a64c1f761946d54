//! Fan-out of requests to the node agents, the cluster lock calls, and the
//! polling of long running node sub-operations.
//!
//! The fan-out layer never retries and never raises for an individual
//! node; per-node outcomes are returned positionally so one unreachable
//! node cannot mask the answers of the others. Retry lives in
//! [`Cluster::wait_successful_results`], which polls node status URLs
//! with exponential backoff under a wall clock budget.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Error};
use bytes::Bytes;
use futures::future::join_all;
use http::StatusCode;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error as ThisError;

use crate::config::{CoordinatorNode, PollConfig};
use crate::ipc::{NodeOpResult, NodeRequest, OpStartResult};
use crate::progress::Progress;
use crate::stats::StatsClient;
use crate::tools::http::HttpClient;
use crate::tools::{AsyncSleeper, ExponentialBackoff};

/// Outcome of one HTTP call to one node, captured as a value.
#[derive(Debug)]
pub enum NodeCallResult {
    /// The node answered; any status code.
    Response { status: StatusCode, body: Bytes },
    /// No HTTP response at all (connect error, timeout, ...).
    Unreachable(String),
}

impl NodeCallResult {
    /// Decode a successful JSON response, failing on error statuses,
    /// unreachable nodes and undecodable bodies alike.
    pub fn ok_json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        match self {
            NodeCallResult::Unreachable(reason) => bail!("node unreachable: {}", reason),
            NodeCallResult::Response { status, body } => {
                if !status.is_success() {
                    bail!("unexpected status {}", status);
                }
                Ok(serde_json::from_slice(body)?)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockCall {
    Lock,
    Relock,
    Unlock,
}

impl LockCall {
    fn name(self) -> &'static str {
        match self {
            LockCall::Lock => "lock",
            LockCall::Relock => "relock",
            LockCall::Unlock => "unlock",
        }
    }

    fn expected_result(self) -> Value {
        match self {
            LockCall::Lock | LockCall::Relock => json!({"locked": true}),
            LockCall::Unlock => json!({"locked": false}),
        }
    }
}

/// Cluster wide outcome of one lock call.
///
/// `Failure` means some node gave a definite unexpected answer; the call
/// will not succeed by waiting. `Exception` means some node could not be
/// reached and nothing else went definitely wrong, so retrying may help.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockResult {
    Ok,
    Failure,
    Exception,
}

/// Errors of one poll wait; `Display` strings are part of the operation
/// status API surface.
#[derive(Debug, ThisError)]
pub enum WaitResultError {
    #[error("incorrect start result for #{index}/{count}: {reason}")]
    IncorrectStartResult { index: usize, count: usize, reason: String },
    #[error("incorrect number of results: {got} vs {required}")]
    IncorrectCount { got: usize, required: usize },
    #[error("too many failures")]
    TooManyFailures,
    #[error("node reported failure")]
    NodeReportedFailure,
    #[error("timed out")]
    TimedOut,
}

pub type ProgressHandler = Box<dyn Fn(Progress) + Send + Sync>;

pub struct Cluster {
    nodes: Vec<CoordinatorNode>,
    poll_config: PollConfig,
    http: HttpClient,
    stats: Arc<StatsClient>,
    subresult_url: Option<String>,
    subresult_sleeper: Option<Arc<AsyncSleeper>>,
    progress_handler: Mutex<Option<ProgressHandler>>,
}

impl Cluster {
    pub fn new(
        nodes: Vec<CoordinatorNode>,
        poll_config: PollConfig,
        http: HttpClient,
        stats: Arc<StatsClient>,
    ) -> Cluster {
        Cluster {
            nodes,
            poll_config,
            http,
            stats,
            subresult_url: None,
            subresult_sleeper: None,
            progress_handler: Mutex::new(None),
        }
    }

    /// Let nodes push completion hints to `url`; `sleeper` is what those
    /// hints wake up.
    pub fn set_subresult(&mut self, url: String, sleeper: Arc<AsyncSleeper>) {
        self.subresult_url = Some(url);
        self.subresult_sleeper = Some(sleeper);
    }

    pub fn set_progress_handler(&self, handler: Option<ProgressHandler>) {
        *self.progress_handler.lock().unwrap() = handler;
    }

    pub fn nodes(&self) -> &[CoordinatorNode] {
        &self.nodes
    }

    /// POST `req` to `path` on every target node concurrently and return
    /// all outcomes positionally once the slowest call finished.
    pub async fn request_from_nodes<R: NodeRequest>(
        &self,
        path: &str,
        caller: &str,
        req: &R,
        nodes: Option<&[CoordinatorNode]>,
    ) -> Vec<NodeCallResult> {
        let mut req = req.clone();
        if let Some(url) = &self.subresult_url {
            req.set_result_url(url.clone());
        }
        let body = match serde_json::to_string(&req) {
            Ok(body) => body,
            Err(err) => {
                // Can only happen with a malformed request type; surface
                // it on every slot like any other non-answer.
                let nodes = nodes.unwrap_or(&self.nodes);
                return nodes
                    .iter()
                    .map(|_| NodeCallResult::Unreachable(format!("unserializable request: {}", err)))
                    .collect();
            }
        };
        self.post_to_nodes(path, caller, Some(body), nodes.unwrap_or(&self.nodes))
            .await
    }

    async fn post_to_nodes(
        &self,
        path_and_query: &str,
        caller: &str,
        body: Option<String>,
        nodes: &[CoordinatorNode],
    ) -> Vec<NodeCallResult> {
        let timeout = Duration::from_secs_f64(self.poll_config.result_timeout);
        let calls = nodes.iter().map(|node| {
            let url = format!("{}/{}", node.url.trim_end_matches('/'), path_and_query);
            let body = body.clone();
            async move {
                let result = self.one_call(&url, body, timeout).await;
                log::info!("{}: POST {} => {:?}", caller, url, result);
                result
            }
        });
        join_all(calls).await
    }

    async fn one_call(&self, url: &str, body: Option<String>, timeout: Duration) -> NodeCallResult {
        let request = self.http.post(url, body);
        match tokio::time::timeout(timeout, request).await {
            Err(_) => NodeCallResult::Unreachable(format!("timeout after {:?}", timeout)),
            Ok(Err(err)) => NodeCallResult::Unreachable(err.to_string()),
            Ok(Ok(response)) => {
                let status = response.status();
                match hyper::body::to_bytes(response.into_body()).await {
                    Ok(body) => NodeCallResult::Response { status, body },
                    Err(err) => NodeCallResult::Unreachable(err.to_string()),
                }
            }
        }
    }

    pub async fn request_lock(&self, locker: &str, ttl: u64) -> LockResult {
        self.lock_call_from_nodes(LockCall::Lock, locker, ttl, &self.nodes)
            .await
    }

    pub async fn request_unlock(&self, locker: &str) -> LockResult {
        self.lock_call_from_nodes(LockCall::Unlock, locker, 0, &self.nodes)
            .await
    }

    pub async fn request_relock(&self, node: &CoordinatorNode, locker: &str, ttl: u64) -> LockResult {
        self.lock_call_from_nodes(LockCall::Relock, locker, ttl, std::slice::from_ref(node))
            .await
    }

    async fn lock_call_from_nodes(
        &self,
        call: LockCall,
        locker: &str,
        ttl: u64,
        nodes: &[CoordinatorNode],
    ) -> LockResult {
        let path = format!(
            "{}?locker={}&ttl={}",
            call.name(),
            utf8_percent_encode(locker, NON_ALPHANUMERIC),
            ttl
        );
        let results = self
            .post_to_nodes(&path, "Cluster.lock_call_from_nodes", None, nodes)
            .await;
        let result = aggregate_lock_results(call, nodes, &results);
        if result == LockResult::Failure {
            self.stats.increase(
                "astacus_lock_call_failure",
                &[("call", call.name()), ("locker", locker)],
            );
        }
        result
    }

    /// Wait until every node sub-operation started by a fan-out reports a
    /// final progress, returning the parsed results in input order.
    pub async fn wait_successful_results<R: NodeOpResult>(
        &self,
        start_results: &[NodeCallResult],
        required_successes: Option<usize>,
    ) -> Result<Vec<R>, WaitResultError> {
        let count = start_results.len();
        let mut urls = Vec::with_capacity(count);
        for (i, start_result) in start_results.iter().enumerate() {
            let parsed: OpStartResult = start_result.ok_json().map_err(|err| {
                log::info!("incorrect start result for #{}/{}: {:?}", i + 1, count, start_result);
                WaitResultError::IncorrectStartResult {
                    index: i + 1,
                    count,
                    reason: err.to_string(),
                }
            })?;
            urls.push(parsed.status_url);
        }
        if let Some(required) = required_successes {
            if urls.len() != required {
                return Err(WaitResultError::IncorrectCount { got: urls.len(), required });
            }
        }

        let mut results: Vec<Option<R>> = std::iter::repeat_with(|| None).take(urls.len()).collect();
        let mut failures = vec![0u32; urls.len()];
        let poll_timeout = Duration::from_secs_f64(self.poll_config.result_timeout);
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs_f64(self.poll_config.delay_start),
            self.poll_config.delay_multiplier,
            Duration::from_secs_f64(self.poll_config.delay_max),
            Duration::from_secs_f64(self.poll_config.duration),
            self.subresult_sleeper.as_deref(),
        );

        loop {
            if !backoff.tick().await {
                log::debug!("wait_successful_results timed out");
                return Err(WaitResultError::TimedOut);
            }
            for (i, url) in urls.iter().enumerate() {
                if matches!(&results[i], Some(result) if result.progress().final_) {
                    continue;
                }
                let result: Option<R> = match tokio::time::timeout(poll_timeout, self.http.get_string(url)).await {
                    Err(_) => None,
                    Ok(Err(err)) => {
                        log::info!("poll of {} failed: {}", url, err);
                        None
                    }
                    Ok(Ok(body)) => match serde_json::from_str(&body) {
                        Ok(result) => Some(result),
                        Err(err) => {
                            log::info!("poll of {} returned undecodable body: {}", url, err);
                            None
                        }
                    },
                };
                match result {
                    None => {
                        failures[i] += 1;
                        if failures[i] >= self.poll_config.maximum_failures {
                            return Err(WaitResultError::TooManyFailures);
                        }
                    }
                    Some(result) => {
                        let finished_failed = result.progress().finished_failed();
                        results[i] = Some(result);
                        failures[i] = 0;
                        if let Some(handler) = self.progress_handler.lock().unwrap().as_ref() {
                            let merged =
                                Progress::merge(results.iter().flatten().map(|r| r.progress()));
                            handler(merged);
                        }
                        if finished_failed {
                            return Err(WaitResultError::NodeReportedFailure);
                        }
                    }
                }
            }
            let all_final = results
                .iter()
                .all(|result| matches!(result, Some(result) if result.progress().final_));
            if all_final {
                return Ok(results.into_iter().flatten().collect());
            }
        }
    }
}

/// Reduce per-node lock call outcomes to one [`LockResult`].
///
/// A definite unexpected answer (error status or wrong payload) is a
/// failure; failures are sticky and a later unreachable node does not
/// downgrade them to an exception.
fn aggregate_lock_results(
    call: LockCall,
    nodes: &[CoordinatorNode],
    results: &[NodeCallResult],
) -> LockResult {
    let expected = call.expected_result();
    let mut rv = LockResult::Ok;
    for (node, result) in nodes.iter().zip(results.iter()) {
        match result {
            NodeCallResult::Unreachable(reason) => {
                log::info!("exception occurred when talking with node {}: {}", node.url, reason);
                if rv != LockResult::Failure {
                    rv = LockResult::Exception;
                }
            }
            NodeCallResult::Response { status, body } => {
                if !status.is_success() {
                    log::info!("{} of {} failed - unexpected status {}", call.name(), node.url, status);
                    rv = LockResult::Failure;
                    continue;
                }
                let decoded: Option<Value> = serde_json::from_slice(body).ok();
                if decoded.as_ref() != Some(&expected) {
                    log::info!("{} of {} failed - unexpected result {:?}", call.name(), node.url, decoded);
                    rv = LockResult::Failure;
                }
            }
        }
    }
    rv
}
