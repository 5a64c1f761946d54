//! In-process stub node agent for integration tests.
//!
//! Implements just enough of the node API for the coordinator to drive:
//! the lock calls, snapshot/upload/download/clear sub-operation starts
//! and the status URLs they hand back. "Disk" contents are a list of
//! (path, bytes) pairs and uploads land in a shared `MemoryStorage`.

// Each integration test binary compiles this module; not all of them use
// every knob.
#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde_json::{json, Value};

use remora::ipc::{
    OpStartResult, SnapshotDownloadRequest, SnapshotFile, SnapshotHash, SnapshotRequest,
    SnapshotResult, SnapshotState, SnapshotUploadRequest, SnapshotUploadResult,
};
use remora::progress::Progress;
use remora::storage::MemoryStorage;

/// Deterministic stand-in for a content digest.
pub fn fake_hexdigest(content: &[u8]) -> String {
    let mut h: u64 = 5381;
    for &b in content {
        h = h.wrapping_mul(33) ^ b as u64;
    }
    format!("{:016x}", h)
}

/// How the stub answers status polls for its sub-operations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StatusMode {
    /// Result is final as soon as the sub-operation starts.
    Normal,
    /// Result never turns final.
    NeverFinal,
    /// Every status poll returns HTTP 500.
    Error500,
    /// Result is final with a failure counted in the progress.
    FinishedFailed,
}

pub struct StubState {
    pub hostname: String,
    pub az: String,
    pub files: Mutex<Vec<(String, Vec<u8>)>>,
    pub storage: Arc<MemoryStorage>,
    pub locked_by: Mutex<Option<String>>,
    pub fail_lock: AtomicBool,
    pub fail_relock: AtomicBool,
    pub status_mode: Mutex<StatusMode>,
    pub upload_requests: Mutex<Vec<SnapshotUploadRequest>>,
    pub download_requests: Mutex<Vec<SnapshotDownloadRequest>>,
    pub clear_requests: Mutex<usize>,
    ops: Mutex<HashMap<u64, Value>>,
    next_op: AtomicU64,
    base_url: Mutex<String>,
}

pub struct StubNode {
    pub url: String,
    pub state: Arc<StubState>,
}

impl StubNode {
    pub async fn spawn(hostname: &str, az: &str, storage: Arc<MemoryStorage>) -> StubNode {
        let state = Arc::new(StubState {
            hostname: hostname.to_string(),
            az: az.to_string(),
            files: Mutex::new(Vec::new()),
            storage,
            locked_by: Mutex::new(None),
            fail_lock: AtomicBool::new(false),
            fail_relock: AtomicBool::new(false),
            status_mode: Mutex::new(StatusMode::Normal),
            upload_requests: Mutex::new(Vec::new()),
            download_requests: Mutex::new(Vec::new()),
            clear_requests: Mutex::new(0),
            ops: Mutex::new(HashMap::new()),
            next_op: AtomicU64::new(0),
            base_url: Mutex::new(String::new()),
        });

        let service_state = Arc::clone(&state);
        let make_svc = make_service_fn(move |_conn| {
            let state = Arc::clone(&service_state);
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    handle(Arc::clone(&state), request)
                }))
            }
        });
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Server::bind(&addr).serve(make_svc);
        let url = format!("http://{}", server.local_addr());
        *state.base_url.lock().unwrap() = url.clone();
        tokio::spawn(async move {
            let _ = server.await;
        });
        StubNode { url, state }
    }

    pub fn set_files(&self, files: Vec<(&str, &[u8])>) {
        *self.state.files.lock().unwrap() = files
            .into_iter()
            .map(|(path, content)| (path.to_string(), content.to_vec()))
            .collect();
    }

    pub fn locker(&self) -> Option<String> {
        self.state.locked_by.lock().unwrap().clone()
    }

    pub fn uploaded_hexdigests(&self) -> Vec<String> {
        self.state
            .upload_requests
            .lock()
            .unwrap()
            .iter()
            .flat_map(|req| req.hashes.iter().map(|h| h.hexdigest.clone()))
            .collect()
    }
}

async fn handle(state: Arc<StubState>, request: Request<Body>) -> Result<Response<Body>, Infallible> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let query: HashMap<String, String> = parts
        .uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let body = hyper::body::to_bytes(body).await.unwrap_or_default();

    let response = match (parts.method.as_str(), segments.as_slice()) {
        ("POST", ["lock"]) => {
            if state.fail_lock.load(Ordering::SeqCst) {
                status_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"detail": "boom"}))
            } else {
                let locker = query.get("locker").cloned().unwrap_or_default();
                let mut locked_by = state.locked_by.lock().unwrap();
                match &*locked_by {
                    Some(current) if *current != locker => ok_response(json!({"locked": false})),
                    _ => {
                        *locked_by = Some(locker);
                        ok_response(json!({"locked": true}))
                    }
                }
            }
        }
        ("POST", ["relock"]) => {
            if state.fail_relock.load(Ordering::SeqCst) {
                status_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"detail": "boom"}))
            } else {
                let locker = query.get("locker").cloned().unwrap_or_default();
                let locked = state.locked_by.lock().unwrap().as_deref() == Some(locker.as_str());
                ok_response(json!({ "locked": locked }))
            }
        }
        ("POST", ["unlock"]) => {
            let locker = query.get("locker").cloned().unwrap_or_default();
            let mut locked_by = state.locked_by.lock().unwrap();
            match &*locked_by {
                // Unlocking somebody else's lock does not release it.
                Some(current) if *current != locker => ok_response(json!({"locked": true})),
                _ => {
                    *locked_by = None;
                    ok_response(json!({"locked": false}))
                }
            }
        }
        ("POST", ["snapshot"]) => {
            let req: SnapshotRequest = serde_json::from_slice(&body).unwrap_or_default();
            let result = snapshot_result(&state, &req);
            start_op(&state, serde_json::to_value(&result).unwrap())
        }
        ("POST", ["upload"]) => {
            let req: SnapshotUploadRequest = serde_json::from_slice(&body).unwrap_or_default();
            let total_size: u64 = req.hashes.iter().map(|h| h.size).sum();
            for hash in &req.hashes {
                state.storage.add_hexdigest(&hash.hexdigest);
            }
            state.upload_requests.lock().unwrap().push(req);
            let result = SnapshotUploadResult {
                hostname: state.hostname.clone(),
                az: state.az.clone(),
                progress: final_progress(total_size),
                total_size,
                total_stored_size: total_size,
            };
            start_op(&state, serde_json::to_value(&result).unwrap())
        }
        ("POST", ["download"]) => {
            let req: SnapshotDownloadRequest = serde_json::from_slice(&body).unwrap_or_default();
            state.download_requests.lock().unwrap().push(req);
            start_op(&state, node_result(&state))
        }
        ("POST", ["clear"]) => {
            *state.clear_requests.lock().unwrap() += 1;
            start_op(&state, node_result(&state))
        }
        ("GET", ["op", op_id]) => {
            let op_id: u64 = op_id.parse().unwrap_or(0);
            match *state.status_mode.lock().unwrap() {
                StatusMode::Error500 => {
                    status_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"detail": "boom"}))
                }
                StatusMode::NeverFinal => ok_response(json!({
                    "hostname": state.hostname,
                    "az": state.az,
                    "progress": Progress { handled: 0, failed: 0, total: 1, final_: false },
                })),
                StatusMode::FinishedFailed => ok_response(json!({
                    "hostname": state.hostname,
                    "az": state.az,
                    "progress": Progress { handled: 1, failed: 1, total: 1, final_: true },
                })),
                StatusMode::Normal => match state.ops.lock().unwrap().get(&op_id) {
                    Some(result) => ok_response(result.clone()),
                    None => status_response(StatusCode::NOT_FOUND, json!({"detail": "no such op"})),
                },
            }
        }
        _ => status_response(StatusCode::NOT_FOUND, json!({"detail": "not found"})),
    };
    Ok(response)
}

fn snapshot_result(state: &Arc<StubState>, req: &SnapshotRequest) -> SnapshotResult {
    let files = state.files.lock().unwrap();
    let snapshot_files: Vec<SnapshotFile> = files
        .iter()
        .map(|(path, content)| SnapshotFile {
            relative_path: path.clone(),
            file_size: content.len() as u64,
            mtime_ns: 0,
            hexdigest: fake_hexdigest(content),
            content_b64: None,
        })
        .collect();
    let hashes: Vec<SnapshotHash> = snapshot_files
        .iter()
        .map(|file| SnapshotHash { hexdigest: file.hexdigest.clone(), size: file.file_size })
        .collect();
    let total_size = snapshot_files.iter().map(|file| file.file_size).sum();
    SnapshotResult {
        hostname: state.hostname.clone(),
        az: state.az.clone(),
        progress: final_progress(snapshot_files.len() as u64),
        files: snapshot_files.len() as u64,
        total_size,
        state: SnapshotState { root_globs: req.root_globs.clone(), files: snapshot_files },
        hashes,
    }
}

fn node_result(state: &Arc<StubState>) -> Value {
    json!({
        "hostname": state.hostname,
        "az": state.az,
        "progress": final_progress(1),
    })
}

fn final_progress(total: u64) -> Progress {
    Progress { handled: total, failed: 0, total, final_: true }
}

fn start_op(state: &Arc<StubState>, result: Value) -> Response<Body> {
    let op_id = state.next_op.fetch_add(1, Ordering::SeqCst) + 1;
    state.ops.lock().unwrap().insert(op_id, result);
    let start_result = OpStartResult {
        op_id,
        status_url: format!("{}/op/{}", state.base_url.lock().unwrap(), op_id),
    };
    ok_response(serde_json::to_value(&start_result).unwrap())
}

fn ok_response(value: Value) -> Response<Body> {
    status_response(StatusCode::OK, value)
}

fn status_response(status: StatusCode, value: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}
