//! The coordinator HTTP API.
//!
//! A small hand-rolled hyper service; the surface is a handful of fixed
//! routes, so no routing framework is pulled in. All responses are JSON;
//! errors come back as `{"detail": ...}` with a matching status code.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Error;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::coordinator::op::OpName;
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::ipc::{CleanupRequest, ListRequest, RestoreRequest};

const DEFAULT_LOCK_TTL: u64 = 60;

/// Bind the API socket and hand back the bound address plus the serve
/// future, so callers binding port 0 can learn the actual port.
pub fn bind(
    coordinator: Arc<Coordinator>,
    addr: SocketAddr,
) -> Result<(SocketAddr, impl std::future::Future<Output = Result<(), Error>>), Error> {
    let make_svc = make_service_fn(move |_conn| {
        let coordinator = Arc::clone(&coordinator);
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                handle_request(Arc::clone(&coordinator), request)
            }))
        }
    });
    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    Ok((local_addr, async move {
        server.await?;
        Ok(())
    }))
}

pub async fn serve(coordinator: Arc<Coordinator>, addr: SocketAddr) -> Result<(), Error> {
    let (local_addr, server) = bind(coordinator, addr)?;
    log::info!("coordinator API listening on {}", local_addr);
    server.await
}

async fn handle_request(
    coordinator: Arc<Coordinator>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    Ok(route(coordinator, request).await)
}

async fn route(coordinator: Arc<Coordinator>, request: Request<Body>) -> Response<Body> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let query: HashMap<String, String> = parts
        .uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    match (parts.method.as_str(), segments.as_slice()) {
        // Liveness check.
        ("GET", &[]) => json_response(StatusCode::OK, &json!({})),
        ("POST", &["lock"]) => {
            let locker = match query.get("locker") {
                Some(locker) if !locker.is_empty() => locker.clone(),
                _ => return detail_response(StatusCode::BAD_REQUEST, "missing locker"),
            };
            let ttl = match query.get("ttl").map(|ttl| ttl.parse::<u64>()) {
                None => DEFAULT_LOCK_TTL,
                Some(Ok(ttl)) => ttl,
                Some(Err(_)) => return detail_response(StatusCode::BAD_REQUEST, "invalid ttl"),
            };
            json_response(StatusCode::OK, &coordinator.start_lock(locker, ttl))
        }
        ("POST", &["unlock"]) => {
            let locker = match query.get("locker") {
                Some(locker) if !locker.is_empty() => locker.clone(),
                _ => return detail_response(StatusCode::BAD_REQUEST, "missing locker"),
            };
            json_response(StatusCode::OK, &coordinator.start_unlock(locker))
        }
        ("POST", &["backup"]) => match coordinator.start_backup().await {
            Ok(started) => json_response(StatusCode::OK, &started),
            Err(err) => coordinator_error_response(err),
        },
        ("POST", &["restore"]) => {
            let req: RestoreRequest = match read_json_body(body).await {
                Ok(req) => req,
                Err(err) => return detail_response(StatusCode::BAD_REQUEST, &err.to_string()),
            };
            match coordinator.start_restore(req).await {
                Ok(started) => json_response(StatusCode::OK, &started),
                Err(err) => coordinator_error_response(err),
            }
        }
        ("POST", &["cleanup"]) => {
            let req: CleanupRequest = match read_json_body(body).await {
                Ok(req) => req,
                Err(err) => return detail_response(StatusCode::BAD_REQUEST, &err.to_string()),
            };
            match coordinator.start_cleanup(req).await {
                Ok(started) => json_response(StatusCode::OK, &started),
                Err(err) => coordinator_error_response(err),
            }
        }
        ("GET", &["list"]) => {
            let req: ListRequest = match read_json_body(body).await {
                Ok(req) => req,
                Err(err) => return detail_response(StatusCode::BAD_REQUEST, &err.to_string()),
            };
            match coordinator.list_backups(&req).await {
                Ok(response) => json_response(StatusCode::OK, &response),
                Err(err) => coordinator_error_response(err),
            }
        }
        ("GET", &[op_name, op_id]) => match parse_op(op_name, op_id) {
            Some((op_name, op_id)) => match coordinator.op_status(op_name, op_id) {
                Ok(snapshot) => json_response(StatusCode::OK, &snapshot),
                Err(err) => coordinator_error_response(err),
            },
            None => detail_response(StatusCode::NOT_FOUND, "not found"),
        },
        ("PUT", &[op_name, op_id, "sub-result"]) => match parse_op(op_name, op_id) {
            Some((op_name, op_id)) => match coordinator.sub_result(op_name, op_id) {
                Ok(()) => json_response(StatusCode::OK, &json!({})),
                Err(err) => coordinator_error_response(err),
            },
            None => detail_response(StatusCode::NOT_FOUND, "not found"),
        },
        ("DELETE", &[op_name, op_id]) => match parse_op(op_name, op_id) {
            Some((op_name, op_id)) => match coordinator.cancel_op(op_name, op_id) {
                Ok(()) => json_response(StatusCode::OK, &json!({})),
                Err(err) => coordinator_error_response(err),
            },
            None => detail_response(StatusCode::NOT_FOUND, "not found"),
        },
        _ => detail_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn parse_op(op_name: &str, op_id: &str) -> Option<(OpName, u64)> {
    let op_name = OpName::from_str(op_name).ok()?;
    let op_id = op_id.parse().ok()?;
    Some((op_name, op_id))
}

/// Missing bodies mean "all defaults"; several endpoints take optional
/// request documents.
async fn read_json_body<T: DeserializeOwned + Default>(body: Body) -> Result<T, Error> {
    let bytes = hyper::body::to_bytes(body).await?;
    if bytes.is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

fn coordinator_error_response(err: CoordinatorError) -> Response<Body> {
    let status = match &err {
        CoordinatorError::LockingFailed => StatusCode::CONFLICT,
        CoordinatorError::ListBusy => StatusCode::TOO_MANY_REQUESTS,
        CoordinatorError::UnknownOp(_) => StatusCode::NOT_FOUND,
        CoordinatorError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    detail_response(status, &err.to_string())
}

fn detail_response(status: StatusCode, detail: &str) -> Response<Body> {
    json_response(status, &json!({ "detail": detail }))
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
