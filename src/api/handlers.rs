use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use crate::api::BuildInfo;
use crate::store::{
    AvoidPolicy, BlockPolicy, HistoryQuery, Policy, ReservedPolicy, SourceStore, StickyPolicy,
};

/// Request body accepted by the policy creation endpoints.
#[derive(Debug, Default, Deserialize)]
struct PolicyPayload {
    #[serde(default)]
    source_id: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    issuer: String,
    #[serde(default)]
    hosts: Vec<String>,
}

impl PolicyPayload {
    fn issuer(&self) -> String {
        if self.issuer.is_empty() {
            "remote".to_string()
        } else {
            self.issuer.clone()
        }
    }
}

/// Dispatch one admin request.
pub async fn route(
    req: Request<Body>,
    store: Arc<SourceStore>,
    info: BuildInfo,
) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("API: {} {}", method, path);

    match (method, path.as_str()) {
        (Method::GET, "/health.json") => health(&info),
        (Method::GET, "/sources.json") => sources(&store),
        (Method::GET, "/policies.json") => policies(&store),
        (Method::POST, "/policies/block.json") => create_block(req, &store).await,
        (Method::POST, "/policies/sticky.json") => create_sticky(req, &store).await,
        (Method::POST, "/policies/reserve.json") => create_reserve(req, &store).await,
        (Method::POST, "/policies/avoid.json") => create_avoid(req, &store).await,
        (Method::DELETE, path) => match policy_id_from_path(path) {
            Some(id) => delete_policy(&store, id),
            None => not_found(),
        },
        _ => not_found(),
    }
}

fn policy_id_from_path(path: &str) -> Option<&str> {
    path.strip_prefix("/policies/")?.strip_suffix(".json")
}

fn health(info: &BuildInfo) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &json!({
            "alive": true,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": info.version,
            "commit": info.commit,
            "build_time": info.build_time,
            "proxy_port": info.proxy_port,
        }),
    )
}

fn sources(store: &SourceStore) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &json!({ "sources": store.sources_snapshot() }),
    )
}

fn policies(store: &SourceStore) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &json!({ "policies": store.policies_snapshot() }),
    )
}

fn delete_policy(store: &SourceStore, id: &str) -> Response<Body> {
    match store.del_policy(id) {
        Ok(()) => {
            // Dropping the sticky policy also drops the bindings it was
            // built on.
            if id == "stick" {
                store.stop_recording_bind_history();
            }
            json_response(StatusCode::OK, &json!({ "deleted": id }))
        }
        Err(e) => json_response(StatusCode::NOT_FOUND, &json!({ "error": e.to_string() })),
    }
}

async fn create_block(req: Request<Body>, store: &Arc<SourceStore>) -> Response<Body> {
    let payload = match decode(req).await {
        Ok(payload) => payload,
        Err(resp) => return *resp,
    };
    if payload.source_id.is_empty() {
        return bad_request("source_id must not be empty");
    }

    let policy = BlockPolicy::new(payload.issuer(), payload.source_id.as_str())
        .with_reason(payload.reason.as_str());
    append(store, Arc::new(policy))
}

async fn create_sticky(req: Request<Body>, store: &Arc<SourceStore>) -> Response<Body> {
    let payload = match decode(req).await {
        Ok(payload) => payload,
        Err(resp) => return *resp,
    };

    // The policy queries the live binding history; a weak reference keeps
    // the store from owning itself through the closure.
    let weak = Arc::downgrade(store);
    let history: HistoryQuery =
        Box::new(move |host| weak.upgrade().and_then(|s| s.query_bind_history(host)));

    let policy = StickyPolicy::new(payload.issuer(), history).with_reason(payload.reason.as_str());
    let response = append(store, Arc::new(policy));
    if response.status() == StatusCode::CREATED {
        store.record_bind_history();
    }
    response
}

async fn create_reserve(req: Request<Body>, store: &Arc<SourceStore>) -> Response<Body> {
    let payload = match decode(req).await {
        Ok(payload) => payload,
        Err(resp) => return *resp,
    };
    if payload.source_id.is_empty() {
        return bad_request("source_id must not be empty");
    }
    if payload.hosts.is_empty() {
        return bad_request("hosts must not be empty");
    }

    let policy = ReservedPolicy::new(payload.issuer(), payload.source_id.as_str(), &payload.hosts)
        .await
        .with_reason(payload.reason.as_str());
    append(store, Arc::new(policy))
}

async fn create_avoid(req: Request<Body>, store: &Arc<SourceStore>) -> Response<Body> {
    let payload = match decode(req).await {
        Ok(payload) => payload,
        Err(resp) => return *resp,
    };
    if payload.source_id.is_empty() {
        return bad_request("source_id must not be empty");
    }
    if payload.target.is_empty() {
        return bad_request("target must not be empty");
    }

    let policy = AvoidPolicy::new(payload.issuer(), payload.source_id.as_str(), &payload.target)
        .await
        .with_reason(payload.reason.as_str());
    append(store, Arc::new(policy))
}

async fn decode(req: Request<Body>) -> Result<PolicyPayload, Box<Response<Body>>> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("API: unable to read request body: {}", e);
            return Err(Box::new(bad_request("unable to read request body")));
        }
    };
    if bytes.is_empty() {
        return Ok(PolicyPayload::default());
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| Box::new(bad_request(&format!("invalid JSON body: {}", e))))
}

fn append(store: &SourceStore, policy: Arc<dyn Policy>) -> Response<Body> {
    let snapshot = policy.snapshot();
    match store.append_policy(policy) {
        Ok(()) => json_response(StatusCode::CREATED, &json!(snapshot)),
        Err(e) => json_response(StatusCode::BAD_REQUEST, &json!({ "error": e.to_string() })),
    }
}

fn bad_request(message: &str) -> Response<Body> {
    json_response(StatusCode::BAD_REQUEST, &json!({ "error": message }))
}

fn not_found() -> Response<Body> {
    json_response(StatusCode::NOT_FOUND, &json!({ "error": "not found" }))
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}
