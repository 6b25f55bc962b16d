/// HTTP server for the triage daemon: hyper service with manual routing.
use crate::errors::{DaemonError, DaemonResult};
use crate::event_stream::stream_task_progress;
use crate::handlers::{self, AppState, QueryParams};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

pub struct HttpServer {
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Bind and serve until the process exits.
    pub async fn run(&self) -> DaemonResult<()> {
        let addr = format!(
            "{}:{}",
            self.state.config.server.http_addr, self.state.config.server.http_port
        );
        let addr: std::net::SocketAddr = addr
            .parse()
            .map_err(|e| DaemonError::ServerError(format!("Invalid address: {}", e)))?;

        let state = self.state.clone();
        let make_svc = make_service_fn(move |_conn| {
            let state = state.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let state = state.clone();
                    async move {
                        let response = route(state, req).await;
                        Ok::<_, hyper::Error>(response)
                    }
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_svc);
        info!("HTTP server listening on http://{}", addr);
        server
            .await
            .map_err(|e| DaemonError::ServerError(format!("HTTP server error: {}", e)))
    }
}

/// Top-level router. Mutating endpoints require the bearer token when one
/// is configured; reads and webhook ingestion (which has its own signature
/// check) do not.
async fn route(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    state.metrics.http_requests.inc();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = QueryParams::parse(req.uri().query());

    let mutating = matches!(method, Method::POST | Method::PUT | Method::DELETE)
        && path != "/webhooks/tracker";
    if mutating {
        if let Err(e) = check_auth(&state, &req) {
            return error_response(e);
        }
    }

    let result = dispatch(state, req, &method, &path, &query).await;
    match result {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn dispatch(
    state: Arc<AppState>,
    req: Request<Body>,
    method: &Method,
    path: &str,
    query: &QueryParams,
) -> DaemonResult<Response<Body>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        // Health and metrics
        (&Method::GET, ["health"]) => json_response(handlers::handle_health(&state).await),
        (&Method::GET, ["health", "agents"]) => {
            json_response(handlers::handle_health_agents(&state).await)
        }
        (&Method::GET, ["metrics"]) => {
            if !state.config.server.enable_metrics {
                return Err(DaemonError::NotFound("metrics disabled".to_string()));
            }
            let body = state.metrics.gather()?;
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Body::from(body))
                .map_err(|e| DaemonError::ServerError(e.to_string()))
        }

        // Analyze entry points
        (&Method::POST, ["analyze"]) => {
            let boundary = req
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .and_then(|ct| multer::parse_boundary(ct).ok())
                .ok_or_else(|| {
                    DaemonError::BadRequest("expected multipart/form-data".to_string())
                })?;
            let multipart = multer::Multipart::new(req.into_body(), boundary);
            json_response(handlers::handle_analyze(&state, multipart).await?)
        }
        (&Method::GET, ["analyze", task_id]) => {
            let task_id = parse_task_id(task_id)?;
            json_response(handlers::handle_analyze_status(&state, task_id).await?)
        }

        // Tasks
        (&Method::POST, ["tasks"]) => {
            let body: handlers::CreateTaskBody = read_json(req).await?;
            json_response(handlers::handle_create_task(&state, body).await?)
        }
        (&Method::GET, ["tasks"]) => {
            json_response(handlers::handle_list_tasks(&state, query).await?)
        }
        (&Method::GET, ["tasks", task_id]) => {
            let task_id = parse_task_id(task_id)?;
            json_response(handlers::handle_get_task(&state, task_id).await?)
        }
        (&Method::GET, ["tasks", task_id, "stream"]) => {
            let task_id = parse_task_id(task_id)?;
            stream_task_progress(state.clone(), task_id).await
        }
        (&Method::GET, ["tasks", task_id, "result"]) => {
            let task_id = parse_task_id(task_id)?;
            json_response(handlers::handle_task_result(&state, task_id).await?)
        }
        (&Method::POST, ["tasks", task_id, "cancel"]) => {
            let task_id = parse_task_id(task_id)?;
            json_response(handlers::handle_cancel_task(&state, task_id).await?)
        }
        (&Method::POST, ["admin", "workers"]) => {
            let body: handlers::SetWorkersBody = read_json(req).await?;
            json_response(handlers::handle_set_workers(&state, body))
        }

        // Issues
        (&Method::GET, ["issues"]) => {
            json_response(handlers::handle_list_issues(&state, query).await?)
        }
        (&Method::GET, ["issues", record_id]) => {
            json_response(handlers::handle_get_issue(&state, record_id).await?)
        }
        (&Method::DELETE, ["issues", record_id]) => {
            json_response(handlers::handle_delete_issue(&state, record_id).await?)
        }
        (&Method::POST, ["issues", record_id, "escalate"]) => {
            json_response(handlers::handle_escalate_issue(&state, record_id).await?)
        }

        // Rules
        (&Method::GET, ["rules"]) => json_response(handlers::handle_list_rules(&state)),
        (&Method::POST, ["rules", "reload"]) => {
            json_response(handlers::handle_reload_rules(&state)?)
        }
        (&Method::POST, ["rules"]) => {
            let body: handlers::CreateRuleBody = read_json(req).await?;
            json_response(handlers::handle_create_rule(&state, body)?)
        }
        (&Method::GET, ["rules", id]) => json_response(handlers::handle_get_rule(&state, id)?),
        (&Method::PUT, ["rules", id]) => {
            let patch: triage_core::rules::RulePatch = read_json(req).await?;
            json_response(handlers::handle_update_rule(&state, id, patch)?)
        }
        (&Method::DELETE, ["rules", id]) => {
            json_response(handlers::handle_delete_rule(&state, id)?)
        }

        // Webhook ingestion
        (&Method::POST, ["webhooks", "tracker"]) => {
            let signature = req
                .headers()
                .get("x-tracker-signature")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body = hyper::body::to_bytes(req.into_body())
                .await
                .map_err(|e| DaemonError::BadRequest(e.to_string()))?;
            json_response(
                handlers::handle_tracker_webhook(&state, &body, signature.as_deref()).await?,
            )
        }

        _ => Err(DaemonError::NotFound(format!("{} {}", method, path))),
    }
}

fn check_auth(state: &AppState, req: &Request<Body>) -> DaemonResult<()> {
    let Some(expected) = &state.config.server.auth_token else {
        return Ok(());
    };
    let provided = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer_token);
    match provided {
        Some(token) if token == *expected => Ok(()),
        _ => Err(DaemonError::Unauthorized),
    }
}

fn parse_bearer_token(header: &str) -> Option<String> {
    let trimmed = header.trim();
    let mut parts = trimmed.splitn(2, ' ');
    let scheme = parts.next()?.to_ascii_lowercase();
    if scheme != "bearer" {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn parse_task_id(raw: &str) -> DaemonResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| DaemonError::BadRequest(format!("invalid task id: {}", raw)))
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> DaemonResult<T> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| DaemonError::BadRequest(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| DaemonError::BadRequest(format!("body: {}", e)))
}

fn json_response<T: Serialize>(data: T) -> DaemonResult<Response<Body>> {
    let body = serde_json::to_string(&data)
        .map_err(|e| DaemonError::ServerError(e.to_string()))?;
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| DaemonError::ServerError(e.to_string()))
}

fn error_response(error: DaemonError) -> Response<Body> {
    if error.status() >= 500 {
        error!(error = %error, "Request failed");
    }
    let body = serde_json::json!({ "error": error.to_string() }).to_string();
    Response::builder()
        .status(StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from("internal error")))
}
