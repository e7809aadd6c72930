use actix_cors::Cors;
use actix_web::{
    delete, get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use futures::StreamExt;
use graphcore::{
    validator, ApprovalSignal, FlowError, Graph, NodeTypeRegistry, PortValues, RunId, RunStatus,
    ValidationIssue,
};
use graphruntime::{ExecutorRegistry, GraphRuntime, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Application state shared across handlers
struct AppState {
    runtime: Arc<GraphRuntime>,
}

/// Request body for starting a run
#[derive(Debug, Deserialize)]
struct RunRequest {
    graph: Graph,
    #[serde(default)]
    inputs: PortValues,
}

#[derive(Debug, Deserialize)]
struct NodesQuery {
    category: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunCreated {
    run_id: RunId,
    status: RunStatus,
}

#[derive(Debug, Serialize)]
struct ValidationResponse {
    valid: bool,
    issues: Vec<ValidationIssue>,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    issues: Vec<ValidationIssue>,
}

fn error_response(e: FlowError) -> HttpResponse {
    let message = e.to_string();
    match e {
        FlowError::Validation(issues) => HttpResponse::BadRequest().json(ErrorResponse {
            error: message,
            issues,
        }),
        FlowError::RunNotFound(_) => HttpResponse::NotFound().json(ErrorResponse {
            error: message,
            issues: Vec::new(),
        }),
        FlowError::NotAwaitingApproval { .. }
        | FlowError::AmbiguousApproval { .. }
        | FlowError::RunActive(_) => {
            HttpResponse::Conflict().json(ErrorResponse {
                error: message,
                issues: Vec::new(),
            })
        }
        other => {
            error!("Request failed: {}", other);
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: message,
                issues: Vec::new(),
            })
        }
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "graphserver"
    }))
}

/// Node catalog, optionally restricted to one category
#[get("/api/nodes")]
async fn list_node_types(
    data: web::Data<AppState>,
    query: web::Query<NodesQuery>,
) -> ActixResult<impl Responder> {
    let types = data.runtime.types();
    let nodes: Vec<_> = types.list(query.category.as_deref()).collect();
    Ok(HttpResponse::Ok().json(nodes))
}

#[post("/api/graphs/validate")]
async fn validate_graph(
    data: web::Data<AppState>,
    graph: web::Json<Graph>,
) -> ActixResult<impl Responder> {
    let issues = data.runtime.validate(&graph);
    Ok(HttpResponse::Ok().json(ValidationResponse {
        valid: validator::is_runnable(&issues),
        issues,
    }))
}

/// Submit a graph for execution
#[post("/api/runs")]
async fn create_run(
    data: web::Data<AppState>,
    req: web::Json<RunRequest>,
) -> ActixResult<impl Responder> {
    let RunRequest { graph, inputs } = req.into_inner();
    match data.runtime.submit(graph, inputs).await {
        Ok(run_id) => {
            info!("Started run {}", run_id);
            let status = data.runtime.status(run_id).await.unwrap_or(RunStatus::Pending);
            Ok(HttpResponse::Created().json(RunCreated { run_id, status }))
        }
        Err(e) => Ok(error_response(e)),
    }
}

#[get("/api/runs")]
async fn list_runs(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let runs: Vec<_> = data
        .runtime
        .list_runs()
        .await
        .into_iter()
        .map(|(run_id, status)| serde_json::json!({"runId": run_id, "status": status}))
        .collect();
    Ok(HttpResponse::Ok().json(runs))
}

/// Full run record: status, node states and bindings
#[get("/api/runs/{id}")]
async fn get_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    match data.runtime.snapshot(path.into_inner()).await {
        Ok(record) => Ok(HttpResponse::Ok().json(record)),
        Err(e) => Ok(error_response(e)),
    }
}

/// Events published so far, in order
#[get("/api/runs/{id}/events")]
async fn run_events(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    match data.runtime.event_log(path.into_inner()).await {
        Ok(events) => Ok(HttpResponse::Ok().json(events)),
        Err(e) => Ok(error_response(e)),
    }
}

/// WebSocket: replay the run's events, then follow it live until it ends
#[get("/api/runs/{id}/events/ws")]
async fn run_events_ws(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<HttpResponse> {
    let run_id = path.into_inner();
    let events = match data.runtime.events(run_id).await {
        Ok(events) => events,
        Err(e) => return Ok(error_response(e)),
    };
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected to run {}", run_id);

    actix_web::rt::spawn(async move {
        let mut events = Box::pin(events);
        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        Some(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client for run {} disconnected", run_id);
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// Deliver an approval decision to a waiting node
#[post("/api/runs/{id}/resume")]
async fn resume_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    signal: web::Json<ApprovalSignal>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.runtime.resume(run_id, signal.into_inner()).await {
        Ok(node_id) => {
            info!("Run {} resumed at {}", run_id, node_id);
            Ok(HttpResponse::Ok().json(serde_json::json!({"runId": run_id, "nodeId": node_id})))
        }
        Err(e) => Ok(error_response(e)),
    }
}

#[post("/api/runs/{id}/cancel")]
async fn cancel_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.runtime.cancel(run_id).await {
        Ok(()) => Ok(HttpResponse::Accepted().json(serde_json::json!({"runId": run_id}))),
        Err(e) => Ok(error_response(e)),
    }
}

/// Drop a finished run from the runtime
#[delete("/api/runs/{id}")]
async fn delete_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.runtime.forget(run_id).await {
        Ok(record) => {
            info!("Run {} removed", run_id);
            Ok(HttpResponse::Ok().json(serde_json::json!({"runId": run_id, "status": record.status})))
        }
        Err(e) => Ok(error_response(e)),
    }
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_node_types)
        .service(validate_graph)
        .service(create_run)
        .service(list_runs)
        .service(get_run)
        .service(run_events)
        .service(run_events_ws)
        .service(resume_run)
        .service(cancel_run)
        .service(delete_run);
}

/// Runtime with the standard node library
///
/// Host-supplied kinds (agents, tools, memory, ...) echo their input unless
/// `GRAPH_ECHO_EXTERNAL` is set to `0` or `false`.
fn build_runtime(config: RuntimeConfig) -> anyhow::Result<GraphRuntime> {
    let mut types = NodeTypeRegistry::new();
    let mut executors = ExecutorRegistry::new();
    graphnodes::register_all(&mut types, &mut executors)?;

    let echo = std::env::var("GRAPH_ECHO_EXTERNAL")
        .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false"))
        .unwrap_or(true);
    if echo {
        graphnodes::register_echo_for_external(&types, &mut executors);
    }

    Ok(GraphRuntime::with_config(Arc::new(types), executors, config))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting graph server");

    let runtime = build_runtime(RuntimeConfig::from_env())?;
    info!(
        "Runtime initialized with {} node types",
        runtime.types().len()
    );

    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
