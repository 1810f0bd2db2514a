//! Status API of a node.
//!
//! `GET /executions` lists the executions the node knows about as
//! JSON and `GET /metrics` renders the prometheus registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Json;
use axum::Router;

use crate::config::env_var;
use crate::errors::ExecutionError;
use crate::execution::context::ExecutionSummary;
use crate::job_execution_service::JobExecutionService;
use crate::metrics::gather_text;

const DEFAULT_PORT: u16 = 3030;

/// Port from `FLOWCORE_API_PORT`.
pub fn api_port() -> Result<u16, ExecutionError> {
    Ok(env_var("FLOWCORE_API_PORT")?.unwrap_or(DEFAULT_PORT))
}

pub fn router(service: Arc<JobExecutionService>) -> Router {
    Router::new()
        .route("/executions", get(get_executions))
        .route("/metrics", get(get_metrics))
        .layer(Extension(service))
}

/// Serve the status API until the server fails.
pub async fn run_webserver(service: Arc<JobExecutionService>) -> Result<(), ExecutionError> {
    let port = api_port()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting status API server on {addr:?}");

    axum::Server::bind(&addr)
        .serve(router(service).into_make_service())
        .await
        .map_err(|err| {
            ExecutionError::Config(format!(
                "unable to run status API server at port {port}: {err}"
            ))
        })
}

async fn get_executions(
    Extension(service): Extension<Arc<JobExecutionService>>,
) -> Json<Vec<ExecutionSummary>> {
    Json(service.executions())
}

async fn get_metrics() -> Result<String, (StatusCode, String)> {
    gather_text().map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

#[tokio::test]
async fn executions_are_listed() {
    use crate::cluster::MembershipProvider;
    use crate::execution::ExecutionId;
    use crate::execution::JobId;
    use crate::job_execution_service::test_cluster::TestCluster;

    let cluster = TestCluster::new(1);
    let node = cluster.nodes[0].clone();
    let Json(before) = get_executions(Extension(node.clone())).await;
    assert!(before.is_empty());

    node.init_execution(
        JobId(1),
        ExecutionId(2),
        &cluster.master(),
        cluster.view.member_list_version(),
        &cluster.members,
        cluster.plan(0),
    )
    .unwrap();
    let Json(after) = get_executions(Extension(node.clone())).await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].execution_id, ExecutionId(2));
    node.complete_execution(ExecutionId(2), None);
}

#[tokio::test]
async fn metrics_render() {
    crate::metrics::initialize_metrics().unwrap();
    assert!(get_metrics().await.is_ok());
}
