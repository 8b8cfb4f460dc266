//! Embedded control plane: an axum service bound to an ephemeral local port
//! for the lifetime of one scenario run.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use thiserror::Error;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::{debug, warn};

use super::db::{ControlPlaneDb, DbError};
use crate::protocol::{
    CommandsResponse, ErrorBody, HealthReport, HeartbeatRequest, IssueCommandRequest,
    ListNodesResponse, RegisterNodeRequest, unix_millis,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind control plane listener")]
    Bind(#[source] std::io::Error),
}

/// Running control-plane instance.
pub struct ControlPlane {
    db: Arc<ControlPlaneDb>,
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), std::io::Error>>>,
}

impl ControlPlane {
    /// Binds an ephemeral localhost port and serves the registry.
    pub async fn start(db: Arc<ControlPlaneDb>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(ServerError::Bind)?;
        let addr = listener.local_addr().map_err(ServerError::Bind)?;

        let app = router(Arc::clone(&db));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        debug!(%addr, "control plane listening");
        Ok(Self {
            db,
            addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    #[must_use]
    pub fn db(&self) -> Arc<ControlPlaneDb> {
        Arc::clone(&self.db)
    }

    /// Graceful shutdown with a bounded grace period.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(error))) => warn!(%error, "control plane server exited with error"),
            Ok(Err(join_error)) => warn!(%join_error, "control plane server task failed"),
            Err(_) => {
                warn!("control plane shutdown grace expired, aborting server task");
                task.abort();
            }
        }
    }
}

fn router(db: Arc<ControlPlaneDb>) -> Router {
    Router::new()
        .route("/api/v1/nodes", post(register_node).get(list_nodes))
        .route("/api/v1/nodes/:id", get(get_node))
        .route("/api/v1/nodes/:id/heartbeat", post(heartbeat))
        .route("/api/v1/nodes/:id/health", post(report_health))
        .route(
            "/api/v1/nodes/:id/commands",
            post(issue_command).get(poll_commands),
        )
        .with_state(db)
}

async fn register_node(
    State(db): State<Arc<ControlPlaneDb>>,
    Json(payload): Json<RegisterNodeRequest>,
) -> Response {
    match db.register(payload.spec) {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(error) => db_error_response(&error),
    }
}

async fn list_nodes(State(db): State<Arc<ControlPlaneDb>>) -> Response {
    let nodes = db.list();
    (StatusCode::OK, Json(ListNodesResponse { nodes })).into_response()
}

async fn get_node(State(db): State<Arc<ControlPlaneDb>>, Path(id): Path<String>) -> Response {
    match db.get(&id) {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(error) => db_error_response(&error),
    }
}

async fn heartbeat(
    State(db): State<Arc<ControlPlaneDb>>,
    Path(id): Path<String>,
    Json(payload): Json<HeartbeatRequest>,
) -> Response {
    match db.heartbeat(&id, payload.timestamp_ms) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => db_error_response(&error),
    }
}

async fn report_health(
    State(db): State<Arc<ControlPlaneDb>>,
    Path(id): Path<String>,
    Json(payload): Json<HealthReport>,
) -> Response {
    match db.report_health(&id, payload.failures) {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(error) => db_error_response(&error),
    }
}

async fn issue_command(
    State(db): State<Arc<ControlPlaneDb>>,
    Path(id): Path<String>,
    Json(payload): Json<IssueCommandRequest>,
) -> Response {
    let issued_at_ms = unix_millis(std::time::SystemTime::now());
    match db.issue_command(&id, payload.command, payload.reason, issued_at_ms) {
        Ok(command) => (StatusCode::OK, Json(command)).into_response(),
        Err(error) => db_error_response(&error),
    }
}

async fn poll_commands(State(db): State<Arc<ControlPlaneDb>>, Path(id): Path<String>) -> Response {
    match db.take_commands(&id) {
        Ok(commands) => (StatusCode::OK, Json(CommandsResponse { commands })).into_response(),
        Err(error) => db_error_response(&error),
    }
}

fn db_error_response(error: &DbError) -> Response {
    let status = match error {
        DbError::UnknownNode { .. } => StatusCode::NOT_FOUND,
        DbError::DuplicateNode { .. } => StatusCode::CONFLICT,
    };
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
        .into_response()
}
