//! HTTP server inbound adapter exposing the expense service and the
//! workflow starter.
//!
//! Mutating routes answer with a plain-text marker (`SUCCEED` or
//! `ERROR:<REASON>`) and status 200 so collaborators branch on the body.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context as AnyhowContext, Result};
use axum::{
    Form, Json, Router,
    extract::{
        Path, Query, State,
        rejection::{FormRejection, JsonRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    core::{
        domain::{Action, ContinuationToken, Expense, WorkflowRun},
        error::{Error as CoreError, Result as CoreResult},
        marker,
        ports::ExpenseService,
    },
    status_export::{RunDetailExport, RunListExport},
};

const DEFAULT_RUN_LIMIT: usize = 20;

/// Server adapter that exposes the `ExpenseService` via HTTP.
pub struct ServerAdapter {
    service: Arc<dyn ExpenseService>,
}

impl ServerAdapter {
    pub fn new(service: Arc<dyn ExpenseService>) -> Self {
        Self { service }
    }

    /// Run the HTTP server on the given address.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind expense service listener")?;
        self.run_with_listener(listener).await
    }

    /// Run the HTTP server with an existing listener (useful for tests).
    pub async fn run_with_listener(self, listener: TcpListener) -> Result<()> {
        let router = build_router(self.service);
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "expenseflow serve listening");
        } else {
            info!("expenseflow serve listening");
        }
        axum::serve(listener, router.into_make_service())
            .await
            .context("serve endpoint failed")
    }
}

type AppState = Arc<dyn ExpenseService>;

pub fn build_router(service: AppState) -> Router {
    Router::new()
        .route("/v1/healthcheck", get(healthcheck_handler))
        .route("/v1/workflow/starter", get(starter_handler))
        .route("/v1/workflow/runs", get(list_runs_handler))
        .route("/v1/workflow/runs/{workflow_id}", get(run_detail_handler))
        .route(
            "/v1/workflow/registerCallback/{id}",
            post(register_callback_handler),
        )
        .route(
            "/v1/expenses",
            get(list_expenses_handler).post(create_expense_handler),
        )
        .route("/v1/expenses/{id}", get(expense_detail_handler))
        .route("/v1/expenses/{id}/{action}", get(action_handler))
        .with_state(service)
}

/// Wire shape of the starter response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StarterResponse {
    pub workflow_run: WorkflowRun,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpenseListResponse {
    pub expenses: Vec<Expense>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpenseResponse {
    pub expense: Expense,
}

#[derive(Deserialize)]
struct CallbackForm {
    task_token: String,
}

#[derive(Deserialize)]
struct CreateExpenseRequest {
    id: String,
}

#[derive(Deserialize)]
struct RunListQuery {
    limit: Option<usize>,
}

fn marker_response(result: CoreResult<()>) -> Response {
    (StatusCode::OK, marker::render(&result)).into_response()
}

fn error_json(status: StatusCode, err: &CoreError) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": marker::render_error(err),
            "message": err.to_string(),
        })),
    )
        .into_response()
}

async fn healthcheck_handler(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.health())
}

async fn starter_handler(State(service): State<AppState>) -> Response {
    match service.start_run().await {
        Ok(run) => {
            info!(
                workflow_id = %run.workflow_id,
                run_id = %run.run_id,
                "Started workflow via HTTP"
            );
            Json(StarterResponse { workflow_run: run }).into_response()
        }
        Err(err) => {
            warn!(error = %err, "Failed to start workflow");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, &err)
        }
    }
}

async fn list_runs_handler(
    State(service): State<AppState>,
    Query(query): Query<RunListQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).max(1);
    match service.list_runs(limit).await {
        Ok(runs) => Json(RunListExport::from_runs(&runs)).into_response(),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

async fn run_detail_handler(
    State(service): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Response {
    match service.get_run(&workflow_id).await {
        Ok(Some(run)) => Json(RunDetailExport::from_run(&run)).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, &CoreError::NotFound(workflow_id)),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

async fn register_callback_handler(
    State(service): State<AppState>,
    Path(id): Path<String>,
    form: Result<Form<CallbackForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return marker_response(Err(CoreError::InvalidInput("malformed callback form".into())));
    };
    let result = service
        .register_callback(&id, ContinuationToken::from(form.task_token))
        .await;
    if let Err(err) = &result {
        warn!(expense_id = %id, error = %err, "Callback registration refused");
    }
    marker_response(result)
}

async fn create_expense_handler(
    State(service): State<AppState>,
    body: Result<Json<CreateExpenseRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return marker_response(Err(CoreError::InvalidInput("malformed create request".into())));
    };
    marker_response(service.create_expense(&request.id).await)
}

async fn list_expenses_handler(State(service): State<AppState>) -> Response {
    match service.list_expenses().await {
        Ok(expenses) => Json(ExpenseListResponse { expenses }).into_response(),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

async fn expense_detail_handler(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match service.get_expense(&id).await {
        Ok(expense) => Json(ExpenseResponse { expense }).into_response(),
        Err(err @ CoreError::NotFound(_)) => error_json(StatusCode::NOT_FOUND, &err),
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

/// The reply reflects the state change only; notification trouble is logged.
async fn action_handler(
    State(service): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> Response {
    let action: Action = match action.parse() {
        Ok(action) => action,
        Err(err) => return marker_response(Err(err)),
    };
    marker_response(service.apply_action(&id, action).await.map(|_| ()))
}
