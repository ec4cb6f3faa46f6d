use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::document::{DocumentId, DocumentSnapshot};
use crate::error::AppError;
use crate::pipeline::assembler::SourcePdfProvider;
use crate::pipeline::closing::closing_view;
use crate::pipeline::credential::CredentialStore;
use crate::pipeline::interpreter::ErrorDetail;
use crate::pipeline::ledger::{DocumentState, DocumentStatus, LedgerStore};
use crate::pipeline::orchestrator::{FiscalOrchestrator, OrchestratorError, PostOutcome};

/// Externally visible state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentView {
    pub document_id: DocumentId,
    pub state: DocumentState,
    pub codec: Option<String>,
    pub authority_ref: Option<String>,
    pub errors: Vec<ErrorDetail>,
    pub package: Option<PackageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageRef {
    pub name: String,
    pub content_hash: String,
}

impl DocumentView {
    fn new(status: DocumentStatus, package: Option<PackageRef>) -> Self {
        Self {
            document_id: status.document_id,
            state: status.state,
            codec: status.codec.map(|codec| codec.to_string()),
            authority_ref: status.authority_ref,
            errors: status.errors,
            package,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClosingQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

type Orchestrator<L, P> = Arc<FiscalOrchestrator<L, P>>;

/// Posting hook and operator endpoints.
pub fn document_router<L, P>(orchestrator: Orchestrator<L, P>) -> Router
where
    L: LedgerStore + CredentialStore + 'static,
    P: SourcePdfProvider + 'static,
{
    Router::new()
        .route("/api/v1/documents", post(post_handler::<L, P>))
        .route("/api/v1/documents/:document_id", get(status_handler::<L, P>))
        .route(
            "/api/v1/documents/:document_id/attempts",
            get(attempts_handler::<L, P>),
        )
        .route(
            "/api/v1/documents/:document_id/cancel",
            post(cancel_handler::<L, P>),
        )
        .route(
            "/api/v1/documents/:document_id/package",
            get(package_handler::<L, P>),
        )
        .route("/api/v1/closing", get(closing_handler::<L, P>))
        .with_state(orchestrator)
}

/// Posts the snapshot and, when it was queued, processes it inline.
pub(crate) async fn post_handler<L, P>(
    State(orchestrator): State<Orchestrator<L, P>>,
    axum::Json(snapshot): axum::Json<DocumentSnapshot>,
) -> Response
where
    L: LedgerStore + CredentialStore + 'static,
    P: SourcePdfProvider + 'static,
{
    let outcome = match orchestrator.post(&snapshot) {
        Ok(outcome) => outcome,
        Err(error) => return error_response(error),
    };
    match outcome {
        PostOutcome::AlreadyAccepted { authority_ref } => {
            let payload = json!({
                "document_id": snapshot.id,
                "state": DocumentState::Accepted,
                "authority_ref": authority_ref,
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        PostOutcome::NotSent(status) | PostOutcome::InFlight(status) => {
            view_response(&orchestrator, StatusCode::ACCEPTED, status)
        }
        PostOutcome::Queued(_) => {
            if let Err(error) = orchestrator.process(&snapshot.id).await {
                return error_response(error);
            }
            match orchestrator.status(&snapshot.id) {
                Ok(status) => view_response(&orchestrator, StatusCode::ACCEPTED, status),
                Err(error) => error_response(error),
            }
        }
    }
}

pub(crate) async fn status_handler<L, P>(
    State(orchestrator): State<Orchestrator<L, P>>,
    Path(document_id): Path<String>,
) -> Response
where
    L: LedgerStore + CredentialStore + 'static,
    P: SourcePdfProvider + 'static,
{
    match orchestrator.status(&DocumentId(document_id)) {
        Ok(status) => view_response(&orchestrator, StatusCode::OK, status),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn attempts_handler<L, P>(
    State(orchestrator): State<Orchestrator<L, P>>,
    Path(document_id): Path<String>,
) -> Response
where
    L: LedgerStore + CredentialStore + 'static,
    P: SourcePdfProvider + 'static,
{
    let id = DocumentId(document_id);
    if let Err(error) = orchestrator.status(&id) {
        return error_response(error);
    }
    match orchestrator.attempts(&id) {
        Ok(attempts) => (StatusCode::OK, axum::Json(attempts)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn cancel_handler<L, P>(
    State(orchestrator): State<Orchestrator<L, P>>,
    Path(document_id): Path<String>,
    axum::Json(request): axum::Json<CancelRequest>,
) -> Response
where
    L: LedgerStore + CredentialStore + 'static,
    P: SourcePdfProvider + 'static,
{
    let reason = request
        .reason
        .unwrap_or_else(|| "cancelled by operator".to_string());
    match orchestrator.cancel(&DocumentId(document_id), &reason) {
        Ok(status) => view_response(&orchestrator, StatusCode::OK, status),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn package_handler<L, P>(
    State(orchestrator): State<Orchestrator<L, P>>,
    Path(document_id): Path<String>,
) -> Response
where
    L: LedgerStore + CredentialStore + 'static,
    P: SourcePdfProvider + 'static,
{
    match orchestrator.package(&DocumentId(document_id.clone())) {
        Ok(Some((package, bytes))) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/zip".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", package.name),
                ),
                (header::ETAG, format!("\"{}\"", package.content_hash)),
            ],
            bytes,
        )
            .into_response(),
        Ok(None) => {
            let payload = json!({
                "error": format!("document {document_id} has no accepted attempt"),
            });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
        Err(error) => error_response(error),
    }
}

pub(crate) async fn closing_handler<L, P>(
    State(orchestrator): State<Orchestrator<L, P>>,
    Query(query): Query<ClosingQuery>,
) -> Response
where
    L: LedgerStore + CredentialStore + 'static,
    P: SourcePdfProvider + 'static,
{
    if query.from > query.to {
        let payload = json!({ "error": "closing period starts after it ends" });
        return (StatusCode::BAD_REQUEST, axum::Json(payload)).into_response();
    }
    match closing_view(
        orchestrator.ledger().as_ref(),
        orchestrator.registry(),
        query.from,
        query.to,
    ) {
        Ok(view) => (StatusCode::OK, axum::Json(view)).into_response(),
        Err(error) => error_response(error.into()),
    }
}

fn view_response<L, P>(
    orchestrator: &FiscalOrchestrator<L, P>,
    code: StatusCode,
    status: DocumentStatus,
) -> Response
where
    L: LedgerStore + CredentialStore + 'static,
    P: SourcePdfProvider + 'static,
{
    let package = match orchestrator.ledger().package(&status.document_id) {
        Ok(package) => package.map(|package| PackageRef {
            name: package.name,
            content_hash: package.content_hash,
        }),
        Err(error) => return error_response(error.into()),
    };
    (code, axum::Json(DocumentView::new(status, package))).into_response()
}

fn error_response(error: OrchestratorError) -> Response {
    AppError::from(error).into_response()
}
