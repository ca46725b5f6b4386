//! Saga inspection and cancellation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use saga::SagaDispatcher;
use serde::Serialize;
use step_store::{SagaData, SagaId, SagaStepMetadata, StepStore};

use crate::error::ApiError;

#[derive(Serialize)]
pub struct StepResponse {
    pub step_type: String,
    pub handler_type: String,
    pub message_id: String,
    pub parent_message_id: Option<String>,
    pub status: String,
    pub updated_at: String,
}

impl From<SagaStepMetadata> for StepResponse {
    fn from(step: SagaStepMetadata) -> Self {
        Self {
            step_type: step.step_type,
            handler_type: step.handler_type,
            message_id: step.message_id.to_string(),
            parent_message_id: step.parent_message_id.map(|id| id.to_string()),
            status: step.status.to_string(),
            updated_at: step.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_id: String,
    pub state: &'static str,
    pub failed_step_type: Option<String>,
    pub failed_handler_type: Option<String>,
    pub failure_reason: Option<String>,
    pub compensation_failures: Vec<String>,
    pub steps: Vec<StepResponse>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub saga_id: String,
    pub cancelled_steps: usize,
}

fn state_label(data: &SagaData) -> &'static str {
    if data.is_failed() {
        "failed"
    } else if data.is_completed {
        "completed"
    } else {
        "running"
    }
}

/// GET /sagas/{id}: saga data and every recorded step.
#[tracing::instrument(skip(dispatcher))]
pub async fn get<S: StepStore + Clone + 'static>(
    State(dispatcher): State<Arc<SagaDispatcher<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let store = dispatcher.store();

    let data = store
        .get_saga_data(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;
    let steps = store.query_by_saga(saga_id).await?;

    Ok(Json(SagaResponse {
        saga_id: saga_id.to_string(),
        state: state_label(&data),
        failed_step_type: data.failed_step_type,
        failed_handler_type: data.failed_handler_type,
        failure_reason: data.failure_reason,
        compensation_failures: data.compensation_failures,
        steps: steps.into_iter().map(StepResponse::from).collect(),
    }))
}

/// POST /sagas/{id}/cancel: abandons the saga's open steps.
#[tracing::instrument(skip(dispatcher))]
pub async fn cancel<S: StepStore + Clone + 'static>(
    State(dispatcher): State<Arc<SagaDispatcher<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    if dispatcher.store().get_saga_data(saga_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Saga {id} not found")));
    }

    let cancelled_steps = dispatcher.cancel_saga(saga_id).await?;
    Ok(Json(CancelResponse {
        saga_id: saga_id.to_string(),
        cancelled_steps,
    }))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    uuid::Uuid::parse_str(id)
        .map(SagaId::from_uuid)
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}
