use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::{
    BatchRequest, HealthResponse, LedgerResponse, PrepareResponse, RecordDeploymentRequest,
    SignatureListResponse, WorkflowResponse,
};
use crate::error::{ProvisionError, ValidationError};
use crate::provision::kind::ComponentKind;
use crate::provision::orchestrator::{RecheckOutcome, StepOutcome};
use crate::provision::preparer::Operation;
use crate::provision::registry::RegistryView;
use crate::provision::resolver::KindStatus;
use crate::provision::sequencer::Sequencer;
use crate::provision::signer::SignatureResponse;
use crate::provision::types::{Address, ComponentInstance, TransactionRef};
use crate::provision::workflow::{BatchReport, WorkflowState};
use crate::runtime::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

fn claim_workflow(state: &AppState) -> Result<OwnedMutexGuard<WorkflowState>, ApiError> {
    state
        .workflow
        .clone()
        .try_lock_owned()
        .map_err(|_| ApiError(ProvisionError::WorkflowBusy))
}

/// Await a workflow task. The task keeps running if the client goes away.
async fn join_workflow<T>(job: JoinHandle<Result<T, ProvisionError>>) -> ApiResult<T> {
    let result = job.await.map_err(|e| {
        tracing::error!("Workflow task failed: {}", e);
        ProvisionError::WorkflowAborted {
            reason: e.to_string(),
        }
    })?;
    Ok(Json(result?))
}

pub(super) async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        network: state.provisioner.registry().network().to_string(),
        signer: state.signer.label(),
        operator: state.operator.clone(),
    })
}

pub(super) async fn prepare_handler(
    State(state): State<Arc<AppState>>,
    Path(operation): Path<String>,
    body: Bytes,
) -> ApiResult<PrepareResponse> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body).map_err(|e| ValidationError::InvalidValue {
            field: "body".to_string(),
            message: e.to_string(),
        })?
    };
    let op = Operation::from_named(&operation, body)?;

    match state.provisioner.prepare(&op, &state.operator).await {
        Ok(payload) => Ok(Json(PrepareResponse::Prepared { payload })),
        Err(ProvisionError::DuplicateInitialization { target, detail, .. }) => {
            Ok(Json(PrepareResponse::AlreadyApplied {
                reason: format!("{target}: {detail}"),
            }))
        }
        Err(e) => Err(e.into()),
    }
}

pub(super) async fn components_list_handler(
    State(state): State<Arc<AppState>>,
) -> Json<RegistryView> {
    Json(state.provisioner.registry().snapshot().await)
}

pub(super) async fn components_record_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecordDeploymentRequest>,
) -> Result<(StatusCode, Json<ComponentInstance>), ApiError> {
    let address = Address::parse_actor("address", &req.address)?;
    let deployer = match &req.deployer {
        Some(raw) => Address::parse_actor("deployer", raw)?,
        None => state.operator.clone(),
    };
    let transaction = req
        .transaction
        .as_deref()
        .map(TransactionRef::new)
        .transpose()?;

    let registry = state.provisioner.registry();
    let _guard = registry.begin_deployment(&deployer, req.kind)?;
    let instance = registry
        .register(
            req.kind,
            address,
            deployer,
            req.instance_name.as_deref(),
            transaction,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

pub(super) async fn dependency_status_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> ApiResult<KindStatus> {
    let kind: ComponentKind = kind.parse()?;
    let view = state.provisioner.registry().snapshot().await;
    Ok(Json(state.provisioner.graph().kind_status(kind, &view)))
}

pub(super) async fn initialize_batch_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<BatchReport> {
    let mut workflow = claim_workflow(&state)?;
    let job = tokio::spawn(async move {
        let result = Sequencer::new(&state.provisioner)
            .run(&req.steps, &state.operator, &mut workflow)
            .await;
        state.publish(&workflow);
        result
    });
    join_workflow(job).await
}

pub(super) async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> ApiResult<StepOutcome> {
    let kind: ComponentKind = kind.parse()?;
    let mut workflow = claim_workflow(&state)?;
    let job = tokio::spawn(async move {
        let result = state
            .provisioner
            .deploy(kind, &state.operator, &mut workflow)
            .await;
        state.publish(&workflow);
        result
    });
    join_workflow(job).await
}

pub(super) async fn ledger_handler(State(state): State<Arc<AppState>>) -> ApiResult<LedgerResponse> {
    let records = state.provisioner.registry().records().await?;
    Ok(Json(LedgerResponse { records }))
}

pub(super) async fn signatures_list_handler(
    State(state): State<Arc<AppState>>,
) -> Json<SignatureListResponse> {
    Json(SignatureListResponse {
        signer: state.signer.label(),
        requests: state
            .signer
            .desk()
            .map(|desk| desk.pending())
            .unwrap_or_default(),
    })
}

pub(super) async fn signature_respond_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(response): Json<SignatureResponse>,
) -> Result<StatusCode, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ValidationError::InvalidValue {
        field: "id".to_string(),
        message: format!("'{id}' is not a signature request id"),
    })?;
    let desk = state
        .signer
        .desk()
        .ok_or(ProvisionError::UnknownSignatureRequest { id })?;
    desk.respond(id, response)?;
    Ok(StatusCode::ACCEPTED)
}

pub(super) async fn workflow_handler(State(state): State<Arc<AppState>>) -> Json<WorkflowResponse> {
    let response = match state.workflow.try_lock() {
        Ok(workflow) => WorkflowResponse {
            running: false,
            state: workflow.clone(),
        },
        Err(_) => WorkflowResponse {
            running: true,
            state: state.published(),
        },
    };
    Json(response)
}

pub(super) async fn recheck_handler(
    State(state): State<Arc<AppState>>,
    Path(transaction): Path<String>,
) -> ApiResult<RecheckOutcome> {
    let transaction = TransactionRef::new(&transaction)?;
    let mut workflow = claim_workflow(&state)?;
    let job = tokio::spawn(async move {
        let result = state
            .provisioner
            .recheck(&transaction, &mut workflow)
            .await;
        state.publish(&workflow);
        result
    });
    join_workflow(job).await
}
