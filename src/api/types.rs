//! Request and response bodies.

use serde::{Deserialize, Serialize};

use crate::provision::kind::ComponentKind;
use crate::provision::ledger::DeploymentRecord;
use crate::provision::preparer::PreparedTransaction;
use crate::provision::signer::SignatureRequest;
use crate::provision::types::Address;
use crate::provision::workflow::{InitializationStep, WorkflowState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub network: String,
    pub signer: &'static str,
    pub operator: Address,
}

/// Result of `POST /prepare/{operation}`.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PrepareResponse {
    Prepared { payload: PreparedTransaction },
    /// The effect is already in place; nothing needs signing.
    AlreadyApplied { reason: String },
}

/// A deployment confirmed outside the provisioner.
#[derive(Debug, Deserialize)]
pub struct RecordDeploymentRequest {
    pub kind: ComponentKind,
    pub address: String,
    /// Defaults to the configured operator.
    #[serde(default)]
    pub deployer: Option<String>,
    /// Must equal the next ordinal name when given.
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub transaction: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub steps: Vec<InitializationStep>,
}

#[derive(Debug, Serialize)]
pub struct LedgerResponse {
    pub records: Vec<DeploymentRecord>,
}

#[derive(Debug, Serialize)]
pub struct SignatureListResponse {
    pub signer: &'static str,
    pub requests: Vec<SignatureRequest>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    /// True while a batch, deploy or re-check holds the workflow.
    pub running: bool,
    pub state: WorkflowState,
}
