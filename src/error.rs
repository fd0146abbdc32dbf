//! Error types for the provisioner.

use std::time::Duration;

use serde::Serialize;

use crate::provision::kind::ComponentKind;
use crate::provision::types::{Address, TransactionRef};

/// Top-level error type for the binary and runtime wiring.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Dependency graph error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Deployment ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt ledger entry at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("Ledger record {sequence} cannot be applied: {reason}")]
    InvalidRecord { sequence: u64, reason: String },

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Ledger read failures (RPC endpoint, malformed responses).
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("RPC {method} failed: {reason}")]
    Rpc { method: String, reason: String },

    #[error("Invalid response to {method}: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Outcomes of the external signer other than a transaction reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignerError {
    #[error("Signer declined the request: {reason}")]
    Rejected { reason: String },

    #[error("Connected signer {actual} does not match required signer {expected}")]
    Mismatch { expected: Address, actual: Address },

    #[error("Signer {actual} broadcast {transaction} in place of required signer {expected}")]
    MismatchedSubmission {
        expected: Address,
        actual: Address,
        transaction: TransactionRef,
    },

    #[error("Signer unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Input shape errors. Raised before any network interaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} cannot be empty")]
    EmptyField { field: String },

    #[error("{field} is not a valid address: '{value}'")]
    InvalidAddress { field: String, value: String },

    #[error("{field} cannot be the zero address")]
    ZeroAddress { field: String },

    #[error("{field} must be a positive integer")]
    NonPositive { field: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown component kind '{0}'")]
    UnknownKind(String),

    #[error("Unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("Unknown component instance '{name}'")]
    UnknownInstance { name: String },

    #[error("Instance '{name}' is a {actual}, expected {expected}")]
    KindMismatch {
        name: String,
        expected: ComponentKind,
        actual: ComponentKind,
    },

    #[error("No deployed {kind} instance to target")]
    NoInstance { kind: ComponentKind },

    #[error("Instance '{name}' has been retired")]
    RetiredInstance { name: String },

    #[error("No bytecode artifact configured for {name}")]
    MissingArtifact { name: String },

    #[error("Identity {address} was not deployed through this provisioner")]
    UnknownIdentity { address: Address },

    #[error("Step {step} is not allowed in an initialization batch: {reason}")]
    InvalidStep { step: usize, reason: String },

    #[error("Step {step} depends on {dependency}, which only step {producer} provides; reorder the batch")]
    Ordering {
        step: usize,
        dependency: String,
        producer: usize,
    },

    #[error("Step {step} has unmet dependencies: {}", .unmet.join(", "))]
    UnmetDependencies { step: usize, unmet: Vec<String> },
}

/// Static dependency graph misconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    #[error("Dependency cycle detected: {}", .path.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(" -> "))]
    Cycle { path: Vec<ComponentKind> },
}

/// HTTP surface startup errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway failed to start: {reason}")]
    StartupFailed { reason: String },
}

/// Errors surfaced by the provisioning workflow.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Connected signer {actual} does not match required signer {expected}; switch the signer and retry")]
    SignerMismatch { expected: Address, actual: Address },

    #[error("Signer declined the request: {reason}")]
    Rejected { reason: String },

    #[error("Transaction {transaction} reverted: {reason}")]
    ChainRevert {
        transaction: TransactionRef,
        reason: String,
    },

    #[error(
        "Transaction {transaction} not confirmed after {waited:?}; outcome unknown, it may still confirm. Re-check before retrying"
    )]
    Timeout {
        transaction: TransactionRef,
        waited: Duration,
    },

    #[error("{target} already applied: {detail}")]
    DuplicateInitialization {
        target: String,
        detail: String,
        observed_on_chain: bool,
    },

    #[error("A {kind} deployment by {operator} is already in progress")]
    DeploymentInProgress {
        kind: ComponentKind,
        operator: Address,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Chain read failed: {0}")]
    Chain(#[from] ChainError),

    #[error("Signer unavailable: {reason}")]
    SignerUnavailable { reason: String },

    #[error("Unknown transaction {transaction}")]
    UnknownTransaction { transaction: TransactionRef },

    #[error("Unknown signature request {id}")]
    UnknownSignatureRequest { id: uuid::Uuid },

    #[error("Another workflow is already running for this operator")]
    WorkflowBusy,

    #[error("Workflow task ended abnormally: {reason}")]
    WorkflowAborted { reason: String },
}

impl From<SignerError> for ProvisionError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::Rejected { reason } => Self::Rejected { reason },
            SignerError::Mismatch { expected, actual } => Self::SignerMismatch { expected, actual },
            SignerError::MismatchedSubmission {
                expected, actual, ..
            } => Self::SignerMismatch { expected, actual },
            SignerError::Unavailable { reason } => Self::SignerUnavailable { reason },
        }
    }
}

/// Error class reported to callers deciding whether to retry, skip or abort.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    SignerMismatch,
    Rejection,
    ChainRevert,
    Timeout,
    DuplicateInitialization,
    Conflict,
    Dependency,
    Ledger,
    Chain,
    SignerUnavailable,
    NotFound,
    Busy,
    Internal,
}

/// Structured error payload for API and workflow consumers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub retryable: bool,
    pub message: String,
}

impl ErrorPayload {
    fn new(kind: ErrorKind, code: &'static str, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            retryable,
            message: message.into(),
        }
    }
}

impl ProvisionError {
    /// Map a workflow error to its structured surface.
    pub fn to_error_payload(&self) -> ErrorPayload {
        let message = self.to_string();
        match self {
            Self::Validation(err) => {
                let code = match err {
                    ValidationError::UnknownInstance { .. } | ValidationError::NoInstance { .. } => {
                        "validation.unknown_instance"
                    }
                    ValidationError::Ordering { .. } => "validation.ordering",
                    ValidationError::UnmetDependencies { .. } => "validation.unmet_dependencies",
                    ValidationError::MissingArtifact { .. } => "validation.missing_artifact",
                    _ => "validation.invalid_input",
                };
                ErrorPayload::new(ErrorKind::Validation, code, false, message)
            }
            Self::SignerMismatch { .. } => ErrorPayload::new(
                ErrorKind::SignerMismatch,
                "signer.mismatch",
                true,
                message,
            ),
            Self::Rejected { .. } => {
                ErrorPayload::new(ErrorKind::Rejection, "signer.rejected", true, message)
            }
            Self::ChainRevert { .. } => {
                ErrorPayload::new(ErrorKind::ChainRevert, "chain.reverted", false, message)
            }
            Self::Timeout { .. } => ErrorPayload::new(
                ErrorKind::Timeout,
                "chain.confirmation_unknown",
                true,
                message,
            ),
            Self::DuplicateInitialization { .. } => ErrorPayload::new(
                ErrorKind::DuplicateInitialization,
                "workflow.already_applied",
                false,
                message,
            ),
            Self::DeploymentInProgress { .. } => ErrorPayload::new(
                ErrorKind::Busy,
                "workflow.deployment_in_progress",
                true,
                message,
            ),
            Self::WorkflowBusy => {
                ErrorPayload::new(ErrorKind::Busy, "workflow.busy", true, message)
            }
            Self::WorkflowAborted { .. } => {
                ErrorPayload::new(ErrorKind::Internal, "workflow.aborted", false, message)
            }
            Self::Conflict(_) => {
                ErrorPayload::new(ErrorKind::Conflict, "registry.conflict", false, message)
            }
            Self::Dependency(_) => ErrorPayload::new(
                ErrorKind::Dependency,
                "config.dependency_cycle",
                false,
                message,
            ),
            Self::Ledger(_) => {
                ErrorPayload::new(ErrorKind::Ledger, "ledger.failure", true, message)
            }
            Self::Chain(_) => ErrorPayload::new(ErrorKind::Chain, "chain.read_failed", true, message),
            Self::SignerUnavailable { .. } => ErrorPayload::new(
                ErrorKind::SignerUnavailable,
                "signer.unavailable",
                true,
                message,
            ),
            Self::UnknownTransaction { .. } => ErrorPayload::new(
                ErrorKind::NotFound,
                "workflow.unknown_transaction",
                false,
                message,
            ),
            Self::UnknownSignatureRequest { .. } => ErrorPayload::new(
                ErrorKind::NotFound,
                "signer.unknown_request",
                false,
                message,
            ),
        }
    }
}

/// Result type alias for the binary.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> Address {
        Address::parse("test", &format!("0x{}{:02x}", "00".repeat(19), last)).unwrap()
    }

    #[test]
    fn mismatch_is_distinct_and_retryable() {
        let err = ProvisionError::from(SignerError::Mismatch {
            expected: addr(1),
            actual: addr(2),
        });
        let payload = err.to_error_payload();

        assert_eq!(payload.kind, ErrorKind::SignerMismatch);
        assert_eq!(payload.code, "signer.mismatch");
        assert!(payload.retryable);
        assert!(payload.message.contains("switch the signer"));
    }

    #[test]
    fn timeout_message_says_outcome_unknown() {
        let err = ProvisionError::Timeout {
            transaction: TransactionRef::new("0xabc").unwrap(),
            waited: Duration::from_secs(30),
        };
        let payload = err.to_error_payload();

        assert_eq!(payload.kind, ErrorKind::Timeout);
        assert!(payload.message.contains("outcome unknown"));
        assert!(!payload.message.contains("failed"));
    }

    #[test]
    fn revert_is_not_retryable() {
        let err = ProvisionError::ChainRevert {
            transaction: TransactionRef::new("0xdead").unwrap(),
            reason: "execution reverted".to_string(),
        };
        let payload = err.to_error_payload();

        assert_eq!(payload.kind, ErrorKind::ChainRevert);
        assert!(!payload.retryable);
    }

    #[test]
    fn ordering_errors_get_their_own_code() {
        let err = ProvisionError::from(ValidationError::Ordering {
            step: 0,
            dependency: "instance IdentityRegistryStorage".to_string(),
            producer: 2,
        });
        let payload = err.to_error_payload();

        assert_eq!(payload.code, "validation.ordering");
        assert!(payload.message.contains("reorder"));
    }

    #[test]
    fn cycle_error_lists_path() {
        let err = DependencyError::Cycle {
            path: vec![
                ComponentKind::IdentityRegistry,
                ComponentKind::ClaimTopicsRegistry,
                ComponentKind::IdentityRegistry,
            ],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected: IdentityRegistry -> ClaimTopicsRegistry -> IdentityRegistry"
        );
    }
}
