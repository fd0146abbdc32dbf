//! Explicit workflow state threaded through the orchestrator and sequencer.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorPayload;
use crate::provision::preparer::Operation;
use crate::provision::resolver::Dependency;
use crate::provision::types::{Address, TransactionRef};

/// Maximum number of events kept in memory.
const EVENT_LOG_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Success,
    Failed,
    Skipped,
}

/// One caller-supplied step of an initialization batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializationStep {
    pub action: Operation,
    /// Declared on top of the dependencies the action implies.
    #[serde(default)]
    pub dependencies: BTreeSet<Dependency>,
}

impl InitializationStep {
    pub fn new(action: Operation) -> Self {
        Self {
            action,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.insert(dependency);
        self
    }
}

/// Per-step result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub operation: String,
    pub target: String,
    pub status: StepStatus,
    pub dependencies: Vec<Dependency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Idle,
    Running,
    AwaitingSignature,
    AwaitingConfirmation,
    Halted,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    pub message: String,
}

/// What the operator has to do before the workflow can move on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AwaitingAction {
    /// Connect `expected` in the wallet and resume at `step`.
    SignerSwitch {
        step: Option<usize>,
        expected: Address,
        actual: Address,
    },
    /// The signer declined; resubmit from `step` when ready.
    Resubmission { step: Option<usize>, reason: String },
    /// Outcome unknown; re-check the transaction.
    Recheck { transaction: TransactionRef },
}

/// A submitted transaction whose outcome is not known yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    /// Resolved operation, recorded once the transaction confirms.
    pub operation: Operation,
    pub operator: Address,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
}

/// Why a batch stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Halt {
    pub step: usize,
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<Halt>,
    /// Step index to resume from after the operator acts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<usize>,
    /// Transactions handed to the signer during this run.
    pub submitted: usize,
}

/// Injectable workflow state; one per operator session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowState {
    pub phase: WorkflowPhase,
    pub steps: Vec<StepReport>,
    pub events: Vec<WorkflowEvent>,
    pub awaiting: Option<AwaitingAction>,
    pub unresolved: BTreeMap<TransactionRef, PendingConfirmation>,
    pub submitted: usize,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowState {
    pub fn new() -> Self {
        Self {
            phase: WorkflowPhase::Idle,
            steps: Vec::new(),
            events: Vec::new(),
            awaiting: None,
            unresolved: BTreeMap::new(),
            submitted: 0,
        }
    }

    pub fn log(&mut self, step: Option<usize>, message: impl Into<String>) {
        let message = message.into();
        match step {
            Some(step) => tracing::info!("[step {}] {}", step, message),
            None => tracing::info!("{}", message),
        }
        self.events.push(WorkflowEvent {
            at: Utc::now(),
            step,
            message,
        });
        if self.events.len() > EVENT_LOG_LIMIT {
            let excess = self.events.len() - EVENT_LOG_LIMIT;
            self.events.drain(..excess);
        }
    }

    pub fn set_phase(&mut self, phase: WorkflowPhase) {
        self.phase = phase;
    }

    pub(crate) fn step_mut(&mut self, index: Option<usize>) -> Option<&mut StepReport> {
        index.and_then(|i| self.steps.get_mut(i))
    }
}
