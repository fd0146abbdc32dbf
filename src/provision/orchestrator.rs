//! Single-operation pipeline: pre-check → prepare → sign → confirm → record.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::error::{ChainError, ProvisionError, SignerError, ValidationError};
use crate::provision::chain::{ChainReader, TransactionReceipt};
use crate::provision::kind::ComponentKind;
use crate::provision::ledger::RecordedAction;
use crate::provision::preparer::{self, IdentitySource, Operation, PreparedTransaction, Preparer};
use crate::provision::registry::{ComponentRegistry, RegistryView};
use crate::provision::resolver::DependencyGraph;
use crate::provision::signer::SignerGateway;
use crate::provision::types::{Address, TransactionRef};
use crate::provision::waiter::{Confirmation, ConfirmationWaiter};
use crate::provision::workflow::{
    AwaitingAction, PendingConfirmation, StepStatus, WorkflowPhase, WorkflowState,
};

/// Result of running one operation to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Submitted, confirmed and recorded.
    Applied {
        transaction: TransactionRef,
        action: RecordedAction,
    },
    /// The effect was already in place; nothing was submitted.
    AlreadyApplied {
        reason: String,
        /// Ledger entry written for an effect only observed on chain.
        #[serde(skip_serializing_if = "Option::is_none")]
        reconciled: Option<RecordedAction>,
    },
}

/// Result of re-checking an unresolved transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecheckOutcome {
    Confirmed { action: RecordedAction },
    Reverted { reason: String },
    StillPending,
}

pub struct Provisioner {
    registry: Arc<ComponentRegistry>,
    graph: DependencyGraph,
    preparer: Preparer,
    signer: Arc<dyn SignerGateway>,
    chain: Arc<dyn ChainReader>,
    waiter: ConfirmationWaiter,
}

impl Provisioner {
    pub fn new(
        registry: Arc<ComponentRegistry>,
        graph: DependencyGraph,
        preparer: Preparer,
        signer: Arc<dyn SignerGateway>,
        chain: Arc<dyn ChainReader>,
        waiter: ConfirmationWaiter,
    ) -> Self {
        Self {
            registry,
            graph,
            preparer,
            signer,
            chain,
            waiter,
        }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn chain(&self) -> &Arc<dyn ChainReader> {
        &self.chain
    }

    /// Build the payload descriptor for `op` without submitting anything.
    ///
    /// Runs the pre-check first so an already-applied effect is reported
    /// instead of a payload.
    pub async fn prepare(
        &self,
        op: &Operation,
        operator: &Address,
    ) -> Result<PreparedTransaction, ProvisionError> {
        let view = self.registry.snapshot().await;
        let resolved = op.resolve(&view)?;
        preparer::preflight(&resolved, &view, self.chain.as_ref()).await?;
        Ok(self.preparer.prepare(&resolved, &view, operator)?)
    }

    /// Deploy a new instance of `kind`.
    pub async fn deploy(
        &self,
        kind: ComponentKind,
        operator: &Address,
        state: &mut WorkflowState,
    ) -> Result<StepOutcome, ProvisionError> {
        self.execute(&Operation::Deploy { kind }, operator, state, None)
            .await
    }

    /// Run `op` end to end on behalf of `operator`.
    pub async fn execute(
        &self,
        op: &Operation,
        operator: &Address,
        state: &mut WorkflowState,
        step: Option<usize>,
    ) -> Result<StepOutcome, ProvisionError> {
        if let Operation::Deploy { kind } = op {
            let _guard = self.registry.begin_deployment(operator, *kind)?;
            if state.unresolved.values().any(|p| {
                &p.operator == operator && p.operation == Operation::Deploy { kind: *kind }
            }) {
                return Err(ProvisionError::DeploymentInProgress {
                    kind: *kind,
                    operator: operator.clone(),
                });
            }
            return self.run(op, operator, state, step).await;
        }
        self.run(op, operator, state, step).await
    }

    async fn run(
        &self,
        op: &Operation,
        operator: &Address,
        state: &mut WorkflowState,
        step: Option<usize>,
    ) -> Result<StepOutcome, ProvisionError> {
        let view = self.registry.snapshot().await;
        let mut resolved = op.resolve(&view)?;

        if let Some(outcome) = self.check_applied(&resolved, &view, operator, step, state).await? {
            return Ok(outcome);
        }

        if let Operation::RegisterIdentity {
            user, identity, ..
        } = &mut resolved
            && *identity == IdentitySource::CreateNew
        {
            let created = match view.unbound_identity_for(user) {
                Some(existing) => {
                    state.log(step, format!("Reusing identity {existing} for {user}"));
                    existing.clone()
                }
                None => {
                    let deploy = Operation::DeployIdentity {
                        management_key: user.clone(),
                    };
                    let receipt = self.submit(&deploy, &view, operator, state, step).await?;
                    let action = self.settle(&deploy, &receipt, operator, state).await;
                    match action? {
                        RecordedAction::IdentityDeployed { identity, .. } => identity,
                        other => {
                            return Err(ProvisionError::Conflict(format!(
                                "identity deployment recorded as {}",
                                other.label()
                            )));
                        }
                    }
                }
            };
            *identity = IdentitySource::UseExisting(created);
        }

        let view = self.registry.snapshot().await;
        let receipt = self.submit(&resolved, &view, operator, state, step).await?;
        let transaction = receipt.transaction.clone();
        let action = self.settle(&resolved, &receipt, operator, state).await?;
        state.log(
            step,
            format!("{} confirmed in {}", resolved.target_label(), transaction),
        );
        Ok(StepOutcome::Applied {
            transaction,
            action,
        })
    }

    /// Record a confirmed receipt and release its unresolved entry.
    ///
    /// A failed record keeps the entry so the transaction stays re-checkable.
    async fn settle(
        &self,
        op: &Operation,
        receipt: &TransactionReceipt,
        operator: &Address,
        state: &mut WorkflowState,
    ) -> Result<RecordedAction, ProvisionError> {
        let transaction = &receipt.transaction;
        match self.commit(op, receipt, operator).await {
            Ok(action) => {
                state.unresolved.remove(transaction);
                Ok(action)
            }
            Err(e) => {
                state.awaiting = Some(AwaitingAction::Recheck {
                    transaction: transaction.clone(),
                });
                Err(e)
            }
        }
    }

    /// Pre-check; reconcile effects seen only on chain into the ledger.
    async fn check_applied(
        &self,
        resolved: &Operation,
        view: &RegistryView,
        operator: &Address,
        step: Option<usize>,
        state: &mut WorkflowState,
    ) -> Result<Option<StepOutcome>, ProvisionError> {
        match preparer::preflight(resolved, view, self.chain.as_ref()).await {
            Ok(()) => Ok(None),
            Err(ProvisionError::DuplicateInitialization {
                target,
                detail,
                observed_on_chain,
            }) => {
                let mut reason = format!("{target} already applied ({detail})");
                let mut reconciled = None;
                if observed_on_chain {
                    let recorded = match reconciled_effect(resolved, view) {
                        Ok(action) => self.registry.record(action, operator.clone(), None).await,
                        Err(e) => Err(e),
                    };
                    match recorded {
                        Ok(record) => {
                            if let Some(note) = requested_values_note(resolved) {
                                reason = format!("{reason}; {note}");
                            }
                            reconciled = Some(record.action);
                        }
                        Err(e) => {
                            tracing::warn!("Could not reconcile {}: {}", target, e);
                            reason = format!("{reason}; not recorded: {e}");
                        }
                    }
                }
                state.log(step, reason.clone());
                Ok(Some(StepOutcome::AlreadyApplied { reason, reconciled }))
            }
            Err(e) => Err(e),
        }
    }

    /// Prepare, hand to the signer and wait for a terminal receipt.
    async fn submit(
        &self,
        op: &Operation,
        view: &RegistryView,
        operator: &Address,
        state: &mut WorkflowState,
        step: Option<usize>,
    ) -> Result<TransactionReceipt, ProvisionError> {
        let prepared = self.preparer.prepare(op, view, operator)?;
        state.set_phase(WorkflowPhase::AwaitingSignature);
        state.log(
            step,
            format!(
                "Requesting signature for {} ({})",
                op.target_label(),
                prepared.digest
            ),
        );

        let transaction = match self
            .signer
            .submit(&prepared, prepared.signer.identity.as_ref())
            .await
        {
            Ok(transaction) => transaction,
            Err(e) => {
                if let SignerError::MismatchedSubmission { transaction, .. } = &e {
                    // Broadcast under the wrong identity; keep it re-checkable
                    // without tying it to the step, which stays retryable.
                    state.unresolved.insert(
                        transaction.clone(),
                        PendingConfirmation {
                            operation: op.clone(),
                            operator: operator.clone(),
                            submitted_at: Utc::now(),
                            step: None,
                        },
                    );
                    state.submitted += 1;
                    state.log(step, format!("Tracking {transaction} for re-check"));
                }
                let err = ProvisionError::from(e);
                state.awaiting = match &err {
                    ProvisionError::SignerMismatch { expected, actual } => {
                        Some(AwaitingAction::SignerSwitch {
                            step,
                            expected: expected.clone(),
                            actual: actual.clone(),
                        })
                    }
                    ProvisionError::Rejected { reason } => Some(AwaitingAction::Resubmission {
                        step,
                        reason: reason.clone(),
                    }),
                    _ => None,
                };
                state.log(step, err.to_string());
                return Err(err);
            }
        };
        // Tracked before waiting: if this future is dropped the broadcast
        // transaction is still known and can be re-checked.
        state.unresolved.insert(
            transaction.clone(),
            PendingConfirmation {
                operation: op.clone(),
                operator: operator.clone(),
                submitted_at: Utc::now(),
                step,
            },
        );
        state.submitted += 1;
        state.set_phase(WorkflowPhase::AwaitingConfirmation);
        state.log(step, format!("Submitted {transaction}"));

        match self.waiter.wait(&transaction).await {
            Confirmation::Succeeded { receipt } => Ok(receipt),
            Confirmation::Reverted { receipt } => {
                state.unresolved.remove(&transaction);
                let reason = receipt
                    .revert_reason
                    .unwrap_or_else(|| "execution reverted".to_string());
                state.log(step, format!("{transaction} reverted: {reason}"));
                Err(ProvisionError::ChainRevert {
                    transaction,
                    reason,
                })
            }
            Confirmation::TimedOut {
                transaction,
                waited,
            } => {
                state.awaiting = Some(AwaitingAction::Recheck {
                    transaction: transaction.clone(),
                });
                let err = ProvisionError::Timeout {
                    transaction,
                    waited,
                };
                state.log(step, err.to_string());
                Err(err)
            }
        }
    }

    /// Record the effect of a confirmed operation.
    async fn commit(
        &self,
        op: &Operation,
        receipt: &TransactionReceipt,
        operator: &Address,
    ) -> Result<RecordedAction, ProvisionError> {
        let transaction = Some(receipt.transaction.clone());
        match op {
            Operation::Deploy { kind } => {
                let address = created_address(receipt)?;
                let instance = self
                    .registry
                    .register(*kind, address, operator.clone(), None, transaction)
                    .await?;
                Ok(RecordedAction::Deployed { instance })
            }
            Operation::DeployIdentity { .. } => {
                let address = created_address(receipt)?;
                let action = op.effect(Some(&address))?;
                Ok(self
                    .registry
                    .record(action, operator.clone(), transaction)
                    .await?
                    .action)
            }
            _ => {
                let action = op.effect(None)?;
                Ok(self
                    .registry
                    .record(action, operator.clone(), transaction)
                    .await?
                    .action)
            }
        }
    }

    /// Re-check a transaction whose confirmation timed out.
    pub async fn recheck(
        &self,
        transaction: &TransactionRef,
        state: &mut WorkflowState,
    ) -> Result<RecheckOutcome, ProvisionError> {
        let pending = state.unresolved.get(transaction).cloned().ok_or_else(|| {
            ProvisionError::UnknownTransaction {
                transaction: transaction.clone(),
            }
        })?;

        let outcome = match self.waiter.check_once(transaction).await? {
            None => {
                state.log(pending.step, format!("{transaction} is still pending"));
                return Ok(RecheckOutcome::StillPending);
            }
            Some(Confirmation::Succeeded { receipt }) => {
                let action = self
                    .commit(&pending.operation, &receipt, &pending.operator)
                    .await?;
                if let Some(report) = state.step_mut(pending.step) {
                    report.status = StepStatus::Success;
                    report.error = None;
                }
                state.log(pending.step, format!("{transaction} confirmed on re-check"));
                RecheckOutcome::Confirmed { action }
            }
            Some(Confirmation::Reverted { receipt }) => {
                let reason = receipt
                    .revert_reason
                    .unwrap_or_else(|| "execution reverted".to_string());
                let err = ProvisionError::ChainRevert {
                    transaction: transaction.clone(),
                    reason: reason.clone(),
                };
                if let Some(report) = state.step_mut(pending.step) {
                    report.status = StepStatus::Failed;
                    report.error = Some(err.to_error_payload());
                }
                state.log(pending.step, err.to_string());
                RecheckOutcome::Reverted { reason }
            }
            Some(Confirmation::TimedOut { .. }) => RecheckOutcome::StillPending,
        };

        state.unresolved.remove(transaction);
        if matches!(&state.awaiting, Some(AwaitingAction::Recheck { transaction: t }) if t == transaction)
        {
            state.awaiting = None;
        }
        Ok(outcome)
    }
}

/// Ledger effect for an operation whose result was found on chain.
///
/// A registration that asked for a fresh identity is recorded against the
/// identity this workflow deployed for the user, when there is one.
fn reconciled_effect(
    resolved: &Operation,
    view: &RegistryView,
) -> Result<RecordedAction, ProvisionError> {
    if let Operation::RegisterIdentity {
        registry,
        user,
        identity: IdentitySource::CreateNew,
        country_code,
    } = resolved
    {
        let existing = view.unbound_identity_for(user).ok_or_else(|| {
            ValidationError::InvalidValue {
                field: "identity".to_string(),
                message: format!("no identity deployed here for {user}"),
            }
        })?;
        let op = Operation::RegisterIdentity {
            registry: registry.clone(),
            user: user.clone(),
            identity: IdentitySource::UseExisting(existing.clone()),
            country_code: *country_code,
        };
        return Ok(op.effect(None)?);
    }
    Ok(resolved.effect(None)?)
}

/// Caveat for reconciled records whose values come from the request.
fn requested_values_note(resolved: &Operation) -> Option<&'static str> {
    match resolved {
        Operation::Initialize { .. } => {
            Some("recorded with the requested links; on-chain values were not read back")
        }
        Operation::AddTrustedIssuer { .. } => {
            Some("recorded with the requested topics; on-chain values were not read back")
        }
        _ => None,
    }
}

fn created_address(receipt: &TransactionReceipt) -> Result<Address, ProvisionError> {
    receipt.contract_address.clone().ok_or_else(|| {
        ProvisionError::Chain(ChainError::InvalidResponse {
            method: "eth_getTransactionReceipt".to_string(),
            reason: format!(
                "deployment {} confirmed without a contract address",
                receipt.transaction
            ),
        })
    })
}
