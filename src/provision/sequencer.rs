//! Initialization sequencer: validates and runs ordered post-deployment batches.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ProvisionError, ValidationError};
use crate::provision::orchestrator::{Provisioner, StepOutcome};
use crate::provision::preparer::Operation;
use crate::provision::resolver::Dependency;
use crate::provision::types::{Address, RegistryLinks};
use crate::provision::workflow::{
    BatchReport, Halt, InitializationStep, StepReport, StepStatus, WorkflowPhase, WorkflowState,
};

/// A step after planning: resolved action plus its full dependency set.
struct PlannedStep {
    action: Operation,
    dependencies: BTreeSet<Dependency>,
}

pub struct Sequencer<'a> {
    provisioner: &'a Provisioner,
}

impl<'a> Sequencer<'a> {
    pub fn new(provisioner: &'a Provisioner) -> Self {
        Self { provisioner }
    }

    /// Validate the whole batch, then run it in caller order.
    ///
    /// Validation failures reject the batch before anything is submitted.
    /// Failed steps do not stop independent later steps; steps that need
    /// operator action halt the run with a resume point.
    pub async fn run(
        &self,
        steps: &[InitializationStep],
        operator: &Address,
        state: &mut WorkflowState,
    ) -> Result<BatchReport, ProvisionError> {
        let planned = self.plan(steps).await?;

        let view = self.provisioner.registry().snapshot().await;
        let graph = self.provisioner.graph();
        state.steps = planned
            .iter()
            .enumerate()
            .map(|(index, step)| StepReport {
                index,
                operation: step.action.name().to_string(),
                target: step.action.target_label(),
                status: if graph.readiness(&step.dependencies, &view).ready {
                    StepStatus::Ready
                } else {
                    StepStatus::Pending
                },
                dependencies: step.dependencies.iter().cloned().collect(),
                transaction: None,
                reason: None,
                error: None,
            })
            .collect();
        state.awaiting = None;
        state.set_phase(WorkflowPhase::Running);
        state.log(None, format!("Running batch of {} steps", planned.len()));

        let submitted_before = state.submitted;
        let mut halted = None;
        for (index, step) in planned.iter().enumerate() {
            if let Some(halt) = self.run_step(index, step, &planned, operator, state).await {
                halted = Some(halt);
                break;
            }
        }

        let resume_from = halted.as_ref().map(|h: &Halt| h.step);
        if let Some(halt) = &halted {
            for report in state.steps.iter_mut().skip(halt.step + 1) {
                report.status = StepStatus::Pending;
            }
            state.set_phase(WorkflowPhase::Halted);
            state.log(Some(halt.step), "Batch halted awaiting operator action");
        } else {
            state.set_phase(WorkflowPhase::Completed);
            state.log(None, "Batch completed");
        }

        Ok(BatchReport {
            steps: state.steps.clone(),
            halted,
            resume_from,
            submitted: state.submitted - submitted_before,
        })
    }

    async fn run_step(
        &self,
        index: usize,
        step: &PlannedStep,
        planned: &[PlannedStep],
        operator: &Address,
        state: &mut WorkflowState,
    ) -> Option<Halt> {
        let view = self.provisioner.registry().snapshot().await;
        let readiness = self
            .provisioner
            .graph()
            .readiness(&step.dependencies, &view);
        if !readiness.ready {
            let blockers: Vec<String> = readiness
                .unmet
                .iter()
                .map(|dep| match producer_of(planned, dep, index) {
                    Some(producer) => format!("{dep} (step {producer})"),
                    None => dep.to_string(),
                })
                .collect();
            let reason = format!("blocked by failed dependency: {}", blockers.join(", "));
            state.log(Some(index), reason.clone());
            if let Some(report) = state.step_mut(Some(index)) {
                report.status = StepStatus::Skipped;
                report.reason = Some(reason);
            }
            return None;
        }

        if let Some(report) = state.step_mut(Some(index)) {
            report.status = StepStatus::Running;
        }
        let result = self
            .provisioner
            .execute(&step.action, operator, state, Some(index))
            .await;
        state.set_phase(WorkflowPhase::Running);

        let (status, reason, halt) = match result {
            Ok(StepOutcome::Applied { transaction, .. }) => {
                if let Some(report) = state.step_mut(Some(index)) {
                    report.transaction = Some(transaction);
                }
                (StepStatus::Success, None, None)
            }
            Ok(StepOutcome::AlreadyApplied { reason, .. }) => (StepStatus::Skipped, Some(reason), None),
            Err(err) => {
                let payload = err.to_error_payload();
                let (status, halts) = match &err {
                    ProvisionError::SignerMismatch { .. } => (StepStatus::Ready, true),
                    ProvisionError::Rejected { .. } | ProvisionError::SignerUnavailable { .. } => {
                        (StepStatus::Pending, true)
                    }
                    ProvisionError::Timeout { transaction, .. } => {
                        if let Some(report) = state.step_mut(Some(index)) {
                            report.transaction = Some(transaction.clone());
                        }
                        (StepStatus::Running, true)
                    }
                    ProvisionError::Ledger(_) => (StepStatus::Running, true),
                    _ => (StepStatus::Failed, false),
                };
                if let Some(report) = state.step_mut(Some(index)) {
                    report.error = Some(payload.clone());
                }
                let halt = halts.then(|| Halt {
                    step: index,
                    error: payload,
                });
                (status, None, halt)
            }
        };

        if let Some(report) = state.step_mut(Some(index)) {
            report.status = status;
            report.reason = reason;
        }
        halt
    }

    /// Resolve every step and check dependencies against the registry and
    /// earlier steps.
    async fn plan(&self, steps: &[InitializationStep]) -> Result<Vec<PlannedStep>, ProvisionError> {
        let view = self.provisioner.registry().snapshot().await;
        let graph = self.provisioner.graph();

        let mut resolved = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            if matches!(
                step.action,
                Operation::Deploy { .. } | Operation::DeployIdentity { .. }
            ) {
                return Err(ValidationError::InvalidStep {
                    step: index,
                    reason: "deployments run through the deploy endpoint".to_string(),
                }
                .into());
            }
            let action = step.action.resolve(&view).map_err(|e| ValidationError::InvalidStep {
                step: index,
                reason: e.to_string(),
            })?;
            resolved.push(action);
        }

        let mut planned_links: BTreeMap<String, RegistryLinks> = BTreeMap::new();
        let mut planned = Vec::with_capacity(resolved.len());
        for (index, (action, step)) in resolved.into_iter().zip(steps).enumerate() {
            let mut dependencies = action.implied_dependencies(&view, &planned_links);
            dependencies.extend(step.dependencies.iter().cloned());

            let mut unmet = Vec::new();
            for dep in &dependencies {
                if graph.is_satisfied(dep, &view) {
                    continue;
                }
                if producer_of(&planned, dep, index).is_some() {
                    continue;
                }
                let later = steps
                    .iter()
                    .enumerate()
                    .skip(index + 1)
                    .find(|(_, later)| {
                        later
                            .action
                            .resolve(&view)
                            .is_ok_and(|op| op.produces().contains(dep))
                    })
                    .map(|(i, _)| i);
                match later {
                    Some(producer) => {
                        return Err(ValidationError::Ordering {
                            step: index,
                            dependency: dep.to_string(),
                            producer,
                        }
                        .into());
                    }
                    None => unmet.push(dep.to_string()),
                }
            }
            if !unmet.is_empty() {
                return Err(ValidationError::UnmetDependencies { step: index, unmet }.into());
            }

            if let Some((name, links)) = action.planned_links() {
                planned_links.insert(name, links);
            }
            planned.push(PlannedStep {
                action,
                dependencies,
            });
        }
        Ok(planned)
    }
}

/// Index of the last step before `before` that produces `dep`.
fn producer_of(planned: &[PlannedStep], dep: &Dependency, before: usize) -> Option<usize> {
    planned
        .iter()
        .take(before)
        .rposition(|step| step.action.produces().contains(dep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::provision::kind::ComponentKind;
    use crate::provision::ledger::MemoryLedger;
    use crate::provision::paper::PaperChain;
    use crate::provision::preparer::{ArtifactSet, InstanceRef, LinkSelection, Preparer};
    use crate::provision::registry::ComponentRegistry;
    use crate::provision::resolver::DependencyGraph;
    use crate::provision::types::ClaimTopicEntry;
    use crate::provision::waiter::ConfirmationWaiter;
    use std::sync::Arc;
    use std::time::Duration;

    fn operator() -> Address {
        Address::from_bytes(&[0xee; 20])
    }

    async fn deployed() -> (Arc<PaperChain>, Provisioner) {
        let chain = Arc::new(PaperChain::new(operator()));
        let registry = Arc::new(
            ComponentRegistry::open(MemoryLedger::new(), "paper")
                .await
                .unwrap(),
        );
        let provisioner = Provisioner::new(
            registry,
            DependencyGraph::standard().unwrap(),
            Preparer::new(ArtifactSet::placeholder(), 100),
            chain.clone(),
            chain.clone(),
            ConfirmationWaiter::new(
                chain.clone(),
                Duration::from_millis(2),
                Duration::from_millis(50),
            ),
        );
        let mut state = WorkflowState::new();
        for kind in ComponentKind::ALL {
            provisioner.deploy(kind, &operator(), &mut state).await.unwrap();
        }
        (chain, provisioner)
    }

    fn init(kind: ComponentKind) -> InitializationStep {
        InitializationStep::new(Operation::Initialize {
            target: InstanceRef::latest(kind),
            links: LinkSelection::default(),
        })
    }

    fn full_batch() -> Vec<InitializationStep> {
        vec![
            init(ComponentKind::TrustedIssuersRegistry),
            init(ComponentKind::ClaimTopicsRegistry),
            init(ComponentKind::IdentityRegistryStorage),
            init(ComponentKind::ModularCompliance),
            init(ComponentKind::IdentityRegistry),
            InitializationStep::new(Operation::BindIdentityRegistry {
                storage: None,
                registry: None,
            }),
        ]
    }

    #[tokio::test]
    async fn ordering_violation_rejects_batch_before_submission() {
        let (chain, provisioner) = deployed().await;
        let before = chain.submissions();
        let mut batch = full_batch();
        batch.swap(0, 4);

        let err = Sequencer::new(&provisioner)
            .run(&batch, &operator(), &mut WorkflowState::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::Validation(ValidationError::Ordering { step: 0, .. })
        ));
        assert_eq!(chain.submissions(), before);
    }

    #[tokio::test]
    async fn deploy_steps_are_rejected() {
        let (_, provisioner) = deployed().await;
        let batch = vec![InitializationStep::new(Operation::Deploy {
            kind: ComponentKind::ModularCompliance,
        })];

        let err = Sequencer::new(&provisioner)
            .run(&batch, &operator(), &mut WorkflowState::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Validation(ValidationError::InvalidStep { step: 0, .. })
        ));
    }

    #[tokio::test]
    async fn full_batch_completes_and_second_run_skips() {
        let (chain, provisioner) = deployed().await;
        let mut state = WorkflowState::new();

        let report = Sequencer::new(&provisioner)
            .run(&full_batch(), &operator(), &mut state)
            .await
            .unwrap();
        assert!(report.halted.is_none());
        assert_eq!(report.submitted, 6);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Success));
        assert_eq!(state.phase, WorkflowPhase::Completed);

        let submissions = chain.submissions();
        let rerun = Sequencer::new(&provisioner)
            .run(&full_batch(), &operator(), &mut state)
            .await
            .unwrap();
        assert_eq!(rerun.submitted, 0);
        assert!(rerun.steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert_eq!(chain.submissions(), submissions);
    }

    #[tokio::test]
    async fn failed_step_blocks_dependents_but_not_independent_steps() {
        let (chain, provisioner) = deployed().await;
        chain.revert_when(
            |op| {
                matches!(op, Operation::Initialize { target, .. }
                    if target.kind == ComponentKind::ClaimTopicsRegistry)
            },
            "out of gas",
        );
        let mut batch = full_batch();
        batch.push(InitializationStep::new(Operation::AddClaimTopic {
            registry: None,
            topic: ClaimTopicEntry {
                id: 7,
                name: "KYC".to_string(),
                description: String::new(),
            },
        }));

        let report = Sequencer::new(&provisioner)
            .run(&batch, &operator(), &mut WorkflowState::new())
            .await
            .unwrap();

        let statuses: Vec<_> = report.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Success,
                StepStatus::Failed,
                StepStatus::Success,
                StepStatus::Success,
                StepStatus::Skipped,
                StepStatus::Skipped,
                StepStatus::Skipped,
            ]
        );
        assert_eq!(
            report.steps[1].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::ChainRevert)
        );
        assert!(report.halted.is_none());
    }

    #[tokio::test]
    async fn signer_mismatch_halts_with_resume_point() {
        let (chain, provisioner) = deployed().await;
        chain.connect(Address::from_bytes(&[0x11; 20]));
        let mut state = WorkflowState::new();

        let report = Sequencer::new(&provisioner)
            .run(&full_batch(), &operator(), &mut state)
            .await
            .unwrap();

        assert_eq!(report.resume_from, Some(0));
        assert_eq!(report.submitted, 0);
        assert_eq!(report.steps[0].status, StepStatus::Ready);
        assert_eq!(
            report.halted.as_ref().map(|h| h.error.kind),
            Some(ErrorKind::SignerMismatch)
        );
        assert_eq!(state.phase, WorkflowPhase::Halted);
        assert!(matches!(
            state.awaiting,
            Some(crate::provision::workflow::AwaitingAction::SignerSwitch { step: Some(0), .. })
        ));
    }

    #[tokio::test]
    async fn rejection_halts_batch_and_leaves_later_steps_pending() {
        let (chain, provisioner) = deployed().await;
        chain.reject_when(
            |op| {
                matches!(op, Operation::Initialize { target, .. }
                    if target.kind == ComponentKind::IdentityRegistryStorage)
            },
            "operator declined",
        );
        let mut state = WorkflowState::new();

        let report = Sequencer::new(&provisioner)
            .run(&full_batch(), &operator(), &mut state)
            .await
            .unwrap();

        assert_eq!(report.resume_from, Some(2));
        assert_eq!(report.submitted, 2);
        let statuses: Vec<_> = report.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Success,
                StepStatus::Success,
                StepStatus::Pending,
                StepStatus::Pending,
                StepStatus::Pending,
                StepStatus::Pending,
            ]
        );
        assert_eq!(
            report.halted.as_ref().map(|h| (h.step, h.error.kind)),
            Some((2, ErrorKind::Rejection))
        );
        assert_eq!(state.phase, WorkflowPhase::Halted);
        assert!(matches!(
            &state.awaiting,
            Some(crate::provision::workflow::AwaitingAction::Resubmission { step: Some(2), reason })
                if reason == "operator declined"
        ));
        assert!(
            !provisioner
                .registry()
                .snapshot()
                .await
                .is_initialized("IdentityRegistryStorage")
        );
    }
}
