//! Provisioning core: registry, dependency resolution, preparation,
//! signing, confirmation and batch sequencing.

pub mod abi;
pub mod chain;
pub mod kind;
pub mod ledger;
pub mod orchestrator;
pub mod paper;
pub mod preparer;
pub mod registry;
pub mod resolver;
pub mod sequencer;
pub mod signer;
pub mod types;
pub mod waiter;
pub mod workflow;

pub use kind::ComponentKind;
pub use orchestrator::{Provisioner, RecheckOutcome, StepOutcome};
pub use preparer::{Operation, PreparedTransaction};
pub use registry::{ComponentRegistry, RegistryView};
pub use sequencer::Sequencer;
pub use types::{Address, TransactionRef};
