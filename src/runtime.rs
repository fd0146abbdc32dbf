//! Runtime wiring: builds the provisioning stack from resolved config.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::{ChainMode, Config};
use crate::error::{ConfigError, Error};
use crate::provision::chain::{ChainReader, JsonRpcChainReader};
use crate::provision::ledger::{DeploymentLedger, JsonlLedger, MemoryLedger};
use crate::provision::orchestrator::Provisioner;
use crate::provision::paper::PaperChain;
use crate::provision::preparer::{ArtifactSet, Preparer};
use crate::provision::registry::ComponentRegistry;
use crate::provision::resolver::DependencyGraph;
use crate::provision::signer::{SignatureDesk, SignerGateway};
use crate::provision::types::Address;
use crate::provision::waiter::ConfirmationWaiter;
use crate::provision::workflow::WorkflowState;

/// Per-request timeout for JSON-RPC reads.
const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// Where signature requests go.
#[derive(Clone)]
pub enum SignerBackend {
    /// Signed and executed in process.
    Paper(Arc<PaperChain>),
    /// Parked until an external wallet answers over HTTP.
    Desk(Arc<SignatureDesk>),
}

impl SignerBackend {
    pub fn desk(&self) -> Option<&Arc<SignatureDesk>> {
        match self {
            Self::Desk(desk) => Some(desk),
            Self::Paper(_) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Paper(_) => "paper",
            Self::Desk(_) => "external",
        }
    }
}

/// Shared state behind the HTTP surface.
pub struct AppState {
    pub provisioner: Provisioner,
    pub operator: Address,
    pub signer: SignerBackend,
    /// One workflow per operator; held for the whole run, including by
    /// tasks that outlive the request that started them.
    pub workflow: Arc<Mutex<WorkflowState>>,
    /// Copy of the workflow as of the last completed request.
    pub published: std::sync::RwLock<WorkflowState>,
}

impl AppState {
    pub fn new(provisioner: Provisioner, operator: Address, signer: SignerBackend) -> Self {
        Self {
            provisioner,
            operator,
            signer,
            workflow: Arc::new(Mutex::new(WorkflowState::new())),
            published: std::sync::RwLock::new(WorkflowState::new()),
        }
    }

    /// Build the full stack. `ephemeral` keeps the ledger in memory.
    pub async fn build(config: &Config, ephemeral: bool) -> Result<Self, Error> {
        let ledger: Arc<dyn DeploymentLedger> = if ephemeral {
            tracing::warn!("Using an in-memory ledger; records are lost on exit");
            MemoryLedger::new()
        } else {
            Arc::new(JsonlLedger::new(&config.ledger.path))
        };
        let registry = Arc::new(ComponentRegistry::open(ledger, &config.chain.network).await?);
        let graph = DependencyGraph::standard()?;
        let chain_cfg = &config.chain;

        let (signer, reader, artifacts): (SignerBackend, Arc<dyn ChainReader>, ArtifactSet) =
            match chain_cfg.mode {
                ChainMode::Paper => {
                    let paper = Arc::new(PaperChain::new(chain_cfg.operator.clone()));
                    let artifacts = match &chain_cfg.artifacts_dir {
                        Some(dir) => ArtifactSet::load_dir(dir)?,
                        None => ArtifactSet::placeholder(),
                    };
                    let reader: Arc<dyn ChainReader> = paper.clone();
                    (SignerBackend::Paper(paper), reader, artifacts)
                }
                ChainMode::Live => {
                    let rpc_url =
                        chain_cfg
                            .rpc_url
                            .clone()
                            .ok_or_else(|| ConfigError::MissingRequired {
                                key: "PROVISIONER_RPC_URL".to_string(),
                                hint: "Live mode needs a JSON-RPC endpoint.".to_string(),
                            })?;
                    let dir = chain_cfg.artifacts_dir.as_ref().ok_or_else(|| {
                        ConfigError::MissingRequired {
                            key: "PROVISIONER_ARTIFACTS_DIR".to_string(),
                            hint: "Live deployments need compiled creation bytecode.".to_string(),
                        }
                    })?;
                    let reader = JsonRpcChainReader::new(rpc_url, RPC_TIMEOUT)
                        .map_err(|e| ConfigError::InvalidValue {
                            key: "PROVISIONER_RPC_URL".to_string(),
                            message: e.to_string(),
                        })?;
                    let reader: Arc<dyn ChainReader> = Arc::new(reader);
                    (
                        SignerBackend::Desk(Arc::new(SignatureDesk::new())),
                        reader,
                        ArtifactSet::load_dir(dir)?,
                    )
                }
            };

        let gateway: Arc<dyn SignerGateway> = match &signer {
            SignerBackend::Paper(paper) => paper.clone(),
            SignerBackend::Desk(desk) => desk.clone(),
        };
        let waiter = ConfirmationWaiter::new(
            reader.clone(),
            chain_cfg.poll_interval,
            chain_cfg.confirmation_timeout,
        );
        let provisioner = Provisioner::new(
            registry,
            graph,
            Preparer::new(artifacts, chain_cfg.gas_multiplier_percent),
            gateway,
            reader,
            waiter,
        );
        tracing::info!(
            "Provisioner ready on network {} ({} signer, operator {})",
            chain_cfg.network,
            signer.label(),
            chain_cfg.operator
        );
        Ok(Self::new(provisioner, chain_cfg.operator.clone(), signer))
    }

    /// Store a copy of `state` for readers that cannot take the workflow lock.
    pub fn publish(&self, state: &WorkflowState) {
        let mut published = self
            .published
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *published = state.clone();
    }

    pub fn published(&self) -> WorkflowState {
        self.published
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
