//! In-memory paper chain.
//!
//! Acts as both the external signer and the ledger read side so the whole
//! workflow can run without a wallet or RPC endpoint. Submissions are
//! executed immediately by decoding their call data; receipts can be held
//! back, and rejections or reverts scripted, to exercise every outcome.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{ChainError, SignerError};
use crate::provision::abi;
use crate::provision::chain::{ChainReader, ReceiptStatus, StateQuery, TransactionReceipt};
use crate::provision::preparer::{
    Operation, PreparedTransaction, SIG_ADD_AGENT, SIG_ADD_CLAIM, SIG_ADD_CLAIM_TOPIC,
    SIG_ADD_TRUSTED_ISSUER, SIG_BIND_IDENTITY_REGISTRY, SIG_INIT, SIG_INIT_IDENTITY_REGISTRY,
    SIG_REGISTER_IDENTITY,
};
use crate::provision::signer::SignerGateway;
use crate::provision::types::{Address, TransactionRef};

type OperationPredicate = Box<dyn Fn(&Operation) -> bool + Send + Sync>;

struct OperationRule {
    matches: OperationPredicate,
    reason: String,
}

struct PaperState {
    connected: Address,
    nonce: u64,
    block: u64,
    receipts: HashMap<TransactionRef, TransactionReceipt>,
    withheld: HashMap<TransactionRef, TransactionReceipt>,
    facts: HashSet<StateQuery>,
    owners: HashMap<Address, Address>,
    reject_next: Option<String>,
    withhold_next: bool,
    revert_rules: Vec<OperationRule>,
    reject_rules: Vec<OperationRule>,
    submissions: usize,
}

pub struct PaperChain {
    state: Mutex<PaperState>,
}

impl PaperChain {
    /// A paper chain with `connected` as the active signer identity.
    pub fn new(connected: Address) -> Self {
        Self {
            state: Mutex::new(PaperState {
                connected,
                nonce: 0,
                block: 0,
                receipts: HashMap::new(),
                withheld: HashMap::new(),
                facts: HashSet::new(),
                owners: HashMap::new(),
                reject_next: None,
                withhold_next: false,
                revert_rules: Vec::new(),
                reject_rules: Vec::new(),
                submissions: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switch the identity the "wallet" signs with.
    pub fn connect(&self, identity: Address) {
        self.lock().connected = identity;
    }

    pub fn connected(&self) -> Address {
        self.lock().connected.clone()
    }

    /// Decline the next signature request.
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.lock().reject_next = Some(reason.into());
    }

    /// Decline the next signature request whose operation matches `predicate`.
    pub fn reject_when<F>(&self, predicate: F, reason: impl Into<String>)
    where
        F: Fn(&Operation) -> bool + Send + Sync + 'static,
    {
        self.lock().reject_rules.push(OperationRule {
            matches: Box::new(predicate),
            reason: reason.into(),
        });
    }

    /// Revert the next submission whose operation matches `predicate`.
    pub fn revert_when<F>(&self, predicate: F, reason: impl Into<String>)
    where
        F: Fn(&Operation) -> bool + Send + Sync + 'static,
    {
        self.lock().revert_rules.push(OperationRule {
            matches: Box::new(predicate),
            reason: reason.into(),
        });
    }

    /// Keep the next receipt back until [`PaperChain::release`].
    pub fn withhold_next(&self) {
        self.lock().withhold_next = true;
    }

    /// Publish a withheld receipt. Returns false if nothing was held.
    pub fn release(&self, transaction: &TransactionRef) -> bool {
        let mut state = self.lock();
        match state.withheld.remove(transaction) {
            Some(receipt) => {
                state.receipts.insert(transaction.clone(), receipt);
                true
            }
            None => false,
        }
    }

    /// Make a fact true on chain without a submission.
    pub fn seed(&self, fact: StateQuery) {
        self.lock().facts.insert(fact);
    }

    /// Number of transactions accepted for signing.
    pub fn submissions(&self) -> usize {
        self.lock().submissions
    }
}

impl PaperState {
    fn execute(
        &mut self,
        payload: &PreparedTransaction,
        hash: &[u8; 32],
    ) -> Result<Option<Address>, String> {
        if let Some(index) = self
            .revert_rules
            .iter()
            .position(|rule| (rule.matches)(&payload.operation))
        {
            return Err(self.revert_rules.remove(index).reason);
        }

        let data = abi::from_hex(&payload.call_data).ok_or("malformed call data")?;
        let Some(target) = payload.target.clone() else {
            // Creation: derive the new contract's address from the tx hash.
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(&hash[12..]);
            let created = Address::from_bytes(&bytes);
            self.owners.insert(created.clone(), self.connected.clone());
            return Ok(Some(created));
        };

        if data.len() < 4 {
            return Err("missing function selector".to_string());
        }
        let (selector, args) = data.split_at(4);
        let is = |signature: &str| selector == abi::selector(signature);
        let bad_args = || "malformed arguments".to_string();
        let only_owner = |state: &PaperState| match state.owners.get(&target) {
            Some(owner) if *owner != state.connected => {
                Err("Ownable: caller is not the owner".to_string())
            }
            _ => Ok(()),
        };
        let insert_new = |state: &mut PaperState, fact: StateQuery, reason: &str| {
            if state.facts.insert(fact) {
                Ok(None)
            } else {
                Err(reason.to_string())
            }
        };

        if is(SIG_INIT) || is(SIG_INIT_IDENTITY_REGISTRY) {
            only_owner(self)?;
            insert_new(
                self,
                StateQuery::Initialized { contract: target },
                "Initializable: contract is already initialized",
            )
        } else if is(SIG_BIND_IDENTITY_REGISTRY) {
            only_owner(self)?;
            let registry = abi::decode_address(args, 0).ok_or_else(bad_args)?;
            insert_new(
                self,
                StateQuery::Bound {
                    storage: target,
                    registry,
                },
                "identity registry already bound",
            )
        } else if is(SIG_ADD_AGENT) {
            only_owner(self)?;
            let agent = abi::decode_address(args, 0).ok_or_else(bad_args)?;
            insert_new(
                self,
                StateQuery::Agent {
                    contract: target,
                    agent,
                },
                "AgentRole: account already has role",
            )
        } else if is(SIG_ADD_CLAIM_TOPIC) {
            only_owner(self)?;
            let topic = abi::decode_uint(args, 0)
                .and_then(|t| u64::try_from(t).ok())
                .ok_or_else(bad_args)?;
            insert_new(
                self,
                StateQuery::ClaimTopic {
                    registry: target,
                    topic,
                },
                "claimTopic already exists",
            )
        } else if is(SIG_ADD_TRUSTED_ISSUER) {
            only_owner(self)?;
            let issuer = abi::decode_address(args, 0).ok_or_else(bad_args)?;
            let topics = abi::decode_uint_array(args, 1).ok_or_else(bad_args)?;
            if topics.is_empty() {
                return Err("trusted claim topics cannot be empty".to_string());
            }
            insert_new(
                self,
                StateQuery::TrustedIssuer {
                    registry: target,
                    issuer,
                },
                "trusted Issuer already exists",
            )
        } else if is(SIG_REGISTER_IDENTITY) {
            let caller = StateQuery::Agent {
                contract: target.clone(),
                agent: self.connected.clone(),
            };
            if !self.facts.contains(&caller) {
                return Err("AgentRole: caller does not have the Agent role".to_string());
            }
            let user = abi::decode_address(args, 0).ok_or_else(bad_args)?;
            insert_new(
                self,
                StateQuery::IdentityRegistered {
                    registry: target,
                    user,
                },
                "address stored already",
            )
        } else if is(SIG_ADD_CLAIM) {
            let topic = abi::decode_uint(args, 0)
                .and_then(|t| u64::try_from(t).ok())
                .ok_or_else(bad_args)?;
            let issuer = abi::decode_address(args, 2).ok_or_else(bad_args)?;
            abi::decode_bytes(args, 4).ok_or_else(bad_args)?;
            // Re-adding the same (issuer, topic) replaces the claim.
            self.facts.insert(StateQuery::Claim {
                identity: target,
                topic,
                issuer,
            });
            Ok(None)
        } else {
            Err("function selector was not recognized".to_string())
        }
    }
}

#[async_trait]
impl SignerGateway for PaperChain {
    async fn submit(
        &self,
        payload: &PreparedTransaction,
        expected: Option<&Address>,
    ) -> Result<TransactionRef, SignerError> {
        let mut state = self.lock();
        if let Some(reason) = state.reject_next.take() {
            return Err(SignerError::Rejected { reason });
        }
        if let Some(index) = state
            .reject_rules
            .iter()
            .position(|rule| (rule.matches)(&payload.operation))
        {
            let reason = state.reject_rules.remove(index).reason;
            return Err(SignerError::Rejected { reason });
        }
        if let Some(expected) = expected
            && *expected != state.connected
        {
            return Err(SignerError::Mismatch {
                expected: expected.clone(),
                actual: state.connected.clone(),
            });
        }

        state.nonce += 1;
        state.block += 1;
        state.submissions += 1;
        let hash: [u8; 32] = *blake3::hash(
            format!("{}:{}:{}", state.connected, state.nonce, payload.digest).as_bytes(),
        )
        .as_bytes();
        let transaction = TransactionRef::new(&abi::to_hex(&hash)).map_err(|e| {
            SignerError::Unavailable {
                reason: e.to_string(),
            }
        })?;

        let outcome = state.execute(payload, &hash);
        let receipt = TransactionReceipt {
            transaction: transaction.clone(),
            status: if outcome.is_ok() {
                ReceiptStatus::Success
            } else {
                ReceiptStatus::Reverted
            },
            block_number: state.block,
            contract_address: outcome.as_ref().ok().cloned().flatten(),
            revert_reason: outcome.err(),
        };
        tracing::debug!(
            "Paper chain executed {} as {} ({:?})",
            payload.operation.name(),
            transaction,
            receipt.status
        );

        if std::mem::take(&mut state.withhold_next) {
            state.withheld.insert(transaction.clone(), receipt);
        } else {
            state.receipts.insert(transaction.clone(), receipt);
        }
        Ok(transaction)
    }
}

#[async_trait]
impl ChainReader for PaperChain {
    async fn receipt(
        &self,
        transaction: &TransactionRef,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        Ok(self.lock().receipts.get(transaction).cloned())
    }

    async fn holds(&self, query: &StateQuery) -> Result<bool, ChainError> {
        Ok(self.lock().facts.contains(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::kind::ComponentKind;
    use crate::provision::preparer::{ArtifactSet, InstanceRef, Preparer};
    use crate::provision::registry::RegistryView;

    fn operator() -> Address {
        Address::from_bytes(&[0xee; 20])
    }

    fn prepare(op: Operation) -> PreparedTransaction {
        Preparer::new(ArtifactSet::placeholder(), 100)
            .prepare(&op, &RegistryView::new("paper"), &operator())
            .unwrap()
    }

    #[tokio::test]
    async fn deployments_create_contracts() {
        let chain = PaperChain::new(operator());
        let tx = chain
            .submit(
                &prepare(Operation::Deploy {
                    kind: ComponentKind::ModularCompliance,
                }),
                None,
            )
            .await
            .unwrap();

        let receipt = chain.receipt(&tx).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert!(receipt.contract_address.is_some());
        assert_eq!(chain.submissions(), 1);
    }

    #[tokio::test]
    async fn mismatch_does_not_count_as_submission() {
        let chain = PaperChain::new(operator());
        let err = chain
            .submit(
                &prepare(Operation::Deploy {
                    kind: ComponentKind::ModularCompliance,
                }),
                Some(&Address::from_bytes(&[1; 20])),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SignerError::Mismatch { .. }));
        assert_eq!(chain.submissions(), 0);
    }

    #[tokio::test]
    async fn scripted_revert_is_one_shot() {
        let chain = PaperChain::new(operator());
        chain.revert_when(
            |op| matches!(op, Operation::Deploy { .. }),
            "out of gas",
        );
        let payload = prepare(Operation::Deploy {
            kind: ComponentKind::ClaimTopicsRegistry,
        });

        let first = chain.submit(&payload, None).await.unwrap();
        let receipt = chain.receipt(&first).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Reverted);
        assert_eq!(receipt.revert_reason.as_deref(), Some("out of gas"));

        let second = chain.submit(&payload, None).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(
            chain.receipt(&second).await.unwrap().unwrap().status,
            ReceiptStatus::Success
        );
    }

    #[tokio::test]
    async fn withheld_receipts_stay_pending_until_released() {
        let chain = PaperChain::new(operator());
        chain.withhold_next();
        let tx = chain
            .submit(
                &prepare(Operation::Deploy {
                    kind: ComponentKind::ModularCompliance,
                }),
                None,
            )
            .await
            .unwrap();

        assert!(chain.receipt(&tx).await.unwrap().is_none());
        assert!(chain.release(&tx));
        assert!(chain.receipt(&tx).await.unwrap().is_some());
    }

    #[test]
    fn init_of_unknown_contract_reverts_when_repeated() {
        let chain = PaperChain::new(operator());
        let target = Address::from_bytes(&[7; 20]);
        let payload = PreparedTransaction {
            operation: Operation::Initialize {
                target: InstanceRef::named(ComponentKind::ModularCompliance, "ModularCompliance"),
                links: Default::default(),
            },
            target: Some(target),
            target_instance: Some("ModularCompliance".to_string()),
            call_data: abi::to_hex(&abi::encode_call(SIG_INIT, &[])),
            signer: crate::provision::preparer::SignerRequirement {
                role: crate::provision::preparer::SignerRole::Owner,
                identity: None,
            },
            limits: crate::provision::preparer::ResourceLimits { gas_limit: 1 },
            digest: "d".to_string(),
        };

        let mut state = chain.lock();
        assert!(state.execute(&payload, &[0; 32]).is_ok());
        assert_eq!(
            state.execute(&payload, &[0; 32]),
            Err("Initializable: contract is already initialized".to_string())
        );
    }
}
