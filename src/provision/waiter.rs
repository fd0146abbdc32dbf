//! Confirmation waiter.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::ChainError;
use crate::provision::chain::{ChainReader, ReceiptStatus, TransactionReceipt};
use crate::provision::types::TransactionRef;

/// Terminal outcome of waiting on a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Confirmation {
    Succeeded { receipt: TransactionReceipt },
    Reverted { receipt: TransactionReceipt },
    /// Waiting stopped. The submission stands and may still confirm.
    TimedOut {
        transaction: TransactionRef,
        #[serde(with = "duration_ms")]
        waited: Duration,
    },
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

impl Confirmation {
    fn from_receipt(receipt: TransactionReceipt) -> Self {
        match receipt.status {
            ReceiptStatus::Success => Self::Succeeded { receipt },
            ReceiptStatus::Reverted => Self::Reverted { receipt },
        }
    }
}

pub struct ConfirmationWaiter {
    chain: Arc<dyn ChainReader>,
    poll_interval: Duration,
    timeout: Duration,
}

impl ConfirmationWaiter {
    pub fn new(chain: Arc<dyn ChainReader>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            chain,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll for a receipt until one arrives or the timeout elapses.
    ///
    /// Read failures are logged and retried inside the same budget; they
    /// never turn into a failed outcome.
    pub async fn wait(&self, transaction: &TransactionRef) -> Confirmation {
        let started = Instant::now();
        let deadline = started + self.timeout;
        loop {
            match self.chain.receipt(transaction).await {
                Ok(Some(receipt)) => return Confirmation::from_receipt(receipt),
                Ok(None) => tracing::debug!("Transaction {} still pending", transaction),
                Err(e) => tracing::warn!("Receipt read for {} failed: {}", transaction, e),
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                tracing::warn!(
                    "Transaction {} unconfirmed after {:?}; outcome unknown",
                    transaction,
                    waited
                );
                return Confirmation::TimedOut {
                    transaction: transaction.clone(),
                    waited,
                };
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Single receipt read, for explicit re-checks.
    pub async fn check_once(
        &self,
        transaction: &TransactionRef,
    ) -> Result<Option<Confirmation>, ChainError> {
        Ok(self
            .chain
            .receipt(transaction)
            .await?
            .map(Confirmation::from_receipt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::chain::StateQuery;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails twice, reports pending once, then confirms.
    struct FlakyChain {
        calls: AtomicUsize,
        confirm_after: usize,
    }

    #[async_trait]
    impl ChainReader for FlakyChain {
        async fn receipt(
            &self,
            transaction: &TransactionRef,
        ) -> Result<Option<TransactionReceipt>, ChainError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < 2 {
                return Err(ChainError::Rpc {
                    method: "eth_getTransactionReceipt".to_string(),
                    reason: "connection reset".to_string(),
                });
            }
            if call < self.confirm_after {
                return Ok(None);
            }
            Ok(Some(TransactionReceipt {
                transaction: transaction.clone(),
                status: ReceiptStatus::Success,
                block_number: 7,
                contract_address: None,
                revert_reason: None,
            }))
        }

        async fn holds(&self, _query: &StateQuery) -> Result<bool, ChainError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn read_errors_are_retried_within_budget() {
        let chain = Arc::new(FlakyChain {
            calls: AtomicUsize::new(0),
            confirm_after: 3,
        });
        let waiter = ConfirmationWaiter::new(
            chain.clone(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        );

        let outcome = waiter.wait(&TransactionRef::new("0xaa").unwrap()).await;
        assert!(matches!(outcome, Confirmation::Succeeded { .. }));
        assert_eq!(chain.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn timeout_is_reported_as_unknown() {
        let chain = Arc::new(FlakyChain {
            calls: AtomicUsize::new(0),
            confirm_after: usize::MAX,
        });
        let waiter =
            ConfirmationWaiter::new(chain, Duration::from_millis(5), Duration::from_millis(40));

        let outcome = waiter.wait(&TransactionRef::new("0xbb").unwrap()).await;
        match outcome {
            Confirmation::TimedOut { transaction, waited } => {
                assert_eq!(transaction.as_str(), "0xbb");
                assert!(waited >= Duration::from_millis(40));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
