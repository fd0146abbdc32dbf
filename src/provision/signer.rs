//! External signer gateway.
//!
//! The signer is a human-operated wallet outside this process. Submission is
//! modelled as message passing: the request is parked on a desk, the caller
//! waits (without a deadline) for a response posted over HTTP, and the
//! workflow stays in an "awaiting external action" state meanwhile.
//!
//! When a request names a required signer, the wallet first reports its
//! connected identity with [`SignatureResponse::Connected`]. A mismatch ends
//! the request before anything is signed; a match clears it for signing.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::error::{ProvisionError, SignerError};
use crate::provision::preparer::PreparedTransaction;
use crate::provision::types::{Address, TransactionRef};

#[async_trait]
pub trait SignerGateway: Send + Sync {
    /// Hand `payload` to the signer and return the submitted transaction.
    ///
    /// `expected` is the identity the payload must be signed with; a
    /// different connected identity yields [`SignerError::Mismatch`], or
    /// [`SignerError::MismatchedSubmission`] if the wrong identity already
    /// broadcast it.
    async fn submit(
        &self,
        payload: &PreparedTransaction,
        expected: Option<&Address>,
    ) -> Result<TransactionRef, SignerError>;
}

/// A payload waiting for the external signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureRequest {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expected_signer: Option<Address>,
    /// Identity the wallet reported as connected, once it matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_signer: Option<Address>,
    pub payload: PreparedTransaction,
}

/// What the external signer reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignatureResponse {
    /// Identity currently connected in the wallet, reported before signing.
    Connected {
        signer: Address,
    },
    Signed {
        signer: Address,
        transaction: TransactionRef,
    },
    Rejected {
        reason: String,
    },
}

struct Parked {
    request: SignatureRequest,
    reply: oneshot::Sender<SignatureResponse>,
}

/// Message-passing signer: requests are listed and answered out of band.
pub struct SignatureDesk {
    pending: Mutex<BTreeMap<Uuid, Parked>>,
    changes: watch::Sender<u64>,
}

impl Default for SignatureDesk {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureDesk {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            pending: Mutex::new(BTreeMap::new()),
            changes,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Uuid, Parked>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Requests still waiting on the signer, oldest first.
    pub fn pending(&self) -> Vec<SignatureRequest> {
        let mut requests: Vec<_> = self.lock().values().map(|p| p.request.clone()).collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Deliver the signer's answer for request `id`.
    ///
    /// A matching [`SignatureResponse::Connected`] keeps the request parked
    /// and marks it cleared for signing; every other response resolves it.
    pub fn respond(&self, id: Uuid, response: SignatureResponse) -> Result<(), ProvisionError> {
        let parked = {
            let mut pending = self.lock();
            let entry = pending
                .get_mut(&id)
                .ok_or(ProvisionError::UnknownSignatureRequest { id })?;
            if let SignatureResponse::Connected { signer } = &response {
                let matches = entry
                    .request
                    .expected_signer
                    .as_ref()
                    .is_none_or(|expected| expected == signer);
                if matches {
                    entry.request.connected_signer = Some(signer.clone());
                    drop(pending);
                    self.changes.send_modify(|n| *n += 1);
                    return Ok(());
                }
            }
            pending
                .remove(&id)
                .ok_or(ProvisionError::UnknownSignatureRequest { id })?
        };
        parked
            .reply
            .send(response)
            .map_err(|_| ProvisionError::UnknownSignatureRequest { id })?;
        self.changes.send_modify(|n| *n += 1);
        Ok(())
    }

    /// Wait until at least one request is pending and return the oldest.
    pub async fn next_request(&self) -> SignatureRequest {
        let mut changes = self.changes.subscribe();
        loop {
            if let Some(request) = self.pending().into_iter().next() {
                return request;
            }
            if changes.changed().await.is_err() {
                // Sender lives as long as self; unreachable in practice.
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Removes a parked request if the submitting future is dropped.
struct ParkGuard<'a> {
    desk: &'a SignatureDesk,
    id: Uuid,
}

impl Drop for ParkGuard<'_> {
    fn drop(&mut self) {
        if self.desk.lock().remove(&self.id).is_some() {
            self.desk.changes.send_modify(|n| *n += 1);
        }
    }
}

#[async_trait]
impl SignerGateway for SignatureDesk {
    async fn submit(
        &self,
        payload: &PreparedTransaction,
        expected: Option<&Address>,
    ) -> Result<TransactionRef, SignerError> {
        let id = Uuid::new_v4();
        let (reply, response) = oneshot::channel();
        let request = SignatureRequest {
            id,
            created_at: Utc::now(),
            expected_signer: expected.cloned(),
            connected_signer: None,
            payload: payload.clone(),
        };
        self.lock().insert(id, Parked { request, reply });
        self.changes.send_modify(|n| *n += 1);
        let _guard = ParkGuard { desk: self, id };
        tracing::info!(
            "Awaiting signature {} for {} (expected signer {})",
            id,
            payload.operation.target_label(),
            expected.map(Address::to_string).unwrap_or_else(|| "any".to_string())
        );

        match response.await {
            Ok(SignatureResponse::Connected { signer }) => match expected {
                Some(expected) => Err(SignerError::Mismatch {
                    expected: expected.clone(),
                    actual: signer,
                }),
                None => Err(SignerError::Unavailable {
                    reason: format!("signature request {id} closed without a signature"),
                }),
            },
            Ok(SignatureResponse::Signed {
                signer,
                transaction,
            }) => match expected {
                Some(expected) if *expected != signer => {
                    tracing::warn!(
                        "Signature {} was broadcast by {} instead of {} as {}",
                        id,
                        signer,
                        expected,
                        transaction
                    );
                    Err(SignerError::MismatchedSubmission {
                        expected: expected.clone(),
                        actual: signer,
                        transaction,
                    })
                }
                _ => Ok(transaction),
            },
            Ok(SignatureResponse::Rejected { reason }) => Err(SignerError::Rejected { reason }),
            Err(_) => Err(SignerError::Unavailable {
                reason: format!("signature request {id} was abandoned"),
            }),
        }
    }
}
