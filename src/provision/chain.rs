//! Read side of the ledger: receipts and state queries.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ChainError;
use crate::provision::abi::{self, Token};
use crate::provision::types::{Address, TransactionRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction: TransactionRef,
    pub status: ReceiptStatus,
    pub block_number: u64,
    /// Created contract, for deployments.
    pub contract_address: Option<Address>,
    pub revert_reason: Option<String>,
}

/// On-chain facts the pre-check can ask about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum StateQuery {
    Initialized { contract: Address },
    Agent { contract: Address, agent: Address },
    Bound { storage: Address, registry: Address },
    ClaimTopic { registry: Address, topic: u64 },
    TrustedIssuer { registry: Address, issuer: Address },
    IdentityRegistered { registry: Address, user: Address },
    Claim {
        identity: Address,
        topic: u64,
        issuer: Address,
    },
}

#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Receipt for `transaction`, or `None` while it is still pending.
    async fn receipt(
        &self,
        transaction: &TransactionRef,
    ) -> Result<Option<TransactionReceipt>, ChainError>;

    async fn holds(&self, query: &StateQuery) -> Result<bool, ChainError>;
}

/// ERC-735 claim id: keccak256(abi.encode(issuer, topic)).
pub fn claim_id(issuer: &Address, topic: u64) -> [u8; 32] {
    abi::keccak256(&abi::encode(&[
        Token::Address(issuer.clone()),
        Token::Uint(u128::from(topic)),
    ]))
}

/// Ethereum JSON-RPC reader.
pub struct JsonRpcChainReader {
    client: reqwest::Client,
    url: String,
}

impl JsonRpcChainReader {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        let body: Value = response.json().await?;

        if !status.is_success() {
            return Err(ChainError::Rpc {
                method: method.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }
        if let Some(error) = body.get("error") {
            let reason = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(ChainError::Rpc {
                method: method.to_string(),
                reason,
            });
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn eth_call(
        &self,
        to: &Address,
        signature: &str,
        args: &[Token],
    ) -> Result<Vec<u8>, ChainError> {
        let data = abi::to_hex(&abi::encode_call(signature, args));
        let result = self
            .call(
                "eth_call",
                json!([{ "to": to.as_str(), "data": data }, "latest"]),
            )
            .await?;
        result
            .as_str()
            .and_then(abi::from_hex)
            .ok_or_else(|| invalid("eth_call", format!("{signature} returned {result}")))
    }

    async fn call_bool(
        &self,
        to: &Address,
        signature: &str,
        args: &[Token],
    ) -> Result<bool, ChainError> {
        let out = self.eth_call(to, signature, args).await?;
        abi::decode_bool(&out, 0).ok_or_else(|| invalid("eth_call", format!("{signature}: not a bool")))
    }

    async fn call_words(
        &self,
        to: &Address,
        signature: &str,
    ) -> Result<Vec<[u8; 32]>, ChainError> {
        let out = self.eth_call(to, signature, &[]).await?;
        abi::decode_word_array(&out, 0)
            .ok_or_else(|| invalid("eth_call", format!("{signature}: not an array")))
    }
}

fn invalid(method: &str, reason: String) -> ChainError {
    ChainError::InvalidResponse {
        method: method.to_string(),
        reason,
    }
}

fn parse_quantity(method: &str, value: &Value) -> Result<u64, ChainError> {
    value
        .as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .ok_or_else(|| invalid(method, format!("bad quantity {value}")))
}

fn word_address(word: &[u8; 32]) -> Address {
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&word[12..]);
    Address::from_bytes(&bytes)
}

#[async_trait]
impl ChainReader for JsonRpcChainReader {
    async fn receipt(
        &self,
        transaction: &TransactionRef,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        const METHOD: &str = "eth_getTransactionReceipt";
        let result = self.call(METHOD, json!([transaction.as_str()])).await?;
        if result.is_null() {
            return Ok(None);
        }

        let status = match result.get("status").and_then(Value::as_str) {
            Some("0x1") => ReceiptStatus::Success,
            Some("0x0") => ReceiptStatus::Reverted,
            other => return Err(invalid(METHOD, format!("unexpected status {other:?}"))),
        };
        let block_number = parse_quantity(METHOD, result.get("blockNumber").unwrap_or(&Value::Null))?;
        let contract_address = result
            .get("contractAddress")
            .and_then(Value::as_str)
            .map(|raw| Address::parse("contractAddress", raw))
            .transpose()
            .map_err(|e| invalid(METHOD, e.to_string()))?;

        Ok(Some(TransactionReceipt {
            transaction: transaction.clone(),
            status,
            block_number,
            contract_address,
            revert_reason: (status == ReceiptStatus::Reverted)
                .then(|| "execution reverted".to_string()),
        }))
    }

    async fn holds(&self, query: &StateQuery) -> Result<bool, ChainError> {
        match query {
            StateQuery::Initialized { contract } => {
                let out = self.eth_call(contract, "owner()", &[]).await?;
                let owner = abi::decode_address(&out, 0)
                    .ok_or_else(|| invalid("eth_call", "owner(): not an address".to_string()))?;
                Ok(!owner.is_zero())
            }
            StateQuery::Agent { contract, agent } => {
                self.call_bool(contract, "isAgent(address)", &[Token::Address(agent.clone())])
                    .await
            }
            StateQuery::Bound { storage, registry } => Ok(self
                .call_words(storage, "linkedIdentityRegistries()")
                .await?
                .iter()
                .any(|word| &word_address(word) == registry)),
            StateQuery::ClaimTopic { registry, topic } => {
                let mut expected = [0u8; 32];
                expected[24..].copy_from_slice(&topic.to_be_bytes());
                Ok(self
                    .call_words(registry, "getClaimTopics()")
                    .await?
                    .contains(&expected))
            }
            StateQuery::TrustedIssuer { registry, issuer } => {
                self.call_bool(
                    registry,
                    "isTrustedIssuer(address)",
                    &[Token::Address(issuer.clone())],
                )
                .await
            }
            StateQuery::IdentityRegistered { registry, user } => {
                self.call_bool(registry, "contains(address)", &[Token::Address(user.clone())])
                    .await
            }
            StateQuery::Claim {
                identity,
                topic,
                issuer,
            } => {
                let ids = {
                    let out = self
                        .eth_call(
                            identity,
                            "getClaimIdsByTopic(uint256)",
                            &[Token::Uint(u128::from(*topic))],
                        )
                        .await?;
                    abi::decode_word_array(&out, 0).ok_or_else(|| {
                        invalid("eth_call", "getClaimIdsByTopic: not an array".to_string())
                    })?
                };
                Ok(ids.contains(&claim_id(issuer, *topic)))
            }
        }
    }
}
