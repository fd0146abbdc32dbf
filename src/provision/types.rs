//! Core value types shared across the provisioning workflow.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ValidationError;
use crate::provision::kind::ComponentKind;

/// A 20-byte ledger address, stored as lowercase `0x`-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn parse(field: &str, raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyField {
                field: field.to_string(),
            });
        }
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| ValidationError::InvalidAddress {
                field: field.to_string(),
                value: raw.to_string(),
            })?;
        if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ValidationError::InvalidAddress {
                field: field.to_string(),
                value: raw.to_string(),
            });
        }
        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    pub fn zero() -> Self {
        Self(format!("0x{}", "0".repeat(40)))
    }

    pub fn from_bytes(bytes: &[u8; 20]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        // Validated on construction.
        if let Ok(decoded) = hex::decode(&self.0[2..]) {
            out.copy_from_slice(&decoded);
        }
        out
    }

    pub fn is_zero(&self) -> bool {
        self.0[2..].bytes().all(|b| b == b'0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse and reject the zero address, for fields naming an actor.
    pub fn parse_actor(field: &str, raw: &str) -> Result<Self, ValidationError> {
        let address = Self::parse(field, raw)?;
        address.require_non_zero(field)?;
        Ok(address)
    }

    pub fn require_non_zero(&self, field: &str) -> Result<(), ValidationError> {
        if self.is_zero() {
            return Err(ValidationError::ZeroAddress {
                field: field.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse("address", raw)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse("address", &raw).map_err(serde::de::Error::custom)
    }
}

/// Reference to a submitted transaction, as returned by the external signer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TransactionRef(String);

impl TransactionRef {
    pub fn new(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyField {
                field: "transaction".to_string(),
            });
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidValue {
                field: "transaction".to_string(),
                message: "must not contain whitespace".to_string(),
            });
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TransactionRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// One deployed occurrence of a component kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInstance {
    pub kind: ComponentKind,
    pub instance_name: String,
    pub address: Address,
    pub deployer: Address,
    pub network: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub retired: bool,
}

impl ComponentInstance {
    /// Usable as a dependency: initialized and not retracted.
    pub fn is_live(&self) -> bool {
        self.initialized && !self.retired
    }
}

/// Concrete registries an IdentityRegistry instance is initialized against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryLinks {
    pub trusted_issuers: String,
    pub claim_topics: String,
    pub identity_storage: String,
}

impl RegistryLinks {
    pub fn entries(&self) -> [(ComponentKind, &str); 3] {
        [
            (ComponentKind::TrustedIssuersRegistry, &self.trusted_issuers),
            (ComponentKind::ClaimTopicsRegistry, &self.claim_topics),
            (ComponentKind::IdentityRegistryStorage, &self.identity_storage),
        ]
    }
}

/// Claim topic registered in one ClaimTopicsRegistry instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTopicEntry {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl ClaimTopicEntry {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id == 0 {
            return Err(ValidationError::NonPositive {
                field: "topic.id".to_string(),
            });
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "topic.name".to_string(),
            });
        }
        Ok(())
    }
}

/// Trusted issuer registered in one TrustedIssuersRegistry instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedIssuerEntry {
    pub address: Address,
    pub claim_topics: BTreeSet<u64>,
}

impl TrustedIssuerEntry {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.address.require_non_zero("issuer.address")?;
        if self.claim_topics.is_empty() {
            return Err(ValidationError::EmptyField {
                field: "issuer.claim_topics".to_string(),
            });
        }
        if self.claim_topics.contains(&0) {
            return Err(ValidationError::NonPositive {
                field: "issuer.claim_topics".to_string(),
            });
        }
        Ok(())
    }
}

/// A user onboarded into one IdentityRegistry instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub wallet_address: Address,
    pub identity: Option<Address>,
    pub country_code: u16,
    #[serde(default)]
    pub verified: bool,
}

/// An attested fact about an identity. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub topic: u64,
    pub issuer: Address,
    /// `0x`-prefixed hex payload.
    pub data: String,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    pub subject_identity: Address,
}

impl Claim {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.topic == 0 {
            return Err(ValidationError::NonPositive {
                field: "claim.topic".to_string(),
            });
        }
        self.issuer.require_non_zero("claim.issuer")?;
        self.subject_identity
            .require_non_zero("claim.subject_identity")?;
        decode_hex_payload("claim.data", &self.data)?;
        Ok(())
    }

    pub fn data_bytes(&self) -> Result<Vec<u8>, ValidationError> {
        decode_hex_payload("claim.data", &self.data)
    }
}

/// Decode a `0x`-prefixed hex string (empty payload allowed).
pub fn decode_hex_payload(field: &str, raw: &str) -> Result<Vec<u8>, ValidationError> {
    let digits = raw
        .trim()
        .strip_prefix("0x")
        .ok_or_else(|| ValidationError::InvalidValue {
            field: field.to_string(),
            message: "must be 0x-prefixed hex".to_string(),
        })?;
    hex::decode(digits).map_err(|e| ValidationError::InvalidValue {
        field: field.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_normalizes_case() {
        let addr = Address::parse("agent", "0xABCDEF0123456789abcdef0123456789ABCDEF01").unwrap();
        assert_eq!(addr.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(Address::from_bytes(&addr.to_bytes()), addr);
    }

    #[test]
    fn address_rejects_bad_shapes() {
        assert!(matches!(
            Address::parse("agent", ""),
            Err(ValidationError::EmptyField { .. })
        ));
        assert!(matches!(
            Address::parse("agent", "abcdef0123456789abcdef0123456789abcdef01"),
            Err(ValidationError::InvalidAddress { .. })
        ));
        assert!(matches!(
            Address::parse("agent", "0x1234"),
            Err(ValidationError::InvalidAddress { .. })
        ));
        assert!(matches!(
            Address::parse_actor("agent", &Address::zero().to_string()),
            Err(ValidationError::ZeroAddress { .. })
        ));
    }

    #[test]
    fn address_deserialization_validates() {
        let err = serde_json::from_str::<Address>("\"0xnothex\"").unwrap_err();
        assert!(err.to_string().contains("not a valid address"));
    }

    #[test]
    fn trusted_issuer_requires_topics() {
        let entry = TrustedIssuerEntry {
            address: Address::parse("issuer", &format!("0x{}", "11".repeat(20))).unwrap(),
            claim_topics: BTreeSet::new(),
        };
        assert!(entry.validate().is_err());
    }

    #[test]
    fn claim_data_must_be_hex() {
        let claim = Claim {
            topic: 1,
            issuer: Address::parse("issuer", &format!("0x{}", "11".repeat(20))).unwrap(),
            data: "kyc-ok".to_string(),
            expiry: None,
            subject_identity: Address::parse("subject", &format!("0x{}", "22".repeat(20)))
                .unwrap(),
        };
        assert!(claim.validate().is_err());

        let claim = Claim {
            data: "0x6b79632d6f6b".to_string(),
            ..claim
        };
        assert!(claim.validate().is_ok());
        assert_eq!(claim.data_bytes().unwrap(), b"kyc-ok".to_vec());
    }
}
