//! Transaction preparer: operation → unsigned payload descriptor.
//!
//! Preparation is pure over (operation, registry view, operator, artifacts):
//! no clock or randomness enters the payload, so preparing twice against the
//! same state yields byte-identical call data and digest.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ProvisionError, ValidationError};
use crate::provision::abi::{self, Token};
use crate::provision::chain::{ChainReader, StateQuery};
use crate::provision::kind::ComponentKind;
use crate::provision::ledger::RecordedAction;
use crate::provision::registry::RegistryView;
use crate::provision::resolver::Dependency;
use crate::provision::types::{
    Address, Claim, ClaimTopicEntry, RegistryLinks, TrustedIssuerEntry, UserIdentity,
};

/// Artifact name of the per-user identity contract.
pub const IDENTITY_ARTIFACT: &str = "Identity";

/// ERC-735 claim signature scheme (ECDSA).
const CLAIM_SCHEME_ECDSA: u128 = 1;

/// Target instance: explicit name, or the latest live instance of `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub kind: ComponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl InstanceRef {
    pub fn latest(kind: ComponentKind) -> Self {
        Self { kind, name: None }
    }

    pub fn named(kind: ComponentKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: Some(name.into()),
        }
    }
}

/// Registries an IdentityRegistry is initialized against. Unset entries
/// resolve to the latest instance of their kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_issuers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_topics: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_storage: Option<String>,
}

impl LinkSelection {
    fn is_empty(&self) -> bool {
        self.trusted_issuers.is_none() && self.claim_topics.is_none() && self.identity_storage.is_none()
    }

    fn to_links(&self) -> Option<RegistryLinks> {
        Some(RegistryLinks {
            trusted_issuers: self.trusted_issuers.clone()?,
            claim_topics: self.claim_topics.clone()?,
            identity_storage: self.identity_storage.clone()?,
        })
    }
}

impl From<&RegistryLinks> for LinkSelection {
    fn from(links: &RegistryLinks) -> Self {
        Self {
            trusted_issuers: Some(links.trusted_issuers.clone()),
            claim_topics: Some(links.claim_topics.clone()),
            identity_storage: Some(links.identity_storage.clone()),
        }
    }
}

/// Where a registered user's identity pointer comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "address", rename_all = "snake_case")]
pub enum IdentitySource {
    /// Deploy a fresh identity for the user first.
    CreateNew,
    /// An identity previously deployed through this provisioner.
    UseExisting(Address),
    /// Operator-supplied pointer, taken as-is.
    ManualOverride(Address),
}

impl IdentitySource {
    pub fn address(&self) -> Option<&Address> {
        match self {
            Self::CreateNew => None,
            Self::UseExisting(address) | Self::ManualOverride(address) => Some(address),
        }
    }
}

/// An intended provisioning operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    Deploy {
        kind: ComponentKind,
    },
    DeployIdentity {
        management_key: Address,
    },
    Initialize {
        target: InstanceRef,
        #[serde(default, skip_serializing_if = "LinkSelection::is_empty")]
        links: LinkSelection,
    },
    BindIdentityRegistry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        storage: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        registry: Option<String>,
    },
    AddAgent {
        target: InstanceRef,
        agent: Address,
    },
    AddClaimTopic {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        registry: Option<String>,
        topic: ClaimTopicEntry,
    },
    AddTrustedIssuer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        registry: Option<String>,
        issuer: TrustedIssuerEntry,
    },
    RegisterIdentity {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        registry: Option<String>,
        user: Address,
        identity: IdentitySource,
        country_code: u16,
    },
    IssueClaim {
        claim: Claim,
    },
}

pub const OPERATION_NAMES: [&str; 9] = [
    "deploy",
    "deploy_identity",
    "initialize",
    "bind_identity_registry",
    "add_agent",
    "add_claim_topic",
    "add_trusted_issuer",
    "register_identity",
    "issue_claim",
];

fn resolved<'a>(name: &'a Option<String>, kind: ComponentKind) -> Result<&'a str, ValidationError> {
    name.as_deref().ok_or(ValidationError::NoInstance { kind })
}

fn resolve_name(
    view: &RegistryView,
    name: Option<&str>,
    kind: ComponentKind,
) -> Result<String, ValidationError> {
    let instance = match name {
        Some(name) => {
            let instance = view
                .instance(name)
                .ok_or_else(|| ValidationError::UnknownInstance {
                    name: name.to_string(),
                })?;
            if instance.kind != kind {
                return Err(ValidationError::KindMismatch {
                    name: name.to_string(),
                    expected: kind,
                    actual: instance.kind,
                });
            }
            if instance.retired {
                return Err(ValidationError::RetiredInstance {
                    name: name.to_string(),
                });
            }
            instance
        }
        None => view.latest(kind).ok_or(ValidationError::NoInstance { kind })?,
    };
    Ok(instance.instance_name.clone())
}

fn address_of(view: &RegistryView, name: &str) -> Result<Address, ValidationError> {
    view.instance(name)
        .map(|i| i.address.clone())
        .ok_or_else(|| ValidationError::UnknownInstance {
            name: name.to_string(),
        })
}

impl Operation {
    /// Parse an operation named in a URL path with its parameters in `body`.
    pub fn from_named(name: &str, body: serde_json::Value) -> Result<Self, ValidationError> {
        let name = name.trim().to_ascii_lowercase().replace('-', "_");
        if !OPERATION_NAMES.contains(&name.as_str()) {
            return Err(ValidationError::UnknownOperation(name));
        }
        let mut body = match body {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            _ => {
                return Err(ValidationError::InvalidValue {
                    field: "body".to_string(),
                    message: "expected a JSON object".to_string(),
                });
            }
        };
        body.insert("operation".to_string(), serde_json::Value::String(name));
        serde_json::from_value(serde_json::Value::Object(body)).map_err(|e| {
            ValidationError::InvalidValue {
                field: "body".to_string(),
                message: e.to_string(),
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Deploy { .. } => "deploy",
            Self::DeployIdentity { .. } => "deploy_identity",
            Self::Initialize { .. } => "initialize",
            Self::BindIdentityRegistry { .. } => "bind_identity_registry",
            Self::AddAgent { .. } => "add_agent",
            Self::AddClaimTopic { .. } => "add_claim_topic",
            Self::AddTrustedIssuer { .. } => "add_trusted_issuer",
            Self::RegisterIdentity { .. } => "register_identity",
            Self::IssueClaim { .. } => "issue_claim",
        }
    }

    /// Shape checks that need no registry or chain state.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Deploy { .. } => {}
            Self::DeployIdentity { management_key } => {
                management_key.require_non_zero("management_key")?;
            }
            Self::Initialize { target, links } => {
                check_name(target.name.as_deref(), "target.name")?;
                if target.kind != ComponentKind::IdentityRegistry && !links.is_empty() {
                    return Err(ValidationError::InvalidValue {
                        field: "links".to_string(),
                        message: format!("{} is initialized without registry links", target.kind),
                    });
                }
                check_name(links.trusted_issuers.as_deref(), "links.trusted_issuers")?;
                check_name(links.claim_topics.as_deref(), "links.claim_topics")?;
                check_name(links.identity_storage.as_deref(), "links.identity_storage")?;
            }
            Self::BindIdentityRegistry { storage, registry } => {
                check_name(storage.as_deref(), "storage")?;
                check_name(registry.as_deref(), "registry")?;
            }
            Self::AddAgent { target, agent } => {
                check_name(target.name.as_deref(), "target.name")?;
                agent.require_non_zero("agent")?;
                if !target.kind.supports_agents() {
                    return Err(ValidationError::InvalidValue {
                        field: "target.kind".to_string(),
                        message: format!("{} does not accept agents", target.kind),
                    });
                }
            }
            Self::AddClaimTopic { registry, topic } => {
                check_name(registry.as_deref(), "registry")?;
                topic.validate()?;
            }
            Self::AddTrustedIssuer { registry, issuer } => {
                check_name(registry.as_deref(), "registry")?;
                issuer.validate()?;
            }
            Self::RegisterIdentity {
                registry,
                user,
                identity,
                country_code,
            } => {
                check_name(registry.as_deref(), "registry")?;
                user.require_non_zero("user")?;
                if let Some(address) = identity.address() {
                    address.require_non_zero("identity.address")?;
                }
                if !(1..=999).contains(country_code) {
                    return Err(ValidationError::InvalidValue {
                        field: "country_code".to_string(),
                        message: format!("{country_code} is not an ISO 3166-1 numeric code"),
                    });
                }
            }
            Self::IssueClaim { claim } => claim.validate()?,
        }
        Ok(())
    }

    /// Replace every implicit instance reference with a concrete name.
    pub fn resolve(&self, view: &RegistryView) -> Result<Operation, ValidationError> {
        self.validate()?;
        let op = match self {
            Self::Deploy { .. } | Self::DeployIdentity { .. } | Self::IssueClaim { .. } => {
                self.clone()
            }
            Self::Initialize { target, links } => {
                let name = resolve_name(view, target.name.as_deref(), target.kind)?;
                let links = if target.kind != ComponentKind::IdentityRegistry {
                    LinkSelection::default()
                } else if links.is_empty()
                    && let Some(existing) = view.links.get(&name)
                {
                    LinkSelection::from(existing)
                } else {
                    LinkSelection {
                        trusted_issuers: Some(resolve_name(
                            view,
                            links.trusted_issuers.as_deref(),
                            ComponentKind::TrustedIssuersRegistry,
                        )?),
                        claim_topics: Some(resolve_name(
                            view,
                            links.claim_topics.as_deref(),
                            ComponentKind::ClaimTopicsRegistry,
                        )?),
                        identity_storage: Some(resolve_name(
                            view,
                            links.identity_storage.as_deref(),
                            ComponentKind::IdentityRegistryStorage,
                        )?),
                    }
                };
                Self::Initialize {
                    target: InstanceRef::named(target.kind, name),
                    links,
                }
            }
            Self::BindIdentityRegistry { storage, registry } => {
                let registry =
                    resolve_name(view, registry.as_deref(), ComponentKind::IdentityRegistry)?;
                // Default storage is the one the registry was initialized against.
                let storage = match storage {
                    Some(name) => resolve_name(
                        view,
                        Some(name),
                        ComponentKind::IdentityRegistryStorage,
                    )?,
                    None => match view.links.get(&registry) {
                        Some(links) => links.identity_storage.clone(),
                        None => {
                            resolve_name(view, None, ComponentKind::IdentityRegistryStorage)?
                        }
                    },
                };
                Self::BindIdentityRegistry {
                    storage: Some(storage),
                    registry: Some(registry),
                }
            }
            Self::AddAgent { target, agent } => Self::AddAgent {
                target: InstanceRef::named(
                    target.kind,
                    resolve_name(view, target.name.as_deref(), target.kind)?,
                ),
                agent: agent.clone(),
            },
            Self::AddClaimTopic { registry, topic } => Self::AddClaimTopic {
                registry: Some(resolve_name(
                    view,
                    registry.as_deref(),
                    ComponentKind::ClaimTopicsRegistry,
                )?),
                topic: topic.clone(),
            },
            Self::AddTrustedIssuer { registry, issuer } => Self::AddTrustedIssuer {
                registry: Some(resolve_name(
                    view,
                    registry.as_deref(),
                    ComponentKind::TrustedIssuersRegistry,
                )?),
                issuer: issuer.clone(),
            },
            Self::RegisterIdentity {
                registry,
                user,
                identity,
                country_code,
            } => {
                if let IdentitySource::UseExisting(address) = identity
                    && !view.deployed_identities.contains_key(address)
                {
                    return Err(ValidationError::UnknownIdentity {
                        address: address.clone(),
                    });
                }
                Self::RegisterIdentity {
                    registry: Some(resolve_name(
                        view,
                        registry.as_deref(),
                        ComponentKind::IdentityRegistry,
                    )?),
                    user: user.clone(),
                    identity: identity.clone(),
                    country_code: *country_code,
                }
            }
        };
        Ok(op)
    }

    /// Dependencies implied by a resolved operation.
    ///
    /// `planned_links` holds IdentityRegistry links produced by earlier
    /// steps of the same batch, consulted before the view.
    pub fn implied_dependencies(
        &self,
        view: &RegistryView,
        planned_links: &BTreeMap<String, RegistryLinks>,
    ) -> BTreeSet<Dependency> {
        let instance = |name: &str| Dependency::Instance {
            name: name.to_string(),
        };
        let mut deps = BTreeSet::new();
        match self {
            Self::Deploy { .. } | Self::DeployIdentity { .. } | Self::IssueClaim { .. } => {}
            Self::Initialize { links, .. } => {
                if let Some(links) = links.to_links() {
                    for (_, name) in links.entries() {
                        deps.insert(instance(name));
                    }
                }
            }
            Self::BindIdentityRegistry { storage, registry } => {
                deps.extend(storage.as_deref().map(instance));
                deps.extend(registry.as_deref().map(instance));
            }
            Self::AddAgent { target, .. } => {
                deps.extend(target.name.as_deref().map(instance));
            }
            Self::AddClaimTopic { registry, .. } | Self::AddTrustedIssuer { registry, .. } => {
                deps.extend(registry.as_deref().map(instance));
            }
            Self::RegisterIdentity { registry, .. } => {
                if let Some(registry) = registry.as_deref() {
                    deps.insert(instance(registry));
                    let links = planned_links
                        .get(registry)
                        .or_else(|| view.links.get(registry));
                    if let Some(links) = links {
                        deps.insert(Dependency::Binding {
                            storage: links.identity_storage.clone(),
                            registry: registry.to_string(),
                        });
                    }
                }
            }
        }
        deps
    }

    /// Dependencies a successful run of this resolved operation satisfies.
    pub fn produces(&self) -> Vec<Dependency> {
        match self {
            Self::Initialize { target, .. } => target
                .name
                .iter()
                .map(|name| Dependency::Instance { name: name.clone() })
                .chain(std::iter::once(Dependency::Kind { kind: target.kind }))
                .collect(),
            Self::BindIdentityRegistry {
                storage: Some(storage),
                registry: Some(registry),
            } => vec![Dependency::Binding {
                storage: storage.clone(),
                registry: registry.clone(),
            }],
            _ => Vec::new(),
        }
    }

    /// Links this resolved operation establishes, for planning.
    pub fn planned_links(&self) -> Option<(String, RegistryLinks)> {
        match self {
            Self::Initialize { target, links } => {
                Some((target.name.clone()?, links.to_links()?))
            }
            _ => None,
        }
    }

    /// Ledger action recorded when this resolved operation completes.
    ///
    /// Deployments are recorded by the registry itself; `created` carries the
    /// identity address for `DeployIdentity`.
    pub fn effect(&self, created: Option<&Address>) -> Result<RecordedAction, ValidationError> {
        let action = match self {
            Self::Deploy { kind } => {
                return Err(ValidationError::InvalidValue {
                    field: "operation".to_string(),
                    message: format!("{kind} deployments are recorded through registration"),
                });
            }
            Self::DeployIdentity { management_key } => RecordedAction::IdentityDeployed {
                identity: created
                    .cloned()
                    .ok_or_else(|| ValidationError::EmptyField {
                        field: "identity".to_string(),
                    })?,
                management_key: management_key.clone(),
            },
            Self::Initialize { target, links } => RecordedAction::Initialized {
                instance: resolved(&target.name, target.kind)?.to_string(),
                links: links.to_links(),
            },
            Self::BindIdentityRegistry { storage, registry } => RecordedAction::Bound {
                storage: resolved(storage, ComponentKind::IdentityRegistryStorage)?.to_string(),
                registry: resolved(registry, ComponentKind::IdentityRegistry)?.to_string(),
            },
            Self::AddAgent { target, agent } => RecordedAction::AgentAdded {
                instance: resolved(&target.name, target.kind)?.to_string(),
                agent: agent.clone(),
            },
            Self::AddClaimTopic { registry, topic } => RecordedAction::ClaimTopicAdded {
                instance: resolved(registry, ComponentKind::ClaimTopicsRegistry)?.to_string(),
                topic: topic.clone(),
            },
            Self::AddTrustedIssuer { registry, issuer } => RecordedAction::TrustedIssuerAdded {
                instance: resolved(registry, ComponentKind::TrustedIssuersRegistry)?.to_string(),
                issuer: issuer.clone(),
            },
            Self::RegisterIdentity {
                registry,
                user,
                identity,
                country_code,
            } => RecordedAction::IdentityRegistered {
                registry: resolved(registry, ComponentKind::IdentityRegistry)?.to_string(),
                user: UserIdentity {
                    wallet_address: user.clone(),
                    identity: Some(identity.address().cloned().ok_or_else(|| {
                        ValidationError::EmptyField {
                            field: "identity.address".to_string(),
                        }
                    })?),
                    country_code: *country_code,
                    verified: false,
                },
            },
            Self::IssueClaim { claim } => RecordedAction::ClaimIssued {
                claim: claim.clone(),
            },
        };
        Ok(action)
    }

    /// Human label for the thing this operation changes.
    pub fn target_label(&self) -> String {
        let name = |n: &Option<String>, kind: ComponentKind| {
            n.clone().unwrap_or_else(|| format!("latest {kind}"))
        };
        match self {
            Self::Deploy { kind } => format!("{kind} deployment"),
            Self::DeployIdentity { management_key } => format!("identity for {management_key}"),
            Self::Initialize { target, .. } => name(&target.name, target.kind),
            Self::BindIdentityRegistry { storage, registry } => format!(
                "binding {} -> {}",
                name(storage, ComponentKind::IdentityRegistryStorage),
                name(registry, ComponentKind::IdentityRegistry)
            ),
            Self::AddAgent { target, agent } => {
                format!("agent {agent} on {}", name(&target.name, target.kind))
            }
            Self::AddClaimTopic { registry, topic } => format!(
                "claim topic {} on {}",
                topic.id,
                name(registry, ComponentKind::ClaimTopicsRegistry)
            ),
            Self::AddTrustedIssuer { registry, issuer } => format!(
                "trusted issuer {} on {}",
                issuer.address,
                name(registry, ComponentKind::TrustedIssuersRegistry)
            ),
            Self::RegisterIdentity { registry, user, .. } => format!(
                "user {user} in {}",
                name(registry, ComponentKind::IdentityRegistry)
            ),
            Self::IssueClaim { claim } => format!(
                "claim topic {} from {} on {}",
                claim.topic, claim.issuer, claim.subject_identity
            ),
        }
    }
}

fn check_name(name: Option<&str>, field: &str) -> Result<(), ValidationError> {
    if name.is_some_and(|n| n.trim().is_empty()) {
        return Err(ValidationError::EmptyField {
            field: field.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerRole {
    Owner,
    Agent,
    Arbitrary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerRequirement {
    pub role: SignerRole,
    /// Identity the signer must present, when one is determined.
    pub identity: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub gas_limit: u64,
}

/// Unsigned payload descriptor handed to the signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedTransaction {
    /// The operation with every instance reference resolved.
    pub operation: Operation,
    /// Contract called; `None` for deployments.
    pub target: Option<Address>,
    pub target_instance: Option<String>,
    /// Call data, or creation bytecode plus constructor arguments.
    pub call_data: String,
    pub signer: SignerRequirement,
    pub limits: ResourceLimits,
    /// blake3 over the canonical JSON of the fields above.
    pub digest: String,
}

#[derive(Serialize)]
struct DigestSeed<'a> {
    operation: &'a Operation,
    target: &'a Option<Address>,
    call_data: &'a str,
    signer: &'a SignerRequirement,
    limits: &'a ResourceLimits,
}

/// Creation bytecode per artifact name.
#[derive(Debug, Clone, Default)]
pub struct ArtifactSet {
    bytecode: BTreeMap<String, Vec<u8>>,
}

impl ArtifactSet {
    /// Load `<Name>.bin` hex files for every kind plus the identity contract.
    /// Missing files are left out and surface at preparation time.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let mut bytecode = BTreeMap::new();
        let names = ComponentKind::ALL
            .iter()
            .map(|k| k.as_str())
            .chain(std::iter::once(IDENTITY_ARTIFACT));
        for name in names {
            let path = dir.join(format!("{name}.bin"));
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!("No artifact for {} at {}", name, path.display());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let bytes = abi::from_hex(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: path.display().to_string(),
                message: "artifact must contain hex bytecode".to_string(),
            })?;
            bytecode.insert(name.to_string(), bytes);
        }
        Ok(Self { bytecode })
    }

    /// Stand-in bytecode for the paper chain: a fixed marker per artifact.
    pub fn placeholder() -> Self {
        let bytecode = ComponentKind::ALL
            .iter()
            .map(|k| k.as_str())
            .chain(std::iter::once(IDENTITY_ARTIFACT))
            .map(|name| {
                let mut code = b"paper:".to_vec();
                code.extend_from_slice(name.as_bytes());
                (name.to_string(), code)
            })
            .collect();
        Self { bytecode }
    }

    pub fn get(&self, name: &str) -> Result<&[u8], ValidationError> {
        self.bytecode
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ValidationError::MissingArtifact {
                name: name.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.bytecode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytecode.is_empty()
    }
}

pub const SIG_INIT: &str = "init()";
pub const SIG_INIT_IDENTITY_REGISTRY: &str = "init(address,address,address)";
pub const SIG_BIND_IDENTITY_REGISTRY: &str = "bindIdentityRegistry(address)";
pub const SIG_ADD_AGENT: &str = "addAgent(address)";
pub const SIG_ADD_CLAIM_TOPIC: &str = "addClaimTopic(uint256)";
pub const SIG_ADD_TRUSTED_ISSUER: &str = "addTrustedIssuer(address,uint256[])";
pub const SIG_REGISTER_IDENTITY: &str = "registerIdentity(address,address,uint16)";
pub const SIG_ADD_CLAIM: &str = "addClaim(uint256,uint256,address,bytes,bytes,string)";

/// Builds payload descriptors.
#[derive(Debug, Clone)]
pub struct Preparer {
    artifacts: ArtifactSet,
    gas_multiplier_percent: u64,
}

impl Preparer {
    pub fn new(artifacts: ArtifactSet, gas_multiplier_percent: u64) -> Self {
        Self {
            artifacts,
            gas_multiplier_percent: gas_multiplier_percent.max(100),
        }
    }

    fn gas_limit(&self, op: &Operation) -> u64 {
        let base: u64 = match op {
            Operation::Deploy { .. } => 4_500_000,
            Operation::DeployIdentity { .. } => 2_000_000,
            Operation::Initialize { target, .. }
                if target.kind == ComponentKind::IdentityRegistry =>
            {
                600_000
            }
            Operation::Initialize { .. } => 400_000,
            Operation::BindIdentityRegistry { .. } => 150_000,
            Operation::AddAgent { .. } => 120_000,
            Operation::AddClaimTopic { .. } => 150_000,
            Operation::AddTrustedIssuer { .. } => 250_000,
            Operation::RegisterIdentity { .. } => 450_000,
            Operation::IssueClaim { .. } => 300_000,
        };
        base.saturating_mul(self.gas_multiplier_percent) / 100
    }

    /// Resolve, validate and encode `op` against `view`.
    pub fn prepare(
        &self,
        op: &Operation,
        view: &RegistryView,
        operator: &Address,
    ) -> Result<PreparedTransaction, ValidationError> {
        let op = op.resolve(view)?;
        let owner = |name: &str| -> Result<SignerRequirement, ValidationError> {
            let instance = view
                .instance(name)
                .ok_or_else(|| ValidationError::UnknownInstance {
                    name: name.to_string(),
                })?;
            Ok(SignerRequirement {
                role: SignerRole::Owner,
                identity: Some(instance.deployer.clone()),
            })
        };
        let arbitrary = SignerRequirement {
            role: SignerRole::Arbitrary,
            identity: None,
        };

        let (target_instance, call_data, signer): (Option<String>, Vec<u8>, SignerRequirement) =
            match &op {
                Operation::Deploy { kind } => {
                    (None, self.artifacts.get(kind.as_str())?.to_vec(), arbitrary)
                }
                Operation::DeployIdentity { management_key } => {
                    let mut code = self.artifacts.get(IDENTITY_ARTIFACT)?.to_vec();
                    code.extend(abi::encode(&[
                        Token::Address(management_key.clone()),
                        Token::Bool(false),
                    ]));
                    (None, code, arbitrary)
                }
                Operation::Initialize { target, links } => {
                    let name = resolved(&target.name, target.kind)?;
                    let data = match links.to_links() {
                        Some(links) => abi::encode_call(
                            SIG_INIT_IDENTITY_REGISTRY,
                            &[
                                Token::Address(address_of(view, &links.trusted_issuers)?),
                                Token::Address(address_of(view, &links.claim_topics)?),
                                Token::Address(address_of(view, &links.identity_storage)?),
                            ],
                        ),
                        None => abi::encode_call(SIG_INIT, &[]),
                    };
                    (Some(name.to_string()), data, owner(name)?)
                }
                Operation::BindIdentityRegistry { storage, registry } => {
                    let storage = resolved(storage, ComponentKind::IdentityRegistryStorage)?;
                    let registry = resolved(registry, ComponentKind::IdentityRegistry)?;
                    let data = abi::encode_call(
                        SIG_BIND_IDENTITY_REGISTRY,
                        &[Token::Address(address_of(view, registry)?)],
                    );
                    (Some(storage.to_string()), data, owner(storage)?)
                }
                Operation::AddAgent { target, agent } => {
                    let name = resolved(&target.name, target.kind)?;
                    let data = abi::encode_call(SIG_ADD_AGENT, &[Token::Address(agent.clone())]);
                    (Some(name.to_string()), data, owner(name)?)
                }
                Operation::AddClaimTopic { registry, topic } => {
                    let name = resolved(registry, ComponentKind::ClaimTopicsRegistry)?;
                    let data = abi::encode_call(
                        SIG_ADD_CLAIM_TOPIC,
                        &[Token::Uint(u128::from(topic.id))],
                    );
                    (Some(name.to_string()), data, owner(name)?)
                }
                Operation::AddTrustedIssuer { registry, issuer } => {
                    let name = resolved(registry, ComponentKind::TrustedIssuersRegistry)?;
                    let data = abi::encode_call(
                        SIG_ADD_TRUSTED_ISSUER,
                        &[
                            Token::Address(issuer.address.clone()),
                            Token::UintArray(
                                issuer.claim_topics.iter().map(|t| u128::from(*t)).collect(),
                            ),
                        ],
                    );
                    (Some(name.to_string()), data, owner(name)?)
                }
                Operation::RegisterIdentity {
                    registry,
                    user,
                    identity,
                    country_code,
                } => {
                    let name = resolved(registry, ComponentKind::IdentityRegistry)?;
                    let identity =
                        identity
                            .address()
                            .cloned()
                            .ok_or_else(|| ValidationError::InvalidValue {
                                field: "identity".to_string(),
                                message: "create_new must deploy the identity before registering"
                                    .to_string(),
                            })?;
                    let data = abi::encode_call(
                        SIG_REGISTER_IDENTITY,
                        &[
                            Token::Address(user.clone()),
                            Token::Address(identity),
                            Token::Uint(u128::from(*country_code)),
                        ],
                    );
                    let agent = if view.is_agent(name, operator) {
                        Some(operator.clone())
                    } else {
                        view.agents_of(name).next().cloned()
                    };
                    let signer = SignerRequirement {
                        role: SignerRole::Agent,
                        identity: agent,
                    };
                    (Some(name.to_string()), data, signer)
                }
                Operation::IssueClaim { claim } => {
                    let data = abi::encode_call(
                        SIG_ADD_CLAIM,
                        &[
                            Token::Uint(u128::from(claim.topic)),
                            Token::Uint(CLAIM_SCHEME_ECDSA),
                            Token::Address(claim.issuer.clone()),
                            Token::Bytes(Vec::new()),
                            Token::Bytes(claim.data_bytes()?),
                            Token::String(String::new()),
                        ],
                    );
                    // The identity's management key holds the claim key.
                    let signer = match view.deployed_identities.get(&claim.subject_identity) {
                        Some(key) => SignerRequirement {
                            role: SignerRole::Owner,
                            identity: Some(key.clone()),
                        },
                        None => arbitrary,
                    };
                    (None, data, signer)
                }
            };

        let target = match (&op, &target_instance) {
            (Operation::IssueClaim { claim }, _) => Some(claim.subject_identity.clone()),
            (_, Some(name)) => Some(address_of(view, name)?),
            (_, None) => None,
        };
        let limits = ResourceLimits {
            gas_limit: self.gas_limit(&op),
        };
        let call_data = abi::to_hex(&call_data);
        let digest = payload_digest(&DigestSeed {
            operation: &op,
            target: &target,
            call_data: &call_data,
            signer: &signer,
            limits: &limits,
        })?;

        Ok(PreparedTransaction {
            operation: op,
            target,
            target_instance,
            call_data,
            signer,
            limits,
            digest,
        })
    }
}

fn payload_digest(seed: &DigestSeed<'_>) -> Result<String, ValidationError> {
    let bytes = serde_json::to_vec(seed).map_err(|e| ValidationError::InvalidValue {
        field: "payload".to_string(),
        message: e.to_string(),
    })?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Best-effort read for an effect that is already in place.
///
/// `op` must be resolved. Checks the registry view first, then the chain; a
/// failing chain read is logged and treated as "not applied".
pub async fn preflight(
    op: &Operation,
    view: &RegistryView,
    chain: &dyn ChainReader,
) -> Result<(), ProvisionError> {
    let duplicate = |detail: String, observed_on_chain: bool| {
        Err(ProvisionError::DuplicateInitialization {
            target: op.target_label(),
            detail,
            observed_on_chain,
        })
    };

    let query = match op {
        Operation::Deploy { .. } | Operation::DeployIdentity { .. } => return Ok(()),
        Operation::Initialize { target, .. } => {
            let name = resolved(&target.name, target.kind)?;
            if view.is_initialized(name) {
                return duplicate("already initialized".to_string(), false);
            }
            StateQuery::Initialized {
                contract: address_of(view, name)?,
            }
        }
        Operation::BindIdentityRegistry { storage, registry } => {
            let storage = resolved(storage, ComponentKind::IdentityRegistryStorage)?;
            let registry = resolved(registry, ComponentKind::IdentityRegistry)?;
            if view.is_bound(storage, registry) {
                return duplicate("already bound".to_string(), false);
            }
            StateQuery::Bound {
                storage: address_of(view, storage)?,
                registry: address_of(view, registry)?,
            }
        }
        Operation::AddAgent { target, agent } => {
            let name = resolved(&target.name, target.kind)?;
            if view.is_agent(name, agent) {
                return duplicate("already an agent".to_string(), false);
            }
            StateQuery::Agent {
                contract: address_of(view, name)?,
                agent: agent.clone(),
            }
        }
        Operation::AddClaimTopic { registry, topic } => {
            let name = resolved(registry, ComponentKind::ClaimTopicsRegistry)?;
            if view.topic(name, topic.id).is_some() {
                return duplicate("topic already registered".to_string(), false);
            }
            StateQuery::ClaimTopic {
                registry: address_of(view, name)?,
                topic: topic.id,
            }
        }
        Operation::AddTrustedIssuer { registry, issuer } => {
            let name = resolved(registry, ComponentKind::TrustedIssuersRegistry)?;
            if view.trusted_issuer(name, &issuer.address).is_some() {
                return duplicate("issuer already trusted".to_string(), false);
            }
            StateQuery::TrustedIssuer {
                registry: address_of(view, name)?,
                issuer: issuer.address.clone(),
            }
        }
        Operation::RegisterIdentity { registry, user, .. } => {
            let name = resolved(registry, ComponentKind::IdentityRegistry)?;
            if view.user(name, user).is_some() {
                return duplicate("user already registered".to_string(), false);
            }
            StateQuery::IdentityRegistered {
                registry: address_of(view, name)?,
                user: user.clone(),
            }
        }
        Operation::IssueClaim { claim } => {
            // Identical claims are skipped; differing data is a replacement.
            if view
                .claim(&claim.subject_identity, claim.topic, &claim.issuer)
                .is_some_and(|existing| existing == claim)
            {
                return duplicate("identical claim already issued".to_string(), false);
            }
            return Ok(());
        }
    };

    match chain.holds(&query).await {
        Ok(true) => duplicate("observed on chain".to_string(), true),
        Ok(false) => Ok(()),
        Err(e) => {
            tracing::warn!(
                "Pre-check read for {} failed, proceeding: {}",
                op.target_label(),
                e
            );
            Ok(())
        }
    }
}
