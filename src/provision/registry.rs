//! Component registry: a materialized view over the deployment ledger.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{LedgerError, ProvisionError};
use crate::provision::kind::ComponentKind;
use crate::provision::ledger::{DeploymentLedger, DeploymentRecord, RecordedAction};
use crate::provision::types::{
    Address, Claim, ClaimTopicEntry, ComponentInstance, RegistryLinks, TransactionRef,
    TrustedIssuerEntry, UserIdentity,
};

/// A storage → registry binding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Binding {
    pub storage: String,
    pub registry: String,
}

/// Registry state derived from ledger records.
///
/// `apply` is the only mutation path and is shared by replay and live
/// updates, so both produce the same view for the same records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryView {
    pub network: String,
    pub instances: BTreeMap<ComponentKind, Vec<ComponentInstance>>,
    pub next_ordinal: BTreeMap<ComponentKind, u32>,
    pub links: BTreeMap<String, RegistryLinks>,
    pub bindings: BTreeSet<Binding>,
    pub agents: BTreeMap<String, BTreeSet<Address>>,
    pub claim_topics: BTreeMap<String, Vec<ClaimTopicEntry>>,
    pub trusted_issuers: BTreeMap<String, Vec<TrustedIssuerEntry>>,
    pub identities: BTreeMap<String, Vec<UserIdentity>>,
    /// Identity contract → management key, for identities deployed here.
    pub deployed_identities: BTreeMap<Address, Address>,
    pub claims: Vec<Claim>,
    pub last_sequence: u64,
    #[serde(skip)]
    effects: BTreeMap<u64, RecordedAction>,
    #[serde(skip)]
    retracted: BTreeSet<u64>,
}

impl RegistryView {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            ..Self::default()
        }
    }

    /// Rebuild from a full record sequence.
    pub fn replay(network: &str, records: &[DeploymentRecord]) -> Result<Self, LedgerError> {
        let mut view = Self::new(network);
        for record in records {
            view.apply(record)?;
        }
        Ok(view)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn instance(&self, name: &str) -> Option<&ComponentInstance> {
        self.instances
            .values()
            .flatten()
            .find(|instance| instance.instance_name == name)
    }

    fn instance_mut(&mut self, name: &str) -> Option<&mut ComponentInstance> {
        self.instances
            .values_mut()
            .flatten()
            .find(|instance| instance.instance_name == name)
    }

    pub fn instance_by_address(&self, address: &Address) -> Option<&ComponentInstance> {
        self.instances
            .values()
            .flatten()
            .find(|instance| &instance.address == address)
    }

    /// All instances of `kind`, in registration order.
    pub fn list_by_kind(&self, kind: ComponentKind) -> &[ComponentInstance] {
        self.instances.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Most recently registered non-retired instance of `kind`.
    pub fn latest(&self, kind: ComponentKind) -> Option<&ComponentInstance> {
        self.list_by_kind(kind).iter().rev().find(|i| !i.retired)
    }

    pub fn next_instance_name(&self, kind: ComponentKind) -> String {
        kind.instance_name(self.next_ordinal.get(&kind).copied().unwrap_or(1))
    }

    pub fn is_initialized(&self, name: &str) -> bool {
        self.instance(name).is_some_and(ComponentInstance::is_live)
    }

    pub fn has_live_instance(&self, kind: ComponentKind) -> bool {
        self.list_by_kind(kind).iter().any(ComponentInstance::is_live)
    }

    pub fn is_bound(&self, storage: &str, registry: &str) -> bool {
        self.bindings.contains(&Binding {
            storage: storage.to_string(),
            registry: registry.to_string(),
        })
    }

    pub fn agents_of(&self, instance: &str) -> impl Iterator<Item = &Address> {
        self.agents.get(instance).into_iter().flatten()
    }

    pub fn is_agent(&self, instance: &str, agent: &Address) -> bool {
        self.agents.get(instance).is_some_and(|set| set.contains(agent))
    }

    pub fn topic(&self, instance: &str, id: u64) -> Option<&ClaimTopicEntry> {
        self.claim_topics
            .get(instance)
            .and_then(|topics| topics.iter().find(|t| t.id == id))
    }

    pub fn trusted_issuer(&self, instance: &str, issuer: &Address) -> Option<&TrustedIssuerEntry> {
        self.trusted_issuers
            .get(instance)
            .and_then(|issuers| issuers.iter().find(|i| &i.address == issuer))
    }

    pub fn user(&self, registry: &str, wallet: &Address) -> Option<&UserIdentity> {
        self.identities
            .get(registry)
            .and_then(|users| users.iter().find(|u| &u.wallet_address == wallet))
    }

    /// An identity deployed here for `wallet` that no registry has bound yet.
    pub fn unbound_identity_for(&self, wallet: &Address) -> Option<&Address> {
        self.deployed_identities
            .iter()
            .filter(|(_, key)| *key == wallet)
            .map(|(identity, _)| identity)
            .find(|identity| {
                !self
                    .identities
                    .values()
                    .flatten()
                    .any(|u| u.identity.as_ref() == Some(*identity))
            })
    }

    pub fn claim(&self, subject: &Address, topic: u64, issuer: &Address) -> Option<&Claim> {
        self.claims.iter().find(|c| {
            &c.subject_identity == subject && c.topic == topic && &c.issuer == issuer
        })
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Check that `record` can be applied on top of this view.
    pub fn check(&self, record: &DeploymentRecord) -> Result<(), String> {
        if record.sequence != self.last_sequence + 1 {
            return Err(format!(
                "expected sequence {}, found {}",
                self.last_sequence + 1,
                record.sequence
            ));
        }
        if record.network != self.network {
            return Ok(());
        }

        match &record.action {
            RecordedAction::Deployed { instance } => {
                let expected = self.next_instance_name(instance.kind);
                if instance.instance_name != expected {
                    return Err(format!(
                        "instance name '{}' collides with ordinal sequence; next {} is '{}'",
                        instance.instance_name, instance.kind, expected
                    ));
                }
                if let Some(existing) = self.instance_by_address(&instance.address) {
                    return Err(format!(
                        "address {} already registered as '{}'",
                        instance.address, existing.instance_name
                    ));
                }
                if self.deployed_identities.contains_key(&instance.address) {
                    return Err(format!("address {} is an identity", instance.address));
                }
            }
            RecordedAction::IdentityDeployed { identity, .. } => {
                if self.deployed_identities.contains_key(identity)
                    || self.instance_by_address(identity).is_some()
                {
                    return Err(format!("identity {identity} already recorded"));
                }
            }
            RecordedAction::Initialized { instance, links } => {
                let target = self.live_instance(instance, None)?;
                if target.initialized {
                    return Err(format!("'{instance}' is already initialized"));
                }
                match (target.kind, links) {
                    (ComponentKind::IdentityRegistry, Some(links)) => {
                        for (kind, name) in links.entries() {
                            self.live_instance(name, Some(kind))?;
                        }
                    }
                    (ComponentKind::IdentityRegistry, None) => {
                        return Err(format!("'{instance}' needs registry links"));
                    }
                    (_, Some(_)) => {
                        return Err(format!("'{instance}' does not take registry links"));
                    }
                    (_, None) => {}
                }
            }
            RecordedAction::Bound { storage, registry } => {
                self.live_instance(storage, Some(ComponentKind::IdentityRegistryStorage))?;
                self.live_instance(registry, Some(ComponentKind::IdentityRegistry))?;
                if self.is_bound(storage, registry) {
                    return Err(format!("'{storage}' is already bound to '{registry}'"));
                }
            }
            RecordedAction::AgentAdded { instance, agent } => {
                self.live_instance(instance, None)?;
                if self.is_agent(instance, agent) {
                    return Err(format!("{agent} is already an agent of '{instance}'"));
                }
            }
            RecordedAction::ClaimTopicAdded { instance, topic } => {
                self.live_instance(instance, Some(ComponentKind::ClaimTopicsRegistry))?;
                if self.topic(instance, topic.id).is_some() {
                    return Err(format!("topic {} already in '{instance}'", topic.id));
                }
            }
            RecordedAction::TrustedIssuerAdded { instance, issuer } => {
                self.live_instance(instance, Some(ComponentKind::TrustedIssuersRegistry))?;
                if self.trusted_issuer(instance, &issuer.address).is_some() {
                    return Err(format!(
                        "issuer {} already trusted by '{instance}'",
                        issuer.address
                    ));
                }
            }
            RecordedAction::IdentityRegistered { registry, user } => {
                self.live_instance(registry, Some(ComponentKind::IdentityRegistry))?;
                if self.user(registry, &user.wallet_address).is_some() {
                    return Err(format!(
                        "{} is already registered in '{registry}'",
                        user.wallet_address
                    ));
                }
                if user.identity.is_none() {
                    return Err("registered identity pointer cannot be empty".to_string());
                }
            }
            RecordedAction::ClaimIssued { .. } => {}
            RecordedAction::Retracted { sequence, .. } => {
                let Some(action) = self.effects.get(sequence) else {
                    return Err(format!("no retractable record {sequence}"));
                };
                if self.retracted.contains(sequence) {
                    return Err(format!("record {sequence} is already retracted"));
                }
                if matches!(
                    action,
                    RecordedAction::Initialized { .. } | RecordedAction::Retracted { .. }
                ) {
                    return Err(format!(
                        "record {sequence} ({}) cannot be retracted",
                        action.label()
                    ));
                }
            }
        }
        Ok(())
    }

    fn live_instance(
        &self,
        name: &str,
        kind: Option<ComponentKind>,
    ) -> Result<&ComponentInstance, String> {
        let instance = self
            .instance(name)
            .ok_or_else(|| format!("unknown instance '{name}'"))?;
        if instance.retired {
            return Err(format!("instance '{name}' is retired"));
        }
        if let Some(kind) = kind
            && instance.kind != kind
        {
            return Err(format!("instance '{name}' is a {}, expected {kind}", instance.kind));
        }
        Ok(instance)
    }

    /// Validate and apply one record.
    pub fn apply(&mut self, record: &DeploymentRecord) -> Result<(), LedgerError> {
        self.check(record)
            .map_err(|reason| LedgerError::InvalidRecord {
                sequence: record.sequence,
                reason,
            })?;
        self.last_sequence = record.sequence;
        if record.network != self.network {
            return Ok(());
        }
        self.mutate(&record.action);
        self.effects.insert(record.sequence, record.action.clone());
        self.refresh_verification();
        Ok(())
    }

    fn mutate(&mut self, action: &RecordedAction) {
        match action {
            RecordedAction::Deployed { instance } => {
                let ordinal = self.next_ordinal.entry(instance.kind).or_insert(1);
                *ordinal += 1;
                self.instances
                    .entry(instance.kind)
                    .or_default()
                    .push(ComponentInstance {
                        initialized: false,
                        retired: false,
                        ..instance.clone()
                    });
            }
            RecordedAction::IdentityDeployed {
                identity,
                management_key,
            } => {
                self.deployed_identities
                    .insert(identity.clone(), management_key.clone());
            }
            RecordedAction::Initialized { instance, links } => {
                if let Some(target) = self.instance_mut(instance) {
                    target.initialized = true;
                }
                if let Some(links) = links {
                    self.links.insert(instance.clone(), links.clone());
                }
            }
            RecordedAction::Bound { storage, registry } => {
                self.bindings.insert(Binding {
                    storage: storage.clone(),
                    registry: registry.clone(),
                });
            }
            RecordedAction::AgentAdded { instance, agent } => {
                self.agents
                    .entry(instance.clone())
                    .or_default()
                    .insert(agent.clone());
            }
            RecordedAction::ClaimTopicAdded { instance, topic } => {
                self.claim_topics
                    .entry(instance.clone())
                    .or_default()
                    .push(topic.clone());
            }
            RecordedAction::TrustedIssuerAdded { instance, issuer } => {
                self.trusted_issuers
                    .entry(instance.clone())
                    .or_default()
                    .push(issuer.clone());
            }
            RecordedAction::IdentityRegistered { registry, user } => {
                self.identities
                    .entry(registry.clone())
                    .or_default()
                    .push(user.clone());
            }
            RecordedAction::ClaimIssued { claim } => {
                // Same (subject, topic, issuer) replaces: the claim id is derived from issuer + topic.
                self.claims.retain(|c| {
                    !(c.subject_identity == claim.subject_identity
                        && c.topic == claim.topic
                        && c.issuer == claim.issuer)
                });
                self.claims.push(claim.clone());
            }
            RecordedAction::Retracted { sequence, .. } => {
                if let Some(original) = self.effects.get(sequence).cloned() {
                    self.undo(&original);
                    self.retracted.insert(*sequence);
                }
            }
        }
    }

    fn undo(&mut self, action: &RecordedAction) {
        match action {
            RecordedAction::Deployed { instance } => {
                if let Some(target) = self.instance_mut(&instance.instance_name) {
                    target.retired = true;
                }
            }
            RecordedAction::IdentityDeployed { identity, .. } => {
                self.deployed_identities.remove(identity);
            }
            RecordedAction::Bound { storage, registry } => {
                self.bindings.remove(&Binding {
                    storage: storage.clone(),
                    registry: registry.clone(),
                });
            }
            RecordedAction::AgentAdded { instance, agent } => {
                if let Some(set) = self.agents.get_mut(instance) {
                    set.remove(agent);
                }
            }
            RecordedAction::ClaimTopicAdded { instance, topic } => {
                if let Some(topics) = self.claim_topics.get_mut(instance) {
                    topics.retain(|t| t.id != topic.id);
                }
            }
            RecordedAction::TrustedIssuerAdded { instance, issuer } => {
                if let Some(issuers) = self.trusted_issuers.get_mut(instance) {
                    issuers.retain(|i| i.address != issuer.address);
                }
            }
            RecordedAction::IdentityRegistered { registry, user } => {
                if let Some(users) = self.identities.get_mut(registry) {
                    users.retain(|u| u.wallet_address != user.wallet_address);
                }
            }
            RecordedAction::ClaimIssued { claim } => {
                self.claims.retain(|c| c != claim);
            }
            RecordedAction::Initialized { .. } | RecordedAction::Retracted { .. } => {}
        }
    }

    /// Recompute `verified` for every registered user.
    ///
    /// A user is verified when, for every topic required by the registry's
    /// claim topics registry, their identity holds a claim of that topic from
    /// an issuer the linked trusted issuers registry trusts for it.
    fn refresh_verification(&mut self) {
        let mut updates = Vec::new();
        for (registry, users) in &self.identities {
            let links = self.links.get(registry);
            for (index, user) in users.iter().enumerate() {
                let verified = match (links, &user.identity) {
                    (Some(links), Some(identity)) => {
                        let required = self
                            .claim_topics
                            .get(&links.claim_topics)
                            .map(Vec::as_slice)
                            .unwrap_or(&[]);
                        let issuers = self
                            .trusted_issuers
                            .get(&links.trusted_issuers)
                            .map(Vec::as_slice)
                            .unwrap_or(&[]);
                        required.iter().all(|topic| {
                            self.claims.iter().any(|c| {
                                &c.subject_identity == identity
                                    && c.topic == topic.id
                                    && issuers.iter().any(|i| {
                                        i.address == c.issuer && i.claim_topics.contains(&topic.id)
                                    })
                            })
                        })
                    }
                    _ => false,
                };
                if user.verified != verified {
                    updates.push((registry.clone(), index, verified));
                }
            }
        }
        for (registry, index, verified) in updates {
            if let Some(user) = self
                .identities
                .get_mut(&registry)
                .and_then(|users| users.get_mut(index))
            {
                user.verified = verified;
            }
        }
    }
}

/// Linearized registry over a durable ledger.
pub struct ComponentRegistry {
    ledger: Arc<dyn DeploymentLedger>,
    network: String,
    view: Mutex<RegistryView>,
    in_flight: std::sync::Mutex<HashSet<(Address, ComponentKind)>>,
}

impl ComponentRegistry {
    /// Open the registry by replaying the full ledger.
    pub async fn open(
        ledger: Arc<dyn DeploymentLedger>,
        network: impl Into<String>,
    ) -> Result<Self, LedgerError> {
        let network = network.into();
        let records = ledger.replay_all().await?;
        let view = RegistryView::replay(&network, &records)?;
        tracing::info!(
            "Registry rebuilt from {} ({} records, network {})",
            ledger.describe(),
            records.len(),
            network
        );
        Ok(Self {
            ledger,
            network,
            view: Mutex::new(view),
            in_flight: std::sync::Mutex::new(HashSet::new()),
        })
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn ledger(&self) -> &Arc<dyn DeploymentLedger> {
        &self.ledger
    }

    /// Register a newly deployed instance under the next ordinal name.
    ///
    /// `requested_name`, when given, must be exactly the name that would be
    /// assigned; anything else is an ordinal collision.
    pub async fn register(
        &self,
        kind: ComponentKind,
        address: Address,
        deployer: Address,
        requested_name: Option<&str>,
        transaction: Option<TransactionRef>,
    ) -> Result<ComponentInstance, ProvisionError> {
        let mut view = self.view.lock().await;
        let instance_name = view.next_instance_name(kind);
        if let Some(requested) = requested_name
            && requested != instance_name
        {
            return Err(ProvisionError::Conflict(format!(
                "instance name '{requested}' does not match the next {kind} ordinal '{instance_name}'"
            )));
        }

        let instance = ComponentInstance {
            kind,
            instance_name,
            address,
            deployer: deployer.clone(),
            network: self.network.clone(),
            created_at: Utc::now(),
            initialized: false,
            retired: false,
        };
        self.commit(
            &mut view,
            RecordedAction::Deployed {
                instance: instance.clone(),
            },
            deployer,
            transaction,
        )
        .await?;
        tracing::info!(
            "Registered {} '{}' at {}",
            kind,
            instance.instance_name,
            instance.address
        );
        Ok(instance)
    }

    /// Append and apply a non-deploy action.
    pub async fn record(
        &self,
        action: RecordedAction,
        operator: Address,
        transaction: Option<TransactionRef>,
    ) -> Result<DeploymentRecord, ProvisionError> {
        let mut view = self.view.lock().await;
        self.commit(&mut view, action, operator, transaction).await
    }

    async fn commit(
        &self,
        view: &mut RegistryView,
        action: RecordedAction,
        operator: Address,
        transaction: Option<TransactionRef>,
    ) -> Result<DeploymentRecord, ProvisionError> {
        let record = DeploymentRecord {
            sequence: view.last_sequence + 1,
            recorded_at: Utc::now(),
            operator,
            network: self.network.clone(),
            transaction,
            action,
        };
        view.check(&record).map_err(ProvisionError::Conflict)?;

        // Durable first; the view only changes once the append succeeded.
        self.ledger.append(&record).await?;
        view.apply(&record)?;
        tracing::debug!(
            "Ledger record {} ({}) committed",
            record.sequence,
            record.action.label()
        );
        Ok(record)
    }

    pub async fn snapshot(&self) -> RegistryView {
        self.view.lock().await.clone()
    }

    pub async fn list_by_kind(&self, kind: ComponentKind) -> Vec<ComponentInstance> {
        self.view.lock().await.list_by_kind(kind).to_vec()
    }

    pub async fn latest(&self, kind: ComponentKind) -> Option<ComponentInstance> {
        self.view.lock().await.latest(kind).cloned()
    }

    pub async fn records(&self) -> Result<Vec<DeploymentRecord>, LedgerError> {
        self.ledger.replay_all().await
    }

    /// Claim the in-progress flag for `(operator, kind)`.
    pub fn begin_deployment(
        &self,
        operator: &Address,
        kind: ComponentKind,
    ) -> Result<DeploymentGuard<'_>, ProvisionError> {
        let key = (operator.clone(), kind);
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !in_flight.insert(key.clone()) {
            return Err(ProvisionError::DeploymentInProgress {
                kind,
                operator: operator.clone(),
            });
        }
        Ok(DeploymentGuard {
            registry: self,
            key,
        })
    }
}

/// Releases the in-progress flag on drop.
pub struct DeploymentGuard<'a> {
    registry: &'a ComponentRegistry,
    key: (Address, ComponentKind),
}

impl Drop for DeploymentGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.key);
    }
}
