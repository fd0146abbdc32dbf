//! Dependency graph resolver.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DependencyError;
use crate::provision::kind::ComponentKind;
use crate::provision::registry::RegistryView;

/// Something a step needs before it can run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Dependency {
    /// Any live (initialized, not retired) instance of the kind.
    Kind { kind: ComponentKind },
    /// This exact instance, initialized.
    Instance { name: String },
    /// The storage → registry binding.
    Binding { storage: String, registry: String },
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind { kind } => write!(f, "kind {kind}"),
            Self::Instance { name } => write!(f, "instance {name}"),
            Self::Binding { storage, registry } => write!(f, "binding {storage} -> {registry}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub unmet: Vec<Dependency>,
}

/// Per-dependency row of a kind status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyStatus {
    pub kind: ComponentKind,
    pub satisfied: bool,
    pub deployed: usize,
    pub initialized: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindStatus {
    pub kind: ComponentKind,
    pub ready: bool,
    pub dependencies: Vec<DependencyStatus>,
    pub unmet: Vec<Dependency>,
    pub instances: Vec<String>,
}

/// Static kind → required kinds graph, checked acyclic at construction.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    edges: BTreeMap<ComponentKind, Vec<ComponentKind>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl DependencyGraph {
    pub fn from_rules<I>(rules: I) -> Result<Self, DependencyError>
    where
        I: IntoIterator<Item = (ComponentKind, Vec<ComponentKind>)>,
    {
        let edges: BTreeMap<_, _> = rules.into_iter().collect();
        let mut marks = BTreeMap::new();
        let mut stack = Vec::new();
        for kind in edges.keys() {
            visit(*kind, &edges, &mut marks, &mut stack)?;
        }
        Ok(Self { edges })
    }

    /// The fixed suite's graph.
    pub fn standard() -> Result<Self, DependencyError> {
        Self::from_rules(
            ComponentKind::ALL
                .into_iter()
                .map(|kind| (kind, kind.init_dependencies().to_vec())),
        )
    }

    pub fn dependencies_of(&self, kind: ComponentKind) -> &[ComponentKind] {
        self.edges.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_satisfied(&self, dependency: &Dependency, view: &RegistryView) -> bool {
        match dependency {
            Dependency::Kind { kind } => view.has_live_instance(*kind),
            Dependency::Instance { name } => view.is_initialized(name),
            Dependency::Binding { storage, registry } => view.is_bound(storage, registry),
        }
    }

    pub fn readiness<'a, I>(&self, dependencies: I, view: &RegistryView) -> Readiness
    where
        I: IntoIterator<Item = &'a Dependency>,
    {
        let unmet: Vec<Dependency> = dependencies
            .into_iter()
            .filter(|dep| !self.is_satisfied(dep, view))
            .cloned()
            .collect();
        Readiness {
            ready: unmet.is_empty(),
            unmet,
        }
    }

    /// Readiness report for initializing an instance of `kind`.
    pub fn kind_status(&self, kind: ComponentKind, view: &RegistryView) -> KindStatus {
        let dependencies: Vec<DependencyStatus> = self
            .dependencies_of(kind)
            .iter()
            .map(|dep| {
                let instances = view.list_by_kind(*dep);
                let deployed = instances.iter().filter(|i| !i.retired).count();
                let initialized = instances.iter().filter(|i| i.is_live()).count();
                let guidance = if initialized > 0 {
                    None
                } else if deployed == 0 {
                    Some(format!("Deploy a {dep} and initialize it before {kind}"))
                } else {
                    let pending: Vec<&str> = instances
                        .iter()
                        .filter(|i| !i.retired)
                        .map(|i| i.instance_name.as_str())
                        .collect();
                    Some(format!(
                        "Initialize {} ({}) before {kind}",
                        dep,
                        pending.join(", ")
                    ))
                };
                DependencyStatus {
                    kind: *dep,
                    satisfied: initialized > 0,
                    deployed,
                    initialized,
                    guidance,
                }
            })
            .collect();

        let required: BTreeSet<Dependency> = self
            .dependencies_of(kind)
            .iter()
            .map(|k| Dependency::Kind { kind: *k })
            .collect();
        let readiness = self.readiness(&required, view);

        KindStatus {
            kind,
            ready: readiness.ready,
            dependencies,
            unmet: readiness.unmet,
            instances: view
                .list_by_kind(kind)
                .iter()
                .map(|i| i.instance_name.clone())
                .collect(),
        }
    }
}

fn visit(
    kind: ComponentKind,
    edges: &BTreeMap<ComponentKind, Vec<ComponentKind>>,
    marks: &mut BTreeMap<ComponentKind, Mark>,
    stack: &mut Vec<ComponentKind>,
) -> Result<(), DependencyError> {
    match marks.get(&kind) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|k| *k == kind).unwrap_or(0);
            let mut path = stack[start..].to_vec();
            path.push(kind);
            return Err(DependencyError::Cycle { path });
        }
        None => {}
    }

    marks.insert(kind, Mark::Visiting);
    stack.push(kind);
    for dep in edges.get(&kind).into_iter().flatten() {
        visit(*dep, edges, marks, stack)?;
    }
    stack.pop();
    marks.insert(kind, Mark::Done);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::ledger::{DeploymentRecord, RecordedAction};
    use crate::provision::types::{Address, ComponentInstance};
    use chrono::Utc;

    fn deploy(view: &mut RegistryView, kind: ComponentKind, byte: u8) -> String {
        let name = view.next_instance_name(kind);
        let record = DeploymentRecord {
            sequence: view.last_sequence + 1,
            recorded_at: Utc::now(),
            operator: Address::from_bytes(&[0xee; 20]),
            network: "paper".to_string(),
            transaction: None,
            action: RecordedAction::Deployed {
                instance: ComponentInstance {
                    kind,
                    instance_name: name.clone(),
                    address: Address::from_bytes(&[byte; 20]),
                    deployer: Address::from_bytes(&[0xee; 20]),
                    network: "paper".to_string(),
                    created_at: Utc::now(),
                    initialized: false,
                    retired: false,
                },
            },
        };
        view.apply(&record).unwrap();
        name
    }

    fn initialize(view: &mut RegistryView, name: &str) {
        let record = DeploymentRecord {
            sequence: view.last_sequence + 1,
            recorded_at: Utc::now(),
            operator: Address::from_bytes(&[0xee; 20]),
            network: "paper".to_string(),
            transaction: None,
            action: RecordedAction::Initialized {
                instance: name.to_string(),
                links: None,
            },
        };
        view.apply(&record).unwrap();
    }

    #[test]
    fn standard_graph_is_acyclic() {
        let graph = DependencyGraph::standard().unwrap();
        assert_eq!(graph.dependencies_of(ComponentKind::IdentityRegistry).len(), 3);
    }

    #[test]
    fn cycles_fail_fast_with_path() {
        let err = DependencyGraph::from_rules([
            (
                ComponentKind::IdentityRegistry,
                vec![ComponentKind::ClaimTopicsRegistry],
            ),
            (
                ComponentKind::ClaimTopicsRegistry,
                vec![ComponentKind::IdentityRegistry],
            ),
        ])
        .unwrap_err();

        let DependencyError::Cycle { path } = err;
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn deployed_but_uninitialized_does_not_satisfy_kind() {
        let graph = DependencyGraph::standard().unwrap();
        let mut view = RegistryView::new("paper");
        let ctr = deploy(&mut view, ComponentKind::ClaimTopicsRegistry, 1);
        let tir = deploy(&mut view, ComponentKind::TrustedIssuersRegistry, 2);
        let irs = deploy(&mut view, ComponentKind::IdentityRegistryStorage, 3);

        let status = graph.kind_status(ComponentKind::IdentityRegistry, &view);
        assert!(!status.ready);
        assert_eq!(status.unmet.len(), 3);
        assert!(
            status.dependencies[0]
                .guidance
                .as_deref()
                .unwrap()
                .starts_with("Initialize")
        );

        initialize(&mut view, &ctr);
        initialize(&mut view, &tir);
        assert!(!graph.kind_status(ComponentKind::IdentityRegistry, &view).ready);

        initialize(&mut view, &irs);
        let status = graph.kind_status(ComponentKind::IdentityRegistry, &view);
        assert!(status.ready);
        assert!(status.unmet.is_empty());
    }

    #[test]
    fn instance_dependency_requires_that_exact_instance() {
        let graph = DependencyGraph::standard().unwrap();
        let mut view = RegistryView::new("paper");
        let first = deploy(&mut view, ComponentKind::IdentityRegistryStorage, 1);
        let second = deploy(&mut view, ComponentKind::IdentityRegistryStorage, 2);
        initialize(&mut view, &first);

        let wants_second = [Dependency::Instance {
            name: second.clone(),
        }];
        let readiness = graph.readiness(&wants_second, &view);
        assert!(!readiness.ready);
        assert_eq!(readiness.unmet, wants_second.to_vec());

        initialize(&mut view, &second);
        assert!(graph.readiness(&wants_second, &view).ready);
    }

    #[test]
    fn missing_kind_guidance_says_deploy() {
        let graph = DependencyGraph::standard().unwrap();
        let view = RegistryView::new("paper");
        let status = graph.kind_status(ComponentKind::IdentityRegistry, &view);
        assert!(
            status
                .dependencies
                .iter()
                .all(|d| d.guidance.as_deref().is_some_and(|g| g.starts_with("Deploy")))
        );
        assert!(graph.kind_status(ComponentKind::ModularCompliance, &view).ready);
    }
}
