//! The fixed suite of provisionable component kinds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Category of provisionable unit.
///
/// The suite is fixed; dependency rules are attached statically through
/// [`ComponentKind::init_dependencies`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComponentKind {
    IdentityRegistryStorage,
    ClaimTopicsRegistry,
    TrustedIssuersRegistry,
    ModularCompliance,
    IdentityRegistry,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        Self::IdentityRegistryStorage,
        Self::ClaimTopicsRegistry,
        Self::TrustedIssuersRegistry,
        Self::ModularCompliance,
        Self::IdentityRegistry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdentityRegistryStorage => "IdentityRegistryStorage",
            Self::ClaimTopicsRegistry => "ClaimTopicsRegistry",
            Self::TrustedIssuersRegistry => "TrustedIssuersRegistry",
            Self::ModularCompliance => "ModularCompliance",
            Self::IdentityRegistry => "IdentityRegistry",
        }
    }

    /// Kinds that must have an initialized instance before this kind can be
    /// initialized.
    pub fn init_dependencies(self) -> &'static [ComponentKind] {
        match self {
            Self::IdentityRegistry => &[
                Self::TrustedIssuersRegistry,
                Self::ClaimTopicsRegistry,
                Self::IdentityRegistryStorage,
            ],
            _ => &[],
        }
    }

    /// Whether agents can be granted on instances of this kind.
    pub fn supports_agents(self) -> bool {
        matches!(self, Self::IdentityRegistry | Self::IdentityRegistryStorage)
    }

    /// Name for the `ordinal`-th instance of this kind (1-based).
    ///
    /// The first instance carries the bare kind name; later ones get `_N`.
    pub fn instance_name(self, ordinal: u32) -> String {
        if ordinal <= 1 {
            self.as_str().to_string()
        } else {
            format!("{}_{}", self.as_str(), ordinal)
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().to_ascii_lowercase() == normalized)
            .ok_or_else(|| ValidationError::UnknownKind(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!(
            "identity_registry_storage".parse::<ComponentKind>().unwrap(),
            ComponentKind::IdentityRegistryStorage
        );
        assert_eq!(
            "Claim-Topics-Registry".parse::<ComponentKind>().unwrap(),
            ComponentKind::ClaimTopicsRegistry
        );
        assert!(matches!(
            "Token".parse::<ComponentKind>(),
            Err(ValidationError::UnknownKind(_))
        ));
    }

    #[test]
    fn instance_names_use_ordinal_suffix_after_first() {
        let kind = ComponentKind::ClaimTopicsRegistry;
        assert_eq!(kind.instance_name(1), "ClaimTopicsRegistry");
        assert_eq!(kind.instance_name(2), "ClaimTopicsRegistry_2");
        assert_eq!(kind.instance_name(7), "ClaimTopicsRegistry_7");
    }

    #[test]
    fn identity_registry_depends_on_three_registries() {
        let deps = ComponentKind::IdentityRegistry.init_dependencies();
        assert_eq!(deps.len(), 3);
        assert!(!deps.contains(&ComponentKind::ModularCompliance));
        assert!(ComponentKind::ModularCompliance.init_dependencies().is_empty());
    }
}
