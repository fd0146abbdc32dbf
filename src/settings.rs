//! File-backed settings.
//!
//! Stores operator preferences in `~/.registry-provisioner/config.toml`.
//! Settings are resolved with env var > config.toml > default priority.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Settings persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub chain: ChainSettings,

    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub gateway: GatewaySettings,
}

/// Target network and confirmation tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainSettings {
    /// Network identifier records are tagged with.
    #[serde(default = "default_network")]
    pub network: String,

    /// "paper" or "live".
    #[serde(default = "default_mode")]
    pub mode: String,

    #[serde(default)]
    pub rpc_url: Option<String>,

    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Directory holding `<Kind>.bin` creation bytecode.
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,

    /// Identity recorded as the operator of every action.
    #[serde(default)]
    pub operator_address: Option<String>,

    /// Gas limit multiplier, in percent of the base estimate.
    #[serde(default = "default_gas_multiplier_percent")]
    pub gas_multiplier_percent: u64,
}

fn default_network() -> String {
    "paper".to_string()
}

fn default_mode() -> String {
    "paper".to_string()
}

fn default_confirmation_timeout_ms() -> u64 {
    120_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_gas_multiplier_percent() -> u64 {
    120
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            network: default_network(),
            mode: default_mode(),
            rpc_url: None,
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            artifacts_dir: None,
            operator_address: None,
            gas_multiplier_percent: default_gas_multiplier_percent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LedgerSettings {
    /// JSONL ledger file. Defaults to `~/.registry-provisioner/ledger/<network>.jsonl`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_host")]
    pub host: String,

    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    3030
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

impl Settings {
    /// Base directory for provisioner state (`~/.registry-provisioner`).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".registry-provisioner")
    }

    /// Default TOML config file path (~/.registry-provisioner/config.toml).
    pub fn default_toml_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Load settings from a TOML file.
    ///
    /// Returns `Ok(None)` if the file does not exist.
    pub fn load_toml(path: &std::path::Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };

        let settings: Self = toml::from_str(&data)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))?;
        Ok(Some(settings))
    }

    /// Merge values from `other` that differ from the defaults.
    pub fn merge_from(&mut self, other: &Self) {
        let default_json = match serde_json::to_value(Self::default()) {
            Ok(v) => v,
            Err(_) => return,
        };
        let other_json = match serde_json::to_value(other) {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut self_json = match serde_json::to_value(&*self) {
            Ok(v) => v,
            Err(_) => return,
        };

        merge_non_default(&mut self_json, &other_json, &default_json);

        if let Ok(merged) = serde_json::from_value(self_json) {
            *self = merged;
        }
    }
}

fn merge_non_default(
    target: &mut serde_json::Value,
    other: &serde_json::Value,
    defaults: &serde_json::Value,
) {
    match (target, other, defaults) {
        (
            serde_json::Value::Object(t),
            serde_json::Value::Object(o),
            serde_json::Value::Object(d),
        ) => {
            for (key, other_val) in o {
                let default_val = d.get(key).cloned().unwrap_or(serde_json::Value::Null);
                if let Some(target_val) = t.get_mut(key) {
                    merge_non_default(target_val, other_val, &default_val);
                } else if other_val != &default_val {
                    t.insert(key.clone(), other_val.clone());
                }
            }
        }
        (target, other, defaults) => {
            if other != defaults {
                *target = other.clone();
            }
        }
    }
}
