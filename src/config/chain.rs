use std::path::PathBuf;
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_env_or};
use crate::config::normalize_variant;
use crate::error::ConfigError;
use crate::provision::types::Address;
use crate::settings::Settings;

/// Identity used as operator in paper mode when none is configured.
pub const PAPER_OPERATOR: &str = "0x00000000000000000000000000000000000000a1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// In-process paper chain acting as signer and ledger.
    Paper,
    /// JSON-RPC reads plus the external signature desk.
    Live,
}

impl ChainMode {
    fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "paper" => Ok(Self::Paper),
            "live" => Ok(Self::Live),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'paper' or 'live', got '{value}'"),
            }),
        }
    }
}

/// Chain access and confirmation resolved config.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub network: String,
    pub mode: ChainMode,
    pub rpc_url: Option<String>,
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    pub artifacts_dir: Option<PathBuf>,
    pub operator: Address,
    pub gas_multiplier_percent: u64,
}

impl ChainConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let network = optional_env("PROVISIONER_NETWORK")?
            .unwrap_or_else(|| settings.chain.network.clone());
        if network.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "PROVISIONER_NETWORK".to_string(),
                message: "cannot be empty".to_string(),
            });
        }

        let mode = ChainMode::parse(
            &optional_env("PROVISIONER_CHAIN_MODE")?
                .unwrap_or_else(|| settings.chain.mode.clone()),
            "PROVISIONER_CHAIN_MODE",
        )?;

        let rpc_url = optional_env("PROVISIONER_RPC_URL")?.or_else(|| settings.chain.rpc_url.clone());
        if let Some(raw) = &rpc_url {
            let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
                key: "PROVISIONER_RPC_URL".to_string(),
                message: format!("must be a valid URL: {e}"),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidValue {
                    key: "PROVISIONER_RPC_URL".to_string(),
                    message: format!("unsupported scheme '{}'", parsed.scheme()),
                });
            }
        } else if mode == ChainMode::Live {
            return Err(ConfigError::MissingRequired {
                key: "PROVISIONER_RPC_URL".to_string(),
                hint: "Live mode reads receipts and contract state over JSON-RPC.".to_string(),
            });
        }

        let timeout_ms = parse_env_or(
            "PROVISIONER_CONFIRMATION_TIMEOUT_MS",
            settings.chain.confirmation_timeout_ms,
            "a positive integer",
        )?;
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PROVISIONER_CONFIRMATION_TIMEOUT_MS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let poll_ms = parse_env_or(
            "PROVISIONER_POLL_INTERVAL_MS",
            settings.chain.poll_interval_ms,
            "a positive integer",
        )?;
        if poll_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PROVISIONER_POLL_INTERVAL_MS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let gas_multiplier_percent = parse_env_or(
            "PROVISIONER_GAS_MULTIPLIER_PERCENT",
            settings.chain.gas_multiplier_percent,
            "an integer percentage",
        )?;
        if gas_multiplier_percent < 100 {
            return Err(ConfigError::InvalidValue {
                key: "PROVISIONER_GAS_MULTIPLIER_PERCENT".to_string(),
                message: "must be >= 100".to_string(),
            });
        }

        let operator = match optional_env("PROVISIONER_OPERATOR_ADDRESS")?
            .or_else(|| settings.chain.operator_address.clone())
        {
            Some(raw) => Address::parse_actor("PROVISIONER_OPERATOR_ADDRESS", &raw).map_err(
                |e| ConfigError::InvalidValue {
                    key: "PROVISIONER_OPERATOR_ADDRESS".to_string(),
                    message: e.to_string(),
                },
            )?,
            None if mode == ChainMode::Paper => Address::parse("operator", PAPER_OPERATOR)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?,
            None => {
                return Err(ConfigError::MissingRequired {
                    key: "PROVISIONER_OPERATOR_ADDRESS".to_string(),
                    hint: "Set the wallet address that deploys and owns the suite.".to_string(),
                });
            }
        };

        Ok(Self {
            network: network.trim().to_string(),
            mode,
            rpc_url,
            confirmation_timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(poll_ms),
            artifacts_dir: optional_env("PROVISIONER_ARTIFACTS_DIR")?
                .map(PathBuf::from)
                .or_else(|| settings.chain.artifacts_dir.clone()),
            operator,
            gas_multiplier_percent,
        })
    }
}

/// Deployment ledger resolved config.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub path: PathBuf,
}

impl LedgerConfig {
    pub(crate) fn resolve(settings: &Settings, network: &str) -> Result<Self, ConfigError> {
        let path = optional_env("PROVISIONER_LEDGER_PATH")?
            .map(PathBuf::from)
            .or_else(|| settings.ledger.path.clone())
            .unwrap_or_else(|| default_ledger_path(network));
        Ok(Self { path })
    }
}

fn default_ledger_path(network: &str) -> PathBuf {
    let file: String = network
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    Settings::home_dir()
        .join("ledger")
        .join(format!("{file}.jsonl"))
}
