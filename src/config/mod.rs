//! Configuration for the provisioner.
//!
//! Settings are loaded with priority: env var > TOML file > default.
//! `./.env` and `~/.registry-provisioner/.env` are loaded via dotenvy early
//! in startup; neither overrides variables already set in the environment.

mod chain;
mod gateway;
pub(crate) mod helpers;

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::settings::Settings;

pub use self::chain::{ChainConfig, ChainMode, LedgerConfig, PAPER_OPERATOR};
pub use self::gateway::GatewayConfig;

/// Main configuration for the provisioner.
#[derive(Debug, Clone)]
pub struct Config {
    pub chain: ChainConfig,
    pub ledger: LedgerConfig,
    pub gateway: GatewayConfig,
}

fn normalize_variant(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

impl Config {
    /// Load configuration from the environment and the default TOML file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional TOML config file overlay.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        crate::bootstrap::load_provisioner_env();
        let mut settings = Settings::default();

        Self::apply_toml_overlay(&mut settings, toml_path)?;

        Self::build(&settings)
    }

    /// Load and merge a TOML config file into settings.
    ///
    /// If `explicit_path` is `Some`, loads from that path (errors are fatal).
    /// If `None`, tries the default path `~/.registry-provisioner/config.toml`
    /// (missing file is silently ignored).
    fn apply_toml_overlay(
        settings: &mut Settings,
        explicit_path: Option<&Path>,
    ) -> Result<(), ConfigError> {
        let path = explicit_path
            .map(PathBuf::from)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(toml_settings)) => {
                settings.merge_from(&toml_settings);
                tracing::debug!("Loaded TOML config from {}", path.display());
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Failed to load config file {}: {}",
                        path.display(),
                        e
                    )));
                }
                tracing::warn!("Failed to load default config file: {}", e);
            }
        }
        Ok(())
    }

    /// Build config from merged settings.
    pub(crate) fn build(settings: &Settings) -> Result<Self, ConfigError> {
        let chain = ChainConfig::resolve(settings)?;
        let ledger = LedgerConfig::resolve(settings, &chain.network)?;
        Ok(Self {
            ledger,
            gateway: GatewayConfig::resolve(settings)?,
            chain,
        })
    }
}

#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::time::Duration;

    const KEYS: [&str; 11] = [
        "PROVISIONER_NETWORK",
        "PROVISIONER_CHAIN_MODE",
        "PROVISIONER_RPC_URL",
        "PROVISIONER_CONFIRMATION_TIMEOUT_MS",
        "PROVISIONER_POLL_INTERVAL_MS",
        "PROVISIONER_LEDGER_PATH",
        "PROVISIONER_ARTIFACTS_DIR",
        "PROVISIONER_OPERATOR_ADDRESS",
        "GATEWAY_HOST",
        "GATEWAY_PORT",
        "GATEWAY_AUTH_TOKEN",
    ];

    fn clear_env() {
        for key in KEYS {
            // SAFETY: Guarded by ENV_MUTEX in tests.
            unsafe {
                std::env::remove_var(key);
            }
        }
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::remove_var("PROVISIONER_GAS_MULTIPLIER_PERCENT");
        }
    }

    #[test]
    fn defaults_select_paper_mode() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let config = Config::build(&Settings::default()).unwrap();

        assert_eq!(config.chain.mode, ChainMode::Paper);
        assert_eq!(config.chain.network, "paper");
        assert_eq!(config.chain.operator.as_str(), PAPER_OPERATOR);
        assert_eq!(config.chain.confirmation_timeout, Duration::from_secs(120));
        assert!(config.ledger.path.ends_with("ledger/paper.jsonl"));
        assert_eq!(config.gateway.port, 3030);
        assert!(config.gateway.auth_token_generated);
        assert_eq!(config.gateway.auth_token.expose_secret().len(), 64);
    }

    #[test]
    fn env_overrides_settings() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("PROVISIONER_NETWORK", "sepolia");
            std::env::set_var("PROVISIONER_CHAIN_MODE", "LIVE");
            std::env::set_var("PROVISIONER_RPC_URL", "https://rpc.sepolia.example");
            std::env::set_var(
                "PROVISIONER_OPERATOR_ADDRESS",
                "0x00000000000000000000000000000000000000B2",
            );
            std::env::set_var("PROVISIONER_POLL_INTERVAL_MS", "250");
            std::env::set_var("GATEWAY_AUTH_TOKEN", "secret");
        }

        let mut settings = Settings::default();
        settings.chain.network = "holesky".to_string();
        let config = Config::build(&settings).unwrap();
        clear_env();

        assert_eq!(config.chain.mode, ChainMode::Live);
        assert_eq!(config.chain.network, "sepolia");
        assert_eq!(
            config.chain.operator.as_str(),
            "0x00000000000000000000000000000000000000b2"
        );
        assert_eq!(config.chain.poll_interval, Duration::from_millis(250));
        assert_eq!(config.gateway.auth_token.expose_secret(), "secret");
        assert!(!config.gateway.auth_token_generated);
    }

    #[test]
    fn live_mode_requires_rpc_and_operator() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("PROVISIONER_CHAIN_MODE", "live");
        }
        let missing_rpc = Config::build(&Settings::default());
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("PROVISIONER_RPC_URL", "http://127.0.0.1:8545");
        }
        let missing_operator = Config::build(&Settings::default());
        clear_env();

        assert!(matches!(
            missing_rpc,
            Err(ConfigError::MissingRequired { key, .. }) if key == "PROVISIONER_RPC_URL"
        ));
        assert!(matches!(
            missing_operator,
            Err(ConfigError::MissingRequired { key, .. }) if key == "PROVISIONER_OPERATOR_ADDRESS"
        ));
    }

    #[test]
    fn invalid_values_name_their_key() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        let cases = [
            ("PROVISIONER_CHAIN_MODE", "testnet"),
            ("PROVISIONER_CONFIRMATION_TIMEOUT_MS", "0"),
            ("PROVISIONER_POLL_INTERVAL_MS", "soon"),
            ("PROVISIONER_RPC_URL", "ftp://rpc.example"),
            ("PROVISIONER_OPERATOR_ADDRESS", "0x0000000000000000000000000000000000000000"),
            ("GATEWAY_PORT", "70000"),
        ];
        for (key, value) in cases {
            clear_env();
            // SAFETY: Guarded by ENV_MUTEX in tests.
            unsafe {
                std::env::set_var(key, value);
            }
            let result = Config::build(&Settings::default());
            clear_env();
            match result {
                Err(ConfigError::InvalidValue { key: reported, .. }) => assert_eq!(reported, key),
                other => panic!("{key}={value} should be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn explicit_missing_toml_is_fatal() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let result = Config::from_env_with_toml(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn toml_overlay_applies_under_env() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[chain]\nnetwork = \"amoy\"\nconfirmation_timeout_ms = 9000\n\n[gateway]\nport = 4100\n",
        )
        .unwrap();
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("GATEWAY_PORT", "4200");
        }

        let config = Config::from_env_with_toml(Some(&path)).unwrap();
        clear_env();

        assert_eq!(config.chain.network, "amoy");
        assert_eq!(config.chain.confirmation_timeout, Duration::from_secs(9));
        assert_eq!(config.gateway.port, 4200);
    }
}
