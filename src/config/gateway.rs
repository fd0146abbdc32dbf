use rand::RngCore;
use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_env_or};
use crate::error::ConfigError;
use crate::settings::Settings;

/// HTTP gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for authentication. Random hex generated at startup if unset.
    pub auth_token: SecretString,
    /// True when `auth_token` was generated rather than configured.
    pub auth_token_generated: bool,
}

impl GatewayConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let host = optional_env("GATEWAY_HOST")?.unwrap_or_else(|| settings.gateway.host.clone());
        let port = parse_env_or("GATEWAY_PORT", settings.gateway.port, "a valid port number")?;

        let (auth_token, auth_token_generated) = match optional_env("GATEWAY_AUTH_TOKEN")? {
            Some(token) => (token, false),
            None => (random_token(), true),
        };

        Ok(Self {
            host,
            port,
            auth_token: SecretString::from(auth_token),
            auth_token_generated,
        })
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
