//! `registry-provisioner check-config` - startup diagnostics.
//!
//! Resolves configuration the same way `serve` does, then probes the
//! ledger, artifacts, RPC endpoint and gateway port. Each check reports
//! pass/fail/skip with a short reason.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ChainMode, Config};
use crate::provision::kind::ComponentKind;
use crate::provision::ledger::JsonlLedger;
use crate::provision::preparer::ArtifactSet;
use crate::provision::registry::ComponentRegistry;

const RPC_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run every check and print results. Fails when any check fails.
pub async fn run_check_config(toml_path: Option<&Path>) -> anyhow::Result<()> {
    println!("Registry Provisioner: configuration check");
    println!("==========================================\n");

    let mut passed = 0u32;
    let mut failed = 0u32;

    let config = match Config::from_env_with_toml(toml_path) {
        Ok(config) => {
            check(
                "configuration",
                CheckResult::Pass(format!(
                    "network {}, {} mode, operator {}",
                    config.chain.network,
                    mode_label(config.chain.mode),
                    config.chain.operator
                )),
                &mut passed,
                &mut failed,
            );
            config
        }
        Err(e) => {
            check(
                "configuration",
                CheckResult::Fail(e.to_string()),
                &mut passed,
                &mut failed,
            );
            println!();
            println!("  {passed} passed, {failed} failed");
            anyhow::bail!("configuration did not resolve");
        }
    };

    check(
        "ledger directory",
        check_ledger_dir(&config.ledger.path),
        &mut passed,
        &mut failed,
    );
    check(
        "ledger replay",
        check_ledger_replay(&config).await,
        &mut passed,
        &mut failed,
    );
    check(
        "artifacts",
        check_artifacts(&config),
        &mut passed,
        &mut failed,
    );
    check(
        "rpc endpoint",
        check_rpc(&config).await,
        &mut passed,
        &mut failed,
    );
    check(
        "gateway port",
        check_gateway_port(&config),
        &mut passed,
        &mut failed,
    );

    println!();
    println!("  {passed} passed, {failed} failed");

    if failed > 0 {
        anyhow::bail!("{failed} check(s) failed");
    }
    Ok(())
}

fn check(name: &str, result: CheckResult, passed: &mut u32, failed: &mut u32) {
    match result {
        CheckResult::Pass(detail) => {
            *passed += 1;
            println!("  [pass] {name}: {detail}");
        }
        CheckResult::Fail(detail) => {
            *failed += 1;
            println!("  [FAIL] {name}: {detail}");
        }
        CheckResult::Skip(reason) => {
            println!("  [skip] {name}: {reason}");
        }
    }
}

enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

fn mode_label(mode: ChainMode) -> &'static str {
    match mode {
        ChainMode::Paper => "paper",
        ChainMode::Live => "live",
    }
}

fn check_ledger_dir(path: &Path) -> CheckResult {
    let Some(parent) = path.parent() else {
        return CheckResult::Fail(format!("{} has no parent directory", path.display()));
    };
    if !parent.exists() {
        return CheckResult::Pass(format!("{} will be created", parent.display()));
    }
    if !parent.is_dir() {
        return CheckResult::Fail(format!("{} is not a directory", parent.display()));
    }
    let probe = parent.join(".write-probe");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            CheckResult::Pass(format!("{} is writable", parent.display()))
        }
        Err(e) => CheckResult::Fail(format!("{} is not writable: {e}", parent.display())),
    }
}

async fn check_ledger_replay(config: &Config) -> CheckResult {
    let path = &config.ledger.path;
    if !path.exists() {
        return CheckResult::Skip(format!("{} does not exist yet", path.display()));
    }
    let ledger = Arc::new(JsonlLedger::new(path));
    match ComponentRegistry::open(ledger, &config.chain.network).await {
        Ok(registry) => {
            let view = registry.snapshot().await;
            let deployed: usize = ComponentKind::ALL
                .iter()
                .map(|kind| view.list_by_kind(*kind).len())
                .sum();
            CheckResult::Pass(format!(
                "{} component(s), last sequence {}",
                deployed, view.last_sequence
            ))
        }
        Err(e) => CheckResult::Fail(format!("cannot rebuild registry: {e}")),
    }
}

fn check_artifacts(config: &Config) -> CheckResult {
    let Some(dir) = &config.chain.artifacts_dir else {
        return match config.chain.mode {
            ChainMode::Paper => CheckResult::Skip("paper mode uses placeholder bytecode".into()),
            ChainMode::Live => {
                CheckResult::Fail("PROVISIONER_ARTIFACTS_DIR is required in live mode".into())
            }
        };
    };
    match ArtifactSet::load_dir(dir) {
        Ok(set) if set.is_empty() => {
            CheckResult::Fail(format!("no *.bin artifacts found in {}", dir.display()))
        }
        Ok(set) => CheckResult::Pass(format!("{} artifact(s) in {}", set.len(), dir.display())),
        Err(e) => CheckResult::Fail(e.to_string()),
    }
}

async fn check_rpc(config: &Config) -> CheckResult {
    if config.chain.mode == ChainMode::Paper {
        return CheckResult::Skip("paper mode has no RPC endpoint".to_string());
    }
    let Some(endpoint) = config.chain.rpc_url.as_deref() else {
        return CheckResult::Fail("PROVISIONER_RPC_URL is not set".to_string());
    };
    probe_rpc_endpoint(endpoint, RPC_PROBE_TIMEOUT).await
}

/// Ask the endpoint for its chain id.
async fn probe_rpc_endpoint(endpoint: &str, timeout: Duration) -> CheckResult {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => return CheckResult::Fail(format!("cannot construct HTTP client: {e}")),
    };
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_chainId",
        "params": [],
    });
    let display = redact_url_for_display(endpoint);

    let response = match client.post(endpoint).json(&body).send().await {
        Ok(response) => response,
        Err(e) => return CheckResult::Fail(format!("{display} unreachable: {e}")),
    };
    let status = response.status();
    if !status.is_success() {
        return CheckResult::Fail(format!("{display} answered {status}"));
    }
    match response.json::<serde_json::Value>().await {
        Ok(value) => match value.get("result").and_then(|r| r.as_str()) {
            Some(chain_id) => CheckResult::Pass(format!("{display} (chain id {chain_id})")),
            None => CheckResult::Fail(format!("{display} returned no chain id: {value}")),
        },
        Err(e) => CheckResult::Fail(format!("{display} returned invalid JSON: {e}")),
    }
}

fn redact_url_for_display(raw: &str) -> String {
    match reqwest::Url::parse(raw) {
        Ok(mut url) => {
            if !url.username().is_empty() {
                let _ = url.set_username("redacted");
            }
            if url.password().is_some() {
                let _ = url.set_password(Some("redacted"));
            }
            url.to_string()
        }
        Err(_) => "<invalid-url>".to_string(),
    }
}

fn check_gateway_port(config: &Config) -> CheckResult {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    match std::net::TcpListener::bind(&addr) {
        Ok(listener) => {
            drop(listener);
            CheckResult::Pass(format!("{addr} is available"))
        }
        Err(e) => CheckResult::Fail(format!(
            "{addr} is unavailable ({e}); free the port or change GATEWAY_PORT"
        )),
    }
}
