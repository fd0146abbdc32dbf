//! Integration tests for the HTTP gateway.
//!
//! Each test starts a real Axum server on a random port backed by the paper
//! chain and an in-memory ledger, then drives it with reqwest.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::{Value, json};

use registry_provisioner::api::{RunningGateway, start_server};
use registry_provisioner::provision::ledger::MemoryLedger;
use registry_provisioner::provision::orchestrator::Provisioner;
use registry_provisioner::provision::paper::PaperChain;
use registry_provisioner::provision::preparer::{ArtifactSet, Preparer};
use registry_provisioner::provision::registry::ComponentRegistry;
use registry_provisioner::provision::resolver::DependencyGraph;
use registry_provisioner::provision::kind::ComponentKind;
use registry_provisioner::provision::types::{Address, TransactionRef};
use registry_provisioner::provision::waiter::ConfirmationWaiter;
use registry_provisioner::runtime::{AppState, SignerBackend};

const AUTH_TOKEN: &str = "test-token-12345";

fn is_bind_permission_error<E: std::fmt::Display>(err: &E) -> bool {
    let message = err.to_string().to_lowercase();
    message.contains("operation not permitted") || message.contains("failed to bind")
}

fn operator() -> Address {
    Address::from_bytes(&[0xee; 20])
}

async fn start_test_server() -> Option<(RunningGateway, Arc<AppState>)> {
    let chain = Arc::new(PaperChain::new(operator()));
    let registry = Arc::new(
        ComponentRegistry::open(MemoryLedger::new(), "paper")
            .await
            .unwrap(),
    );
    let provisioner = Provisioner::new(
        registry,
        DependencyGraph::standard().unwrap(),
        Preparer::new(ArtifactSet::placeholder(), 120),
        chain.clone(),
        chain.clone(),
        ConfirmationWaiter::new(
            chain.clone(),
            Duration::from_millis(2),
            Duration::from_millis(200),
        ),
    );
    let state = Arc::new(AppState::new(
        provisioner,
        operator(),
        SignerBackend::Paper(chain),
    ));

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    match start_server(addr, state.clone(), SecretString::from(AUTH_TOKEN.to_string())).await {
        Ok(gateway) => Some((gateway, state)),
        Err(e) if is_bind_permission_error(&e) => None,
        Err(e) => panic!("Failed to start test server: {e:?}"),
    }
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

#[tokio::test]
async fn health_is_public_and_everything_else_needs_the_token() {
    let Some((gateway, _)) = start_test_server().await else {
        eprintln!("skipping: cannot bind a local port");
        return;
    };
    let client = reqwest::Client::new();

    let health = client.get(url(gateway.addr, "/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["signer"], "paper");
    assert_eq!(body["network"], "paper");

    let anonymous = client
        .get(url(gateway.addr, "/components"))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), 401);
    let body: Value = anonymous.json().await.unwrap();
    assert_eq!(body["code"], "auth.invalid_token");

    let wrong = client
        .get(url(gateway.addr, "/ledger"))
        .bearer_auth("not-the-token")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    gateway.shutdown().await;
}

#[tokio::test]
async fn deploy_then_list_components_and_ledger() {
    let Some((gateway, _)) = start_test_server().await else {
        eprintln!("skipping: cannot bind a local port");
        return;
    };
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let deployed = client
            .post(url(gateway.addr, "/deploy/claim-topics-registry"))
            .bearer_auth(AUTH_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(deployed.status(), 200);
        let body: Value = deployed.json().await.unwrap();
        assert_eq!(body["outcome"], "applied");
    }

    let components: Value = client
        .get(url(gateway.addr, "/components"))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = components["instances"]["ClaimTopicsRegistry"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["instance_name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["ClaimTopicsRegistry", "ClaimTopicsRegistry_2"]);

    let ledger: Value = client
        .get(url(gateway.addr, "/ledger"))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let records = ledger["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["sequence"], 1);
    assert_eq!(records[1]["action"]["type"], "deployed");

    gateway.shutdown().await;
}

#[tokio::test]
async fn unknown_kind_is_a_validation_error() {
    let Some((gateway, _)) = start_test_server().await else {
        eprintln!("skipping: cannot bind a local port");
        return;
    };
    let response = reqwest::Client::new()
        .post(url(gateway.addr, "/deploy/TokenRegistry"))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "validation");

    gateway.shutdown().await;
}

#[tokio::test]
async fn dependency_status_reports_unmet_kinds() {
    let Some((gateway, _)) = start_test_server().await else {
        eprintln!("skipping: cannot bind a local port");
        return;
    };
    let status: Value = reqwest::Client::new()
        .get(url(gateway.addr, "/dependency-status/IdentityRegistry"))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(status["ready"], false);
    assert_eq!(status["dependencies"].as_array().unwrap().len(), 3);
    assert!(
        status["dependencies"]
            .as_array()
            .unwrap()
            .iter()
            .all(|d| d["satisfied"] == false)
    );

    gateway.shutdown().await;
}

#[tokio::test]
async fn prepare_returns_payload_without_submitting() {
    let Some((gateway, _)) = start_test_server().await else {
        eprintln!("skipping: cannot bind a local port");
        return;
    };
    let client = reqwest::Client::new();
    client
        .post(url(gateway.addr, "/deploy/ClaimTopicsRegistry"))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap();

    let body = json!({ "target": { "kind": "ClaimTopicsRegistry" } });
    let mut digests = Vec::new();
    for _ in 0..2 {
        let prepared: Value = client
            .post(url(gateway.addr, "/prepare/initialize"))
            .bearer_auth(AUTH_TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(prepared["status"], "prepared");
        digests.push(prepared["payload"]["digest"].as_str().unwrap().to_string());
    }
    assert_eq!(digests[0], digests[1]);

    let ledger: Value = client
        .get(url(gateway.addr, "/ledger"))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ledger["records"].as_array().unwrap().len(), 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn batch_request_reports_per_step_status() {
    let Some((gateway, _)) = start_test_server().await else {
        eprintln!("skipping: cannot bind a local port");
        return;
    };
    let client = reqwest::Client::new();
    for kind in ["ClaimTopicsRegistry", "TrustedIssuersRegistry"] {
        client
            .post(url(gateway.addr, &format!("/deploy/{kind}")))
            .bearer_auth(AUTH_TOKEN)
            .send()
            .await
            .unwrap();
    }

    let batch = json!({
        "steps": [
            { "action": { "operation": "initialize", "target": { "kind": "ClaimTopicsRegistry" } } },
            { "action": { "operation": "add_claim_topic", "topic": { "id": 1, "name": "KYC" } } },
            { "action": { "operation": "initialize", "target": { "kind": "TrustedIssuersRegistry" } } }
        ]
    });
    let response = client
        .post(url(gateway.addr, "/initialize-batch"))
        .bearer_auth(AUTH_TOKEN)
        .json(&batch)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let report: Value = response.json().await.unwrap();
    let statuses: Vec<&str> = report["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["success", "success", "success"]);
    assert_eq!(report["submitted"], 3);

    let workflow: Value = client
        .get(url(gateway.addr, "/workflow"))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(workflow["running"], false);
    assert_eq!(workflow["state"]["phase"], "completed");

    gateway.shutdown().await;
}

#[tokio::test]
async fn busy_workflow_is_a_conflict() {
    let Some((gateway, state)) = start_test_server().await else {
        eprintln!("skipping: cannot bind a local port");
        return;
    };
    let held = state.workflow.lock().await;

    let response = reqwest::Client::new()
        .post(url(gateway.addr, "/deploy/ModularCompliance"))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "busy");

    drop(held);
    gateway.shutdown().await;
}

#[tokio::test]
async fn externally_confirmed_deployment_can_be_recorded() {
    let Some((gateway, _)) = start_test_server().await else {
        eprintln!("skipping: cannot bind a local port");
        return;
    };
    let client = reqwest::Client::new();

    let response = client
        .post(url(gateway.addr, "/components"))
        .bearer_auth(AUTH_TOKEN)
        .json(&json!({
            "kind": "ModularCompliance",
            "address": "0x00000000000000000000000000000000000000c3"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let instance: Value = response.json().await.unwrap();
    assert_eq!(instance["instance_name"], "ModularCompliance");

    let collision = client
        .post(url(gateway.addr, "/components"))
        .bearer_auth(AUTH_TOKEN)
        .json(&json!({
            "kind": "ModularCompliance",
            "address": "0x00000000000000000000000000000000000000c4",
            "instance_name": "ModularCompliance"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(collision.status(), 409);

    gateway.shutdown().await;
}

#[tokio::test]
async fn disconnected_deploy_runs_to_completion_and_stays_recheckable() {
    let Some((gateway, state)) = start_test_server().await else {
        eprintln!("skipping: cannot bind a local port");
        return;
    };
    let SignerBackend::Paper(chain) = state.signer.clone() else {
        panic!("test server uses the paper signer");
    };
    chain.withhold_next();

    let impatient = reqwest::Client::builder()
        .timeout(Duration::from_millis(30))
        .build()
        .unwrap();
    let gave_up = impatient
        .post(url(gateway.addr, "/deploy/IdentityRegistry"))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await;
    assert!(gave_up.is_err());

    let client = reqwest::Client::new();
    let mut workflow = Value::Null;
    for _ in 0..100 {
        workflow = client
            .get(url(gateway.addr, "/workflow"))
            .bearer_auth(AUTH_TOKEN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if workflow["running"] == false {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(workflow["running"], false);
    let unresolved = workflow["state"]["unresolved"].as_object().unwrap();
    assert_eq!(unresolved.len(), 1);
    let transaction = unresolved.keys().next().unwrap().clone();
    assert_eq!(chain.submissions(), 1);

    let retry = client
        .post(url(gateway.addr, "/deploy/IdentityRegistry"))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(retry.status(), 409);
    let body: Value = retry.json().await.unwrap();
    assert_eq!(body["code"], "workflow.deployment_in_progress");
    assert_eq!(chain.submissions(), 1);

    let tx = TransactionRef::new(&transaction).unwrap();
    assert!(chain.release(&tx));
    let recheck: Value = client
        .post(url(gateway.addr, &format!("/transactions/{transaction}/recheck")))
        .bearer_auth(AUTH_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(recheck["outcome"], "confirmed");

    let view = state.provisioner.registry().snapshot().await;
    assert_eq!(view.list_by_kind(ComponentKind::IdentityRegistry).len(), 1);

    gateway.shutdown().await;
}
