//! Axum HTTP server for the provisioner API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, header},
    middleware,
    routing::{get, post},
};
use secrecy::SecretString;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::auth::{AuthState, auth_middleware};
use crate::api::handlers::*;
use crate::error::GatewayError;
use crate::runtime::AppState;

/// Build the router. Everything except `/health` requires the bearer token.
pub fn router(state: Arc<AppState>, auth_token: SecretString) -> Router {
    let auth_state = AuthState { token: auth_token };

    // Public routes (no auth)
    let public = Router::new().route("/health", get(health_handler));

    let protected = Router::new()
        .route("/prepare/{operation}", post(prepare_handler))
        .route(
            "/components",
            get(components_list_handler).post(components_record_handler),
        )
        .route("/dependency-status/{kind}", get(dependency_status_handler))
        .route("/initialize-batch", post(initialize_batch_handler))
        .route("/deploy/{kind}", post(deploy_handler))
        .route("/ledger", get(ledger_handler))
        .route("/signatures", get(signatures_list_handler))
        .route("/signatures/{id}", post(signature_respond_handler))
        .route("/workflow", get(workflow_handler))
        .route("/transactions/{tx}/recheck", post(recheck_handler))
        .route_layer(middleware::from_fn_with_state(auth_state, auth_middleware));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB max request body
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handle to a running gateway.
pub struct RunningGateway {
    pub addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningGateway {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            tracing::warn!("Gateway task ended abnormally: {}", e);
        }
    }
}

/// Start the gateway HTTP server.
///
/// Returns the actual bound address (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    auth_token: SecretString,
) -> Result<RunningGateway, GatewayError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::StartupFailed {
            reason: format!("Failed to bind to {}: {}", addr, e),
        })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| GatewayError::StartupFailed {
            reason: format!("Failed to get local addr: {}", e),
        })?;

    // CORS: only local origins; the API is operated from the same machine.
    let origins = [
        format!("http://{}:{}", bound_addr.ip(), bound_addr.port()),
        format!("http://localhost:{}", bound_addr.port()),
    ]
    .into_iter()
    .filter_map(|origin| origin.parse::<HeaderValue>().ok())
    .collect::<Vec<_>>();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ]));

    let app = router(state, auth_token).layer(cors);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Gateway shutting down");
            })
            .await
        {
            tracing::error!("Gateway server error: {}", e);
        }
    });

    tracing::info!("Gateway listening on http://{}", bound_addr);
    Ok(RunningGateway {
        addr: bound_addr,
        shutdown_tx,
        task,
    })
}
