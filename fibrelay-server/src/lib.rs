//! The HTTP control surface: a thin axum JSON router over [`fibrelay_app::App`],
//! implementing every chain/engine/vault operation the app facade exposes.
//! Binds to loopback by default per the local-key authentication model —
//! there is no login session, so anything reachable on this router can spend
//! through the vault.
//!
//! Grounded on `dxid-rpc::run_rest` for the router/state shape;
//! the gRPC half of that crate (`tonic`/`prost`) has no counterpart here —
//! dropped, see DESIGN.md.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fibrelay_app::{
    App, ChainDetail, CreateChainRequest, CreateChainResponse, ExportedKeys, FeePreviewResponse,
    StatusResponse,
};
use fibrelay_chain::AddressBalance;
use fibrelay_core::{Chain, Error as CoreError, Network};
use fibrelay_engine::{FixStatusReport, ManualRetryStep};
use fibrelay_fees::FeePriority;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Wraps both the Control Surface's typed error taxonomy and any other
/// failure (config, I/O) into a JSON error body with an appropriate status.
pub enum ApiError {
    Core(CoreError),
    Internal(anyhow::Error),
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Core(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Core(e) => (core_error_status(e), e.to_string()),
            ApiError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Maps the core error taxonomy onto HTTP status codes. `Fatal` is the
/// only variant that should ever indicate a server-side bug; the rest
/// describe conditions the caller can act on (retry, fix input, wait).
fn core_error_status(e: &CoreError) -> StatusCode {
    match e {
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CoreError::DecryptFailed => StatusCode::UNAUTHORIZED,
        CoreError::InsufficientBalance { .. } => StatusCode::CONFLICT,
        CoreError::BroadcastRejected(_) => StatusCode::BAD_GATEWAY,
        CoreError::TransientNetwork(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct NetworkResponse {
    network: Network,
}

#[derive(Deserialize)]
struct NetworkQuery {
    network: Option<Network>,
}

#[derive(Deserialize)]
struct FeeQuery {
    network: Network,
    num_hops: Option<u32>,
    priority: Option<FeePriority>,
}

#[derive(Deserialize)]
struct SwitchNetworkRequest {
    network: Network,
}

#[derive(Deserialize)]
struct FeeEstimateRequest {
    network: Network,
    num_hops: u32,
    priority: Option<FeePriority>,
}

#[derive(Deserialize)]
struct ExportRequest {
    password: String,
}

#[derive(Deserialize)]
struct ValidateAddressRequest {
    address: String,
    network: Network,
}

#[derive(Serialize)]
struct ValidateAddressResponse {
    valid: bool,
}

#[derive(Deserialize)]
struct AddressBalanceRequest {
    address: String,
    network: Network,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_status(State(app): State<Arc<App>>) -> Json<StatusResponse> {
    Json(app.status().await)
}

async fn get_network(State(app): State<Arc<App>>) -> Result<Json<NetworkResponse>, ApiError> {
    Ok(Json(NetworkResponse { network: app.active_network().await? }))
}

async fn switch_network(
    State(app): State<Arc<App>>,
    Json(req): Json<SwitchNetworkRequest>,
) -> Result<Json<NetworkResponse>, ApiError> {
    app.switch_network(req.network).await?;
    Ok(Json(NetworkResponse { network: req.network }))
}

async fn fee_preview(State(app): State<Arc<App>>, Query(q): Query<FeeQuery>) -> Json<FeePreviewResponse> {
    let priority = q.priority.unwrap_or(FeePriority::Medium);
    Json(app.fee_preview(q.network, q.num_hops, priority).await)
}

async fn estimate_fees(
    State(app): State<Arc<App>>,
    Json(req): Json<FeeEstimateRequest>,
) -> Json<FeePreviewResponse> {
    let priority = req.priority.unwrap_or(FeePriority::Medium);
    Json(app.fee_preview(req.network, Some(req.num_hops), priority).await)
}

async fn list_chains(State(app): State<Arc<App>>, Query(q): Query<NetworkQuery>) -> Result<Json<Vec<Chain>>, ApiError> {
    Ok(Json(app.list_chains(q.network).await?))
}

async fn create_chain(
    State(app): State<Arc<App>>,
    Json(req): Json<CreateChainRequest>,
) -> Result<Json<CreateChainResponse>, ApiError> {
    Ok(Json(app.create_chain(req).await?))
}

async fn get_chain(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<Json<ChainDetail>, ApiError> {
    Ok(Json(app.get_chain(id).await?))
}

async fn activate_chain(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<Json<Chain>, ApiError> {
    Ok(Json(app.activate_chain(id).await?))
}

async fn cancel_chain(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<Json<Chain>, ApiError> {
    Ok(Json(app.cancel_chain(id).await?))
}

async fn retry_chain(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<Json<Vec<ManualRetryStep>>, ApiError> {
    Ok(Json(app.retry_chain(id).await?))
}

async fn fix_status_chain(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<Json<FixStatusReport>, ApiError> {
    Ok(Json(app.fix_status(id).await?))
}

async fn export_chain(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
    Json(req): Json<ExportRequest>,
) -> Result<Json<ExportedKeys>, ApiError> {
    Ok(Json(app.export_keys(id, &req.password).await?))
}

async fn validate_address(State(app): State<Arc<App>>, Json(req): Json<ValidateAddressRequest>) -> Json<ValidateAddressResponse> {
    Json(ValidateAddressResponse { valid: app.validate_address(&req.address, req.network) })
}

async fn address_balance(
    State(app): State<Arc<App>>,
    Json(req): Json<AddressBalanceRequest>,
) -> Result<Json<AddressBalance>, ApiError> {
    Ok(Json(app.address_balance(&req.address, req.network).await?))
}

async fn engine_start(State(app): State<Arc<App>>) -> Result<StatusCode, ApiError> {
    app.engine_start().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn engine_stop(State(app): State<Arc<App>>) -> Result<StatusCode, ApiError> {
    app.engine_stop().await.map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Builds the router without binding a listener, so tests can exercise it
/// with `axum::body` directly.
pub fn build_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/network", get(get_network).post(switch_network))
        .route("/api/fees", get(fee_preview))
        .route("/api/fees/estimate", post(estimate_fees))
        .route("/api/chains", get(list_chains).post(create_chain))
        .route("/api/chains/:id", get(get_chain))
        .route("/api/chains/:id/activate", post(activate_chain))
        .route("/api/chains/:id/cancel", post(cancel_chain))
        .route("/api/chains/:id/retry", post(retry_chain))
        .route("/api/chains/:id/fix-status", post(fix_status_chain))
        .route("/api/chains/:id/export", post(export_chain))
        .route("/api/address/validate", post(validate_address))
        .route("/api/address/balance", post(address_balance))
        .route("/api/engine/start", post(engine_start))
        .route("/api/engine/stop", post(engine_stop))
        .with_state(app)
}

/// Binds `bind_addr` and serves until the process is killed. The caller
/// (`fibrelay-cli`'s `serve` subcommand) is expected to have already
/// confirmed `bind_addr` is loopback unless the operator explicitly opted
/// into a wider bind.
pub async fn serve(app: Arc<App>, bind_addr: &str) -> anyhow::Result<()> {
    let router = build_router(app);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "fibrelay control surface listening");
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use fibrelay_chain::{ChainClient, ChainClientError, TransactionInfo, UtxoInfo};
    use fibrelay_config::FibrelayConfig;
    use fibrelay_fees::{FeeEstimate, FeeOracle, FeeSchedule};
    use fibrelay_signer::Secp256k1Signer;
    use fibrelay_storage::Store;
    use std::collections::HashMap;
    use tower::ServiceExt;

    struct NullChainClient;

    #[async_trait::async_trait]
    impl ChainClient for NullChainClient {
        async fn get_block_height(&self) -> Result<u64, ChainClientError> {
            Ok(1)
        }
        async fn get_block_hash(&self, _height: u64) -> Result<String, ChainClientError> {
            Ok("deadbeef".into())
        }
        async fn get_address_utxos(&self, _address: &str) -> Result<Vec<UtxoInfo>, ChainClientError> {
            Ok(vec![])
        }
        async fn get_address_balance(&self, _address: &str) -> Result<AddressBalance, ChainClientError> {
            Ok(AddressBalance { confirmed_sats: 0, unconfirmed_sats: 0 })
        }
        async fn get_transaction(&self, _txid: &str) -> Result<Option<TransactionInfo>, ChainClientError> {
            Ok(None)
        }
        async fn broadcast_transaction(&self, _tx_hex: &str) -> Result<String, ChainClientError> {
            Ok("unused".into())
        }
    }

    struct FlatFeeOracle;

    #[async_trait::async_trait]
    impl FeeOracle for FlatFeeOracle {
        async fn estimates(&self) -> FeeSchedule {
            let est = |rate: f64, priority: FeePriority| FeeEstimate { fee_rate_sat_vb: rate, estimated_fee_sats: 300, priority };
            FeeSchedule {
                high: est(4.0, FeePriority::High),
                medium: est(2.0, FeePriority::Medium),
                low: est(1.0, FeePriority::Low),
                economy: est(0.5, FeePriority::Economy),
            }
        }
    }

    async fn test_router() -> Router {
        let mut config = FibrelayConfig::example();
        config.database_path = "sqlite::memory:".into();
        config.vault.password = Some("server-test-password".into());
        config.engine.poll_interval_secs = 3600;

        let mut chain_clients: HashMap<Network, Arc<dyn ChainClient>> = HashMap::new();
        let mut fee_oracles: HashMap<Network, Arc<dyn FeeOracle>> = HashMap::new();
        for network in [Network::Testnet, Network::Mainnet] {
            chain_clients.insert(network, Arc::new(NullChainClient));
            fee_oracles.insert(network, Arc::new(FlatFeeOracle));
        }
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let app = App::new_for_tests(config, store, Arc::new(Secp256k1Signer::new()), chain_clients, fee_oracles)
            .await
            .unwrap();
        build_router(Arc::new(app))
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = test_router().await;
        let resp = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_chain_returns_404() {
        let router = test_router().await;
        let resp = router
            .oneshot(Request::builder().uri("/api/chains/999").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_chain_rejects_bad_hop_count() {
        let router = test_router().await;
        let body = serde_json::json!({ "network": "testnet", "num_hops": 1 }).to_string();
        let resp = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chains")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn fee_estimate_includes_preview_for_requested_hops() {
        let router = test_router().await;
        let body = serde_json::json!({ "network": "testnet", "num_hops": 3 }).to_string();
        let resp = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/fees/estimate")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(parsed["preview"].is_object());
        assert!(parsed["timing"].is_object());
    }
}
