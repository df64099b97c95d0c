//! HTTP API for health checks, status, deposit lookups and cursor repair

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::{ChainMetadata, Deposit, DepositQuery, DepositStats, Ledger, SupportedToken};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn Ledger>,
    pub chain_manager: Arc<ChainManager>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/chains", get(get_chains))
        .route(
            "/chains/:chain_id/cursor",
            get(get_cursor).put(update_cursor),
        )
        .route("/stats", get(get_stats))
        .route("/tokens", get(get_tokens))
        .route("/deposits", get(list_deposits))
        .route("/deposits/:chain_id/:nonce", get(get_deposit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Config(format!("cannot bind API on {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Error body returned by every failing handler
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<RelayerError> for ApiError {
    fn from(err: RelayerError) -> Self {
        let status = match &err {
            RelayerError::ChainNotFound { .. } | RelayerError::DepositNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            RelayerError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            _ => {
                error!("API request failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.ledger.health_check().await.is_ok();

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if db_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: db_ok && chains_ok,
            database: db_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
                .collect(),
        }),
    )
}

/// Get relayer status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let chain_health = state.chain_manager.health_check().await;
    let pending_txs = state.chain_manager.pending_signer_txs().await;

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        signer: format!("{:?}", state.chain_manager.signer_address()),
        connected_chains: state.chain_manager.connected_chains(),
        chain_status: chain_health
            .into_iter()
            .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
            .collect(),
        pending_signer_txs: pending_txs
            .into_iter()
            .map(|(chain_id, pending)| PendingTxs { chain_id, pending })
            .collect(),
    })
}

/// Scan cursors with the last head each provider has seen
async fn get_chains(State(state): State<AppState>) -> ApiResult<ChainsResponse> {
    let metadata = state.ledger.list_chain_metadata().await?;
    let heads = state.chain_manager.last_seen_blocks();

    let chains = metadata
        .into_iter()
        .map(|meta| {
            let head = heads
                .iter()
                .find(|(chain_id, _)| *chain_id == meta.chain_id)
                .map(|(_, block)| *block)
                .filter(|block| *block > 0);
            ChainView {
                lag: head.zip(meta.last_block_scanned).map(|(h, c)| h.saturating_sub(c)),
                head,
                metadata: meta,
            }
        })
        .collect();

    Ok(Json(ChainsResponse { chains }))
}

async fn get_cursor(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
) -> ApiResult<ChainMetadata> {
    state
        .ledger
        .get_chain_metadata(chain_id)
        .await?
        .map(Json)
        .ok_or_else(|| RelayerError::ChainNotFound { chain_id }.into())
}

/// Operator repair: move a cursor (backwards included) or pause a chain
async fn update_cursor(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
    Json(update): Json<CursorUpdate>,
) -> ApiResult<ChainMetadata> {
    if update.block.is_none() && update.active.is_none() && !update.reset {
        return Err(ApiError::bad_request("nothing to update"));
    }

    let mut meta = state
        .ledger
        .get_chain_metadata(chain_id)
        .await?
        .ok_or(RelayerError::ChainNotFound { chain_id })?;

    if update.block.is_some() || update.reset {
        warn!(
            chain_id,
            from = ?meta.last_block_scanned,
            to = ?update.block,
            "Cursor moved by operator"
        );
        meta = state.ledger.set_cursor(chain_id, update.block).await?;
    }
    if let Some(active) = update.active {
        info!(chain_id, active, "Chain activity changed by operator");
        meta = state.ledger.set_chain_active(chain_id, active).await?;
    }

    Ok(Json(meta))
}

/// Get deposit counts by status
async fn get_stats(State(state): State<AppState>) -> ApiResult<DepositStats> {
    Ok(Json(state.ledger.stats().await?))
}

async fn get_tokens(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Vec<SupportedToken>> {
    Ok(Json(state.ledger.list_supported_tokens(query.chain_id).await?))
}

async fn list_deposits(
    State(state): State<AppState>,
    Query(query): Query<DepositQuery>,
) -> ApiResult<DepositsResponse> {
    let deposits = state.ledger.list_deposits(&query).await?;
    Ok(Json(DepositsResponse {
        total: deposits.len(),
        deposits,
    }))
}

async fn get_deposit(
    State(state): State<AppState>,
    Path((chain_id, nonce)): Path<(u64, String)>,
) -> ApiResult<Deposit> {
    let nonce = parse_nonce(&nonce)?;
    state
        .ledger
        .get_deposit(chain_id, nonce)
        .await?
        .map(Json)
        .ok_or_else(|| {
            RelayerError::DepositNotFound {
                source_chain: chain_id,
                nonce: nonce.to_string(),
            }
            .into()
        })
}

/// Nonces are decimal on the wire; `0x` prefixed hex is accepted too
fn parse_nonce(raw: &str) -> Result<U256, ApiError> {
    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16).ok(),
        None => U256::from_dec_str(raw).ok(),
    };
    parsed.ok_or_else(|| ApiError::bad_request(format!("invalid nonce: {}", raw)))
}

// Request and response types

#[derive(Debug, Deserialize)]
struct CursorUpdate {
    block: Option<u64>,
    active: Option<bool>,
    /// Clear the cursor so scanning restarts from the genesis block
    #[serde(default)]
    reset: bool,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    chain_id: Option<u64>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct PendingTxs {
    chain_id: u64,
    pending: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    signer: String,
    connected_chains: Vec<u64>,
    chain_status: Vec<ChainHealth>,
    pending_signer_txs: Vec<PendingTxs>,
}

#[derive(Serialize)]
struct ChainView {
    #[serde(flatten)]
    metadata: ChainMetadata,
    head: Option<u64>,
    lag: Option<u64>,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainView>,
}

#[derive(Serialize)]
struct DepositsResponse {
    deposits: Vec<Deposit>,
    total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::state::{DepositStatus, MemoryLedger};
    use crate::testing::new_deposit;
    use crate::tx::TransactionSender;

    const HARDHAT_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn app_state(ledger: Arc<MemoryLedger>) -> AppState {
        std::env::set_var("API_TEST_SIGNER_KEY", HARDHAT_KEY);
        let settings = Settings::from_toml_str(
            r#"
[relayer]
poll_interval_ms = 1000
max_retries = 3
retry_delay_ms = 100
health_check_interval_secs = 30

[database]
url = "postgres://localhost/relayer"
max_connections = 1
min_connections = 1

[api]
host = "127.0.0.1"
port = 0

[metrics]
enabled = false
port = 0

[wallet]
private_key_env = "API_TEST_SIGNER_KEY"

[chains.holesky]
chain_id = 17000
name = "holesky"
rpc_urls = ["http://127.0.0.1:1"]
bridge_address = "0x57c30655BC162a0B1fB1964057d0Efea3D5E763e"
target_chain_id = 8453
gas_price_strategy = "eip1559"
max_gas_price_gwei = 100
enabled = true

[chains.base]
chain_id = 8453
name = "base"
rpc_urls = ["http://127.0.0.1:1"]
bridge_address = "0xf72A91A5F434b354fd660f31C88598fdf5f410Ee"
target_chain_id = 17000
gas_price_strategy = "legacy"
max_gas_price_gwei = 10
enabled = true
"#,
        )
        .unwrap();
        let wallet = TransactionSender::load_wallet(HARDHAT_KEY).unwrap();

        AppState {
            ledger,
            chain_manager: Arc::new(ChainManager::new(&settings, wallet).unwrap()),
            started_at: Instant::now(),
        }
    }

    #[test]
    fn test_parse_nonce() {
        assert_eq!(parse_nonce("7").unwrap(), U256::from(7));
        assert_eq!(parse_nonce("0x10").unwrap(), U256::from(16));
        assert_eq!(
            parse_nonce("115792089237316195423570985008687907853269984665640564039457584007913129639935")
                .unwrap(),
            U256::MAX
        );
        assert_eq!(parse_nonce("seven").unwrap_err().status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_deposit_by_source_and_nonce() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .record_deposit(&new_deposit(17000, 8453, 7))
            .await
            .unwrap();
        let state = app_state(ledger);

        let Json(deposit) = get_deposit(State(state.clone()), Path((17000, "7".to_string())))
            .await
            .unwrap();
        assert_eq!(deposit.nonce, U256::from(7));
        assert_eq!(deposit.status, DepositStatus::Pending);

        let missing = get_deposit(State(state), Path((17000, "8".to_string())))
            .await
            .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cursor_repair_moves_backwards() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.register_chain(17000, 5).await.unwrap();
        ledger.advance_cursor(17000, None, 500).await.unwrap();
        let state = app_state(ledger.clone());

        let Json(meta) = update_cursor(
            State(state.clone()),
            Path(17000),
            Json(CursorUpdate {
                block: Some(420),
                active: Some(false),
                reset: false,
            }),
        )
        .await
        .unwrap();
        assert_eq!(meta.last_block_scanned, Some(420));
        assert!(!meta.is_active);

        let empty = update_cursor(
            State(state.clone()),
            Path(17000),
            Json(CursorUpdate {
                block: None,
                active: None,
                reset: false,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(empty.status, StatusCode::BAD_REQUEST);

        let unknown = get_cursor(State(state), Path(1)).await.unwrap_err();
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_deposits_filters_by_status() {
        let ledger = Arc::new(MemoryLedger::new());
        for nonce in 1..=3 {
            ledger
                .record_deposit(&new_deposit(17000, 8453, nonce))
                .await
                .unwrap();
        }
        ledger
            .transition(
                17000,
                U256::from(2),
                DepositStatus::Failed,
                crate::state::StatusUpdate::failed("unsupported token"),
            )
            .await
            .unwrap();
        let state = app_state(ledger);

        let Json(failed) = list_deposits(
            State(state),
            Query(DepositQuery {
                status: Some(DepositStatus::Failed),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(failed.total, 1);
        assert_eq!(
            failed.deposits[0].failure_reason.as_deref(),
            Some("unsupported token")
        );
    }
}
