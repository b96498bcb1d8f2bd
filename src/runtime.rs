//! Service lifecycle: configuration, wiring, workers, HTTP, shutdown.
//!
//! Start-up order follows the dependency graph: configuration and
//! telemetry, then the database and chain-client pools, then the pool
//! manager / updater / sweeper wiring, then the background workers and the
//! HTTP server. On SIGINT/SIGTERM the server stops accepting work, workers
//! stop at their next unit boundary, and in-flight sweeps are drained for
//! up to the configured window before exit.

use alloy_primitives::B256;
use alloy_signer_local::PrivateKeySigner;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use dotenvy::dotenv;
use serde_json::json;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::chain::ChainClient;
use crate::chain::client::RpcChainClient;
use crate::config::Config;
use crate::crypto::RecipientCipher;
use crate::network::Network;
use crate::poller::{PollerConfig, PollingWorker};
use crate::pool::{PoolBounds, PoolManager};
use crate::sig_down::SigDown;
use crate::store::{
    self, OrderRepo, PgOrderStore, PgPoolStore, PgWebhookKeyStore, PoolRepo,
};
use crate::sweeper::{Sweeper, SweeperConfig, SweeperHandle};
use crate::telemetry::Telemetry;
use crate::types::EvmAddress;
use crate::updater::{EVENT_RETENTION, EventSink, OrderUpdater, SweepTrigger};
use crate::util::DedupSet;
use crate::webhook::{self, WebhookState};

/// Cadence of the pool-size maintenance check.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);
/// How often a submitted user-operation is polled for its receipt.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Cadence of the `validated`-order re-drive scan.
const REDRIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Upper bound on orders examined per polling tick.
const POLL_BATCH_LIMIT: i64 = 256;

/// Initialize and run the payment-intake service until shutdown.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .expect("failed to initialize rustls crypto provider");
    dotenv().ok();
    let _telemetry = Telemetry::init();

    let config = Config::from_env()?;

    let db = store::connect(config.database_url().expose(), 10).await?;
    store::migrate(&db).await?;
    tracing::info!("database connected and migrated");

    let pool_repo = Arc::new(PgPoolStore::new(db.clone()));
    let order_repo: Arc<dyn OrderRepo> = Arc::new(PgOrderStore::new(db.clone()));
    let key_repo = Arc::new(PgWebhookKeyStore::new(db.clone()));

    let api_key = config
        .alchemy_api_key()
        .map(|secret| secret.expose().to_string());
    let chain: Arc<dyn ChainClient> = Arc::new(RpcChainClient::connect(
        Network::variants(),
        api_key.as_deref(),
        config.rpc_timeout(),
    )?);

    let pool_manager = Arc::new(PoolManager::new(
        Arc::clone(&pool_repo) as Arc<dyn PoolRepo>,
        PoolBounds {
            reuse_cap: config.reuse_cap(),
            min_pool_size: config.min_pool_size(),
            max_pool_size: config.max_pool_size(),
        },
    ));

    let signer =
        PrivateKeySigner::from_bytes(&B256::from(*config.smart_account_owner_key().as_bytes()))?;
    let signer_address: EvmAddress = signer.address().into();
    if signer_address != config.smart_account_owner_address() {
        return Err(format!(
            "SMART_ACCOUNT_OWNER_PRIVATE_KEY controls {signer_address}, \
             not the configured owner {}",
            config.smart_account_owner_address()
        )
        .into());
    }
    let cipher = RecipientCipher::new(config.recipient_encryption_key());

    let gas_policy_id = config
        .gas_policy_id()
        .ok_or("GAS_POLICY_ID must be set; sweeps are paymaster-sponsored")?
        .to_string();
    let sweeper = Arc::new(Sweeper::new(
        Arc::clone(&order_repo),
        Arc::clone(&pool_manager),
        Arc::clone(&chain),
        signer,
        cipher,
        SweeperConfig {
            max_retries: config.max_sweep_retries(),
            sweep_timeout: config.sweep_timeout(),
            concurrency_per_chain: config.sweep_concurrency(),
            gas_policy_id,
            sender_fee_recipient: config.sender_fee_recipient(),
            receipt_poll_interval: RECEIPT_POLL_INTERVAL,
            redrive_interval: REDRIVE_INTERVAL,
        },
    ));
    let trigger: Arc<dyn SweepTrigger> =
        Arc::new(SweeperHandle::new(Arc::clone(&sweeper)));

    let updater: Arc<dyn EventSink> = Arc::new(OrderUpdater::new(
        Arc::clone(&order_repo),
        Arc::clone(&pool_manager),
        trigger,
    ));

    let sig_down = SigDown::try_new()?;
    let cancel = sig_down.cancellation_token();
    let workers = TaskTracker::new();

    if config.enable_polling_fallback() {
        let poller = Arc::new(PollingWorker::new(
            Arc::clone(&order_repo),
            Arc::clone(&chain),
            Arc::clone(&updater),
            PollerConfig {
                interval: config.polling_interval(),
                min_age: config.polling_min_age(),
                cache_ttl: config.polling_cache_ttl(),
                batch_limit: POLL_BATCH_LIMIT,
            },
        ));
        workers.spawn(poller.run(cancel.clone()));
    } else {
        tracing::warn!("polling fallback disabled; webhooks are the only detection path");
    }
    workers.spawn(Arc::clone(&sweeper).run_redrive(cancel.clone()));
    if config.use_alchemy_for_receive_addresses() {
        workers.spawn(maintenance_loop(
            Arc::clone(&pool_manager),
            cancel.clone(),
        ));
    } else {
        tracing::warn!("receive-address pool disabled by configuration");
    }

    let webhook_state = WebhookState {
        keys: key_repo,
        sink: updater,
        payload_seen: Arc::new(DedupSet::new(EVENT_RETENTION)),
    };
    let app = Router::new()
        .merge(service_routes().with_state(ServiceState { db: db.clone() }))
        .merge(webhook::routes().with_state(webhook_state))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("starting server at http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .inspect_err(|e| tracing::error!("failed to bind to {addr}: {e}"))?;

    let serve_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
        .await?;

    // The server has stopped; stop workers and drain in-flight sweeps.
    cancel.cancel();
    workers.close();
    sweeper.drain(config.drain_timeout()).await;
    if tokio::time::timeout(config.drain_timeout(), workers.wait())
        .await
        .is_err()
    {
        tracing::warn!("workers did not stop within the drain window");
    }
    tracing::info!("shutdown complete");
    Ok(())
}

/// Periodic pool-size invariant check across all configured networks.
async fn maintenance_loop(pool_manager: Arc<PoolManager>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                for network in Network::variants() {
                    if let Err(error) = pool_manager.maintain(*network).await {
                        tracing::error!(%error, network = %network, "pool maintenance failed");
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
struct ServiceState {
    db: PgPool,
}

fn service_routes() -> Router<ServiceState> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
}

/// `GET /`: a simple greeting, useful as a liveness probe.
#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

/// `GET /health`: readiness — reports database liveness.
#[instrument(skip_all)]
async fn get_health(State(state): State<ServiceState>) -> impl IntoResponse {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&state.db).await {
        Ok(_) => (StatusCode::OK, Json(json!({"status": "ok", "database": "up"}))),
        Err(error) => {
            tracing::error!(%error, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "database": "down"})),
            )
        }
    }
}
