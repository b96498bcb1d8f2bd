//! Webhook receiver: the event-driven half of payment detection.
//!
//! A single endpoint, `POST /webhook/addr-activity`, consumes
//! address-activity notifications from the upstream RPC provider. The raw
//! body is read before any JSON parsing so the HMAC-SHA256 signature in
//! `X-Signature` can be verified over the exact bytes, with the signing key
//! looked up by the payload's `webhookId`.
//!
//! Contract: `401` on signature failure with no side effects, `400` on
//! malformed JSON, `200` after dedup + enqueue — including when activities
//! resolve to "not ours", so the provider does not retry. Payloads are
//! deduplicated by event id (`whevt_*`) for 24 hours; per-activity dedup is
//! the order updater's job.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

use crate::network::Network;
use crate::store::WebhookKeyRepo;
use crate::types::{EventSource, EvmAddress, TokenAmount, TransferEvent, TxHash};
use crate::updater::{Applied, EventSink};
use crate::util::DedupSet;

type HmacSha256 = Hmac<Sha256>;

/// Signature header set by the provider.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// An address-activity payload, the subset the intake pipeline consumes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub webhook_id: String,
    /// Provider event id (`whevt_*`), the payload-level dedup key.
    pub id: String,
    pub created_at: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub event: WebhookEvent,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub network: String,
    #[serde(default)]
    pub activity: Vec<Activity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityCategory {
    Token,
    External,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub from_address: String,
    pub to_address: String,
    /// Hex-encoded block number.
    pub block_num: String,
    pub hash: String,
    /// Raw token units as a decimal string.
    pub value: String,
    #[serde(default)]
    pub asset: Option<String>,
    pub category: ActivityCategory,
    #[serde(default)]
    pub raw_contract: Option<RawContract>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawContract {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub decimals: Option<u8>,
}

/// Verify the provider's HMAC-SHA256 signature over the raw body.
pub fn verify_signature(signing_key: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim_start_matches("0x")) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(signing_key.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Compute the signature a provider would attach; used by tooling and tests.
pub fn sign_body(signing_key: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Normalize a payload's activities into transfer events.
///
/// Only `token` and `external` categories are payment-bearing; anything
/// else (internal traces, NFT activity) is skipped. Activities that fail to
/// parse are skipped individually and logged, leaving the rest of the
/// payload intact.
pub fn normalize(payload: &WebhookPayload, network: Network) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    for activity in &payload.event.activity {
        if !matches!(
            activity.category,
            ActivityCategory::Token | ActivityCategory::External
        ) {
            continue;
        }
        match normalize_activity(payload, activity, network) {
            Ok(event) => events.push(event),
            Err(reason) => {
                tracing::warn!(
                    webhook_id = %payload.webhook_id,
                    event_id = %payload.id,
                    %reason,
                    "skipping undecodable activity"
                );
            }
        }
    }
    events
}

fn normalize_activity(
    payload: &WebhookPayload,
    activity: &Activity,
    network: Network,
) -> Result<TransferEvent, String> {
    let to = EvmAddress::from_str(&activity.to_address).map_err(|e| e.to_string())?;
    let from = EvmAddress::from_str(&activity.from_address).ok();
    let tx_hash = TxHash::from_str(&activity.hash).map_err(|e| e.to_string())?;
    let block_number = u64::from_str_radix(
        activity.block_num.trim_start_matches("0x"),
        16,
    )
    .map_err(|e| format!("bad blockNum: {e}"))?;
    let raw_value = alloy_primitives::U256::from_str(&activity.value)
        .map_err(|e| format!("bad value: {e}"))?;
    let token_contract = activity
        .raw_contract
        .as_ref()
        .and_then(|raw| raw.address.as_deref())
        .map(EvmAddress::from_str)
        .transpose()
        .map_err(|e| e.to_string())?;
    let decimals = activity
        .raw_contract
        .as_ref()
        .and_then(|raw| raw.decimals)
        .unwrap_or(18);
    Ok(TransferEvent {
        chain_id: network.chain_id(),
        from,
        to,
        token_contract,
        amount: TokenAmount::new(raw_value, decimals),
        tx_hash: Some(tx_hash),
        block_number: Some(block_number),
        source: EventSource::Webhook,
        provider_event_id: Some(payload.id.clone()),
    })
}

/// Shared state of the webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub keys: Arc<dyn WebhookKeyRepo>,
    pub sink: Arc<dyn EventSink>,
    pub payload_seen: Arc<DedupSet>,
}

impl std::fmt::Debug for WebhookState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookState")
            .field("payload_seen", &self.payload_seen.len())
            .finish()
    }
}

pub fn routes() -> Router<WebhookState> {
    Router::new().route("/webhook/addr-activity", post(post_address_activity))
}

fn ok() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

/// `POST /webhook/addr-activity`: authenticated address-activity ingress.
#[instrument(skip_all)]
pub async fn post_address_activity(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Parse after capturing the raw bytes; the signature covers the body
    // verbatim.
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(%error, "malformed webhook body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "malformed body"})),
            )
                .into_response();
        }
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let signing_key = match state.keys.signing_key(&payload.webhook_id).await {
        Ok(Some(key)) => key,
        Ok(None) => {
            tracing::warn!(webhook_id = %payload.webhook_id, "unknown webhook id");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "unknown webhook"})),
            )
                .into_response();
        }
        Err(error) => {
            tracing::error!(%error, "signing-key lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "storage failure"})),
            )
                .into_response();
        }
    };
    if !verify_signature(&signing_key, &body, signature) {
        tracing::warn!(webhook_id = %payload.webhook_id, "webhook signature mismatch");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid signature"})),
        )
            .into_response();
    }

    // Authenticated from here on: every exit is 200 so the provider does
    // not retry.
    if !state.payload_seen.insert(&payload.id) {
        tracing::debug!(event_id = %payload.id, "duplicate webhook payload dropped");
        return ok();
    }
    if payload.kind != "ADDRESS_ACTIVITY" {
        tracing::info!(kind = %payload.kind, "ignoring non-address-activity webhook");
        return ok();
    }
    let network = match Network::from_provider_tag(&payload.event.network) {
        Ok(network) => network,
        Err(error) => {
            tracing::warn!(%error, "webhook for unconfigured network");
            return ok();
        }
    };

    for event in normalize(&payload, network) {
        let to = event.to;
        match state.sink.apply(event).await {
            Ok(Applied::Unmatched) => {
                tracing::info!(%to, "webhook activity matched no open order");
            }
            Ok(_) => {}
            Err(error) => {
                // Accepted regardless; the polling fallback will re-observe.
                tracing::error!(%error, %to, "failed to apply webhook activity");
            }
        }
    }
    ok()
}
