//! Order updater: the idempotent consumer of transfer events.
//!
//! Both detection paths (webhook and polling) hand their events to
//! [`OrderUpdater::apply`], the single writer of order status and
//! `amount_paid`. Duplicate deliveries collapse in the in-flight dedup set,
//! concurrent deliveries collapse in the store's guarded single-statement
//! update, and validation hands off to the sweeper outside any transaction.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use crate::pool::{PoolError, PoolManager};
use crate::store::{
    ApplyOutcome, OrderContext, OrderRepo, PaymentObservation, StoreError,
};
use crate::types::{EventSource, OrderStatus, TransferEvent, TypeError};
use crate::util::DedupSet;

/// Events already seen are remembered for this long; webhook providers
/// retry for at most a day.
pub const EVENT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Consumer of transfer events; both detection paths feed one of these.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn apply(&self, event: TransferEvent) -> Result<Applied, UpdateError>;
}

/// Hand-off point to the sweeper on validation.
///
/// Must be cheap and non-blocking: it is called after the update commits,
/// outside any transaction.
pub trait SweepTrigger: Send + Sync {
    fn trigger(&self, order_id: Uuid);
}

/// What applying one event did.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Event already seen; nothing written.
    Duplicate,
    /// No non-terminal order owns the destination address.
    Unmatched,
    /// The order's payment window had closed; it is now `expired`.
    Expired { order_id: Uuid },
    /// The order was already in a state that rejects the event.
    Conflict { order_id: Uuid, status: OrderStatus },
    /// The order row was updated.
    Updated {
        order_id: Uuid,
        status: OrderStatus,
        newly_validated: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("event amount not representable: {0}")]
    Amount(#[from] TypeError),
}

/// The authoritative reducer over payment orders.
pub struct OrderUpdater {
    orders: Arc<dyn OrderRepo>,
    pool: Arc<PoolManager>,
    sweeps: Arc<dyn SweepTrigger>,
    seen: DedupSet,
}

impl OrderUpdater {
    pub fn new(
        orders: Arc<dyn OrderRepo>,
        pool: Arc<PoolManager>,
        sweeps: Arc<dyn SweepTrigger>,
    ) -> Self {
        Self {
            orders,
            pool,
            sweeps,
            seen: DedupSet::new(EVENT_RETENTION),
        }
    }

    /// Resolve the event's destination to the single order it pays.
    ///
    /// More than one non-terminal order on an assigned address is an
    /// invariant violation: it is logged at ERROR and the payment-accepting
    /// order with the oldest `created_at` wins (the store orders candidates
    /// that way).
    async fn resolve(&self, event: &TransferEvent) -> Result<Option<OrderContext>, UpdateError> {
        let candidates = self
            .orders
            .open_orders_by_address(event.chain_id, &event.to)
            .await?;
        if candidates.len() > 1 {
            tracing::error!(
                to = %event.to,
                chain_id = event.chain_id,
                candidates = candidates.len(),
                "invariant violation: multiple open orders share a receive address"
            );
            if let Some(first) = candidates.first() {
                let _ = self.pool.audit_assignment(first.receive_address.id).await;
            }
        }
        Ok(candidates.into_iter().next())
    }
}

#[async_trait]
impl EventSink for OrderUpdater {
    /// Apply one detected transfer.
    ///
    /// Steps: dedup, resolve, expiry check, guarded amount/status update,
    /// then — outside the write — sweep hand-off on a fresh validation.
    #[instrument(
        skip(self, event),
        err,
        fields(
            chain_id = event.chain_id,
            to = %event.to,
            source = %event.source,
        )
    )]
    async fn apply(&self, event: TransferEvent) -> Result<Applied, UpdateError> {
        if !self.seen.insert(&event.dedup_key()) {
            tracing::debug!(key = %event.dedup_key(), "dropping duplicate transfer event");
            return Ok(Applied::Duplicate);
        }

        let Some(context) = self.resolve(&event).await? else {
            tracing::info!(to = %event.to, "transfer event matched no open order");
            return Ok(Applied::Unmatched);
        };
        let order_id = context.order.id;

        // Deposits after the validity window (the order's or the receive
        // address's, whichever closes first) expire the order; no sweep.
        let now = chrono::Utc::now();
        let address_window_closed = matches!(
            context.receive_address.valid_until,
            Some(valid_until) if valid_until < now
        );
        if context.order.is_past_validity(now) || address_window_closed {
            if let Some(receive_address_id) = self.orders.mark_expired(order_id).await?.flatten() {
                self.pool.release(receive_address_id).await?;
            }
            tracing::info!(%order_id, "payment arrived after validity window; order expired");
            return Ok(Applied::Expired { order_id });
        }

        let amount = event.amount.scaled()?;
        let observation = match event.source {
            EventSource::Webhook => PaymentObservation::Incremental(amount),
            EventSource::Polling => PaymentObservation::Cumulative(amount),
        };

        match self.orders.apply_payment(order_id, observation).await? {
            ApplyOutcome::Applied(applied) => {
                let newly_validated = applied.newly_validated();
                tracing::info!(
                    %order_id,
                    amount_paid = %applied.amount_paid,
                    status = %applied.status,
                    newly_validated,
                    "payment applied"
                );
                if newly_validated {
                    // Out-of-transaction hand-off; the sweeper re-reads
                    // status before submitting.
                    self.sweeps.trigger(order_id);
                }
                Ok(Applied::Updated {
                    order_id,
                    status: applied.status,
                    newly_validated,
                })
            }
            ApplyOutcome::Terminal(status) => {
                tracing::warn!(%order_id, %status, "event for terminal order dropped");
                Ok(Applied::Conflict { order_id, status })
            }
            ApplyOutcome::NotFound => Ok(Applied::Unmatched),
        }
    }
}
