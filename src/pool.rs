//! Receive-address pool manager.
//!
//! The single mutator of pool-lifecycle fields. Allocation and recycling
//! delegate to the store's atomic primitives; this layer adds the reuse-cap
//! retirement policy, replenishment alerts, and invariant audits.
//!
//! Replenishment itself is *not* performed here: deploying new accounts
//! needs the deployer key, which only the off-line administrative tools
//! hold. `maintain` emits a structured deficit alert for the operator and
//! nothing else.

use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::network::Network;
use crate::store::{PoolRepo, ReceiveAddress, StoreError};

/// Pool sizing and reuse knobs, fixed at start-up.
#[derive(Debug, Clone, Copy)]
pub struct PoolBounds {
    pub reuse_cap: u32,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
}

/// Snapshot returned by [`PoolManager::maintain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealth {
    pub ready: i64,
    /// How many addresses short of `MIN_POOL_SIZE` the chain is.
    pub deficit: Option<u32>,
    /// Rows parked at the reuse cap, surfaced by the audit view.
    pub retired: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No allocatable address; surfaced as 503 by the order-creation path.
    #[error("receive-address pool empty for {network}")]
    Empty { network: Network },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for PoolError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::PoolEmpty { chain_id, .. } => {
                let network = Network::try_from(chain_id)
                    .unwrap_or(Network::BaseSepolia);
                PoolError::Empty { network }
            }
            other => PoolError::Store(other),
        }
    }
}

/// Maintains pool-size invariants, allocates addresses to orders, and
/// recycles them on completion.
#[derive(Clone)]
pub struct PoolManager {
    repo: Arc<dyn PoolRepo>,
    bounds: PoolBounds,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("bounds", &self.bounds)
            .finish()
    }
}

impl PoolManager {
    pub fn new(repo: Arc<dyn PoolRepo>, bounds: PoolBounds) -> Self {
        Self { repo, bounds }
    }

    pub fn bounds(&self) -> PoolBounds {
        self.bounds
    }

    /// Allocate one address for an order on `network`.
    ///
    /// Uniqueness and fairness are the store's contract; an empty pool
    /// additionally triggers a replenishment alert so the operator sees the
    /// deficit before the next `maintain` tick.
    #[instrument(skip(self), err, fields(network = %network))]
    pub async fn allocate(&self, network: Network) -> Result<ReceiveAddress, PoolError> {
        match self
            .repo
            .allocate(
                network.chain_id(),
                network.identifier(),
                self.bounds.reuse_cap,
            )
            .await
        {
            Ok(address) => {
                tracing::debug!(
                    address = %address.address,
                    times_used = address.times_used,
                    "allocated receive address"
                );
                Ok(address)
            }
            Err(StoreError::PoolEmpty { .. }) => {
                tracing::error!(
                    network = %network,
                    min_pool_size = self.bounds.min_pool_size,
                    "pool empty; run the pool deployment tool to replenish"
                );
                Err(PoolError::Empty { network })
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Transition an address into `pool_processing` when its sweep starts.
    pub async fn begin_processing(&self, address_id: Uuid) -> Result<(), PoolError> {
        self.repo.mark_processing(address_id).await?;
        Ok(())
    }

    /// Terminal-order path: park the address in `pool_completed`, then
    /// recycle it to `pool_ready` — unless it has reached the reuse cap, in
    /// which case it stays retired for the audit view.
    #[instrument(skip(self), err)]
    pub async fn release(&self, address_id: Uuid) -> Result<(), PoolError> {
        let Some(address) = self.repo.get(address_id).await? else {
            tracing::warn!(%address_id, "release of unknown receive address");
            return Ok(());
        };
        self.repo.mark_completed(address_id).await?;
        if address.times_used >= self.bounds.reuse_cap as i32 {
            tracing::info!(
                address = %address.address,
                times_used = address.times_used,
                reuse_cap = self.bounds.reuse_cap,
                "receive address retired at reuse cap"
            );
            return Ok(());
        }
        self.repo.recycle(address_id).await?;
        tracing::debug!(address = %address.address, "receive address recycled");
        Ok(())
    }

    /// Check pool-size invariants for `network`.
    ///
    /// Below `MIN_POOL_SIZE` emits a structured deficit alert; above
    /// `MAX_POOL_SIZE` no action is taken — the running service never
    /// destroys pool rows.
    #[instrument(skip(self), fields(network = %network))]
    pub async fn maintain(&self, network: Network) -> Result<PoolHealth, PoolError> {
        let ready = self
            .repo
            .ready_count(network.chain_id(), network.identifier())
            .await?;
        let retired = self
            .repo
            .retired_count(network.chain_id(), self.bounds.reuse_cap)
            .await?;
        let deficit = if (ready as u64) < self.bounds.min_pool_size as u64 {
            let deficit = self.bounds.min_pool_size - ready.max(0) as u32;
            tracing::warn!(
                network = %network,
                ready,
                min_pool_size = self.bounds.min_pool_size,
                deficit,
                "receive-address pool below minimum; deployment tool required"
            );
            Some(deficit)
        } else {
            None
        };
        if retired > 0 {
            tracing::info!(network = %network, retired, "addresses retired at reuse cap");
        }
        Ok(PoolHealth {
            ready,
            deficit,
            retired,
        })
    }

    /// Invariant audit: an assigned address must be referenced by exactly
    /// one non-terminal order. Violations are logged at ERROR and surfaced;
    /// the process keeps running.
    #[instrument(skip(self))]
    pub async fn audit_assignment(&self, address_id: Uuid) -> Result<bool, PoolError> {
        let open = self.repo.open_order_count(address_id).await?;
        if open > 1 {
            tracing::error!(
                %address_id,
                open_orders = open,
                "invariant violation: receive address referenced by multiple open orders"
            );
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::store::StoreError;
    use crate::types::AddressStatus;

    #[derive(Default)]
    struct FakePool {
        rows: Mutex<Vec<ReceiveAddress>>,
        recycled: Mutex<Vec<Uuid>>,
        completed: Mutex<Vec<Uuid>>,
    }

    fn row(times_used: i32) -> ReceiveAddress {
        ReceiveAddress {
            id: Uuid::new_v4(),
            address: "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap(),
            salt: None,
            network_identifier: "base-sepolia".into(),
            chain_id: 84532,
            status: AddressStatus::PoolAssigned,
            is_deployed: true,
            deployment_tx_hash: None,
            deployment_block: None,
            deployed_at: None,
            assigned_at: None,
            recycled_at: None,
            times_used,
            last_indexed_block: None,
            last_used: None,
            valid_until: None,
        }
    }

    #[async_trait]
    impl PoolRepo for FakePool {
        async fn allocate(
            &self,
            chain_id: u64,
            network_identifier: &str,
            _reuse_cap: u32,
        ) -> Result<ReceiveAddress, StoreError> {
            let mut rows = self.rows.lock().unwrap();
            match rows.pop() {
                Some(row) => Ok(row),
                None => Err(StoreError::PoolEmpty {
                    chain_id,
                    network_identifier: network_identifier.into(),
                }),
            }
        }

        async fn recycle(&self, id: Uuid) -> Result<(), StoreError> {
            self.recycled.lock().unwrap().push(id);
            Ok(())
        }

        async fn mark_processing(&self, _id: Uuid) -> Result<(), StoreError> {
            Ok(())
        }

        async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError> {
            self.completed.lock().unwrap().push(id);
            Ok(())
        }

        async fn get(&self, id: Uuid) -> Result<Option<ReceiveAddress>, StoreError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .find(|row| row.id == id)
                .cloned())
        }

        async fn ready_count(&self, _: u64, _: &str) -> Result<i64, StoreError> {
            Ok(self.rows.lock().unwrap().len() as i64)
        }

        async fn retired_count(&self, _: u64, _: u32) -> Result<i64, StoreError> {
            Ok(0)
        }

        async fn open_order_count(&self, _: Uuid) -> Result<i64, StoreError> {
            Ok(1)
        }
    }

    fn manager(repo: Arc<FakePool>) -> PoolManager {
        PoolManager::new(
            repo,
            PoolBounds {
                reuse_cap: 10,
                min_pool_size: 3,
                max_pool_size: 100,
            },
        )
    }

    #[tokio::test]
    async fn empty_pool_surfaces_as_pool_error() {
        let manager = manager(Arc::new(FakePool::default()));
        let err = manager.allocate(Network::BaseSepolia).await.unwrap_err();
        assert!(matches!(err, PoolError::Empty { network: Network::BaseSepolia }));
    }

    #[tokio::test]
    async fn release_recycles_below_reuse_cap() {
        let repo = Arc::new(FakePool::default());
        let fresh = row(2);
        let id = fresh.id;
        repo.rows.lock().unwrap().push(fresh);
        let manager = manager(Arc::clone(&repo));
        manager.release(id).await.unwrap();
        assert_eq!(repo.completed.lock().unwrap().as_slice(), &[id]);
        assert_eq!(repo.recycled.lock().unwrap().as_slice(), &[id]);
    }

    #[tokio::test]
    async fn release_retires_at_reuse_cap() {
        let repo = Arc::new(FakePool::default());
        let spent = row(10);
        let id = spent.id;
        repo.rows.lock().unwrap().push(spent);
        let manager = manager(Arc::clone(&repo));
        manager.release(id).await.unwrap();
        assert_eq!(repo.completed.lock().unwrap().as_slice(), &[id]);
        assert!(repo.recycled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn maintain_reports_deficit_below_minimum() {
        let repo = Arc::new(FakePool::default());
        repo.rows.lock().unwrap().push(row(0));
        let manager = manager(Arc::clone(&repo));
        let health = manager.maintain(Network::BaseSepolia).await.unwrap();
        assert_eq!(health.ready, 1);
        assert_eq!(health.deficit, Some(2));
    }

    #[tokio::test]
    async fn maintain_is_quiet_within_bounds() {
        let repo = Arc::new(FakePool::default());
        for _ in 0..5 {
            repo.rows.lock().unwrap().push(row(0));
        }
        let manager = manager(Arc::clone(&repo));
        let health = manager.maintain(Network::BaseSepolia).await.unwrap();
        assert_eq!(health.ready, 5);
        assert_eq!(health.deficit, None);
    }
}
