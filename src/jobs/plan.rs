//! Provider plan membership
//!
//! Admission is batched through the ledger's add-nodes call. Eviction has no
//! batch form, so each evicted node costs one ledger call and a failure only
//! keeps that node in the plan until the next pass.

use crate::{
    config::Config,
    db::{AvailabilityQueries, Database, ServerModel, ServerQueries},
    network::NetworkClient,
    DvpnResult,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Price and health gated plan admission and eviction
pub struct PlanMembershipManager {
    config: Arc<Config>,
    db: Arc<Database>,
    network: Arc<NetworkClient>,
}

impl PlanMembershipManager {
    /// Create a new manager
    pub fn new(config: Arc<Config>, db: Arc<Database>, network: Arc<NetworkClient>) -> Self {
        Self { config, db, network }
    }

    /// Scheduled tick: admission, then eviction
    pub async fn run(&self) {
        match self.admit().await {
            Ok(0) => {}
            Ok(n) => info!("Admitted {} servers to the plan", n),
            Err(e) => error!("Plan admission failed: {}", e),
        }

        match self.evict().await {
            Ok(0) => {}
            Ok(n) => info!("Evicted {} servers from the plan", n),
            Err(e) => error!("Plan eviction failed: {}", e),
        }
    }

    /// Whether a server's hourly price in the default denomination is within
    /// the ceiling.
    ///
    /// A server with no hourly price in the denomination, or a zero one, is
    /// out of price: it is never admitted, and a plan member that loses its
    /// price is evicted.
    fn within_price(&self, server: &ServerModel) -> bool {
        match server.configuration.hourly_price(&self.config.network.denom) {
            Some(price) if price > 0 => price <= self.config.catalog.max_price_per_hour,
            _ => false,
        }
    }

    /// Add one batch of eligible servers to the plan. Returns the number added.
    pub async fn admit(&self) -> DvpnResult<usize> {
        let servers = ServerQueries::new(&self.db);
        let batch: Vec<ServerModel> = servers
            .select_admission_candidates()
            .await?
            .into_iter()
            .filter(|server| self.within_price(server))
            .take(self.config.catalog.batch_size as usize)
            .collect();

        if batch.is_empty() {
            debug!("No servers eligible for plan admission");
            return Ok(0);
        }

        let addresses: Vec<String> = batch.iter().map(|s| s.address().to_string()).collect();
        info!("Adding {} nodes to plan {}", addresses.len(), self.config.network.plan_id);
        self.network
            .add_plan_nodes(&addresses, &self.config.wallets.node_linker_mnemonic)
            .await?;

        let ids: Vec<i64> = batch.iter().map(|s| s.id).collect();
        servers.set_included_in_plan(&ids, true).await?;
        AvailabilityQueries::new(&self.db).recompute().await?;
        Ok(ids.len())
    }

    /// Remove every plan member that is overpriced, inactive or banned.
    ///
    /// Aggregates are recomputed even when some removals failed. Returns the
    /// number removed.
    pub async fn evict(&self) -> DvpnResult<usize> {
        let servers = ServerQueries::new(&self.db);
        let evictable: Vec<ServerModel> = servers
            .select_plan_included()
            .await?
            .into_iter()
            .filter(|s| !s.is_active || s.is_banned || !self.within_price(s))
            .collect();

        let total = evictable.len();
        let mut evicted = 0;
        for (i, server) in evictable.iter().enumerate() {
            debug!(
                "[Eviction {}/{}] Removing {} (active={}, banned={})",
                i + 1,
                total,
                server.address(),
                server.is_active,
                server.is_banned
            );
            if let Err(e) = self
                .network
                .remove_plan_node(server.address(), &self.config.wallets.node_remover_mnemonic)
                .await
            {
                warn!("[Eviction {}/{}] Failed to remove {}: {}", i + 1, total, server.address(), e);
                continue;
            }
            servers.set_included_in_plan(&[server.id], false).await?;
            evicted += 1;
        }

        AvailabilityQueries::new(&self.db).recompute().await?;
        Ok(evicted)
    }
}
