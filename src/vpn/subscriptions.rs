//! Node and plan subscription lifecycle
//!
//! Subscriptions are created lazily on the ledger and cached locally with
//! their expiry. The ledger assigns IDs, so every create is followed by a
//! detail fetch to learn the expiry before the record is stored.

use crate::{
    config::Config,
    db::{Database, NodeSubscriptionModel, PlanSubscriptionModel, SubscriptionQueries},
    network::NetworkClient,
    DvpnResult,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Lookup-or-create for provider subscriptions
pub struct SubscriptionLifecycle {
    config: Arc<Config>,
    db: Arc<Database>,
    network: Arc<NetworkClient>,
}

impl SubscriptionLifecycle {
    /// Create a new lifecycle manager
    pub fn new(config: Arc<Config>, db: Arc<Database>, network: Arc<NetworkClient>) -> Self {
        Self { config, db, network }
    }

    /// A live provider subscription on `node_address`, creating one if needed.
    ///
    /// Order: local record, then the provider's live ledger subscriptions,
    /// then a fresh subscription for the configured number of hours. The local
    /// store is queried again right before creating; concurrent callers may
    /// still both create, which costs a duplicate but never corrupts the store.
    pub async fn node_subscription(&self, node_address: &str) -> DvpnResult<NodeSubscriptionModel> {
        let subscriptions = SubscriptionQueries::new(&self.db);
        let now = Utc::now();

        if let Some(existing) = subscriptions.live_node_subscription(node_address, now).await? {
            debug!("Using node subscription {} for {}", existing.id, node_address);
            return Ok(existing);
        }

        if let Some(recovered) = self.recover_node_subscription(node_address, now).await? {
            info!(
                "Recovered ledger subscription {} for node {}",
                recovered.id, node_address
            );
            subscriptions.insert_node(&recovered).await?;
            return Ok(recovered);
        }

        if let Some(existing) = subscriptions.live_node_subscription(node_address, Utc::now()).await? {
            return Ok(existing);
        }

        let hours = self.config.catalog.node_subscription_hours;
        info!("Creating {}h subscription for node {}", hours, node_address);
        let id = self
            .network
            .create_node_subscription(
                node_address,
                &self.config.wallets.node_subscriber_mnemonic,
                0,
                hours,
            )
            .await?;

        let inactive_at = self.subscription_expiry(id).await?;
        let created = NodeSubscriptionModel {
            id,
            node_address: node_address.to_string(),
            inactive_at,
        };
        subscriptions.insert_node(&created).await?;
        Ok(created)
    }

    /// Scan the provider wallet's ledger subscriptions for a live one on this node
    async fn recover_node_subscription(
        &self,
        node_address: &str,
        now: DateTime<Utc>,
    ) -> DvpnResult<Option<NodeSubscriptionModel>> {
        let provider = &self.config.network.provider_address;
        let found = self
            .network
            .fetch_all_subscriptions(provider)
            .await?
            .into_iter()
            .filter(|s| s.node_address == node_address && s.is_live(now))
            .max_by_key(|s| s.base.inactive_at);

        Ok(found.map(|s| NodeSubscriptionModel {
            id: s.base.id,
            node_address: node_address.to_string(),
            inactive_at: s.base.inactive_at,
        }))
    }

    /// Current plan subscription: the newest one that stays active past the
    /// renewal lead time
    pub async fn current_plan(&self) -> DvpnResult<Option<PlanSubscriptionModel>> {
        let horizon = Utc::now() + Duration::hours(self.config.catalog.plan_renewal_lead_hours);
        Ok(SubscriptionQueries::new(&self.db).current_plan(horizon).await?)
    }

    /// Current plan subscription, renewing it on the ledger when due
    pub async fn current_or_renew_plan(&self) -> DvpnResult<PlanSubscriptionModel> {
        if let Some(current) = self.current_plan().await? {
            return Ok(current);
        }

        info!("No plan subscription outside the renewal window, subscribing to plan {}", self.config.network.plan_id);
        let id = self
            .network
            .create_plan_subscription(&self.config.wallets.subscription_updater_mnemonic)
            .await?;

        let inactive_at = self.subscription_expiry(id).await?;
        let renewed = PlanSubscriptionModel { id, inactive_at };
        SubscriptionQueries::new(&self.db).insert_plan(&renewed).await?;
        info!("Plan subscription {} active until {}", renewed.id, renewed.inactive_at);
        Ok(renewed)
    }

    async fn subscription_expiry(&self, id: i64) -> DvpnResult<DateTime<Utc>> {
        match self.network.fetch_subscription(id).await {
            Ok(subscription) => Ok(subscription.base.inactive_at),
            Err(e) => {
                error!("Subscription {} was created but its details could not be fetched: {}", id, e);
                Err(e)
            }
        }
    }
}
