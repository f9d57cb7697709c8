//! Device wallet convergence
//!
//! Two loops, each handling one bounded batch per tick. The selection
//! predicate is the completion marker: a device that did not converge this
//! tick is simply selected again on the next one.

use crate::{
    config::Config,
    db::{Database, DeviceModel, DeviceQueries},
    network::NetworkClient,
    vpn::SubscriptionLifecycle,
    DvpnResult,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Fee-grant and plan-enrollment convergence for device wallets
pub struct WalletLifecycleManager {
    config: Arc<Config>,
    db: Arc<Database>,
    network: Arc<NetworkClient>,
    subscriptions: Arc<SubscriptionLifecycle>,
}

impl WalletLifecycleManager {
    /// Create a new manager
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        network: Arc<NetworkClient>,
        subscriptions: Arc<SubscriptionLifecycle>,
    ) -> Self {
        Self {
            config,
            db,
            network,
            subscriptions,
        }
    }

    /// Scheduled fee-grant tick
    pub async fn run_fee_grants(&self) {
        match self.grant_fee_batch().await {
            Ok(0) => {}
            Ok(n) => info!("Fee-granted {} device wallets", n),
            Err(e) => error!("Fee grant batch failed: {}", e),
        }
    }

    /// Scheduled enrollment tick
    pub async fn run_enrollment(&self) {
        match self.enroll_batch().await {
            Ok(0) => {}
            Ok(n) => info!("Enrolled {} device wallets", n),
            Err(e) => error!("Enrollment batch failed: {}", e),
        }
    }

    /// Grant fee allowances to one batch of devices that have none.
    ///
    /// All-or-nothing: devices are marked only after the grant transaction
    /// succeeds. Returns the number of devices marked.
    pub async fn grant_fee_batch(&self) -> DvpnResult<usize> {
        let devices = DeviceQueries::new(&self.db);
        let batch = devices.select_not_fee_granted(self.config.catalog.batch_size).await?;
        if batch.is_empty() {
            debug!("No devices waiting for a fee grant");
            return Ok(0);
        }

        let wallets = wallet_addresses(&batch);
        info!("Granting fee allowance to {} wallets", wallets.len());
        self.network
            .grant_fee(&wallets, &self.config.wallets.fee_granter_mnemonic)
            .await?;

        let ids: Vec<i64> = batch.iter().map(|d| d.id).collect();
        devices.mark_fee_granted(&ids).await?;
        Ok(ids.len())
    }

    /// Enroll one batch of devices into the current plan subscription,
    /// renewing the subscription first when it is due.
    ///
    /// Returns the number of devices stamped with the subscription.
    pub async fn enroll_batch(&self) -> DvpnResult<usize> {
        let plan = self.subscriptions.current_or_renew_plan().await?;

        let devices = DeviceQueries::new(&self.db);
        let batch = devices
            .select_not_enrolled(plan.id, self.config.catalog.batch_size)
            .await?;
        if batch.is_empty() {
            debug!("Every device is enrolled in plan subscription {}", plan.id);
            return Ok(0);
        }

        let wallets = wallet_addresses(&batch);
        info!(
            "Enrolling {} wallets in plan subscription {}",
            wallets.len(),
            plan.id
        );
        self.network
            .enroll_wallets(
                plan.id,
                &wallets,
                self.config.catalog.enrollment_bytes,
                &self.config.wallets.main_subscriber_mnemonic,
            )
            .await?;

        let ids: Vec<i64> = batch.iter().map(|d| d.id).collect();
        devices.set_subscription(&ids, plan.id).await?;
        Ok(ids.len())
    }
}

fn wallet_addresses(devices: &[DeviceModel]) -> Vec<String> {
    devices.iter().map(|d| d.wallet_address.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::db::{DevicePlatform, NewDevice, PlanSubscriptionModel, SubscriptionQueries};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        gateway: MockServer,
        db: Arc<Database>,
        manager: WalletLifecycleManager,
    }

    async fn harness() -> Harness {
        let gateway = MockServer::start().await;
        let mut config = Config::default();
        config.network = NetworkConfig {
            api_endpoint: gateway.uri(),
            plan_id: "7".into(),
            provider_address: "sent1provider".into(),
            ..Default::default()
        };
        let config = Arc::new(config);
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let network = Arc::new(NetworkClient::new(&config.network).unwrap());
        let subscriptions = Arc::new(SubscriptionLifecycle::new(
            config.clone(),
            db.clone(),
            network.clone(),
        ));
        let manager = WalletLifecycleManager::new(config, db.clone(), network, subscriptions);
        Harness { gateway, db, manager }
    }

    async fn add_devices(db: &Database, count: usize) -> Vec<DeviceModel> {
        let devices = DeviceQueries::new(db);
        let mut added = Vec::new();
        for i in 0..count {
            added.push(
                devices
                    .insert(&NewDevice {
                        platform: DevicePlatform::Ios,
                        token: format!("token-{}", i),
                        wallet_address: format!("sent1wallet{}", i),
                        wallet_entropy: vec![i as u8; 16],
                    })
                    .await
                    .unwrap(),
            );
        }
        added
    }

    fn tx() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "result": {"height": 10, "txhash": "AB", "events": []}
        }))
    }

    #[tokio::test]
    async fn test_fee_grant_batches_of_ten() {
        let h = harness().await;
        add_devices(&h.db, 12).await;

        // 10 wallets: gas_base * 11
        Mock::given(method("POST"))
            .and(path("/api/v1/feegrants"))
            .and(query_param("gas", "2200000"))
            .respond_with(tx())
            .expect(1)
            .mount(&h.gateway)
            .await;
        // 2 wallets: gas_base * 3
        Mock::given(method("POST"))
            .and(path("/api/v1/feegrants"))
            .and(query_param("gas", "600000"))
            .and(body_partial_json(json!({"acc_addresses": ["sent1wallet10", "sent1wallet11"]})))
            .respond_with(tx())
            .expect(1)
            .mount(&h.gateway)
            .await;

        assert_eq!(h.manager.grant_fee_batch().await.unwrap(), 10);
        assert_eq!(h.manager.grant_fee_batch().await.unwrap(), 2);
        assert_eq!(h.manager.grant_fee_batch().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_fee_grant_marks_nothing() {
        let h = harness().await;
        add_devices(&h.db, 3).await;

        Mock::given(method("POST"))
            .and(path("/api/v1/feegrants"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "success": false,
                "error": {"message": "insufficient funds"}
            })))
            .mount(&h.gateway)
            .await;

        let err = h.manager.grant_fee_batch().await.unwrap_err();
        assert!(err.to_string().contains("insufficient funds"));

        let pending = DeviceQueries::new(&h.db).select_not_fee_granted(10).await.unwrap();
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn test_enrollment_converges_on_current_plan() {
        let h = harness().await;
        let devices = add_devices(&h.db, 2).await;

        // One device already enrolled in an older subscription
        let queries = DeviceQueries::new(&h.db);
        queries.set_subscription(&[devices[0].id], 4).await.unwrap();
        SubscriptionQueries::new(&h.db)
            .insert_plan(&PlanSubscriptionModel {
                id: 9,
                inactive_at: Utc::now() + Duration::days(20),
            })
            .await
            .unwrap();

        Mock::given(method("POST"))
            .and(path("/api/v1/subscriptions/9/allocations"))
            .and(body_partial_json(json!({
                "acc_addresses": ["sent1wallet0", "sent1wallet1"],
                "bytes": [100_000_000_000_000i64, 100_000_000_000_000i64]
            })))
            .respond_with(tx())
            .expect(1)
            .mount(&h.gateway)
            .await;

        assert_eq!(h.manager.enroll_batch().await.unwrap(), 2);
        assert!(queries.select_not_enrolled(9, 10).await.unwrap().is_empty());
        for device in &devices {
            let stored = queries.get_by_id(device.id).await.unwrap().unwrap();
            assert_eq!(stored.subscription_id, Some(9));
        }

        // Converged: the next tick makes no ledger call
        assert_eq!(h.manager.enroll_batch().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_enrollment_leaves_devices_unstamped() {
        let h = harness().await;
        add_devices(&h.db, 1).await;
        SubscriptionQueries::new(&h.db)
            .insert_plan(&PlanSubscriptionModel {
                id: 9,
                inactive_at: Utc::now() + Duration::days(20),
            })
            .await
            .unwrap();

        Mock::given(method("POST"))
            .and(path("/api/v1/subscriptions/9/allocations"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&h.gateway)
            .await;

        assert!(h.manager.enroll_batch().await.is_err());
        assert_eq!(
            DeviceQueries::new(&h.db).select_not_enrolled(9, 10).await.unwrap().len(),
            1
        );
    }
}
