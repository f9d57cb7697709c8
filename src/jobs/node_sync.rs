//! Node catalog reconciliation
//!
//! A pass pulls the full active node set and the provider plan's node set,
//! probes every node and upserts the ones that answer, stamping them with the
//! pass epoch. Once every node has been handled, servers carrying any other
//! stamp are deactivated. A node that fails its probe is therefore swept in
//! the same pass.

use crate::{
    config::Config,
    db::{CityQueries, CountryQueries, Database, DeviceQueries, ServerConfiguration, ServerQueries, ServerUpsert},
    network::{NetworkClient, NodeStatus, RemoteNode},
    DvpnResult,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome counters of one sync pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Nodes returned by the ledger
    pub observed: usize,
    /// Servers inserted or updated
    pub upserted: usize,
    /// Nodes whose status probe failed
    pub probe_failures: usize,
    /// Nodes skipped because their country is unknown
    pub unknown_country: usize,
    /// Nodes whose catalog write failed
    pub store_failures: usize,
    /// Servers deactivated by the sweep
    pub deactivated: usize,
}

/// Mark-and-sweep merge of the ledger node set into the catalog
pub struct NodeSyncEngine {
    config: Arc<Config>,
    db: Arc<Database>,
    network: Arc<NetworkClient>,
}

impl NodeSyncEngine {
    /// Create a new engine
    pub fn new(config: Arc<Config>, db: Arc<Database>, network: Arc<NetworkClient>) -> Self {
        Self { config, db, network }
    }

    /// Scheduled entry point: one pass stamped with the current epoch, then
    /// the fee allowance sync. Errors are logged, never propagated.
    pub async fn run(&self) {
        let revision = Utc::now().timestamp();
        info!("Starting node sync pass (revision {})", revision);

        match self.reconcile(revision).await {
            Ok(report) => info!(
                "Node sync complete: {} observed, {} upserted, {} probe failures, {} unknown country, {} store failures, {} deactivated",
                report.observed,
                report.upserted,
                report.probe_failures,
                report.unknown_country,
                report.store_failures,
                report.deactivated
            ),
            Err(e) => error!("Node sync pass {} aborted: {}", revision, e),
        }

        if let Err(e) = self.sync_fee_allowances().await {
            error!("Fee allowance sync failed: {}", e);
        }
    }

    /// One full pass stamped with `revision`.
    ///
    /// Fails without sweeping if either node listing fails. A node whose
    /// catalog write fails is skipped like one whose probe fails.
    pub async fn reconcile(&self, revision: i64) -> DvpnResult<SyncReport> {
        let nodes = self.network.fetch_all_nodes().await?;
        let plan_nodes: HashSet<String> = self
            .network
            .fetch_all_plan_nodes()
            .await?
            .into_iter()
            .map(|node| node.address)
            .collect();

        let mut report = SyncReport {
            observed: nodes.len(),
            ..Default::default()
        };
        let total = nodes.len();

        for (i, node) in nodes.iter().enumerate() {
            debug!("[Node sync {}/{}] Probing {} at {}", i + 1, total, node.address, node.remote_url);

            let status = match self.network.fetch_node_status(&node.remote_url).await {
                Ok(status) => status,
                Err(e) => {
                    warn!("[Node sync {}/{}] Skipping {}: {}", i + 1, total, node.address, e);
                    report.probe_failures += 1;
                    continue;
                }
            };

            let included = plan_nodes.contains(&node.address);
            match self.upsert(node, &status, included, revision).await {
                Ok(true) => report.upserted += 1,
                Ok(false) => report.unknown_country += 1,
                Err(e) => {
                    warn!("[Node sync {}/{}] Failed to store {}: {}", i + 1, total, node.address, e);
                    report.store_failures += 1;
                }
            }
        }

        report.deactivated = ServerQueries::new(&self.db).deactivate_stale(revision).await?;
        Ok(report)
    }

    /// Upsert one probed node. Returns `false` when its country is unknown.
    async fn upsert(
        &self,
        node: &RemoteNode,
        status: &NodeStatus,
        included: bool,
        revision: i64,
    ) -> DvpnResult<bool> {
        let country_name = &status.location.country;
        let Some(country) = CountryQueries::new(&self.db).get_by_name(country_name).await? else {
            error!(
                "Node {} reports unknown country {:?}, not adding it to the catalog",
                node.address, country_name
            );
            return Ok(false);
        };

        let city = CityQueries::new(&self.db)
            .get_or_create(country.id, &status.location.city)
            .await?;

        let server = ServerUpsert {
            country_id: country.id,
            city_id: city.id,
            name: status.moniker.clone(),
            protocols: status.protocols(),
            configuration: ServerConfiguration {
                address: node.address.clone(),
                remote_url: node.remote_url.clone(),
                bandwidth: status.bandwidth.clone(),
                location: status.location.clone(),
                gigabyte_prices: node.gigabyte_prices.iter().map(|c| c.to_coin()).collect(),
                hourly_prices: node.hourly_prices.iter().map(|c| c.to_coin()).collect(),
                version: status.version.clone(),
            },
            current_load: status.load(),
            is_included_in_plan: included,
            revision,
        };

        ServerQueries::new(&self.db).upsert(&server).await?;
        Ok(true)
    }

    /// Mark every device whose wallet holds a provider fee allowance as granted.
    ///
    /// Catches grants made out of band or whose local mark was lost.
    pub async fn sync_fee_allowances(&self) -> DvpnResult<usize> {
        let provider = &self.config.network.provider_address;
        let allowances = self.network.fetch_all_allowances(provider).await?;
        let grantees: Vec<String> = allowances
            .into_iter()
            .filter(|allowance| &allowance.granter == provider)
            .map(|allowance| allowance.grantee)
            .collect();

        let changed = DeviceQueries::new(&self.db)
            .mark_fee_granted_by_wallets(&grantees)
            .await?;
        info!(
            "Fee allowance sync: {} allowances on ledger, {} devices newly marked",
            grantees.len(),
            changed
        );
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::db::{test_server, DevicePlatform, NewDevice, ServerProtocol};
    use crate::DvpnError;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        gateway: MockServer,
        nodes: MockServer,
        db: Arc<Database>,
        engine: NodeSyncEngine,
    }

    async fn harness() -> Harness {
        let gateway = MockServer::start().await;
        let nodes = MockServer::start().await;

        let mut config = Config::default();
        config.network = NetworkConfig {
            api_endpoint: gateway.uri(),
            plan_id: "7".into(),
            provider_address: "sent1provider".into(),
            ..Default::default()
        };
        let config = Arc::new(config);

        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        CountryQueries::new(&db).insert("Germany", "DE").await.unwrap();

        let network = Arc::new(NetworkClient::new(&config.network).unwrap());
        let engine = NodeSyncEngine::new(config, db.clone(), network);

        Harness { gateway, nodes, db, engine }
    }

    fn envelope(result: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"success": true, "result": result}))
    }

    fn status(country: &str, peers: i64, max_peers: i64, node_type: i64) -> serde_json::Value {
        json!({
            "address": "ignored",
            "bandwidth": {"download": 100, "upload": 50},
            "location": {"latitude": 52.52, "longitude": 13.40, "city": "Berlin", "country": country},
            "moniker": "berlin-1",
            "peers": peers,
            "qos": {"max_peers": max_peers},
            "type": node_type,
            "version": "0.7.1"
        })
    }

    impl Harness {
        fn node(&self, address: &str) -> serde_json::Value {
            json!({
                "address": address,
                "hourly_prices": [{"denom": "udvpn", "amount": "80"}],
                "remote_url": format!("{}/{}", self.nodes.uri(), address),
                "status": 1
            })
        }

        async fn mount_listing(&self, addresses: &[&str], plan: &[&str]) {
            let listed: Vec<_> = addresses.iter().map(|a| self.node(a)).collect();
            let planned: Vec<_> = plan.iter().map(|a| self.node(a)).collect();
            // First page carries everything, the next one is empty
            Mock::given(method("GET"))
                .and(path("/api/v1/nodes"))
                .and(wiremock::matchers::query_param("offset", "0"))
                .respond_with(envelope(json!(listed)))
                .mount(&self.gateway)
                .await;
            Mock::given(method("GET"))
                .and(path("/api/v1/nodes"))
                .and(wiremock::matchers::query_param("offset", "100"))
                .respond_with(envelope(json!([])))
                .mount(&self.gateway)
                .await;
            Mock::given(method("GET"))
                .and(path("/api/v1/plans/7/nodes"))
                .and(wiremock::matchers::query_param("offset", "0"))
                .respond_with(envelope(json!(planned)))
                .mount(&self.gateway)
                .await;
            Mock::given(method("GET"))
                .and(path("/api/v1/plans/7/nodes"))
                .and(wiremock::matchers::query_param("offset", "100"))
                .respond_with(envelope(json!([])))
                .mount(&self.gateway)
                .await;
        }

        async fn mount_status(&self, address: &str, body: serde_json::Value) {
            Mock::given(method("GET"))
                .and(path(format!("/{}/status", address)))
                .respond_with(envelope(body))
                .mount(&self.nodes)
                .await;
        }

        async fn mount_dead(&self, address: &str) {
            Mock::given(method("GET"))
                .and(path(format!("/{}/status", address)))
                .respond_with(ResponseTemplate::new(503))
                .mount(&self.nodes)
                .await;
        }
    }

    #[tokio::test]
    async fn test_failed_probe_is_swept() {
        let h = harness().await;

        // A row for the unresponsive node exists from an earlier pass
        let germany = CountryQueries::new(&h.db).get_by_name("Germany").await.unwrap().unwrap();
        let berlin = CityQueries::new(&h.db).get_or_create(germany.id, "Berlin").await.unwrap();
        ServerQueries::new(&h.db)
            .upsert(&test_server(germany.id, berlin.id, "sentnode1dead", 80, 1))
            .await
            .unwrap();

        h.mount_listing(&["sentnode1live", "sentnode1dead"], &["sentnode1live"]).await;
        h.mount_status("sentnode1live", status("Germany", 5, 10, 1)).await;
        h.mount_dead("sentnode1dead").await;

        let report = h.engine.reconcile(1000).await.unwrap();
        assert_eq!(report.observed, 2);
        assert_eq!(report.upserted, 1);
        assert_eq!(report.probe_failures, 1);
        assert_eq!(report.deactivated, 1);

        let servers = ServerQueries::new(&h.db);
        let live = servers.get_by_address("sentnode1live").await.unwrap().unwrap();
        assert!(live.is_active);
        assert_eq!(live.current_load, 0.5);
        assert_eq!(live.revision, 1000);
        assert!(live.is_included_in_plan);
        assert_eq!(live.protocols, vec![ServerProtocol::WireGuard]);
        assert_eq!(live.configuration.hourly_price("udvpn"), Some(80));
        assert_eq!(live.configuration.location.city, "Berlin");

        let dead = servers.get_by_address("sentnode1dead").await.unwrap().unwrap();
        assert!(!dead.is_active);
    }

    #[tokio::test]
    async fn test_unseen_failed_probe_creates_no_row() {
        let h = harness().await;
        h.mount_listing(&["sentnode1live", "sentnode1dead"], &[]).await;
        h.mount_status("sentnode1live", status("Germany", 5, 10, 2)).await;
        h.mount_dead("sentnode1dead").await;

        h.engine.reconcile(1000).await.unwrap();

        let servers = ServerQueries::new(&h.db);
        assert!(servers.get_by_address("sentnode1dead").await.unwrap().is_none());
        let live = servers.get_by_address("sentnode1live").await.unwrap().unwrap();
        assert_eq!(live.protocols, vec![ServerProtocol::V2Ray]);
        assert!(!live.is_included_in_plan);
    }

    #[tokio::test]
    async fn test_repeated_pass_only_moves_revision() {
        let h = harness().await;
        h.mount_listing(&["sentnode1a", "sentnode1b"], &["sentnode1b"]).await;
        h.mount_status("sentnode1a", status("Germany", 3, 10, 1)).await;
        h.mount_status("sentnode1b", status("Germany", 20, 10, 2)).await;

        h.engine.reconcile(1000).await.unwrap();
        let servers = ServerQueries::new(&h.db);
        let mut first_a = servers.get_by_address("sentnode1a").await.unwrap().unwrap();
        let mut first_b = servers.get_by_address("sentnode1b").await.unwrap().unwrap();
        assert_eq!(first_b.current_load, 1.0);

        let report = h.engine.reconcile(2000).await.unwrap();
        assert_eq!(report.deactivated, 0);

        let second_a = servers.get_by_address("sentnode1a").await.unwrap().unwrap();
        let second_b = servers.get_by_address("sentnode1b").await.unwrap().unwrap();
        first_a.revision = 2000;
        first_b.revision = 2000;
        assert_eq!(first_a, second_a);
        assert_eq!(first_b, second_b);
    }

    #[tokio::test]
    async fn test_unknown_country_is_skipped_and_city_created() {
        let h = harness().await;
        h.mount_listing(&["sentnode1nowhere", "sentnode1berlin"], &[]).await;
        h.mount_status("sentnode1nowhere", status("Atlantis", 1, 10, 1)).await;
        h.mount_status("sentnode1berlin", status("Germany", 1, 10, 1)).await;

        let report = h.engine.reconcile(1000).await.unwrap();
        assert_eq!(report.unknown_country, 1);
        assert_eq!(report.upserted, 1);

        let servers = ServerQueries::new(&h.db);
        assert!(servers.get_by_address("sentnode1nowhere").await.unwrap().is_none());

        let germany = CountryQueries::new(&h.db).get_by_name("Germany").await.unwrap().unwrap();
        let berlin = servers.get_by_address("sentnode1berlin").await.unwrap().unwrap();
        let city = CityQueries::new(&h.db).get(germany.id, berlin.city_id).await.unwrap().unwrap();
        assert_eq!(city.name, "Berlin");
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_without_sweep() {
        let h = harness().await;
        let germany = CountryQueries::new(&h.db).get_by_name("Germany").await.unwrap().unwrap();
        let berlin = CityQueries::new(&h.db).get_or_create(germany.id, "Berlin").await.unwrap();
        ServerQueries::new(&h.db)
            .upsert(&test_server(germany.id, berlin.id, "sentnode1old", 80, 1))
            .await
            .unwrap();

        Mock::given(method("GET"))
            .and(path("/api/v1/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": {"message": "rpc unavailable"}
            })))
            .mount(&h.gateway)
            .await;

        let err = h.engine.reconcile(1000).await.unwrap_err();
        assert!(matches!(err, DvpnError::Network(_)));

        let old = ServerQueries::new(&h.db).get_by_address("sentnode1old").await.unwrap().unwrap();
        assert!(old.is_active);
    }

    #[tokio::test]
    async fn test_store_failure_skips_node_and_still_sweeps() {
        let h = harness().await;
        let germany = CountryQueries::new(&h.db).get_by_name("Germany").await.unwrap().unwrap();
        let berlin = CityQueries::new(&h.db).get_or_create(germany.id, "Berlin").await.unwrap();
        ServerQueries::new(&h.db)
            .upsert(&test_server(germany.id, berlin.id, "sentnode1stale", 80, 1))
            .await
            .unwrap();

        h.db.conn()
            .lock()
            .await
            .execute_batch(
                "CREATE TRIGGER reject_bad_server BEFORE INSERT ON servers \
                 WHEN NEW.address = 'sentnode1bad' \
                 BEGIN SELECT RAISE(ABORT, 'write rejected'); END;",
            )
            .unwrap();

        h.mount_listing(&["sentnode1bad", "sentnode1good"], &[]).await;
        h.mount_status("sentnode1bad", status("Germany", 1, 10, 1)).await;
        h.mount_status("sentnode1good", status("Germany", 1, 10, 1)).await;

        let report = h.engine.reconcile(1000).await.unwrap();
        assert_eq!(report.store_failures, 1);
        assert_eq!(report.upserted, 1);
        assert_eq!(report.deactivated, 1);

        let servers = ServerQueries::new(&h.db);
        assert!(servers.get_by_address("sentnode1bad").await.unwrap().is_none());
        assert!(servers.get_by_address("sentnode1good").await.unwrap().unwrap().is_active);
        assert!(!servers.get_by_address("sentnode1stale").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_fee_allowance_sync_marks_grantees() {
        let h = harness().await;
        let devices = DeviceQueries::new(&h.db);
        for (i, wallet) in ["sent1alice", "sent1bob"].iter().enumerate() {
            devices
                .insert(&NewDevice {
                    platform: DevicePlatform::Ios,
                    token: format!("token-{}", i),
                    wallet_address: wallet.to_string(),
                    wallet_entropy: vec![0; 16],
                })
                .await
                .unwrap();
        }

        Mock::given(method("GET"))
            .and(path("/api/v1/feegrants"))
            .and(wiremock::matchers::query_param("offset", "0"))
            .respond_with(envelope(json!([
                {"grantee": "sent1alice", "granter": "sent1provider"},
                {"grantee": "sent1bob", "granter": "sent1someoneelse"}
            ])))
            .mount(&h.gateway)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/feegrants"))
            .and(wiremock::matchers::query_param("offset", "100"))
            .respond_with(envelope(json!(null)))
            .mount(&h.gateway)
            .await;

        assert_eq!(h.engine.sync_fee_allowances().await.unwrap(), 1);
        let pending = devices.select_not_fee_granted(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].wallet_address, "sent1bob");
    }
}
