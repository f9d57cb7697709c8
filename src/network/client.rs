//! Ledger REST gateway client
//!
//! Read calls return one page (or `None` once the ledger has nothing more);
//! the `fetch_all_*` variants walk pages of [`PAGE_SIZE`] until exhaustion.
//! Mutating calls broadcast a transaction and return its receipt.

use super::{
    extract_subscription_id, Allocation, Allowance, Credentials, Envelope, NodeStatus,
    RemoteAllocation, RemoteCoin, RemoteNode, Subscription, Transaction, NODE_SUBSCRIPTION_EVENT,
    PLAN_SUBSCRIPTION_EVENT,
};
use crate::{config::NetworkConfig, DvpnError, DvpnResult};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Page size for paginated ledger reads
pub const PAGE_SIZE: u32 = 100;

/// Timeout for node status probes
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

type Query = Vec<(&'static str, String)>;

/// Walk a paginated read until a page comes back empty or absent.
///
/// The first failing page aborts the walk; partial results are never returned.
pub async fn paginate<T, F, Fut>(mut fetch: F) -> DvpnResult<Vec<T>>
where
    F: FnMut(u32, u32) -> Fut,
    Fut: Future<Output = DvpnResult<Option<Vec<T>>>>,
{
    let mut items = Vec::new();
    let mut offset = 0;

    loop {
        match fetch(offset, PAGE_SIZE).await? {
            Some(page) if !page.is_empty() => {
                items.extend(page);
                offset += PAGE_SIZE;
            }
            _ => break,
        }
    }

    Ok(items)
}

#[derive(Serialize)]
struct SubscribeNodeRequest<'a> {
    authz_granter: &'a str,
    fee_granter: &'a str,
    mnemonic: &'a str,
    denom: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    gigabytes: i64,
    #[serde(skip_serializing_if = "is_zero")]
    hours: i64,
}

#[derive(Serialize)]
struct SubscribePlanRequest<'a> {
    authz_granter: &'a str,
    fee_granter: &'a str,
    mnemonic: &'a str,
    denom: &'a str,
}

#[derive(Serialize)]
struct SessionKeysRequest<'a> {
    fee_granter: &'a str,
    mnemonic: &'a str,
}

#[derive(Serialize)]
struct FeeGrantRequest<'a> {
    authz_granter: &'a str,
    fee_granter: &'a str,
    mnemonic: &'a str,
    acc_addresses: &'a [String],
}

#[derive(Serialize)]
struct EnrollRequest<'a> {
    fee_granter: &'a str,
    mnemonic: &'a str,
    acc_addresses: &'a [String],
    bytes: Vec<i64>,
}

#[derive(Serialize)]
struct PlanNodesRequest<'a> {
    authz_granter: &'a str,
    fee_granter: &'a str,
    mnemonic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_addresses: Option<&'a [String]>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Client for the ledger REST gateway and for node status endpoints
pub struct NetworkClient {
    /// Gateway client with the configured timeout
    http: reqwest::Client,
    /// Node probe client: short timeout, node certificates not verified
    probe: reqwest::Client,
    config: NetworkConfig,
}

impl NetworkClient {
    /// Build the gateway and probe clients
    pub fn new(config: &NetworkConfig) -> DvpnResult<Self> {
        info!("Creating ledger gateway client for {}", config.api_endpoint);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| DvpnError::Config(format!("Failed to build gateway client: {}", e)))?;

        // Node endpoints commonly use self-signed certificates
        let probe = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| DvpnError::Config(format!("Failed to build probe client: {}", e)))?;

        Ok(Self {
            http,
            probe,
            config: config.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.config.api_endpoint.trim_end_matches('/'), path)
    }

    fn chain_query(&self) -> Query {
        vec![
            ("rpc_address", self.config.rpc_endpoint.clone()),
            ("chain_id", self.config.chain_id.clone()),
        ]
    }

    fn page_query(&self, offset: u32, limit: u32) -> Query {
        let mut query = self.chain_query();
        query.push(("limit", limit.to_string()));
        query.push(("offset", offset.to_string()));
        query
    }

    fn tx_query(&self, gas: u64) -> Query {
        let mut query = self.chain_query();
        query.push(("gas_prices", self.config.gas_prices()));
        query.push(("gas", gas.to_string()));
        query.push(("simulate_and_execute", "false".to_string()));
        query
    }

    fn provider(&self) -> &str {
        &self.config.provider_address
    }

    /// Decode an envelope, failing on HTTP errors and `success = false`
    async fn read_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> DvpnResult<Option<T>> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DvpnError::Network(format!("{}: failed to read body: {}", what, e)))?;

        let envelope: Envelope<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(DvpnError::Network(format!("{}: HTTP {}", what, status)));
            }
            Err(e) => {
                return Err(DvpnError::Network(format!("{}: invalid response body: {}", what, e)));
            }
        };

        if !status.is_success() || !envelope.success {
            let message = envelope
                .error
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(DvpnError::Network(format!("{}: {}", what, message)));
        }

        Ok(envelope.result)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &Query, what: &str) -> DvpnResult<Option<T>> {
        debug!("GET {} ({})", path, what);
        let response = self
            .http
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| DvpnError::Network(format!("{}: {}", what, e)))?;
        Self::read_envelope(response, what).await
    }

    async fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &Query,
        body: &B,
        what: &str,
    ) -> DvpnResult<Option<T>> {
        debug!("{} {} ({})", method, path, what);
        let response = self
            .http
            .request(method, self.url(path))
            .query(query)
            .json(body)
            .send()
            .await
            .map_err(|e| DvpnError::Network(format!("{}: {}", what, e)))?;
        Self::read_envelope(response, what).await
    }

    async fn broadcast<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        gas: u64,
        body: &B,
        what: &str,
    ) -> DvpnResult<Transaction> {
        let tx: Option<Transaction> = self.send(method, path, &self.tx_query(gas), body, what).await?;
        let tx = tx.ok_or_else(|| DvpnError::MalformedResponse(format!("{}: no transaction in response", what)))?;
        info!("{}: tx {} included at height {}", what, tx.txhash, tx.height);
        Ok(tx)
    }

    // Reads

    /// One page of active nodes
    pub async fn fetch_nodes(&self, offset: u32, limit: u32) -> DvpnResult<Option<Vec<RemoteNode>>> {
        let mut query = self.page_query(offset, limit);
        query.push(("status", "Active".to_string()));
        self.get("/nodes", &query, "fetch nodes").await
    }

    /// Every active node
    pub async fn fetch_all_nodes(&self) -> DvpnResult<Vec<RemoteNode>> {
        paginate(|offset, limit| self.fetch_nodes(offset, limit)).await
    }

    /// One page of the nodes on the provider plan
    pub async fn fetch_plan_nodes(&self, offset: u32, limit: u32) -> DvpnResult<Option<Vec<RemoteNode>>> {
        let path = format!("/plans/{}/nodes", self.config.plan_id);
        self.get(&path, &self.page_query(offset, limit), "fetch plan nodes").await
    }

    /// Every node on the provider plan
    pub async fn fetch_all_plan_nodes(&self) -> DvpnResult<Vec<RemoteNode>> {
        paginate(|offset, limit| self.fetch_plan_nodes(offset, limit)).await
    }

    /// Probe a node's own status endpoint
    pub async fn fetch_node_status(&self, remote_url: &str) -> DvpnResult<NodeStatus> {
        let url = format!("{}/status", remote_url.trim_end_matches('/'));
        let what = format!("fetch status of {}", remote_url);
        let response = self
            .probe
            .get(&url)
            .send()
            .await
            .map_err(|e| DvpnError::Network(format!("{}: {}", what, e)))?;
        Self::read_envelope::<NodeStatus>(response, &what)
            .await?
            .ok_or_else(|| DvpnError::MalformedResponse(format!("{}: empty status", what)))
    }

    /// Wallet balance in the default denomination
    pub async fn fetch_balance(&self, wallet: &str) -> DvpnResult<i64> {
        let path = format!("/accounts/{}/balances", wallet);
        let balances: Option<Vec<RemoteCoin>> =
            self.get(&path, &self.chain_query(), "fetch balance").await?;
        Ok(balances
            .unwrap_or_default()
            .iter()
            .find(|coin| coin.denom == self.config.denom)
            .map(|coin| coin.to_coin().amount)
            .unwrap_or(0))
    }

    /// One page of a wallet's subscriptions
    pub async fn fetch_subscriptions(
        &self,
        wallet: &str,
        offset: u32,
        limit: u32,
    ) -> DvpnResult<Option<Vec<Subscription>>> {
        let path = format!("/accounts/{}/subscriptions", wallet);
        self.get(&path, &self.page_query(offset, limit), "fetch subscriptions").await
    }

    /// Every subscription owned by a wallet
    pub async fn fetch_all_subscriptions(&self, wallet: &str) -> DvpnResult<Vec<Subscription>> {
        paginate(|offset, limit| self.fetch_subscriptions(wallet, offset, limit)).await
    }

    /// A subscription by ID
    pub async fn fetch_subscription(&self, id: i64) -> DvpnResult<Subscription> {
        let path = format!("/subscriptions/{}", id);
        self.get(&path, &self.chain_query(), "fetch subscription")
            .await?
            .ok_or_else(|| DvpnError::MalformedResponse(format!("subscription {} missing from response", id)))
    }

    /// Allocations granted under a subscription
    pub async fn fetch_allocations(&self, subscription_id: i64) -> DvpnResult<Vec<Allocation>> {
        let path = format!("/subscriptions/{}/allocations", subscription_id);
        let allocations: Option<Vec<RemoteAllocation>> =
            self.get(&path, &self.chain_query(), "fetch allocations").await?;
        Ok(allocations
            .unwrap_or_default()
            .into_iter()
            .map(Allocation::from)
            .collect())
    }

    /// One page of fee allowances issued by `granter`
    pub async fn fetch_allowances(
        &self,
        granter: &str,
        offset: u32,
        limit: u32,
    ) -> DvpnResult<Option<Vec<Allowance>>> {
        let mut query = self.page_query(offset, limit);
        query.push(("granter", granter.to_string()));
        self.get("/feegrants", &query, "fetch fee allowances").await
    }

    /// Every fee allowance issued by `granter`
    pub async fn fetch_all_allowances(&self, granter: &str) -> DvpnResult<Vec<Allowance>> {
        paginate(|offset, limit| self.fetch_allowances(granter, offset, limit)).await
    }

    // Transactions

    /// Subscribe the provider to a node. Returns the new subscription ID.
    pub async fn create_node_subscription(
        &self,
        node_address: &str,
        mnemonic: &str,
        gigabytes: i64,
        hours: i64,
    ) -> DvpnResult<i64> {
        let body = SubscribeNodeRequest {
            authz_granter: self.provider(),
            fee_granter: self.provider(),
            mnemonic,
            denom: &self.config.denom,
            gigabytes,
            hours,
        };
        let path = format!("/nodes/{}/subscriptions", node_address);
        let tx = self
            .broadcast(Method::POST, &path, self.config.gas_base, &body, "create node subscription")
            .await?;
        extract_subscription_id(&tx, NODE_SUBSCRIPTION_EVENT)
    }

    /// Subscribe the provider to its own plan. Returns the new subscription ID.
    pub async fn create_plan_subscription(&self, mnemonic: &str) -> DvpnResult<i64> {
        let body = SubscribePlanRequest {
            authz_granter: self.provider(),
            fee_granter: self.provider(),
            mnemonic,
            denom: &self.config.denom,
        };
        let path = format!("/plans/{}/subscriptions", self.config.plan_id);
        let tx = self
            .broadcast(Method::POST, &path, self.config.gas_base, &body, "create plan subscription")
            .await?;
        extract_subscription_id(&tx, PLAN_SUBSCRIPTION_EVENT)
    }

    /// Request session credentials for a node under `subscription_id`
    pub async fn create_credentials(
        &self,
        node_address: &str,
        subscription_id: i64,
        mnemonic: &str,
    ) -> DvpnResult<Credentials> {
        let body = SessionKeysRequest {
            fee_granter: self.provider(),
            mnemonic,
        };
        let path = format!("/nodes/{}/sessions/{}/keys", node_address, subscription_id);
        let mut query = self.chain_query();
        query.push(("gas_prices", self.config.gas_prices()));
        query.push(("gas", self.config.gas_base.to_string()));

        let credentials: Option<Credentials> = self
            .send(Method::POST, &path, &query, &body, "create credentials")
            .await?;
        credentials.ok_or_else(|| {
            DvpnError::MalformedResponse(format!("no credentials returned for node {}", node_address))
        })
    }

    /// Grant fee allowances to a batch of wallets
    pub async fn grant_fee(&self, wallets: &[String], mnemonic: &str) -> DvpnResult<Transaction> {
        let body = FeeGrantRequest {
            authz_granter: self.provider(),
            fee_granter: self.provider(),
            mnemonic,
            acc_addresses: wallets,
        };
        let gas = self.config.batch_gas(wallets.len());
        self.broadcast(Method::POST, "/feegrants", gas, &body, "grant fee").await
    }

    /// Allocate `bytes` to each wallet under a plan subscription
    pub async fn enroll_wallets(
        &self,
        subscription_id: i64,
        wallets: &[String],
        bytes: i64,
        mnemonic: &str,
    ) -> DvpnResult<Transaction> {
        let body = EnrollRequest {
            fee_granter: self.provider(),
            mnemonic,
            acc_addresses: wallets,
            bytes: vec![bytes; wallets.len()],
        };
        let path = format!("/subscriptions/{}/allocations", subscription_id);
        let gas = self.config.batch_gas(wallets.len());
        self.broadcast(Method::POST, &path, gas, &body, "enroll wallets").await
    }

    /// Add nodes to the provider plan
    pub async fn add_plan_nodes(&self, node_addresses: &[String], mnemonic: &str) -> DvpnResult<Transaction> {
        let body = PlanNodesRequest {
            authz_granter: self.provider(),
            fee_granter: self.provider(),
            mnemonic,
            node_addresses: Some(node_addresses),
        };
        let path = format!("/plans/{}/nodes", self.config.plan_id);
        let gas = self.config.batch_gas(node_addresses.len());
        self.broadcast(Method::POST, &path, gas, &body, "add plan nodes").await
    }

    /// Remove one node from the provider plan
    pub async fn remove_plan_node(&self, node_address: &str, mnemonic: &str) -> DvpnResult<Transaction> {
        let body = PlanNodesRequest {
            authz_granter: self.provider(),
            fee_granter: self.provider(),
            mnemonic,
            node_addresses: None,
        };
        let path = format!("/plans/{}/nodes/{}", self.config.plan_id, node_address);
        self.broadcast(Method::PUT, &path, self.config.gas_base, &body, "remove plan node")
            .await
    }
}
