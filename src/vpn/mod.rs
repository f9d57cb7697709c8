//! Request-path VPN services
//!
//! Subscription lifecycle and credential issuance, shared between the HTTP
//! handlers and the enrollment job.

use crate::{config::Config, db::Database, network::NetworkClient};
use std::sync::Arc;

mod credentials;
mod subscriptions;

pub use credentials::*;
pub use subscriptions::*;

/// Request-path services
pub struct VpnService {
    /// Node and plan subscription lifecycle
    pub subscriptions: Arc<SubscriptionLifecycle>,
    /// Session credential issuer
    pub credentials: CredentialIssuer,
}

impl VpnService {
    /// Wire the services to the shared store and ledger client
    pub fn new(config: Arc<Config>, db: Arc<Database>, network: Arc<NetworkClient>) -> Self {
        let subscriptions = Arc::new(SubscriptionLifecycle::new(config, db, network.clone()));
        let credentials = CredentialIssuer::new(network, subscriptions.clone());
        Self {
            subscriptions,
            credentials,
        }
    }
}
