//! Ledger gateway integration
//!
//! Wire types for the REST gateway and the node status endpoint, plus the
//! [`NetworkClient`] that speaks to both.

use crate::db::{Bandwidth, Coin, Location, ServerProtocol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod client;
mod events;

pub use client::*;
pub use events::*;

/// Subscription status code the ledger uses for an active subscription
pub const SUBSCRIPTION_STATUS_ACTIVE: i64 = 1;

/// Response envelope used by the gateway and by node status endpoints
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    /// Whether the call succeeded
    #[serde(default)]
    pub success: bool,
    /// Upstream error, if any
    #[serde(default)]
    pub error: Option<EnvelopeError>,
    /// Payload, absent on errors and on exhausted pages
    pub result: Option<T>,
}

/// Error body inside an [`Envelope`]
#[derive(Debug, Deserialize)]
pub struct EnvelopeError {
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

/// Parse a decimal amount string.
///
/// Unparsable amounts yield zero; callers must treat zero as possibly unknown.
pub fn parse_amount(amount: &str) -> i64 {
    amount.trim().parse::<i64>().unwrap_or(0)
}

/// Token amount as transmitted by the ledger (decimal string)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteCoin {
    /// Token denomination
    #[serde(default)]
    pub denom: String,
    /// Decimal amount
    #[serde(default)]
    pub amount: String,
}

impl RemoteCoin {
    /// Typed amount
    pub fn to_coin(&self) -> Coin {
        Coin {
            denom: self.denom.clone(),
            amount: parse_amount(&self.amount),
        }
    }
}

/// A node registered on the ledger
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RemoteNode {
    /// Node account address
    pub address: String,
    /// Price per gigabyte
    #[serde(default)]
    pub gigabyte_prices: Vec<RemoteCoin>,
    /// Price per hour
    #[serde(default)]
    pub hourly_prices: Vec<RemoteCoin>,
    /// Node-operated service URL
    #[serde(default)]
    pub remote_url: String,
    /// Ledger status code
    #[serde(default)]
    pub status: i64,
}

/// Peer capacity reported by a node
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct QoS {
    /// Maximum concurrent peers
    #[serde(default)]
    pub max_peers: i64,
}

/// Live status reported by a node's own endpoint
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct NodeStatus {
    /// Node account address
    #[serde(default)]
    pub address: String,
    /// Bandwidth counters
    #[serde(default)]
    pub bandwidth: Bandwidth,
    /// Geographic location
    #[serde(default)]
    pub location: Location,
    /// Operator-chosen name
    #[serde(default)]
    pub moniker: String,
    /// Connected peers
    #[serde(default)]
    pub peers: i64,
    /// Peer capacity
    #[serde(default)]
    pub qos: QoS,
    /// Protocol type code
    #[serde(default, rename = "type")]
    pub node_type: i64,
    /// Node software version
    #[serde(default)]
    pub version: String,
}

impl NodeStatus {
    /// Load ratio `peers / max_peers`, clamped to [0, 1].
    ///
    /// A node reporting no capacity counts as fully loaded.
    pub fn load(&self) -> f64 {
        if self.qos.max_peers <= 0 {
            return 1.0;
        }
        let peers = self.peers.max(0) as f64;
        (peers / self.qos.max_peers as f64).min(1.0)
    }

    /// Protocols derived from the type code; unknown codes give none
    pub fn protocols(&self) -> Vec<ServerProtocol> {
        ServerProtocol::from_type_code(self.node_type)
            .into_iter()
            .collect()
    }
}

/// Common subscription fields
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SubscriptionBase {
    /// Ledger subscription ID
    pub id: i64,
    /// Owner address
    #[serde(default)]
    pub address: String,
    /// Status code
    #[serde(default)]
    pub status: i64,
    /// Expiry
    pub inactive_at: DateTime<Utc>,
}

/// A node or plan subscription
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Subscription {
    /// Common fields
    pub base: SubscriptionBase,
    /// Plan ID for plan subscriptions
    #[serde(default)]
    pub plan_id: i64,
    /// Node address for node subscriptions
    #[serde(default)]
    pub node_address: String,
    /// Deposit paid
    #[serde(default)]
    pub deposit: RemoteCoin,
    /// Data allowance
    #[serde(default)]
    pub gigabytes: i64,
    /// Time allowance
    #[serde(default)]
    pub hours: i64,
}

impl Subscription {
    /// Active on the ledger and not expired at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.base.status == SUBSCRIPTION_STATUS_ACTIVE && self.base.inactive_at > now
    }
}

/// Bytes granted to and used by one wallet under a subscription
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RemoteAllocation {
    /// Wallet address
    #[serde(default)]
    pub address: String,
    /// Granted bytes, decimal string
    #[serde(default)]
    pub granted_bytes: String,
    /// Used bytes, decimal string
    #[serde(default)]
    pub utilised_bytes: String,
}

/// Parsed allocation
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Allocation {
    /// Wallet address
    pub address: String,
    /// Granted bytes
    pub granted_bytes: i64,
    /// Used bytes
    pub utilised_bytes: i64,
}

impl From<RemoteAllocation> for Allocation {
    fn from(remote: RemoteAllocation) -> Self {
        Self {
            granted_bytes: parse_amount(&remote.granted_bytes),
            utilised_bytes: parse_amount(&remote.utilised_bytes),
            address: remote.address,
        }
    }
}

/// Session credentials issued for a node
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Credentials {
    /// Session identifier (V2Ray)
    #[serde(default)]
    pub uid: Option<String>,
    /// Client private key (WireGuard)
    #[serde(default)]
    pub private_key: Option<String>,
    /// Opaque connection payload
    #[serde(default)]
    pub result: String,
}

/// Fee allowance issued by a granter
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Allowance {
    /// Wallet receiving the allowance
    pub grantee: String,
    /// Wallet paying the fees
    pub granter: String,
}

/// Event attribute, base64 key and value
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EventAttribute {
    /// Base64 key
    #[serde(default)]
    pub key: String,
    /// Base64 value
    #[serde(default)]
    pub value: String,
}

/// Transaction event
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TransactionEvent {
    /// Fully qualified event type
    #[serde(rename = "type")]
    pub event_type: String,
    /// Attributes
    #[serde(default)]
    pub attributes: Vec<EventAttribute>,
}

/// Receipt of a broadcast transaction
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Transaction {
    /// Block height
    #[serde(default)]
    pub height: i64,
    /// Transaction hash
    #[serde(default)]
    pub txhash: String,
    /// Emitted events
    #[serde(default)]
    pub events: Vec<TransactionEvent>,
}
