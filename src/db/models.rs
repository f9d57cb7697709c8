//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Country database model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountryModel {
    /// Row ID
    pub id: i64,
    /// Country name as reported by nodes (e.g. "Germany")
    pub name: String,
    /// ISO 3166-1 alpha-2 code
    pub code: String,
    /// Active, plan-included, non-banned servers in this country
    pub servers_available: i64,
}

/// City database model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CityModel {
    /// Row ID
    pub id: i64,
    /// Owning country
    pub country_id: i64,
    /// City name as reported by nodes
    pub name: String,
    /// Active, plan-included, non-banned servers in this city
    pub servers_available: i64,
}

/// VPN protocol a server speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerProtocol {
    /// WireGuard
    #[serde(rename = "WIREGUARD")]
    WireGuard,
    /// V2Ray
    #[serde(rename = "V2RAY")]
    V2Ray,
}

impl ServerProtocol {
    /// Map the node-reported type code. Unknown codes map to `None`.
    pub fn from_type_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ServerProtocol::WireGuard),
            2 => Some(ServerProtocol::V2Ray),
            _ => None,
        }
    }

    /// Wire/storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerProtocol::WireGuard => "WIREGUARD",
            ServerProtocol::V2Ray => "V2RAY",
        }
    }
}

impl fmt::Display for ServerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WIREGUARD" => Ok(ServerProtocol::WireGuard),
            "V2RAY" => Ok(ServerProtocol::V2Ray),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// A token amount
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coin {
    /// Token denomination
    pub denom: String,
    /// Amount in the smallest unit
    pub amount: i64,
}

/// Node bandwidth counters in bytes per second
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Bandwidth {
    /// Download speed
    pub download: i64,
    /// Upload speed
    pub upload: i64,
}

/// Node geographic location
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Location {
    /// Latitude
    pub latitude: f64,
    /// Longitude
    pub longitude: f64,
    /// City name
    pub city: String,
    /// Country name
    pub country: String,
}

/// Node details stored alongside a server.
///
/// Kept as a typed value and only serialized to JSON at the storage boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfiguration {
    /// Ledger address of the node
    pub address: String,
    /// Node-operated service URL
    pub remote_url: String,
    /// Reported bandwidth
    pub bandwidth: Bandwidth,
    /// Reported location
    pub location: Location,
    /// Price per gigabyte
    pub gigabyte_prices: Vec<Coin>,
    /// Price per hour
    pub hourly_prices: Vec<Coin>,
    /// Node software version
    pub version: String,
}

impl ServerConfiguration {
    /// Hourly price in the given denomination, if the node quotes one
    pub fn hourly_price(&self, denom: &str) -> Option<i64> {
        self.hourly_prices
            .iter()
            .find(|c| c.denom == denom)
            .map(|c| c.amount)
    }
}

/// Server database model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerModel {
    /// Row ID
    pub id: i64,
    /// Country reference
    pub country_id: i64,
    /// City reference
    pub city_id: i64,
    /// Display name (node moniker)
    pub name: String,
    /// Supported protocols
    pub protocols: Vec<ServerProtocol>,
    /// Node details
    pub configuration: ServerConfiguration,
    /// Peers over peer capacity, within [0, 1]
    pub current_load: f64,
    /// Seen with a successful probe in the latest sync pass
    pub is_active: bool,
    /// Excluded by an operator
    pub is_banned: bool,
    /// Member of the provider plan
    pub is_included_in_plan: bool,
    /// Epoch of the sync pass that last observed this server
    pub revision: i64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl ServerModel {
    /// Ledger address of the node
    pub fn address(&self) -> &str {
        &self.configuration.address
    }

    /// Whether this server speaks the given protocol
    pub fn supports(&self, protocol: ServerProtocol) -> bool {
        self.protocols.contains(&protocol)
    }
}

/// Server values written by a sync pass
#[derive(Debug, Clone)]
pub struct ServerUpsert {
    /// Country reference
    pub country_id: i64,
    /// City reference
    pub city_id: i64,
    /// Display name
    pub name: String,
    /// Supported protocols
    pub protocols: Vec<ServerProtocol>,
    /// Node details, including the address
    pub configuration: ServerConfiguration,
    /// Computed load
    pub current_load: f64,
    /// Plan membership on the ledger
    pub is_included_in_plan: bool,
    /// Pass epoch
    pub revision: i64,
}

/// Device platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DevicePlatform {
    /// Android
    Android,
    /// iOS
    #[serde(rename = "IOS")]
    Ios,
    /// Windows
    Windows,
    /// macOS
    #[serde(rename = "MACOS")]
    MacOs,
    /// Linux
    Linux,
}

impl DevicePlatform {
    /// Storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePlatform::Android => "ANDROID",
            DevicePlatform::Ios => "IOS",
            DevicePlatform::Windows => "WINDOWS",
            DevicePlatform::MacOs => "MACOS",
            DevicePlatform::Linux => "LINUX",
        }
    }
}

impl FromStr for DevicePlatform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ANDROID" => Ok(DevicePlatform::Android),
            "IOS" => Ok(DevicePlatform::Ios),
            "WINDOWS" => Ok(DevicePlatform::Windows),
            "MACOS" => Ok(DevicePlatform::MacOs),
            "LINUX" => Ok(DevicePlatform::Linux),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// Device database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceModel {
    /// Row ID
    pub id: i64,
    /// Client platform
    pub platform: DevicePlatform,
    /// Bearer token
    #[serde(skip_serializing)]
    pub token: String,
    /// Device wallet address
    pub wallet_address: String,
    /// BIP39 entropy of the device wallet
    #[serde(skip_serializing)]
    pub wallet_entropy: Vec<u8>,
    /// Excluded by an operator
    pub is_banned: bool,
    /// Plan subscription the wallet is enrolled against
    pub subscription_id: Option<i64>,
    /// Wallet holds a fee allowance from the provider
    pub is_fee_granted: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl DeviceModel {
    /// Enrolled in a plan subscription and able to pay fees
    pub fn is_enrolled(&self) -> bool {
        self.subscription_id.is_some() && self.is_fee_granted
    }
}

/// Values for a newly registered device
#[derive(Debug, Clone)]
pub struct NewDevice {
    /// Client platform
    pub platform: DevicePlatform,
    /// Bearer token
    pub token: String,
    /// Device wallet address
    pub wallet_address: String,
    /// BIP39 entropy of the device wallet
    pub wallet_entropy: Vec<u8>,
}

/// Provider plan subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSubscriptionModel {
    /// Ledger subscription ID
    pub id: i64,
    /// Expiry
    pub inactive_at: DateTime<Utc>,
}

/// Provider subscription on a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSubscriptionModel {
    /// Ledger subscription ID
    pub id: i64,
    /// Node address
    pub node_address: String,
    /// Expiry
    pub inactive_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_type_codes() {
        assert_eq!(ServerProtocol::from_type_code(1), Some(ServerProtocol::WireGuard));
        assert_eq!(ServerProtocol::from_type_code(2), Some(ServerProtocol::V2Ray));
        assert_eq!(ServerProtocol::from_type_code(0), None);
        assert_eq!(ServerProtocol::from_type_code(7), None);
    }

    #[test]
    fn test_protocol_serialization() {
        let json = serde_json::to_string(&vec![ServerProtocol::WireGuard, ServerProtocol::V2Ray]).unwrap();
        assert_eq!(json, r#"["WIREGUARD","V2RAY"]"#);
        assert_eq!("wireguard".parse::<ServerProtocol>(), Ok(ServerProtocol::WireGuard));
        assert!("openvpn".parse::<ServerProtocol>().is_err());
    }

    #[test]
    fn test_hourly_price_by_denom() {
        let config = ServerConfiguration {
            hourly_prices: vec![
                Coin { denom: "uatom".into(), amount: 5 },
                Coin { denom: "udvpn".into(), amount: 80 },
            ],
            ..Default::default()
        };
        assert_eq!(config.hourly_price("udvpn"), Some(80));
        assert_eq!(config.hourly_price("uosmo"), None);
    }
}
