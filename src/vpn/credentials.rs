//! Session credential issuance
//!
//! Request path: every precondition is checked against the store before the
//! first ledger call, then a node subscription is resolved (or created) and
//! the ledger is asked for session keys signed with the device's own wallet.

use super::SubscriptionLifecycle;
use crate::{
    db::{DeviceModel, ServerModel, ServerProtocol},
    network::NetworkClient,
    DvpnError, DvpnResult, PreconditionKind,
};
use bip39::{Language, Mnemonic};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Credentials handed to a device
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IssuedCredentials {
    /// Protocol the payload is for
    pub protocol: ServerProtocol,
    /// Opaque connection payload
    pub payload: String,
    /// Client private key (WireGuard)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Session identifier (V2Ray)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Node latitude
    pub latitude: f64,
    /// Node longitude
    pub longitude: f64,
}

/// Issues session credentials for enrolled devices
pub struct CredentialIssuer {
    network: Arc<NetworkClient>,
    subscriptions: Arc<SubscriptionLifecycle>,
}

impl CredentialIssuer {
    /// Create a new issuer
    pub fn new(network: Arc<NetworkClient>, subscriptions: Arc<SubscriptionLifecycle>) -> Self {
        Self { network, subscriptions }
    }

    /// Issue credentials for `device` on `server`.
    ///
    /// `protocol` selects among the server's protocols; without it the first
    /// advertised protocol is used.
    pub async fn issue(
        &self,
        device: &DeviceModel,
        server: &ServerModel,
        protocol: Option<ServerProtocol>,
    ) -> DvpnResult<IssuedCredentials> {
        let subscription_id = check_enrolled(device)?;
        check_server(server)?;
        let protocol = select_protocol(server, protocol)?;
        let mnemonic = device_mnemonic(device)?;

        let node_subscription = self.subscriptions.node_subscription(server.address()).await?;
        debug!(
            "Device {} connecting to {} (node subscription {}, plan subscription {})",
            device.id,
            server.address(),
            node_subscription.id,
            subscription_id
        );

        let credentials = self
            .network
            .create_credentials(server.address(), subscription_id, &mnemonic)
            .await?;

        info!("Issued {} credentials for device {} on server {}", protocol, device.id, server.id);

        Ok(IssuedCredentials {
            protocol,
            payload: credentials.result,
            private_key: credentials.private_key.filter(|k| !k.is_empty()),
            uid: credentials.uid.filter(|u| !u.is_empty()),
            latitude: server.configuration.location.latitude,
            longitude: server.configuration.location.longitude,
        })
    }
}

fn check_enrolled(device: &DeviceModel) -> DvpnResult<i64> {
    match device.subscription_id {
        Some(id) if device.is_enrolled() => Ok(id),
        _ => Err(DvpnError::precondition(
            PreconditionKind::DeviceNotEnrolled,
            "wallet is not yet enrolled",
        )),
    }
}

fn check_server(server: &ServerModel) -> DvpnResult<()> {
    if !server.is_active {
        return Err(DvpnError::precondition(
            PreconditionKind::ServerInactive,
            format!("server {} is not active", server.id),
        ));
    }
    if server.is_banned {
        return Err(DvpnError::precondition(
            PreconditionKind::ServerBanned,
            format!("server {} is banned", server.id),
        ));
    }
    if !server.is_included_in_plan {
        return Err(DvpnError::precondition(
            PreconditionKind::ServerNotCovered,
            format!("server {} is not available with subscription", server.id),
        ));
    }
    Ok(())
}

fn select_protocol(server: &ServerModel, requested: Option<ServerProtocol>) -> DvpnResult<ServerProtocol> {
    match requested {
        Some(protocol) if server.supports(protocol) => Ok(protocol),
        Some(protocol) => Err(DvpnError::Validation(format!(
            "server {} does not support {}",
            server.id, protocol
        ))),
        None => server.protocols.first().copied().ok_or_else(|| {
            DvpnError::Validation(format!("server {} advertises no protocol", server.id))
        }),
    }
}

/// Re-derive the device wallet mnemonic from its stored entropy
pub fn device_mnemonic(device: &DeviceModel) -> DvpnResult<String> {
    Mnemonic::from_entropy_in(Language::English, &device.wallet_entropy)
        .map(|m| m.to_string())
        .map_err(|e| DvpnError::Database(format!("device {} has invalid wallet entropy: {}", device.id, e)))
}
