//! Device endpoints

use super::{ApiState, AuthResolver};
use crate::{db::DeviceModel, network::Allocation, DvpnResult};
use axum::{extract::State, http::HeaderMap, response::Response};
use serde::Serialize;

/// Wallet balance and plan allocation of a device
#[derive(Debug, Serialize)]
pub struct DeviceUsage {
    /// Wallet balance in the default denomination
    pub balance: i64,
    /// Bytes allocated to the wallet under its plan subscription
    pub allocation: Option<Allocation>,
}

/// Profile of the calling device
pub async fn get_device(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let result: DvpnResult<DeviceModel> = AuthResolver::new(&state.app.db).current_device(&headers).await;
    state.respond(result)
}

/// Balance and allocation of the calling device
pub async fn get_device_usage(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let result = device_usage(&state, &headers).await;
    state.respond(result)
}

async fn device_usage(state: &ApiState, headers: &HeaderMap) -> DvpnResult<DeviceUsage> {
    let device = AuthResolver::new(&state.app.db).current_device(headers).await?;
    let network = &state.app.network;

    let balance = network.fetch_balance(&device.wallet_address).await?;
    let allocation = match device.subscription_id {
        Some(subscription_id) => network
            .fetch_allocations(subscription_id)
            .await?
            .into_iter()
            .find(|a| a.address == device.wallet_address),
        None => None,
    };

    Ok(DeviceUsage { balance, allocation })
}
