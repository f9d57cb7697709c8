//! Device authentication

use crate::{
    db::{Database, DeviceModel, DeviceQueries},
    DvpnError, DvpnResult,
};
use axum::http::HeaderMap;

/// Header carrying the device bearer token
pub const DEVICE_TOKEN_HEADER: &str = "x-device-token";

/// Resolves the calling device from request headers
pub struct AuthResolver<'a> {
    db: &'a Database,
}

impl<'a> AuthResolver<'a> {
    /// Create a resolver over the catalog store
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// The device owning the request's token. Banned devices are rejected.
    pub async fn current_device(&self, headers: &HeaderMap) -> DvpnResult<DeviceModel> {
        let token = headers
            .get(DEVICE_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| DvpnError::Unauthorized("device token is required".into()))?;

        let device = DeviceQueries::new(self.db)
            .get_by_token(token)
            .await?
            .ok_or_else(|| DvpnError::Unauthorized("invalid device token".into()))?;

        if device.is_banned {
            return Err(DvpnError::Banned(format!("device {} is banned", device.id)));
        }

        Ok(device)
    }
}
