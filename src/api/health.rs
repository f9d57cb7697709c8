//! Health check and supported client versions

use super::ApiState;
use crate::{DvpnError, DvpnResult};
use axum::{extract::State, response::Response};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
}

/// Minimum client versions, keyed the way the apps expect
#[derive(Debug, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct SupportedVersions {
    /// Minimum API version
    pub api: String,
    /// Minimum Android app version
    pub android: String,
    /// Minimum iOS app version
    pub ios: String,
}

/// Health check endpoint: answers only if the catalog store does
pub async fn health_check(State(state): State<ApiState>) -> Response {
    let result = state
        .app
        .db
        .ping()
        .await
        .map(|_| HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .map_err(|e| DvpnError::Database(format!("Error checking database health: {}", e)));

    state.respond(result)
}

/// Oldest API, Android and iOS versions still supported
pub async fn supported_versions(State(state): State<ApiState>) -> Response {
    let versions = &state.app.config.app;
    let result: DvpnResult<SupportedVersions> = Ok(SupportedVersions {
        api: versions.min_api_version.clone(),
        android: versions.min_android_version.clone(),
        ios: versions.min_ios_version.clone(),
    });
    state.respond(result)
}
