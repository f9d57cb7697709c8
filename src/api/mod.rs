//! HTTP API
//!
//! - Catalog browsing: countries, cities and the servers of a city
//! - Credential issuance for a city or a specific server
//! - Device profile and usage
//! - Health check
//!
//! Every route except `/health` requires the `x-device-token` header.

use crate::{DvpnApp, DvpnError, DvpnResult};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

mod auth;
mod devices;
mod health;
mod vpn;

pub use auth::*;
pub use devices::*;
pub use health::*;
pub use vpn::*;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// The dVPN application
    pub app: DvpnApp,
}

impl ApiState {
    /// Render a handler result as an enveloped response
    pub fn respond<T: Serialize>(&self, result: DvpnResult<T>) -> Response {
        match result {
            Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))).into_response(),
            Err(e) => {
                let status = error_to_status_code(&e);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!("API: {}", e);
                }
                let reason = self
                    .app
                    .config
                    .api
                    .expose_error_reasons
                    .then(|| e.to_string());
                (status, Json(ApiResponse::<()>::error(e.code(), reason))).into_response()
            }
        }
    }
}

/// Build the API router
pub(crate) fn build_router(app: DvpnApp) -> Router {
    let state = ApiState { app };

    Router::new()
        .route("/health", get(health_check))
        .route("/versions", get(supported_versions))
        // Device
        .route("/device", get(get_device))
        .route("/device/usage", get(get_device_usage))
        // Catalog
        .route("/countries", get(list_countries))
        .route("/countries/:country_id/cities", get(list_cities))
        .route("/countries/:country_id/cities/:city_id/servers", get(list_servers))
        // Credentials
        .route(
            "/countries/:country_id/cities/:city_id/credentials",
            post(connect_to_city),
        )
        .route(
            "/countries/:country_id/cities/:city_id/credentials/:protocol",
            post(connect_to_city_with_protocol),
        )
        .route(
            "/countries/:country_id/cities/:city_id/servers/:server_id/credentials",
            post(connect_to_server),
        )
        .with_state(state)
}

/// Start the HTTP API server with graceful shutdown
pub async fn serve_with_shutdown(
    app: DvpnApp,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let config = app.config.clone();
    let router = build_router(app);

    let router = if config.api.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    let addr: std::net::SocketAddr = config
        .api
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            info!("Received shutdown signal, stopping API server...");
        })
        .await?;

    info!("API server stopped gracefully");
    Ok(())
}

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (only present if success is true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Machine-readable error code (only present if success is false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable reason, omitted when reasons are not exposed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            reason: None,
        }
    }

    /// Create an error response
    pub fn error(code: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(code.into()),
            reason,
        }
    }
}

/// Convert DvpnError to HTTP status code
pub fn error_to_status_code(err: &DvpnError) -> StatusCode {
    match err.code() {
        "unknownError" => StatusCode::INTERNAL_SERVER_ERROR,
        "notFound" => StatusCode::NOT_FOUND,
        "unauthorizedDevice" => StatusCode::UNAUTHORIZED,
        "bannedDevice" => StatusCode::FORBIDDEN,
        "deviceNotEnrolled" => StatusCode::TOO_EARLY,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Parse a numeric path segment
pub(crate) fn parse_id(name: &str, value: &str) -> DvpnResult<i64> {
    value
        .parse()
        .map_err(|e| DvpnError::Validation(format!("invalid {}: {}", name, e)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{Config, NetworkConfig};
    use crate::db::{DeviceModel, DevicePlatform, DeviceQueries, NewDevice};
    use wiremock::MockServer;

    /// A running API on an ephemeral port backed by an in-memory store
    pub struct TestApi {
        pub app: DvpnApp,
        pub base: String,
        pub http: reqwest::Client,
    }

    impl TestApi {
        pub async fn start(gateway: &MockServer) -> Self {
            Self::start_with(gateway, |_| {}).await
        }

        pub async fn start_with(gateway: &MockServer, customize: impl FnOnce(&mut Config)) -> Self {
            let mut config = Config::default();
            config.network = NetworkConfig {
                api_endpoint: gateway.uri(),
                plan_id: "7".into(),
                provider_address: "sent1provider".into(),
                ..Default::default()
            };
            config.database.url = "sqlite::memory:".into();
            config.scheduler.enabled = false;
            customize(&mut config);
            let app = DvpnApp::new(config).await.unwrap();

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let router = build_router(app.clone());
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });

            Self {
                app,
                base,
                http: reqwest::Client::new(),
            }
        }

        pub async fn device(&self, token: &str, enrolled: bool) -> DeviceModel {
            let devices = DeviceQueries::new(&self.app.db);
            let device = devices
                .insert(&NewDevice {
                    platform: DevicePlatform::Android,
                    token: token.to_string(),
                    wallet_address: format!("sent1{}", token),
                    wallet_entropy: vec![3; 16],
                })
                .await
                .unwrap();
            if enrolled {
                devices.set_subscription(&[device.id], 5).await.unwrap();
                devices.mark_fee_granted(&[device.id]).await.unwrap();
            }
            devices.get_by_id(device.id).await.unwrap().unwrap()
        }

        pub async fn get(&self, path: &str, token: Option<&str>) -> (u16, serde_json::Value) {
            let mut request = self.http.get(format!("{}{}", self.base, path));
            if let Some(token) = token {
                request = request.header("x-device-token", token);
            }
            let response = request.send().await.unwrap();
            (response.status().as_u16(), response.json().await.unwrap())
        }

        pub async fn post(&self, path: &str, token: &str) -> (u16, serde_json::Value) {
            let response = self
                .http
                .post(format!("{}{}", self.base, path))
                .header("x-device-token", token)
                .send()
                .await
                .unwrap();
            (response.status().as_u16(), response.json().await.unwrap())
        }
    }
}
