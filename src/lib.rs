//! dvpn-backend: a VPN-access marketplace backend on top of a decentralized ledger
//!
//! The ledger ("the Network") is the source of truth for node availability,
//! wallet balances, subscriptions and fee grants. This crate keeps a local
//! SQLite catalog converged with it and serves VPN credentials:
//!
//! - **Node sync**: mark-and-sweep reconciliation of the live node set into the catalog
//! - **Subscriptions**: lazy creation of node and plan subscriptions, recovering
//!   ledger-assigned IDs from transaction event logs
//! - **Wallets**: fee-grant and plan-enrollment convergence in small batches
//! - **Plan membership**: price and health gated admission/eviction of nodes
//! - **Credentials**: synchronous session key issuance for an enrolled device
//!
//! # Architecture
//!
//! 1. [`network::NetworkClient`] talks to the ledger REST gateway and to node status endpoints
//! 2. [`db::Database`] owns every persisted row
//! 3. [`jobs::Scheduler`] runs the reconciliation passes on independent tickers
//! 4. [`api`] exposes the catalog and the credential endpoints over HTTP
//!
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod db;
pub mod jobs;
pub mod network;
pub mod vpn;

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub use config::Config;
use db::Database;
use network::NetworkClient;

/// The main application state
#[derive(Clone)]
pub struct DvpnApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// Catalog store
    pub db: Arc<Database>,
    /// Ledger gateway client
    pub network: Arc<NetworkClient>,
    /// Request-path VPN services (subscriptions and credentials)
    pub vpn: Arc<vpn::VpnService>,
}

impl DvpnApp {
    /// Create a new application instance
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing dvpn-backend...");

        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        let db = Arc::new(Database::connect(&db_url).await?);

        if let Some(path) = &config.catalog.countries_file {
            let seeded = db.populate_countries(path).await?;
            if seeded > 0 {
                info!("Seeded {} countries from {}", seeded, path.display());
            }
        }

        let network = Arc::new(NetworkClient::new(&config.network)?);
        let vpn = Arc::new(vpn::VpnService::new(
            config.clone(),
            db.clone(),
            network.clone(),
        ));

        info!("dvpn-backend initialized successfully");

        Ok(Self {
            config,
            db,
            network,
            vpn,
        })
    }

    /// Start the application
    pub async fn run(&self) -> Result<()> {
        self.run_with_shutdown(tokio::sync::oneshot::channel().1)
            .await
    }

    /// Start the application with shutdown signal
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        info!("Starting dvpn-backend...");

        let scheduler = if self.config.scheduler.enabled {
            let scheduler = jobs::Scheduler::new(
                self.config.clone(),
                self.db.clone(),
                self.network.clone(),
                self.vpn.subscriptions.clone(),
            );
            scheduler.start();
            Some(scheduler)
        } else {
            info!("Scheduler disabled, reconciliation jobs will not run");
            None
        };

        let api_handle = tokio::spawn({
            let app = self.clone();
            async move {
                if let Err(e) = api::serve_with_shutdown(app, shutdown_rx).await {
                    warn!("API server error: {}", e);
                }
            }
        });

        info!(
            "dvpn-backend running. API available at http://{}",
            self.config.api_bind_address()
        );

        api_handle.await?;

        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }

        Ok(())
    }

    /// Shutdown the application gracefully
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down dvpn-backend...");
        self.db.close().await;
        info!("dvpn-backend shutdown complete");
        Ok(())
    }
}

/// Precondition that a credential request failed to meet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionKind {
    /// Device has no plan subscription or no fee grant yet
    DeviceNotEnrolled,
    /// Target server is not active
    ServerInactive,
    /// Target server is banned
    ServerBanned,
    /// Target server is not part of the provider plan
    ServerNotCovered,
}

impl PreconditionKind {
    /// Machine-readable code reported to clients
    pub fn code(&self) -> &'static str {
        match self {
            PreconditionKind::DeviceNotEnrolled => "deviceNotEnrolled",
            PreconditionKind::ServerInactive | PreconditionKind::ServerBanned => "serverInactive",
            PreconditionKind::ServerNotCovered => "serverNotCovered",
        }
    }
}

/// Error types for the dVPN backend
#[derive(thiserror::Error, Debug)]
pub enum DvpnError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport, HTTP status or envelope failure talking to the ledger or a node
    #[error("Network error: {0}")]
    Network(String),

    /// Successful response that lacks the expected data
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Expected local record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request-path precondition not met
    #[error("Precondition failed: {message}")]
    Precondition {
        /// Which precondition failed
        kind: PreconditionKind,
        /// Human-readable reason
        message: String,
    },

    /// Missing or unknown device token
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Device is banned
    #[error("Banned: {0}")]
    Banned(String),

    /// Invalid client input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Catalog store error
    #[error("Database error: {0}")]
    Database(String),
}

impl DvpnError {
    /// Shorthand for a precondition failure
    pub fn precondition(kind: PreconditionKind, message: impl Into<String>) -> Self {
        DvpnError::Precondition {
            kind,
            message: message.into(),
        }
    }

    /// Machine-readable error code reported to clients
    pub fn code(&self) -> &'static str {
        match self {
            DvpnError::NotFound(_) => "notFound",
            DvpnError::Unauthorized(_) => "unauthorizedDevice",
            DvpnError::Banned(_) => "bannedDevice",
            DvpnError::Precondition { kind, .. } => kind.code(),
            DvpnError::Validation(_) => "invalidRequest",
            DvpnError::Config(_)
            | DvpnError::Network(_)
            | DvpnError::MalformedResponse(_)
            | DvpnError::Database(_) => "unknownError",
        }
    }
}

impl From<anyhow::Error> for DvpnError {
    fn from(err: anyhow::Error) -> Self {
        DvpnError::Database(format!("{:#}", err))
    }
}

/// Result type alias for dVPN operations
pub type DvpnResult<T> = std::result::Result<T, DvpnError>;
