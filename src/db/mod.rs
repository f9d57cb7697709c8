//! Catalog store
//!
//! This module handles persistent storage for:
//! - Location dimensions (countries, cities) with availability counters
//! - Servers projected from the ledger node set
//! - Devices and their wallet convergence state
//! - Provider plan and node subscriptions

use anyhow::Context;
use rusqlite::Connection;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod models;
mod queries;

pub use models::*;
pub use queries::*;

/// Database handle shared by every component
#[derive(Clone)]
pub struct Database {
    /// SQLite connection (wrapped in Arc<Mutex> for thread safety)
    conn: Arc<Mutex<Connection>>,
}

/// Country record in the seed file
#[derive(Debug, Deserialize)]
struct CountrySeed {
    name: String,
    code: String,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database at {}", database_url);

        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Self::run_migrations(&conn)?;

        info!("Database connected successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        debug!("Running database migrations...");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS countries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                code TEXT NOT NULL UNIQUE,
                servers_available INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS cities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                country_id INTEGER NOT NULL REFERENCES countries(id),
                name TEXT NOT NULL,
                servers_available INTEGER NOT NULL DEFAULT 0,
                UNIQUE (country_id, name)
            );

            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                country_id INTEGER NOT NULL REFERENCES countries(id),
                city_id INTEGER NOT NULL REFERENCES cities(id),
                name TEXT NOT NULL,
                address TEXT NOT NULL UNIQUE,
                protocols TEXT NOT NULL DEFAULT '[]',
                configuration TEXT NOT NULL,
                current_load REAL NOT NULL DEFAULT 0,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                is_banned BOOLEAN NOT NULL DEFAULT 0,
                is_included_in_plan BOOLEAN NOT NULL DEFAULT 0,
                revision INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_servers_city ON servers(country_id, city_id);
            CREATE INDEX IF NOT EXISTS idx_servers_revision ON servers(revision);

            CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                platform TEXT NOT NULL,
                token TEXT NOT NULL UNIQUE,
                wallet_address TEXT NOT NULL UNIQUE,
                wallet_entropy BLOB NOT NULL,
                is_banned BOOLEAN NOT NULL DEFAULT 0,
                subscription_id INTEGER,
                is_fee_granted BOOLEAN NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_devices_fee_granted ON devices(is_fee_granted);

            CREATE TABLE IF NOT EXISTS plan_subscriptions (
                id INTEGER PRIMARY KEY,
                inactive_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS node_subscriptions (
                id INTEGER PRIMARY KEY,
                node_address TEXT NOT NULL,
                inactive_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_node_subscriptions_address
                ON node_subscriptions(node_address, inactive_at);
            "#,
        )?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Get the database connection
    pub fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Check that the store answers queries
    pub async fn ping(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
        anyhow::ensure!(one == 1, "unexpected SELECT 1 result: {}", one);
        Ok(())
    }

    /// Seed the countries table from a JSON list of `{name, code}` records.
    ///
    /// Does nothing when the table already has rows. Returns the number of
    /// countries inserted.
    pub async fn populate_countries(&self, path: &Path) -> anyhow::Result<usize> {
        let conn = self.conn.clone();
        let mut conn = conn.lock().await;

        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM countries", [], |row| row.get(0))?;
        if existing > 0 {
            debug!("Countries already populated ({} rows), skipping seed", existing);
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading country seed file {}", path.display()))?;
        let seeds: Vec<CountrySeed> = serde_json::from_str(&content)
            .with_context(|| format!("parsing country seed file {}", path.display()))?;

        let tx = conn.transaction()?;
        for seed in &seeds {
            tx.execute(
                "INSERT OR IGNORE INTO countries (name, code) VALUES (?1, ?2)",
                rusqlite::params![seed.name, seed.code],
            )?;
        }
        tx.commit()?;

        info!("DB: Seeded {} countries", seeds.len());
        Ok(seeds.len())
    }

    /// Close the database connection
    pub async fn close(&self) {
        info!("Closing database connection...");
        // The connection is closed when the last Arc is dropped
        info!("Database connection closed");
    }
}

/// Server upsert fixture for tests
#[cfg(test)]
pub(crate) fn test_server(
    country_id: i64,
    city_id: i64,
    address: &str,
    hourly_price: i64,
    revision: i64,
) -> ServerUpsert {
    ServerUpsert {
        country_id,
        city_id,
        name: format!("node-{}", address),
        protocols: vec![ServerProtocol::WireGuard],
        configuration: ServerConfiguration {
            address: address.to_string(),
            remote_url: format!("https://{}.example:8585", address),
            location: Location {
                latitude: 52.52,
                longitude: 13.40,
                city: "Berlin".into(),
                country: "Germany".into(),
            },
            hourly_prices: vec![Coin {
                denom: "udvpn".into(),
                amount: hourly_price,
            }],
            version: "0.7.1".into(),
            ..Default::default()
        },
        current_load: 0.0,
        is_included_in_plan: false,
        revision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_database_connect() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_populate_countries_once() {
        let db = Database::connect("sqlite::memory:").await.unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name": "Germany", "code": "DE"}}, {{"name": "Japan", "code": "JP"}}]"#
        )
        .unwrap();

        assert_eq!(db.populate_countries(file.path()).await.unwrap(), 2);
        assert_eq!(db.populate_countries(file.path()).await.unwrap(), 0);

        let germany = CountryQueries::new(&db).get_by_name("Germany").await.unwrap().unwrap();
        assert_eq!(germany.code, "DE");
        assert_eq!(germany.servers_available, 0);
    }

    #[tokio::test]
    async fn test_bundled_country_seed() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let seed = Path::new(env!("CARGO_MANIFEST_DIR")).join("countries.json");

        assert!(db.populate_countries(&seed).await.unwrap() > 50);
        let us = CountryQueries::new(&db).get_by_name("United States").await.unwrap().unwrap();
        assert_eq!(us.code, "US");
    }
}
