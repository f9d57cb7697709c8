//! Database queries

use super::{
    CityModel, CountryModel, Database, DeviceModel, DevicePlatform, NewDevice,
    NodeSubscriptionModel, PlanSubscriptionModel, ServerModel,
    ServerProtocol, ServerUpsert,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row};
use tracing::{debug, info};

const SERVER_COLUMNS: &str = "id, country_id, city_id, name, protocols, configuration, current_load, \
     is_active, is_banned, is_included_in_plan, revision, created_at";

const DEVICE_COLUMNS: &str = "id, platform, token, wallet_address, wallet_entropy, is_banned, \
     subscription_id, is_fee_granted, created_at";

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<ServerModel> {
    Ok(ServerModel {
        id: row.get(0)?,
        country_id: row.get(1)?,
        city_id: row.get(2)?,
        name: row.get(3)?,
        protocols: json_column(row, 4)?,
        configuration: json_column(row, 5)?,
        current_load: row.get(6)?,
        is_active: row.get(7)?,
        is_banned: row.get(8)?,
        is_included_in_plan: row.get(9)?,
        revision: row.get(10)?,
        created_at: timestamp(row.get(11)?),
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceModel> {
    let platform: String = row.get(1)?;
    Ok(DeviceModel {
        id: row.get(0)?,
        platform: platform.parse::<DevicePlatform>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, Type::Text, e.into())
        })?,
        token: row.get(2)?,
        wallet_address: row.get(3)?,
        wallet_entropy: row.get(4)?,
        is_banned: row.get(5)?,
        subscription_id: row.get(6)?,
        is_fee_granted: row.get(7)?,
        created_at: timestamp(row.get(8)?),
    })
}

fn country_from_row(row: &Row<'_>) -> rusqlite::Result<CountryModel> {
    Ok(CountryModel {
        id: row.get(0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        servers_available: row.get(3)?,
    })
}

fn city_from_row(row: &Row<'_>) -> rusqlite::Result<CityModel> {
    Ok(CityModel {
        id: row.get(0)?,
        country_id: row.get(1)?,
        name: row.get(2)?,
        servers_available: row.get(3)?,
    })
}

/// Country queries
pub struct CountryQueries<'a> {
    db: &'a Database,
}

impl<'a> CountryQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a country
    pub async fn insert(&self, name: &str, code: &str) -> Result<CountryModel> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO countries (name, code) VALUES (?1, ?2)",
            rusqlite::params![name, code],
        )?;
        Ok(CountryModel {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            code: code.to_string(),
            servers_available: 0,
        })
    }

    /// Find a country by its node-reported name
    pub async fn get_by_name(&self, name: &str) -> Result<Option<CountryModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let country = conn
            .query_row(
                "SELECT id, name, code, servers_available FROM countries WHERE name = ?1",
                [name],
                country_from_row,
            )
            .optional()?;
        Ok(country)
    }

    /// Get a country by ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<CountryModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let country = conn
            .query_row(
                "SELECT id, name, code, servers_available FROM countries WHERE id = ?1",
                [id],
                country_from_row,
            )
            .optional()?;
        Ok(country)
    }

    /// Countries with at least one available server, by name
    pub async fn list_available(&self) -> Result<Vec<CountryModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, code, servers_available FROM countries \
             WHERE servers_available > 0 ORDER BY name",
        )?;
        let countries = stmt
            .query_map([], country_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(countries)
    }
}

/// City queries
pub struct CityQueries<'a> {
    db: &'a Database,
}

impl<'a> CityQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Get or create a city inside a country
    pub async fn get_or_create(&self, country_id: i64, name: &str) -> Result<CityModel> {
        let conn = self.db.conn();
        let conn = conn.lock().await;

        let existing = conn
            .query_row(
                "SELECT id, country_id, name, servers_available FROM cities \
                 WHERE country_id = ?1 AND name = ?2",
                rusqlite::params![country_id, name],
                city_from_row,
            )
            .optional()?;

        if let Some(city) = existing {
            return Ok(city);
        }

        conn.execute(
            "INSERT INTO cities (country_id, name) VALUES (?1, ?2)",
            rusqlite::params![country_id, name],
        )?;

        info!("DB: Created city: country_id={}, name={}", country_id, name);

        Ok(CityModel {
            id: conn.last_insert_rowid(),
            country_id,
            name: name.to_string(),
            servers_available: 0,
        })
    }

    /// Get a city by ID within a country
    pub async fn get(&self, country_id: i64, city_id: i64) -> Result<Option<CityModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let city = conn
            .query_row(
                "SELECT id, country_id, name, servers_available FROM cities \
                 WHERE country_id = ?1 AND id = ?2",
                [country_id, city_id],
                city_from_row,
            )
            .optional()?;
        Ok(city)
    }

    /// Cities of a country with at least one available server, by name
    pub async fn list_available(&self, country_id: i64) -> Result<Vec<CityModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, country_id, name, servers_available FROM cities \
             WHERE country_id = ?1 AND servers_available > 0 ORDER BY name",
        )?;
        let cities = stmt
            .query_map([country_id], city_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cities)
    }
}

/// Ordering for server listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerSort {
    /// Newest first
    #[default]
    Newest,
    /// Least loaded first
    CurrentLoad,
}

/// Filter for listing the servers of a city
#[derive(Debug, Clone, Default)]
pub struct ServerListFilter {
    /// Only servers speaking this protocol
    pub protocol: Option<ServerProtocol>,
    /// Ordering
    pub sort: ServerSort,
    /// Rows to skip
    pub offset: u32,
    /// Maximum rows
    pub limit: u32,
}

/// Server queries
pub struct ServerQueries<'a> {
    db: &'a Database,
}

impl<'a> ServerQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Get a server by ledger address
    pub async fn get_by_address(&self, address: &str) -> Result<Option<ServerModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let server = conn
            .query_row(
                &format!("SELECT {} FROM servers WHERE address = ?1", SERVER_COLUMNS),
                [address],
                server_from_row,
            )
            .optional()?;
        Ok(server)
    }

    /// Get a server by ID within a city
    pub async fn get_in_city(
        &self,
        country_id: i64,
        city_id: i64,
        server_id: i64,
    ) -> Result<Option<ServerModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let server = conn
            .query_row(
                &format!(
                    "SELECT {} FROM servers WHERE country_id = ?1 AND city_id = ?2 AND id = ?3",
                    SERVER_COLUMNS
                ),
                [country_id, city_id, server_id],
                server_from_row,
            )
            .optional()?;
        Ok(server)
    }

    /// Insert or update a server observed by a sync pass.
    ///
    /// Marks it active; the ban flag and creation time of an existing row are kept.
    pub async fn upsert(&self, server: &ServerUpsert) -> Result<i64> {
        let protocols = serde_json::to_string(&server.protocols)?;
        let configuration = serde_json::to_string(&server.configuration)?;

        let conn = self.db.conn();
        let conn = conn.lock().await;
        let id: i64 = conn.query_row(
            r#"
            INSERT INTO servers (country_id, city_id, name, address, protocols, configuration,
                                 current_load, is_active, is_included_in_plan, revision, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10)
            ON CONFLICT(address) DO UPDATE SET
                country_id = excluded.country_id,
                city_id = excluded.city_id,
                name = excluded.name,
                protocols = excluded.protocols,
                configuration = excluded.configuration,
                current_load = excluded.current_load,
                is_active = 1,
                is_included_in_plan = excluded.is_included_in_plan,
                revision = excluded.revision
            RETURNING id
            "#,
            rusqlite::params![
                server.country_id,
                server.city_id,
                server.name,
                server.configuration.address,
                protocols,
                configuration,
                server.current_load,
                server.is_included_in_plan,
                server.revision,
                Utc::now().timestamp(),
            ],
            |row| row.get(0),
        )?;

        debug!(
            "DB: Upserted server: id={}, address={}, load={:.2}, revision={}",
            id, server.configuration.address, server.current_load, server.revision
        );
        Ok(id)
    }

    /// Deactivate every server not stamped with `revision`. Returns rows changed.
    pub async fn deactivate_stale(&self, revision: i64) -> Result<usize> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let changed = conn.execute(
            "UPDATE servers SET is_active = 0 WHERE revision != ?1 AND is_active = 1",
            [revision],
        )?;
        info!("DB: Deactivated {} stale servers (revision != {})", changed, revision);
        Ok(changed)
    }

    /// Newest connectable server in a city below `max_load`
    pub async fn find_for_city(
        &self,
        country_id: i64,
        city_id: i64,
        protocol: Option<ServerProtocol>,
        max_load: f64,
    ) -> Result<Option<ServerModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let server = conn
            .query_row(
                &format!(
                    "SELECT {} FROM servers \
                     WHERE country_id = ?1 AND city_id = ?2 AND current_load < ?3 \
                       AND is_active = 1 AND is_banned = 0 AND is_included_in_plan = 1 \
                       AND (?4 IS NULL OR EXISTS ( \
                           SELECT 1 FROM json_each(servers.protocols) WHERE json_each.value = ?4)) \
                     ORDER BY id DESC LIMIT 1",
                    SERVER_COLUMNS
                ),
                rusqlite::params![country_id, city_id, max_load, protocol.map(|p| p.as_str())],
                server_from_row,
            )
            .optional()?;
        Ok(server)
    }

    /// Active servers of a city
    pub async fn list_in_city(
        &self,
        country_id: i64,
        city_id: i64,
        filter: &ServerListFilter,
    ) -> Result<Vec<ServerModel>> {
        let order = match filter.sort {
            ServerSort::Newest => "id DESC",
            ServerSort::CurrentLoad => "current_load ASC, id DESC",
        };

        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM servers \
             WHERE country_id = ?1 AND city_id = ?2 AND is_active = 1 \
               AND (?3 IS NULL OR EXISTS ( \
                   SELECT 1 FROM json_each(servers.protocols) WHERE json_each.value = ?3)) \
             ORDER BY {} LIMIT ?4 OFFSET ?5",
            SERVER_COLUMNS, order
        ))?;
        let servers = stmt
            .query_map(
                rusqlite::params![
                    country_id,
                    city_id,
                    filter.protocol.map(|p| p.as_str()),
                    filter.limit,
                    filter.offset,
                ],
                server_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(servers)
    }

    /// Active, non-banned servers not yet in the plan, oldest first
    pub async fn select_admission_candidates(&self) -> Result<Vec<ServerModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM servers \
             WHERE is_included_in_plan = 0 AND is_banned = 0 AND is_active = 1 ORDER BY id",
            SERVER_COLUMNS
        ))?;
        let servers = stmt
            .query_map([], server_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(servers)
    }

    /// Servers currently flagged as plan members
    pub async fn select_plan_included(&self) -> Result<Vec<ServerModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM servers WHERE is_included_in_plan = 1 ORDER BY id",
            SERVER_COLUMNS
        ))?;
        let servers = stmt
            .query_map([], server_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(servers)
    }

    /// Set the plan membership flag on a set of servers in one transaction
    pub async fn set_included_in_plan(&self, ids: &[i64], included: bool) -> Result<()> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE servers SET is_included_in_plan = ?1 WHERE id = ?2",
                rusqlite::params![included, id],
            )?;
        }
        tx.commit()?;
        info!("DB: Set is_included_in_plan={} on {} servers", included, ids.len());
        Ok(())
    }

    /// Ban or unban a server
    pub async fn set_banned(&self, id: i64, banned: bool) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE servers SET is_banned = ?1 WHERE id = ?2",
            rusqlite::params![banned, id],
        )?;
        info!("DB: Set is_banned={} on server {}", banned, id);
        Ok(())
    }
}

/// Device queries
pub struct DeviceQueries<'a> {
    db: &'a Database,
}

impl<'a> DeviceQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Register a device
    pub async fn insert(&self, device: &NewDevice) -> Result<DeviceModel> {
        let created_at = Utc::now().timestamp();
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO devices (platform, token, wallet_address, wallet_entropy, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                device.platform.as_str(),
                device.token,
                device.wallet_address,
                device.wallet_entropy,
                created_at,
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!("DB: Registered device: id={}, wallet={}", id, device.wallet_address);

        Ok(DeviceModel {
            id,
            platform: device.platform,
            token: device.token.clone(),
            wallet_address: device.wallet_address.clone(),
            wallet_entropy: device.wallet_entropy.clone(),
            is_banned: false,
            subscription_id: None,
            is_fee_granted: false,
            created_at: timestamp(created_at),
        })
    }

    /// Get a device by bearer token
    pub async fn get_by_token(&self, token: &str) -> Result<Option<DeviceModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE token = ?1", DEVICE_COLUMNS),
                [token],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    /// Get a device by ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<DeviceModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
                [id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    /// Devices still waiting for a fee grant
    pub async fn select_not_fee_granted(&self, limit: u32) -> Result<Vec<DeviceModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices WHERE is_fee_granted = 0 ORDER BY id LIMIT ?1",
            DEVICE_COLUMNS
        ))?;
        let devices = stmt
            .query_map([limit], device_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(devices)
    }

    /// Devices not enrolled against the given plan subscription
    pub async fn select_not_enrolled(&self, subscription_id: i64, limit: u32) -> Result<Vec<DeviceModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices WHERE subscription_id IS NOT ?1 ORDER BY id LIMIT ?2",
            DEVICE_COLUMNS
        ))?;
        let devices = stmt
            .query_map(rusqlite::params![subscription_id, limit], device_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(devices)
    }

    /// Mark a set of devices fee-granted in one transaction
    pub async fn mark_fee_granted(&self, ids: &[i64]) -> Result<()> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute("UPDATE devices SET is_fee_granted = 1 WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        info!("DB: Marked {} devices fee-granted", ids.len());
        Ok(())
    }

    /// Mark the devices owning any of these wallets fee-granted. Returns rows changed.
    pub async fn mark_fee_granted_by_wallets(&self, wallets: &[String]) -> Result<usize> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;
        let mut changed = 0;
        for wallet in wallets {
            changed += tx.execute(
                "UPDATE devices SET is_fee_granted = 1 WHERE wallet_address = ?1 AND is_fee_granted = 0",
                [wallet],
            )?;
        }
        tx.commit()?;
        if changed > 0 {
            info!("DB: Marked {} devices fee-granted from ledger allowances", changed);
        }
        Ok(changed)
    }

    /// Stamp a set of devices with a plan subscription in one transaction
    pub async fn set_subscription(&self, ids: &[i64], subscription_id: i64) -> Result<()> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE devices SET subscription_id = ?1 WHERE id = ?2",
                [subscription_id, *id],
            )?;
        }
        tx.commit()?;
        info!(
            "DB: Enrolled {} devices in plan subscription {}",
            ids.len(),
            subscription_id
        );
        Ok(())
    }

    /// Ban or unban a device
    pub async fn set_banned(&self, id: i64, banned: bool) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE devices SET is_banned = ?1 WHERE id = ?2",
            rusqlite::params![banned, id],
        )?;
        Ok(())
    }
}

/// Plan and node subscription queries
pub struct SubscriptionQueries<'a> {
    db: &'a Database,
}

impl<'a> SubscriptionQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Newest plan subscription still active after `after`
    pub async fn current_plan(&self, after: DateTime<Utc>) -> Result<Option<PlanSubscriptionModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let subscription = conn
            .query_row(
                "SELECT id, inactive_at FROM plan_subscriptions \
                 WHERE inactive_at > ?1 ORDER BY id DESC LIMIT 1",
                [after.timestamp()],
                |row| {
                    Ok(PlanSubscriptionModel {
                        id: row.get(0)?,
                        inactive_at: timestamp(row.get(1)?),
                    })
                },
            )
            .optional()?;
        Ok(subscription)
    }

    /// Record a plan subscription
    pub async fn insert_plan(&self, subscription: &PlanSubscriptionModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO plan_subscriptions (id, inactive_at) VALUES (?1, ?2)",
            [subscription.id, subscription.inactive_at.timestamp()],
        )?;
        info!(
            "DB: Stored plan subscription: id={}, inactive_at={}",
            subscription.id, subscription.inactive_at
        );
        Ok(())
    }

    /// Newest node subscription for `node_address` still active after `now`
    pub async fn live_node_subscription(
        &self,
        node_address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<NodeSubscriptionModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let subscription = conn
            .query_row(
                "SELECT id, node_address, inactive_at FROM node_subscriptions \
                 WHERE node_address = ?1 AND inactive_at > ?2 ORDER BY id DESC LIMIT 1",
                rusqlite::params![node_address, now.timestamp()],
                |row| {
                    Ok(NodeSubscriptionModel {
                        id: row.get(0)?,
                        node_address: row.get(1)?,
                        inactive_at: timestamp(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(subscription)
    }

    /// Record a node subscription
    pub async fn insert_node(&self, subscription: &NodeSubscriptionModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO node_subscriptions (id, node_address, inactive_at) \
             VALUES (?1, ?2, ?3)",
            rusqlite::params![
                subscription.id,
                subscription.node_address,
                subscription.inactive_at.timestamp(),
            ],
        )?;
        info!(
            "DB: Stored node subscription: id={}, node={}, inactive_at={}",
            subscription.id, subscription.node_address, subscription.inactive_at
        );
        Ok(())
    }
}

/// `servers_available` aggregate maintenance
pub struct AvailabilityQueries<'a> {
    db: &'a Database,
}

impl<'a> AvailabilityQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Recount available servers for every city and country
    pub async fn recompute(&self) -> Result<()> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            UPDATE cities SET servers_available = (
                SELECT COUNT(*) FROM servers
                WHERE servers.city_id = cities.id
                  AND servers.is_active = 1
                  AND servers.is_included_in_plan = 1
                  AND servers.is_banned = 0
            )
            "#,
            [],
        )?;
        tx.execute(
            r#"
            UPDATE countries SET servers_available = (
                SELECT COUNT(*) FROM servers
                WHERE servers.country_id = countries.id
                  AND servers.is_active = 1
                  AND servers.is_included_in_plan = 1
                  AND servers.is_banned = 0
            )
            "#,
            [],
        )?;
        tx.commit()?;
        debug!("DB: Recomputed servers_available aggregates");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_server;

    async fn seeded_db() -> (Database, CountryModel, CityModel) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let germany = CountryQueries::new(&db).insert("Germany", "DE").await.unwrap();
        let berlin = CityQueries::new(&db)
            .get_or_create(germany.id, "Berlin")
            .await
            .unwrap();
        (db, germany, berlin)
    }

    #[tokio::test]
    async fn test_city_get_or_create_is_stable() {
        let (db, germany, berlin) = seeded_db().await;
        let again = CityQueries::new(&db)
            .get_or_create(germany.id, "Berlin")
            .await
            .unwrap();
        assert_eq!(again.id, berlin.id);
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_address() {
        let (db, germany, berlin) = seeded_db().await;
        let servers = ServerQueries::new(&db);

        let first = servers
            .upsert(&test_server(germany.id, berlin.id, "sentnode1a", 80, 100))
            .await
            .unwrap();
        servers.set_banned(first, true).await.unwrap();

        let mut update = test_server(germany.id, berlin.id, "sentnode1a", 90, 200);
        update.current_load = 0.25;
        let second = servers.upsert(&update).await.unwrap();
        assert_eq!(first, second);

        let stored = servers.get_by_address("sentnode1a").await.unwrap().unwrap();
        assert_eq!(stored.revision, 200);
        assert_eq!(stored.current_load, 0.25);
        assert_eq!(stored.configuration.hourly_price("udvpn"), Some(90));
        // Operator ban survives a resync
        assert!(stored.is_banned);
    }

    #[tokio::test]
    async fn test_deactivate_stale() {
        let (db, germany, berlin) = seeded_db().await;
        let servers = ServerQueries::new(&db);
        servers.upsert(&test_server(germany.id, berlin.id, "old", 80, 100)).await.unwrap();
        servers.upsert(&test_server(germany.id, berlin.id, "new", 80, 200)).await.unwrap();

        assert_eq!(servers.deactivate_stale(200).await.unwrap(), 1);
        assert!(!servers.get_by_address("old").await.unwrap().unwrap().is_active);
        assert!(servers.get_by_address("new").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_find_for_city_respects_protocol_and_load() {
        let (db, germany, berlin) = seeded_db().await;
        let servers = ServerQueries::new(&db);

        let mut wg = test_server(germany.id, berlin.id, "wg", 80, 1);
        wg.current_load = 0.2;
        let wg_id = servers.upsert(&wg).await.unwrap();

        let mut busy = test_server(germany.id, berlin.id, "busy", 80, 1);
        busy.protocols = vec![ServerProtocol::V2Ray];
        busy.current_load = 0.95;
        let busy_id = servers.upsert(&busy).await.unwrap();

        servers.set_included_in_plan(&[wg_id, busy_id], true).await.unwrap();

        let found = servers
            .find_for_city(germany.id, berlin.id, None, 0.9)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.address(), "wg");

        let v2ray = servers
            .find_for_city(germany.id, berlin.id, Some(ServerProtocol::V2Ray), 0.9)
            .await
            .unwrap();
        assert!(v2ray.is_none());
    }

    #[tokio::test]
    async fn test_list_in_city_sorted_by_load() {
        let (db, germany, berlin) = seeded_db().await;
        let servers = ServerQueries::new(&db);
        for (address, load) in [("a", 0.7), ("b", 0.1), ("c", 0.4)] {
            let mut server = test_server(germany.id, berlin.id, address, 80, 1);
            server.current_load = load;
            servers.upsert(&server).await.unwrap();
        }

        let filter = ServerListFilter {
            sort: ServerSort::CurrentLoad,
            limit: 2,
            ..Default::default()
        };
        let listed = servers.list_in_city(germany.id, berlin.id, &filter).await.unwrap();
        let addresses: Vec<_> = listed.iter().map(|s| s.address().to_string()).collect();
        assert_eq!(addresses, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_device_selection_predicates() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let devices = DeviceQueries::new(&db);
        let mut ids = Vec::new();
        for i in 0..3 {
            let device = devices
                .insert(&NewDevice {
                    platform: DevicePlatform::Android,
                    token: format!("token-{}", i),
                    wallet_address: format!("sent1wallet{}", i),
                    wallet_entropy: vec![i as u8; 16],
                })
                .await
                .unwrap();
            ids.push(device.id);
        }

        devices.set_subscription(&ids[..1], 7).await.unwrap();
        let pending = devices.select_not_enrolled(7, 10).await.unwrap();
        assert_eq!(pending.iter().map(|d| d.id).collect::<Vec<_>>(), ids[1..].to_vec());

        let changed = devices
            .mark_fee_granted_by_wallets(&["sent1wallet2".to_string(), "sent1unknown".to_string()])
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(devices.select_not_fee_granted(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_availability_recompute() {
        let (db, germany, berlin) = seeded_db().await;
        let servers = ServerQueries::new(&db);
        let a = servers.upsert(&test_server(germany.id, berlin.id, "a", 80, 1)).await.unwrap();
        let b = servers.upsert(&test_server(germany.id, berlin.id, "b", 80, 1)).await.unwrap();
        servers.upsert(&test_server(germany.id, berlin.id, "c", 80, 1)).await.unwrap();
        servers.set_included_in_plan(&[a, b], true).await.unwrap();
        servers.set_banned(b, true).await.unwrap();

        AvailabilityQueries::new(&db).recompute().await.unwrap();

        let city = CityQueries::new(&db).get(germany.id, berlin.id).await.unwrap().unwrap();
        let country = CountryQueries::new(&db).get_by_id(germany.id).await.unwrap().unwrap();
        assert_eq!(city.servers_available, 1);
        assert_eq!(country.servers_available, 1);
    }

    #[tokio::test]
    async fn test_subscription_lookups() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let subscriptions = SubscriptionQueries::new(&db);
        let now = Utc::now();

        subscriptions
            .insert_node(&NodeSubscriptionModel {
                id: 11,
                node_address: "sentnode1a".into(),
                inactive_at: now - chrono::Duration::hours(1),
            })
            .await
            .unwrap();
        assert!(subscriptions.live_node_subscription("sentnode1a", now).await.unwrap().is_none());

        subscriptions
            .insert_node(&NodeSubscriptionModel {
                id: 12,
                node_address: "sentnode1a".into(),
                inactive_at: now + chrono::Duration::hours(720),
            })
            .await
            .unwrap();
        let live = subscriptions.live_node_subscription("sentnode1a", now).await.unwrap().unwrap();
        assert_eq!(live.id, 12);

        subscriptions
            .insert_plan(&PlanSubscriptionModel {
                id: 5,
                inactive_at: now + chrono::Duration::hours(12),
            })
            .await
            .unwrap();
        // Inside the renewal window: not current
        assert!(subscriptions
            .current_plan(now + chrono::Duration::hours(24))
            .await
            .unwrap()
            .is_none());
        assert_eq!(subscriptions.current_plan(now).await.unwrap().unwrap().id, 5);
    }
}
