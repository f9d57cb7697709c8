//! Catalog browsing and credential endpoints

use super::{parse_id, ApiState, AuthResolver};
use crate::{
    db::{
        CityModel, CityQueries, CountryModel, CountryQueries, ServerListFilter, ServerModel,
        ServerProtocol, ServerQueries, ServerSort,
    },
    vpn::IssuedCredentials,
    DvpnError, DvpnResult,
};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Default page size of the server listing
const DEFAULT_SERVER_LIMIT: u32 = 100;

/// Public view of a catalog server
#[derive(Debug, Serialize, PartialEq)]
pub struct ServerView {
    /// Server ID
    pub id: i64,
    /// Country ID
    pub country_id: i64,
    /// City ID
    pub city_id: i64,
    /// Display name
    pub name: String,
    /// Node address
    pub address: String,
    /// Whether the node answered the last sync
    pub is_available: bool,
    /// Load in [0, 1]
    pub load: f64,
    /// Node software version
    pub version: String,
    /// Latitude
    pub latitude: f64,
    /// Longitude
    pub longitude: f64,
    /// Upload bandwidth
    pub upload_speed: i64,
    /// Download bandwidth
    pub download_speed: i64,
    /// Node endpoint
    pub remote_url: String,
    /// Primary protocol
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ServerProtocol>,
}

impl From<ServerModel> for ServerView {
    fn from(server: ServerModel) -> Self {
        let protocol = server.protocols.first().copied();
        let config = server.configuration;
        Self {
            id: server.id,
            country_id: server.country_id,
            city_id: server.city_id,
            name: server.name,
            address: config.address,
            is_available: server.is_active,
            load: server.current_load,
            version: config.version,
            latitude: config.location.latitude,
            longitude: config.location.longitude,
            upload_speed: config.bandwidth.upload,
            download_speed: config.bandwidth.download,
            remote_url: config.remote_url,
            protocol,
        }
    }
}

/// Server listing query parameters
#[derive(Debug, Default, Deserialize)]
pub struct ServerListParams {
    /// `CURRENT_LOAD` sorts by load; default is newest first
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    /// Rows to skip
    pub offset: Option<u32>,
    /// Maximum rows
    pub limit: Option<u32>,
    /// `WIREGUARD`, `V2RAY` or `ALL`
    pub protocol: Option<String>,
}

impl ServerListParams {
    fn to_filter(&self) -> DvpnResult<ServerListFilter> {
        let sort = match self.sort_by.as_deref() {
            None | Some("") => ServerSort::Newest,
            Some("CURRENT_LOAD") => ServerSort::CurrentLoad,
            Some(other) => return Err(DvpnError::Validation(format!("invalid sortBy: {}", other))),
        };

        let protocol = match self.protocol.as_deref() {
            None | Some("") | Some("ALL") => None,
            Some(other) => Some(parse_protocol(other)?),
        };

        Ok(ServerListFilter {
            protocol,
            sort,
            offset: self.offset.unwrap_or(0),
            limit: self.limit.unwrap_or(DEFAULT_SERVER_LIMIT),
        })
    }
}

fn parse_protocol(value: &str) -> DvpnResult<ServerProtocol> {
    value
        .parse()
        .map_err(|e: String| DvpnError::Validation(format!("invalid protocol: {}", e)))
}

/// Countries with at least one available server
pub async fn list_countries(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let result = countries(&state, &headers).await;
    state.respond(result)
}

async fn countries(state: &ApiState, headers: &HeaderMap) -> DvpnResult<Vec<CountryModel>> {
    AuthResolver::new(&state.app.db).current_device(headers).await?;
    Ok(CountryQueries::new(&state.app.db).list_available().await?)
}

/// Cities of a country with at least one available server
pub async fn list_cities(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(country_id): Path<String>,
) -> Response {
    let result = cities(&state, &headers, &country_id).await;
    state.respond(result)
}

async fn cities(state: &ApiState, headers: &HeaderMap, country_id: &str) -> DvpnResult<Vec<CityModel>> {
    AuthResolver::new(&state.app.db).current_device(headers).await?;
    let country_id = parse_id("country id", country_id)?;
    Ok(CityQueries::new(&state.app.db).list_available(country_id).await?)
}

/// Active servers of a city
pub async fn list_servers(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((country_id, city_id)): Path<(String, String)>,
    Query(params): Query<ServerListParams>,
) -> Response {
    let result = servers(&state, &headers, &country_id, &city_id, &params).await;
    state.respond(result)
}

async fn servers(
    state: &ApiState,
    headers: &HeaderMap,
    country_id: &str,
    city_id: &str,
    params: &ServerListParams,
) -> DvpnResult<Vec<ServerView>> {
    AuthResolver::new(&state.app.db).current_device(headers).await?;
    let country_id = parse_id("country id", country_id)?;
    let city_id = parse_id("city id", city_id)?;
    let filter = params.to_filter()?;

    let servers = ServerQueries::new(&state.app.db)
        .list_in_city(country_id, city_id, &filter)
        .await?;
    Ok(servers.into_iter().map(ServerView::from).collect())
}

/// Credentials for the best server of a city
pub async fn connect_to_city(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((country_id, city_id)): Path<(String, String)>,
) -> Response {
    let result = connect_city(&state, &headers, &country_id, &city_id, None).await;
    state.respond(result)
}

/// Credentials for the best server of a city speaking `protocol`
pub async fn connect_to_city_with_protocol(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((country_id, city_id, protocol)): Path<(String, String, String)>,
) -> Response {
    let result = connect_city(&state, &headers, &country_id, &city_id, Some(protocol.as_str())).await;
    state.respond(result)
}

async fn connect_city(
    state: &ApiState,
    headers: &HeaderMap,
    country_id: &str,
    city_id: &str,
    protocol: Option<&str>,
) -> DvpnResult<IssuedCredentials> {
    let device = AuthResolver::new(&state.app.db).current_device(headers).await?;
    let country_id = parse_id("country id", country_id)?;
    let city_id = parse_id("city id", city_id)?;
    let protocol = protocol.map(parse_protocol).transpose()?;

    let max_load = state.app.config.catalog.max_server_load;
    let server = ServerQueries::new(&state.app.db)
        .find_for_city(country_id, city_id, protocol, max_load)
        .await?
        .ok_or_else(|| {
            DvpnError::NotFound(format!(
                "no server available in city {} of country {}",
                city_id, country_id
            ))
        })?;

    info!("API: Device {} connecting to city {} via server {}", device.id, city_id, server.id);
    state.app.vpn.credentials.issue(&device, &server, protocol).await
}

/// Credentials for one specific server
pub async fn connect_to_server(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((country_id, city_id, server_id)): Path<(String, String, String)>,
) -> Response {
    let result = connect_server(&state, &headers, &country_id, &city_id, &server_id).await;
    state.respond(result)
}

async fn connect_server(
    state: &ApiState,
    headers: &HeaderMap,
    country_id: &str,
    city_id: &str,
    server_id: &str,
) -> DvpnResult<IssuedCredentials> {
    let device = AuthResolver::new(&state.app.db).current_device(headers).await?;
    let country_id = parse_id("country id", country_id)?;
    let city_id = parse_id("city id", city_id)?;
    let server_id = parse_id("server id", server_id)?;

    let server = ServerQueries::new(&state.app.db)
        .get_in_city(country_id, city_id, server_id)
        .await?
        .ok_or_else(|| DvpnError::NotFound(format!("server {} not found", server_id)))?;

    info!("API: Device {} connecting to server {}", device.id, server.id);
    state.app.vpn.credentials.issue(&device, &server, None).await
}
