use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use sf_core::ports::{MarketData, MarketQuote, PricePoint, PurchaseOutcome, SellOutcome, ShipOperations};
use sf_domain::{Cargo, Coordinate, FlightMode, Inventory, Market, MarketTradeGood, ShipSnapshot, ShipSymbol, SystemSymbol, TradeGoodSymbol, WaypointSymbol};
use tracing::{event, Level};

#[derive(Deserialize, Debug)]
struct Data<T> {
    data: T,
}

#[derive(Deserialize, Debug)]
struct Paged<T> {
    data: Vec<T>,
    meta: PageMeta,
}

#[derive(Deserialize, Debug)]
struct PageMeta {
    total: u32,
    page: u32,
    limit: u32,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiShip {
    symbol: String,
    nav: ApiNav,
    fuel: ApiFuel,
    cargo: ApiCargo,
    engine: ApiEngine,
    registration: ApiRegistration,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiNav {
    waypoint_symbol: String,
    status: String,
    route: ApiRoute,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiRoute {
    arrival: DateTime<Utc>,
}

#[derive(Deserialize, Debug)]
struct ApiFuel {
    current: u32,
    capacity: u32,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiCargo {
    capacity: u32,
    units: u32,
    inventory: Vec<ApiInventory>,
}

#[derive(Deserialize, Debug)]
struct ApiInventory {
    symbol: String,
    units: u32,
}

#[derive(Deserialize, Debug)]
struct ApiEngine {
    speed: f64,
}

#[derive(Deserialize, Debug)]
struct ApiRegistration {
    role: String,
}

impl ApiShip {
    fn into_snapshot(self) -> ShipSnapshot {
        ShipSnapshot {
            symbol: ShipSymbol(self.symbol),
            location: WaypointSymbol(self.nav.waypoint_symbol),
            is_docked: self.nav.status == "DOCKED",
            fuel_units: self.fuel.current,
            fuel_capacity: self.fuel.capacity,
            cargo: Cargo {
                capacity: self.cargo.capacity,
                units: self.cargo.units,
                inventory: self
                    .cargo
                    .inventory
                    .into_iter()
                    .map(|inv| Inventory::new(TradeGoodSymbol(inv.symbol), inv.units))
                    .collect(),
            },
            engine_speed: self.engine.speed.round() as u32,
            is_hauler: matches!(self.registration.role.as_str(), "HAULER" | "TRANSPORT" | "COMMAND"),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiNavResponse {
    nav: ApiNav,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiTradeResponse {
    transaction: ApiTransaction,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiTransaction {
    units: u32,
    price_per_unit: i64,
    total_price: i64,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiMarket {
    symbol: String,
    trade_goods: Option<Vec<MarketTradeGood>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiWaypoint {
    symbol: String,
    x: i64,
    y: i64,
    traits: Vec<ApiTrait>,
}

#[derive(Deserialize, Debug)]
struct ApiTrait {
    symbol: String,
}

/// Thin authenticated client for the upstream game API, exposing exactly
/// the two data ports the coordinator consumes. Travel time is honored by
/// sleeping until the reported arrival.
#[derive(Debug)]
pub struct GameApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl GameApiClient {
    pub fn new(base_url: impl Into<String>, agent_token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {agent_token}")).context("agent token is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.client.get(format!("{}{}", self.base_url, path)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GET {path} returned {status}: {body}"));
        }
        Ok(response.json().await?)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(&self, path: &str, body: Option<serde_json::Value>) -> Result<T> {
        let mut request = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(body) = body {
            request = request.json(&body);
        } else {
            // the API insists on a JSON content type even for empty bodies
            request = request.header("Content-Length", "0");
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("POST {path} returned {status}: {body}"));
        }
        Ok(response.json().await?)
    }

    async fn wait_for_arrival(&self, arrival: DateTime<Utc>) {
        let wait = arrival - Utc::now();
        if let Ok(wait) = wait.to_std() {
            tokio::time::sleep(wait).await;
        }
    }

    async fn marketplace_waypoints(&self, system: &SystemSymbol) -> Result<Vec<ApiWaypoint>> {
        let mut waypoints = vec![];
        let mut page = 1;
        loop {
            let response: Paged<ApiWaypoint> = self
                .get_json(&format!("/systems/{}/waypoints?traits=MARKETPLACE&page={}&limit=20", system, page))
                .await?;
            let fetched = response.meta.page * response.meta.limit;
            waypoints.extend(response.data);
            if fetched >= response.meta.total {
                return Ok(waypoints);
            }
            page += 1;
        }
    }
}

#[async_trait]
impl ShipOperations for GameApiClient {
    async fn load(&self, ship: &ShipSymbol) -> Result<ShipSnapshot> {
        let response: Data<ApiShip> = self.get_json(&format!("/my/ships/{ship}")).await?;
        Ok(response.data.into_snapshot())
    }

    async fn list_ships(&self) -> Result<Vec<ShipSnapshot>> {
        let mut ships = vec![];
        let mut page = 1;
        loop {
            let response: Paged<ApiShip> = self.get_json(&format!("/my/ships?page={page}&limit=20")).await?;
            let fetched = response.meta.page * response.meta.limit;
            ships.extend(response.data.into_iter().map(ApiShip::into_snapshot));
            if fetched >= response.meta.total {
                return Ok(ships);
            }
            page += 1;
        }
    }

    async fn navigate(&self, ship: &ShipSymbol, destination: &WaypointSymbol, flight_mode: FlightMode) -> Result<()> {
        let _: Data<serde_json::Value> = self
            .post_json(
                &format!("/my/ships/{ship}/orbit"),
                None,
            )
            .await?;
        let _: Data<serde_json::Value> = self
            .client
            .patch(format!("{}/my/ships/{}/nav", self.base_url, ship))
            .json(&serde_json::json!({ "flightMode": flight_mode.to_string() }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let response: Data<ApiNavResponse> = self
            .post_json(
                &format!("/my/ships/{ship}/navigate"),
                Some(serde_json::json!({ "waypointSymbol": destination.0 })),
            )
            .await?;

        event!(
            Level::DEBUG,
            "ship {} en route to {} (arrival {})",
            ship,
            destination,
            response.data.nav.route.arrival
        );
        self.wait_for_arrival(response.data.nav.route.arrival).await;
        Ok(())
    }

    async fn dock(&self, ship: &ShipSymbol) -> Result<()> {
        let _: Data<serde_json::Value> = self.post_json(&format!("/my/ships/{ship}/dock"), None).await?;
        Ok(())
    }

    async fn orbit(&self, ship: &ShipSymbol) -> Result<()> {
        let _: Data<serde_json::Value> = self.post_json(&format!("/my/ships/{ship}/orbit"), None).await?;
        Ok(())
    }

    async fn refuel(&self, ship: &ShipSymbol, units: Option<u32>) -> Result<()> {
        let body = units.map(|units| serde_json::json!({ "units": units }));
        let _: Data<serde_json::Value> = self.post_json(&format!("/my/ships/{ship}/refuel"), body).await?;
        Ok(())
    }

    async fn purchase_cargo(&self, ship: &ShipSymbol, good: &TradeGoodSymbol, units: u32) -> Result<PurchaseOutcome> {
        let response: Data<ApiTradeResponse> = self
            .post_json(
                &format!("/my/ships/{ship}/purchase"),
                Some(serde_json::json!({ "symbol": good.0, "units": units })),
            )
            .await?;
        Ok(PurchaseOutcome {
            units_added: response.data.transaction.units,
            total_cost: response.data.transaction.total_price,
            price_per_unit: response.data.transaction.price_per_unit,
        })
    }

    async fn sell_cargo(&self, ship: &ShipSymbol, good: &TradeGoodSymbol, units: u32) -> Result<SellOutcome> {
        let response: Data<ApiTradeResponse> = self
            .post_json(
                &format!("/my/ships/{ship}/sell"),
                Some(serde_json::json!({ "symbol": good.0, "units": units })),
            )
            .await?;
        Ok(SellOutcome {
            units_sold: response.data.transaction.units,
            total_revenue: response.data.transaction.total_price,
            price_per_unit: response.data.transaction.price_per_unit,
        })
    }

    async fn jump(&self, ship: &ShipSymbol, system: &SystemSymbol) -> Result<()> {
        let _: Data<serde_json::Value> = self
            .post_json(
                &format!("/my/ships/{ship}/jump"),
                Some(serde_json::json!({ "systemSymbol": system.0 })),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MarketData for GameApiClient {
    async fn get_market_data(&self, waypoint: &WaypointSymbol) -> Result<Market> {
        let system = waypoint.system_symbol();
        let response: Data<ApiMarket> = self.get_json(&format!("/systems/{}/waypoints/{}/market", system, waypoint)).await?;
        Ok(Market {
            symbol: WaypointSymbol(response.data.symbol),
            trade_goods: response.data.trade_goods.unwrap_or_default(),
            last_updated: Utc::now(),
        })
    }

    async fn find_best_market_buying(&self, good: &TradeGoodSymbol, system: &SystemSymbol) -> Result<Option<MarketQuote>> {
        let mut best: Option<MarketQuote> = None;
        for waypoint in self.find_all_markets_in_system(system).await? {
            let market = match self.get_market_data(&waypoint).await {
                Ok(market) => market,
                Err(err) => {
                    event!(Level::DEBUG, "skipping market {}: {err:#}", waypoint);
                    continue;
                }
            };
            let Some(entry) = market.imports().find(|tg| &tg.symbol == good) else {
                continue;
            };
            if best.as_ref().map(|b| entry.sell_price > b.price).unwrap_or(true) {
                best = Some(MarketQuote {
                    waypoint_symbol: waypoint,
                    price: entry.sell_price,
                });
            }
        }
        Ok(best)
    }

    async fn find_all_markets_in_system(&self, system: &SystemSymbol) -> Result<Vec<WaypointSymbol>> {
        Ok(self
            .marketplace_waypoints(system)
            .await?
            .into_iter()
            .filter(|wp| wp.traits.iter().any(|t| t.symbol == "MARKETPLACE"))
            .map(|wp| WaypointSymbol(wp.symbol))
            .collect())
    }

    async fn get_price_history(&self, _waypoint: &WaypointSymbol, _good: &TradeGoodSymbol, _since: DateTime<Utc>, _limit: usize) -> Result<Vec<PricePoint>> {
        // the upstream API has no history endpoint; observations live in
        // whatever market-observer process feeds the database
        Ok(vec![])
    }

    async fn waypoint_coordinate(&self, waypoint: &WaypointSymbol) -> Result<Coordinate> {
        let system = waypoint.system_symbol();
        let response: Data<ApiWaypoint> = self.get_json(&format!("/systems/{}/waypoints/{}", system, waypoint)).await?;
        Ok(Coordinate {
            x: response.data.x,
            y: response.data.y,
        })
    }
}
