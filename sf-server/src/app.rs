use crate::error::{ApiError, ApiErrorBody};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use sf_core::config::CoordinatorConfig;
use sf_core::coordinator::ManufacturingCoordinator;
use sf_core::ports::{Clock, MarketData, Router as RouterPort, ShipOperations};
use sf_core::supply_chain::PlanningStrategy;
use sf_domain::{ContainerId, ContainerMetadata, ContainerStatus, ContainerType, LogLevel, PlayerId, SystemSymbol, WorkerContainer};
use sf_store::bmc::Bmc;
use sf_store::Ctx;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};
use utoipa::{OpenApi, ToSchema};

/// The three world-facing ports every coordinator shares, plus the clock.
#[derive(Clone)]
pub struct CoordinatorPorts {
    pub ship_ops: Arc<dyn ShipOperations>,
    pub market_data: Arc<dyn MarketData>,
    pub router: Arc<dyn RouterPort>,
    pub clock: Arc<dyn Clock>,
}

struct RunningCoordinator {
    cancel: CancellationToken,
}

pub struct AppState {
    bmc: Arc<dyn Bmc>,
    ports: CoordinatorPorts,
    running: Mutex<HashMap<ContainerId, RunningCoordinator>>,
    prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(bmc: Arc<dyn Bmc>, ports: CoordinatorPorts, prometheus: Option<PrometheusHandle>) -> Self {
        Self {
            bmc,
            ports,
            running: Mutex::new(HashMap::new()),
            prometheus,
        }
    }

    /// Cancels every running coordinator (process shutdown).
    pub async fn cancel_all(&self) {
        let running = self.running.lock().await;
        for (container_id, coordinator) in running.iter() {
            event!(Level::INFO, "cancelling coordinator {}", container_id);
            coordinator.cancel.cancel();
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartCoordinatorRequest {
    pub system_symbol: String,
    pub player_id: String,
    pub min_purchase_price: Option<i64>,
    pub max_concurrent_tasks: Option<usize>,
    pub max_pipelines: Option<usize>,
    /// prefer-buy | prefer-fabricate | smart
    pub strategy: Option<String>,
    pub supply_poll_interval_secs: Option<u64>,
    pub min_balance: Option<i64>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartCoordinatorResponse {
    pub container_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StopContainerResponse {
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub container_id: String,
    pub player_id: String,
    pub parent_container_id: Option<String>,
    pub container_type: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exit_reason: Option<String>,
    pub task_id: Option<String>,
    pub pipeline_id: Option<String>,
    pub ship_symbol: Option<String>,
    pub system_symbol: Option<String>,
}

impl From<WorkerContainer> for ContainerInfo {
    fn from(container: WorkerContainer) -> Self {
        Self {
            container_id: container.container_id.0,
            player_id: container.player_id.0,
            parent_container_id: container.parent_container_id.map(|id| id.0),
            container_type: container.container_type.to_string(),
            status: container.status.to_string(),
            created_at: container.created_at,
            updated_at: container.updated_at,
            exit_reason: container.exit_reason,
            task_id: container.metadata.task_id.map(|id| id.0),
            pipeline_id: container.metadata.pipeline_id.map(|id| id.0),
            ship_symbol: container.metadata.ship_symbol.map(|s| s.0),
            system_symbol: container.metadata.system_symbol,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListContainersQuery {
    pub player_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
    pub level: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogEntryDto {
    pub sequence: i64,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_containers: usize,
}

#[derive(OpenApi)]
#[openapi(
    paths(start_manufacturing_coordinator, stop_container, list_containers, get_container, get_container_logs, health_check),
    components(schemas(
        StartCoordinatorRequest,
        StartCoordinatorResponse,
        StopContainerResponse,
        ContainerInfo,
        LogEntryDto,
        HealthResponse,
        ApiErrorBody
    ))
)]
pub struct ApiDoc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/coordinators/manufacturing", post(start_manufacturing_coordinator))
        .route("/v1/containers", get(list_containers))
        .route("/v1/containers/:container_id", get(get_container))
        .route("/v1/containers/:container_id/stop", post(stop_container))
        .route("/v1/containers/:container_id/logs", get(get_container_logs))
        .route("/v1/health", get(health_check))
        .route("/v1/metrics", get(prometheus_metrics))
        .route("/api-docs/openapi.json", get(openapi_json))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[utoipa::path(
    post,
    path = "/v1/coordinators/manufacturing",
    request_body = StartCoordinatorRequest,
    responses(
        (status = 200, body = StartCoordinatorResponse),
        (status = 400, body = ApiErrorBody)
    )
)]
pub async fn start_manufacturing_coordinator(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartCoordinatorRequest>,
) -> Result<Json<StartCoordinatorResponse>, ApiError> {
    let strategy = match &request.strategy {
        Some(raw) => PlanningStrategy::parse(raw).map_err(|err| ApiError::BadRequest(err.to_string()))?,
        None => PlanningStrategy::Smart,
    };

    let mut config = CoordinatorConfig::new(SystemSymbol(request.system_symbol.clone()), PlayerId(request.player_id.clone()));
    config.strategy = strategy;
    if let Some(price) = request.min_purchase_price {
        config.min_purchase_price = price;
    }
    if let Some(max) = request.max_concurrent_tasks {
        config.max_concurrent_tasks = max;
    }
    if let Some(max) = request.max_pipelines {
        config.max_pipelines = max;
    }
    if let Some(secs) = request.supply_poll_interval_secs {
        config.supply_poll_interval = Duration::from_secs(secs);
    }
    if let Some(min_balance) = request.min_balance {
        config.min_balance = min_balance;
    }
    if let Some(dry_run) = request.dry_run {
        config.dry_run = dry_run;
    }
    config.validate().map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let ctx = Ctx::for_player(config.player_id.clone());
    let container_id = ContainerId::generate(ContainerType::ManufacturingCoordinator, None);
    let container = WorkerContainer::new(
        container_id.clone(),
        config.player_id.clone(),
        None,
        ContainerType::ManufacturingCoordinator,
        ContainerMetadata {
            task_id: None,
            pipeline_id: None,
            ship_symbol: None,
            system_symbol: Some(request.system_symbol.clone()),
        },
        state.ports.clock.now(),
    );
    state.bmc.container_bmc().insert_container(&ctx, &container).await?;
    state
        .bmc
        .container_bmc()
        .set_container_status(&ctx, &container_id, ContainerStatus::Running, None, state.ports.clock.now())
        .await?;

    let cancel = CancellationToken::new();
    let coordinator = ManufacturingCoordinator::new(
        config,
        container_id.clone(),
        Arc::clone(&state.bmc),
        Arc::clone(&state.ports.ship_ops),
        Arc::clone(&state.ports.market_data),
        Arc::clone(&state.ports.router),
        Arc::clone(&state.ports.clock),
        cancel.child_token(),
    );

    {
        let mut running = state.running.lock().await;
        running.insert(container_id.clone(), RunningCoordinator { cancel: cancel.clone() });
    }

    // the coordinator owns its own lifetime from here; the wrapper only
    // records how it ended
    tokio::spawn({
        let bmc = Arc::clone(&state.bmc);
        let clock = Arc::clone(&state.ports.clock);
        let container_id = container_id.clone();
        let ctx = ctx.clone();
        async move {
            let result = coordinator.run(cancel).await;
            let (status, exit_reason) = match &result {
                Ok(()) => (ContainerStatus::Cancelled, Some("stopped".to_string())),
                Err(err) => (ContainerStatus::Failed, Some(format!("{err:#}"))),
            };
            if let Ok(Some(stored)) = bmc.container_bmc().get_container(&ctx, &container_id).await {
                if !stored.status.is_terminal() {
                    let _ = bmc
                        .container_bmc()
                        .set_container_status(&ctx, &container_id, status, exit_reason, clock.now())
                        .await;
                }
            }
        }
    });

    event!(Level::INFO, "started manufacturing coordinator {}", container_id);
    Ok(Json(StartCoordinatorResponse {
        container_id: container_id.0,
        status: ContainerStatus::Running.to_string(),
        message: format!("manufacturing coordinator running in {}", request.system_symbol),
    }))
}

#[utoipa::path(
    post,
    path = "/v1/containers/{container_id}/stop",
    responses(
        (status = 200, body = StopContainerResponse),
        (status = 404, body = ApiErrorBody)
    )
)]
pub async fn stop_container(State(state): State<Arc<AppState>>, Path(container_id): Path<String>) -> Result<Json<StopContainerResponse>, ApiError> {
    let container_id = ContainerId(container_id);
    let ctx = Ctx::Anonymous;

    let Some(container) = state.bmc.container_bmc().get_container(&ctx, &container_id).await? else {
        return Err(ApiError::NotFound(format!("container {} does not exist", container_id)));
    };

    if let Some(running) = state.running.lock().await.remove(&container_id) {
        running.cancel.cancel();
    }

    let now = state.ports.clock.now();
    if !container.status.is_terminal() {
        state
            .bmc
            .container_bmc()
            .set_container_status(&ctx, &container_id, ContainerStatus::Cancelled, Some("stopped by user".to_string()), now)
            .await?;
    }

    // cascade: stopping a coordinator stops its workers
    for child in state.bmc.container_bmc().load_children(&ctx, &container_id).await? {
        if child.status.is_terminal() {
            continue;
        }
        state
            .bmc
            .container_bmc()
            .set_container_status(&ctx, &child.container_id, ContainerStatus::Cancelled, Some("parent stopped".to_string()), now)
            .await?;
    }

    Ok(Json(StopContainerResponse {
        status: ContainerStatus::Cancelled.to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/v1/containers",
    responses((status = 200, body = [ContainerInfo]))
)]
pub async fn list_containers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListContainersQuery>,
) -> Result<Json<Vec<ContainerInfo>>, ApiError> {
    let status = match &query.status {
        Some(raw) => Some(ContainerStatus::from_str(raw).map_err(|_| ApiError::BadRequest(format!("unknown container status '{raw}'")))?),
        None => None,
    };
    let containers = state
        .bmc
        .container_bmc()
        .list_containers(&Ctx::Anonymous, query.player_id.clone().map(PlayerId), status)
        .await?;
    Ok(Json(containers.into_iter().map(ContainerInfo::from).collect()))
}

#[utoipa::path(
    get,
    path = "/v1/containers/{container_id}",
    responses(
        (status = 200, body = ContainerInfo),
        (status = 404, body = ApiErrorBody)
    )
)]
pub async fn get_container(State(state): State<Arc<AppState>>, Path(container_id): Path<String>) -> Result<Json<ContainerInfo>, ApiError> {
    let container = state
        .bmc
        .container_bmc()
        .get_container(&Ctx::Anonymous, &ContainerId(container_id.clone()))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("container {container_id} does not exist")))?;
    Ok(Json(container.into()))
}

#[utoipa::path(
    get,
    path = "/v1/containers/{container_id}/logs",
    responses((status = 200, body = [LogEntryDto]))
)]
pub async fn get_container_logs(
    State(state): State<Arc<AppState>>,
    Path(container_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogEntryDto>>, ApiError> {
    let min_level = match &query.level {
        Some(raw) => Some(LogLevel::from_str(raw).map_err(|_| ApiError::BadRequest(format!("unknown log level '{raw}'")))?),
        None => None,
    };
    let entries = state
        .bmc
        .container_log_bmc()
        .load_logs(&Ctx::Anonymous, &ContainerId(container_id), query.limit.unwrap_or(100), min_level)
        .await?;
    Ok(Json(
        entries
            .into_iter()
            .map(|entry| LogEntryDto {
                sequence: entry.sequence,
                level: entry.level.to_string(),
                message: entry.message,
                created_at: entry.created_at,
            })
            .collect(),
    ))
}

#[utoipa::path(get, path = "/v1/health", responses((status = 200, body = HealthResponse)))]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let active = state.running.lock().await.len();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_containers: active,
    })
}

pub async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> String {
    state.prometheus.as_ref().map(|handle| handle.render()).unwrap_or_default()
}

pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_core::ports::{MockMarketData, MockRouter, MockShipOperations, SystemClock};
    use sf_store::bmc::InMemoryBmc;

    fn quiet_ports() -> CoordinatorPorts {
        // a coordinator started against these sees an empty universe
        let mut ship_ops = MockShipOperations::new();
        ship_ops.expect_list_ships().returning(|| Ok(vec![]));
        let mut market_data = MockMarketData::new();
        market_data.expect_find_all_markets_in_system().returning(|_| Ok(vec![]));
        CoordinatorPorts {
            ship_ops: Arc::new(ship_ops),
            market_data: Arc::new(market_data),
            router: Arc::new(MockRouter::new()),
            clock: Arc::new(SystemClock),
        }
    }

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Arc::new(InMemoryBmc::new()), quiet_ports(), None))
    }

    #[tokio::test]
    async fn start_then_stop_round_trip() {
        let state = state();

        let response = start_manufacturing_coordinator(
            State(Arc::clone(&state)),
            Json(StartCoordinatorRequest {
                system_symbol: "X1-A".to_string(),
                player_id: "player-1".to_string(),
                min_purchase_price: Some(100),
                max_concurrent_tasks: Some(2),
                max_pipelines: Some(1),
                strategy: Some("prefer-buy".to_string()),
                supply_poll_interval_secs: Some(3600),
                min_balance: None,
                dry_run: Some(true),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.0.status, "RUNNING");
        let container_id = response.0.container_id.clone();

        let health = health_check(State(Arc::clone(&state))).await;
        assert_eq!(health.0.active_containers, 1);

        let stopped = stop_container(State(Arc::clone(&state)), Path(container_id.clone())).await.unwrap();
        assert_eq!(stopped.0.status, "CANCELLED");

        let info = get_container(State(Arc::clone(&state)), Path(container_id)).await.unwrap();
        assert_eq!(info.0.status, "CANCELLED");
    }

    #[tokio::test]
    async fn unknown_strategy_is_a_bad_request() {
        let state = state();
        let result = start_manufacturing_coordinator(
            State(state),
            Json(StartCoordinatorRequest {
                system_symbol: "X1-A".to_string(),
                player_id: "player-1".to_string(),
                min_purchase_price: None,
                max_concurrent_tasks: None,
                max_pipelines: None,
                strategy: Some("aggressive".to_string()),
                supply_poll_interval_secs: None,
                min_balance: None,
                dry_run: None,
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn stopping_an_unknown_container_is_not_found() {
        let state = state();
        let result = stop_container(State(state), Path("missing".to_string())).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }
}
