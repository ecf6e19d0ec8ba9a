use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use sf_server::api_client::GameApiClient;
use sf_server::app::{build_router, AppState, CoordinatorPorts};
use sf_server::cli_args::CliArgs;
use sf_server::configuration::ServerConfiguration;
use sf_server::router::DirectRouter;
use sf_core::ports::SystemClock;
use sf_store::bmc::{Bmc, DbBmc};
use sf_store::DbModelManager;
use sqlx::postgres::PgPoolOptions;
use std::future::IntoFuture;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXIT_OK: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_SIGNAL: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = CliArgs::parse();
    let configuration = match ServerConfiguration::from_env() {
        Ok(configuration) => configuration,
        Err(err) => {
            event!(Level::ERROR, "invalid configuration: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let api_client = match GameApiClient::new(configuration.api_base_url.clone(), &configuration.agent_token) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            event!(Level::ERROR, "invalid agent token: {err:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run(args, configuration, api_client).await {
        Ok(true) => ExitCode::from(EXIT_SIGNAL),
        Ok(false) => ExitCode::from(EXIT_OK),
        Err(err) => {
            event!(Level::ERROR, "fatal: {err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// Returns whether shutdown was signal-driven.
async fn run(args: CliArgs, configuration: ServerConfiguration, api_client: Arc<GameApiClient>) -> anyhow::Result<bool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&configuration.database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let prometheus = PrometheusBuilder::new().install_recorder().ok();
    if prometheus.is_none() {
        event!(Level::WARN, "prometheus recorder could not be installed, /v1/metrics stays empty");
    }

    let bmc = Arc::new(DbBmc::new(DbModelManager::new(pool))) as Arc<dyn Bmc>;
    let ports = CoordinatorPorts {
        ship_ops: Arc::clone(&api_client) as _,
        market_data: Arc::clone(&api_client) as _,
        router: Arc::new(DirectRouter::new(Arc::clone(&api_client) as _, Arc::clone(&api_client) as _)),
        clock: Arc::new(SystemClock),
    };
    let state = Arc::new(AppState::new(bmc, ports, prometheus));

    let port = args.port.unwrap_or(configuration.http_port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    event!(Level::INFO, "daemon listening on port {}", port);

    let app = build_router(Arc::clone(&state));
    let mut serve = std::pin::pin!(axum::serve(listener, app).into_future());

    tokio::select! {
        result = &mut serve => {
            result?;
            Ok(false)
        }
        _ = tokio::signal::ctrl_c() => {
            event!(Level::INFO, "signal received, cancelling coordinators");
            state.cancel_all().await;
            // give workers a moment to persist their shutdown bookkeeping
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(true)
        }
    }
}
