use crate::supply_chain::PlanningStrategy;
use anyhow::{bail, Result};
use sf_domain::{PlayerId, SystemSymbol};
use std::time::Duration;

/// All knobs of one coordinator instance. Arrives per start request; the
/// tick intervals have fixed defaults and exist as fields so tests can
/// shrink them.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub system_symbol: SystemSymbol,
    pub player_id: PlayerId,
    pub min_purchase_price: i64,
    pub max_concurrent_tasks: usize,
    pub max_pipelines: usize,
    pub strategy: PlanningStrategy,
    pub min_balance: i64,
    pub dry_run: bool,

    pub opportunity_scan_interval: Duration,
    pub idle_ship_interval: Duration,
    pub stuck_pipeline_interval: Duration,
    pub pipeline_completion_interval: Duration,
    pub supply_poll_interval: Duration,

    pub stuck_threshold: chrono::Duration,
    pub max_retries: u32,
    pub min_cargo_capacity: u32,
}

impl CoordinatorConfig {
    pub fn new(system_symbol: SystemSymbol, player_id: PlayerId) -> Self {
        Self {
            system_symbol,
            player_id,
            min_purchase_price: 1,
            max_concurrent_tasks: 3,
            max_pipelines: 2,
            strategy: PlanningStrategy::Smart,
            min_balance: 0,
            dry_run: false,
            opportunity_scan_interval: Duration::from_secs(180),
            idle_ship_interval: Duration::from_secs(10),
            stuck_pipeline_interval: Duration::from_secs(300),
            pipeline_completion_interval: Duration::from_secs(30),
            supply_poll_interval: Duration::from_secs(30),
            stuck_threshold: chrono::Duration::minutes(30),
            max_retries: 3,
            min_cargo_capacity: 40,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.system_symbol.0.is_empty() {
            bail!("system symbol must not be empty");
        }
        if self.player_id.0.is_empty() {
            bail!("player id must not be empty");
        }
        if self.max_concurrent_tasks == 0 {
            bail!("max_concurrent_tasks must be at least 1");
        }
        if self.max_pipelines == 0 {
            bail!("max_pipelines must be at least 1");
        }
        if self.min_purchase_price < 0 {
            bail!("min_purchase_price must not be negative");
        }
        if self.supply_poll_interval.is_zero() {
            bail!("supply_poll_interval must not be zero");
        }
        Ok(())
    }
}
