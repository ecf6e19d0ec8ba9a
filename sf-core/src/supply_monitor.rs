use crate::ports::{Clock, MarketData};
use crate::task_queue::TaskQueue;
use anyhow::Result;
use itertools::Itertools;
use sf_domain::{PipelineStatus, PlayerId, SupplyObservation, TaskId};
use sf_store::bmc::Bmc;
use sf_store::{Ctx, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

/// Long-lived poller: refreshes factory supply levels and flips
/// CollectSell readiness on the edges. Runs as its own task beside the
/// coordinator loop and talks back through the `task_ready` channel.
pub struct SupplyMonitor {
    bmc: Arc<dyn Bmc>,
    market_data: Arc<dyn MarketData>,
    queue: Arc<TaskQueue>,
    clock: Arc<dyn Clock>,
    player_id: PlayerId,
    task_ready_tx: mpsc::Sender<TaskId>,
}

impl SupplyMonitor {
    pub fn new(
        bmc: Arc<dyn Bmc>,
        market_data: Arc<dyn MarketData>,
        queue: Arc<TaskQueue>,
        clock: Arc<dyn Clock>,
        player_id: PlayerId,
        task_ready_tx: mpsc::Sender<TaskId>,
    ) -> Self {
        Self {
            bmc,
            market_data,
            queue,
            clock,
            player_id,
            task_ready_tx,
        }
    }

    pub async fn run(self, poll_interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let ctx = Ctx::for_player(self.player_id.clone());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    event!(Level::INFO, "supply monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(&ctx).await {
                        event!(Level::WARN, "supply poll failed: {err:#}");
                    }
                }
            }
        }
    }

    /// One observation pass over every factory of every active pipeline.
    pub async fn poll_once(&self, ctx: &Ctx) -> Result<usize> {
        let active_pipelines = self
            .bmc
            .pipeline_bmc()
            .load_pipelines_by_status(ctx, &self.player_id, &[PipelineStatus::Planning, PipelineStatus::Executing])
            .await?;
        let pipeline_ids = active_pipelines.iter().map(|p| p.id.clone()).collect_vec();
        if pipeline_ids.is_empty() {
            return Ok(0);
        }

        let states = self.bmc.factory_state_bmc().load_for_pipelines(ctx, &pipeline_ids).await?;
        let by_factory = states.into_iter().into_group_map_by(|s| s.factory_symbol.clone());

        let mut promoted_total = 0;
        for (factory_symbol, states) in by_factory {
            let market = match self.market_data.get_market_data(&factory_symbol).await {
                Ok(market) => market,
                Err(err) => {
                    event!(Level::WARN, "could not observe market {}: {err:#}", factory_symbol);
                    continue;
                }
            };

            for mut state in states {
                let Some(entry) = market.trade_good(&state.output_good) else {
                    continue;
                };

                let observation = state.observe_supply(entry.supply, self.clock.now());
                match self.bmc.factory_state_bmc().update_factory_state(ctx, &state).await {
                    Ok(_) => {}
                    Err(err) if is_version_conflict(&err) => {
                        // another writer moved it; next tick re-observes
                        continue;
                    }
                    Err(err) => return Err(err),
                }

                match observation {
                    SupplyObservation::BecameReady => {
                        event!(
                            Level::INFO,
                            "factory {} reached {} supply for {}, promoting collect tasks",
                            factory_symbol,
                            entry.supply,
                            state.output_good
                        );
                        promoted_total += self.promote_collect_tasks(ctx, &state.factory_symbol, &state.output_good).await?;
                    }
                    SupplyObservation::NoLongerReady => {
                        event!(
                            Level::INFO,
                            "factory {} dropped to {} supply for {}",
                            factory_symbol,
                            entry.supply,
                            state.output_good
                        );
                        // rescue_ready_collect_sell_tasks demotes on the
                        // next coordinator tick
                    }
                    SupplyObservation::Unchanged => {}
                }
            }
        }

        Ok(promoted_total)
    }

    async fn promote_collect_tasks(&self, ctx: &Ctx, factory_symbol: &sf_domain::WaypointSymbol, output_good: &sf_domain::TradeGoodSymbol) -> Result<usize> {
        let promoted = self.queue.mark_collect_tasks_ready(factory_symbol, output_good);
        let mut persisted = 0;

        for queued in promoted {
            let Some(mut task) = self.bmc.task_bmc().get_task(ctx, &queued.id).await? else {
                self.queue.demote_collect_task(&queued.id);
                continue;
            };
            if task.status != sf_domain::TaskStatus::Pending {
                self.queue.demote_collect_task(&queued.id);
                continue;
            }
            task.mark_ready(self.clock.now())?;
            match self.bmc.task_bmc().update_task(ctx, &task).await {
                Ok(_) => {
                    persisted += 1;
                    // non-blocking: a dropped signal is caught by the next
                    // idle-ship tick
                    if self.task_ready_tx.try_send(task.id.clone()).is_err() {
                        event!(Level::DEBUG, "task-ready channel full, {} waits for the next tick", task.id);
                    }
                }
                Err(err) if is_version_conflict(&err) => {
                    // a writer beat us; undo the queue flip, next tick
                    // re-observes
                    self.queue.demote_collect_task(&queued.id);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(persisted)
    }
}

fn is_version_conflict(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::VersionConflict { .. }))
}
