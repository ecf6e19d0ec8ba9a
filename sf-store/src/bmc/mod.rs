use crate::bmc::container_bmc::{ContainerBmcTrait, DbContainerBmc, InMemoryContainerBmc};
use crate::bmc::container_log_bmc::{ContainerLogBmcTrait, DbContainerLogBmc, InMemoryContainerLogBmc};
use crate::bmc::factory_state_bmc::{DbFactoryStateBmc, FactoryStateBmcTrait, InMemoryFactoryStateBmc};
use crate::bmc::ledger_bmc::{DbLedgerBmc, InMemoryLedgerBmc, LedgerBmcTrait};
use crate::bmc::pipeline_bmc::{DbPipelineBmc, InMemoryPipelineBmc, PipelineBmcTrait};
use crate::bmc::ship_assignment_bmc::{DbShipAssignmentBmc, InMemoryShipAssignmentBmc, ShipAssignmentBmcTrait};
use crate::bmc::task_bmc::{DbTaskBmc, InMemoryTaskBmc, TaskBmcTrait};
use crate::DbModelManager;
use mockall::automock;
use std::fmt::Debug;
use std::sync::Arc;

pub mod container_bmc;
pub mod container_log_bmc;
pub mod factory_state_bmc;
pub mod ledger_bmc;
pub mod pipeline_bmc;
pub mod ship_assignment_bmc;
pub mod task_bmc;

#[automock]
pub trait Bmc: Send + Sync + Debug {
    fn pipeline_bmc(&self) -> Arc<dyn PipelineBmcTrait>;
    fn task_bmc(&self) -> Arc<dyn TaskBmcTrait>;
    fn factory_state_bmc(&self) -> Arc<dyn FactoryStateBmcTrait>;
    fn ship_assignment_bmc(&self) -> Arc<dyn ShipAssignmentBmcTrait>;
    fn container_bmc(&self) -> Arc<dyn ContainerBmcTrait>;
    fn container_log_bmc(&self) -> Arc<dyn ContainerLogBmcTrait>;
    fn ledger_bmc(&self) -> Arc<dyn LedgerBmcTrait>;
}

#[derive(Debug, Clone)]
pub struct DbBmc {
    pub db_model_manager: DbModelManager,
    pipeline_bmc: Arc<DbPipelineBmc>,
    task_bmc: Arc<DbTaskBmc>,
    factory_state_bmc: Arc<DbFactoryStateBmc>,
    ship_assignment_bmc: Arc<DbShipAssignmentBmc>,
    container_bmc: Arc<DbContainerBmc>,
    container_log_bmc: Arc<DbContainerLogBmc>,
    ledger_bmc: Arc<DbLedgerBmc>,
}

impl DbBmc {
    pub fn new(mm: DbModelManager) -> Self {
        Self {
            db_model_manager: mm.clone(),
            pipeline_bmc: Arc::new(DbPipelineBmc { mm: mm.clone() }),
            task_bmc: Arc::new(DbTaskBmc { mm: mm.clone() }),
            factory_state_bmc: Arc::new(DbFactoryStateBmc { mm: mm.clone() }),
            ship_assignment_bmc: Arc::new(DbShipAssignmentBmc { mm: mm.clone() }),
            container_bmc: Arc::new(DbContainerBmc { mm: mm.clone() }),
            container_log_bmc: Arc::new(DbContainerLogBmc { mm: mm.clone() }),
            ledger_bmc: Arc::new(DbLedgerBmc { mm: mm.clone() }),
        }
    }
}

impl Bmc for DbBmc {
    fn pipeline_bmc(&self) -> Arc<dyn PipelineBmcTrait> {
        self.pipeline_bmc.clone() as Arc<dyn PipelineBmcTrait>
    }

    fn task_bmc(&self) -> Arc<dyn TaskBmcTrait> {
        self.task_bmc.clone() as Arc<dyn TaskBmcTrait>
    }

    fn factory_state_bmc(&self) -> Arc<dyn FactoryStateBmcTrait> {
        self.factory_state_bmc.clone() as Arc<dyn FactoryStateBmcTrait>
    }

    fn ship_assignment_bmc(&self) -> Arc<dyn ShipAssignmentBmcTrait> {
        self.ship_assignment_bmc.clone() as Arc<dyn ShipAssignmentBmcTrait>
    }

    fn container_bmc(&self) -> Arc<dyn ContainerBmcTrait> {
        self.container_bmc.clone() as Arc<dyn ContainerBmcTrait>
    }

    fn container_log_bmc(&self) -> Arc<dyn ContainerLogBmcTrait> {
        self.container_log_bmc.clone() as Arc<dyn ContainerLogBmcTrait>
    }

    fn ledger_bmc(&self) -> Arc<dyn LedgerBmcTrait> {
        self.ledger_bmc.clone() as Arc<dyn LedgerBmcTrait>
    }
}

/// Fully in-memory repository set used by tests and recovery drills.
#[derive(Debug)]
pub struct InMemoryBmc {
    pub in_mem_pipeline_bmc: Arc<InMemoryPipelineBmc>,
    pub in_mem_task_bmc: Arc<InMemoryTaskBmc>,
    pub in_mem_factory_state_bmc: Arc<InMemoryFactoryStateBmc>,
    pub in_mem_ship_assignment_bmc: Arc<InMemoryShipAssignmentBmc>,
    pub in_mem_container_bmc: Arc<InMemoryContainerBmc>,
    pub in_mem_container_log_bmc: Arc<InMemoryContainerLogBmc>,
    pub in_mem_ledger_bmc: Arc<InMemoryLedgerBmc>,
}

impl InMemoryBmc {
    pub fn new() -> Self {
        let task_bmc = Arc::new(InMemoryTaskBmc::new());
        let factory_state_bmc = Arc::new(InMemoryFactoryStateBmc::new());
        Self {
            in_mem_pipeline_bmc: Arc::new(InMemoryPipelineBmc::new(Arc::clone(&task_bmc), Arc::clone(&factory_state_bmc))),
            in_mem_task_bmc: task_bmc,
            in_mem_factory_state_bmc: factory_state_bmc,
            in_mem_ship_assignment_bmc: Arc::new(InMemoryShipAssignmentBmc::new()),
            in_mem_container_bmc: Arc::new(InMemoryContainerBmc::new()),
            in_mem_container_log_bmc: Arc::new(InMemoryContainerLogBmc::new()),
            in_mem_ledger_bmc: Arc::new(InMemoryLedgerBmc::new()),
        }
    }
}

impl Default for InMemoryBmc {
    fn default() -> Self {
        Self::new()
    }
}

impl Bmc for InMemoryBmc {
    fn pipeline_bmc(&self) -> Arc<dyn PipelineBmcTrait> {
        Arc::clone(&self.in_mem_pipeline_bmc) as Arc<dyn PipelineBmcTrait>
    }

    fn task_bmc(&self) -> Arc<dyn TaskBmcTrait> {
        Arc::clone(&self.in_mem_task_bmc) as Arc<dyn TaskBmcTrait>
    }

    fn factory_state_bmc(&self) -> Arc<dyn FactoryStateBmcTrait> {
        Arc::clone(&self.in_mem_factory_state_bmc) as Arc<dyn FactoryStateBmcTrait>
    }

    fn ship_assignment_bmc(&self) -> Arc<dyn ShipAssignmentBmcTrait> {
        Arc::clone(&self.in_mem_ship_assignment_bmc) as Arc<dyn ShipAssignmentBmcTrait>
    }

    fn container_bmc(&self) -> Arc<dyn ContainerBmcTrait> {
        Arc::clone(&self.in_mem_container_bmc) as Arc<dyn ContainerBmcTrait>
    }

    fn container_log_bmc(&self) -> Arc<dyn ContainerLogBmcTrait> {
        Arc::clone(&self.in_mem_container_log_bmc) as Arc<dyn ContainerLogBmcTrait>
    }

    fn ledger_bmc(&self) -> Arc<dyn LedgerBmcTrait> {
        Arc::clone(&self.in_mem_ledger_bmc) as Arc<dyn LedgerBmcTrait>
    }
}
