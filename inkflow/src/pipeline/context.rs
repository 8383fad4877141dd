//! Per-run shared context.

use super::StageGraph;
use crate::backend::BackendRouter;
use crate::budget::BudgetLedger;
use crate::cancellation::RunControl;
use crate::config::RunConfig;
use crate::events::RunEvents;
use crate::memory::MemoryStore;
use crate::quality::RepairPlanner;
use std::sync::Arc;

/// Everything one run shares between its stages.
///
/// Nothing here is process-global: two runs in the same process each get
/// their own ledger, memory store, router and control tokens.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: String,
    config: Arc<RunConfig>,
    graph: Arc<StageGraph>,
    ledger: Arc<BudgetLedger>,
    memory: Arc<MemoryStore>,
    router: Arc<BackendRouter>,
    events: RunEvents,
    control: RunControl,
    planner: RepairPlanner,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: impl Into<String>,
        config: RunConfig,
        graph: StageGraph,
        ledger: Arc<BudgetLedger>,
        memory: Arc<MemoryStore>,
        router: Arc<BackendRouter>,
        events: RunEvents,
    ) -> Self {
        let planner = RepairPlanner::new(config.repair_table.clone());
        Self {
            run_id: run_id.into(),
            config: Arc::new(config),
            graph: Arc::new(graph),
            ledger,
            memory,
            router,
            events,
            control: RunControl::new(),
            planner,
        }
    }

    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The config the run is executing.
    #[must_use]
    pub fn config(&self) -> &Arc<RunConfig> {
        &self.config
    }

    /// The validated stage graph.
    #[must_use]
    pub fn graph(&self) -> &Arc<StageGraph> {
        &self.graph
    }

    /// The run's spend ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// The run's memory store.
    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// The run's backend router.
    #[must_use]
    pub fn router(&self) -> &Arc<BackendRouter> {
        &self.router
    }

    /// Event emitter bound to this run.
    #[must_use]
    pub fn events(&self) -> &RunEvents {
        &self.events
    }

    /// Pause and cancel tokens.
    #[must_use]
    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Repair planner built from the config's repair table.
    #[must_use]
    pub fn planner(&self) -> &RepairPlanner {
        &self.planner
    }
}
