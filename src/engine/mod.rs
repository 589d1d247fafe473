pub mod config;
pub mod history;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod task;

pub use config::{ConfigPatch, OrchestratorConfig};
pub use queue::QueueConfig;
pub use scheduler::{
    Assignment, CancelTarget, DispatchPlan, EngineSettings, TaskCounts, TaskEngine, TaskFilter,
    TaskPage,
};
pub use state::RunState;
pub use task::{ErrorClass, Task, TaskOutcome, TaskPriority, TaskRequirements, TaskSpec, TaskState};

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::clock::{generate_orchestrator_id, SharedClock, SystemClock};
use crate::dispatch::{DispatchConfig, Dispatcher, NodeTransport};
use crate::events::{CallbackNotifier, CallbackSink, Event, EventBus, LogCallbackSink};
use crate::metrics::aggregator::{AggregatorConfig, MetricsAggregator, NetworkMetrics};
use crate::node::liveness::{LivenessConfig, LivenessMonitor, SweepReport};
use crate::node::registry::{
    HeartbeatSample, NodeDescriptor, NodeInfo, NodeRegistry, NodeStatus, RegisterOutcome,
};
use crate::placement::{PlacementConfig, PlacementEngine};
use crate::store::Store;
use crate::utils::error::LatticeError;

/// Aggregate view returned by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub orchestrator_id: String,
    pub state: RunState,
    pub started_at_utc: chrono::DateTime<chrono::Utc>,
    pub metrics: NetworkMetrics,
    pub pending_queue_depth: usize,
    /// False when fewer nodes than `network.min_nodes` are registered.
    pub min_nodes_satisfied: bool,
}

/// What crash recovery rebuilt from the store.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub nodes_restored: usize,
    pub tasks_resurfaced: usize,
    pub config_restored: bool,
}

/// The control plane. Owns the registry, task engine, placement engine,
/// dispatcher, liveness monitor, and metrics aggregator; every API takes
/// this handle — there is no process-global state.
#[derive(Debug)]
pub struct Orchestrator {
    orchestrator_id: String,
    config: RwLock<OrchestratorConfig>,
    registry: Arc<NodeRegistry>,
    engine: Arc<TaskEngine>,
    placement: Arc<PlacementEngine>,
    dispatcher: Arc<Dispatcher>,
    liveness: Arc<LivenessMonitor>,
    aggregator: Arc<MetricsAggregator>,
    bus: EventBus,
    store: Option<Arc<dyn Store>>,
    callback_sink: Arc<dyn CallbackSink>,
    started_at_utc: chrono::DateTime<chrono::Utc>,
    state: RwLock<RunState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Self, LatticeError> {
        Self::with_parts(config, transport, Arc::new(SystemClock::new()), None)
    }

    /// Full-control constructor: tests inject a manual clock, deployments
    /// attach a store.
    pub fn with_parts(
        config: OrchestratorConfig,
        transport: Arc<dyn NodeTransport>,
        clock: SharedClock,
        store: Option<Arc<dyn Store>>,
    ) -> Result<Self, LatticeError> {
        config.validate()?;
        let bus = EventBus::new(1_024);
        let registry = Arc::new(NodeRegistry::new(clock.clone(), bus.clone()));

        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            DispatchConfig {
                timeout: config.dispatch_timeout(),
                retries: config.dispatch.retries,
                ..DispatchConfig::default()
            },
        ));

        let placement = Arc::new(PlacementEngine::new(
            PlacementConfig {
                algorithm: config.network.load_balance_algorithm,
                allow_degraded: config.placement.allow_degraded,
                strict_preferred: config.placement.strict_preferred,
                strict_redundancy: config.placement.strict_redundancy,
                weights: config.placement.weights,
                top_n: config.placement.top_n,
            },
            dispatcher.rtt(),
        ));

        let engine = Arc::new(TaskEngine::new(
            registry.clone(),
            placement.clone(),
            bus.clone(),
            clock.clone(),
            QueueConfig {
                max_pending: config.queue.max_pending,
                high_water_fraction: config.queue.high_water_fraction,
            },
            EngineSettings {
                placement_grace_ms: config.task.placement_grace_seconds * 1_000,
                default_max_retries: config.task.max_retries_default,
                history_limit: config.task.history_limit,
            },
            store.clone(),
        ));

        let liveness = Arc::new(LivenessMonitor::new(
            registry.clone(),
            clock.clone(),
            LivenessConfig {
                heartbeat_interval: config.heartbeat_interval(),
                degraded_factor: config.liveness.degraded_factor,
                offline_factor: config.liveness.offline_factor,
                sweep_interval: Duration::from_secs(config.liveness.sweep_interval_seconds),
                offline_retention: config
                    .liveness
                    .offline_retention_seconds
                    .map(Duration::from_secs),
            },
        ));

        let aggregator = Arc::new(MetricsAggregator::new(
            clock.clone(),
            AggregatorConfig::default(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            orchestrator_id: generate_orchestrator_id(),
            config: RwLock::new(config),
            registry,
            engine,
            placement,
            dispatcher,
            liveness,
            aggregator,
            bus,
            store,
            callback_sink: Arc::new(LogCallbackSink),
            started_at_utc: chrono::Utc::now(),
            state: RwLock::new(RunState::Init),
            shutdown_tx,
        })
    }

    /// Replace the callback sink before `start`.
    pub fn set_callback_sink(&mut self, sink: Arc<dyn CallbackSink>) {
        self.callback_sink = sink;
    }

    pub fn orchestrator_id(&self) -> &str {
        &self.orchestrator_id
    }

    /// Spawn the background activities: the dispatch worker pool, the
    /// liveness and deadline tickers, the metrics aggregator, and the
    /// callback notifier. Returns immediately; `shutdown` stops them.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.write().expect("run state poisoned");
            if *state != RunState::Init {
                warn!("orchestrator already started");
                return;
            }
            *state = RunState::Running;
        }
        info!(orchestrator_id = %self.orchestrator_id, "orchestrator starting");

        let workers = self.config.read().expect("config poisoned").dispatch_worker_count();
        for worker in 0..workers {
            let orch = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match orch.engine.next_plan() {
                        Some(plan) => orch.run_plan(plan).await,
                        None => {
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                    }
                }
                info!(worker, "dispatch worker stopped");
            });
        }

        let orch = Arc::clone(self);
        let liveness = self.liveness.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            liveness
                .run(shutdown, move |report| {
                    for node_id in &report.newly_offline {
                        orch.engine.handle_node_failure(node_id);
                    }
                })
                .await;
        });

        let orch = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let deadline_tick =
            Duration::from_secs(self.config.read().expect("config poisoned").workers.deadline_tick_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(deadline_tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { orch.deadline_tick().await; }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let aggregator = self.aggregator.clone();
        let events = self.bus.subscribe();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            aggregator.run(events, shutdown).await;
        });

        let notifier = CallbackNotifier::new(self.callback_sink.clone());
        let events = self.bus.subscribe();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            notifier.run(events, shutdown).await;
        });
    }

    /// Signal every background activity to stop and mark the handle
    /// stopped. In-flight dispatches settle on their own deadlines.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.write().expect("run state poisoned");
            if matches!(*state, RunState::Stopped) {
                return;
            }
            *state = RunState::Draining;
        }
        let _ = self.shutdown_tx.send(true);
        *self.state.write().expect("run state poisoned") = RunState::Stopped;
        info!(orchestrator_id = %self.orchestrator_id, "orchestrator stopped");
    }

    pub fn run_state(&self) -> RunState {
        *self.state.read().expect("run state poisoned")
    }

    // ---- client-facing API ----

    pub fn submit_task(&self, spec: TaskSpec) -> Result<String, LatticeError> {
        self.engine.submit(spec)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, LatticeError> {
        self.engine
            .get(task_id)
            .ok_or_else(|| LatticeError::not_found(format!("unknown task {task_id}")))
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> TaskPage {
        self.engine.list(filter)
    }

    /// Cancel a task and push best-effort cancels to its nodes.
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), LatticeError> {
        let cancels = self.engine.cancel(task_id)?;
        self.send_cancels(cancels).await;
        Ok(())
    }

    pub fn get_status(&self) -> OrchestratorStatus {
        let metrics = self.get_metrics();
        let min_nodes = self.config.read().expect("config poisoned").network.min_nodes;
        OrchestratorStatus {
            orchestrator_id: self.orchestrator_id.clone(),
            state: self.run_state(),
            started_at_utc: self.started_at_utc,
            min_nodes_satisfied: metrics.total_nodes >= min_nodes,
            pending_queue_depth: self.engine.pending_len(),
            metrics,
        }
    }

    pub fn get_metrics(&self) -> NetworkMetrics {
        self.aggregator
            .snapshot(&self.registry.snapshot(), self.engine.counts())
    }

    pub fn get_config(&self) -> OrchestratorConfig {
        self.config.read().expect("config poisoned").clone()
    }

    /// Apply a runtime patch and propagate it to the placement engine and
    /// liveness monitor. Written through to the store when configured.
    pub fn update_config(&self, patch: &ConfigPatch) -> Result<OrchestratorConfig, LatticeError> {
        let updated = {
            let mut config = self.config.write().expect("config poisoned");
            config.apply_patch(patch)?;
            config.clone()
        };
        self.placement.update_config(|p| {
            p.algorithm = updated.network.load_balance_algorithm;
            p.allow_degraded = updated.placement.allow_degraded;
            p.strict_preferred = updated.placement.strict_preferred;
            p.strict_redundancy = updated.placement.strict_redundancy;
            p.weights = updated.placement.weights;
        });
        self.liveness.update_config(|l| {
            l.degraded_factor = updated.liveness.degraded_factor;
            l.offline_factor = updated.liveness.offline_factor;
        });
        if let Some(store) = &self.store {
            if let Err(err) = store.put_config(&updated) {
                warn!(error = %err, "config write-through failed");
            }
        }
        info!("configuration updated");
        Ok(updated)
    }

    // ---- node-facing API ----

    pub fn register_node(&self, desc: NodeDescriptor) -> Result<RegisterOutcome, LatticeError> {
        let max_nodes = self.config.read().expect("config poisoned").network.max_nodes;
        if !self.registry.contains(&desc.node_id) && self.registry.len() >= max_nodes {
            return Err(LatticeError::overloaded(format!(
                "registry at capacity ({max_nodes} nodes)"
            )));
        }
        let outcome = self.registry.register(desc.clone())?;
        if let Some(store) = &self.store {
            if let Some(node) = self.registry.get(&desc.node_id) {
                if let Err(err) = store.put_node(&node) {
                    warn!(node_id = %desc.node_id, error = %err, "node write-through failed");
                }
            }
        }
        Ok(outcome)
    }

    pub fn heartbeat(&self, node_id: &str, sample: HeartbeatSample) -> Result<(), LatticeError> {
        self.registry.heartbeat(node_id, sample)
    }

    pub fn set_node_status(
        &self,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<(), LatticeError> {
        self.registry.set_status(node_id, status)?;
        if let Some(store) = &self.store {
            if let Some(node) = self.registry.get(node_id) {
                let _ = store.put_node(&node);
            }
        }
        Ok(())
    }

    /// Node pushes an outcome. Validates assignment membership; the first
    /// completion of a redundant task triggers sibling cancels.
    pub async fn report_task_result(
        &self,
        task_id: &str,
        node_id: &str,
        outcome: TaskOutcome,
    ) -> Result<(), LatticeError> {
        let cancels = self.engine.on_node_result(task_id, node_id, outcome)?;
        self.send_cancels(cancels).await;
        Ok(())
    }

    /// Remove a node; tasks still assigned there take the failure path.
    pub fn unregister_node(&self, node_id: &str) -> Result<(), LatticeError> {
        self.registry.unregister(node_id)?;
        self.engine.handle_node_failure(node_id);
        self.dispatcher.rtt().forget(node_id);
        if let Some(store) = &self.store {
            let _ = store.delete_node(node_id);
        }
        Ok(())
    }

    pub fn get_node(&self, node_id: &str) -> Result<NodeInfo, LatticeError> {
        self.registry
            .get(node_id)
            .ok_or_else(|| LatticeError::not_found(format!("unknown node {node_id}")))
    }

    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        self.registry.snapshot().nodes
    }

    /// Subscribe to the lifecycle/topology event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    // ---- tick drivers ----
    //
    // The background loops call these; tests drive them directly with a
    // manual clock instead of sleeping.

    /// Place and deliver every ready pending task, awaiting the
    /// deliveries. Returns the number of dispatched plans.
    pub async fn dispatch_tick(&self) -> usize {
        let plans = self.engine.dispatch_tick();
        let count = plans.len();
        for plan in plans {
            self.run_plan(plan).await;
        }
        count
    }

    /// One liveness sweep plus task failover for newly offline nodes.
    pub fn liveness_tick(&self) -> SweepReport {
        let report = self.liveness.sweep();
        for node_id in &report.newly_offline {
            self.engine.handle_node_failure(node_id);
        }
        report
    }

    /// One deadline sweep; expired in-flight work gets best-effort node
    /// cancels.
    pub async fn deadline_tick(&self) {
        let cancels = self.engine.tick_deadlines();
        self.send_cancels(cancels).await;
    }

    /// Rebuild in-memory state from the store after a crash. Nodes come
    /// back offline until they heartbeat; unconfirmed in-flight tasks are
    /// re-surfaced as pending with their retry counts preserved.
    pub fn recover(&self) -> Result<RecoveryReport, LatticeError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| LatticeError::configuration("no store configured for recovery"))?;

        let mut report = RecoveryReport::default();
        for node in store.load_nodes()? {
            self.registry.restore(node);
            report.nodes_restored += 1;
        }
        report.tasks_resurfaced = self.engine.recover_tasks(store.load_tasks()?);
        if let Some(config) = store.load_config()? {
            config.validate()?;
            *self.config.write().expect("config poisoned") = config.clone();
            self.placement.update_config(|p| {
                p.algorithm = config.network.load_balance_algorithm;
                p.allow_degraded = config.placement.allow_degraded;
                p.strict_preferred = config.placement.strict_preferred;
                p.strict_redundancy = config.placement.strict_redundancy;
                p.weights = config.placement.weights;
            });
            report.config_restored = true;
        }
        info!(
            nodes = report.nodes_restored,
            tasks = report.tasks_resurfaced,
            "state recovered from store"
        );
        Ok(report)
    }

    // ---- internals ----

    /// Deliver one plan. Deliveries are spawned for every assignment
    /// before any is awaited, so redundant dispatch fans out and a slow
    /// node races its siblings instead of blocking them. Each delivery
    /// runs in its own spawned task so a panic inside the transport is
    /// contained at the worker boundary and surfaces as a network error.
    async fn run_plan(&self, plan: DispatchPlan) {
        let task_id = plan.payload.task_id.clone();
        let deliveries: Vec<_> = plan
            .assignments
            .into_iter()
            .map(|assignment| {
                let dispatcher = self.dispatcher.clone();
                let payload = plan.payload.clone();
                let node_id = assignment.node_id.clone();
                let endpoint = assignment.endpoint.clone();
                let handle = tokio::spawn(async move {
                    dispatcher.deliver(&node_id, &endpoint, &payload).await
                });
                (assignment, handle)
            })
            .collect();

        for (assignment, handle) in deliveries {
            match handle.await {
                Ok(Ok(())) => {
                    if let Err(err) = self.engine.on_node_ack(&task_id, &assignment.node_id) {
                        warn!(%task_id, node_id = %assignment.node_id, error = %err, "ack handling failed");
                    }
                }
                Ok(Err((class, message))) => {
                    self.engine
                        .on_dispatch_error(&task_id, &assignment.node_id, class, message);
                }
                Err(join_err) => {
                    error!(%task_id, node_id = %assignment.node_id, error = %join_err, "dispatch worker fault");
                    self.engine.on_dispatch_error(
                        &task_id,
                        &assignment.node_id,
                        ErrorClass::NetworkError,
                        format!("dispatch worker fault: {join_err}"),
                    );
                }
            }
        }
    }

    async fn send_cancels(&self, cancels: Vec<CancelTarget>) {
        for cancel in cancels {
            self.dispatcher
                .cancel_best_effort(&cancel.node_id, &cancel.endpoint, &cancel.task_id)
                .await;
        }
    }
}
