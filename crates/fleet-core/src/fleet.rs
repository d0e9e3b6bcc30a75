//! Fleet service
//!
//! Wires the directory, message bus and scheduler together, runs their
//! periodic maintenance and connects the resilience manager so a
//! reconnected agent rejoins the fleet.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{
    AgentDirectory, AgentStatus, AgentUpdate, DirectoryResult, DirectoryStats, OfflineAgent,
};
use crate::communication::{AgentInbox, MessageBus, MessageBusStats};
use crate::config::FleetConfig;
use crate::resilience::{ConnectionFactory, ErrorClass, ReconnectObserver, ResilienceManager};
use crate::scheduler::{SchedulerStats, TaskScheduler};

/// Combined statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStats {
    pub directory: DirectoryStats,
    pub scheduler: SchedulerStats,
    pub bus: MessageBusStats,
}

pub struct Fleet {
    config: FleetConfig,
    directory: Arc<AgentDirectory>,
    bus: Arc<MessageBus>,
    scheduler: Arc<TaskScheduler>,
    shutdown: CancellationToken,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

impl Fleet {
    /// Build the directory, bus and scheduler from `config`. Maintenance
    /// loops are not started.
    pub fn new(config: FleetConfig) -> Self {
        let directory = Arc::new(AgentDirectory::with_default_health(
            config.scheduler.max_health,
        ));
        let bus = Arc::new(MessageBus::new(directory.clone(), config.bus.clone()));
        let scheduler = TaskScheduler::new(directory.clone(), config.scheduler.clone());

        Self {
            config,
            directory,
            bus,
            scheduler,
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.directory
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Register an agent with the directory and the bus, making it a
    /// scheduling candidate. Re-registering an agent that holds a task fails
    /// that task through the scheduler's release hook.
    pub fn register_agent<I, S>(&self, agent_id: impl Into<String>, capabilities: I) -> AgentInbox
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agent_id = agent_id.into();
        self.directory.register(agent_id.clone(), capabilities);
        let inbox = self.bus.register_agent(agent_id);
        self.scheduler.tick();
        inbox
    }

    /// Liveness ping. A revived agent is immediately considered for pending work.
    pub fn heartbeat(&self, agent_id: &str) -> DirectoryResult<bool> {
        let revived = self.directory.heartbeat(agent_id)?;
        if revived {
            self.scheduler.tick();
        }
        Ok(revived)
    }

    /// Mark silent agents offline. Tasks they held are failed and requeued.
    pub fn sweep_inactive(&self) -> Vec<OfflineAgent> {
        sweep_inactive(
            &self.bus,
            Duration::from_millis(self.config.directory.heartbeat_timeout_ms),
        )
    }

    /// Purge messages past the retention horizon and prune old terminal tasks
    pub fn cleanup(&self) -> usize {
        cleanup(&self.bus, &self.scheduler, self.config.bus.message_retention_ms)
    }

    /// Resilience manager whose reconnects rejoin this fleet
    pub fn resilience_manager(&self, factory: Arc<dyn ConnectionFactory>) -> ResilienceManager {
        let manager = ResilienceManager::new(self.config.reconnect.clone(), factory);
        manager.add_observer(Arc::new(FleetRejoin {
            directory: self.directory.clone(),
            scheduler: self.scheduler.clone(),
        }));
        manager
    }

    pub fn stats(&self) -> FleetStats {
        FleetStats {
            directory: self.directory.stats(),
            scheduler: self.scheduler.stats(),
            bus: self.bus.stats(),
        }
    }

    /// Start the liveness sweep, message cleanup and reassignment loops.
    /// Must be called from within a tokio runtime.
    pub fn start_maintenance(&self) {
        let mut handles = self.maintenance.lock();
        if !handles.is_empty() {
            return;
        }

        let directory_config = &self.config.directory;
        {
            let bus = self.bus.clone();
            let timeout = Duration::from_millis(directory_config.heartbeat_timeout_ms);
            handles.push(spawn_periodic(
                "liveness sweep",
                directory_config.sweep_interval_ms,
                self.shutdown.clone(),
                move || {
                    sweep_inactive(&bus, timeout);
                },
            ));
        }

        {
            let bus = self.bus.clone();
            let scheduler = self.scheduler.clone();
            let retention_ms = self.config.bus.message_retention_ms;
            handles.push(spawn_periodic(
                "message cleanup",
                self.config.bus.cleanup_interval_ms,
                self.shutdown.clone(),
                move || {
                    cleanup(&bus, &scheduler, retention_ms);
                },
            ));
        }

        if self.config.scheduler.reassign_interval_ms > 0 {
            let scheduler = self.scheduler.clone();
            handles.push(spawn_periodic(
                "reassignment tick",
                self.config.scheduler.reassign_interval_ms,
                self.shutdown.clone(),
                move || {
                    scheduler.tick();
                },
            ));
        }

        tracing::info!(loops = handles.len(), "fleet maintenance started");
    }

    /// Stop the maintenance loops
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.maintenance.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("fleet maintenance stopped");
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn sweep_inactive(bus: &MessageBus, timeout: Duration) -> Vec<OfflineAgent> {
    let swept = bus.check_inactive(timeout);
    if !swept.is_empty() {
        let abandoned = swept.iter().filter(|a| a.abandoned_task.is_some()).count();
        tracing::info!(offline = swept.len(), abandoned, "liveness sweep");
    }
    swept
}

fn cleanup(bus: &MessageBus, scheduler: &TaskScheduler, retention_ms: u64) -> usize {
    let purged = bus.cleanup(Duration::from_millis(retention_ms));
    let pruned = scheduler.prune_terminal();
    purged + pruned
}

fn spawn_periodic<F>(
    name: &'static str,
    period_ms: u64,
    shutdown: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    let period = Duration::from_millis(period_ms.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => job(),
                _ = shutdown.cancelled() => {
                    tracing::debug!(task = name, "maintenance loop stopped");
                    break;
                }
            }
        }
    })
}

/// Brings a reconnected agent back into scheduling, and takes a
/// permanently failed one out.
struct FleetRejoin {
    directory: Arc<AgentDirectory>,
    scheduler: Arc<TaskScheduler>,
}

impl ReconnectObserver for FleetRejoin {
    fn on_reconnected(&self, agent_id: &str) {
        match self.directory.heartbeat(agent_id) {
            Ok(_) => {
                tracing::info!(agent_id, "agent rejoined fleet");
                self.scheduler.tick();
            }
            Err(e) => tracing::warn!(agent_id, error = %e, "reconnected agent not registered"),
        }
    }

    /// The held task is released with the agent already offline, so its
    /// retry goes to someone else
    fn on_permanent_failure(&self, agent_id: &str, class: ErrorClass) {
        let update = AgentUpdate::new()
            .with_status(AgentStatus::Offline)
            .with_current_task(None);
        match self.directory.update_status(agent_id, update) {
            Ok(()) => tracing::warn!(agent_id, class = %class, "agent removed from scheduling"),
            Err(e) => tracing::debug!(agent_id, error = %e, "failed agent not registered"),
        }
    }
}
