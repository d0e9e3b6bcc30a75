//! End-to-end scenarios across directory, scheduler, bus and resilience

use fleet_core::agents::{AgentQuery, AgentStatus};
use fleet_core::communication::MessageKind;
use fleet_core::config::{FleetConfig, ReconnectConfig};
use fleet_core::resilience::{
    AgentConnection, ChannelConnection, ConnectionState, ErrorClass, ResilienceEvent,
};
use fleet_core::scheduler::{FailOutcome, TaskStatus};
use fleet_core::Fleet;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn caps(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn mining_task_goes_to_mining_agent() {
    let fleet = Fleet::new(FleetConfig::default());
    let _farmer = fleet.register_agent("farmer", ["farming"]);
    let _miner = fleet.register_agent("miner", ["mining"]);

    let id = fleet
        .scheduler()
        .submit("mine", json!({"ore": "iron"}), 8, caps(&["mining"]));

    let task = fleet.scheduler().get_task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assigned_agent.as_deref(), Some("miner"));
    assert_eq!(fleet.directory().get("miner").unwrap().status, AgentStatus::Busy);
    assert_eq!(fleet.directory().get("farmer").unwrap().status, AgentStatus::Idle);
}

#[test]
fn single_agent_takes_urgent_task_first() {
    let fleet = Fleet::new(FleetConfig::default());
    let _agent = fleet.register_agent("solo", ["mining"]);
    let scheduler = fleet.scheduler();

    let urgent = scheduler.submit("mine", json!(null), 9, caps(&["mining"]));
    let routine = scheduler.submit("mine", json!(null), 5, caps(&["mining"]));

    assert_eq!(scheduler.get_task(urgent).unwrap().status, TaskStatus::Assigned);
    assert_eq!(scheduler.get_task(routine).unwrap().status, TaskStatus::Pending);
    assert_eq!(scheduler.pending_tasks().len(), 1);
}

#[test]
fn higher_priority_assigned_first_with_single_agent() {
    let fleet = Fleet::new(FleetConfig::default());
    let scheduler = fleet.scheduler();

    // Queue both before any agent exists so one pass sees them together
    let low = scheduler.submit("build", json!(null), 5, vec![]);
    let high = scheduler.submit("defend", json!(null), 9, vec![]);
    let _agent = fleet.register_agent("solo", ["building", "combat"]);

    assert_eq!(scheduler.get_task(high).unwrap().status, TaskStatus::Assigned);
    assert_eq!(scheduler.get_task(low).unwrap().status, TaskStatus::Pending);

    assert!(scheduler.complete(high, json!({"ok": true})).unwrap());
    assert!(!scheduler.complete(high, json!({"ok": true})).unwrap());
    assert_eq!(scheduler.get_task(low).unwrap().status, TaskStatus::Assigned);
}

#[test]
fn broadcast_skips_excluded_agent() {
    let fleet = Fleet::new(FleetConfig::default());
    let mut a = fleet.register_agent("A", ["mining"]);
    let mut b = fleet.register_agent("B", ["mining"]);
    let mut c = fleet.register_agent("C", ["farming"]);

    let delivered = fleet.bus().broadcast(
        MessageKind::ResourceFound {
            resource: "diamond".to_string(),
            position: None,
            quantity: Some(4),
        },
        Some("A"),
    );

    assert_eq!(delivered, 2);
    assert_eq!(a.drain().len(), 0);
    assert_eq!(b.drain().len(), 1);
    assert_eq!(c.drain().len(), 1);
}

#[test]
fn retry_bound_limits_task_instances() {
    let fleet = Fleet::new(FleetConfig::default());
    let _agent = fleet.register_agent("a", ["mining"]);
    let scheduler = fleet.scheduler();

    let mut id = scheduler.submit("mine", json!(null), 3, caps(&["mining"]));
    let mut instances = 1;
    while let FailOutcome::Requeued(next) = scheduler.fail(id, "pickaxe broke").unwrap() {
        id = next;
        instances += 1;
    }

    assert_eq!(instances, 4);
    assert_eq!(scheduler.stats().total_retried, 3);
    assert_eq!(fleet.directory().get("a").unwrap().status, AgentStatus::Idle);
}

#[test]
fn silent_agent_excluded_until_heartbeat() {
    let fleet = Fleet::new(FleetConfig::default());
    let _quiet = fleet.register_agent("quiet", ["mining"]);
    std::thread::sleep(Duration::from_millis(20));
    let _loud = fleet.register_agent("loud", ["farming"]);

    let swept = fleet.bus().check_inactive(Duration::from_millis(10));
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].agent_id, "quiet");

    let id = fleet
        .scheduler()
        .submit("mine", json!(null), 5, caps(&["mining"]));
    assert_eq!(fleet.scheduler().get_task(id).unwrap().status, TaskStatus::Pending);
    assert!(fleet
        .directory()
        .query(&AgentQuery::idle().with_capabilities(["mining"]))
        .is_empty());

    assert!(fleet.heartbeat("quiet").unwrap());
    assert_eq!(fleet.scheduler().get_task(id).unwrap().status, TaskStatus::Assigned);
}

#[test]
fn inactivity_check_requeues_held_task() {
    let fleet = Fleet::new(FleetConfig::default());
    let _miner = fleet.register_agent("miner", ["mining"]);
    let first = fleet
        .scheduler()
        .submit("mine", json!(null), 5, caps(&["mining"]));
    std::thread::sleep(Duration::from_millis(20));

    let swept = fleet.bus().check_inactive(Duration::from_millis(10));
    assert_eq!(swept[0].abandoned_task, Some(first));
    assert_eq!(fleet.scheduler().get_task(first).unwrap().status, TaskStatus::Failed);

    assert!(fleet.heartbeat("miner").unwrap());
    let second = fleet
        .scheduler()
        .submit("mine", json!(null), 5, caps(&["mining"]));

    let assigned = fleet.scheduler().tasks_with_status(TaskStatus::Assigned);
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].retry_of, Some(first));
    assert_eq!(
        fleet.directory().get("miner").unwrap().current_task,
        Some(assigned[0].id)
    );
    assert_eq!(fleet.scheduler().get_task(second).unwrap().status, TaskStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn permanent_ban_emits_single_failure() {
    let fleet = Fleet::new(FleetConfig::default());
    let _bot = fleet.register_agent("bot", ["mining"]);

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let factory = move |_agent_id: String| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<Box<dyn AgentConnection>, _>(anyhow::anyhow!("ECONNREFUSED"))
        }
    };
    let manager = fleet.resilience_manager(Arc::new(factory));
    let mut events = manager.subscribe();

    let (signals, connection) = ChannelConnection::new();
    manager.attach("bot", connection.boxed()).unwrap();
    signals.spawned();
    signals.kicked("You have been banned permanently");
    signals.disconnected(Some("kicked"));

    tokio::time::sleep(Duration::from_secs(300)).await;

    let mut failures = Vec::new();
    let mut scheduled = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ResilienceEvent::PermanentlyFailed { class, .. } => failures.push(class),
            ResilienceEvent::ReconnectScheduled { .. } => scheduled += 1,
            _ => {}
        }
    }
    assert_eq!(failures, vec![ErrorClass::KickedPermanent]);
    assert_eq!(scheduled, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        manager.session("bot").unwrap().state,
        ConnectionState::PermanentlyFailed
    );
    assert_eq!(fleet.directory().get("bot").unwrap().status, AgentStatus::Offline);
}

#[tokio::test(start_paused = true)]
async fn reconnect_rejoins_fleet() {
    let config = FleetConfig {
        reconnect: ReconnectConfig {
            jitter: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let fleet = Fleet::new(config);
    let _bot = fleet.register_agent("bot", ["mining"]);

    let (conn_tx, mut conn_rx) = tokio::sync::mpsc::unbounded_channel();
    let factory = move |_agent_id: String| {
        let conn_tx = conn_tx.clone();
        async move {
            let (signals, connection) = ChannelConnection::new();
            let _ = conn_tx.send(signals);
            Ok::<_, anyhow::Error>(connection.boxed())
        }
    };
    let manager = fleet.resilience_manager(Arc::new(factory));
    let mut events = manager.subscribe();

    let (signals, connection) = ChannelConnection::new();
    manager.attach("bot", connection.boxed()).unwrap();
    signals.spawned();
    signals.error("read ETIMEDOUT");

    let scheduled = loop {
        if let ResilienceEvent::ReconnectScheduled { delay, .. } = events.recv().await.unwrap() {
            break delay;
        }
    };
    assert_eq!(scheduled, Duration::from_millis(1000));

    let fresh = conn_rx.recv().await.unwrap();
    fresh.spawned();
    loop {
        if let ResilienceEvent::Connected { .. } = events.recv().await.unwrap() {
            break;
        }
    }

    let session = manager.session("bot").unwrap();
    assert_eq!(session.state, ConnectionState::Connected);
    assert_eq!(session.attempt_count, 0);
    assert_eq!(session.stats.successful_reconnects, 1);

    // Back in the scheduling pool
    let id = fleet
        .scheduler()
        .submit("mine", json!(null), 1, caps(&["mining"]));
    assert_eq!(
        fleet.scheduler().get_task(id).unwrap().assigned_agent.as_deref(),
        Some("bot")
    );
    manager.shutdown();
}
