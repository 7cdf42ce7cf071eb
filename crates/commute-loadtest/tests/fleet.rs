mod common;

use common::{test_config, two_category_catalog, wait_until, FakeTransports};
use commute_loadtest::device::{DeviceState, LIFECYCLE};
use commute_loadtest::error::{DeviceError, LoadtestError};
use commute_loadtest::transport::BackendOp;
use commute_loadtest::{EventKind, Orchestrator, Update};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Collects updates until the fleet reports it has drained.
async fn updates_until_drained(updates: &mut broadcast::Receiver<Update>) -> Vec<Update> {
    let mut seen = Vec::new();
    loop {
        match updates.recv().await {
            Ok(Update::Drained) => {
                seen.push(Update::Drained);
                return seen;
            }
            Ok(update) => seen.push(update),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return seen,
        }
    }
}

#[tokio::test]
async fn fleet_runs_to_active_and_drains_on_shutdown() {
    let transports = FakeTransports::new();
    let orchestrator = Orchestrator::new(test_config(4), &two_category_catalog(), &transports).unwrap();

    let categories: Vec<_> = orchestrator
        .devices()
        .iter()
        .map(|d| d.assignment().category.clone())
        .collect();
    assert_eq!(categories.iter().filter(|c| *c == "a").count(), 2);
    assert_eq!(categories.iter().filter(|c| *c == "b").count(), 2);

    let mut updates = orchestrator.subscribe();
    let tasks = orchestrator.start().unwrap();

    let stats = Arc::clone(orchestrator.stats());
    wait_until(|| stats.active() == 4).await;
    for device in orchestrator.devices() {
        assert_eq!(device.state(), DeviceState::Active);
        assert_eq!(device.request_log().len(), LIFECYCLE.len());
    }

    orchestrator.shutdown();
    tasks.join().await;

    let seen = updates_until_drained(&mut updates).await;
    let count = |kind: EventKind| {
        seen.iter()
            .filter(|u| matches!(u, Update::Device(e) if e.kind == kind))
            .count()
    };
    assert_eq!(count(EventKind::Active), 4);
    assert_eq!(count(EventKind::Done), 4);
    assert_eq!(count(EventKind::Error), 0);

    assert_eq!(stats.active(), 0);
    assert_eq!(stats.errors(), 0);
    for device in orchestrator.devices() {
        assert_eq!(device.state(), DeviceState::Done);
        assert!(device.is_finished());
        assert_eq!(transports.calls_for(device.id()).last(), Some(&BackendOp::Logout));
    }
}

#[tokio::test]
async fn failed_step_is_isolated_to_its_device() {
    let transports = FakeTransports::failing(1, BackendOp::Authenticate, 500);
    let orchestrator = Orchestrator::new(test_config(4), &two_category_catalog(), &transports).unwrap();
    let tasks = orchestrator.start().unwrap();

    let stats = Arc::clone(orchestrator.stats());
    wait_until(|| stats.active() == 3 && stats.errors() == 1).await;

    let failed: Vec<_> = orchestrator
        .devices()
        .iter()
        .filter(|d| d.state() == DeviceState::Error)
        .collect();
    assert_eq!(failed.len(), 1);

    let device = failed[0];
    let error = device.error_message().unwrap();
    assert!(error.contains("authenticate"), "{error}");
    assert!(device.active_at().is_none());

    // Register device, register account, authenticate; nothing after the failure
    let log = device.request_log();
    assert_eq!(log.len(), 3);
    assert!(!log[2].ok);
    assert_eq!(log[2].status, Some(500));
    assert!(!transports.calls_for(device.id()).contains(&BackendOp::LinkDevice));

    orchestrator.shutdown();
    tasks.join().await;

    assert_eq!(stats.errors(), 1);
    assert_eq!(stats.active(), 0);
    let report = orchestrator.report();
    assert_eq!(report.count_in(DeviceState::Done), 3);
    assert_eq!(report.count_in(DeviceState::Error), 1);
}

#[tokio::test]
async fn shutdown_is_idempotent_under_concurrent_calls() {
    let transports = FakeTransports::new();
    let orchestrator = Orchestrator::new(test_config(2), &two_category_catalog(), &transports).unwrap();
    let mut updates = orchestrator.subscribe();
    let tasks = orchestrator.start().unwrap();

    let stats = Arc::clone(orchestrator.stats());
    wait_until(|| stats.active() == 2).await;

    let watcher = orchestrator.watch_termination(None);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let handle = orchestrator.shutdown_handle();
            tokio::spawn(async move { handle.shutdown() })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    orchestrator.shutdown();

    watcher.await.unwrap();
    tasks.join().await;

    let seen = updates_until_drained(&mut updates).await;
    let requested = seen
        .iter()
        .filter(|u| **u == Update::ShutdownRequested)
        .count();
    assert_eq!(requested, 1);
    assert_eq!(stats.active(), 0);
}

#[tokio::test]
async fn force_refresh_only_reaches_active_devices() {
    let transports = FakeTransports::new();
    let orchestrator = Orchestrator::new(test_config(2), &two_category_catalog(), &transports).unwrap();
    let tasks = orchestrator.start().unwrap();

    let stats = Arc::clone(orchestrator.stats());
    wait_until(|| stats.active() == 2).await;

    let id = orchestrator.devices()[0].id().to_string();
    orchestrator.force_refresh(&id).await.unwrap();
    assert!(transports.calls_for(&id).contains(&BackendOp::ForceRefresh));

    let err = orchestrator.force_refresh("loadtest-missing").await.unwrap_err();
    assert!(matches!(err, LoadtestError::UnknownDevice(_)));

    orchestrator.shutdown();
    tasks.join().await;

    let err = orchestrator.force_refresh(&id).await.unwrap_err();
    assert!(matches!(
        err,
        LoadtestError::Device(DeviceError::NotActive {
            state: DeviceState::Done,
            ..
        })
    ));
}

#[tokio::test]
async fn received_messages_feed_the_rolling_rate() {
    let transports = FakeTransports::new();
    let mut config = test_config(2);
    // Wide enough that the deltas stay in the window while the test asserts
    config.stats.window = 1000;
    let orchestrator = Orchestrator::new(config, &two_category_catalog(), &transports).unwrap();
    let tasks = orchestrator.start().unwrap();

    let stats = Arc::clone(orchestrator.stats());
    wait_until(|| stats.active() == 2).await;

    let device = Arc::clone(&orchestrator.devices()[1]);
    for payload in ["refresh", "brightness:40", "reboot"] {
        assert!(transports.deliver(device.id(), payload));
    }

    wait_until(|| stats.messages_total() == 3).await;
    assert_eq!(device.message_count(), 3);
    assert_eq!(device.messages()[1].payload, "brightness:40");
    assert!(stats.messages_per_sec() > 0.0);

    orchestrator.shutdown();
    tasks.join().await;
    assert_eq!(orchestrator.report().devices[1].messages, 3);
}
