//! Fleet construction, launch and coordinated shutdown.
//!
//! The orchestrator owns the process-wide stop token. Every device's cancel
//! token is a child of it, so a single `cancel()` reaches the whole fleet and
//! cancelling again is a no-op.

use crate::catalog::WorkloadCatalog;
use crate::config::Config;
use crate::device::{Device, DeviceActor, DeviceIdentity};
use crate::distribution::assign_workloads;
use crate::error::{LoadtestError, Result};
use crate::events::{event_capacity, Event, Update, UPDATE_CAPACITY};
use crate::report::FleetReport;
use crate::stats::{Stats, StatsAggregator};
use crate::transport::TransportFactory;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Actors and channel ends waiting for [`Orchestrator::start`].
struct Pending {
    actors: Vec<DeviceActor>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
}

/// Requests fleet shutdown. Cheap to clone and safe to call from anywhere.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: CancellationToken,
    requested: Arc<AtomicBool>,
    updates: broadcast::Sender<Update>,
}

impl ShutdownHandle {
    /// Cancels every device. Only the first call has any effect.
    pub fn shutdown(&self) {
        if self.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down fleet");
        self.stop.cancel();
        let _ = self.updates.send(Update::ShutdownRequested);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        self.stop.cancelled().await;
    }
}

/// Runs a fleet of simulated devices.
pub struct Orchestrator {
    config: Config,
    devices: Arc<[Arc<Device>]>,
    stats: Arc<Stats>,
    shutdown: ShutdownHandle,
    pending: Mutex<Option<Pending>>,
}

impl Orchestrator {
    /// Validates `config`, distributes workloads and builds every device.
    ///
    /// Fails before anything runs if the distribution is invalid or a
    /// category has no targets.
    pub fn new(
        config: Config,
        catalog: &dyn WorkloadCatalog,
        transports: &dyn TransportFactory,
    ) -> Result<Self> {
        config.validate()?;

        let assignments = assign_workloads(
            &mut rand::thread_rng(),
            config.fleet.devices,
            &config.fleet.distribution,
            catalog,
        )?;

        let mut per_category: BTreeMap<&str, usize> = BTreeMap::new();
        for assignment in &assignments {
            *per_category.entry(assignment.category.as_str()).or_default() += 1;
        }
        info!("Workload distribution: {:?}", per_category);

        let stop = CancellationToken::new();
        let timeouts = config.timeouts();
        let mut devices = Vec::with_capacity(assignments.len());
        let mut actors = Vec::with_capacity(assignments.len());

        for assignment in assignments {
            let identity = DeviceIdentity::generate();
            let backend = transports.backend(&identity)?;
            let broker = transports.broker(&identity);
            let device = Device::new(identity, assignment, backend, timeouts, stop.child_token());
            actors.push(DeviceActor::new(Arc::clone(&device), broker));
            devices.push(device);
        }
        info!("Created {} devices", devices.len());

        let (events_tx, events_rx) = mpsc::channel(event_capacity(devices.len()));
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let stats = Arc::new(Stats::new(devices.len(), config.stats.window));

        Ok(Self {
            config,
            devices: Arc::from(devices),
            stats,
            shutdown: ShutdownHandle {
                stop,
                requested: Arc::new(AtomicBool::new(false)),
                updates,
            },
            pending: Mutex::new(Some(Pending {
                actors,
                events_tx,
                events_rx,
            })),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every device, in creation order.
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device(&self, device_id: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.id() == device_id)
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Subscribes to device events and stats ticks.
    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.shutdown.updates.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Launches every device actor and the event consumer.
    ///
    /// Can only be called once. The caller joins the returned tasks after
    /// requesting shutdown.
    pub fn start(&self) -> Result<FleetTasks> {
        let Pending {
            actors,
            events_tx,
            events_rx,
        } = self.pending.lock().take().ok_or(LoadtestError::AlreadyStarted)?;

        let aggregator = StatsAggregator::new(Arc::clone(&self.stats), Arc::clone(&self.devices));
        let events = tokio::spawn(pump_events(
            aggregator,
            events_rx,
            self.shutdown.updates.clone(),
            self.shutdown.stop.clone(),
            self.config.stats.tick_interval(),
        ));

        let mut devices = JoinSet::new();
        for actor in actors {
            devices.spawn(actor.run(events_tx.clone()));
        }
        // The channel closes once the last actor drops its sender
        drop(events_tx);

        info!("Started {} devices", devices.len());
        Ok(FleetTasks { devices, events })
    }

    /// Requests shutdown of every device. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_requested()
    }

    /// Arms a watcher that shuts the fleet down on SIGINT, SIGTERM, after
    /// `duration` (if set), or when shutdown is requested elsewhere.
    pub fn watch_termination(&self, duration: Option<Duration>) -> JoinHandle<()> {
        let handle = self.shutdown.clone();

        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for SIGINT: {}", e);
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            let elapsed = async {
                match duration {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = ctrl_c => info!("SIGINT received, shutting down..."),
                _ = terminate => info!("SIGTERM received, shutting down..."),
                _ = elapsed => info!("Run duration elapsed, shutting down..."),
                _ = handle.requested() => debug!("Shutdown already requested"),
            }

            handle.shutdown();
        })
    }

    /// Asks the backend to refresh one active device.
    pub async fn force_refresh(&self, device_id: &str) -> Result<()> {
        let device = self
            .device(device_id)
            .ok_or_else(|| LoadtestError::UnknownDevice(device_id.to_string()))?;
        device.force_refresh().await?;
        info!("Forced refresh of device {}", device.short_id());
        Ok(())
    }

    /// Final state of the fleet, for reporting and cleanup.
    pub fn report(&self) -> FleetReport {
        FleetReport::collect(&self.devices, &self.stats)
    }
}

/// Handles to the running fleet.
pub struct FleetTasks {
    devices: JoinSet<()>,
    events: JoinHandle<()>,
}

impl FleetTasks {
    /// Waits for every actor, then for the event consumer to drain.
    pub async fn join(mut self) {
        while let Some(result) = self.devices.join_next().await {
            if let Err(e) = result {
                error!("Device task failed: {}", e);
            }
        }
        if let Err(e) = self.events.await {
            error!("Event consumer failed: {}", e);
        }
    }
}

/// Single consumer of device events. Runs until every actor has finished.
async fn pump_events(
    mut aggregator: StatsAggregator,
    mut events: mpsc::Receiver<Event>,
    updates: broadcast::Sender<Update>,
    stop: CancellationToken,
    tick_interval: Duration,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    // A stalled consumer catches up instead of skipping samples
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    ticker.tick().await;

    let mut stopping = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    aggregator.apply(&event);
                    let _ = updates.send(Update::Device(event));
                }
                None => break,
            },
            _ = ticker.tick() => {
                aggregator.tick();
                let _ = updates.send(Update::Tick(Utc::now()));
            }
            _ = stop.cancelled(), if !stopping => {
                stopping = true;
                debug!("Stop requested, draining device events");
            }
        }
    }

    aggregator.tick();
    let stats = aggregator.stats();
    info!(
        "All devices finished: {} errors, {} messages",
        stats.errors(),
        stats.messages_total()
    );
    let _ = updates.send(Update::Drained);
}
