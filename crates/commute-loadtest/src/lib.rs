//! Simulated device fleet load generator for the CommuteLive backend.
//!
//! Each simulated device runs the same onboarding a physical display does:
//! it registers, creates an account, logs in, links itself, pushes and reads
//! back a transit-stop configuration, then connects to the MQTT broker and
//! listens on its command topic until shutdown.
//!
//! # Components
//! - [`distribution`]: splits the fleet across workload categories
//! - [`device`]: per-device state and the lifecycle actor
//! - [`events`]: the fan-in channel from actors to the aggregator
//! - [`stats`]: live counters and the rolling message rate
//! - [`orchestrator`]: launch, termination watch and idempotent shutdown
//!
//! # Usage
//! ```bash
//! # 20 devices, half CTA and half MTA, for five minutes
//! LOADTEST_SERVER_URL=https://staging.example.com \
//!     commute-loadtest --devices 20 --providers cta=50,mta=50 --duration 300
//! ```

pub mod catalog;
pub mod config;
pub mod device;
pub mod distribution;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod report;
pub mod stats;
pub mod transport;

pub use catalog::{StaticCatalog, Target, WorkloadCatalog};
pub use config::Config;
pub use device::{Device, DeviceState};
pub use error::{LoadtestError, Result};
pub use events::{Event, EventKind, Update};
pub use orchestrator::{FleetTasks, Orchestrator, ShutdownHandle};
pub use report::FleetReport;
pub use stats::Stats;
pub use transport::{NetworkTransports, TransportFactory};
