//! tart-driver - VM task driver for cluster workload schedulers
//!
//! tart-driver lets a workload orchestrator manage virtual machines as
//! schedulable units of work. The host performs placement, restart policy,
//! and allocation bookkeeping; this driver turns declarative task
//! configuration into concrete VM lifecycle operations on one node via the
//! `tart` command-line tool, and reports state back through the fixed
//! plugin contract in [`plugin`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  host orchestrator (plugin RPC dispatch)    │
//! ├─────────────────────────────────────────────┤
//! │  Driver facade (plugin contract)            │
//! ├──────────────┬──────────────┬───────────────┤
//! │  TaskHandle  │  stats       │  guest logs   │
//! │  + registry  │  aggregator  │  (SSH retry)  │
//! ├──────────────┴──────────────┴───────────────┤
//! │  Virtualizer trait → tart CLI subprocesses  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! One logical task spans two loosely-coupled OS processes: the `tart run`
//! launcher and the hypervisor helper owning the VM's backing store. The
//! driver supervises both: waiting on the launcher, polling VM state, and
//! aggregating resource usage across every attributed process.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tart_driver::plugin::DriverPlugin;
//! use tart_driver::{Driver, DriverSchemas, TartClient};
//!
//! # async fn run() -> tart_driver::Result<()> {
//! let schemas = DriverSchemas::new();
//! let driver = Driver::new(Arc::new(TartClient::new()), schemas);
//!
//! // The host dispatches plugin calls onto the driver.
//! let mut fingerprints = driver.fingerprint();
//! let health = fingerprints.recv().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod disk;
pub mod driver;
pub mod error;
pub mod mount;
pub mod network;
pub mod platform;
pub mod plugin;
pub mod registry_auth;
pub mod schema;
pub mod stats;
pub mod task;
pub mod virt;

// Re-export main types for convenience
pub use config::{DriverConfig, TaskConfig};
pub use driver::Driver;
pub use error::{Error, Result};
pub use schema::DriverSchemas;
pub use virt::{TartClient, Virtualizer};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
