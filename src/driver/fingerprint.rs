//! Periodic driver health and capability reporting.
//!
//! The host schedules work based on these reports, in particular the
//! available-slot attribute: the virtualization framework underneath tart
//! refuses to run more than two VMs per host, so the driver counts running
//! VMs and publishes how many slots remain. Enforcement happens in the host
//! scheduler, not by rejecting starts here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::DriverConfig;
use crate::driver::monitor::cancelled;
use crate::plugin::{AttributeValue, Fingerprint, HealthState};
use crate::virt::{Virtualizer, VmState};

/// The framework mandates at most this many concurrently running VMs per
/// host; starting one more fails outright.
pub const MAX_VM_SLOTS: i64 = 2;

/// Interval between fingerprint emissions.
pub const FINGERPRINT_PERIOD: Duration = Duration::from_secs(30);

/// Bound on the tool probes inside one fingerprint pass.
const FINGERPRINT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Attribute key marking driver presence.
const ATTR_DRIVER: &str = "driver.tart";

/// Attribute key carrying the tool version.
const ATTR_VERSION: &str = "driver.tart.version";

/// Attribute key carrying the free VM slot count.
const ATTR_AVAILABLE_SLOTS: &str = "driver.tart.available_slots";

/// Free slots for a given number of running VMs, clamped at zero.
///
/// A negative raw value means VMs were started outside this driver's
/// management; report zero rather than a nonsense count.
pub fn available_slots(running: usize) -> i64 {
    let slots = MAX_VM_SLOTS - running as i64;
    if slots < 0 {
        warn!(
            running_vms = running,
            max_slots = MAX_VM_SLOTS,
            "more vms running than the framework ceiling allows"
        );
        return 0;
    }
    slots
}

/// Emit fingerprints on `tx` until shutdown. The first one goes out
/// immediately.
pub(crate) async fn run_fingerprint_loop(
    client: Arc<dyn Virtualizer>,
    config: Arc<parking_lot::RwLock<DriverConfig>>,
    tx: mpsc::Sender<Fingerprint>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(FINGERPRINT_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancelled(&mut shutdown) => {
                debug!("fingerprint loop stopping");
                return;
            }
            _ = tx.closed() => return,
        }

        let enabled = config.read().enabled;
        let fingerprint = build_fingerprint(client.as_ref(), enabled).await;
        if tx.send(fingerprint).await.is_err() {
            return;
        }
    }
}

/// Assemble one fingerprint.
pub(crate) async fn build_fingerprint(client: &dyn Virtualizer, enabled: bool) -> Fingerprint {
    let mut attributes = HashMap::new();
    attributes.insert(ATTR_DRIVER.to_string(), AttributeValue::Bool(true));

    if !enabled {
        attributes.insert(ATTR_AVAILABLE_SLOTS.to_string(), AttributeValue::Int(0));
        return Fingerprint {
            attributes,
            health: HealthState::Undetected,
            health_description: "disabled".to_string(),
        };
    }

    match tokio::time::timeout(FINGERPRINT_PROBE_TIMEOUT, client.available()).await {
        Ok(Ok(version)) => {
            attributes.insert(ATTR_VERSION.to_string(), AttributeValue::String(version));
        }
        Ok(Err(e)) => {
            warn!(error = %e, "virtualization tool not found");
            attributes.insert(ATTR_AVAILABLE_SLOTS.to_string(), AttributeValue::Int(0));
            return Fingerprint {
                attributes,
                health: HealthState::Undetected,
                health_description: "virtualization tool not found".to_string(),
            };
        }
        Err(_) => {
            warn!("virtualization tool version probe timed out");
            attributes.insert(ATTR_AVAILABLE_SLOTS.to_string(), AttributeValue::Int(0));
            return Fingerprint {
                attributes,
                health: HealthState::Undetected,
                health_description: "virtualization tool probe timed out".to_string(),
            };
        }
    }

    // Listing proves the tool actually works and yields the slot count.
    let vms = match tokio::time::timeout(FINGERPRINT_PROBE_TIMEOUT, client.list()).await {
        Ok(Ok(vms)) => vms,
        Ok(Err(e)) => {
            warn!(error = %e, "failed to list vms");
            attributes.insert(ATTR_AVAILABLE_SLOTS.to_string(), AttributeValue::Int(0));
            return Fingerprint {
                attributes,
                health: HealthState::Unhealthy,
                health_description: format!("failed to list vms: {}", e),
            };
        }
        Err(_) => {
            attributes.insert(ATTR_AVAILABLE_SLOTS.to_string(), AttributeValue::Int(0));
            return Fingerprint {
                attributes,
                health: HealthState::Unhealthy,
                health_description: "vm listing timed out".to_string(),
            };
        }
    };

    let running = vms
        .iter()
        .filter(|vm| vm.state == VmState::Running)
        .count();
    attributes.insert(
        ATTR_AVAILABLE_SLOTS.to_string(),
        AttributeValue::Int(available_slots(running)),
    );

    Fingerprint {
        attributes,
        health: HealthState::Healthy,
        health_description: "healthy".to_string(),
    }
}
