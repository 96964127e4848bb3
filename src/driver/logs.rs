//! Guest log streaming over the remote shell.
//!
//! The guest takes a while to become reachable after launch, so the stream
//! supervisor is an explicit retry state machine: resolve the address (a
//! bounded number of attempts), stream until the connection drops, back off
//! and reconnect. Connection drops are retried forever with a capped
//! doubling backoff; only cancellation ends the loop, never attempt
//! exhaustion. Address resolution is the one bounded phase: a guest that
//! never gets an address will never stream, so after the bound the stream
//! is marked permanently failed for the task.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::driver::monitor::cancelled;
use crate::error::Error;
use crate::virt::{ExecOptions, Virtualizer, VmConfig};

/// Attempts at resolving the guest address before giving up for good.
const ADDRESS_RESOLVE_ATTEMPTS: u32 = 5;

/// Delay between address resolution attempts.
const ADDRESS_RESOLVE_DELAY: Duration = Duration::from_secs(2);

/// Initial reconnect backoff after a dropped stream.
const STREAM_BACKOFF_START: Duration = Duration::from_secs(1);

/// Reconnect backoff ceiling.
const STREAM_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// The long-lived in-guest command whose combined output becomes the task's
/// log stream.
const LOG_STREAM_COMMAND: &[&str] = &["/usr/bin/log", "stream", "--style", "syslog", "--level=info"];

/// Supervisor phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Resolving the guest address / establishing the session.
    Connecting,
    /// Session established, output flowing into the task's sinks.
    Streaming,
    /// Session dropped; waiting out the backoff before reconnecting.
    BackingOff,
}

/// Move the state machine, logging the transition.
fn transition(vm_name: &str, state: &mut StreamState, to: StreamState) {
    if *state != to {
        debug!(vm = %vm_name, from = ?*state, to = ?to, "log stream state change");
    }
    *state = to;
}

/// Stream guest logs into the task's stdout/stderr files until the stream
/// ends cleanly, address resolution gives up, or cancellation fires.
pub(crate) async fn stream_guest_logs(
    client: Arc<dyn Virtualizer>,
    config: VmConfig,
    cancel: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
) {
    let vm_name = config.vm_name();
    let mut state = StreamState::Connecting;
    let mut address_failures = 0u32;
    let mut backoff = STREAM_BACKOFF_START;

    // Exec sessions take a single cancellation signal; merge ours into one.
    let (exec_cancel_tx, exec_cancel_rx) = watch::channel(false);
    {
        let mut cancel = cancel.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled(&mut cancel) => {}
                _ = cancelled(&mut shutdown) => {}
            }
            let _ = exec_cancel_tx.send(true);
        });
    }

    let mut cancel = cancel;
    let mut shutdown = shutdown;

    loop {
        if *cancel.borrow() || *shutdown.borrow() {
            return;
        }

        let (stdout, stderr) = match (
            append_sink(&config.spec.stdout_path),
            append_sink(&config.spec.stderr_path),
        ) {
            (Ok(stdout), Ok(stderr)) => (stdout, stderr),
            (Err(e), _) | (_, Err(e)) => {
                warn!(vm = %vm_name, error = %e, "cannot open log sinks, giving up on log streaming");
                return;
            }
        };

        transition(&vm_name, &mut state, StreamState::Streaming);

        let opts = ExecOptions::buffered(
            LOG_STREAM_COMMAND.iter().map(|s| s.to_string()).collect(),
            stdout,
            stderr,
        )
        .with_cancel(exec_cancel_rx.clone());

        match client.exec(&config, opts).await {
            Ok(_) => {
                // The stream command ran and ended; the VM is going away.
                info!(vm = %vm_name, "guest log stream ended");
                return;
            }
            Err(Error::VmAddressUnavailable { reason, .. }) => {
                address_failures += 1;
                if address_failures >= ADDRESS_RESOLVE_ATTEMPTS {
                    warn!(
                        vm = %vm_name,
                        attempts = address_failures,
                        reason = %reason,
                        "guest address never resolved, log streaming permanently failed"
                    );
                    return;
                }
                transition(&vm_name, &mut state, StreamState::Connecting);
                debug!(
                    vm = %vm_name,
                    attempt = address_failures,
                    "guest address not resolvable yet, will retry"
                );
                if sleep_unless_cancelled(ADDRESS_RESOLVE_DELAY, &mut cancel, &mut shutdown).await {
                    return;
                }
            }
            Err(e) => {
                // Connected before, or failed mid-session: retry forever
                // with capped doubling.
                address_failures = 0;
                transition(&vm_name, &mut state, StreamState::BackingOff);
                warn!(vm = %vm_name, error = %e, backoff = ?backoff, "log streaming failed, will retry");
                if sleep_unless_cancelled(backoff, &mut cancel, &mut shutdown).await {
                    return;
                }
                backoff = (backoff * 2).min(STREAM_BACKOFF_CAP);
            }
        }
    }
}

/// Open a log file for appending, as a boxed sink.
fn append_sink(path: &Path) -> std::io::Result<Box<dyn std::io::Write + Send>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(Box::new(file))
}

/// Sleep, returning true when cancellation fired instead.
async fn sleep_unless_cancelled(
    duration: Duration,
    cancel: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancelled(cancel) => true,
        _ = cancelled(shutdown) => true,
    }
}
