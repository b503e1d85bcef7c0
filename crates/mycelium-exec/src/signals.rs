//! Cooperative stop handling.
//!
//! First interrupt/terminate signal: set a process-wide stop flag that the
//! engines read between task attempts and before starting new batches;
//! in-flight attempts finish normally. Second signal: exit immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared stop flag plus the cancellation token handed to workers.
#[derive(Debug, Clone)]
pub struct StopSignal {
    stopping: Arc<AtomicBool>,
    signal_name: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            stopping: Arc::new(AtomicBool::new(false)),
            signal_name: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    /// Record a stop request. Engines observe it at their next check point.
    pub fn request_stop(&self, signal: &str) {
        self.stopping.store(true, Ordering::SeqCst);
        *self.signal_name.lock().expect("signal mutex poisoned") = Some(signal.to_string());
        self.cancel.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Name of the signal that requested the stop, if any.
    pub fn signal_name(&self) -> Option<String> {
        self.signal_name
            .lock()
            .expect("signal mutex poisoned")
            .clone()
    }

    /// Token fired on stop; workers may select against it at their own
    /// suspension points.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Listen for SIGINT/SIGTERM and drive the stop flag. The second signal
/// escalates to immediate process exit.
pub fn spawn_signal_listener(stop: StopSignal) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        let name = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        info!(signal = name, "stop requested; finishing in-flight tasks");
        stop.request_stop(name);

        // Second signal: exit now.
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        warn!("second signal received; exiting immediately");
        std::process::exit(130);
    });
}
