//! Stall watchdog for pipeline operations
//!
//! Low-overhead monitoring using atomic timestamps instead of locks.
//! Each watched operation (a frame transfer, a transport send) stores its
//! start time in an atomic, and a monitor thread periodically scans these
//! timestamps. A stall on an operation registered as fatal is recorded and
//! surfaces through the pipeline health check.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Timestamp in milliseconds since UNIX_EPOCH
#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Shared state for a single watched operation
struct OpState {
    /// Timestamp (ms since epoch) when current operation started, or 0 if idle
    last_op_start: AtomicU64,
    /// Track if we've already warned about this operation being blocked
    has_warned: AtomicBool,
    node_name: String,
    operation: String,
    resource: String,
    fatal: bool,
}

/// A stalled operation, as reported by [`Watchdog::stalled`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport {
    pub node: String,
    pub operation: String,
    pub resource: String,
    pub blocked: Duration,
}

/// Handle to an operation's watchdog state (held by the node doing the work)
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<OpState>,
}

impl WatchdogHandle {
    /// Mark the start of a blocking operation (stores current timestamp)
    #[inline(always)]
    pub fn start_operation(&self) {
        self.state.last_op_start.store(now_millis(), Ordering::Relaxed);
        self.state.has_warned.store(false, Ordering::Relaxed);
    }

    /// Mark the end of a blocking operation (clears timestamp to 0)
    #[inline(always)]
    pub fn finish_operation(&self) {
        if self.state.has_warned.load(Ordering::Relaxed) {
            info!(
                "UNBLOCKED: [{}] {} on '{}'",
                self.state.node_name, self.state.operation, self.state.resource
            );
            self.state.has_warned.store(false, Ordering::Relaxed);
        }
        self.state.last_op_start.store(0, Ordering::Relaxed);
    }

    /// RAII guard around one operation
    #[inline(always)]
    pub fn guard(&self) -> OperationGuard<'_> {
        OperationGuard::new(self)
    }
}

/// Shared watchdog state
#[derive(Clone)]
pub struct Watchdog {
    ops: Arc<Mutex<Vec<Weak<OpState>>>>,
    enabled: Arc<AtomicBool>,
    threshold: Duration,
    stalls: Arc<Mutex<Vec<StallReport>>>,
}

impl Watchdog {
    pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self::with_threshold(Self::DEFAULT_THRESHOLD)
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            ops: Arc::new(Mutex::new(Vec::new())),
            enabled: Arc::new(AtomicBool::new(true)),
            threshold,
            stalls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register an operation for monitoring. A stall on a `fatal` operation
    /// is kept for [`stalled`](Self::stalled).
    pub fn register(
        &self,
        node_name: &str,
        operation: &str,
        resource: &str,
        fatal: bool,
    ) -> WatchdogHandle {
        let state = Arc::new(OpState {
            last_op_start: AtomicU64::new(0),
            has_warned: AtomicBool::new(false),
            node_name: node_name.to_string(),
            operation: operation.to_string(),
            resource: resource.to_string(),
            fatal,
        });

        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&state));

        WatchdogHandle { state }
    }

    /// Check for operations blocked longer than the threshold
    pub fn check_for_blocked(&self) {
        let now = now_millis();
        let threshold_ms = self.threshold.as_millis() as u64;

        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);

        // Remove dead weak references and check live ones
        ops.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let start = state.last_op_start.load(Ordering::Relaxed);
            if start > 0 {
                let duration_ms = now.saturating_sub(start);
                // Only warn once per blocking operation
                if duration_ms > threshold_ms && !state.has_warned.swap(true, Ordering::Relaxed) {
                    let blocked = Duration::from_millis(duration_ms);
                    if state.fatal {
                        error!(
                            "STALLED: [{}] {} on '{}' for {:.1}s",
                            state.node_name,
                            state.operation,
                            state.resource,
                            blocked.as_secs_f64()
                        );
                        self.stalls
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(StallReport {
                                node: state.node_name.clone(),
                                operation: state.operation.clone(),
                                resource: state.resource.clone(),
                                blocked,
                            });
                    } else {
                        warn!(
                            "BLOCKED: [{}] {} on '{}' for {:.1}s",
                            state.node_name,
                            state.operation,
                            state.resource,
                            blocked.as_secs_f64()
                        );
                    }
                }
            }
            true
        });
    }

    /// First fatal stall seen so far
    pub fn stalled(&self) -> Option<StallReport> {
        self.stalls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }

    /// Start the watchdog monitoring thread
    pub fn start_monitoring_thread(&self) -> std::io::Result<JoinHandle<()>> {
        const TICK: Duration = Duration::from_millis(20);
        let watchdog = self.clone();
        let period = (self.threshold / 5).clamp(TICK, Duration::from_secs(1));
        thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                // Short ticks so stop() is noticed quickly
                let mut since_check = Duration::ZERO;
                loop {
                    thread::sleep(TICK);

                    if !watchdog.enabled.load(Ordering::Relaxed) {
                        break;
                    }

                    since_check += TICK;
                    if since_check >= period {
                        since_check = Duration::ZERO;
                        watchdog.check_for_blocked();
                    }
                }
            })
    }

    /// Stop the watchdog monitoring thread
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for tracking an operation - near-zero cost (just atomic stores)
pub struct OperationGuard<'a> {
    handle: &'a WatchdogHandle,
}

impl<'a> OperationGuard<'a> {
    #[inline(always)]
    pub fn new(handle: &'a WatchdogHandle) -> Self {
        handle.start_operation();
        Self { handle }
    }
}

impl Drop for OperationGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.handle.finish_operation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_stall_is_recorded_once() {
        let watchdog = Watchdog::with_threshold(Duration::from_millis(10));
        let handle = watchdog.register("acquisition", "transfer", "spi", true);

        let guard = handle.guard();
        thread::sleep(Duration::from_millis(30));
        watchdog.check_for_blocked();
        watchdog.check_for_blocked();
        drop(guard);

        let report = watchdog.stalled().unwrap();
        assert_eq!(report.node, "acquisition");
        assert_eq!(report.resource, "spi");
        assert!(report.blocked >= Duration::from_millis(10));
        assert_eq!(watchdog.stalls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_non_fatal_and_finished_operations_not_reported() {
        let watchdog = Watchdog::with_threshold(Duration::from_millis(10));
        let send = watchdog.register("consumer", "send", "udp", false);
        let transfer = watchdog.register("acquisition", "transfer", "spi", true);

        let _guard = send.guard();
        {
            let _t = transfer.guard();
        }
        thread::sleep(Duration::from_millis(30));
        watchdog.check_for_blocked();
        assert!(watchdog.stalled().is_none());
    }

    #[test]
    fn test_dropped_handles_are_pruned() {
        let watchdog = Watchdog::new();
        let handle = watchdog.register("n", "op", "r", false);
        drop(handle);
        watchdog.check_for_blocked();
        assert!(watchdog.ops.lock().unwrap().is_empty());
    }

    #[test]
    fn test_monitor_thread_stops() {
        let watchdog = Watchdog::with_threshold(Duration::from_millis(50));
        let handle = watchdog.start_monitoring_thread().unwrap();
        watchdog.stop();
        handle.join().unwrap();
    }
}
