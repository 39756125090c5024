//! Thread-per-node scheduler
//!
//! Spawns a dedicated, named thread for each node and calls `work()` in a
//! loop until the node reports `should_stop()`, returns
//! `WorkError::Shutdown`, fails, or the shared stop signal is raised.
//! Threads report completion over a channel so `wait()` can join them as
//! they finish instead of in spawn order.

use super::errors::WorkError;
use super::node::ProcessNode;
use super::watchdog::Watchdog;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver as StdReceiver, Sender as StdSender, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Sends the completion notice when the node thread exits, even by panic
struct CompletionNotice {
    tx: StdSender<String>,
    name: String,
}

impl Drop for CompletionNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(std::mem::take(&mut self.name));
    }
}

/// Runtime scheduler that executes the pipeline nodes
pub struct Scheduler {
    threads: Vec<(String, JoinHandle<()>)>,
    stop_signal: Arc<AtomicBool>,
    completion_tx: Option<StdSender<String>>,
    completion_rx: StdReceiver<String>,
    watchdog: Watchdog,
    watchdog_handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a new scheduler with watchdog monitoring
    pub fn new() -> io::Result<Self> {
        Self::with_watchdog_threshold(Watchdog::DEFAULT_THRESHOLD)
    }

    pub fn with_watchdog_threshold(threshold: Duration) -> io::Result<Self> {
        let (completion_tx, completion_rx) = channel();
        let watchdog = Watchdog::with_threshold(threshold);
        let watchdog_handle = watchdog.start_monitoring_thread()?;
        info!(
            "Watchdog enabled - will report operations blocked >{:?}",
            threshold
        );
        Ok(Self {
            threads: Vec::new(),
            stop_signal: Arc::new(AtomicBool::new(false)),
            completion_tx: Some(completion_tx),
            completion_rx,
            watchdog,
            watchdog_handle: Some(watchdog_handle),
        })
    }

    /// Get a reference to the watchdog
    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Start a node in its own thread
    pub fn start_process(&mut self, mut node: Box<dyn ProcessNode>) -> io::Result<()> {
        let completion_tx = self.completion_tx.clone().ok_or_else(|| {
            io::Error::other("scheduler has already been waited on")
        })?;
        let stop_signal = Arc::clone(&self.stop_signal);
        let name = node.name().to_string();
        let thread_name = name.clone();

        debug!("Starting process node: {}", name);

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _notice = CompletionNotice {
                tx: completion_tx,
                name: thread_name.clone(),
            };
            let mut items_produced = 0usize;

            loop {
                if stop_signal.load(Ordering::Relaxed) || node.should_stop() {
                    break;
                }

                match node.work() {
                    Ok(n) => {
                        items_produced += n;
                    }
                    Err(WorkError::Shutdown) => {
                        debug!("[{}] Shutdown requested", thread_name);
                        break;
                    }
                    Err(e) => {
                        error!("[{}] Work error: {}", thread_name, e);
                        break;
                    }
                }
            }

            info!(
                "[{}] Shutdown. Produced {} items.",
                thread_name, items_produced
            );

            // Drop the node to release its channel ends
            drop(node);
        })?;

        self.threads.push((name, handle));
        Ok(())
    }

    /// Signal all nodes to stop
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::Relaxed);
    }

    /// Wait for all node threads to complete, joining them as they finish
    pub fn wait(&mut self) {
        // Drop the main completion sender so the channel closes when all threads complete
        self.completion_tx = None;

        let total_threads = self.threads.len();
        let mut completed = 0;

        info!("Waiting for {} threads to complete...", total_threads);

        let mut threads_by_name: HashMap<String, JoinHandle<()>> =
            self.threads.drain(..).collect();

        while completed < total_threads {
            match self.completion_rx.recv() {
                Ok(thread_name) => {
                    completed += 1;
                    if let Some(handle) = threads_by_name.remove(&thread_name) {
                        match handle.join() {
                            Ok(_) => info!(
                                "[{}] Thread completed ({}/{})",
                                thread_name, completed, total_threads
                            ),
                            Err(e) => error!(
                                "[{}] Thread panicked ({}/{}): {:?}",
                                thread_name, completed, total_threads, e
                            ),
                        }
                    }
                }
                Err(_) => {
                    // Channel closed - all thread senders dropped
                    break;
                }
            }
        }

        info!("All {} threads completed", total_threads);

        self.watchdog.stop();
        if let Some(handle) = self.watchdog_handle.take() {
            let _ = handle.join();
        }
    }

    /// Get the number of running threads
    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Get the names of all running threads
    pub fn thread_names(&self) -> Vec<String> {
        self.threads.iter().map(|(name, _)| name.clone()).collect()
    }
}
