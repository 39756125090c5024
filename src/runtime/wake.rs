//! Single-slot wake signal from the data-ready context to the worker
//!
//! The slot is a one-element crossbeam channel allocated up front. Posting
//! never blocks and never allocates: if a wake is already pending the new
//! edge is coalesced into it and counted.

use super::errors::{WorkError, WorkResult};
use super::stats::{Counters, bump};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};
use std::sync::Arc;
use std::time::Duration;

/// Create a wake slot
pub fn channel(counters: Arc<Counters>) -> (Trigger, WakeReceiver) {
    let (tx, rx) = bounded(1);
    (Trigger { tx, counters }, WakeReceiver { rx })
}

/// Posting side, safe to call from an interrupt-like context
#[derive(Clone, Debug)]
pub struct Trigger {
    tx: Sender<()>,
    counters: Arc<Counters>,
}

impl Trigger {
    /// Post a wake for one data-ready edge. Returns false when the edge was
    /// coalesced into a wake that is still pending.
    #[inline]
    pub fn fire(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => {
                bump(&self.counters.wakes_posted);
                true
            }
            Err(TrySendError::Full(())) => {
                bump(&self.counters.wakes_coalesced);
                false
            }
            Err(TrySendError::Disconnected(())) => false,
        }
    }

    /// Uncounted wake, used to make the worker re-check its stop flag
    pub(crate) fn nudge(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Waiting side, owned by the acquisition worker
pub struct WakeReceiver {
    rx: Receiver<()>,
}

impl WakeReceiver {
    /// Block until a wake is posted. Shutdown once every trigger is dropped.
    pub fn wait(&self) -> WorkResult<()> {
        self.rx.recv().map_err(|_| WorkError::Shutdown)
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning false
    pub fn wait_timeout(&self, timeout: Duration) -> WorkResult<bool> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(WorkError::Shutdown),
        }
    }

    /// Consume a pending wake without blocking
    pub fn try_take(&self) -> WorkResult<bool> {
        match self.rx.try_recv() {
            Ok(()) => Ok(true),
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => Err(WorkError::Shutdown),
        }
    }
}
