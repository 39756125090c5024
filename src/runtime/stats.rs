//! Lock-free pipeline counters
//!
//! Every drop, coalesce and failure on the real-time path is counted here
//! instead of being reported synchronously.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub(crate) wakes_posted: AtomicU64,
    pub(crate) wakes_coalesced: AtomicU64,
    pub(crate) frames_read: AtomicU64,
    pub(crate) bus_errors: AtomicU64,
    pub(crate) status_errors: AtomicU64,
    pub(crate) samples_published: AtomicU64,
    pub(crate) samples_dropped: AtomicU64,
    pub(crate) samples_overwritten: AtomicU64,
    pub(crate) samples_sent: AtomicU64,
    pub(crate) samples_discarded: AtomicU64,
    pub(crate) transport_errors: AtomicU64,
}

#[inline(always)]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            wakes_posted: load(&self.wakes_posted),
            wakes_coalesced: load(&self.wakes_coalesced),
            frames_read: load(&self.frames_read),
            bus_errors: load(&self.bus_errors),
            status_errors: load(&self.status_errors),
            samples_published: load(&self.samples_published),
            samples_dropped: load(&self.samples_dropped),
            samples_overwritten: load(&self.samples_overwritten),
            samples_sent: load(&self.samples_sent),
            samples_discarded: load(&self.samples_discarded),
            transport_errors: load(&self.transport_errors),
        }
    }
}

/// Point-in-time copy of [`Counters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Data-ready edges that posted a wake
    pub wakes_posted: u64,
    /// Edges that found a wake already pending
    pub wakes_coalesced: u64,
    pub frames_read: u64,
    /// Frames lost to a failed transfer
    pub bus_errors: u64,
    /// Frames whose status header was not `1100`
    pub status_errors: u64,
    pub samples_published: u64,
    /// Samples lost to a full hand-off queue
    pub samples_dropped: u64,
    /// Unread samples replaced in the overwrite slot
    pub samples_overwritten: u64,
    pub samples_sent: u64,
    /// Samples dropped because no peer was connected
    pub samples_discarded: u64,
    pub transport_errors: u64,
}

impl std::fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "wakes {} (+{} coalesced), frames {} ({} bus errors, {} bad status), \
             published {} (dropped {}, overwritten {}), sent {} (discarded {}, {} transport errors)",
            self.wakes_posted,
            self.wakes_coalesced,
            self.frames_read,
            self.bus_errors,
            self.status_errors,
            self.samples_published,
            self.samples_dropped,
            self.samples_overwritten,
            self.samples_sent,
            self.samples_discarded,
            self.transport_errors
        )
    }
}
