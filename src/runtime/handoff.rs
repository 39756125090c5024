//! Sample hand-off between the acquisition worker and the streaming consumer
//!
//! One policy per pipeline:
//!
//! - **OverwriteLatest**: a single mutex-guarded slot. Publishing replaces
//!   whatever is there, so the consumer always sees the freshest sample and
//!   intermediate ones are lost (and counted).
//! - **Queue**: FIFO over a fixed-capacity ring allocated when the channel is
//!   created. Publishing never blocks and never allocates; when the ring is
//!   full the sample is dropped and [`HandoffError::Full`] is returned.
//!
//! Single producer, single consumer: neither end is `Clone`.

use super::errors::{HandoffError, WorkError, WorkResult};
use super::stats::{Counters, bump};
use crate::nodes::types::DecodedSample;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffPolicy {
    OverwriteLatest {
        /// How often a blocking `recv` re-checks the slot
        poll_interval: Duration,
    },
    Queue {
        capacity: usize,
    },
}

impl HandoffPolicy {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn overwrite_latest() -> Self {
        HandoffPolicy::OverwriteLatest {
            poll_interval: Duration::from_millis(1),
        }
    }

    pub fn queue(capacity: usize) -> Self {
        HandoffPolicy::Queue { capacity }
    }

    pub fn validate(&self) -> Result<(), String> {
        match *self {
            HandoffPolicy::Queue { capacity: 0 } => {
                Err("hand-off queue capacity must be at least 1".to_string())
            }
            HandoffPolicy::OverwriteLatest { poll_interval } if poll_interval.is_zero() => {
                Err("overwrite poll interval must be non-zero".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl Default for HandoffPolicy {
    fn default() -> Self {
        HandoffPolicy::queue(Self::DEFAULT_CAPACITY)
    }
}

struct LatestSlot {
    sample: Mutex<Option<DecodedSample>>,
    closed: AtomicBool,
}

impl LatestSlot {
    fn take(&self) -> Option<DecodedSample> {
        self.sample
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn replace(&self, sample: DecodedSample) -> Option<DecodedSample> {
        self.sample
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(sample)
    }
}

/// Create the hand-off for `policy`
pub fn channel(policy: HandoffPolicy, counters: Arc<Counters>) -> (SamplePublisher, SampleConsumer) {
    match policy {
        HandoffPolicy::OverwriteLatest { poll_interval } => {
            let slot = Arc::new(LatestSlot {
                sample: Mutex::new(None),
                closed: AtomicBool::new(false),
            });
            (
                SamplePublisher {
                    inner: PublisherInner::Latest(Arc::clone(&slot)),
                    counters,
                },
                SampleConsumer {
                    inner: ConsumerInner::Latest {
                        slot,
                        poll_interval,
                    },
                },
            )
        }
        HandoffPolicy::Queue { capacity } => {
            let capacity = capacity.max(1);
            let (tx, rx) = bounded(capacity);
            debug!("Hand-off ring allocated with {} slots", capacity);
            (
                SamplePublisher {
                    inner: PublisherInner::Queue {
                        tx: Some(tx),
                        capacity,
                    },
                    counters,
                },
                SampleConsumer {
                    inner: ConsumerInner::Queue(rx),
                },
            )
        }
    }
}

enum PublisherInner {
    Latest(Arc<LatestSlot>),
    Queue {
        tx: Option<Sender<DecodedSample>>,
        capacity: usize,
    },
}

/// Producer end, owned by the acquisition worker
pub struct SamplePublisher {
    inner: PublisherInner,
    counters: Arc<Counters>,
}

impl SamplePublisher {
    /// Hand `sample` to the consumer without blocking
    pub fn publish(&mut self, sample: DecodedSample) -> Result<(), HandoffError> {
        match &self.inner {
            PublisherInner::Latest(slot) => {
                if slot.replace(sample).is_some() {
                    bump(&self.counters.samples_overwritten);
                }
            }
            PublisherInner::Queue { tx, capacity } => {
                let tx = tx.as_ref().ok_or(HandoffError::Closed)?;
                match tx.try_send(sample) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        bump(&self.counters.samples_dropped);
                        warn!(
                            "Hand-off full, dropped sample {} ({} slots)",
                            dropped.sequence, capacity
                        );
                        return Err(HandoffError::Full {
                            capacity: *capacity,
                        });
                    }
                    Err(TrySendError::Disconnected(_)) => return Err(HandoffError::Closed),
                }
            }
        }
        bump(&self.counters.samples_published);
        Ok(())
    }

    /// End the stream. The consumer drains what is left, then sees Shutdown.
    pub fn close(&mut self) {
        match &mut self.inner {
            PublisherInner::Latest(slot) => slot.closed.store(true, Ordering::Release),
            PublisherInner::Queue { tx, .. } => {
                tx.take();
            }
        }
    }
}

impl Drop for SamplePublisher {
    fn drop(&mut self) {
        self.close();
    }
}

enum ConsumerInner {
    Latest {
        slot: Arc<LatestSlot>,
        poll_interval: Duration,
    },
    Queue(Receiver<DecodedSample>),
}

/// Consumer end, owned by the streaming consumer
pub struct SampleConsumer {
    inner: ConsumerInner,
}

impl SampleConsumer {
    /// Take the next sample if one is ready. Shutdown once the publisher
    /// closed and nothing is left.
    pub fn consume(&self) -> WorkResult<Option<DecodedSample>> {
        match &self.inner {
            ConsumerInner::Latest { slot, .. } => {
                if let Some(sample) = slot.take() {
                    return Ok(Some(sample));
                }
                if slot.closed.load(Ordering::Acquire) {
                    // a publish may have landed between the take and the flag read
                    return slot.take().map(Some).ok_or(WorkError::Shutdown);
                }
                Ok(None)
            }
            ConsumerInner::Queue(rx) => match rx.try_recv() {
                Ok(sample) => Ok(Some(sample)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(WorkError::Shutdown),
            },
        }
    }

    /// Block until a sample is available
    pub fn recv(&self) -> WorkResult<DecodedSample> {
        match &self.inner {
            ConsumerInner::Latest { poll_interval, .. } => loop {
                if let Some(sample) = self.consume()? {
                    return Ok(sample);
                }
                thread::sleep(*poll_interval);
            },
            ConsumerInner::Queue(rx) => rx.recv().map_err(|_| WorkError::Shutdown),
        }
    }

    /// Block for at most `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> WorkResult<Option<DecodedSample>> {
        match &self.inner {
            ConsumerInner::Latest { poll_interval, .. } => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(sample) = self.consume()? {
                        return Ok(Some(sample));
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    thread::sleep((*poll_interval).min(deadline - now));
                }
            }
            ConsumerInner::Queue(rx) => match rx.recv_timeout(timeout) {
                Ok(sample) => Ok(Some(sample)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(WorkError::Shutdown),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sequence: u64) -> DecodedSample {
        DecodedSample::new(sequence, &[sequence as i32]).unwrap()
    }

    #[test]
    fn test_overwrite_keeps_only_latest() {
        let counters = Arc::new(Counters::new());
        let (mut publisher, consumer) =
            channel(HandoffPolicy::overwrite_latest(), Arc::clone(&counters));

        publisher.publish(sample(1)).unwrap();
        publisher.publish(sample(2)).unwrap();
        assert_eq!(consumer.consume().unwrap(), Some(sample(2)));
        assert_eq!(consumer.consume().unwrap(), None);

        let snap = counters.snapshot();
        assert_eq!(snap.samples_published, 2);
        assert_eq!(snap.samples_overwritten, 1);
    }

    #[test]
    fn test_queue_preserves_order() {
        let (mut publisher, consumer) =
            channel(HandoffPolicy::queue(4), Arc::new(Counters::new()));
        for seq in 1..=3 {
            publisher.publish(sample(seq)).unwrap();
        }
        let received: Vec<u64> = (0..3).map(|_| consumer.recv().unwrap().sequence).collect();
        assert_eq!(received, vec![1, 2, 3]);
        assert_eq!(consumer.consume().unwrap(), None);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let counters = Arc::new(Counters::new());
        let (mut publisher, consumer) = channel(HandoffPolicy::queue(2), Arc::clone(&counters));
        publisher.publish(sample(1)).unwrap();
        publisher.publish(sample(2)).unwrap();
        assert_eq!(
            publisher.publish(sample(3)),
            Err(HandoffError::Full { capacity: 2 })
        );

        assert_eq!(consumer.recv().unwrap().sequence, 1);
        publisher.publish(sample(4)).unwrap();
        assert_eq!(consumer.recv().unwrap().sequence, 2);
        assert_eq!(consumer.recv().unwrap().sequence, 4);

        let snap = counters.snapshot();
        assert_eq!(snap.samples_dropped, 1);
        assert_eq!(snap.samples_published, 3);
    }

    #[test]
    fn test_close_drains_then_shuts_down() {
        for policy in [HandoffPolicy::queue(8), HandoffPolicy::overwrite_latest()] {
            let (mut publisher, consumer) = channel(policy, Arc::new(Counters::new()));
            publisher.publish(sample(7)).unwrap();
            drop(publisher);
            assert_eq!(consumer.recv().unwrap().sequence, 7);
            assert!(matches!(consumer.recv(), Err(WorkError::Shutdown)));
        }
    }

    #[test]
    fn test_recv_blocks_until_published() {
        for policy in [HandoffPolicy::queue(8), HandoffPolicy::overwrite_latest()] {
            let (mut publisher, consumer) = channel(policy, Arc::new(Counters::new()));
            let handle = thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                publisher.publish(sample(42)).unwrap();
                publisher
            });
            assert_eq!(consumer.recv().unwrap().sequence, 42);
            drop(handle.join().unwrap());
        }
    }

    #[test]
    fn test_recv_timeout_expires() {
        let (_publisher, consumer) =
            channel(HandoffPolicy::overwrite_latest(), Arc::new(Counters::new()));
        let start = Instant::now();
        assert_eq!(consumer.recv_timeout(Duration::from_millis(15)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_policy_validation() {
        assert!(HandoffPolicy::queue(0).validate().is_err());
        assert!(HandoffPolicy::default().validate().is_ok());
        let zero = HandoffPolicy::OverwriteLatest {
            poll_interval: Duration::ZERO,
        };
        assert!(zero.validate().is_err());
    }
}
