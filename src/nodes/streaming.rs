//! Streaming consumer and downstream transports
//!
//! The consumer takes decoded samples from the hand-off and pushes them to a
//! [`Transport`] as 3-byte big-endian words per channel. Without a connected
//! peer samples are discarded. Send failures are logged and counted but never
//! retried: a late sample is worth less than the next one.

use super::types::{BYTES_PER_CHANNEL, DecodedSample, MAX_CHANNELS};
use crate::runtime::handoff::SampleConsumer;
use crate::runtime::node::{ProcessNode, WorkResult};
use crate::runtime::stats::{Counters, bump};
use crate::runtime::watchdog::WatchdogHandle;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, trace, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No peer connected")]
    NotConnected,

    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Short send: {sent} of {expected} bytes")]
    Short { sent: usize, expected: usize },
}

/// Downstream sink for encoded samples
pub trait Transport: Send {
    fn is_connected(&self) -> bool;

    /// Send one encoded sample
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        (**self).send(payload)
    }
}

/// One datagram per sample to a single peer
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl UdpTransport {
    /// Bind the local socket; no peer yet
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        info!("UDP transport bound to {}", socket.local_addr()?);
        Ok(Self { socket, peer: None })
    }

    pub fn connect(&mut self, peer: SocketAddr) {
        info!("UDP transport streaming to {}", peer);
        self.peer = Some(peer);
    }

    pub fn disconnect(&mut self) {
        if let Some(peer) = self.peer.take() {
            info!("UDP transport disconnected from {}", peer);
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let peer = self.peer.ok_or(TransportError::NotConnected)?;
        let sent = self.socket.send_to(payload, peer)?;
        if sent != payload.len() {
            return Err(TransportError::Short {
                sent,
                expected: payload.len(),
            });
        }
        Ok(())
    }
}

pub struct StreamingConsumer<T> {
    name: String,
    consumer: SampleConsumer,
    transport: T,
    counters: Arc<Counters>,
    send_watch: Option<WatchdogHandle>,
    buffer: [u8; MAX_CHANNELS * BYTES_PER_CHANNEL],
}

impl<T: Transport> StreamingConsumer<T> {
    pub fn new(consumer: SampleConsumer, transport: T, counters: Arc<Counters>) -> Self {
        Self {
            name: "streaming".to_string(),
            consumer,
            transport,
            counters,
            send_watch: None,
            buffer: [0; MAX_CHANNELS * BYTES_PER_CHANNEL],
        }
    }

    pub fn with_watchdog(mut self, handle: WatchdogHandle) -> Self {
        self.send_watch = Some(handle);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Deliver one sample, or drop it. Returns true if it was sent.
    pub fn deliver(&mut self, sample: &DecodedSample) -> bool {
        if !self.transport.is_connected() {
            bump(&self.counters.samples_discarded);
            trace!("[{}] No peer, sample {} discarded", self.name, sample.sequence);
            return false;
        }

        let Some(len) = sample.encode_wire(&mut self.buffer) else {
            return false;
        };

        let _guard = self.send_watch.as_ref().map(WatchdogHandle::guard);
        match self.transport.send(&self.buffer[..len]) {
            Ok(()) => {
                bump(&self.counters.samples_sent);
                true
            }
            Err(e) => {
                bump(&self.counters.transport_errors);
                warn!("[{}] Send of sample {} failed: {}", self.name, sample.sequence, e);
                false
            }
        }
    }
}

impl<T: Transport> ProcessNode for StreamingConsumer<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn work(&mut self) -> WorkResult<usize> {
        let sample = self.consumer.recv()?;
        Ok(usize::from(self.deliver(&sample)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::errors::WorkError;
    use crate::runtime::handoff::{self, HandoffPolicy};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recording {
        connected: Arc<Mutex<bool>>,
        fail: Arc<Mutex<bool>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Transport for Recording {
        fn is_connected(&self) -> bool {
            *self.connected.lock().unwrap()
        }

        fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
            if *self.fail.lock().unwrap() {
                return Err(TransportError::Io(io::Error::other("link down")));
            }
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn sample(sequence: u64, values: &[i32]) -> DecodedSample {
        DecodedSample::new(sequence, values).unwrap()
    }

    #[test]
    fn test_connected_transport_receives_encoded_sample() {
        let counters = Arc::new(Counters::new());
        let (mut publisher, consumer) =
            handoff::channel(HandoffPolicy::queue(4), Arc::clone(&counters));
        let transport = Recording::default();
        *transport.connected.lock().unwrap() = true;
        let mut node = StreamingConsumer::new(consumer, transport.clone(), Arc::clone(&counters));

        publisher.publish(sample(0, &[1, -1])).unwrap();
        assert_eq!(node.work().unwrap(), 1);
        assert_eq!(
            *transport.sent.lock().unwrap(),
            vec![vec![0x00, 0x00, 0x01, 0xFF, 0xFF, 0xFF]]
        );

        drop(publisher);
        assert!(matches!(node.work(), Err(WorkError::Shutdown)));
        assert_eq!(counters.snapshot().samples_sent, 1);
    }

    #[test]
    fn test_disconnected_transport_discards() {
        let counters = Arc::new(Counters::new());
        let (mut publisher, consumer) =
            handoff::channel(HandoffPolicy::overwrite_latest(), Arc::clone(&counters));
        let transport = Recording::default();
        let mut node = StreamingConsumer::new(consumer, transport.clone(), Arc::clone(&counters));

        publisher.publish(sample(0, &[5])).unwrap();
        assert_eq!(node.work().unwrap(), 0);
        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(counters.snapshot().samples_discarded, 1);
    }

    #[test]
    fn test_send_failure_is_counted_not_retried() {
        let counters = Arc::new(Counters::new());
        let (_publisher, consumer) =
            handoff::channel(HandoffPolicy::queue(4), Arc::clone(&counters));
        let transport = Recording::default();
        *transport.connected.lock().unwrap() = true;
        *transport.fail.lock().unwrap() = true;
        let mut node = StreamingConsumer::new(consumer, transport.clone(), Arc::clone(&counters));

        assert!(!node.deliver(&sample(3, &[1, 2, 3])));
        *transport.fail.lock().unwrap() = false;
        assert!(node.deliver(&sample(4, &[1, 2, 3])));
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert_eq!(counters.snapshot().transport_errors, 1);
    }

    #[test]
    fn test_udp_transport_round_trip() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(&[1, 2, 3]),
            Err(TransportError::NotConnected)
        ));

        transport.connect(receiver.local_addr().unwrap());
        transport.send(&[0x7F, 0xFF, 0xFF]).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x7F, 0xFF, 0xFF]);
        assert_eq!(from, transport.local_addr().unwrap());

        transport.disconnect();
        assert_eq!(transport.peer(), None);
    }
}
