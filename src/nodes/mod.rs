//! Pipeline nodes and the frame/sample types they exchange

pub mod acquisition;
pub mod decoder;
pub mod drdy;
pub mod streaming;
pub mod types;

pub use acquisition::{AcquisitionWorker, FrameSource};
pub use decoder::{Baseline, SampleDecoder, decode_frame, sign_extend_24};
pub use drdy::{DataReadyLine, DrdyListener, LineFault, PolledDataReady};
pub use streaming::{StreamingConsumer, Transport, TransportError, UdpTransport};
pub use types::{DecodedSample, FrameGeometry, FrameStatus, RawFrame};
