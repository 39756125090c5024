//! Runtime support for the acquisition pipeline

pub mod errors;
pub mod handoff;
pub mod node;
pub mod pipeline;
pub mod scheduler;
pub mod stats;
pub mod wake;
pub mod watchdog;

pub use errors::{HandoffError, WorkError, WorkResult};
pub use handoff::{HandoffPolicy, SampleConsumer, SamplePublisher};
pub use node::ProcessNode;
pub use pipeline::{AcquisitionPipeline, PipelineConfig};
pub use scheduler::Scheduler;
pub use stats::{CounterSnapshot, Counters};
pub use wake::{Trigger, WakeReceiver};
pub use watchdog::{StallReport, Watchdog};
