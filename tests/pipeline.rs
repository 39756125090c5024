//! End-to-end runs against the simulated chip

use ads1299::sim::SimulatedChip;
use ads1299::{
    AcquisitionPipeline, AdsError, Command, DeviceError, DeviceState, FrameGeometry,
    HandoffPolicy, PipelineConfig, Register, Transport, TransportError,
};
use embedded_hal::digital;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Connected transport that keeps every payload
#[derive(Clone, Default)]
struct Recording {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    /// While false, `send` holds the consumer inside the call
    gate: Option<Arc<AtomicBool>>,
    entered: Arc<AtomicUsize>,
}

impl Recording {
    fn gated() -> (Self, Arc<AtomicBool>) {
        let gate = Arc::new(AtomicBool::new(false));
        let transport = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (transport, gate)
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn samples(&self) -> Vec<Vec<i32>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|payload| payload.chunks(3).map(word).collect())
            .collect()
    }
}

impl Transport for Recording {
    fn is_connected(&self) -> bool {
        true
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

fn word(bytes: &[u8]) -> i32 {
    (i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0])) >> 8
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn standby_pipeline(
    chip: &SimulatedChip,
    channels: usize,
    config: PipelineConfig,
) -> AcquisitionPipeline<
    ads1299::sim::SimBus,
    ads1299::sim::SimPin,
    ads1299::sim::SimPin,
    ads1299::sim::SimDelay,
> {
    let mut device = chip.device(FrameGeometry::new(channels).unwrap());
    device.init().unwrap();
    device.power_up().unwrap();
    AcquisitionPipeline::new(device, config)
}

#[test]
fn test_four_channel_samples_arrive_in_order() {
    let chip = SimulatedChip::new(4);
    chip.set_signal(|index, channel| index as i32 * 10 - channel as i32 * 1_000);
    let mut pipeline = standby_pipeline(&chip, 4, PipelineConfig::new());
    let transport = Recording::default();
    let trigger = pipeline.start_external(transport.clone()).unwrap();

    for n in 1..=5 {
        trigger.fire();
        assert!(wait_until(|| transport.count() == n));
    }
    pipeline.stop().unwrap();

    let samples = transport.samples();
    assert_eq!(samples.len(), 5);
    for (k, sample) in samples.iter().enumerate() {
        let k = k as i32;
        assert_eq!(sample, &vec![k * 10, k * 10 - 1_000, k * 10 - 2_000, k * 10 - 3_000]);
    }
    let counters = pipeline.counters();
    assert_eq!(counters.frames_read, 5);
    assert_eq!(counters.samples_sent, 5);
    assert_eq!(counters.bus_errors, 0);
    assert_eq!(counters.status_errors, 0);
}

#[test]
fn test_selected_channels_only() {
    let chip = SimulatedChip::new(8);
    chip.set_signal(|_, channel| channel as i32 + 1);
    let config = PipelineConfig::new().with_selection([4, 2]);
    let mut pipeline = standby_pipeline(&chip, 8, config);
    let transport = Recording::default();
    let trigger = pipeline.start_external(transport.clone()).unwrap();

    trigger.fire();
    assert!(wait_until(|| transport.count() == 1));
    pipeline.stop().unwrap();

    assert_eq!(transport.sent.lock().unwrap()[0].len(), 6);
    assert_eq!(transport.samples(), vec![vec![4, 2]]);
}

#[test]
fn test_no_transfer_after_stop() {
    let chip = SimulatedChip::new(4);
    let mut pipeline = standby_pipeline(&chip, 4, PipelineConfig::new());
    let transport = Recording::default();
    let trigger = pipeline.start_external(transport.clone()).unwrap();
    assert!(chip.is_converting());
    assert!(chip.is_continuous());

    trigger.fire();
    assert!(wait_until(|| transport.count() == 1));
    pipeline.stop().unwrap();

    assert_eq!(pipeline.device_state(), DeviceState::Standby);
    assert!(!chip.is_converting());
    assert!(!chip.is_continuous());
    let commands = chip.commands();
    assert_eq!(
        commands[commands.len() - 2..],
        [Command::Stop, Command::StopContinuous]
    );

    let clocked = chip.frames_clocked();
    assert!(!trigger.fire());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(chip.frames_clocked(), clocked);
    assert_eq!(chip.unselected_transfers(), 0);
}

#[test]
fn test_bus_errors_are_counted_and_streaming_continues() {
    let chip = SimulatedChip::new(4);
    let mut pipeline = standby_pipeline(&chip, 4, PipelineConfig::new());
    let transport = Recording::default();
    let trigger = pipeline.start_external(transport.clone()).unwrap();

    chip.fail_next_transfers(2);
    for n in 1..=2 {
        trigger.fire();
        assert!(wait_until(|| pipeline.counters().bus_errors == n));
    }
    trigger.fire();
    assert!(wait_until(|| transport.count() == 1));
    pipeline.stop().unwrap();

    let counters = pipeline.counters();
    assert_eq!(counters.bus_errors, 2);
    assert_eq!(counters.frames_read, 1);
    assert_eq!(pipeline.device_state(), DeviceState::Standby);
}

#[test]
fn test_overwrite_policy_keeps_latest() {
    let chip = SimulatedChip::new(4);
    chip.set_signal(|index, _| index as i32);
    let config = PipelineConfig::new().with_handoff(HandoffPolicy::overwrite_latest());
    let mut pipeline = standby_pipeline(&chip, 4, config);
    let (transport, gate) = Recording::gated();
    let trigger = pipeline.start_external(transport.clone()).unwrap();

    // First sample parks the consumer inside send
    trigger.fire();
    assert!(wait_until(|| transport.entered.load(Ordering::SeqCst) == 1));
    for n in 2..=5 {
        trigger.fire();
        assert!(wait_until(|| pipeline.counters().frames_read == n));
    }
    gate.store(true, Ordering::SeqCst);
    assert!(wait_until(|| transport.count() == 2));
    pipeline.stop().unwrap();

    assert_eq!(transport.samples(), vec![vec![0; 4], vec![4; 4]]);
    assert_eq!(pipeline.counters().samples_overwritten, 3);
}

#[test]
fn test_baseline_removes_dc_offset() {
    let chip = SimulatedChip::new(4);
    chip.set_signal(|index, channel| {
        let dc = (channel as i32 + 1) * 1_000;
        if index < 4 { dc } else { dc + 5 }
    });
    let config = PipelineConfig::new().with_baseline(4);
    let mut pipeline = standby_pipeline(&chip, 4, config);
    let transport = Recording::default();
    let trigger = pipeline.start_external(transport.clone()).unwrap();

    for n in 1..=6 {
        trigger.fire();
        assert!(wait_until(|| transport.count() == n));
    }
    pipeline.stop().unwrap();

    let samples = transport.samples();
    assert_eq!(samples[0], vec![1_000, 2_000, 3_000, 4_000]);
    assert_eq!(samples[3], vec![1_000, 2_000, 3_000, 4_000]);
    assert_eq!(samples[4], vec![5; 4]);
    assert_eq!(samples[5], vec![5; 4]);
}

#[test]
fn test_data_ready_line_drives_acquisition() {
    let chip = SimulatedChip::new(4);
    chip.set_signal(|index, _| index as i32);
    let config = PipelineConfig::new().with_drdy_poll_timeout(Duration::from_millis(10));
    let mut pipeline = standby_pipeline(&chip, 4, config);
    let transport = Recording::default();
    pipeline
        .start(chip.data_ready(500.0).with_edge_limit(10), transport.clone())
        .unwrap();

    assert!(wait_until(|| {
        let c = pipeline.counters();
        c.wakes_posted + c.wakes_coalesced == 10
            && c.frames_read == c.wakes_posted
            && c.samples_sent == c.frames_read
    }));
    pipeline.stop().unwrap();

    let counters = pipeline.counters();
    assert!(counters.frames_read >= 1);
    let firsts: Vec<i32> = transport.samples().iter().map(|s| s[0]).collect();
    let expected: Vec<i32> = (0..counters.frames_read as i32).collect();
    assert_eq!(firsts, expected);
}

#[test]
fn test_data_ready_failure_ends_listener_only() {
    let chip = SimulatedChip::new(4);
    let mut pipeline = standby_pipeline(&chip, 4, PipelineConfig::new());
    let transport = Recording::default();
    pipeline
        .start(chip.data_ready(500.0).with_failure_after(0), transport.clone())
        .unwrap();

    assert!(wait_until(|| pipeline.check_health().is_err()));
    assert!(matches!(
        pipeline.check_health(),
        Err(AdsError::DataReadyLost(digital::ErrorKind::Other))
    ));
    assert!(pipeline.is_running());
    pipeline.stop().unwrap();
    assert_eq!(transport.count(), 0);
    assert_eq!(pipeline.device_state(), DeviceState::Standby);
}

#[test]
fn test_stalled_transfer_reported_and_stop_returns() {
    let chip = SimulatedChip::new(4);
    let config = PipelineConfig::new().with_watchdog_threshold(Duration::from_millis(50));
    let mut pipeline = standby_pipeline(&chip, 4, config);
    let trigger = pipeline.start_external(Recording::default()).unwrap();

    chip.hold_transfers(true);
    trigger.fire();
    assert!(wait_until(|| matches!(
        pipeline.check_health(),
        Err(AdsError::Stalled { .. })
    )));

    let started = Instant::now();
    let err = pipeline.stop().unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    match err {
        AdsError::Stalled { node, resource, .. } => {
            assert_eq!(node, "acquisition");
            assert_eq!(resource, "spi");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(!pipeline.is_running());
    chip.hold_transfers(false);
}

#[test]
fn test_register_config_applied_before_streaming() {
    let chip = SimulatedChip::new(8);
    let config = PipelineConfig::new().with_registers([
        (Register::CONFIG1, 0x95),
        (Register::CH1SET, 0x60),
    ]);
    let mut pipeline = standby_pipeline(&chip, 8, config);
    let _trigger = pipeline.start_external(Recording::default()).unwrap();
    assert_eq!(chip.register(Register::CONFIG1), 0x95);
    assert_eq!(chip.register(Register::CH1SET), 0x60);

    let device = pipeline.into_device().unwrap();
    assert_eq!(device.state(), DeviceState::Standby);
}

#[test]
fn test_id_mismatch_refuses_to_stream() {
    let chip = SimulatedChip::new(4);
    let mut pipeline = standby_pipeline(&chip, 8, PipelineConfig::new());
    let err = pipeline.start_external(Recording::default()).unwrap_err();
    assert!(matches!(
        err,
        AdsError::Device(DeviceError::ChannelMismatch {
            reported: 4,
            configured: 8
        })
    ));
    assert!(!pipeline.is_running());
    assert!(!chip.is_converting());
}
