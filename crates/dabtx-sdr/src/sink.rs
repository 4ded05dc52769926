//! # SDR Sink
//!
//! Delivers consecutive sample buffers to the SDR with per-buffer
//! hardware timestamps. A bounded FIFO absorbs producer jitter; a
//! dedicated TX worker runs the timestamp state machine and fragments
//! bursts to the driver's packet limit; an async-event consumer turns
//! driver feedback (underruns, late packets, sequence errors) into
//! counters and a once-per-second status line.
//!
//! ## Transmit state machine
//!
//! `Idle → Running → Draining → Stopped`. The first buffer moves the
//! sink to Running and fixes the buffer length for the lifetime of the
//! stream; any later change is fatal. While Running, a timestamped
//! buffer is checked against the prediction from the previous one,
//! dropped when older than the TX timeout, and fatal when further than
//! [`TIMESTAMP_ABORT_FUTURE`] ahead of the device clock.
//!
//! DSP stages never stop the pipeline on data-level anomalies; this
//! sink is where data faults either degrade (drop + count) or escalate
//! (stop the worker and surface the error to the producer).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, trace, warn};

use dabtx_core::rc::{parse_value, RcError, RcResult, RemoteControllable};
use dabtx_core::rt::FrameQueue;
use dabtx_core::timestamp::FrameTimestamp;
use dabtx_core::types::{Complexf, Frame, ModError};

use crate::device::{
    AsyncEventCode, DriverMessageLevel, PpsSource, RefclkLossBehaviour, ReferenceClock, SdrDevice,
    SdrError, SdrResult, SdrSinkConfig, TimeSpec, TxMetadata,
};
use crate::feedback::FeedbackServer;

/// Depth of the frame FIFO between producer and TX worker.
pub const FRAMES_MAX_SIZE: usize = 8;

/// A timestamp this many seconds ahead of the device clock is fatal.
pub const TIMESTAMP_ABORT_FUTURE: f64 = 10.0;

/// Driver send timeout; doubles as the "too far in the past" threshold.
const TX_TIMEOUT: Duration = Duration::from_secs(20);

/// The driver message hook is process-wide; install it exactly once.
static MESSAGE_HANDLER_INIT: Once = Once::new();

fn driver_message_handler(level: DriverMessageLevel, msg: &str) {
    match level {
        DriverMessageLevel::Warning => warn!("driver warning: {msg}"),
        DriverMessageLevel::Error => error!("driver error: {msg}"),
        DriverMessageLevel::Status => {
            // Skip the single-character heartbeat messages some drivers
            // print during streaming.
            if msg.trim().len() != 1 {
                debug!("driver message: {msg}");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Counters exposed on the remote-control surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStatistics {
    pub num_underruns: u64,
    pub num_late_packets: u64,
    pub num_frames_modulated: u64,
}

/// Configuration pieces the worker threads need, fixed at bring-up.
struct SinkFixed {
    sample_rate: u32,
    lo_offset: f64,
    enable_sync: bool,
    mute_no_timestamps: bool,
    refclk_src: ReferenceClock,
    refclk_loss_behaviour: RefclkLossBehaviour,
    pps_src: PpsSource,
    tf_duration_ms: u32,
    dpd_feedback_port: u16,
}

/// Gains and frequency as last read back from the device.
struct TuneState {
    tx_gain: f64,
    rx_gain: f64,
    frequency: f64,
}

struct SinkShared {
    device: Arc<dyn SdrDevice>,
    fixed: SinkFixed,
    tune: Mutex<TuneState>,
    muting: AtomicBool,
    static_delay_us: AtomicU32,
    running: AtomicBool,
    fatal: Mutex<Option<SdrError>>,
    num_underflows: AtomicU64,
    num_late_packets: AtomicU64,
    num_seq_errors: AtomicU64,
    num_frames: AtomicU64,
    suppress_refclk_check: AtomicBool,
}

pub struct SdrSink {
    shared: Arc<SinkShared>,
    queue: Arc<FrameQueue<Frame>>,
    /// History for the static delay line, sized to one transmission
    /// frame; only the first `delay_samples` entries are live.
    delay_buf: Vec<Complexf>,
    feedback: Option<FeedbackServer>,
    gps: GpsWatchdog,
    /// False while a GPS-disciplined reference is still acquiring its
    /// first fix; the output stays muted and frames are dropped.
    gps_fix_verified: bool,
    state: TxState,
    last_len: Option<usize>,
    tx_worker: Option<JoinHandle<()>>,
    async_worker: Option<JoinHandle<()>>,
}

impl SdrSink {
    /// Bring up the device and start the TX worker, the async-event
    /// consumer and (when configured) the feedback server.
    pub fn new(device: Arc<dyn SdrDevice>, config: SdrSinkConfig) -> SdrResult<Self> {
        let tf_duration_ms = config.dab_mode.frame_duration_ms();
        if config.static_delay_us > tf_duration_ms * 1000 {
            return Err(SdrError::Config(format!(
                "static delay {} us exceeds the frame duration of {} us",
                config.static_delay_us,
                tf_duration_ms * 1000
            )));
        }

        MESSAGE_HANDLER_INIT.call_once(|| device.register_message_handler(driver_message_handler));

        info!("bringing up SDR device '{}'", device.device_name());

        device.set_clock_source(config.refclk_src.driver_source())?;
        device.set_time_source(config.pps_src.driver_source())?;

        if config.master_clock_rate != 0.0 {
            let actual = device.master_clock_rate()?;
            debug!("master clock rate readback: {actual} Hz");
            assert_within_1ppm("master clock rate", config.master_clock_rate, actual)?;
        }

        let rate = config.sample_rate as f64;
        let actual_tx_rate = device.set_tx_rate(rate)?;
        debug!("actual TX rate: {actual_tx_rate} S/s");
        assert_within_1ppm("TX sample rate", rate, actual_tx_rate)?;

        let actual_rx_rate = device.set_rx_rate(rate)?;
        debug!("actual RX rate: {actual_rx_rate} S/s");
        assert_within_1ppm("RX sample rate", rate, actual_rx_rate)?;

        let frequency = tune_device(&*device, config.lo_offset, config.frequency)?;

        let tx_gain = device.set_tx_gain(config.tx_gain)?;
        debug!("actual TX gain: {tx_gain} dB");
        device.set_rx_antenna("RX2")?;
        let rx_gain = device.set_rx_gain(config.rx_gain)?;
        debug!("actual RX gain: {rx_gain} dB");
        debug!(
            "mute on missing timestamps: {}",
            if config.mute_no_timestamps {
                "enabled"
            } else {
                "disabled"
            }
        );

        // With a GPS-disciplined reference the output starts muted and
        // the device time is programmed only once the first fix lands;
        // until then `process` drops frames while polling the sensor.
        let gps_watchdog_needed =
            config.refclk_src.is_gps_disciplined() && config.max_gps_holdover_s != 0;
        if !gps_watchdog_needed {
            set_device_time(&*device, config.enable_sync, config.pps_src)?;
        }

        let shared = Arc::new(SinkShared {
            device: Arc::clone(&device),
            fixed: SinkFixed {
                sample_rate: config.sample_rate,
                lo_offset: config.lo_offset,
                enable_sync: config.enable_sync,
                mute_no_timestamps: config.mute_no_timestamps,
                refclk_src: config.refclk_src,
                refclk_loss_behaviour: config.refclk_loss_behaviour,
                pps_src: config.pps_src,
                tf_duration_ms,
                dpd_feedback_port: config.dpd_feedback_port,
            },
            tune: Mutex::new(TuneState {
                tx_gain,
                rx_gain,
                frequency,
            }),
            // Muted until the GPS fix check clears it; remote-controllable.
            muting: AtomicBool::new(gps_watchdog_needed),
            static_delay_us: AtomicU32::new(config.static_delay_us),
            running: AtomicBool::new(true),
            fatal: Mutex::new(None),
            num_underflows: AtomicU64::new(0),
            num_late_packets: AtomicU64::new(0),
            num_seq_errors: AtomicU64::new(0),
            num_frames: AtomicU64::new(0),
            suppress_refclk_check: AtomicBool::new(false),
        });

        let feedback = if config.dpd_feedback_port != 0 {
            Some(FeedbackServer::start(
                Arc::clone(&device),
                config.dpd_feedback_port,
                config.sample_rate,
            )?)
        } else {
            None
        };

        let queue = Arc::new(FrameQueue::new(FRAMES_MAX_SIZE));

        let worker_shared = Arc::clone(&shared);
        let worker_queue = Arc::clone(&queue);
        let tx_worker = std::thread::Builder::new()
            .name("sdr-tx-worker".to_string())
            .spawn(move || tx_worker_loop(worker_shared, worker_queue))
            .map_err(|e| SdrError::Hardware(format!("failed to spawn TX worker: {e}")))?;

        let async_shared = Arc::clone(&shared);
        let async_worker = std::thread::Builder::new()
            .name("sdr-async-events".to_string())
            .spawn(move || async_event_loop(async_shared))
            .map_err(|e| SdrError::Hardware(format!("failed to spawn async consumer: {e}")))?;

        let gps = GpsWatchdog::new(Arc::clone(&device), &config, gps_watchdog_needed);
        let delay_len = config.dab_mode.frame_samples(config.sample_rate);

        debug!("SDR sink ready");

        Ok(Self {
            shared,
            queue,
            delay_buf: vec![Complexf::new(0.0, 0.0); delay_len],
            feedback,
            gps,
            gps_fix_verified: !gps_watchdog_needed,
            state: TxState::Idle,
            last_len: None,
            tx_worker: Some(tx_worker),
            async_worker: Some(async_worker),
        })
    }

    /// Accept one frame from the pipeline. Blocks when the FIFO is full
    /// (backpressure towards the modulator). Returns the number of
    /// samples consumed.
    pub fn process(&mut self, frame: Frame) -> SdrResult<usize> {
        let len = frame.len();

        if !self.gps_fix_verified {
            if matches!(self.state, TxState::Draining | TxState::Stopped) {
                return Err(SdrError::Hardware("sink is stopped".to_string()));
            }
            return self.initial_gps_check(len);
        }

        match self.state {
            TxState::Idle => {
                debug!("first frame of {len} samples, sink running");
                self.last_len = Some(len);
                self.state = TxState::Running;
            }
            TxState::Running => {}
            TxState::Draining | TxState::Stopped => {
                return Err(SdrError::Hardware("sink is stopped".to_string()))
            }
        }

        if !self.shared.running.load(Ordering::SeqCst) {
            self.state = TxState::Stopped;
            return Err(self.take_fatal());
        }

        if let Some(expected) = self.last_len {
            if expected != len {
                error!("fatal: input length changed from {expected} to {len} samples");
                self.shutdown();
                return Err(ModError::BufferLengthChanged { expected, got: len }.into());
            }
        }

        if let Err(e) = self.gps.check() {
            error!("{e}");
            self.shutdown();
            return Err(e);
        }

        let frame = self.apply_static_delay(frame);

        if frame.ts.fct == -1 {
            info!("dropping one frame with invalid FCT");
            return Ok(len);
        }

        let mut feedback_failed = false;
        if let Some(feedback) = &self.feedback {
            if let Err(e) = feedback.set_tx_frame(&frame.samples, &frame.ts) {
                warn!("feedback server failed ({e}), restarting");
                feedback_failed = true;
            }
        }
        if feedback_failed {
            self.feedback = Some(FeedbackServer::start(
                Arc::clone(&self.shared.device),
                self.shared.fixed.dpd_feedback_port,
                self.shared.fixed.sample_rate,
            )?);
        }

        match self.queue.push(frame) {
            Ok(depth) => trace!("queued frame, depth {depth}"),
            Err(_) => {
                self.state = TxState::Stopped;
                return Err(self.take_fatal());
            }
        }
        Ok(len)
    }

    /// Stop the workers, draining any send in flight, and release the
    /// device threads.
    pub fn stop(&mut self) {
        if self.state == TxState::Stopped {
            return;
        }
        self.state = TxState::Draining;
        self.shared.running.store(false, Ordering::SeqCst);
        self.queue.close();
        if let Some(worker) = self.tx_worker.take() {
            let _ = worker.join();
        }
        if let Some(worker) = self.async_worker.take() {
            let _ = worker.join();
        }
        self.feedback.take();
        self.state = TxState::Stopped;
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn run_statistics(&self) -> RunStatistics {
        RunStatistics {
            num_underruns: self.shared.num_underflows.load(Ordering::Relaxed),
            num_late_packets: self.shared.num_late_packets.load(Ordering::Relaxed),
            num_frames_modulated: self.shared.num_frames.load(Ordering::Relaxed),
        }
    }

    /// Handle for the remote-control registry.
    pub fn rc_handle(&self) -> Arc<dyn RemoteControllable> {
        self.shared.clone()
    }

    /// One round of the muted initial acquisition: poll the lock
    /// sensor, and once the fix is confirmed program the device time
    /// and unmute. The offered frame is dropped either way, paced at
    /// the frame cadence.
    fn initial_gps_check(&mut self, len: usize) -> SdrResult<usize> {
        match self.gps.initial_check() {
            Ok(true) => {
                if let Err(e) = set_device_time(
                    &*self.shared.device,
                    self.shared.fixed.enable_sync,
                    self.shared.fixed.pps_src,
                ) {
                    self.shutdown();
                    return Err(e);
                }
                self.gps_fix_verified = true;
                self.shared.muting.store(false, Ordering::Relaxed);
                info!("GPS fix verified, output unmuted");
            }
            Ok(false) => {
                std::thread::sleep(Duration::from_millis(
                    self.shared.fixed.tf_duration_ms as u64,
                ));
            }
            Err(e) => {
                error!("{e}");
                self.shutdown();
                return Err(e);
            }
        }
        Ok(len)
    }

    fn take_fatal(&self) -> SdrError {
        self.shared
            .fatal
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| SdrError::Hardware("TX worker failed".to_string()))
    }

    fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.queue.close();
        self.state = TxState::Stopped;
    }

    /// Prepend the retained history, emit `len` samples, retain the
    /// tail. With delay 0 the line is bypassed.
    fn apply_static_delay(&mut self, frame: Frame) -> Frame {
        let delay_samples = (self.shared.static_delay_us.load(Ordering::Relaxed) as u64
            * self.shared.fixed.sample_rate as u64
            / 1_000_000) as usize;
        if delay_samples == 0 {
            return frame;
        }

        let len = frame.samples.len();
        let d = delay_samples.min(len).min(self.delay_buf.len());
        let mut samples = Vec::with_capacity(len);
        samples.extend_from_slice(&self.delay_buf[..d]);
        samples.extend_from_slice(&frame.samples[..len - d]);
        self.delay_buf[..d].copy_from_slice(&frame.samples[len - d..]);
        Frame {
            samples,
            ts: frame.ts,
        }
    }
}

impl Drop for SdrSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn assert_within_1ppm(what: &str, requested: f64, actual: f64) -> SdrResult<()> {
    if (actual - requested).abs() > requested.abs() * 1e-6 {
        return Err(SdrError::Config(format!(
            "cannot set {what} to {requested} (device reports {actual})"
        )));
    }
    Ok(())
}

fn tune_device(device: &dyn SdrDevice, lo_offset: f64, frequency: f64) -> SdrResult<f64> {
    if lo_offset != 0.0 {
        info!("tuning to {frequency:.3} Hz with LO offset {lo_offset:.3} Hz");
    } else {
        info!("tuning to {frequency:.3} Hz");
    }
    let actual = device.set_tx_frequency(frequency, lo_offset)?;
    debug!("actual TX frequency: {actual:.3} Hz");
    let actual_rx = device.set_rx_frequency(frequency, lo_offset)?;
    debug!("actual RX frequency: {actual_rx:.3} Hz");
    Ok(actual)
}

fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn set_device_time(device: &dyn SdrDevice, enable_sync: bool, pps_src: PpsSource) -> SdrResult<()> {
    if enable_sync && pps_src == PpsSource::None {
        warn!("you are using synchronous transmission without PPS input!");
    }

    match pps_src {
        PpsSource::None => {
            let now = unix_time_secs();
            device.set_time_now(now)?;
            info!("set device time to {now:.0}");
        }
        _ => {
            // Wait until shortly after the wall-clock second changes,
            // then place the PPS programming 200 ms into the second so
            // the edge it arms against is unambiguous.
            let second = unix_time_secs().floor() as u64;
            while (unix_time_secs().floor() as u64) <= second {
                std::thread::sleep(Duration::from_millis(1));
            }
            std::thread::sleep(Duration::from_millis(200));
            device.set_time_unknown_pps((second + 2) as f64)?;
            info!("set device time at next PPS to {}", second + 2);

            std::thread::sleep(Duration::from_secs(1));
            info!("device time is now {:.6}", device.time_now());
        }
    }
    Ok(())
}

fn gps_lock_ok(device: &dyn SdrDevice, ettus: bool) -> bool {
    if ettus {
        match device.mboard_sensor("gps_locked") {
            Ok(value) if value.to_bool() => true,
            Ok(value) => {
                warn!("gps_locked: {value}");
                false
            }
            Err(_) => {
                warn!("no gps_locked sensor");
                false
            }
        }
    } else {
        match device.mboard_sensor("gps_timelock") {
            Ok(value) => {
                let text = value.to_string();
                if text.contains("TIME LOCKED") {
                    true
                } else {
                    warn!("gps_timelock: {text}");
                    false
                }
            }
            Err(_) => {
                warn!("no gps_timelock sensor");
                false
            }
        }
    }
}

fn tx_worker_loop(shared: Arc<SinkShared>, queue: Arc<FrameQueue<Frame>>) {
    let mut last_ts: Option<FrameTimestamp> = None;
    let mut pop_prebuffering = FRAMES_MAX_SIZE;
    let mut last_num_underflows = 0u64;

    while shared.running.load(Ordering::SeqCst) {
        trace!("waiting for frame");
        let Some(frame) = queue.pop_prebuffered(pop_prebuffering) else {
            break;
        };

        if let Err(e) = handle_frame(&shared, &mut last_ts, &frame) {
            error!("TX worker: {e}");
            *shared.fatal.lock().unwrap() = Some(e);
            break;
        }
        shared.num_frames.fetch_add(1, Ordering::Relaxed);

        // Refill the queue completely after every underrun (and at
        // startup) before sending again.
        let underflows = shared.num_underflows.load(Ordering::Relaxed);
        pop_prebuffering = if underflows > last_num_underflows {
            FRAMES_MAX_SIZE
        } else {
            1
        };
        last_num_underflows = underflows;
    }

    shared.running.store(false, Ordering::SeqCst);
    queue.close();
    warn!("TX worker terminated");
}

fn handle_frame(
    shared: &SinkShared,
    last_ts: &mut Option<FrameTimestamp>,
    frame: &Frame,
) -> SdrResult<()> {
    check_ref_clock(shared)?;

    let device_time = shared.device.time_now();
    let frame_duration = Duration::from_millis(shared.fixed.tf_duration_ms as u64);
    let mut timestamp_discontinuity = false;
    let mut md = TxMetadata::default();

    if shared.fixed.enable_sync {
        if !frame.ts.valid {
            info!(
                "dropping frame {}: incomplete timestamp {} / {}",
                frame.ts.fct, frame.ts.sec, frame.ts.pps
            );
            std::thread::sleep(frame_duration);
            return Ok(());
        }

        if let Some(last) = last_ts {
            let (expected_sec, expected_pps) =
                last.expected_after(frame.len(), shared.fixed.sample_rate);
            if expected_sec != frame.ts.sec || expected_pps != frame.ts.pps {
                warn!(
                    "timestamp irregularity: expected {}+{}, got {}+{}",
                    expected_sec, expected_pps, frame.ts.sec, frame.ts.pps
                );
                timestamp_discontinuity = true;
            }
        }
        *last_ts = Some(frame.ts);

        let time_spec = TimeSpec::new(frame.ts.sec as i64, frame.ts.pps_offset());
        trace!("tist {:.6}", time_spec.real_secs());

        if time_spec.real_secs() + TX_TIMEOUT.as_secs_f64() < device_time {
            warn!(
                "timestamp in the past (offset {:.6} s of device time {:.6}), dropping frame {}",
                time_spec.real_secs() - device_time,
                device_time,
                frame.ts.fct
            );
            return Ok(());
        }
        if time_spec.real_secs() > device_time + TIMESTAMP_ABORT_FUTURE {
            return Err(SdrError::Timestamp(format!(
                "timestamp {:.6} way too far in the future of device time {device_time:.6}",
                time_spec.real_secs()
            )));
        }
        md.time_spec = Some(time_spec);
    } else {
        let muting = shared.muting.load(Ordering::Relaxed);
        if muting || shared.fixed.mute_no_timestamps {
            if muting {
                info!("muting frame {} as requested", frame.ts.fct);
            } else {
                info!("no timestamp for frame {}, muting", frame.ts.fct);
            }
            std::thread::sleep(frame_duration);
            return Ok(());
        }
        // Free-running transmission.
    }

    send_frame(shared, frame, md, timestamp_discontinuity)
}

fn send_frame(
    shared: &SinkShared,
    frame: &Frame,
    mut md: TxMetadata,
    ts_update: bool,
) -> SdrResult<()> {
    let max_num_samps = shared.device.max_tx_samples();
    let sample_rate = shared.fixed.sample_rate as f64;
    let total = frame.len();
    let mut num_acc = 0usize;

    while shared.running.load(Ordering::SeqCst)
        && !shared.muting.load(Ordering::Relaxed)
        && num_acc < total
    {
        let samps_to_send = (total - num_acc).min(max_num_samps);

        // The last fragment carries EOB when the timestamp was
        // refreshed, or a discontinuity forces re-synchronisation.
        md.end_of_burst =
            frame.ts.valid && (frame.ts.refresh || ts_update) && total - num_acc <= max_num_samps;

        let num_tx_samps =
            shared
                .device
                .send(&frame.samples[num_acc..num_acc + samps_to_send], &md, TX_TIMEOUT)?;
        trace!("sent {num_tx_samps} of {samps_to_send}");

        if num_tx_samps == 0 {
            warn!("unable to write to device, skipping frame");
            break;
        }
        num_acc += num_tx_samps;

        if let Some(time_spec) = md.time_spec {
            md.time_spec = Some(time_spec.offset(num_tx_samps as f64 / sample_rate));
        }
    }
    Ok(())
}

fn check_ref_clock(shared: &SinkShared) -> SdrResult<()> {
    if shared.suppress_refclk_check.load(Ordering::Relaxed)
        || shared.fixed.refclk_src == ReferenceClock::Internal
    {
        return Ok(());
    }

    match shared.device.mboard_sensor("ref_locked") {
        Ok(value) => {
            if !value.to_bool() {
                error!("external reference clock lock lost!");
                if shared.fixed.refclk_loss_behaviour == RefclkLossBehaviour::Crash {
                    return Err(SdrError::Hardware(
                        "external reference clock lock lost".to_string(),
                    ));
                }
            }
            Ok(())
        }
        Err(SdrError::SensorNotFound(_)) => {
            shared.suppress_refclk_check.store(true, Ordering::Relaxed);
            warn!("device has no sensor for external clock loss, check disabled");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn async_event_loop(shared: Arc<SinkShared>) {
    let mut last_print = Instant::now();
    let mut underflows_prev = 0u64;
    let mut late_prev = 0u64;

    while shared.running.load(Ordering::SeqCst) {
        if let Some(event) = shared.device.recv_async_event(Duration::from_secs(1)) {
            let (message, failure) = match event.code {
                AsyncEventCode::BurstAck => ("", false),
                AsyncEventCode::Underflow => {
                    shared.num_underflows.fetch_add(1, Ordering::Relaxed);
                    ("underflow", false)
                }
                AsyncEventCode::TimeError => {
                    shared.num_late_packets.fetch_add(1, Ordering::Relaxed);
                    ("packet had time that was late", false)
                }
                AsyncEventCode::SeqError => {
                    shared.num_seq_errors.fetch_add(1, Ordering::Relaxed);
                    ("packet loss between host and device", true)
                }
                AsyncEventCode::UnderflowInPacket => {
                    shared.num_seq_errors.fetch_add(1, Ordering::Relaxed);
                    ("underflow occurred inside a packet", true)
                }
                AsyncEventCode::SeqErrorInBurst => {
                    shared.num_seq_errors.fetch_add(1, Ordering::Relaxed);
                    ("packet loss within a burst", true)
                }
            };
            if failure {
                error!("async device event '{message}' at time {:.6}", event.time);
            }
        }

        if last_print.elapsed() >= Duration::from_secs(1) {
            let underflows = shared.num_underflows.load(Ordering::Relaxed);
            let late = shared.num_late_packets.load(Ordering::Relaxed);
            if underflows > underflows_prev || late > late_prev {
                info!(
                    "sink status (device time {:.3}): {} underruns and {} late packets since last status",
                    shared.device.time_now(),
                    underflows - underflows_prev,
                    late - late_prev
                );
            }
            underflows_prev = underflows;
            late_prev = late;
            last_print = Instant::now();
        }
    }
}

/// Background GPS lock monitor. Sensor reads can take long enough to
/// disturb the frame cadence, so the query runs on a one-shot thread
/// and the hot path alternates between launching it and harvesting the
/// result.
struct GpsWatchdog {
    device: Arc<dyn SdrDevice>,
    enabled: bool,
    ettus: bool,
    check_interval_s: u32,
    max_holdover_s: u32,
    initial_wait_s: u32,
    /// When the initial acquisition started; set on its first poll.
    first_check: Option<Instant>,
    last_check: Option<Instant>,
    pending: Option<JoinHandle<bool>>,
    checks_without_fix: u32,
}

impl GpsWatchdog {
    fn new(device: Arc<dyn SdrDevice>, config: &SdrSinkConfig, enabled: bool) -> Self {
        Self {
            device,
            enabled,
            ettus: config.refclk_src == ReferenceClock::GpsdoEttus,
            check_interval_s: config.gps_fix_check_interval_s,
            max_holdover_s: config.max_gps_holdover_s,
            initial_wait_s: config.initial_gps_fix_wait_s,
            first_check: None,
            last_check: None,
            pending: None,
            checks_without_fix: 0,
        }
    }

    /// Half the configured interval because every other poll only
    /// launches the sensor query; the next one harvests it.
    fn poll_due(&mut self) -> bool {
        let half = self.check_interval_s as f64 / 2.0;
        if self
            .last_check
            .map_or(true, |t| t.elapsed().as_secs_f64() >= half)
        {
            self.last_check = Some(Instant::now());
            true
        } else {
            false
        }
    }

    fn launch_query(&mut self) {
        let device = Arc::clone(&self.device);
        let ettus = self.ettus;
        match std::thread::Builder::new()
            .name("gps-check".to_string())
            .spawn(move || gps_lock_ok(&*device, ettus))
        {
            Ok(task) => self.pending = Some(task),
            Err(e) => warn!("could not spawn GPS check: {e}"),
        }
    }

    /// Drive the lock poll during the muted initial acquisition.
    /// `Ok(true)` once the fix is confirmed; an error once the wait for
    /// the first fix expires.
    fn initial_check(&mut self) -> SdrResult<bool> {
        let first = *self.first_check.get_or_insert_with(|| {
            info!("waiting for GPS fix");
            Instant::now()
        });

        if self.poll_due() {
            match self.pending.take() {
                Some(task) if task.is_finished() => {
                    if task.join().unwrap_or(false) {
                        return Ok(true);
                    }
                    // No lock reported yet; relaunch on the next poll.
                }
                Some(task) => self.pending = Some(task),
                None => self.launch_query(),
            }
        }

        if first.elapsed() > Duration::from_secs(self.initial_wait_s as u64) {
            return Err(SdrError::Gps(format!(
                "GPS did not show time lock in {} seconds",
                self.initial_wait_s
            )));
        }
        Ok(false)
    }

    fn check(&mut self) -> SdrResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if !self.poll_due() {
            return Ok(());
        }

        match self.pending.take() {
            Some(task) if task.is_finished() => {
                let locked = task.join().unwrap_or(false);
                if locked {
                    if self.checks_without_fix > 0 {
                        info!("GPS time lock recovered");
                    }
                    self.checks_without_fix = 0;
                } else {
                    if self.checks_without_fix == 0 {
                        error!("GPS time lock lost");
                    }
                    self.checks_without_fix += 1;
                }

                if self.check_interval_s * self.checks_without_fix > self.max_holdover_s {
                    return Err(SdrError::Gps(format!(
                        "lost GPS time lock for {} seconds",
                        self.check_interval_s * self.checks_without_fix
                    )));
                }
            }
            Some(task) => self.pending = Some(task),
            None => self.launch_query(),
        }
        Ok(())
    }
}

/// Add-and-wrap semantics of the `staticdelay` setter: an adjustment
/// outside the frame duration resets the delay; otherwise the sum wraps
/// into [0, tf_us].
fn wrap_static_delay(current: i64, adjust: i64, tf_us: i64) -> u32 {
    if adjust.abs() > tf_us {
        return 0;
    }
    let mut next = current + adjust;
    if next > tf_us {
        next -= tf_us;
    } else if next < 0 {
        next += tf_us;
    }
    next.clamp(0, tf_us) as u32
}

fn parse_rc_bool(parameter: &str, value: &str) -> RcResult<bool> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(RcError::InvalidValue {
            parameter: parameter.to_string(),
            message: format!("expected a boolean, got '{value}'"),
        }),
    }
}

impl RemoteControllable for SinkShared {
    fn rc_name(&self) -> &str {
        "sdr"
    }

    fn parameters(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("txgain", "Analog TX gain"),
            ("rxgain", "Analog RX gain of the DPD feedback path"),
            ("freq", "Transmission frequency"),
            ("muting", "Mute the output by stopping the transmitter"),
            ("staticdelay", "Adjust the static delay in microseconds"),
            ("underruns", "Read-only counter of underruns"),
            ("latepackets", "Read-only counter of late packets"),
            ("frames", "Read-only counter of frames modulated"),
        ]
    }

    fn set_parameter(&self, parameter: &str, value: &str) -> RcResult<()> {
        let rc_io = |e: SdrError| RcError::InvalidValue {
            parameter: parameter.to_string(),
            message: e.to_string(),
        };

        match parameter {
            "txgain" => {
                let gain: f64 = parse_value(parameter, value)?;
                let actual = self.device.set_tx_gain(gain).map_err(rc_io)?;
                self.tune.lock().unwrap().tx_gain = actual;
                Ok(())
            }
            "rxgain" => {
                let gain: f64 = parse_value(parameter, value)?;
                let actual = self.device.set_rx_gain(gain).map_err(rc_io)?;
                self.tune.lock().unwrap().rx_gain = actual;
                Ok(())
            }
            "freq" => {
                let frequency: f64 = parse_value(parameter, value)?;
                let actual =
                    tune_device(&*self.device, self.fixed.lo_offset, frequency).map_err(rc_io)?;
                self.tune.lock().unwrap().frequency = actual;
                Ok(())
            }
            "muting" => {
                let muting = parse_rc_bool(parameter, value)?;
                self.muting.store(muting, Ordering::Relaxed);
                Ok(())
            }
            "staticdelay" => {
                let adjust: i64 = parse_value(parameter, value)?;
                let tf_us = self.fixed.tf_duration_ms as i64 * 1000;
                let current = self.static_delay_us.load(Ordering::Relaxed) as i64;
                self.static_delay_us
                    .store(wrap_static_delay(current, adjust, tf_us), Ordering::Relaxed);
                Ok(())
            }
            "underruns" | "latepackets" | "frames" => {
                Err(RcError::ReadOnly(parameter.to_string()))
            }
            _ => Err(RcError::UnknownParameter {
                component: self.rc_name().to_string(),
                parameter: parameter.to_string(),
            }),
        }
    }

    fn get_parameter(&self, parameter: &str) -> RcResult<String> {
        match parameter {
            "txgain" => Ok(self.tune.lock().unwrap().tx_gain.to_string()),
            "rxgain" => Ok(self.tune.lock().unwrap().rx_gain.to_string()),
            "freq" => Ok(self.tune.lock().unwrap().frequency.to_string()),
            "muting" => Ok(if self.muting.load(Ordering::Relaxed) {
                "1".to_string()
            } else {
                "0".to_string()
            }),
            "staticdelay" => Ok(self.static_delay_us.load(Ordering::Relaxed).to_string()),
            "underruns" => Ok(self.num_underflows.load(Ordering::Relaxed).to_string()),
            "latepackets" => Ok(self.num_late_packets.load(Ordering::Relaxed).to_string()),
            "frames" => Ok(self.num_frames.load(Ordering::Relaxed).to_string()),
            _ => Err(RcError::UnknownParameter {
                component: self.rc_name().to_string(),
                parameter: parameter.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_static_delay() {
        let tf_us = 96_000;
        assert_eq!(wrap_static_delay(0, 500, tf_us), 500);
        assert_eq!(wrap_static_delay(500, -200, tf_us), 300);
        // Wrap forwards and backwards at the frame duration.
        assert_eq!(wrap_static_delay(95_900, 200, tf_us), 100);
        assert_eq!(wrap_static_delay(100, -200, tf_us), 95_900);
        // Out-of-range adjustments reset.
        assert_eq!(wrap_static_delay(500, 96_001, tf_us), 0);
        assert_eq!(wrap_static_delay(500, -96_001, tf_us), 0);
    }

    #[test]
    fn test_assert_within_1ppm() {
        assert!(assert_within_1ppm("rate", 2_048_000.0, 2_048_000.0).is_ok());
        assert!(assert_within_1ppm("rate", 2_048_000.0, 2_048_001.0).is_ok());
        assert!(assert_within_1ppm("rate", 2_048_000.0, 2_048_010.0).is_err());
    }

    #[test]
    fn test_parse_rc_bool() {
        assert_eq!(parse_rc_bool("muting", "1"), Ok(true));
        assert_eq!(parse_rc_bool("muting", "false"), Ok(false));
        assert!(parse_rc_bool("muting", "maybe").is_err());
    }
}
