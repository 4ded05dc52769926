//! # SDR Device Contract
//!
//! The vendor driver is treated as an opaque, thread-safe library. This
//! module defines the narrow call surface the output path relies on,
//! plus the configuration of the sink itself. Only the TX worker calls
//! [`SdrDevice::send`], only the feedback capture calls
//! [`SdrDevice::recv`], and only the GPS watchdog reads the lock
//! sensors; the trait itself makes no such distinction.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dabtx_core::timestamp::DabMode;
use dabtx_core::types::Complexf;

pub type SdrResult<T> = Result<T, SdrError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SdrError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("hardware error: {0}")]
    Hardware(String),

    #[error("sensor not found: {0}")]
    SensorNotFound(String),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error("timestamp error: {0}")]
    Timestamp(String),

    #[error("GPS error: {0}")]
    Gps(String),

    #[error(transparent)]
    Mod(#[from] dabtx_core::types::ModError),
}

/// Device time as an integer second plus a fractional part, the shape
/// every driver API takes timed commands in.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeSpec {
    pub full_secs: i64,
    pub frac_secs: f64,
}

impl TimeSpec {
    pub fn new(full_secs: i64, frac_secs: f64) -> Self {
        Self {
            full_secs,
            frac_secs,
        }
    }

    pub fn from_real_secs(secs: f64) -> Self {
        let full = secs.floor();
        Self {
            full_secs: full as i64,
            frac_secs: secs - full,
        }
    }

    #[inline]
    pub fn real_secs(&self) -> f64 {
        self.full_secs as f64 + self.frac_secs
    }

    /// This time advanced by a (non-negative) number of seconds, with
    /// the fractional part normalised back into [0, 1).
    pub fn offset(&self, seconds: f64) -> Self {
        let mut frac = self.frac_secs + seconds;
        let carry = frac.floor();
        frac -= carry;
        Self {
            full_secs: self.full_secs + carry as i64,
            frac_secs: frac,
        }
    }
}

/// Metadata attached to one TX packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxMetadata {
    /// When to emit the first sample; `None` transmits free-running.
    pub time_spec: Option<TimeSpec>,
    pub start_of_burst: bool,
    pub end_of_burst: bool,
}

/// Metadata returned with one RX read.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxMetadata {
    /// Time of the first returned sample.
    pub time_spec: TimeSpec,
}

/// A finite timed receive: capture `num_samples` starting at
/// `time_spec`, then stop.
#[derive(Debug, Clone, Copy)]
pub struct RxBurstCommand {
    pub num_samples: usize,
    pub stream_now: bool,
    pub time_spec: TimeSpec,
}

/// Asynchronous feedback from the TX chain of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEventCode {
    BurstAck,
    Underflow,
    SeqError,
    TimeError,
    UnderflowInPacket,
    SeqErrorInBurst,
}

#[derive(Debug, Clone, Copy)]
pub struct AsyncEvent {
    pub code: AsyncEventCode,
    /// Device time the event was recorded at, in seconds.
    pub time: f64,
}

/// Value of a motherboard sensor.
#[derive(Debug, Clone)]
pub enum SensorValue {
    Bool(bool),
    Text(String),
}

impl SensorValue {
    pub fn to_bool(&self) -> bool {
        match self {
            SensorValue::Bool(b) => *b,
            SensorValue::Text(s) => !s.is_empty(),
        }
    }
}

impl std::fmt::Display for SensorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorValue::Bool(b) => write!(f, "{b}"),
            SensorValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Severity of a message emitted by the vendor driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMessageLevel {
    Status,
    Warning,
    Error,
}

/// Process-wide hook for vendor driver messages.
pub type MessageHandler = fn(DriverMessageLevel, &str);

/// The opaque vendor driver. All methods are callable from any thread.
pub trait SdrDevice: Send + Sync {
    fn device_name(&self) -> &str;

    fn set_clock_source(&self, source: &str) -> SdrResult<()>;
    fn set_time_source(&self, source: &str) -> SdrResult<()>;

    /// Readback of the configured master clock rate in Hz.
    fn master_clock_rate(&self) -> SdrResult<f64>;

    /// Set the TX sample rate; returns the rate actually configured.
    fn set_tx_rate(&self, rate: f64) -> SdrResult<f64>;
    fn set_rx_rate(&self, rate: f64) -> SdrResult<f64>;

    /// Tune TX; a nonzero `lo_offset` requests an LO-offset tune.
    /// Returns the actual centre frequency.
    fn set_tx_frequency(&self, frequency: f64, lo_offset: f64) -> SdrResult<f64>;
    fn set_rx_frequency(&self, frequency: f64, lo_offset: f64) -> SdrResult<f64>;

    fn set_tx_gain(&self, gain: f64) -> SdrResult<f64>;
    fn set_rx_gain(&self, gain: f64) -> SdrResult<f64>;
    fn set_rx_antenna(&self, antenna: &str) -> SdrResult<()>;

    /// Current device time in seconds.
    fn time_now(&self) -> f64;
    fn set_time_now(&self, seconds: f64) -> SdrResult<()>;
    /// Program the device time to take effect at the next PPS edge.
    fn set_time_unknown_pps(&self, seconds: f64) -> SdrResult<()>;

    /// Read a motherboard sensor; `SdrError::SensorNotFound` when the
    /// device does not have it.
    fn mboard_sensor(&self, name: &str) -> SdrResult<SensorValue>;

    /// Largest number of samples one `send` call accepts.
    fn max_tx_samples(&self) -> usize;

    /// Transmit samples; returns the number actually accepted (0 on
    /// timeout).
    fn send(&self, samples: &[Complexf], md: &TxMetadata, timeout: Duration) -> SdrResult<usize>;

    fn issue_rx_burst(&self, cmd: RxBurstCommand) -> SdrResult<()>;

    /// Receive samples from a previously issued burst command.
    fn recv(&self, buf: &mut [Complexf], timeout: Duration) -> SdrResult<(usize, RxMetadata)>;

    /// Poll for one asynchronous TX event; `None` on timeout.
    fn recv_async_event(&self, timeout: Duration) -> Option<AsyncEvent>;

    /// Install the process-wide driver message hook.
    fn register_message_handler(&self, handler: MessageHandler);
}

/// Reference clock input of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceClock {
    Internal,
    External,
    Gpsdo,
    /// An Ettus-style GPSDO: same driver source string as `Gpsdo`, but
    /// lock is reported through the `gps_locked` sensor instead of
    /// `gps_timelock`.
    GpsdoEttus,
}

impl ReferenceClock {
    /// The clock-source string handed to the driver.
    pub fn driver_source(&self) -> &'static str {
        match self {
            ReferenceClock::Internal => "internal",
            ReferenceClock::External => "external",
            ReferenceClock::Gpsdo | ReferenceClock::GpsdoEttus => "gpsdo",
        }
    }

    pub fn is_gps_disciplined(&self) -> bool {
        matches!(self, ReferenceClock::Gpsdo | ReferenceClock::GpsdoEttus)
    }
}

impl FromStr for ReferenceClock {
    type Err = SdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(ReferenceClock::Internal),
            "external" => Ok(ReferenceClock::External),
            "gpsdo" => Ok(ReferenceClock::Gpsdo),
            "gpsdo-ettus" => Ok(ReferenceClock::GpsdoEttus),
            other => Err(SdrError::Config(format!("unknown refclk source '{other}'"))),
        }
    }
}

/// PPS input of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PpsSource {
    None,
    External,
    Gpsdo,
}

impl PpsSource {
    pub fn driver_source(&self) -> &'static str {
        match self {
            PpsSource::None => "none",
            PpsSource::External => "external",
            PpsSource::Gpsdo => "gpsdo",
        }
    }
}

impl FromStr for PpsSource {
    type Err = SdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(PpsSource::None),
            "external" => Ok(PpsSource::External),
            "gpsdo" => Ok(PpsSource::Gpsdo),
            other => Err(SdrError::Config(format!("unknown pps source '{other}'"))),
        }
    }
}

/// What to do when the external reference clock loses lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefclkLossBehaviour {
    Warn,
    Crash,
}

/// Sink configuration. Immutable after construction except for the
/// parameters exported on the remote-control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdrSinkConfig {
    /// TX and RX sample rate in Hz; asserted against driver readback
    /// within 1 ppm.
    pub sample_rate: u32,
    /// Centre frequency in Hz.
    pub frequency: f64,
    /// Nonzero requests an LO-offset tune.
    pub lo_offset: f64,
    pub tx_gain: f64,
    /// Analog gain of the feedback RX path.
    pub rx_gain: f64,
    /// Asserted within 1 ppm against readback; 0 disables the check.
    pub master_clock_rate: f64,
    pub refclk_src: ReferenceClock,
    pub pps_src: PpsSource,
    /// When true, frame timestamps drive emission.
    pub enable_sync: bool,
    /// When true, a frame without a timestamp is dropped rather than
    /// emitted free-running.
    pub mute_no_timestamps: bool,
    /// Static delay in microseconds, within one frame duration.
    pub static_delay_us: u32,
    /// Tolerated GPS lock outage in seconds before going fatal; 0
    /// disables the watchdog.
    pub max_gps_holdover_s: u32,
    /// How long to wait for the initial GPS fix before giving up.
    pub initial_gps_fix_wait_s: u32,
    /// Watchdog cadence; the check alternates launch and harvest at
    /// half this interval.
    pub gps_fix_check_interval_s: u32,
    /// TCP port of the DPD feedback server; 0 disables it.
    pub dpd_feedback_port: u16,
    pub refclk_loss_behaviour: RefclkLossBehaviour,
    pub dab_mode: DabMode,
}

impl Default for SdrSinkConfig {
    fn default() -> Self {
        Self {
            sample_rate: 2_048_000,
            frequency: 222_064_000.0,
            lo_offset: 0.0,
            tx_gain: 0.0,
            rx_gain: 0.0,
            master_clock_rate: 0.0,
            refclk_src: ReferenceClock::Internal,
            pps_src: PpsSource::None,
            enable_sync: false,
            mute_no_timestamps: false,
            static_delay_us: 0,
            max_gps_holdover_s: 0,
            initial_gps_fix_wait_s: 180,
            gps_fix_check_interval_s: 10,
            dpd_feedback_port: 0,
            refclk_loss_behaviour: RefclkLossBehaviour::Warn,
            dab_mode: DabMode::Mode1,
        }
    }
}
