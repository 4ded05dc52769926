//! # Transmission Timing Model
//!
//! DAB transmission frames carry a presentation timestamp split into an
//! integer second on the hardware time base and a sub-second tick count
//! in units of 1/16_384_000 s (the "PPS offset"). The SDR sink converts
//! this pair into a device time spec and also predicts the timestamp of
//! the next frame from the buffer length, so that discontinuities in the
//! transport stream are detected before they reach the air.
//!
//! The transmission-frame duration is a function of the DAB mode
//! (ETSI EN 300 401, table 2) and fixes both the delay-buffer size and
//! the sleep interval used when a frame is dropped.

use serde::{Deserialize, Serialize};

use crate::types::{ModError, ModResult};

/// Sub-second timestamp resolution: ticks per second.
pub const PPS_TICKS_PER_SECOND: u32 = 16_384_000;

/// DAB transmission mode. Determines the transmission-frame duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DabMode {
    Mode1,
    Mode2,
    Mode3,
    Mode4,
}

impl DabMode {
    /// Transmission-frame duration in milliseconds.
    pub fn frame_duration_ms(&self) -> u32 {
        match self {
            DabMode::Mode1 => 96,
            DabMode::Mode2 => 24,
            DabMode::Mode3 => 24,
            DabMode::Mode4 => 48,
        }
    }

    /// Number of samples in one transmission frame at the given rate.
    pub fn frame_samples(&self, sample_rate: u32) -> usize {
        (self.frame_duration_ms() as u64 * sample_rate as u64 / 1000) as usize
    }

    pub fn from_number(mode: u32) -> ModResult<Self> {
        match mode {
            1 => Ok(DabMode::Mode1),
            2 => Ok(DabMode::Mode2),
            3 => Ok(DabMode::Mode3),
            4 => Ok(DabMode::Mode4),
            other => Err(ModError::InvalidDabMode(other)),
        }
    }
}

/// Timestamp of the first sample of a transmission frame.
///
/// `fct` is the frame count carried alongside the timestamp; `-1` marks
/// a frame that must be dropped. The `refresh` bit signals that the
/// timestamp was re-derived from the transport stream and ends the
/// current continuous burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTimestamp {
    /// Integer second on the hardware time base.
    pub sec: u32,
    /// Sub-second offset in units of 1/16_384_000 s, in [0, 16_384_000).
    pub pps: u32,
    pub valid: bool,
    pub refresh: bool,
    /// Frame count; -1 marks an invalid frame.
    pub fct: i32,
}

impl Default for FrameTimestamp {
    fn default() -> Self {
        Self {
            sec: 0,
            pps: 0,
            valid: false,
            refresh: false,
            fct: 0,
        }
    }
}

impl FrameTimestamp {
    pub fn new(sec: u32, pps: u32) -> Self {
        Self {
            sec,
            pps,
            valid: true,
            refresh: false,
            fct: 0,
        }
    }

    pub fn with_fct(mut self, fct: i32) -> Self {
        self.fct = fct;
        self
    }

    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Sub-second offset in seconds.
    #[inline]
    pub fn pps_offset(&self) -> f64 {
        self.pps as f64 / PPS_TICKS_PER_SECOND as f64
    }

    /// Timestamp as fractional seconds on the hardware time base.
    #[inline]
    pub fn real_secs(&self) -> f64 {
        self.sec as f64 + self.pps_offset()
    }

    /// Timestamp shifted by a (non-negative) number of seconds, with the
    /// tick count normalised back into [0, 16_384_000).
    pub fn offset_by(&self, seconds: f64) -> Self {
        let add_ticks = (seconds * PPS_TICKS_PER_SECOND as f64).round() as u64;
        let total = self.pps as u64 + add_ticks;
        let mut out = *self;
        out.sec = self.sec + (total / PPS_TICKS_PER_SECOND as u64) as u32;
        out.pps = (total % PPS_TICKS_PER_SECOND as u64) as u32;
        out
    }

    /// The exact (sec, pps) expected for the frame following this one,
    /// given the buffer length in samples.
    ///
    /// The tick increment `samples * 16_384_000 / sample_rate` is exact
    /// for all standard DAB rates, so consecutive well-formed frames must
    /// match this prediction tick for tick.
    pub fn expected_after(&self, samples: usize, sample_rate: u32) -> (u32, u32) {
        let ticks = PPS_TICKS_PER_SECOND as u64;
        let increment = samples as u64 * ticks / sample_rate as u64;

        let mut sec = self.sec + (increment / ticks) as u32;
        let mut pps = self.pps + (increment % ticks) as u32;
        while pps >= PPS_TICKS_PER_SECOND {
            sec += 1;
            pps -= PPS_TICKS_PER_SECOND;
        }
        (sec, pps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_frame_durations() {
        assert_eq!(DabMode::Mode1.frame_duration_ms(), 96);
        assert_eq!(DabMode::Mode2.frame_duration_ms(), 24);
        assert_eq!(DabMode::Mode3.frame_duration_ms(), 24);
        assert_eq!(DabMode::Mode4.frame_duration_ms(), 48);
    }

    #[test]
    fn test_frame_samples_at_2048k() {
        // 96 ms at 2.048 MS/s is the canonical mode 1 frame
        assert_eq!(DabMode::Mode1.frame_samples(2_048_000), 196_608);
        assert_eq!(DabMode::Mode4.frame_samples(2_048_000), 98_304);
    }

    #[test]
    fn test_unknown_mode_is_an_error() {
        assert!(matches!(
            DabMode::from_number(5),
            Err(ModError::InvalidDabMode(5))
        ));
    }

    #[test]
    fn test_real_secs() {
        let ts = FrameTimestamp::new(10, 8_192_000);
        assert_relative_eq!(ts.real_secs(), 10.5, epsilon = 1e-9);
    }

    #[test]
    fn test_prediction_is_exact() {
        // 196608 samples at 2.048 MS/s = 96 ms = 1572864 ticks exactly
        let ts = FrameTimestamp::new(100, 0);
        let (sec, pps) = ts.expected_after(196_608, 2_048_000);
        assert_eq!((sec, pps), (100, 1_572_864));
    }

    #[test]
    fn test_prediction_wraps_second() {
        let ts = FrameTimestamp::new(100, 16_000_000);
        let (sec, pps) = ts.expected_after(196_608, 2_048_000);
        assert_eq!(sec, 101);
        assert_eq!(pps, 16_000_000 + 1_572_864 - PPS_TICKS_PER_SECOND);
    }

    #[test]
    fn test_offset_by_normalises_ticks() {
        let ts = FrameTimestamp::new(5, 16_000_000);
        let out = ts.offset_by(0.5);
        assert_eq!(out.sec, 6);
        assert_eq!(out.pps, 16_000_000 + 8_192_000 - PPS_TICKS_PER_SECOND);
        assert!(out.valid);
    }

    #[test]
    fn test_offset_by_zero_is_identity() {
        let ts = FrameTimestamp::new(7, 1234);
        assert_eq!(ts.offset_by(0.0), ts);
    }
}
