//! # Gain Control
//!
//! Scales each buffer by `digital_gain / D`, where the divisor `D` is
//! recomputed per buffer under the active mode:
//!
//! | Mode | Divisor |
//! |------|---------|
//! | fix  | the fixed `normalise` constant |
//! | max  | the largest sample magnitude among non-zero samples |
//! | var  | `sqrt(var_variance * mean(|x|²))` |
//!
//! `max` and `var` fall back to `normalise` when the computed divisor is
//! zero (an all-zero buffer), so a silent input stays silent instead of
//! producing NaNs.
//!
//! The loops below are the scalar reference; they are written in the
//! slice/iterator style that LLVM auto-vectorises. A hand-written SIMD
//! path must match them to within 1 ulp.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::rc::{parse_value, RcError, RcResult, RemoteControllable};
use crate::types::{Complexf, Frame, ModError, ModResult};

/// Divisor selection regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GainMode {
    Fix,
    Max,
    Var,
}

impl FromStr for GainMode {
    type Err = ModError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fix" => Ok(GainMode::Fix),
            "max" => Ok(GainMode::Max),
            "var" => Ok(GainMode::Var),
            other => Err(ModError::Config(format!("unknown gain mode '{other}'"))),
        }
    }
}

impl std::fmt::Display for GainMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GainMode::Fix => write!(f, "fix"),
            GainMode::Max => write!(f, "max"),
            GainMode::Var => write!(f, "var"),
        }
    }
}

/// The remote-controllable fields, read once per buffer under one lock.
struct GainSettings {
    mode: GainMode,
    digital_gain: f32,
    var_variance: f32,
}

struct GainShared {
    /// Fallback divisor; fixed at construction.
    normalise: f32,
    settings: Mutex<GainSettings>,
}

/// Per-buffer amplitude normalisation stage. Synchronous: runs on the
/// pipeline thread.
pub struct GainControl {
    shared: Arc<GainShared>,
}

impl GainControl {
    pub fn new(
        mode: GainMode,
        digital_gain: f32,
        normalise: f32,
        var_variance: f32,
    ) -> ModResult<Self> {
        if !(normalise > 0.0) {
            return Err(ModError::Config(format!(
                "gain normalise must be positive, got {normalise}"
            )));
        }
        if !(var_variance > 0.0) {
            return Err(ModError::Config(format!(
                "gain var_variance must be positive, got {var_variance}"
            )));
        }
        Ok(Self {
            shared: Arc::new(GainShared {
                normalise,
                settings: Mutex::new(GainSettings {
                    mode,
                    digital_gain,
                    var_variance,
                }),
            }),
        })
    }

    /// Handle for the remote-control registry.
    pub fn rc_handle(&self) -> Arc<dyn RemoteControllable> {
        self.shared.clone()
    }

    /// Scale one buffer. Output length equals input length.
    pub fn process(&self, mut frame: Frame) -> Frame {
        if frame.is_empty() {
            return frame;
        }

        let (mode, digital_gain, var_variance) = {
            let s = self.shared.settings.lock().unwrap();
            (s.mode, s.digital_gain, s.var_variance)
        };
        let normalise = self.shared.normalise;

        let divisor = match mode {
            GainMode::Fix => normalise,
            GainMode::Max => {
                let m = peak_magnitude(&frame.samples);
                if m == 0.0 {
                    normalise
                } else {
                    m
                }
            }
            GainMode::Var => {
                let v = variance_divisor(&frame.samples, var_variance);
                if v == 0.0 {
                    normalise
                } else {
                    v
                }
            }
        };

        let gain = digital_gain / divisor;
        for s in frame.samples.iter_mut() {
            *s = *s * gain;
        }
        frame
    }
}

/// Largest |x| over the non-zero samples; 0.0 for an all-zero buffer.
fn peak_magnitude(samples: &[Complexf]) -> f32 {
    samples
        .iter()
        .filter(|s| s.re != 0.0 || s.im != 0.0)
        .map(|s| s.norm())
        .fold(0.0f32, f32::max)
}

/// `sqrt(var_variance * mean(|x|²))` over the whole buffer.
fn variance_divisor(samples: &[Complexf], var_variance: f32) -> f32 {
    let mean_power =
        samples.iter().map(|s| s.norm_sqr()).sum::<f32>() / samples.len() as f32;
    (var_variance * mean_power).sqrt()
}

impl RemoteControllable for GainShared {
    fn rc_name(&self) -> &str {
        "gain"
    }

    fn parameters(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("mode", "Gain mode: fix, max or var"),
            ("digital_gain", "Digital gain applied after normalisation"),
            ("normalise", "(Read-only) fallback normalisation divisor"),
            ("var_variance", "Variance multiplier for the var mode"),
        ]
    }

    fn set_parameter(&self, parameter: &str, value: &str) -> RcResult<()> {
        match parameter {
            "mode" => {
                let mode: GainMode = value.parse().map_err(|e: ModError| RcError::InvalidValue {
                    parameter: parameter.to_string(),
                    message: e.to_string(),
                })?;
                self.settings.lock().unwrap().mode = mode;
                Ok(())
            }
            "digital_gain" => {
                let v: f32 = parse_value(parameter, value)?;
                self.settings.lock().unwrap().digital_gain = v;
                Ok(())
            }
            "var_variance" => {
                let v: f32 = parse_value(parameter, value)?;
                if !(v > 0.0) {
                    return Err(RcError::InvalidValue {
                        parameter: parameter.to_string(),
                        message: "must be positive".to_string(),
                    });
                }
                self.settings.lock().unwrap().var_variance = v;
                Ok(())
            }
            "normalise" => Err(RcError::ReadOnly(parameter.to_string())),
            _ => Err(RcError::UnknownParameter {
                component: self.rc_name().to_string(),
                parameter: parameter.to_string(),
            }),
        }
    }

    fn get_parameter(&self, parameter: &str) -> RcResult<String> {
        let s = self.settings.lock().unwrap();
        match parameter {
            "mode" => Ok(s.mode.to_string()),
            "digital_gain" => Ok(s.digital_gain.to_string()),
            "normalise" => Ok(self.normalise.to_string()),
            "var_variance" => Ok(s.var_variance.to_string()),
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
    use approx::assert_relative_eq;

    fn frame(samples: Vec<Complexf>) -> Frame {
        Frame::from_samples(samples)
    }

    #[test]
    fn test_length_preserved() {
        let gain = GainControl::new(GainMode::Var, 0.7, 2.0, 4.0).unwrap();
        let out = gain.process(frame(vec![Complexf::new(0.3, -0.2); 777]));
        assert_eq!(out.len(), 777);
    }

    #[test]
    fn test_fix_identity_is_bit_exact() {
        let gain = GainControl::new(GainMode::Fix, 1.0, 1.0, 1.0).unwrap();
        let input = vec![Complexf::new(1.0, 0.0); 2048];
        let out = gain.process(frame(input.clone()));
        assert_eq!(out.samples, input);
    }

    #[test]
    fn test_max_normalisation() {
        // Peak magnitude is 3, so every sample is divided by 3.
        let gain = GainControl::new(GainMode::Max, 1.0, 1.0, 1.0).unwrap();
        let out = gain.process(frame(vec![
            Complexf::new(2.0, 0.0),
            Complexf::new(0.0, 0.0),
            Complexf::new(0.0, 1.0),
            Complexf::new(-3.0, 0.0),
        ]));
        assert_relative_eq!(out.samples[0].re, 0.6667, epsilon = 1e-4);
        assert_eq!(out.samples[1], Complexf::new(0.0, 0.0));
        assert_relative_eq!(out.samples[2].im, 0.3333, epsilon = 1e-4);
        assert_relative_eq!(out.samples[3].re, -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_max_scales_peak_to_digital_gain() {
        let gain = GainControl::new(GainMode::Max, 0.8, 1.0, 1.0).unwrap();
        let out = gain.process(frame(vec![
            Complexf::new(0.5, 0.5),
            Complexf::new(-2.0, 1.0),
            Complexf::new(0.1, 0.0),
        ]));
        let peak = out.samples.iter().map(|s| s.norm()).fold(0.0f32, f32::max);
        assert_relative_eq!(peak, 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_var_zero_input_stays_zero() {
        let gain = GainControl::new(GainMode::Var, 1.0, 2.0, 4.0).unwrap();
        let out = gain.process(frame(vec![Complexf::new(0.0, 0.0); 1024]));
        assert_eq!(out.len(), 1024);
        assert!(out
            .samples
            .iter()
            .all(|s| s.re == 0.0 && s.im == 0.0 && !s.re.is_nan()));
    }

    #[test]
    fn test_var_divisor() {
        // Constant-magnitude input: mean power = 4, divisor = sqrt(2*4).
        let gain = GainControl::new(GainMode::Var, 1.0, 1.0, 2.0).unwrap();
        let out = gain.process(frame(vec![Complexf::new(2.0, 0.0); 64]));
        assert_relative_eq!(out.samples[0].re, 2.0 / 8.0f32.sqrt(), epsilon = 1e-6);
    }

    #[test]
    fn test_max_ignores_zero_samples() {
        assert_eq!(
            peak_magnitude(&[Complexf::new(0.0, 0.0), Complexf::new(0.0, 0.0)]),
            0.0
        );
    }

    #[test]
    fn test_rc_mode_roundtrip() {
        let gain = GainControl::new(GainMode::Fix, 1.0, 1.0, 1.0).unwrap();
        let rc = gain.rc_handle();
        rc.set_parameter("mode", "VAR").unwrap();
        assert_eq!(rc.get_parameter("mode").unwrap(), "var");
    }

    #[test]
    fn test_rc_rejects_bad_mode() {
        let gain = GainControl::new(GainMode::Fix, 1.0, 1.0, 1.0).unwrap();
        let rc = gain.rc_handle();
        assert!(rc.set_parameter("mode", "loud").is_err());
        assert_eq!(rc.get_parameter("mode").unwrap(), "fix");
    }

    #[test]
    fn test_rc_normalise_is_read_only() {
        let gain = GainControl::new(GainMode::Fix, 1.0, 2.5, 1.0).unwrap();
        let rc = gain.rc_handle();
        assert_eq!(
            rc.set_parameter("normalise", "3.0"),
            Err(RcError::ReadOnly("normalise".to_string()))
        );
        assert_eq!(rc.get_parameter("normalise").unwrap(), "2.5");
    }

    #[test]
    fn test_invalid_construction() {
        assert!(GainControl::new(GainMode::Fix, 1.0, 0.0, 1.0).is_err());
        assert!(GainControl::new(GainMode::Fix, 1.0, 1.0, -1.0).is_err());
    }
}
