//! Core types for the modulator pipeline
//!
//! The pipeline operates on buffers of complex single-precision samples.
//! A [`Frame`] couples one such buffer with the transmission timestamp
//! decoded from the transport stream; the pair travels through every
//! stage together so that timestamps stay attached to the samples they
//! describe.

use crate::timestamp::FrameTimestamp;

/// A single I/Q sample: 32-bit float real and imaginary parts.
pub type Complexf = num_complex::Complex<f32>;

/// Result type for pipeline operations.
pub type ModResult<T> = Result<T, ModError>;

/// Errors raised by the DSP stages and the pipeline scaffold.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModError {
    #[error("invalid DAB mode: {0}")]
    InvalidDabMode(u32),

    #[error("coefficient file error: {0}")]
    CoefFile(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The sample-buffer length is fixed after the first buffer; a change
    /// mid-stream means the source is broken and the pipeline must stop.
    #[error("buffer length changed from {expected} to {got} samples")]
    BufferLengthChanged { expected: usize, got: usize },

    #[error("pipeline stage stopped")]
    StageStopped,
}

/// One buffer of baseband samples plus its transmission timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub samples: Vec<Complexf>,
    pub ts: FrameTimestamp,
}

impl Frame {
    pub fn new(samples: Vec<Complexf>, ts: FrameTimestamp) -> Self {
        Self { samples, ts }
    }

    /// A frame without a valid timestamp.
    pub fn from_samples(samples: Vec<Complexf>) -> Self {
        Self {
            samples,
            ts: FrameTimestamp::default(),
        }
    }

    /// A zero-filled frame with an invalid timestamp. Used as filler
    /// while a pipelined stage is still priming.
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![Complexf::new(0.0, 0.0); len],
            ts: FrameTimestamp::default(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
