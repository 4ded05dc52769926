//! # dabtx Core DSP Library
//!
//! This crate provides the baseband post-processing stages of a
//! software-defined DAB broadcast modulator. It operates on fixed-size
//! buffers of complex single-precision I/Q samples flowing towards an SDR
//! transmitter:
//!
//! - **Gain control**: per-buffer amplitude normalisation with three
//!   selectable regimes (fixed divisor, peak tracking, variance tracking)
//! - **Memoryless predistortion**: an odd-order polynomial or a 32-bin
//!   lookup-table correction applied sample-wise, computed on a worker
//!   pool one buffer behind the pipeline
//! - **Pipeline plumbing**: a pipelined stage executor, a bounded frame
//!   FIFO with prebuffering, and a string-keyed remote-control registry
//!
//! ## Signal Flow
//!
//! ```text
//! OFDM symbols → GainControl → MemlessPoly → SdrSink (dabtx-sdr) → hardware
//! ```
//!
//! ## Example
//!
//! ```rust
//! use dabtx_core::gain_control::{GainControl, GainMode};
//! use dabtx_core::types::{Complexf, Frame};
//!
//! let gain = GainControl::new(GainMode::Fix, 1.0, 1.0, 1.0).unwrap();
//! let frame = Frame::from_samples(vec![Complexf::new(1.0, 0.0); 2048]);
//! let out = gain.process(frame);
//! assert_eq!(out.len(), 2048);
//! ```

pub mod gain_control;
pub mod memless_poly;
pub mod pipeline;
pub mod rc;
pub mod rt;
pub mod timestamp;
pub mod types;

pub use gain_control::{GainControl, GainMode};
pub use memless_poly::MemlessPoly;
pub use pipeline::PipelinedStage;
pub use rc::{RcRegistry, RemoteControllable};
pub use timestamp::{DabMode, FrameTimestamp};
pub use types::{Complexf, Frame, ModError, ModResult};
