//! # dabtx SDR Output Path
//!
//! Delivers the modulated baseband stream to an SDR transmitter with
//! per-frame hardware timestamps, and captures short synchronous RX
//! bursts for an external predistortion estimator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Modulator (dabtx-core)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │  SdrSink: delay line → bounded FIFO → TX worker          │
//! │  FeedbackServer: TX/RX burst capture over TCP            │
//! ├──────────────────────────────────────────────────────────┤
//! │  SdrDevice trait (opaque vendor driver)                  │
//! │  hardware drivers │ LoopbackSdr (tests)                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The vendor driver itself is out of scope: everything above talks to
//! the [`device::SdrDevice`] trait, which mirrors the narrow call list
//! the output path actually needs (clock/time sources, rates, tunes,
//! gains, sensors, timestamped send, burst receive, async events).

pub mod chain;
pub mod device;
pub mod feedback;
pub mod sim;
pub mod sink;

pub use chain::{TxChain, TxChainConfig};
pub use device::{SdrDevice, SdrError, SdrResult, SdrSinkConfig};
pub use feedback::FeedbackServer;
pub use sim::LoopbackSdr;
pub use sink::SdrSink;
