//! # Pipelined Stage Executor
//!
//! A single background thread driving a bounded in/out channel pair.
//! `process` submits the current frame and returns the output of the
//! frame submitted **two calls earlier**, overlapping this stage's
//! computation with the downstream stages' handling of older buffers.
//!
//! The first two outputs are zero-filled frames of the input length with
//! an invalid timestamp; from the third call on, outputs follow inputs
//! in order with the fixed two-buffer delay. This delay is part of the
//! stage contract and must be accounted for end to end.

use std::sync::mpsc::{Receiver, SyncSender};
use std::thread::JoinHandle;

use tracing::debug;

use crate::types::{Frame, ModError, ModResult};

/// Number of calls before real output emerges.
pub const PIPELINE_DELAY: usize = 2;

pub struct PipelinedStage {
    in_tx: Option<SyncSender<Frame>>,
    out_rx: Receiver<Frame>,
    thread: Option<JoinHandle<()>>,
    primed: usize,
}

impl PipelinedStage {
    /// Spawn the stage thread. `work` runs once per submitted frame, on
    /// the stage thread, in submission order.
    pub fn spawn<F>(name: &str, mut work: F) -> ModResult<Self>
    where
        F: FnMut(Frame) -> Frame + Send + 'static,
    {
        let (in_tx, in_rx) = std::sync::mpsc::sync_channel::<Frame>(PIPELINE_DELAY);
        let (out_tx, out_rx) = std::sync::mpsc::sync_channel::<Frame>(PIPELINE_DELAY);

        let thread_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Ok(frame) = in_rx.recv() {
                    if out_tx.send(work(frame)).is_err() {
                        break;
                    }
                }
                debug!("pipelined stage '{}' exiting", thread_name);
            })
            .map_err(|e| ModError::Config(format!("failed to spawn stage '{name}': {e}")))?;

        Ok(Self {
            in_tx: Some(in_tx),
            out_rx,
            thread: Some(thread),
            primed: 0,
        })
    }

    /// Submit a frame, returning the delayed output (or filler while the
    /// pipeline is priming).
    pub fn process(&mut self, frame: Frame) -> ModResult<Frame> {
        let len = frame.len();
        let in_tx = self.in_tx.as_ref().ok_or(ModError::StageStopped)?;
        in_tx.send(frame).map_err(|_| ModError::StageStopped)?;

        if self.primed < PIPELINE_DELAY {
            self.primed += 1;
            return Ok(Frame::silence(len));
        }
        self.out_rx.recv().map_err(|_| ModError::StageStopped)
    }
}

impl Drop for PipelinedStage {
    fn drop(&mut self) {
        // Closing the input channel is the stage's terminate signal.
        self.in_tx.take();
        while self.out_rx.try_recv().is_ok() {}
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
