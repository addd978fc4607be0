//! Messages on the sequencer's event channel.
//!
//! Operator commands and stage completions share one FIFO channel, so the
//! control loop sees them strictly in submission order.

use crate::core::{BatchId, CameraId, DeviceState, ImageRef};
use crate::error::AppResult;
use tokio::sync::oneshot;

/// Operator commands.
#[derive(Debug)]
pub enum SequencerCommand {
    /// Begin a new batch. Only valid from `Idle`.
    StartCycle {
        response: oneshot::Sender<AppResult<BatchId>>,
    },

    /// Clear `Fault`, writing the batch record. Only valid once no stage command is in flight.
    Reset {
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Operator abort: move the running cycle to `Fault`.
    Abort {
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Stop the control loop.
    Shutdown { response: oneshot::Sender<()> },
}

impl SequencerCommand {
    pub fn start_cycle() -> (Self, oneshot::Receiver<AppResult<BatchId>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartCycle { response: tx }, rx)
    }

    pub fn reset() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Reset { response: tx }, rx)
    }

    pub fn abort() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Abort { response: tx }, rx)
    }

    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// What a finished stage produced.
#[derive(Debug)]
pub enum StageOutput {
    /// Conveyor or airflow stage finished its moves.
    Moved,
    Weighed(f64),
    Imaged {
        images: Vec<(CameraId, Option<ImageRef>)>,
        warnings: Vec<String>,
    },
}

#[derive(Debug)]
pub enum SequencerMessage {
    Command(SequencerCommand),
    /// A stage task finished. `epoch` identifies which command it answers.
    StageDone {
        epoch: u64,
        stage: DeviceState,
        result: AppResult<StageOutput>,
    },
}
