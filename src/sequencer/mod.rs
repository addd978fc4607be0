//! Batch sequencer.
//!
//! `SequencerFSM` is an actor: one task owns the `DeviceState` and the current
//! `Batch`, and everything that can change them arrives on a single FIFO channel.
//! Operator commands come from a `SequencerHandle`; stage completions come from
//! the stage tasks the loop spawns. Transitions therefore cannot race.
//!
//! ```text
//! Idle -> Loading -> Separating -> Weighing -> Imaging -> Unloading -> Idle
//!            \____________\___________\__________\___________\---> Fault -> (Reset) -> Idle
//! ```
//!
//! Every stage has a deadline from `StageTimeouts`. If the stage result does
//! not arrive in time the batch faults with `StageTimeout` (`SensorTimeout` for
//! weighing). Each spawned stage carries an epoch; a result whose epoch is no
//! longer in flight is a late answer and is discarded.
//!
//! `Reset` is refused while a stage command is still in flight, which can only
//! happen after an operator `Abort`: the command has to complete or reach its
//! deadline first.

pub mod messages;
pub mod stability;
pub mod stages;

pub use messages::{SequencerCommand, SequencerMessage, StageOutput};
pub use stability::StabilityFilter;
pub use stages::{RecordingAutoStop, StagePorts};

use crate::config::SequencerConfig;
use crate::core::{Batch, BatchId, DeviceState, RecordStatus};
use crate::error::{AppResult, SsrError};
use crate::storage::records::SampleRecordStore;
use chrono::{DateTime, Utc};
use stages::StageRunner;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// One state transition, as broadcast to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub batch: Option<BatchId>,
    pub from: DeviceState,
    pub to: DeviceState,
    pub at: DateTime<Utc>,
    /// Fault reason when `to` is `Fault`.
    pub error: Option<String>,
}

struct InFlight {
    epoch: u64,
    stage: DeviceState,
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// The control loop. Construct with `SequencerFSM::spawn`.
pub struct SequencerFSM {
    state: DeviceState,
    batch: Option<Batch>,
    epoch: u64,
    in_flight: Option<InFlight>,
    runner: Arc<StageRunner>,
    store: Arc<dyn SampleRecordStore>,
    config: SequencerConfig,
    state_tx: watch::Sender<DeviceState>,
    transitions: broadcast::Sender<StateChange>,
    events: mpsc::WeakSender<SequencerMessage>,
}

impl SequencerFSM {
    /// Spawn the control loop and return a handle to it.
    pub fn spawn(
        config: SequencerConfig,
        ports: StagePorts,
        store: Arc<dyn SampleRecordStore>,
    ) -> (SequencerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(DeviceState::Idle);
        let (transitions, _) = broadcast::channel(config.event_channel_capacity.max(16));

        let fsm = Self {
            state: DeviceState::Idle,
            batch: None,
            epoch: 0,
            in_flight: None,
            runner: Arc::new(StageRunner::new(ports, config.clone())),
            store,
            config,
            state_tx,
            transitions: transitions.clone(),
            events: tx.downgrade(),
        };
        let task = tokio::spawn(fsm.run(rx).instrument(info_span!("sequencer")));

        let handle = SequencerHandle {
            tx,
            state: state_rx,
            transitions,
        };
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SequencerMessage>) {
        info!("Sequencer control loop started");
        loop {
            let deadline = self.in_flight.as_ref().map(|f| f.deadline);
            let message = tokio::select! {
                biased;
                message = rx.recv() => message,
                () = sleep_until(deadline) => {
                    self.on_deadline();
                    continue;
                }
            };

            match message {
                Some(SequencerMessage::Command(SequencerCommand::Shutdown { response })) => {
                    self.drain_in_flight().await;
                    self.flush_partial_batch().await;
                    let _ = response.send(());
                    break;
                }
                Some(SequencerMessage::Command(command)) => self.handle_command(command).await,
                Some(SequencerMessage::StageDone {
                    epoch,
                    stage,
                    result,
                }) => self.on_stage_done(epoch, stage, result).await,
                None => break,
            }
        }
        info!("Sequencer control loop stopped");
    }

    async fn handle_command(&mut self, command: SequencerCommand) {
        match command {
            SequencerCommand::StartCycle { response } => {
                let _ = response.send(self.start_cycle());
            }
            SequencerCommand::Reset { response } => {
                let _ = response.send(self.reset().await);
            }
            SequencerCommand::Abort { response } => {
                let _ = response.send(self.abort());
            }
            SequencerCommand::Shutdown { response } => {
                let _ = response.send(());
            }
        }
    }

    fn start_cycle(&mut self) -> AppResult<BatchId> {
        if self.state != DeviceState::Idle {
            return Err(SsrError::AlreadyRunning(self.state));
        }
        let batch = Batch::new();
        let id = batch.id;
        self.batch = Some(batch);
        info!(batch = %id, "Cycle started");
        self.enter_stage(DeviceState::Loading);
        Ok(id)
    }

    fn abort(&mut self) -> AppResult<()> {
        match self.state {
            DeviceState::Idle => Err(SsrError::InvalidTransition {
                from: DeviceState::Idle,
                reason: "no cycle to abort".to_string(),
            }),
            DeviceState::Fault => Ok(()),
            _ => {
                if let Some(batch) = self.batch.as_mut() {
                    batch.aborted = true;
                }
                warn!("Cycle aborted by operator");
                self.fault("aborted by operator".to_string());
                Ok(())
            }
        }
    }

    async fn reset(&mut self) -> AppResult<()> {
        if self.state != DeviceState::Fault {
            return Err(SsrError::InvalidTransition {
                from: self.state,
                reason: "reset is only valid from Fault".to_string(),
            });
        }
        if let Some(in_flight) = &self.in_flight {
            return Err(SsrError::InvalidTransition {
                from: DeviceState::Fault,
                reason: format!("{:?} command still in flight", in_flight.stage),
            });
        }

        if let Some(batch) = &self.batch {
            let status = if batch.aborted {
                RecordStatus::Aborted
            } else {
                RecordStatus::Faulted
            };
            let record = batch.clone().into_record(status);
            self.store.append(&record).await?;
            info!(batch = %record.batch_id, %status, "Record written");
        }
        self.batch = None;
        self.transition(DeviceState::Idle, None);
        Ok(())
    }

    fn enter_stage(&mut self, stage: DeviceState) {
        self.transition(stage, None);
        if let Some(batch) = self.batch.as_mut() {
            batch.timestamps.mark(stage, Utc::now());
        }

        let Some(events) = self.events.upgrade() else {
            error!("Event channel closed; cannot run stage");
            return;
        };
        let Some(batch) = self.batch.as_ref().map(|b| b.id) else {
            error!(?stage, "Stage entered without a batch");
            return;
        };

        self.epoch += 1;
        let epoch = self.epoch;
        let timeout = self.config.timeouts.for_stage(stage).unwrap_or(Duration::ZERO);
        let runner = Arc::clone(&self.runner);
        let handle = tokio::spawn(
            async move {
                let result = runner.run(stage, batch).await;
                let _ = events
                    .send(SequencerMessage::StageDone {
                        epoch,
                        stage,
                        result,
                    })
                    .await;
            }
            .instrument(info_span!("stage", ?stage, %batch)),
        );
        self.in_flight = Some(InFlight {
            epoch,
            stage,
            deadline: Instant::now() + timeout,
            handle,
        });
    }

    async fn on_stage_done(&mut self, epoch: u64, stage: DeviceState, result: AppResult<StageOutput>) {
        let current = self.in_flight.as_ref().map(|f| f.epoch);
        if current != Some(epoch) {
            debug!(?stage, epoch, "Discarding late stage result");
            return;
        }
        self.in_flight = None;

        if self.state != stage {
            debug!(?stage, state = ?self.state, "Stage acknowledged after leaving it");
            return;
        }

        match result {
            Ok(output) => {
                self.apply(output);
                match stage.next_stage() {
                    Some(DeviceState::Idle) => self.complete().await,
                    Some(next) => self.enter_stage(next),
                    None => {}
                }
            }
            Err(e) => {
                error!(?stage, error = %e, "Stage failed");
                self.fault(e.to_string());
            }
        }
    }

    fn apply(&mut self, output: StageOutput) {
        let Some(batch) = self.batch.as_mut() else {
            return;
        };
        match output {
            StageOutput::Moved => {}
            StageOutput::Weighed(grams) => {
                info!(batch = %batch.id, grams, "Weight recorded");
                batch.weight_g = Some(grams);
            }
            StageOutput::Imaged { images, warnings } => {
                batch.images.extend(images);
                batch.warnings.extend(warnings);
            }
        }
    }

    /// Unloading finished: write the completed record and return to `Idle`.
    async fn complete(&mut self) {
        let Some(batch) = self.batch.take() else {
            self.transition(DeviceState::Idle, None);
            return;
        };
        let record = batch.clone().into_record(RecordStatus::Completed);
        match self.store.append(&record).await {
            Ok(()) => {
                info!(
                    batch = %record.batch_id,
                    weight_g = ?record.weight_g,
                    warning = record.warning,
                    "Cycle completed"
                );
                self.transition(DeviceState::Idle, None);
            }
            Err(e) => {
                error!(batch = %batch.id, error = %e, "Failed to write record");
                self.batch = Some(batch);
                self.fault(e.to_string());
            }
        }
    }

    fn on_deadline(&mut self) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        let stage = in_flight.stage;
        let timeout = self.config.timeouts.for_stage(stage).unwrap_or_default();
        if stage == DeviceState::Weighing {
            // Sampling never settles on its own; reads are safe to cancel.
            in_flight.handle.abort();
        }

        if self.state != stage {
            // Aborted while in flight: the command now has its timeout outcome.
            info!(?stage, "In-flight command timed out after abort");
            return;
        }

        let err = if stage == DeviceState::Weighing {
            SsrError::SensorTimeout(format!(
                "no stable reading within {} ms",
                timeout.as_millis()
            ))
        } else {
            SsrError::StageTimeout {
                stage,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
        };
        error!(?stage, error = %err, "Stage deadline expired");
        self.fault(err.to_string());
    }

    /// Wait for an in-flight command to finish or reach its deadline.
    async fn drain_in_flight(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            let stage = in_flight.stage;
            let mut handle = in_flight.handle;
            if tokio::time::timeout_at(in_flight.deadline, &mut handle).await.is_err() {
                warn!(?stage, "Stage still running at shutdown; cancelling");
                handle.abort();
            }
        }
    }

    /// Write whatever batch is left at shutdown so it is not lost.
    async fn flush_partial_batch(&mut self) {
        let Some(mut batch) = self.batch.take() else {
            return;
        };
        let status = if batch.aborted || self.state.is_stage() {
            RecordStatus::Aborted
        } else {
            RecordStatus::Faulted
        };
        batch
            .fault
            .get_or_insert_with(|| format!("shut down during {}", self.state));
        let record = batch.into_record(status);
        match self.store.append(&record).await {
            Ok(()) => info!(batch = %record.batch_id, %status, "Partial record written at shutdown"),
            Err(e) => error!(batch = %record.batch_id, error = %e, "Failed to write partial record"),
        }
    }

    fn fault(&mut self, reason: String) {
        if let Some(batch) = self.batch.as_mut() {
            batch.fault.get_or_insert_with(|| reason.clone());
        }
        self.transition(DeviceState::Fault, Some(reason));
    }

    fn transition(&mut self, to: DeviceState, error: Option<String>) {
        let from = self.state;
        if !from.can_transition_to(to) {
            error!(?from, ?to, "Refusing illegal transition");
            return;
        }
        self.state = to;
        if let Some(batch) = self.batch.as_mut() {
            batch.state = to;
        }
        self.state_tx.send_replace(to);
        info!(?from, ?to, "State transition");
        let _ = self.transitions.send(StateChange {
            batch: self.batch.as_ref().map(|b| b.id),
            from,
            to,
            at: Utc::now(),
            error,
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cheap, cloneable front end of the control loop.
#[derive(Clone)]
pub struct SequencerHandle {
    tx: mpsc::Sender<SequencerMessage>,
    state: watch::Receiver<DeviceState>,
    transitions: broadcast::Sender<StateChange>,
}

impl SequencerHandle {
    async fn request<T>(
        &self,
        command: SequencerCommand,
        response: tokio::sync::oneshot::Receiver<T>,
    ) -> AppResult<T> {
        self.tx
            .send(SequencerMessage::Command(command))
            .await
            .map_err(|_| SsrError::ShutDown)?;
        response.await.map_err(|_| SsrError::ShutDown)
    }

    /// Start a new cycle. Fails with `AlreadyRunning` unless the device is `Idle`.
    pub async fn start_cycle(&self) -> AppResult<BatchId> {
        let (command, rx) = SequencerCommand::start_cycle();
        self.request(command, rx).await?
    }

    /// Return from `Fault` to `Idle`, writing the faulted or aborted record.
    pub async fn reset(&self) -> AppResult<()> {
        let (command, rx) = SequencerCommand::reset();
        self.request(command, rx).await?
    }

    pub async fn abort(&self) -> AppResult<()> {
        let (command, rx) = SequencerCommand::abort();
        self.request(command, rx).await?
    }

    /// Stop the control loop after the in-flight command resolves.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (command, rx) = SequencerCommand::shutdown();
        self.request(command, rx).await
    }

    #[must_use]
    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<DeviceState> {
        self.state.clone()
    }

    /// Subscribe to transitions. Dropping the receiver unsubscribes.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateChange> {
        self.transitions.subscribe()
    }

    /// Wait until the device reaches `target`, for at most `timeout`.
    pub async fn wait_for_state(&self, target: DeviceState, timeout: Duration) -> AppResult<()> {
        let mut rx = self.state.clone();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == target {
                    return Ok(());
                }
                rx.changed().await.map_err(|_| SsrError::ShutDown)?;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SsrError::InvalidParameter(format!("{target:?} not reached within {timeout:?}")))?
    }
}
