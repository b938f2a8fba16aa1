//! Long-running driver of sync cycles.
//!
//! The worker is a small state machine fed by a command channel:
//!
//! ```text
//! Idle ── Start ──> Running <── Unpause ── Paused
//!                     │  └────── Pause ───────┘
//!                     └─ Stop ─> Stopping ─> Stopped
//! ```
//!
//! Stop is accepted in every state, and dropping every [`WorkerHandle`] has
//! the same effect.

use crate::error::{SyncError, SyncResult};
use crate::executor::ExitCause;
use crate::pipeline::SyncPipeline;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};
use twinsync_snapshot::LiveSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, waiting for Start.
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Start,
    Pause,
    Unpause,
    Stop,
}

/// Controls a [`SyncWorker`] from other tasks.
#[derive(Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    state: watch::Receiver<WorkerState>,
    stop: Arc<AtomicBool>,
}

impl WorkerHandle {
    async fn send(&self, command: WorkerCommand) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn start(&self) -> SyncResult<()> {
        self.send(WorkerCommand::Start).await
    }

    /// Takes effect once the running cycle, if any, is over.
    pub async fn pause(&self) -> SyncResult<()> {
        self.send(WorkerCommand::Pause).await
    }

    pub async fn unpause(&self) -> SyncResult<()> {
        self.send(WorkerCommand::Unpause).await
    }

    /// Cancels the running cycle and stops the worker.
    pub async fn stop(&self) -> SyncResult<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.send(WorkerCommand::Stop).await
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Waits until the worker reaches `target`.
    pub async fn wait_for(&self, target: WorkerState) -> SyncResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::ChannelClosed)
    }
}

pub struct SyncWorker {
    pipeline: SyncPipeline,
    local: Arc<LiveSnapshot>,
    remote: Arc<LiveSnapshot>,
    commands: mpsc::Receiver<WorkerCommand>,
    state: watch::Sender<WorkerState>,
    interval: Duration,
}

impl SyncWorker {
    pub fn new(
        pipeline: SyncPipeline,
        local: Arc<LiveSnapshot>,
        remote: Arc<LiveSnapshot>,
    ) -> (Self, WorkerHandle) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        let interval = pipeline.context().config.cycle_interval();
        let handle = WorkerHandle {
            commands: command_tx,
            state: state_rx,
            stop: pipeline.stop_flag(),
        };
        let worker = Self {
            pipeline,
            local,
            remote,
            commands: command_rx,
            state: state_tx,
            interval,
        };
        (worker, handle)
    }

    fn publish(&self, state: WorkerState) {
        debug!(state = ?state, "worker state");
        self.state.send_replace(state);
    }

    /// Runs until stopped.
    pub async fn run(mut self) {
        let mut state = WorkerState::Idle;
        loop {
            state = match state {
                WorkerState::Idle => match self.commands.recv().await {
                    Some(WorkerCommand::Start) => WorkerState::Running,
                    Some(WorkerCommand::Stop) | None => WorkerState::Stopping,
                    Some(other) => {
                        debug!(command = ?other, "ignored while idle");
                        WorkerState::Idle
                    }
                },
                WorkerState::Paused => match self.commands.recv().await {
                    Some(WorkerCommand::Unpause | WorkerCommand::Start) => WorkerState::Running,
                    Some(WorkerCommand::Stop) | None => WorkerState::Stopping,
                    Some(WorkerCommand::Pause) => WorkerState::Paused,
                },
                WorkerState::Running => self.run_once().await,
                WorkerState::Stopping => WorkerState::Stopped,
                WorkerState::Stopped => break,
            };
            self.publish(state);
        }
        info!("sync worker stopped");
    }

    /// One cycle, then the pause before the next. Returns the next state.
    async fn run_once(&mut self) -> WorkerState {
        let mut delay = self.interval;
        match self.pipeline.run_cycle(&self.local, &self.remote).await {
            Ok(report) => {
                if report.execution.exit_cause == ExitCause::Cancelled {
                    return WorkerState::Stopping;
                }
                if report.needs_restart {
                    delay = Duration::ZERO;
                }
            }
            Err(err) => error!(error = %err, "sync cycle failed"),
        }

        tokio::select! {
            biased;
            command = self.commands.recv() => match command {
                Some(WorkerCommand::Pause) => WorkerState::Paused,
                Some(WorkerCommand::Stop) | None => WorkerState::Stopping,
                Some(WorkerCommand::Start | WorkerCommand::Unpause) => WorkerState::Running,
            },
            () = tokio::time::sleep(delay) => WorkerState::Running,
        }
    }
}
