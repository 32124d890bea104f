//! Process lifetime: builds a pipeline run, watches it, and rebuilds it
//! after fatal faults

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::driver::CameraDriver;
use crate::capture::simulator::SimulatedCamera;
use crate::error::{Error, Result};
use crate::pipeline::encoder::{ImageEncoder, JpegCompressor};
use crate::pipeline::{EncoderFactory, Pipeline};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::transport::{Publish, TcpPublisher};
use crate::{CaptureConfig, Config, TransportConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Init,
    Running,
    Error,
    Teardown,
    Stopped,
}

impl SupervisorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SupervisorState::Init,
            1 => SupervisorState::Running,
            2 => SupervisorState::Error,
            3 => SupervisorState::Teardown,
            _ => SupervisorState::Stopped,
        }
    }
}

/// Messages to the supervisor loop
#[derive(Debug)]
pub enum Control {
    /// A stage of run `run` failed
    Fault { run: u64, error: Error },
    Shutdown,
    /// Tear down and rebuild with the current config
    Restart,
}

pub type CameraFactory =
    Arc<dyn Fn(&CaptureConfig) -> Result<Box<dyn CameraDriver>> + Send + Sync>;
pub type TransportFactory =
    Arc<dyn Fn(&TransportConfig) -> Result<Box<dyn Publish>> + Send + Sync>;

/// Builders for everything a run needs from the outside world. Called
/// afresh for every run.
#[derive(Clone)]
pub struct Collaborators {
    pub camera: CameraFactory,
    pub encoder: EncoderFactory,
    pub transport: TransportFactory,
}

impl Default for Collaborators {
    /// Simulated camera, JPEG encoder, TCP publisher
    fn default() -> Self {
        Self {
            camera: Arc::new(|config: &CaptureConfig| -> Result<Box<dyn CameraDriver>> {
                Ok(Box::new(SimulatedCamera::new(config.simulator.clone())))
            }),
            encoder: Arc::new(|_: usize| -> Box<dyn ImageEncoder> {
                Box::new(JpegCompressor::new())
            }),
            transport: Arc::new(|config: &TransportConfig| -> Result<Box<dyn Publish>> {
                Ok(Box::new(TcpPublisher::from_config(config)?))
            }),
        }
    }
}

/// Cloneable control surface of a running [`Supervisor`]
#[derive(Clone)]
pub struct SupervisorHandle {
    control: Sender<Control>,
    state: Arc<AtomicU8>,
    stats: Arc<PipelineStats>,
}

impl SupervisorHandle {
    /// Ask `run()` to tear down and return
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }

    /// Force a teardown/init cycle, picking up the current config
    pub fn restart(&self) {
        let _ = self.control.send(Control::Restart);
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

enum RunEnd {
    Shutdown,
    Restart,
    Fault(Error),
}

pub struct Supervisor {
    config: Arc<ArcSwap<Config>>,
    collaborators: Collaborators,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    state: Arc<AtomicU8>,
    stats: Arc<PipelineStats>,
    run: u64,
}

impl Supervisor {
    pub fn new(config: Arc<ArcSwap<Config>>, collaborators: Collaborators) -> Self {
        let (control_tx, control_rx) = flume::unbounded();
        Self {
            config,
            collaborators,
            control_tx,
            control_rx,
            state: Arc::new(AtomicU8::new(SupervisorState::Init as u8)),
            stats: Arc::new(PipelineStats::new()),
            run: 0,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            control: self.control_tx.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
        }
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = SupervisorState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            info!("Supervisor {:?} -> {:?}", previous, state);
        }
    }

    /// Keep a pipeline running until shutdown. Hardware and network faults
    /// never end this loop, they only cost a restart.
    #[instrument(skip_all)]
    pub fn run(mut self) {
        loop {
            self.set_state(SupervisorState::Init);
            self.run += 1;
            let config = self.config.load_full();

            let end = match self.start_run(&config) {
                Ok(mut pipeline) => {
                    self.set_state(SupervisorState::Running);
                    let end = self.watch(self.run);
                    if !matches!(end, RunEnd::Shutdown) {
                        if let RunEnd::Fault(e) = &end {
                            self.set_state(SupervisorState::Error);
                            error!("Run {} failed: {}", self.run, e);
                        }
                        self.set_state(SupervisorState::Teardown);
                    }
                    pipeline.teardown();
                    end
                }
                Err(e) => {
                    self.set_state(SupervisorState::Error);
                    error!("Run {} failed to start: {}", self.run, e);
                    self.set_state(SupervisorState::Teardown);
                    RunEnd::Fault(e)
                }
            };

            if matches!(end, RunEnd::Shutdown) {
                break;
            }
            self.stats.restarted();
            if !self.wait_restart(config.supervisor.restart_delay()) {
                break;
            }
        }
        self.set_state(SupervisorState::Stopped);
        info!("Supervisor stopped");
    }

    fn start_run(&self, config: &Config) -> Result<Pipeline> {
        let camera = (self.collaborators.camera)(&config.capture)?;
        let publisher = (self.collaborators.transport)(&config.transport)?;
        Pipeline::launch(
            self.run,
            config,
            camera,
            &self.collaborators.encoder,
            publisher,
            self.control_tx.clone(),
            self.stats.clone(),
        )
    }

    /// Block until the run needs to end
    fn watch(&self, run: u64) -> RunEnd {
        loop {
            match self.control_rx.recv() {
                Ok(Control::Fault { run: from, error }) if from != run => {
                    debug!("Ignoring stale fault from run {}: {}", from, error);
                }
                Ok(Control::Fault { error, .. }) if !error.is_fatal() => {
                    warn!("Run {} reported: {}", run, error);
                }
                Ok(Control::Fault { error, .. }) => return RunEnd::Fault(error),
                Ok(Control::Restart) => {
                    info!("Restart requested");
                    return RunEnd::Restart;
                }
                // The supervisor holds a sender itself, so this only ends on request
                Ok(Control::Shutdown) | Err(_) => return RunEnd::Shutdown,
            }
        }
    }

    /// Sit out the restart delay. Returns `false` if shutdown arrived.
    fn wait_restart(&self, delay: Duration) -> bool {
        info!("Restarting in {:?}", delay);
        let deadline = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            match self.control_rx.recv_timeout(deadline - now) {
                Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
                Ok(other) => debug!("Ignoring {:?} while restarting", other),
                Err(RecvTimeoutError::Timeout) => return true,
            }
        }
    }
}
