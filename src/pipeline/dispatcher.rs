//! Credit-based fan-out of lens tasks to the compression pool

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{trace, warn};

use crate::capture::frame::{LensImageTask, RawFrame};
use crate::error::{Error, Result};
use crate::stats::PipelineStats;
use crate::utils::StopFlag;

/// Slice of the ready wait between stop-flag checks
const POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every lens of the frame went to a worker
    Dispatched,
    /// The run stopped before the frame was fully handed out
    Abandoned,
}

/// Hands each lens task to exactly one idle worker.
///
/// A worker earns a credit by sending its id on the ready channel and spends
/// it on the single task it is then given. Task channels have capacity 1, so
/// a send to a credited worker never blocks.
pub struct Dispatcher {
    workers: Vec<Sender<LensImageTask>>,
    ready: Receiver<usize>,
    credits: Vec<bool>,
    ready_wait: Duration,
    stop: StopFlag,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    pub fn new(
        workers: Vec<Sender<LensImageTask>>,
        ready: Receiver<usize>,
        ready_wait: Duration,
        stop: StopFlag,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            credits: vec![false; workers.len()],
            workers,
            ready,
            ready_wait,
            stop,
            stats,
        }
    }

    /// Offer the lenses of `frame` in index order, blocking until a worker
    /// is free for each one.
    pub fn dispatch(&mut self, frame: RawFrame, quality: u8) -> Result<DispatchOutcome> {
        let sequence = frame.sequence;
        for task in frame.into_tasks(quality) {
            let Some(worker) = self.acquire()? else {
                return Ok(DispatchOutcome::Abandoned);
            };
            self.credits[worker] = false;
            trace!(sequence, lens = %task.lens, worker, "dispatch");
            self.workers[worker]
                .send(task)
                .map_err(|_| Error::UnhandledFault(format!("worker {worker} task channel closed")))?;
        }
        Ok(DispatchOutcome::Dispatched)
    }

    fn credit(&mut self, worker: usize) -> Result<()> {
        match self.credits.get_mut(worker) {
            Some(credit) if !*credit => {
                *credit = true;
                Ok(())
            }
            Some(_) => Err(Error::UnhandledFault(format!(
                "worker {worker} signalled ready twice"
            ))),
            None => Err(Error::UnhandledFault(format!("unknown worker id {worker}"))),
        }
    }

    /// Wait for a credited worker. `None` once the run is stopping.
    fn acquire(&mut self) -> Result<Option<usize>> {
        while let Ok(worker) = self.ready.try_recv() {
            self.credit(worker)?;
        }

        let mut waited = Duration::ZERO;
        loop {
            if let Some(worker) = self.credits.iter().position(|c| *c) {
                return Ok(Some(worker));
            }
            if self.stop.is_stopped() {
                return Ok(None);
            }

            match self.ready.recv_timeout(POLL) {
                Ok(worker) => self.credit(worker)?,
                Err(RecvTimeoutError::Timeout) => {
                    waited += POLL;
                    if waited >= self.ready_wait {
                        warn!("No worker ready after {:?}, still waiting", waited);
                        self.stats.dispatcher_stalled();
                        waited = Duration::ZERO;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::UnhandledFault("worker ready channel closed".into()));
                }
            }
        }
    }
}
