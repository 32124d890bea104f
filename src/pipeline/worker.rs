use std::sync::Arc;
use std::time::Instant;

use flume::{Receiver, Sender};
use tracing::{debug, warn};

use crate::capture::frame::{FrameTicket, LensImageTask, LensTag};
use crate::pipeline::encoder::ImageEncoder;
use crate::stats::PipelineStats;
use crate::transport::envelope::CompressedImage;
use crate::utils;

/// Result of one lens task. Every task yields exactly one.
#[derive(Debug)]
pub enum WorkerOutput {
    Encoded {
        ticket: FrameTicket,
        image: CompressedImage,
    },
    /// Encoding failed; the lens is left out of its envelope
    Dropped {
        ticket: FrameTicket,
        lens: LensTag,
        reason: String,
    },
}

impl WorkerOutput {
    pub fn ticket(&self) -> &FrameTicket {
        match self {
            WorkerOutput::Encoded { ticket, .. } | WorkerOutput::Dropped { ticket, .. } => ticket,
        }
    }

    pub fn lens(&self) -> LensTag {
        match self {
            WorkerOutput::Encoded { image, .. } => image.lens_type,
            WorkerOutput::Dropped { lens, .. } => *lens,
        }
    }
}

pub struct CompressionWorker {
    id: usize,
    encoder: Box<dyn ImageEncoder>,
    tasks: Receiver<LensImageTask>,
    ready: Sender<usize>,
    outputs: Sender<WorkerOutput>,
    stats: Arc<PipelineStats>,
    pin: bool,
}

impl CompressionWorker {
    pub fn new(
        id: usize,
        encoder: Box<dyn ImageEncoder>,
        tasks: Receiver<LensImageTask>,
        ready: Sender<usize>,
        outputs: Sender<WorkerOutput>,
        stats: Arc<PipelineStats>,
        pin: bool,
    ) -> Self {
        Self {
            id,
            encoder,
            tasks,
            ready,
            outputs,
            stats,
            pin,
        }
    }

    /// Signal ready, take one task, encode, hand the result on. Returns once
    /// the dispatcher or the forwarder goes away.
    pub fn run(mut self) {
        if self.pin {
            utils::pin_current_thread(self.id);
        }

        loop {
            if self.ready.send(self.id).is_err() {
                break;
            }
            let Ok(task) = self.tasks.recv() else {
                break;
            };
            let output = self.process(task);
            if self.outputs.send(output).is_err() {
                break;
            }
        }
        debug!("Worker {} exiting", self.id);
    }

    pub fn process(&mut self, task: LensImageTask) -> WorkerOutput {
        let started = Instant::now();
        let result = self.encoder.compress(
            &task.data,
            task.width,
            task.stride,
            task.height,
            task.format,
            task.quality,
        );
        let LensImageTask {
            ticket,
            lens,
            data,
            width,
            height,
            ..
        } = task;
        // Raw pixels are released as soon as the encoder is done with them
        drop(data);

        match result {
            Ok(jpeg) => {
                metrics::histogram!("panostream_encode_us")
                    .record(started.elapsed().as_micros() as f64);
                self.stats.image_encoded();
                WorkerOutput::Encoded {
                    ticket,
                    image: CompressedImage::new(jpeg, lens, width, height, ticket.timestamp),
                }
            }
            Err(e) => {
                warn!(
                    "Worker {} failed to encode {} of frame {}: {}",
                    self.id, lens, ticket.sequence, e
                );
                self.stats.encode_failed();
                WorkerOutput::Dropped {
                    ticket,
                    lens,
                    reason: e.to_string(),
                }
            }
        }
    }
}
