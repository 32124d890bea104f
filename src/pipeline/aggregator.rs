//! Frame reassembly and the forwarding stage

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::capture::frame::{FrameTicket, LensTag};
use crate::error::{EnvelopeError, Error, Result};
use crate::pipeline::worker::WorkerOutput;
use crate::stats::PipelineStats;
use crate::transport::envelope::{self, CompressedImage, OutboundEnvelope};
use crate::transport::Publish;
use crate::utils::StopFlag;

const POLL: Duration = Duration::from_millis(20);

struct PendingFrame {
    ticket: FrameTicket,
    images: Vec<CompressedImage>,
    /// Lenses with an output so far, encoded or dropped
    settled: Vec<LensTag>,
}

/// Collects worker outputs per frame and emits one envelope once every
/// lens of the frame has settled.
pub struct Aggregator {
    lens_limit: usize,
    device_name: String,
    camera_name: String,
    pending: BTreeMap<u64, PendingFrame>,
}

impl Aggregator {
    pub fn new(lens_limit: usize, device_name: String, camera_name: String) -> Self {
        Self {
            lens_limit,
            device_name,
            camera_name,
            pending: BTreeMap::new(),
        }
    }

    /// Record one output. Returns the envelope when its frame is complete;
    /// a frame whose every lens failed completes with nothing to send.
    pub fn accept(&mut self, output: WorkerOutput) -> Result<Option<OutboundEnvelope>> {
        let ticket = *output.ticket();
        let lens = output.lens();
        let frame = self
            .pending
            .entry(ticket.sequence)
            .or_insert_with(|| PendingFrame {
                ticket,
                images: Vec::with_capacity(ticket.lens_count),
                settled: Vec::with_capacity(ticket.lens_count),
            });

        if frame.settled.contains(&lens) {
            return Err(EnvelopeError::DuplicateLens(lens).into());
        }
        if frame.settled.len() >= frame.ticket.lens_count.min(self.lens_limit) {
            return Err(EnvelopeError::TooManyImages {
                count: frame.settled.len() + 1,
                limit: frame.ticket.lens_count.min(self.lens_limit),
            }
            .into());
        }

        frame.settled.push(lens);
        if let WorkerOutput::Encoded { image, .. } = output {
            frame.images.push(image);
        }
        if frame.settled.len() < frame.ticket.lens_count {
            return Ok(None);
        }

        let Some(mut frame) = self.pending.remove(&ticket.sequence) else {
            return Ok(None);
        };
        if frame.images.is_empty() {
            warn!("Frame {} lost every lens, nothing to send", ticket.sequence);
            return Ok(None);
        }
        frame.images.sort_by_key(|image| image.lens_type);

        let envelope = OutboundEnvelope {
            request_id: ticket.sequence,
            device_name: self.device_name.clone(),
            camera_name: self.camera_name.clone(),
            images: frame.images,
        };
        envelope.validate(self.lens_limit)?;
        Ok(Some(envelope))
    }

    /// Drop every incomplete frame, returning how many there were.
    pub fn discard_pending(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }
}

/// Drains worker outputs, publishes complete envelopes, and owns the
/// publisher for the run.
pub struct Forwarder {
    aggregator: Aggregator,
    publisher: Box<dyn Publish>,
    outputs: Receiver<WorkerOutput>,
    stop: StopFlag,
    stats: Arc<PipelineStats>,
}

impl Forwarder {
    pub fn new(
        aggregator: Aggregator,
        publisher: Box<dyn Publish>,
        outputs: Receiver<WorkerOutput>,
        stop: StopFlag,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            aggregator,
            publisher,
            outputs,
            stop,
            stats,
        }
    }

    /// Forward until the run stops or every worker has exited. Transport
    /// failures end the run; bad frames are logged and skipped.
    pub fn run(mut self) -> Result<()> {
        let result = self.forward_all();

        let discarded = self.aggregator.discard_pending();
        if discarded > 0 {
            info!("Discarded {} partial frame(s)", discarded);
            self.stats.partial_frames_discarded(discarded as u64);
        }
        self.publisher.close();
        result
    }

    fn forward_all(&mut self) -> Result<()> {
        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }
            let output = match self.outputs.recv_timeout(POLL) {
                Ok(output) => output,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            };

            match self.aggregator.accept(output) {
                Ok(Some(envelope)) => self.publish(&envelope)?,
                Ok(None) => {}
                Err(e) => {
                    warn!("Rejected worker output: {}", e);
                    self.stats.output_rejected();
                }
            }
        }
    }

    fn publish(&mut self, envelope: &OutboundEnvelope) -> Result<()> {
        let wire = envelope::encode(envelope)?;
        metrics::histogram!("panostream_envelope_bytes").record(wire.len() as f64);

        let outcome = self.publisher.publish(wire)?;
        self.stats.envelope_published();
        debug!(
            request_id = envelope.request_id,
            images = envelope.images.len(),
            jpeg_bytes = envelope.payload_size(),
            links = outcome.links,
            "Published envelope"
        );
        if outcome.dropped > 0 {
            let full = Error::TransportFull {
                dropped: outcome.dropped,
            };
            debug!("{}", full);
            self.stats.envelopes_dropped(outcome.dropped as u64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use flume::unbounded;

    use super::*;
    use crate::capture::frame::CameraTimestamp;
    use crate::error::TransportError;
    use crate::transport::PublishOutcome;

    fn ticket(sequence: u64, lens_count: usize) -> FrameTicket {
        FrameTicket {
            sequence,
            timestamp: CameraTimestamp {
                seconds: sequence as u32,
                ..Default::default()
            },
            lens_count,
        }
    }

    fn encoded(sequence: u64, lens: LensTag) -> WorkerOutput {
        let ticket = ticket(sequence, 6);
        WorkerOutput::Encoded {
            ticket,
            image: CompressedImage::new(vec![0xFF, 0xD8], lens, 4, 4, ticket.timestamp),
        }
    }

    fn dropped(sequence: u64, lens: LensTag) -> WorkerOutput {
        WorkerOutput::Dropped {
            ticket: ticket(sequence, 6),
            lens,
            reason: "test".into(),
        }
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(6, "windows".into(), "ladybug5".into())
    }

    #[test]
    fn out_of_order_outputs_assemble_sorted_envelope() {
        let mut agg = aggregator();
        let order = [5, 2, 0, 4, 1, 3];
        for (i, idx) in order.into_iter().enumerate() {
            let out = agg.accept(encoded(9, LensTag::LENSES[idx])).unwrap();
            if i < 5 {
                assert!(out.is_none());
            } else {
                let env = out.unwrap();
                assert_eq!(env.request_id, 9);
                let tags: Vec<u32> = env.images.iter().map(|i| i.lens_type.bits()).collect();
                assert_eq!(tags, vec![1, 2, 4, 8, 16, 32]);
                assert!(env.images.iter().all(|i| i.timestamp.seconds == 9));
            }
        }
        assert_eq!(agg.pending_frames(), 0);
    }

    #[test]
    fn dropped_lens_is_left_out() {
        let mut agg = aggregator();
        let mut result = None;
        for lens in LensTag::LENSES {
            let out = if lens == LensTag::Cam3 {
                dropped(1, lens)
            } else {
                encoded(1, lens)
            };
            result = agg.accept(out).unwrap();
        }
        let env = result.unwrap();
        assert_eq!(env.images.len(), 5);
        assert!(env.images.iter().all(|i| i.lens_type != LensTag::Cam3));
    }

    #[test]
    fn all_failed_frame_emits_nothing() {
        let mut agg = aggregator();
        for lens in LensTag::LENSES {
            assert!(agg.accept(dropped(2, lens)).unwrap().is_none());
        }
        assert_eq!(agg.pending_frames(), 0);
    }

    #[test]
    fn frames_interleave_independently() {
        let mut agg = aggregator();
        for lens in &LensTag::LENSES[..5] {
            agg.accept(encoded(1, *lens)).unwrap();
            agg.accept(encoded(2, *lens)).unwrap();
        }
        let second = agg.accept(encoded(2, LensTag::Cam5)).unwrap().unwrap();
        assert_eq!(second.request_id, 2);
        assert_eq!(agg.pending_frames(), 1);
        assert_eq!(agg.discard_pending(), 1);
    }

    #[test]
    fn duplicate_lens_is_rejected() {
        let mut agg = aggregator();
        agg.accept(encoded(1, LensTag::Cam0)).unwrap();
        assert!(matches!(
            agg.accept(encoded(1, LensTag::Cam0)),
            Err(Error::Envelope(EnvelopeError::DuplicateLens(LensTag::Cam0)))
        ));
    }

    #[test]
    fn outputs_beyond_lens_limit_are_rejected() {
        let mut agg = Aggregator::new(2, "d".into(), "c".into());
        agg.accept(encoded(1, LensTag::Cam0)).unwrap();
        agg.accept(encoded(1, LensTag::Cam1)).unwrap();
        assert!(matches!(
            agg.accept(encoded(1, LensTag::Cam2)),
            Err(Error::Envelope(EnvelopeError::TooManyImages { .. }))
        ));
    }

    /// Publisher that records payloads and reports a fixed eviction count
    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<Bytes>>>,
        closed: Arc<Mutex<bool>>,
        fail: bool,
    }

    impl Publish for Recorder {
        fn publish(&mut self, payload: Bytes) -> std::result::Result<PublishOutcome, TransportError> {
            if self.fail {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(payload);
            Ok(PublishOutcome {
                links: 1,
                dropped: 1,
            })
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    #[test]
    fn forwarder_publishes_and_discards_partials_on_exit() {
        let recorder = Recorder::default();
        let stats = Arc::new(PipelineStats::new());
        let (tx, rx) = unbounded();
        for lens in LensTag::LENSES {
            tx.send(encoded(1, lens)).unwrap();
        }
        tx.send(encoded(2, LensTag::Cam0)).unwrap();
        tx.send(encoded(2, LensTag::Cam0)).unwrap();
        drop(tx);

        Forwarder::new(
            aggregator(),
            Box::new(recorder.clone()),
            rx,
            StopFlag::new(),
            stats.clone(),
        )
        .run()
        .unwrap();

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let env = envelope::decode(&sent[0]).unwrap();
        assert_eq!(env.images.len(), 6);
        assert!(*recorder.closed.lock().unwrap());

        let snap = stats.snapshot();
        assert_eq!(snap.envelopes_published, 1);
        assert_eq!(snap.envelopes_dropped, 1);
        assert_eq!(snap.partial_frames_discarded, 1);
        assert_eq!(snap.rejected_outputs, 1);
    }

    #[test]
    fn publish_failure_ends_the_run() {
        let recorder = Recorder {
            fail: true,
            ..Default::default()
        };
        let (tx, rx) = unbounded();
        for lens in LensTag::LENSES {
            tx.send(encoded(1, lens)).unwrap();
        }
        let result = Forwarder::new(
            aggregator(),
            Box::new(recorder.clone()),
            rx,
            StopFlag::new(),
            Arc::new(PipelineStats::new()),
        )
        .run();
        assert!(matches!(result, Err(Error::Transport(TransportError::Closed))));
        assert!(*recorder.closed.lock().unwrap());
    }
}
