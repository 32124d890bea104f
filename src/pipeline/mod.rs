//! One pipeline run: capture, dispatch, compression pool and forwarding
//!
//! Every run owns its threads, channels and buffers. Nothing here survives a
//! teardown except the shared [`PipelineStats`].

pub mod aggregator;
pub mod dispatcher;
pub mod encoder;
pub mod worker;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{bounded, Sender};
use tracing::{error, info, instrument, warn};

use crate::capture::driver::CameraDriver;
use crate::capture::source::FrameSource;
use crate::error::{Error, Result};
use crate::stats::PipelineStats;
use crate::supervisor::Control;
use crate::transport::Publish;
use crate::utils::StopFlag;
use crate::Config;

use aggregator::{Aggregator, Forwarder};
use dispatcher::{DispatchOutcome, Dispatcher};
use encoder::ImageEncoder;
use worker::CompressionWorker;

/// Builds the encoder for worker `i`
pub type EncoderFactory = Arc<dyn Fn(usize) -> Box<dyn ImageEncoder> + Send + Sync>;

pub struct Pipeline {
    run: u64,
    stop: StopFlag,
    threads: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn every stage of run `run`. Stage failures are reported on
    /// `control` tagged with the run id.
    #[instrument(skip_all, fields(run = run))]
    pub fn launch(
        run: u64,
        config: &Config,
        driver: Box<dyn CameraDriver>,
        encoders: &EncoderFactory,
        publisher: Box<dyn Publish>,
        control: Sender<Control>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let lens_count = config.capture.frame_lens_count();
        let workers = config.pipeline.worker_count(lens_count);
        info!(
            "Launching run {} with {} lens(es) and {} worker(s)",
            run, lens_count, workers
        );

        let mut pipeline = Self {
            run,
            stop: StopFlag::new(),
            threads: Vec::with_capacity(workers + 2),
        };

        let (ready_tx, ready_rx) = bounded(workers);
        let (output_tx, output_rx) = bounded(workers * 2);

        let forwarder = Forwarder::new(
            Aggregator::new(
                lens_count,
                config.transport.device_name.clone(),
                config.transport.camera_name.clone(),
            ),
            publisher,
            output_rx,
            pipeline.stop.clone(),
            stats.clone(),
        );
        pipeline.spawn("forward".into(), &control, move || forwarder.run())?;

        let mut task_txs = Vec::with_capacity(workers);
        for id in 0..workers {
            let (task_tx, task_rx) = bounded(1);
            task_txs.push(task_tx);
            let worker = CompressionWorker::new(
                id,
                encoders(id),
                task_rx,
                ready_tx.clone(),
                output_tx.clone(),
                stats.clone(),
                config.pipeline.pin_workers,
            );
            pipeline.spawn(format!("compress-{id}"), &control, move || {
                worker.run();
                Ok(())
            })?;
        }
        // Workers hold the only senders, so the forwarder sees a disconnect
        // once the pool has exited
        drop(output_tx);
        drop(ready_tx);

        let capture = config.capture.clone();
        let quality = config.pipeline.jpeg_quality;
        let ready_wait = config.pipeline.ready_wait();
        let stop = pipeline.stop.clone();
        pipeline.spawn("capture".into(), &control, move || {
            let mut source = FrameSource::open(driver, &capture, stop.clone())?;
            let mut dispatcher =
                Dispatcher::new(task_txs, ready_rx, ready_wait, stop.clone(), stats.clone());

            while !stop.is_stopped() {
                let frame = match source.next_frame() {
                    Ok(frame) => frame,
                    Err(_) if stop.is_stopped() => break,
                    Err(e) => return Err(e.into()),
                };
                stats.frame_captured();
                if dispatcher.dispatch(frame, quality)? == DispatchOutcome::Abandoned {
                    break;
                }
            }
            Ok(())
        })?;

        Ok(pipeline)
    }

    /// Run a stage on a named thread, turning errors and panics into faults.
    fn spawn(
        &mut self,
        name: String,
        control: &Sender<Control>,
        stage: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let run = self.run;
        let control = control.clone();
        let stop = self.stop.clone();
        let thread_name = name.clone();

        let spawned = thread::Builder::new().name(thread_name).spawn(move || {
            let error = match panic::catch_unwind(AssertUnwindSafe(stage)) {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(payload) => Error::UnhandledFault(format!(
                    "{name} panicked: {}",
                    panic_message(&*payload)
                )),
            };
            if stop.is_stopped() {
                warn!("{} failed during teardown: {}", name, error);
                return;
            }
            error!("{} failed: {}", name, error);
            let _ = control.send(Control::Fault { run, error });
        });

        match spawned {
            Ok(handle) => {
                self.threads.push(handle);
                Ok(())
            }
            Err(e) => Err(Error::UnhandledFault(format!("failed to spawn thread: {e}"))),
        }
    }

    /// Stop every stage and wait for its thread. Idempotent.
    pub fn teardown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        info!("Tearing down run {}", self.run);
        self.stop.stop();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("stage").to_string();
            if handle.join().is_err() {
                warn!("Thread {} did not exit cleanly", name);
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use flume::unbounded;

    use super::*;
    use crate::capture::simulator::{FaultPlan, SimulatedCamera, SimulatorConfig};
    use crate::error::TransportError;
    use crate::pipeline::encoder::JpegCompressor;
    use crate::transport::envelope::{self, OutboundEnvelope};
    use crate::transport::PublishOutcome;

    /// Hands published payloads to the test over a channel
    struct ChannelPublisher(Sender<bytes::Bytes>);

    impl Publish for ChannelPublisher {
        fn publish(
            &mut self,
            payload: bytes::Bytes,
        ) -> std::result::Result<PublishOutcome, TransportError> {
            let _ = self.0.send(payload);
            Ok(PublishOutcome {
                links: 1,
                dropped: 0,
            })
        }

        fn close(&mut self) {}
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.capture.simulator = SimulatorConfig {
            sensor_cols: 64,
            sensor_rows: 32,
            frame_interval_ms: 5,
            image_dir: None,
        };
        config.capture.grab_backoff_ms = 1;
        config.capture.grab_backoff_max_ms = 2;
        config
    }

    fn jpeg_factory() -> EncoderFactory {
        Arc::new(|_: usize| -> Box<dyn ImageEncoder> { Box::new(JpegCompressor::new()) })
    }

    fn launch(
        config: &Config,
        faults: FaultPlan,
    ) -> (
        Pipeline,
        flume::Receiver<bytes::Bytes>,
        flume::Receiver<Control>,
        Arc<PipelineStats>,
    ) {
        let (wire_tx, wire_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let stats = Arc::new(PipelineStats::new());
        let driver =
            Box::new(SimulatedCamera::new(config.capture.simulator.clone()).with_faults(faults));
        let pipeline = Pipeline::launch(
            1,
            config,
            driver,
            &jpeg_factory(),
            Box::new(ChannelPublisher(wire_tx)),
            control_tx,
            stats.clone(),
        )
        .unwrap();
        (pipeline, wire_rx, control_rx, stats)
    }

    fn next_envelope(wire: &flume::Receiver<bytes::Bytes>) -> OutboundEnvelope {
        let payload = wire.recv_timeout(Duration::from_secs(10)).unwrap();
        envelope::decode(&payload).unwrap()
    }

    #[test]
    fn frames_flow_through_to_envelopes() {
        let (mut pipeline, wire, _, stats) = launch(&config(), FaultPlan::default());
        let first = next_envelope(&wire);
        let second = next_envelope(&wire);
        pipeline.teardown();

        assert_eq!(first.images.len(), 6);
        assert!(second.request_id > first.request_id);
        assert!(first.images.iter().all(|i| (i.width, i.height) == (32, 16)));
        assert!(stats.snapshot().images_encoded >= 12);
    }

    #[test]
    fn fewer_workers_than_lenses_still_complete_frames() {
        let mut config = config();
        config.pipeline.workers = Some(2);
        let (mut pipeline, wire, _, _) = launch(&config, FaultPlan::default());
        assert_eq!(next_envelope(&wire).images.len(), 6);
        pipeline.teardown();
    }

    #[test]
    fn fatal_camera_fault_is_reported_with_run_id() {
        let faults = FaultPlan {
            fatal_after: Some(3),
            ..Default::default()
        };
        let (mut pipeline, _, control, _) = launch(&config(), faults);
        match control.recv_timeout(Duration::from_secs(10)).unwrap() {
            Control::Fault { run, error } => {
                assert_eq!(run, 1);
                assert!(matches!(error, Error::FatalHardware(_)));
            }
            other => panic!("unexpected control message {other:?}"),
        }
        pipeline.teardown();
    }

    #[test]
    fn panicking_encoder_becomes_unhandled_fault() {
        struct Panicking;

        impl ImageEncoder for Panicking {
            fn compress(
                &mut self,
                _: &[u8],
                _: u32,
                _: usize,
                _: u32,
                _: crate::capture::frame::PixelFormat,
                _: u8,
            ) -> std::result::Result<Vec<u8>, crate::error::EncodeError> {
                panic!("encoder blew up");
            }
        }

        let (wire_tx, _wire_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let config = config();
        let factory: EncoderFactory =
            Arc::new(|_: usize| -> Box<dyn ImageEncoder> { Box::new(Panicking) });
        let mut pipeline = Pipeline::launch(
            4,
            &config,
            Box::new(SimulatedCamera::new(config.capture.simulator.clone())),
            &factory,
            Box::new(ChannelPublisher(wire_tx)),
            control_tx,
            Arc::new(PipelineStats::new()),
        )
        .unwrap();

        let Control::Fault { run, error } = control_rx.recv_timeout(Duration::from_secs(10)).unwrap()
        else {
            panic!("expected a fault");
        };
        assert_eq!(run, 4);
        assert!(matches!(&error, Error::UnhandledFault(msg) if msg.contains("encoder blew up")));
        pipeline.teardown();
    }

    #[test]
    fn teardown_is_prompt_and_idempotent() {
        let (mut pipeline, wire, _, _) = launch(&config(), FaultPlan::default());
        next_envelope(&wire);
        let started = Instant::now();
        pipeline.teardown();
        pipeline.teardown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
