//! Capture boundary: turns driver grabs into fixed-geometry [`RawFrame`]s

use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::capture::driver::CameraDriver;
use crate::capture::frame::{LensBuffer, LensTag, PixelFormat, RawFrame};
use crate::error::CameraError;
use crate::utils::{Backoff, StopFlag};
use crate::{CaptureConfig, CaptureMode};

/// Output geometry, fixed for the lifetime of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LensGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub lens_count: usize,
}

impl LensGeometry {
    pub fn buffer_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

pub struct FrameSource {
    driver: Box<dyn CameraDriver>,
    config: CaptureConfig,
    geometry: LensGeometry,
    stop: StopFlag,
    sequence: u64,
    closed: bool,
}

impl FrameSource {
    /// Bring the camera up: init, optional stitching setup, start, and a
    /// probe grab that pins the lens geometry for this run.
    #[instrument(skip_all, fields(mode = ?config.mode))]
    pub fn open(
        mut driver: Box<dyn CameraDriver>,
        config: &CaptureConfig,
        stop: StopFlag,
    ) -> Result<Self, CameraError> {
        let geometry = match bring_up(driver.as_mut(), config, &stop) {
            Ok(geometry) => geometry,
            Err(err) => {
                driver.stop();
                driver.destroy();
                return Err(err);
            }
        };
        info!(
            "Lens geometry {}x{} {:?} x{}",
            geometry.width, geometry.height, geometry.format, geometry.lens_count
        );

        Ok(Self {
            driver,
            config: config.clone(),
            geometry,
            stop,
            sequence: 0,
            closed: false,
        })
    }

    pub fn geometry(&self) -> LensGeometry {
        self.geometry
    }

    /// Grab and convert one synchronized capture.
    ///
    /// Transient grab faults are retried with bounded exponential backoff;
    /// once the retries run out the fault is escalated to fatal.
    pub fn next_frame(&mut self) -> Result<RawFrame, CameraError> {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.grab_backoff_ms),
            Duration::from_millis(self.config.grab_backoff_max_ms),
            self.config.grab_retries,
        );
        let driver = &mut self.driver;
        let raw = retry(&self.stop, &mut backoff, "grab", || driver.grab())?;

        let buffers = match self.config.mode {
            CaptureMode::Lenses => {
                let mut buffers = self.driver.convert(&raw, self.config.color_method)?;
                if buffers.len() < self.geometry.lens_count {
                    return Err(CameraError::fatal(
                        "convert",
                        format!(
                            "driver returned {} lens buffers, expected {}",
                            buffers.len(),
                            self.geometry.lens_count
                        ),
                    ));
                }
                buffers.truncate(self.geometry.lens_count);
                buffers
                    .into_iter()
                    .zip(LensTag::LENSES)
                    .map(|(data, lens)| LensBuffer { lens, data })
                    .collect::<Vec<_>>()
            }
            CaptureMode::Panoramic => {
                let pano = self.driver.stitch(&raw)?;
                if pano.width != self.geometry.width
                    || pano.height != self.geometry.height
                    || pano.format != self.geometry.format
                {
                    return Err(geometry_changed("stitch"));
                }
                vec![LensBuffer {
                    lens: LensTag::Panoramic,
                    data: pano.data,
                }]
            }
        };

        let expected = self.geometry.buffer_size();
        if buffers.iter().any(|b| b.data.len() != expected) {
            return Err(geometry_changed("convert"));
        }

        self.sequence += 1;

        Ok(RawFrame {
            sequence: self.sequence,
            timestamp: raw.timestamp,
            lenses: buffers,
            width: self.geometry.width,
            height: self.geometry.height,
            format: self.geometry.format,
        })
    }

    /// Stop and release the camera. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("Stopping camera");
        self.driver.stop();
        self.driver.destroy();
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn bring_up(
    driver: &mut dyn CameraDriver,
    config: &CaptureConfig,
    stop: &StopFlag,
) -> Result<LensGeometry, CameraError> {
    info!("Initializing camera...");
    let mut backoff = Backoff::constant(config.init_backoff(), config.init_retries);
    retry(stop, &mut backoff, "init", || driver.init())?;

    if config.mode == CaptureMode::Panoramic {
        info!("Configuring for panoramic stitching");
        driver.configure(&config.panoramic, config.color_method)?;
    } else {
        info!("Skipped configuration for panoramic pictures");
    }

    let info = driver.camera_info()?;
    if !info.device_type.is_supported() {
        return Err(CameraError::fatal(
            "start",
            format!("unsupported device {} ({:?})", info.model, info.device_type),
        ));
    }
    info!("Starting {} ({})...", info.model, info.serial);
    driver.start()?;

    // A fresh camera often needs a few grabs before it delivers
    let mut backoff = Backoff::constant(Duration::ZERO, config.probe_retries);
    let probe = retry(stop, &mut backoff, "probe grab", || driver.grab())?;

    let geometry = match config.mode {
        CaptureMode::Lenses => {
            let (width, height) = if config.color_method.halves_resolution() {
                (probe.cols / 2, probe.rows / 2)
            } else {
                (probe.cols, probe.rows)
            };
            LensGeometry {
                width,
                height,
                format: PixelFormat::Bgra32,
                lens_count: config.frame_lens_count(),
            }
        }
        CaptureMode::Panoramic => {
            let pano = driver.stitch(&probe)?;
            LensGeometry {
                width: pano.width,
                height: pano.height,
                format: pano.format,
                lens_count: 1,
            }
        }
    };
    if geometry.width == 0 || geometry.height == 0 {
        return Err(CameraError::fatal(
            "probe grab",
            format!(
                "zero-size lens geometry {}x{}",
                geometry.width, geometry.height
            ),
        ));
    }
    Ok(geometry)
}

fn geometry_changed(stage: &'static str) -> CameraError {
    CameraError::fatal(stage, "buffer geometry changed, restart required")
}

/// Retry `op` on transient faults until the backoff runs out or the run stops.
fn retry<T>(
    stop: &StopFlag,
    backoff: &mut Backoff,
    stage: &'static str,
    mut op: impl FnMut() -> Result<T, CameraError>,
) -> Result<T, CameraError> {
    let mut attempt = 1;
    loop {
        let err = match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => err,
            Err(err) => return Err(err),
        };

        let Some(delay) = backoff.next_delay() else {
            return Err(err.escalate());
        };
        warn!("{} failed (attempt {}): {}, retrying in {:?}", stage, attempt, err, delay);
        metrics::counter!("panostream_transient_faults").increment(1);
        attempt += 1;

        if !stop.sleep(delay) {
            return Err(CameraError::fatal(stage, "pipeline stopping"));
        }
    }
}
