//! Hardware-free camera that replays synthetic or on-disk lens images

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::driver::{
    CameraDriver, CameraInfo, ColorMethod, DeviceType, PanoramicImage, PanoramicSettings,
    RawCapture,
};
use crate::capture::frame::{CameraTimestamp, LensTag, PixelFormat};
use crate::error::CameraError;

const LENS_COUNT: usize = LensTag::LENSES.len();
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Sensor columns per lens
    pub sensor_cols: u32,
    /// Sensor rows per lens
    pub sensor_rows: u32,
    pub frame_interval_ms: u64,
    /// Directory holding `cam0.png` .. `cam5.png` (or `.jpg`)
    pub image_dir: Option<PathBuf>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sensor_cols: 2048,
            sensor_rows: 2448,
            frame_interval_ms: 50,
            image_dir: None,
        }
    }
}

/// Faults to inject, counted in grabs since the camera was created
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Number of `init` calls that fail transiently before one succeeds
    pub init_failures: u32,
    /// Every n-th grab fails transiently
    pub transient_every: Option<u64>,
    /// Grabs after the n-th fail fatally, as if the device was unplugged
    pub fatal_after: Option<u64>,
}

/// Cached lens images for one output geometry
struct LensCache {
    width: u32,
    height: u32,
    method: ColorMethod,
    lenses: Vec<Bytes>,
}

pub struct SimulatedCamera {
    config: SimulatorConfig,
    faults: FaultPlan,
    device_type: DeviceType,
    sources: Option<Vec<RgbaImage>>,
    panoramic: Option<PanoramicSettings>,
    initialized: bool,
    started: bool,
    init_attempts: u32,
    grabs: u64,
    epoch: Instant,
    cache: Option<LensCache>,
    panorama: Option<PanoramicImage>,
}

impl SimulatedCamera {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            faults: FaultPlan::default(),
            device_type: DeviceType::Ladybug5,
            sources: None,
            panoramic: None,
            initialized: false,
            started: false,
            init_attempts: 0,
            grabs: 0,
            epoch: Instant::now(),
            cache: None,
            panorama: None,
        }
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    fn timestamp(&self) -> CameraTimestamp {
        let elapsed = self.epoch.elapsed();
        let seconds = elapsed.as_secs() as u32;
        let nanos = elapsed.subsec_nanos();
        // 8000 bus cycles per second, 3072 ticks per cycle
        let cycle_nanos = nanos % 125_000;
        CameraTimestamp {
            cycle_count: nanos / 125_000,
            cycle_offset: (cycle_nanos as u64 * 3072 / 125_000) as u32,
            cycle_seconds: seconds % 128,
            micro_seconds: elapsed.subsec_micros(),
            seconds,
        }
    }

    fn lens_images(&mut self, width: u32, height: u32, method: ColorMethod) -> &[Bytes] {
        let stale = !matches!(
            &self.cache,
            Some(cache) if cache.width == width && cache.height == height && cache.method == method
        );
        if stale {
            debug!("Rendering simulated lens images at {}x{}", width, height);
            let lenses = (0..LENS_COUNT)
                .map(|lens| match &self.sources {
                    Some(sources) => resize_to_bgra(&sources[lens], width, height, method),
                    None => gradient_bgra(lens, width, height, method),
                })
                .collect();
            self.cache = Some(LensCache {
                width,
                height,
                method,
                lenses,
            });
        }
        match &self.cache {
            Some(cache) => &cache.lenses,
            None => &[],
        }
    }
}

impl CameraDriver for SimulatedCamera {
    fn init(&mut self) -> Result<(), CameraError> {
        self.init_attempts += 1;
        if self.init_attempts <= self.faults.init_failures {
            return Err(CameraError::transient("init", "no camera on the bus yet"));
        }

        if let Some(dir) = self.config.image_dir.clone() {
            let sources = (0..LENS_COUNT)
                .map(|lens| load_source(&dir, lens))
                .collect::<Result<Vec<_>, _>>()?;
            info!("Loaded simulator images from {}", dir.display());
            self.sources = Some(sources);
        }

        self.initialized = true;
        Ok(())
    }

    fn configure(
        &mut self,
        settings: &PanoramicSettings,
        _method: ColorMethod,
    ) -> Result<(), CameraError> {
        if !self.initialized {
            return Err(CameraError::fatal("configure", "camera not initialized"));
        }
        self.panoramic = Some(settings.clone());
        self.panorama = None;
        Ok(())
    }

    fn camera_info(&mut self) -> Result<CameraInfo, CameraError> {
        Ok(CameraInfo {
            model: "Ladybug5 (simulated)".into(),
            serial: 0,
            device_type: self.device_type,
        })
    }

    fn start(&mut self) -> Result<(), CameraError> {
        if !self.initialized {
            return Err(CameraError::fatal("start", "camera not initialized"));
        }
        self.started = true;
        Ok(())
    }

    fn grab(&mut self) -> Result<RawCapture, CameraError> {
        if !self.started {
            return Err(CameraError::fatal("grab", "camera not started"));
        }

        self.grabs += 1;
        if matches!(self.faults.fatal_after, Some(limit) if self.grabs > limit) {
            return Err(CameraError::fatal("grab", "device disconnected"));
        }
        if matches!(self.faults.transient_every, Some(every) if every > 0 && self.grabs % every == 0)
        {
            return Err(CameraError::transient("grab", "image grab timed out"));
        }

        std::thread::sleep(Duration::from_millis(self.config.frame_interval_ms));

        // No sensor data is modelled, the payload only carries the grab count
        Ok(RawCapture {
            timestamp: self.timestamp(),
            cols: self.config.sensor_cols,
            rows: self.config.sensor_rows,
            data: Bytes::copy_from_slice(&self.grabs.to_le_bytes()),
        })
    }

    fn convert(
        &mut self,
        raw: &RawCapture,
        method: ColorMethod,
    ) -> Result<Vec<Bytes>, CameraError> {
        let (width, height) = if method.halves_resolution() {
            (raw.cols / 2, raw.rows / 2)
        } else {
            (raw.cols, raw.rows)
        };
        Ok(self.lens_images(width, height, method).to_vec())
    }

    fn stitch(&mut self, raw: &RawCapture) -> Result<PanoramicImage, CameraError> {
        let settings = self
            .panoramic
            .clone()
            .ok_or_else(|| CameraError::fatal("stitch", "panoramic output not configured"))?;

        if self.panorama.is_none() {
            let (cols, rows) = (raw.cols / 2, raw.rows / 2);
            if cols == 0 || rows == 0 {
                return Err(CameraError::fatal(
                    "stitch",
                    format!("sensor {}x{} too small to stitch", raw.cols, raw.rows),
                ));
            }
            let lenses = self
                .lens_images(cols, rows, ColorMethod::Downsample4)
                .to_vec();
            self.panorama = Some(tile_panorama(&lenses, cols, rows, &settings));
        }

        self.panorama
            .clone()
            .ok_or_else(|| CameraError::fatal("stitch", "panorama unavailable"))
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn destroy(&mut self) {
        self.initialized = false;
        self.cache = None;
        self.panorama = None;
        self.sources = None;
    }
}

fn load_source(dir: &Path, lens: usize) -> Result<RgbaImage, CameraError> {
    let path = IMAGE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("cam{lens}.{ext}")))
        .find(|path| path.exists())
        .ok_or_else(|| {
            CameraError::fatal("init", format!("no image for cam{lens} in {}", dir.display()))
        })?;

    let image = image::open(&path)
        .map_err(|e| CameraError::fatal("init", format!("{}: {e}", path.display())))?;
    Ok(image.to_rgba8())
}

fn resize_to_bgra(source: &RgbaImage, width: u32, height: u32, method: ColorMethod) -> Bytes {
    let resized = imageops::resize(source, width, height, FilterType::Triangle);
    let mut data = resized.into_raw();
    for px in data.chunks_exact_mut(4) {
        if method == ColorMethod::Mono {
            let luma = ((px[0] as u32 * 77 + px[1] as u32 * 150 + px[2] as u32 * 29) >> 8) as u8;
            px[0] = luma;
            px[1] = luma;
            px[2] = luma;
        } else {
            px.swap(0, 2);
        }
    }
    Bytes::from(data)
}

fn gradient_bgra(lens: usize, width: u32, height: u32, method: ColorMethod) -> Bytes {
    let mut data = Vec::with_capacity(width as usize * height as usize * 4);
    let tint = (lens as u32 * 40) as u8;
    for y in 0..height {
        let g = (y * 255 / height.max(1)) as u8;
        for x in 0..width {
            let b = (x * 255 / width.max(1)) as u8;
            if method == ColorMethod::Mono {
                let luma = b / 2 + g / 2;
                data.extend_from_slice(&[luma, luma, luma, 255]);
            } else {
                data.extend_from_slice(&[b, g, tint, 255]);
            }
        }
    }
    Bytes::from(data)
}

/// Nearest-neighbour tiling of the lens images side by side into a BGR strip.
fn tile_panorama(
    lenses: &[Bytes],
    cols: u32,
    rows: u32,
    settings: &PanoramicSettings,
) -> PanoramicImage {
    let (width, height) = (settings.width, settings.height);
    let tile = (width as usize / lenses.len().max(1)).max(1);
    let mut data = Vec::with_capacity(width as usize * height as usize * 3);

    for y in 0..height as usize {
        let sy = y * rows as usize / height.max(1) as usize;
        for x in 0..width as usize {
            let lens = (x / tile).min(lenses.len() - 1);
            let sx = (x % tile) * cols as usize / tile;
            let offset = (sy * cols as usize + sx) * 4;
            let px = &lenses[lens][offset..offset + 3];
            data.extend_from_slice(px);
        }
    }

    PanoramicImage {
        width,
        height,
        format: PixelFormat::Bgr24,
        data: Bytes::from(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SimulatorConfig {
        SimulatorConfig {
            sensor_cols: 32,
            sensor_rows: 24,
            frame_interval_ms: 0,
            image_dir: None,
        }
    }

    fn started(camera: &mut SimulatedCamera) {
        camera.init().unwrap();
        camera.start().unwrap();
    }

    #[test]
    fn convert_produces_six_bgra_lenses() {
        let mut camera = SimulatedCamera::new(small());
        started(&mut camera);
        let raw = camera.grab().unwrap();

        let lenses = camera.convert(&raw, ColorMethod::Downsample4).unwrap();
        assert_eq!(lenses.len(), 6);
        for lens in &lenses {
            assert_eq!(lens.len(), 16 * 12 * 4);
        }

        let full = camera.convert(&raw, ColorMethod::HqLinear).unwrap();
        assert_eq!(full[0].len(), 32 * 24 * 4);
    }

    #[test]
    fn grab_requires_start() {
        let mut camera = SimulatedCamera::new(small());
        camera.init().unwrap();
        assert!(!camera.grab().unwrap_err().is_transient());
    }

    #[test]
    fn fault_plan_injects_transient_then_fatal() {
        let mut camera = SimulatedCamera::new(small()).with_faults(FaultPlan {
            init_failures: 1,
            transient_every: Some(2),
            fatal_after: Some(3),
        });

        assert!(camera.init().unwrap_err().is_transient());
        camera.init().unwrap();
        camera.start().unwrap();

        assert!(camera.grab().is_ok());
        assert!(camera.grab().unwrap_err().is_transient());
        assert!(camera.grab().is_ok());
        assert!(!camera.grab().unwrap_err().is_transient());
    }

    #[test]
    fn timestamps_advance() {
        let mut camera = SimulatedCamera::new(SimulatorConfig {
            frame_interval_ms: 2,
            ..small()
        });
        started(&mut camera);
        let first = camera.grab().unwrap().timestamp;
        let second = camera.grab().unwrap().timestamp;
        let micros = |t: CameraTimestamp| t.seconds as u64 * 1_000_000 + t.micro_seconds as u64;
        assert!(micros(second) > micros(first));
        assert!(second.cycle_count < 8000);
        assert!(second.cycle_offset < 3072);
    }

    #[test]
    fn stitch_needs_configuration() {
        let mut camera = SimulatedCamera::new(small());
        started(&mut camera);
        let raw = camera.grab().unwrap();
        assert!(camera.stitch(&raw).is_err());

        let settings = PanoramicSettings {
            width: 64,
            height: 32,
            ..Default::default()
        };
        camera.configure(&settings, ColorMethod::Downsample4).unwrap();
        let pano = camera.stitch(&raw).unwrap();
        assert_eq!(pano.format, PixelFormat::Bgr24);
        assert_eq!(pano.data.len(), 64 * 32 * 3);
    }

    #[test]
    fn undersized_sensor_cannot_stitch() {
        let mut camera = SimulatedCamera::new(SimulatorConfig {
            sensor_cols: 1,
            sensor_rows: 8,
            ..small()
        });
        started(&mut camera);
        camera
            .configure(&PanoramicSettings::default(), ColorMethod::Downsample4)
            .unwrap();
        let raw = camera.grab().unwrap();
        let err = camera.stitch(&raw).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("too small to stitch"));
    }

    #[test]
    fn image_dir_is_loaded_and_resized() {
        let dir = tempfile::tempdir().unwrap();
        for lens in 0..LENS_COUNT {
            let img = RgbaImage::from_pixel(8, 8, image::Rgba([200, 10, 20, 255]));
            img.save(dir.path().join(format!("cam{lens}.png"))).unwrap();
        }

        let mut camera = SimulatedCamera::new(SimulatorConfig {
            image_dir: Some(dir.path().to_path_buf()),
            ..small()
        });
        started(&mut camera);
        let raw = camera.grab().unwrap();
        let lenses = camera.convert(&raw, ColorMethod::Downsample4).unwrap();
        assert_eq!(lenses[0].len(), 16 * 12 * 4);
        // The red channel lands in the third byte of BGRA
        let px = &lenses[3][..4];
        assert!(px[2] > 190 && px[0] < 30, "unexpected pixel {px:?}");
        assert_eq!(px[3], 255);
    }

    #[test]
    fn missing_image_dir_entries_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = SimulatedCamera::new(SimulatorConfig {
            image_dir: Some(dir.path().to_path_buf()),
            ..small()
        });
        assert!(!camera.init().unwrap_err().is_transient());
    }
}
