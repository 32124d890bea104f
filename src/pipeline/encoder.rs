//! Per-lens image compression

use jpeg_encoder::{ColorType, Encoder, SamplingFactor};

use crate::capture::frame::PixelFormat;
use crate::error::EncodeError;

/// Compresses one lens buffer. Every worker owns its own instance.
pub trait ImageEncoder: Send {
    /// `stride` is the row pitch in bytes, 0 for tightly packed rows.
    fn compress(
        &mut self,
        buffer: &[u8],
        width: u32,
        stride: usize,
        height: u32,
        format: PixelFormat,
        quality: u8,
    ) -> Result<Vec<u8>, EncodeError>;
}

/// Baseline JPEG with 4:2:0 chroma subsampling
#[derive(Debug, Default)]
pub struct JpegCompressor {
    /// Scratch for repacking padded rows
    packed: Vec<u8>,
}

impl JpegCompressor {
    pub fn new() -> Self {
        Self::default()
    }
}

fn color_type(format: PixelFormat) -> ColorType {
    match format {
        PixelFormat::Bgra32 => ColorType::Bgra,
        PixelFormat::Rgba32 => ColorType::Rgba,
        PixelFormat::Bgr24 => ColorType::Bgr,
        PixelFormat::Rgb24 => ColorType::Rgb,
        PixelFormat::Gray8 => ColorType::Luma,
    }
}

impl ImageEncoder for JpegCompressor {
    fn compress(
        &mut self,
        buffer: &[u8],
        width: u32,
        stride: usize,
        height: u32,
        format: PixelFormat,
        quality: u8,
    ) -> Result<Vec<u8>, EncodeError> {
        let (w, h) = match (u16::try_from(width), u16::try_from(height)) {
            (Ok(w), Ok(h)) if w > 0 && h > 0 => (w, h),
            _ => return Err(EncodeError::Dimensions { width, height }),
        };

        let row = width as usize * format.bytes_per_pixel();
        let stride = if stride == 0 { row } else { stride };
        if stride < row {
            return Err(EncodeError::BufferTooShort {
                expected: row,
                actual: stride,
            });
        }
        // The last row needs no padding after it
        let expected = stride * (height as usize - 1) + row;
        if buffer.len() < expected {
            return Err(EncodeError::BufferTooShort {
                expected,
                actual: buffer.len(),
            });
        }

        let pixels = if stride == row {
            &buffer[..row * height as usize]
        } else {
            self.packed.clear();
            for line in buffer.chunks(stride).take(height as usize) {
                self.packed.extend_from_slice(&line[..row]);
            }
            &self.packed[..]
        };

        let mut jpeg = Vec::with_capacity(row * height as usize / 8);
        let mut encoder = Encoder::new(&mut jpeg, quality.clamp(1, 100));
        encoder.set_sampling_factor(SamplingFactor::R_4_2_0);
        encoder.encode(pixels, w, h, color_type(format))?;
        Ok(jpeg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_bgra(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, 128, 255]);
            }
        }
        data
    }

    fn decoded_size(jpeg: &[u8]) -> (u16, u16) {
        let mut decoder = jpeg_decoder::Decoder::new(jpeg);
        decoder.decode().unwrap();
        let info = decoder.info().unwrap();
        (info.width, info.height)
    }

    #[test]
    fn encodes_bgra_lens_to_decodable_jpeg() {
        let data = gradient_bgra(320, 240);
        let jpeg = JpegCompressor::new()
            .compress(&data, 320, 0, 240, PixelFormat::Bgra32, 85)
            .unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert!(jpeg.len() < data.len());
        assert_eq!(decoded_size(&jpeg), (320, 240));
    }

    #[test]
    fn padded_rows_are_repacked() {
        let (width, height, pad) = (64u32, 48u32, 32usize);
        let row = width as usize * 3;
        let mut data = Vec::new();
        for _ in 0..height {
            data.extend(std::iter::repeat(90u8).take(row));
            data.extend(std::iter::repeat(0xEEu8).take(pad));
        }
        let jpeg = JpegCompressor::new()
            .compress(&data, width, row + pad, height, PixelFormat::Bgr24, 85)
            .unwrap();
        assert_eq!(decoded_size(&jpeg), (64, 48));
    }

    #[test]
    fn rejects_oversized_and_short_input() {
        let mut encoder = JpegCompressor::new();
        assert!(matches!(
            encoder.compress(&[], 70_000, 0, 1, PixelFormat::Gray8, 85),
            Err(EncodeError::Dimensions { .. })
        ));
        assert!(matches!(
            encoder.compress(&[0; 10], 4, 0, 4, PixelFormat::Gray8, 85),
            Err(EncodeError::BufferTooShort {
                expected: 16,
                actual: 10
            })
        ));
    }

    #[test]
    fn higher_quality_costs_more_bytes() {
        let data = gradient_bgra(256, 256);
        let mut encoder = JpegCompressor::new();
        let low = encoder
            .compress(&data, 256, 0, 256, PixelFormat::Bgra32, 20)
            .unwrap();
        let high = encoder
            .compress(&data, 256, 0, 256, PixelFormat::Bgra32, 95)
            .unwrap();
        assert!(low.len() < high.len());
    }
}
