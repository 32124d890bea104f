use std::collections::HashSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::frame::{CameraTimestamp, LensTag};
use crate::error::{EnvelopeError, TransportError};

/// Most images any envelope can hold: one per lens tag
const MAX_IMAGES: usize = LensTag::LENSES.len() + 1;

/// JPEG output of one worker for one lens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedImage {
    pub bytes: Bytes,
    pub size: u64,
    pub lens_type: LensTag,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub timestamp: CameraTimestamp,
}

impl CompressedImage {
    pub fn new(
        jpeg: Vec<u8>,
        lens: LensTag,
        width: u32,
        height: u32,
        timestamp: CameraTimestamp,
    ) -> Self {
        Self {
            size: jpeg.len() as u64,
            bytes: Bytes::from(jpeg),
            lens_type: lens,
            name: lens.name().to_string(),
            width,
            height,
            timestamp,
        }
    }
}

/// Everything published for one captured frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    pub request_id: u64,
    pub device_name: String,
    pub camera_name: String,
    pub images: Vec<CompressedImage>,
}

impl OutboundEnvelope {
    /// Check the envelope against the lens limit of the current run.
    pub fn validate(&self, max_images: usize) -> Result<(), EnvelopeError> {
        if self.images.is_empty() {
            return Err(EnvelopeError::Empty);
        }
        if self.images.len() > max_images {
            return Err(EnvelopeError::TooManyImages {
                count: self.images.len(),
                limit: max_images,
            });
        }
        let mut seen = HashSet::with_capacity(self.images.len());
        for image in &self.images {
            if !seen.insert(image.lens_type) {
                return Err(EnvelopeError::DuplicateLens(image.lens_type));
            }
        }
        Ok(())
    }

    /// Total JPEG bytes carried
    pub fn payload_size(&self) -> usize {
        self.images.iter().map(|image| image.bytes.len()).sum()
    }
}

pub fn encode(envelope: &OutboundEnvelope) -> Result<Bytes, TransportError> {
    let data = rmp_serde::to_vec_named(envelope)?;
    Ok(Bytes::from(data))
}

pub fn decode(data: &[u8]) -> Result<OutboundEnvelope, TransportError> {
    let envelope: OutboundEnvelope = rmp_serde::from_slice(data)?;
    envelope.validate(MAX_IMAGES)?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(lens: LensTag) -> CompressedImage {
        CompressedImage::new(
            vec![0xFF, 0xD8, 0xFF, 0xD9],
            lens,
            1024,
            1024,
            CameraTimestamp {
                cycle_count: 4,
                cycle_offset: 2,
                cycle_seconds: 5,
                micro_seconds: 3,
                seconds: 7,
            },
        )
    }

    fn envelope(lenses: &[LensTag]) -> OutboundEnvelope {
        OutboundEnvelope {
            request_id: 1,
            device_name: "windows".into(),
            camera_name: "ladybug5".into(),
            images: lenses.iter().copied().map(image).collect(),
        }
    }

    #[test]
    fn image_metadata_derives_from_lens() {
        let img = image(LensTag::Cam3);
        assert_eq!(img.size, 4);
        assert_eq!(img.name, "CAM3");
    }

    #[test]
    fn codec_preserves_envelope() {
        let sent = envelope(&LensTag::LENSES);
        let decoded = decode(&encode(&sent).unwrap()).unwrap();
        assert_eq!(decoded, sent);
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    #[test]
    fn wire_uses_camel_case_names_and_numeric_lens_flags() {
        let wire = encode(&envelope(&[LensTag::Cam5])).unwrap();
        for field in [
            "requestId",
            "deviceName",
            "cameraName",
            "lensType",
            "cycleCount",
            "microSeconds",
        ] {
            assert!(find(&wire, field.as_bytes()).is_some(), "missing {field}");
        }
        assert!(find(&wire, b"request_id").is_none());

        // "lensType" key followed by positive fixint 32
        let at = find(&wire, b"lensType").unwrap();
        assert_eq!(wire[at + "lensType".len()], 0x20);

        // JPEG bytes travel as msgpack bin8, not an array of integers
        let at = find(&wire, b"bytes").unwrap();
        assert_eq!(wire[at + "bytes".len()], 0xc4);
    }

    #[test]
    fn validate_enforces_invariants() {
        assert_eq!(envelope(&[]).validate(6), Err(EnvelopeError::Empty));
        assert_eq!(
            envelope(&LensTag::LENSES).validate(5),
            Err(EnvelopeError::TooManyImages { count: 6, limit: 5 })
        );
        assert_eq!(
            envelope(&[LensTag::Cam1, LensTag::Cam1]).validate(6),
            Err(EnvelopeError::DuplicateLens(LensTag::Cam1))
        );
        assert!(envelope(&[LensTag::Panoramic]).validate(1).is_ok());
    }

    #[test]
    fn decode_rejects_invalid_envelopes() {
        let wire = encode(&envelope(&[LensTag::Cam0, LensTag::Cam0])).unwrap();
        assert!(matches!(decode(&wire), Err(TransportError::Invalid(_))));
        assert!(matches!(decode(b"\x01\x02"), Err(TransportError::Decode(_))));
    }
}
