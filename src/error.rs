use thiserror::Error;

use crate::capture::frame::LensTag;

/// Faults reported by a camera driver.
///
/// Drivers classify every failure: a transient fault is retried in place by
/// the frame source, a fatal one tears the whole pipeline down.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("transient camera fault while {stage}: {reason}")]
    Transient { stage: &'static str, reason: String },

    #[error("camera fault while {stage}: {reason}")]
    Fatal { stage: &'static str, reason: String },
}

impl CameraError {
    pub fn transient(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Transient {
            stage,
            reason: reason.into(),
        }
    }

    pub fn fatal(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Fatal {
            stage,
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Promote a transient fault to a fatal one, keeping its context.
    pub fn escalate(self) -> Self {
        match self {
            Self::Transient { stage, reason } => Self::Fatal {
                stage,
                reason: format!("{reason} (retries exhausted)"),
            },
            fatal => fatal,
        }
    }
}

/// Encoder failures. Always scoped to a single lens image.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("image dimensions {width}x{height} exceed encoder limits")]
    Dimensions { width: u32, height: u32 },

    #[error("buffer holds {actual} bytes, expected at least {expected}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("jpeg encoder: {0}")]
    Codec(#[from] jpeg_encoder::EncodingError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("envelope encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("envelope decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("invalid envelope: {0}")]
    Invalid(#[from] EnvelopeError),

    #[error("invalid endpoint {0:?}")]
    Endpoint(String),

    #[error("frame of {0} bytes exceeds the transport limit")]
    FrameTooLarge(usize),

    #[error("high-water-mark must be at least 1")]
    InvalidHighWaterMark,

    #[error("transport closed")]
    Closed,
}

/// Violations of the outbound envelope invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope has no images")]
    Empty,

    #[error("envelope holds {count} images, limit is {limit}")]
    TooManyImages { count: usize, limit: usize },

    #[error("lens {0} appears more than once")]
    DuplicateLens(LensTag),
}

/// Pipeline-level failure taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transient hardware fault: {0}")]
    TransientHardware(CameraError),

    #[error("fatal hardware fault: {0}")]
    FatalHardware(CameraError),

    #[error("encode failure: {0}")]
    EncodeFailure(#[from] EncodeError),

    #[error("transport queue full, dropped {dropped} message(s)")]
    TransportFull { dropped: usize },

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("unhandled fault: {0}")]
    UnhandledFault(String),

    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<CameraError> for Error {
    fn from(err: CameraError) -> Self {
        if err.is_transient() {
            Self::TransientHardware(err)
        } else {
            Self::FatalHardware(err)
        }
    }
}

impl Error {
    /// Whether this failure must go through a teardown and restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalHardware(_) | Self::UnhandledFault(_) | Self::Transport(_) | Self::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
