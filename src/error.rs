use crate::Capture;
use thiserror::Error;

/// Failure reported by a hardware call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("device session is not open")]
    NotOpen,
    #[error("no device found: {0}")]
    NotFound(String),
    #[error("{call} failed: {message}")]
    Call {
        call: &'static str,
        message: String,
    },
}

pub type SweepResult<T> = std::result::Result<T, SweepError>;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Raised once the capture has finished; the samples that did arrive
    /// travel with the error.
    #[error(
        "data lost or corrupted at point {point} due to high sample frequency ({} kHz): {lost} lost, {corrupted} corrupted",
        .sample_rate / 1000.0
    )]
    DataIntegrity {
        point: usize,
        sample_rate: f64,
        lost: u64,
        corrupted: u64,
        capture: Box<Capture>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device error: {0}")]
    Device(DeviceError),

    #[error("a sweep is already running")]
    Busy,

    #[error("sweep cancelled")]
    Cancelled,

    #[error("sweep worker panicked")]
    WorkerPanicked,
}

impl From<DeviceError> for SweepError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::NotOpen => Self::DeviceUnavailable(err.to_string()),
            DeviceError::NotFound(msg) => Self::DeviceUnavailable(msg),
            other => Self::Device(other),
        }
    }
}
