use thiserror::Error;

use crate::TrackerState;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("camera not found: {0}")]
    NotFound(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("cannot {op} while {state}")]
    State {
        op: &'static str,
        state: TrackerState,
    },
    #[error("frame read failed: {0}")]
    FrameRead(String),
    #[error("pose estimation failed: {0}")]
    Pose(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// True for lifecycle violations; the caller must fix its call order.
    pub fn is_state(&self) -> bool {
        matches!(self, Error::State { .. })
    }
}

#[cfg(feature = "opencv")]
impl From<opencv::Error> for Error {
    fn from(e: opencv::Error) -> Self {
        Error::Backend(e.to_string())
    }
}
