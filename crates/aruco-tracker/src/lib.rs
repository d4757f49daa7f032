//! aruco-tracker: square fiducial detection, marker pose estimation and a
//! pull-based tracker over a camera or caller-supplied frames.

mod types;
pub use image::{GrayImage, RgbImage};
pub use types::{Frame, PixelFormat};

mod error;
pub use error::{Error, Result};

mod traits;
pub use traits::CameraSource;

#[cfg(feature = "mock")]
pub mod mock;
#[cfg(feature = "mock")]
pub use mock::MockCamera;

#[cfg(feature = "opencv")]
mod opencv_backend;
#[cfg(feature = "opencv")]
pub use opencv_backend::OpenCvCamera;

pub mod calib;
pub mod camera;
pub mod config;
pub mod detect;
pub mod dictionary;
pub mod homography;
pub mod io;
pub mod pose;
pub mod render;

mod tracker;
pub use tracker::{TrackedFrame, Tracker, TrackerState};

pub use calib::{load_calibration, Calibration};
pub use config::{CameraBackend, TrackerConfig, VideoSource};
pub use detect::DetectedMarker;
pub use dictionary::{Dictionary, DictionaryName};
pub use pose::Pose;
