//! The tracker lifecycle: `ready -> tracking -> ready -> ... -> closed`.
//!
//! A [`Tracker`] exists only once its frame source is open, its dictionary
//! resolved and its calibration loaded, so a successfully constructed value
//! is always `Ready`. Frames are pulled one at a time with
//! [`Tracker::get_frame`]; nothing runs in the background.

use std::fmt;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::calib::Calibration;
use crate::config::{CameraBackend, TrackerConfig};
use crate::detect::{DetectedMarker, MarkerDetector, SquareDetector};
use crate::dictionary::{Dictionary, DictionaryName};
use crate::pose::{Pose, PoseEstimator};
use crate::render::annotate;
use crate::{CameraSource, Error, Frame, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerState {
    Ready,
    Tracking,
    Closed,
}

impl fmt::Display for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackerState::Ready => "ready",
            TrackerState::Tracking => "tracking",
            TrackerState::Closed => "closed",
        })
    }
}

/// Result of one [`Tracker::get_frame`] call. All vectors have one entry per
/// detected marker, in the same order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackedFrame {
    /// Marker ids.
    pub ports: Vec<u32>,
    /// Capture time, Unix seconds.
    pub timestamps: Vec<f64>,
    pub frame_numbers: Vec<u64>,
    pub poses: Vec<Pose>,
    /// Always 1.0.
    pub quality: Vec<f64>,
}

impl TrackedFrame {
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// `(id, pose)` pairs.
    pub fn markers(&self) -> impl Iterator<Item = (u32, &Pose)> + '_ {
        self.ports.iter().copied().zip(self.poses.iter())
    }
}

pub struct Tracker {
    config: TrackerConfig,
    state: TrackerState,
    source: Option<Box<dyn CameraSource>>,
    dictionary: DictionaryName,
    detector: Box<dyn MarkerDetector>,
    calibration: Option<Calibration>,
    estimator: PoseEstimator,
    frame_count: u64,
    last_debug_frame: Option<Frame>,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("state", &self.state)
            .field("video_source", &self.config.video_source)
            .field("dictionary", &self.dictionary)
            .field("calibrated", &self.calibration.is_some())
            .field("frame_count", &self.frame_count)
            .finish()
    }
}

impl Tracker {
    /// Open the configured video source (unless it is `"none"`) and return a
    /// `Ready` tracker.
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let source = match config.video_source.device_spec() {
            Some(spec) => Some(open_source(config.backend, &spec)?),
            None => None,
        };
        Self::build(config, source)
    }

    /// Use an already opened frame source instead of the configured one.
    pub fn with_camera(config: TrackerConfig, camera: Box<dyn CameraSource>) -> Result<Self> {
        config.validate()?;
        Self::build(config, Some(camera))
    }

    fn build(config: TrackerConfig, mut source: Option<Box<dyn CameraSource>>) -> Result<Self> {
        let dictionary = config.dictionary_name()?;
        let detector = make_detector(dictionary, &config)?;
        let calibration = config.resolve_calibration()?;

        match source.as_mut() {
            Some(cam) => {
                for (name, value) in &config.capture_properties {
                    if let Err(e) = cam.set_property(name, *value) {
                        warn!(property = %name, value, error = %e, "capture property not applied");
                    }
                }
            }
            None if !config.capture_properties.is_empty() => {
                warn!("capture_properties ignored for external frames");
            }
            None => {}
        }

        let estimator =
            PoseEstimator::new(config.marker_size).with_solver(config.pose_solver);
        info!(
            source = %config.video_source,
            dictionary = %dictionary,
            calibrated = calibration.is_some(),
            "tracker ready"
        );
        Ok(Self {
            config,
            state: TrackerState::Ready,
            source,
            dictionary,
            detector,
            calibration,
            estimator,
            frame_count: 0,
            last_debug_frame: None,
        })
    }

    fn require(&self, expected: TrackerState, op: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::State {
                op,
                state: self.state,
            })
        }
    }

    pub fn start_tracking(&mut self) -> Result<()> {
        self.require(TrackerState::Ready, "start tracking")?;
        self.state = TrackerState::Tracking;
        info!("tracking started");
        Ok(())
    }

    /// Process `frame`, or pull the next one from the video source.
    pub fn get_frame(&mut self, frame: Option<Frame>) -> Result<TrackedFrame> {
        self.require(TrackerState::Tracking, "get frame")?;
        let frame = match (frame, self.source.as_mut()) {
            (Some(f), _) => f,
            (None, Some(cam)) => cam.read().map_err(|e| match e {
                Error::FrameRead(_) => e,
                other => Error::FrameRead(other.to_string()),
            })?,
            (None, None) => {
                return Err(Error::FrameRead(
                    "no frame supplied and no video source".into(),
                ))
            }
        };
        if frame.is_empty() {
            return Err(Error::FrameRead("empty frame".into()));
        }

        let markers = self.detector.detect(&frame)?;
        let poses = self.estimator.estimate_each(&markers, self.calibration.as_ref())?;
        self.frame_count += 1;
        let frame_number = self.frame_count;
        let ts = frame.ts.unwrap_or_else(OffsetDateTime::now_utc);
        let ts = ts.unix_timestamp_nanos() as f64 / 1e9;
        debug!(frame = frame_number, markers = markers.len(), "frame processed");

        if self.config.debug {
            self.last_debug_frame = Some(annotate(&frame, &markers)?);
        }
        Ok(tracked(&markers, poses, ts, frame_number))
    }

    pub fn stop_tracking(&mut self) -> Result<()> {
        self.require(TrackerState::Tracking, "stop tracking")?;
        self.state = TrackerState::Ready;
        info!(frames = self.frame_count, "tracking stopped");
        Ok(())
    }

    /// Release the frame source. Later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        if self.state == TrackerState::Closed {
            return Ok(());
        }
        self.state = TrackerState::Closed;
        self.last_debug_frame = None;
        let released = match self.source.take() {
            Some(mut cam) => cam.release(),
            None => Ok(()),
        };
        info!("tracker closed");
        released
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != TrackerState::Closed
            && self.source.as_ref().map_or(true, |cam| cam.is_open())
    }

    /// Frames processed since construction.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    pub fn dictionary(&self) -> DictionaryName {
        self.dictionary
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Last processed frame with markers drawn in; only kept with `debug`.
    pub fn last_debug_frame(&self) -> Option<&Frame> {
        self.last_debug_frame.as_ref()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "releasing frame source on drop failed");
        }
    }
}

/// Markers whose pose failed are dropped from the result.
fn tracked(
    markers: &[DetectedMarker],
    poses: Vec<Result<Pose>>,
    ts: f64,
    frame_number: u64,
) -> TrackedFrame {
    let mut out = TrackedFrame::default();
    for (m, pose) in markers.iter().zip(poses) {
        match pose {
            Ok(pose) => {
                out.ports.push(m.id);
                out.poses.push(pose);
            }
            Err(e) => {
                warn!(id = m.id, frame = frame_number, error = %e, "marker pose failed; dropped");
            }
        }
    }
    let n = out.ports.len();
    out.timestamps = vec![ts; n];
    out.frame_numbers = vec![frame_number; n];
    out.quality = vec![1.0; n];
    out
}

fn make_detector(name: DictionaryName, config: &TrackerConfig) -> Result<Box<dyn MarkerDetector>> {
    if name.is_builtin() {
        let dict = Dictionary::builtin(name)?;
        return Ok(Box::new(SquareDetector::new(dict, config.detector)));
    }
    #[cfg(feature = "opencv")]
    {
        Ok(Box::new(crate::detect::OpenCvArucoDetector::new(name)?))
    }
    #[cfg(not(feature = "opencv"))]
    {
        Err(Error::Config(format!(
            "dictionary {name} needs the opencv feature"
        )))
    }
}

fn open_source(backend: CameraBackend, spec: &str) -> Result<Box<dyn CameraSource>> {
    match backend {
        CameraBackend::Opencv => open_opencv(spec),
        CameraBackend::Mock => open_mock(spec),
        CameraBackend::Auto => {
            if cfg!(feature = "opencv") {
                open_opencv(spec)
            } else {
                Err(Error::Io(format!(
                    "cannot open video source {spec}: no capture backend compiled in \
                     (enable the `opencv` feature, or set `backend: mock`)"
                )))
            }
        }
    }
}

#[cfg(feature = "opencv")]
fn open_opencv(spec: &str) -> Result<Box<dyn CameraSource>> {
    let cam = crate::OpenCvCamera::open(spec)?;
    info!(spec, "opencv camera opened");
    Ok(Box::new(cam))
}

#[cfg(not(feature = "opencv"))]
fn open_opencv(_spec: &str) -> Result<Box<dyn CameraSource>> {
    Err(Error::Unsupported("opencv backend requires the `opencv` feature"))
}

#[cfg(feature = "mock")]
fn open_mock(spec: &str) -> Result<Box<dyn CameraSource>> {
    let cam = crate::MockCamera::open(spec)?;
    info!(spec, "mock camera opened");
    Ok(Box::new(cam))
}

#[cfg(not(feature = "mock"))]
fn open_mock(_spec: &str) -> Result<Box<dyn CameraSource>> {
    Err(Error::Unsupported("mock backend requires the `mock` feature"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoSource;
    use crate::mock::{MockCamera, MOCK_MARKER_ID};
    use crate::render::Scene;
    use crate::PixelFormat;
    use image::{GrayImage, Luma};
    use std::cell::Cell;
    use std::rc::Rc;

    fn marker_frame(id: u32) -> Frame {
        let dict = Dictionary::builtin(DictionaryName::Dict4x4_50).unwrap();
        let img = Scene::new(320, 240)
            .with_square_marker(&dict, id, [160.0, 120.0], 96.0)
            .unwrap()
            .render();
        Frame::from_gray(img)
    }

    fn blank_frame() -> Frame {
        Frame::from_gray(GrayImage::from_pixel(320, 240, Luma([255])))
    }

    fn external() -> Tracker {
        Tracker::new(TrackerConfig::external()).unwrap()
    }

    #[test]
    fn test_single_marker_scenario() {
        let mut t = external();
        assert_eq!(t.state(), TrackerState::Ready);
        t.start_tracking().unwrap();
        let out = t.get_frame(Some(marker_frame(7))).unwrap();
        assert_eq!(out.ports, vec![7]);
        assert_eq!(out.poses.len(), 1);
        assert_eq!(out.quality, vec![1.0]);
        assert_eq!(out.frame_numbers, vec![1]);
        assert_eq!(out.timestamps.len(), 1);
        // uncalibrated: centroid and negative apparent size
        let [x, y, z] = out.poses[0].position();
        assert!((x - 160.0).abs() < 2.0 && (y - 120.0).abs() < 2.0);
        assert!(z < 0.0);
        assert!(t.calibration().is_none());
    }

    #[test]
    fn test_no_markers_is_empty_success() {
        let mut t = external();
        t.start_tracking().unwrap();
        let out = t.get_frame(Some(blank_frame())).unwrap();
        assert!(out.is_empty());
        assert!(out.poses.is_empty() && out.quality.is_empty());
        assert_eq!(t.frame_count(), 1);
    }

    #[test]
    fn test_get_frame_before_start_leaves_source_untouched() {
        let cam = MockCamera::from_frames(vec![marker_frame(3)]);
        let mut t = Tracker::with_camera(TrackerConfig::default(), Box::new(cam)).unwrap();
        let err = t.get_frame(None).unwrap_err();
        assert!(err.is_state());
        assert!(matches!(
            err,
            Error::State {
                state: TrackerState::Ready,
                ..
            }
        ));
        // the queued frame is still there
        t.start_tracking().unwrap();
        assert_eq!(t.get_frame(None).unwrap().ports, vec![3]);
        assert!(matches!(t.get_frame(None), Err(Error::FrameRead(_))));
    }

    #[test]
    fn test_double_start_keeps_session() {
        let mut t = external();
        t.start_tracking().unwrap();
        assert!(t.start_tracking().unwrap_err().is_state());
        assert_eq!(t.state(), TrackerState::Tracking);
        assert_eq!(t.get_frame(Some(marker_frame(7))).unwrap().ports, vec![7]);
    }

    #[test]
    fn test_stop_outside_tracking() {
        let mut t = external();
        assert!(t.stop_tracking().unwrap_err().is_state());
        t.start_tracking().unwrap();
        t.stop_tracking().unwrap();
        assert_eq!(t.state(), TrackerState::Ready);
        assert!(t.stop_tracking().unwrap_err().is_state());
        assert!(t.get_frame(Some(blank_frame())).unwrap_err().is_state());
        // restartable
        t.start_tracking().unwrap();
    }

    #[test]
    fn test_close_from_any_state() {
        let mut ready = external();
        ready.close().unwrap();
        assert!(!ready.is_open());
        assert_eq!(ready.state(), TrackerState::Closed);

        let mut tracking = external();
        tracking.start_tracking().unwrap();
        tracking.close().unwrap();
        assert!(!tracking.is_open());

        // idempotent, and everything else is refused
        tracking.close().unwrap();
        assert!(tracking.start_tracking().unwrap_err().is_state());
        assert!(tracking.stop_tracking().unwrap_err().is_state());
        assert!(tracking.get_frame(Some(blank_frame())).unwrap_err().is_state());
    }

    #[test]
    fn test_external_source_needs_a_frame() {
        let mut t = external();
        t.start_tracking().unwrap();
        assert!(matches!(t.get_frame(None), Err(Error::FrameRead(_))));
        let empty = Frame::gray(0, 0, Vec::new());
        assert!(matches!(t.get_frame(Some(empty)), Err(Error::FrameRead(_))));
        // still tracking after a failed read
        assert_eq!(t.state(), TrackerState::Tracking);
    }

    #[test]
    fn test_mock_device_with_capture_properties() {
        let mut cfg = TrackerConfig {
            video_source: VideoSource::Index(0),
            backend: CameraBackend::Mock,
            debug: true,
            ..TrackerConfig::default()
        };
        cfg.capture_properties.insert("frame_width".into(), 400.0);
        // rejected by the mock camera; logged and skipped
        cfg.capture_properties.insert("exposure".into(), -4.0);
        let mut t = Tracker::new(cfg).unwrap();
        assert!(t.is_open());
        t.start_tracking().unwrap();
        for n in 1..=3 {
            let out = t.get_frame(None).unwrap();
            assert_eq!(out.ports, vec![MOCK_MARKER_ID]);
            assert_eq!(out.frame_numbers, vec![n]);
        }
        let dbg = t.last_debug_frame().unwrap();
        assert_eq!((dbg.width, dbg.pixel_format), (400, PixelFormat::Rgb8));
        t.close().unwrap();
        assert!(!t.is_open());
        assert!(t.last_debug_frame().is_none());
    }

    #[cfg(not(feature = "opencv"))]
    #[test]
    fn test_device_source_without_capture_backend_fails() {
        let cfg = TrackerConfig {
            video_source: VideoSource::Spec("/dev/video99-does-not-exist".into()),
            ..TrackerConfig::default()
        };
        assert_eq!(cfg.backend, CameraBackend::Auto);
        let err = Tracker::new(cfg).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");

        let cfg = TrackerConfig {
            video_source: VideoSource::Index(0),
            ..TrackerConfig::default()
        };
        assert!(matches!(Tracker::new(cfg), Err(Error::Io(_))));
    }

    #[test]
    fn test_failed_pose_drops_only_that_marker() {
        let good = DetectedMarker {
            id: 4,
            corners: [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]],
            hamming: 0,
        };
        let bad = DetectedMarker { id: 9, ..good.clone() };
        let poses = vec![
            Ok(crate::pose::screen_pose(&good.corners)),
            Err(Error::Pose("degenerate corners".into())),
        ];
        let out = tracked(&[good, bad], poses, 12.5, 3);
        assert_eq!(out.ports, vec![4]);
        assert_eq!(out.poses.len(), 1);
        assert_eq!(out.timestamps, vec![12.5]);
        assert_eq!(out.frame_numbers, vec![3]);
        assert_eq!(out.quality, vec![1.0]);
    }

    #[test]
    fn test_calibrated_pose() {
        let cfg = TrackerConfig {
            camera_projection: Some(vec![
                vec![600.0, 0.0, 160.0],
                vec![0.0, 600.0, 120.0],
                vec![0.0, 0.0, 1.0],
            ]),
            camera_distortion: Some(vec![0.0; 5]),
            ..TrackerConfig::external()
        };
        let mut t = Tracker::new(cfg).unwrap();
        assert!(t.calibration().is_some());
        t.start_tracking().unwrap();
        let out = t.get_frame(Some(marker_frame(7))).unwrap();
        let pose = out.poses[0];
        assert!(pose.rotation().is_some());
        // 50 mm marker, 96 px wide at f = 600 px
        let z = pose.position()[2];
        assert!((z - 312.5).abs() < 10.0, "z = {z}");
    }

    #[test]
    fn test_unknown_dictionary_fails_fast() {
        let cfg = TrackerConfig {
            aruco_dictionary: "DICT_3X3_7".into(),
            ..TrackerConfig::external()
        };
        assert!(matches!(Tracker::new(cfg), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_calibration_file() {
        let cfg = TrackerConfig {
            calibration: Some(std::env::temp_dir().join("aruco-tracker-no-such-calib.txt")),
            ..TrackerConfig::external()
        };
        assert!(matches!(Tracker::new(cfg), Err(Error::Io(_))));
    }

    struct CountingSource {
        released: Rc<Cell<u32>>,
    }

    impl CameraSource for CountingSource {
        fn open(_spec: &str) -> Result<Self> {
            Err(Error::Unsupported("built directly in tests"))
        }

        fn read(&mut self) -> Result<Frame> {
            Err(Error::Backend("device unplugged".into()))
        }

        fn is_open(&self) -> bool {
            self.released.get() == 0
        }

        fn release(&mut self) -> Result<()> {
            self.released.set(self.released.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_drop_releases_source_once() {
        let released = Rc::new(Cell::new(0));
        {
            let source = CountingSource {
                released: Rc::clone(&released),
            };
            let mut t = Tracker::with_camera(TrackerConfig::default(), Box::new(source)).unwrap();
            t.start_tracking().unwrap();
            // device errors surface as frame-read errors
            assert!(matches!(t.get_frame(None), Err(Error::FrameRead(_))));
        }
        assert_eq!(released.get(), 1);

        let source = CountingSource {
            released: Rc::clone(&released),
        };
        let mut t = Tracker::with_camera(TrackerConfig::default(), Box::new(source)).unwrap();
        t.close().unwrap();
        t.close().unwrap();
        drop(t);
        assert_eq!(released.get(), 2);
    }
}
