//! Tracker construction options, loadable from YAML or JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::calib::{self, Calibration};
use crate::detect::DetectorParams;
use crate::dictionary::DictionaryName;
use crate::pose::PoseSolver;
use crate::{Error, Result};

/// Device index, device/file path, or `"none"` for externally supplied frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VideoSource {
    Index(i32),
    Spec(String),
}

impl VideoSource {
    pub fn none() -> Self {
        VideoSource::Spec("none".into())
    }

    pub fn is_external(&self) -> bool {
        matches!(self, VideoSource::Spec(s) if s.trim().eq_ignore_ascii_case("none"))
    }

    /// Spec string for [`crate::CameraSource::open`]; `None` for external frames.
    pub fn device_spec(&self) -> Option<String> {
        match self {
            _ if self.is_external() => None,
            VideoSource::Index(i) => Some(i.to_string()),
            VideoSource::Spec(s) => Some(s.trim().to_string()),
        }
    }
}

impl Default for VideoSource {
    fn default() -> Self {
        VideoSource::Index(0)
    }
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoSource::Index(i) => write!(f, "{i}"),
            VideoSource::Spec(s) => f.write_str(s),
        }
    }
}

/// Capture backend. `auto` is OpenCV when compiled in; without it, opening a
/// device fails. `mock` must be chosen explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    #[default]
    Auto,
    Mock,
    Opencv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub video_source: VideoSource,
    pub aruco_dictionary: String,
    /// Marker edge length, millimetres.
    pub marker_size: f64,
    pub camera_projection: Option<Vec<Vec<f64>>>,
    pub camera_distortion: Option<Vec<f64>>,
    /// Calibration file, text or YAML.
    pub calibration: Option<PathBuf>,
    pub debug: bool,
    pub capture_properties: BTreeMap<String, f64>,
    pub backend: CameraBackend,
    pub pose_solver: PoseSolver,
    pub detector: DetectorParams,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            video_source: VideoSource::default(),
            aruco_dictionary: DictionaryName::default().to_string(),
            marker_size: 50.0,
            camera_projection: None,
            camera_distortion: None,
            calibration: None,
            debug: false,
            capture_properties: BTreeMap::new(),
            backend: CameraBackend::Auto,
            pose_solver: PoseSolver::Native,
            detector: DetectorParams::default(),
        }
    }
}

impl TrackerConfig {
    /// Defaults with frames supplied by the caller.
    pub fn external() -> Self {
        Self {
            video_source: VideoSource::none(),
            ..Self::default()
        }
    }

    /// Load by extension: `.yaml`/`.yml` or `.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("reading config {}: {e}", path.display())))?;
        let cfg: Self = match extension(path).as_deref() {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("parsing yaml {}: {e}", path.display())))?,
            Some("json") => serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("parsing json {}: {e}", path.display())))?,
            _ => {
                return Err(Error::Config(format!(
                    "unsupported config format: {}",
                    path.display()
                )))
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let out = match extension(path).as_deref() {
            Some("json") => {
                serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?
            }
            _ => serde_yaml::to_string(self).map_err(|e| Error::Config(e.to_string()))?,
        };
        fs::write(path, out).map_err(|e| Error::Io(format!("writing {}: {e}", path.display())))
    }

    pub fn dictionary_name(&self) -> Result<DictionaryName> {
        self.aruco_dictionary.parse()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.marker_size.is_finite() && self.marker_size > 0.0) {
            return Err(Error::Config(format!(
                "marker_size must be positive, got {}",
                self.marker_size
            )));
        }
        self.dictionary_name()?;
        self.detector.validate()?;
        let inline = self.camera_projection.is_some() || self.camera_distortion.is_some();
        if inline && self.calibration.is_some() {
            return Err(Error::Config(
                "give either camera_projection/camera_distortion or calibration, not both".into(),
            ));
        }
        if self.camera_distortion.is_some() && self.camera_projection.is_none() {
            return Err(Error::Config(
                "camera_distortion needs camera_projection".into(),
            ));
        }
        if let Some(k) = &self.camera_projection {
            Calibration::new(k, self.camera_distortion.as_deref().unwrap_or(&[0.0; 5]))?;
        }
        Ok(())
    }

    /// Inline calibration, a calibration file, or none. Projection without
    /// distortion means zero distortion.
    pub fn resolve_calibration(&self) -> Result<Option<Calibration>> {
        match (&self.camera_projection, &self.calibration) {
            (Some(_), Some(_)) => Err(Error::Config(
                "inline calibration and calibration file are mutually exclusive".into(),
            )),
            (Some(k), None) => {
                let d = self.camera_distortion.as_deref().unwrap_or(&[0.0; 5]);
                Calibration::new(k, d).map(Some)
            }
            (None, Some(path)) => calib::load_any(path).map(Some),
            (None, None) => Ok(None),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("aruco-tracker-cfg-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_defaults() {
        let cfg = TrackerConfig::default();
        assert_eq!(cfg.video_source, VideoSource::Index(0));
        assert_eq!(cfg.aruco_dictionary, "DICT_4X4_50");
        assert_eq!(cfg.marker_size, 50.0);
        assert!(!cfg.debug);
        cfg.validate().unwrap();
        assert!(cfg.resolve_calibration().unwrap().is_none());
    }

    #[test]
    fn test_video_source_forms() {
        let cfg: TrackerConfig = serde_yaml::from_str("video_source: none\n").unwrap();
        assert!(cfg.video_source.is_external());
        assert_eq!(cfg.video_source.device_spec(), None);

        let cfg: TrackerConfig = serde_yaml::from_str("video_source: 2\n").unwrap();
        assert_eq!(cfg.video_source, VideoSource::Index(2));
        assert_eq!(cfg.video_source.device_spec().as_deref(), Some("2"));

        let cfg: TrackerConfig =
            serde_json::from_str(r#"{"video_source": "/dev/video1"}"#).unwrap();
        assert_eq!(cfg.video_source.device_spec().as_deref(), Some("/dev/video1"));
        assert!(VideoSource::Spec("NONE".into()).is_external());
    }

    #[test]
    fn test_inline_calibration() {
        let yaml = "\
video_source: none
marker_size: 80
camera_projection:
  - [600.0, 0.0, 320.0]
  - [0.0, 600.0, 240.0]
  - [0.0, 0.0, 1.0]
camera_distortion: [0.1, -0.01, 0.0, 0.0, 0.0]
capture_properties:
  frame_width: 1280
";
        let cfg: TrackerConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        let calib = cfg.resolve_calibration().unwrap().unwrap();
        assert_eq!(calib.intrinsics().fx, 600.0);
        assert_eq!(calib.distortion[0], 0.1);
        assert_eq!(cfg.capture_properties["frame_width"], 1280.0);
    }

    #[test]
    fn test_rejects_bad_matrix_shape() {
        let cfg = TrackerConfig {
            camera_projection: Some(vec![vec![600.0, 0.0], vec![0.0, 600.0]]),
            ..TrackerConfig::external()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
        assert!(matches!(cfg.resolve_calibration(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_non_numeric_matrix() {
        let yaml = "camera_projection:\n  - [a, 0, 0]\n  - [0, 1, 0]\n  - [0, 0, 1]\n";
        assert!(serde_yaml::from_str::<TrackerConfig>(yaml).is_err());
    }

    #[test]
    fn test_rejects_conflicts_and_bad_values() {
        let both = TrackerConfig {
            camera_projection: Some(vec![vec![1.0, 0.0, 0.0]; 3]),
            calibration: Some(PathBuf::from("calib.txt")),
            ..TrackerConfig::default()
        };
        assert!(both.validate().is_err());

        let orphan = TrackerConfig {
            camera_distortion: Some(vec![0.0; 5]),
            ..TrackerConfig::default()
        };
        assert!(orphan.validate().is_err());

        let size = TrackerConfig {
            marker_size: -1.0,
            ..TrackerConfig::default()
        };
        assert!(size.validate().is_err());

        let dict = TrackerConfig {
            aruco_dictionary: "DICT_9X9_1".into(),
            ..TrackerConfig::default()
        };
        assert!(matches!(dict.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_by_extension() {
        let cfg = TrackerConfig {
            marker_size: 35.0,
            debug: true,
            ..TrackerConfig::external()
        };
        for name in ["cfg.yaml", "cfg.json"] {
            let path = tmp(name);
            cfg.save(&path).unwrap();
            let back = TrackerConfig::load(&path).unwrap();
            let _ = fs::remove_file(&path);
            assert_eq!(back, cfg);
        }
        let toml = tmp("cfg.toml");
        fs::write(&toml, "marker_size = 1").unwrap();
        assert!(matches!(TrackerConfig::load(&toml), Err(Error::Config(_))));
        let _ = fs::remove_file(&toml);
        assert!(matches!(
            TrackerConfig::load(tmp("missing.yaml")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_calibration_file_reference() {
        let path = tmp("calib.txt");
        fs::write(&path, "500 0 320\n0 500 240\n0 0 1\n0 0 0 0 0\n").unwrap();
        let cfg = TrackerConfig {
            calibration: Some(path.clone()),
            ..TrackerConfig::external()
        };
        let calib = cfg.resolve_calibration().unwrap().unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(calib.intrinsics().cx, 320.0);
    }
}
