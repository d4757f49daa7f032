//! Camera calibration: projection matrix + distortion coefficients.
//!
//! The on-disk text format is whitespace-delimited with no header:
//!
//! ```text
//! fx 0  cx
//! 0  fy cy
//! 0  0  1
//! k1 k2 p1 p2 k3
//! ```

use crate::camera::{CameraIntrinsics, CameraModel, Distortion};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub projection_matrix: [[f64; 3]; 3],
    pub distortion: [f64; 5],
}

impl Calibration {
    /// Build from loosely-shaped input (config files, CLI), checking shape.
    pub fn new(matrix: &[Vec<f64>], distortion: &[f64]) -> Result<Self> {
        if matrix.len() != 3 || matrix.iter().any(|row| row.len() != 3) {
            let shape: Vec<usize> = matrix.iter().map(Vec::len).collect();
            return Err(Error::Config(format!(
                "projection matrix must be 3x3, got {} rows with lengths {:?}",
                matrix.len(),
                shape
            )));
        }
        let mut k = [[0.0f64; 3]; 3];
        for (r, row) in matrix.iter().enumerate() {
            k[r].copy_from_slice(row);
        }
        let d = match distortion.len() {
            5 => [
                distortion[0],
                distortion[1],
                distortion[2],
                distortion[3],
                distortion[4],
            ],
            // k1 k2 p1 p2 without k3
            4 => [
                distortion[0],
                distortion[1],
                distortion[2],
                distortion[3],
                0.0,
            ],
            n => {
                return Err(Error::Config(format!(
                    "distortion must have 5 coefficients, got {n}"
                )))
            }
        };
        let calib = Self {
            projection_matrix: k,
            distortion: d,
        };
        calib.validate()?;
        Ok(calib)
    }

    pub fn validate(&self) -> Result<()> {
        let finite = self.projection_matrix.iter().flatten().all(|v| v.is_finite())
            && self.distortion.iter().all(|v| v.is_finite());
        if !finite {
            return Err(Error::Config("calibration contains non-finite values".into()));
        }
        if !self.intrinsics().is_valid() {
            return Err(Error::Config("projection matrix has zero focal length".into()));
        }
        Ok(())
    }

    pub fn intrinsics(&self) -> CameraIntrinsics {
        let k = &self.projection_matrix;
        CameraIntrinsics {
            fx: k[0][0],
            fy: k[1][1],
            cx: k[0][2],
            cy: k[1][2],
        }
    }

    pub fn camera_model(&self) -> CameraModel {
        CameraModel {
            intrinsics: self.intrinsics(),
            distortion: Distortion::from_coeffs(self.distortion),
        }
    }
}

/// Load the four-row text format.
pub fn load_calibration(path: impl AsRef<Path>) -> Result<Calibration> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Io(format!("reading calibration {}: {e}", path.display())))?;
    parse_calibration(&raw)
        .map_err(|e| Error::Config(format!("parsing calibration {}: {e}", path.display())))
}

fn parse_calibration(raw: &str) -> core::result::Result<Calibration, String> {
    let rows: Vec<Vec<f64>> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(i, line)| {
            line.split_whitespace()
                .map(|tok| match tok.parse::<f64>() {
                    Ok(v) if v.is_finite() => Ok(v),
                    _ => Err(format!("row {}: invalid number '{tok}'", i + 1)),
                })
                .collect::<core::result::Result<Vec<f64>, String>>()
        })
        .collect::<core::result::Result<_, _>>()?;

    if rows.len() != 4 {
        return Err(format!("expected 4 rows, found {}", rows.len()));
    }
    for (i, row) in rows[..3].iter().enumerate() {
        if row.len() != 3 {
            return Err(format!("row {}: expected 3 values, found {}", i + 1, row.len()));
        }
    }
    if rows[3].len() != 5 {
        return Err(format!("row 4: expected 5 values, found {}", rows[3].len()));
    }
    Calibration::new(&rows[..3], &rows[3]).map_err(|e| e.to_string())
}

/// Write the four-row text format. Values use shortest round-trip formatting.
pub fn write_calibration(calib: &Calibration, path: impl AsRef<Path>) -> Result<()> {
    let mut s = String::new();
    for row in &calib.projection_matrix {
        s.push_str(&join(row));
        s.push('\n');
    }
    s.push_str(&join(&calib.distortion));
    s.push('\n');
    fs::write(path.as_ref(), s).map_err(|e| Error::Io(e.to_string()))
}

fn join(v: &[f64]) -> String {
    v.iter().map(f64::to_string).collect::<Vec<_>>().join(" ")
}

pub fn write_yaml(calib: &Calibration, path: impl AsRef<Path>) -> Result<()> {
    let s = serde_yaml::to_string(calib).map_err(|e| Error::Config(e.to_string()))?;
    fs::write(path.as_ref(), s).map_err(|e| Error::Io(e.to_string()))
}

pub fn read_yaml(path: impl AsRef<Path>) -> Result<Calibration> {
    let raw = fs::read_to_string(path.as_ref()).map_err(|e| Error::Io(e.to_string()))?;
    let calib: Calibration =
        serde_yaml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?;
    calib.validate()?;
    Ok(calib)
}

/// Pick the reader by extension: `.yaml`/`.yml` for YAML, anything else is text.
pub fn load_any(path: impl AsRef<Path>) -> Result<Calibration> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("yaml") | Some("yml") => read_yaml(path),
        _ => load_calibration(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tmp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("aruco-tracker-{}-{name}", std::process::id()))
    }

    fn sample() -> Calibration {
        Calibration {
            projection_matrix: [
                [812.345678901234, 0.0, 319.5],
                [0.0, 809.1, 241.000000001],
                [0.0, 0.0, 1.0],
            ],
            distortion: [-0.1234567, 0.0456, 1.5e-7, -3.25e-4, 0.001],
        }
    }

    #[test]
    fn test_text_round_trip_is_exact() {
        let path = tmp("roundtrip.txt");
        let calib = sample();
        write_calibration(&calib, &path).unwrap();
        let back = load_calibration(&path).unwrap();
        let _ = fs::remove_file(&path);
        for r in 0..3 {
            for c in 0..3 {
                assert_eq!(
                    back.projection_matrix[r][c].to_bits(),
                    calib.projection_matrix[r][c].to_bits()
                );
            }
        }
        for i in 0..5 {
            assert_eq!(back.distortion[i].to_bits(), calib.distortion[i].to_bits());
        }
    }

    #[test]
    fn test_yaml_round_trip() {
        let path = tmp("roundtrip.yaml");
        write_yaml(&sample(), &path).unwrap();
        let back = load_any(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(back, sample());
    }

    #[test]
    fn test_load_any_ignores_extension_case() {
        for name in ["upper.YAML", "mixed.Yml"] {
            let path = tmp(name);
            write_yaml(&sample(), &path).unwrap();
            let back = load_any(&path);
            let _ = fs::remove_file(&path);
            assert_eq!(back.unwrap(), sample(), "{name}");
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_calibration(tmp("does-not-exist.txt")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_malformed_rows() {
        assert!(parse_calibration("1 0 0\n0 1 0\n0 0 1\n").is_err());
        assert!(parse_calibration("1 0\n0 1 0\n0 0 1\n0 0 0 0 0\n").is_err());
        assert!(parse_calibration("1 0 0\n0 1 0\n0 0 1\n0 0 0 0\n").is_err());
        assert!(parse_calibration("1 0 x\n0 1 0\n0 0 1\n0 0 0 0 0\n").is_err());
        assert!(parse_calibration("1 0 0\n0 1 0\n0 0 1\n0 0 0 0 NaN\n").is_err());
    }

    #[test]
    fn test_blank_lines_are_ignored() {
        let c = parse_calibration("\n600 0 320\n\n0 600 240\n0 0 1\n0 0 0 0 0\n\n").unwrap();
        assert_eq!(c.intrinsics().fx, 600.0);
        assert_eq!(c.intrinsics().cy, 240.0);
    }

    #[test]
    fn test_new_rejects_bad_shape() {
        let bad = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert!(matches!(
            Calibration::new(&bad, &[0.0; 5]),
            Err(Error::Config(_))
        ));
        let four_cols = vec![vec![1.0, 0.0, 0.0, 0.0]; 3];
        assert!(Calibration::new(&four_cols, &[0.0; 5]).is_err());
        let ok = vec![
            vec![500.0, 0.0, 10.0],
            vec![0.0, 500.0, 10.0],
            vec![0.0, 0.0, 1.0],
        ];
        assert!(Calibration::new(&ok, &[0.0; 3]).is_err());
        let c = Calibration::new(&ok, &[0.1, 0.2, 0.0, 0.0]).unwrap();
        assert_eq!(c.distortion[4], 0.0);
    }
}
