//! Square fiducial detection.
//!
//! The native detector thresholds the frame (Otsu), labels dark connected
//! components, fits a quadrilateral to each one, refines the sides by line
//! fitting and reads the cell grid through a homography. Candidates whose
//! border is not dark or whose inner code is not in the dictionary are
//! dropped.

use crate::dictionary::Dictionary;
use crate::homography::{estimate_homography, project};
use crate::{Error, Frame, Result};
use image::{GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A marker found in one frame. Corners are image pixels, clockwise from the
/// marker's own top-left corner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedMarker {
    pub id: u32,
    pub corners: [[f64; 2]; 4],
    /// Bits corrected while matching the dictionary.
    pub hamming: u32,
}

impl DetectedMarker {
    pub fn center(&self) -> [f64; 2] {
        let sx: f64 = self.corners.iter().map(|c| c[0]).sum();
        let sy: f64 = self.corners.iter().map(|c| c[1]).sum();
        [sx / 4.0, sy / 4.0]
    }
}

pub trait MarkerDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedMarker>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Shortest accepted quad side, pixels.
    pub min_side_px: f64,
    /// Smallest dark component considered, pixels.
    pub min_component_px: usize,
    /// Fraction of border cells allowed to read white.
    pub max_border_error_rate: f64,
    /// Fraction of each cell ignored on every side when sampling.
    pub cell_margin: f64,
    /// Minimum contrast between darkest and brightest cell.
    pub min_contrast: f64,
    /// Refine corners by fitting lines to the quad sides.
    pub refine_corners: bool,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            min_side_px: 12.0,
            min_component_px: 48,
            max_border_error_rate: 0.35,
            cell_margin: 0.2,
            min_contrast: 30.0,
            refine_corners: true,
        }
    }
}

impl DetectorParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_side_px.is_finite() && self.min_side_px > 0.0) {
            return Err(Error::Config("detector.min_side_px must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.max_border_error_rate) {
            return Err(Error::Config(
                "detector.max_border_error_rate must be in [0, 1)".into(),
            ));
        }
        if !(0.0..0.5).contains(&self.cell_margin) {
            return Err(Error::Config("detector.cell_margin must be in [0, 0.5)".into()));
        }
        Ok(())
    }
}

/// Pure-Rust detector over a built-in dictionary.
pub struct SquareDetector {
    dictionary: Dictionary,
    params: DetectorParams,
}

impl SquareDetector {
    pub fn new(dictionary: Dictionary, params: DetectorParams) -> Self {
        Self { dictionary, params }
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    pub fn detect_gray(&self, img: &GrayImage) -> Vec<DetectedMarker> {
        let (lo, hi) = img
            .pixels()
            .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
        if lo >= hi {
            return Vec::new();
        }
        let threshold = otsu_level(img);
        let mut found = Vec::new();
        for comp in dark_components(img, threshold, self.params.min_component_px) {
            let Some(quad) = fit_quad(&comp, self.params.min_side_px) else {
                continue;
            };
            let quad = if self.params.refine_corners {
                refine_quad(&comp, quad, self.dictionary.marker_size() + 2).unwrap_or(quad)
            } else {
                quad
            };
            if let Some(marker) = self.decode(img, quad) {
                trace!(id = marker.id, hamming = marker.hamming, "marker decoded");
                found.push(marker);
            }
        }
        found.sort_by_key(|m| m.id);
        found
    }

    /// Try the four corner rotations; keep the best dictionary match.
    fn decode(&self, img: &GrayImage, quad: [[f64; 2]; 4]) -> Option<DetectedMarker> {
        let n = self.dictionary.marker_size();
        let cells = n + 2;
        let mut best: Option<DetectedMarker> = None;
        for k in 0..4 {
            let corners = rotate_corners(quad, k);
            let grid = sample_cells(img, &corners, cells, self.params.cell_margin)?;
            let (lo, hi) = grid
                .iter()
                .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            if hi - lo < self.params.min_contrast {
                return None;
            }
            let mid = 0.5 * (lo + hi);
            let white = |x: usize, y: usize| grid[y * cells + x] > mid;

            let border_errors = (0..cells * cells)
                .map(|i| (i % cells, i / cells))
                .filter(|&(x, y)| x == 0 || y == 0 || x == cells - 1 || y == cells - 1)
                .filter(|&(x, y)| white(x, y))
                .count();
            let border_cells = 4 * (cells - 1);
            if border_errors as f64 > self.params.max_border_error_rate * border_cells as f64 {
                return None;
            }

            let mut code = 0u64;
            for y in 0..n {
                for x in 0..n {
                    if white(x + 1, y + 1) {
                        code |= 1 << (y * n + x);
                    }
                }
            }
            if let Some((id, hamming)) = self.dictionary.identify(code) {
                if best.as_ref().map_or(true, |b| hamming < b.hamming) {
                    best = Some(DetectedMarker {
                        id,
                        corners,
                        hamming,
                    });
                }
            }
        }
        best
    }
}

impl MarkerDetector for SquareDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedMarker>> {
        if frame.is_empty() {
            return Err(Error::FrameRead("empty frame".into()));
        }
        Ok(self.detect_gray(&frame.to_gray()?))
    }
}

fn rotate_corners(q: [[f64; 2]; 4], k: usize) -> [[f64; 2]; 4] {
    [q[k % 4], q[(k + 1) % 4], q[(k + 2) % 4], q[(k + 3) % 4]]
}

struct Component {
    pixels: Vec<(u32, u32)>,
    boundary: Vec<(u32, u32)>,
}

/// 4-connected components of pixels `<= threshold` that do not touch the
/// image edge.
fn dark_components(img: &GrayImage, threshold: u8, min_px: usize) -> Vec<Component> {
    let (w, h) = img.dimensions();
    let mask = GrayImage::from_fn(w, h, |x, y| {
        Luma([if img.get_pixel(x, y)[0] <= threshold { 255 } else { 0 }])
    });
    let labels = connected_components(&mask, Connectivity::Four, Luma([0u8]));
    let count = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;

    let mut pixels: Vec<Vec<(u32, u32)>> = vec![Vec::new(); count + 1];
    let mut touches_edge = vec![false; count + 1];
    for (x, y, l) in labels.enumerate_pixels() {
        let l = l[0] as usize;
        if l == 0 {
            continue;
        }
        pixels[l].push((x, y));
        if x == 0 || y == 0 || x + 1 == w || y + 1 == h {
            touches_edge[l] = true;
        }
    }

    let label_at = |x: u32, y: u32| labels.get_pixel(x, y)[0] as usize;
    pixels
        .into_iter()
        .enumerate()
        .skip(1)
        .filter(|(l, px)| !touches_edge[*l] && px.len() >= min_px)
        .map(|(l, pixels)| {
            // no pixel of a kept component lies on the image edge
            let boundary = pixels
                .iter()
                .copied()
                .filter(|&(x, y)| {
                    label_at(x - 1, y) != l
                        || label_at(x + 1, y) != l
                        || label_at(x, y - 1) != l
                        || label_at(x, y + 1) != l
                })
                .collect();
            Component { pixels, boundary }
        })
        .collect()
}

/// Bilinear sample; `None` outside `[0, width - 1] x [0, height - 1]`.
fn sample_bilinear(img: &GrayImage, x: f64, y: f64) -> Option<f64> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let in_range = |v: f64, size: u32| v >= 0.0 && v <= f64::from(size - 1);
    if !(in_range(x, w) && in_range(y, h)) {
        return None;
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - f64::from(x0), y - f64::from(y0));
    let p = |x: u32, y: u32| f64::from(img.get_pixel(x, y)[0]);
    let top = p(x0, y0) + (p(x1, y0) - p(x0, y0)) * fx;
    let bot = p(x0, y1) + (p(x1, y1) - p(x0, y1)) * fx;
    Some(top + (bot - top) * fy)
}

fn dist(a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - b[0]).hypot(a[1] - b[1])
}

fn cross(o: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

/// Quad from extreme boundary points, clockwise on screen (y down).
fn fit_quad(comp: &Component, min_side: f64) -> Option<[[f64; 2]; 4]> {
    let pts: Vec<[f64; 2]> = comp
        .boundary
        .iter()
        .map(|&(x, y)| [f64::from(x), f64::from(y)])
        .collect();
    let n = comp.pixels.len() as f64;
    let cx = comp.pixels.iter().map(|p| f64::from(p.0)).sum::<f64>() / n;
    let cy = comp.pixels.iter().map(|p| f64::from(p.1)).sum::<f64>() / n;

    let farthest = |from: [f64; 2]| {
        pts.iter()
            .copied()
            .max_by(|a, b| dist(*a, from).total_cmp(&dist(*b, from)))
    };
    let c0 = farthest([cx, cy])?;
    let c2 = farthest(c0)?;
    let diag = dist(c0, c2);
    if diag < min_side {
        return None;
    }
    let c1 = pts
        .iter()
        .copied()
        .max_by(|a, b| cross(c0, c2, *a).total_cmp(&cross(c0, c2, *b)))?;
    let c3 = pts
        .iter()
        .copied()
        .min_by(|a, b| cross(c0, c2, *a).total_cmp(&cross(c0, c2, *b)))?;
    let (h1, h3) = (cross(c0, c2, c1) / diag, -cross(c0, c2, c3) / diag);
    if h1 < 0.25 * diag || h3 < 0.25 * diag {
        return None;
    }

    let mut quad = [c0, c1, c2, c3];
    if signed_area(&quad) < 0.0 {
        quad.swap(1, 3);
    }
    let convex = (0..4).all(|i| cross(quad[i], quad[(i + 1) % 4], quad[(i + 2) % 4]) > 0.0);
    let sides_ok = (0..4).all(|i| dist(quad[i], quad[(i + 1) % 4]) >= min_side);
    (convex && sides_ok).then_some(quad)
}

fn signed_area(q: &[[f64; 2]; 4]) -> f64 {
    (0..4)
        .map(|i| {
            let (a, b) = (q[i], q[(i + 1) % 4]);
            a[0] * b[1] - b[0] * a[1]
        })
        .sum::<f64>()
        * 0.5
}

/// Fit a line to the boundary pixels of each side and intersect neighbours.
fn refine_quad(comp: &Component, quad: [[f64; 2]; 4], cells: usize) -> Option<[[f64; 2]; 4]> {
    let center = [
        quad.iter().map(|c| c[0]).sum::<f64>() / 4.0,
        quad.iter().map(|c| c[1]).sum::<f64>() / 4.0,
    ];
    let mut lines = [(0.0f64, 0.0f64, 0.0f64); 4];
    for (i, line) in lines.iter_mut().enumerate() {
        let (a, b) = (quad[i], quad[(i + 1) % 4]);
        let len = dist(a, b);
        let band = (len / cells as f64 * 0.4).clamp(1.0, 3.0);
        let dir = [(b[0] - a[0]) / len, (b[1] - a[1]) / len];
        let near: Vec<[f64; 2]> = comp
            .boundary
            .iter()
            .map(|&(x, y)| [f64::from(x), f64::from(y)])
            .filter(|p| {
                let t = ((p[0] - a[0]) * dir[0] + (p[1] - a[1]) * dir[1]) / len;
                let d = ((p[0] - a[0]) * dir[1] - (p[1] - a[1]) * dir[0]).abs();
                (0.1..=0.9).contains(&t) && d <= band
            })
            .collect();
        if near.len() < 3 {
            return None;
        }
        let (mut nx, mut ny, mut c) = fit_line(&near)?;
        // orient the normal away from the quad centre, then move the line
        // from pixel centres out to pixel edges
        if nx * center[0] + ny * center[1] + c > 0.0 {
            nx = -nx;
            ny = -ny;
            c = -c;
        }
        *line = (nx, ny, c - 0.5);
    }

    let mut refined = [[0.0; 2]; 4];
    for i in 0..4 {
        // corner i joins side i-1 and side i
        let p = intersect(lines[(i + 3) % 4], lines[i])?;
        if dist(p, quad[i]) > 3.0 {
            return None;
        }
        refined[i] = p;
    }
    Some(refined)
}

/// Total least squares line `nx*x + ny*y + c = 0` with unit normal.
fn fit_line(pts: &[[f64; 2]]) -> Option<(f64, f64, f64)> {
    let n = pts.len() as f64;
    let mx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let my = pts.iter().map(|p| p[1]).sum::<f64>() / n;
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for p in pts {
        let (dx, dy) = (p[0] - mx, p[1] - my);
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    // direction of largest spread
    let theta = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    let (nx, ny) = (-theta.sin(), theta.cos());
    let c = -(nx * mx + ny * my);
    (c.is_finite()).then_some((nx, ny, c))
}

fn intersect(l1: (f64, f64, f64), l2: (f64, f64, f64)) -> Option<[f64; 2]> {
    let det = l1.0 * l2.1 - l2.0 * l1.1;
    if det.abs() < 1e-9 {
        return None;
    }
    let x = (l1.1 * l2.2 - l2.1 * l1.2) / det;
    let y = (l2.0 * l1.2 - l1.0 * l2.2) / det;
    Some([x, y])
}

/// Mean intensity per cell over a `cells x cells` grid spanning the quad.
fn sample_cells(
    img: &GrayImage,
    corners: &[[f64; 2]; 4],
    cells: usize,
    margin: f64,
) -> Option<Vec<f64>> {
    let s = cells as f64;
    let canon = [[0.0, 0.0], [s, 0.0], [s, s], [0.0, s]];
    let h = estimate_homography(&canon, corners).ok()?;
    const SUB: usize = 3;
    let span = 1.0 - 2.0 * margin;
    let mut out = Vec::with_capacity(cells * cells);
    for cy in 0..cells {
        for cx in 0..cells {
            let mut acc = 0.0;
            for j in 0..SUB {
                for i in 0..SUB {
                    let u = cx as f64 + margin + span * (i as f64 + 0.5) / SUB as f64;
                    let v = cy as f64 + margin + span * (j as f64 + 0.5) / SUB as f64;
                    let p = project(&h, u, v)?;
                    acc += sample_bilinear(img, p[0], p[1])?;
                }
            }
            out.push(acc / (SUB * SUB) as f64);
        }
    }
    Some(out)
}

#[cfg(feature = "opencv")]
pub use self::opencv_aruco::OpenCvArucoDetector;

#[cfg(feature = "opencv")]
mod opencv_aruco {
    use super::{DetectedMarker, MarkerDetector};
    use crate::dictionary::DictionaryName;
    use crate::{Error, Frame, Result};
    use opencv::{core, objdetect, prelude::*};

    /// Detector backed by OpenCV's ArUco module; covers every predefined dictionary.
    pub struct OpenCvArucoDetector {
        inner: objdetect::ArucoDetector,
    }

    impl OpenCvArucoDetector {
        pub fn new(name: DictionaryName) -> Result<Self> {
            let dict = objdetect::get_predefined_dictionary_i32(name.opencv_id())?;
            let params = objdetect::DetectorParameters::default()?;
            let refine = objdetect::RefineParameters::new(10.0, 3.0, true)?;
            let inner = objdetect::ArucoDetector::new(&dict, &params, refine)?;
            Ok(Self { inner })
        }
    }

    impl MarkerDetector for OpenCvArucoDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedMarker>> {
            if frame.is_empty() || !frame.is_consistent() {
                return Err(Error::FrameRead("empty or inconsistent frame".into()));
            }
            let gray = frame.to_gray()?;
            let mat = core::Mat::from_slice(gray.as_raw())?;
            let mat = mat.reshape(1, frame.height as i32)?;

            let mut corners = core::Vector::<core::Vector<core::Point2f>>::new();
            let mut ids = core::Vector::<i32>::new();
            let mut rejected = core::Vector::<core::Vector<core::Point2f>>::new();
            self.inner
                .detect_markers(&mat, &mut corners, &mut ids, &mut rejected)?;

            let mut out = Vec::with_capacity(ids.len());
            for (id, quad) in ids.iter().zip(corners.iter()) {
                if quad.len() != 4 || id < 0 {
                    continue;
                }
                let mut c = [[0.0f64; 2]; 4];
                for (i, p) in quad.iter().enumerate() {
                    c[i] = [f64::from(p.x), f64::from(p.y)];
                }
                out.push(DetectedMarker {
                    id: id as u32,
                    corners: c,
                    hamming: 0,
                });
            }
            out.sort_by_key(|m| m.id);
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::DictionaryName;
    use crate::render::Scene;

    fn detector() -> SquareDetector {
        let dict = Dictionary::builtin(DictionaryName::Dict4x4_50).unwrap();
        SquareDetector::new(dict, DetectorParams::default())
    }

    fn dict() -> Dictionary {
        Dictionary::builtin(DictionaryName::Dict4x4_50).unwrap()
    }

    #[test]
    fn test_blank_frame_has_no_markers() {
        let img = GrayImage::from_pixel(160, 120, Luma([255]));
        assert!(detector().detect_gray(&img).is_empty());
        let img = GrayImage::from_pixel(160, 120, Luma([0]));
        assert!(detector().detect_gray(&img).is_empty());
    }

    #[test]
    fn test_detects_axis_aligned_marker() {
        let img = Scene::new(320, 240)
            .with_square_marker(&dict(), 7, [160.0, 120.0], 96.0)
            .unwrap()
            .render();
        let found = detector().detect_gray(&img);
        assert_eq!(found.len(), 1);
        let m = &found[0];
        assert_eq!(m.id, 7);
        assert_eq!(m.hamming, 0);
        let c = m.center();
        assert!((c[0] - 160.0).abs() < 1.5 && (c[1] - 120.0).abs() < 1.5);
        // top-left corner first
        assert!(m.corners[0][0] < c[0] && m.corners[0][1] < c[1]);
    }

    #[test]
    fn test_rotated_marker_keeps_marker_top_left_first() {
        let d = dict();
        // the marker's own top-left is drawn at the image bottom-right
        let corners = [
            [220.0, 190.0],
            [110.0, 200.0],
            [100.0, 90.0],
            [210.0, 80.0],
        ];
        let img = Scene::new(320, 280)
            .with_marker(&d, 3, corners)
            .unwrap()
            .render();
        let found = detector().detect_gray(&img);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 3);
        let got = found[0].corners[0];
        assert!(dist(got, corners[0]) < 3.0, "corner 0 was {got:?}");
    }

    #[test]
    fn test_detects_several_markers() {
        let d = dict();
        let img = Scene::new(480, 240)
            .with_square_marker(&d, 1, [90.0, 120.0], 80.0)
            .unwrap()
            .with_square_marker(&d, 42, [240.0, 120.0], 60.0)
            .unwrap()
            .with_square_marker(&d, 7, [390.0, 110.0], 100.0)
            .unwrap()
            .render();
        let ids: Vec<u32> = detector().detect_gray(&img).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 7, 42]);
    }

    #[test]
    fn test_marker_cut_by_frame_edge_is_ignored() {
        let img = Scene::new(200, 200)
            .with_square_marker(&dict(), 5, [10.0, 100.0], 80.0)
            .unwrap()
            .render();
        assert!(detector().detect_gray(&img).is_empty());
    }

    #[test]
    fn test_plain_black_square_is_not_a_marker() {
        let img = GrayImage::from_fn(200, 200, |x, y| {
            let inside = (50..150).contains(&x) && (50..150).contains(&y);
            Luma([if inside { 0 } else { 255 }])
        });
        assert!(detector().detect_gray(&img).is_empty());
    }

    #[test]
    fn test_inconsistent_buffer_is_frame_error() {
        let frame = Frame::gray(10, 10, vec![0; 5]);
        assert!(matches!(
            detector().detect(&frame),
            Err(Error::FrameRead(_))
        ));
    }

    #[test]
    fn test_sampler_rejects_huge_coordinates() {
        let img = GrayImage::from_fn(4, 4, |x, _| Luma([(x * 10) as u8]));
        for (x, y) in [
            (f64::INFINITY, 1.0),
            (1.0, f64::INFINITY),
            (1e300, 1e300),
            (-1e300, 0.0),
            (f64::NAN, 0.0),
            (3.5, 0.0),
        ] {
            assert_eq!(sample_bilinear(&img, x, y), None, "({x}, {y})");
        }
        assert_eq!(sample_bilinear(&img, 3.0, 3.0), Some(30.0));
        assert_eq!(sample_bilinear(&img, 1.5, 2.0), Some(15.0));
    }

    #[test]
    fn test_otsu_level_splits_two_levels() {
        let img = GrayImage::from_fn(10, 10, |_, y| Luma([if y == 0 { 20 } else { 200 }]));
        let t = otsu_level(&img);
        assert!((20..200).contains(&t));
        let comps = dark_components(&img, t, 1);
        // the dark row touches the image edge
        assert!(comps.is_empty());
    }
}
