//! Pinhole intrinsics and Brown-Conrady distortion.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn is_valid(self) -> bool {
        self.fx.is_finite()
            && self.fy.is_finite()
            && self.cx.is_finite()
            && self.cy.is_finite()
            && self.fx.abs() > 1e-12
            && self.fy.abs() > 1e-12
    }

    pub fn pixel_to_normalized(self, pixel_xy: [f64; 2]) -> [f64; 2] {
        [
            (pixel_xy[0] - self.cx) / self.fx,
            (pixel_xy[1] - self.cy) / self.fy,
        ]
    }

    pub fn normalized_to_pixel(self, normalized_xy: [f64; 2]) -> [f64; 2] {
        [
            self.fx * normalized_xy[0] + self.cx,
            self.fy * normalized_xy[1] + self.cy,
        ]
    }
}

/// OpenCV coefficient order: k1, k2, p1, p2, k3.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn from_coeffs(d: [f64; 5]) -> Self {
        Self {
            k1: d[0],
            k2: d[1],
            p1: d[2],
            p2: d[3],
            k3: d[4],
        }
    }

    pub fn is_zero(self) -> bool {
        self == Self::default()
    }

    pub fn distort_normalized(self, xy: [f64; 2]) -> [f64; 2] {
        let (x, y) = (xy[0], xy[1]);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        let x_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        [x * radial + x_tan, y * radial + y_tan]
    }

    /// Fixed-point inversion of [`Distortion::distort_normalized`].
    pub fn undistort_normalized(self, distorted: [f64; 2]) -> [f64; 2] {
        if self.is_zero() {
            return distorted;
        }
        let mut x = distorted;
        for _ in 0..UNDISTORT_MAX_ITERS {
            let (xu, yu) = (x[0], x[1]);
            let r2 = xu * xu + yu * yu;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
            if radial.abs() < 1e-12 {
                break;
            }
            let dx = 2.0 * self.p1 * xu * yu + self.p2 * (r2 + 2.0 * xu * xu);
            let dy = self.p1 * (r2 + 2.0 * yu * yu) + 2.0 * self.p2 * xu * yu;
            let next = [(distorted[0] - dx) / radial, (distorted[1] - dy) / radial];
            let step = (next[0] - x[0]).hypot(next[1] - x[1]);
            x = next;
            if step < UNDISTORT_EPS {
                break;
            }
        }
        x
    }
}

const UNDISTORT_MAX_ITERS: usize = 20;
const UNDISTORT_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub intrinsics: CameraIntrinsics,
    pub distortion: Distortion,
}

impl CameraModel {
    /// Image pixel to undistorted normalized coordinates.
    pub fn undistort_pixel(&self, pixel_xy: [f64; 2]) -> [f64; 2] {
        let xd = self.intrinsics.pixel_to_normalized(pixel_xy);
        self.distortion.undistort_normalized(xd)
    }

    /// Camera-frame 3D point to image pixel; `None` behind the camera.
    pub fn project(&self, p: [f64; 3]) -> Option<[f64; 2]> {
        if p[2] <= 1e-12 {
            return None;
        }
        let xn = [p[0] / p[2], p[1] / p[2]];
        let xd = self.distortion.distort_normalized(xn);
        Some(self.intrinsics.normalized_to_pixel(xd))
    }
}
