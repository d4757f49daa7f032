//! Marker pose estimation.
//!
//! Without a calibration the pose is a screen-space approximation: the
//! marker centroid in pixels and a pseudo-depth equal to minus its apparent
//! size. With a calibration each marker gets a rigid camera-frame pose from
//! a planar square solve.
//!
//! Rotations use fixed-axis X, Y, Z order: `R = Rz(yaw) * Ry(pitch) * Rx(roll)`.

use nalgebra::{Matrix3, Matrix6, Rotation3, SMatrix, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::calib::Calibration;
use crate::camera::CameraModel;
use crate::detect::DetectedMarker;
use crate::homography::estimate_homography;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pose {
    /// Centroid `(x, y)` in pixels, `z = -apparent size`.
    Screen { position: [f64; 3] },
    /// Marker frame to camera frame, translation in marker-size units.
    Rigid {
        rotation: [[f64; 3]; 3],
        translation: [f64; 3],
    },
}

impl Pose {
    pub fn position(&self) -> [f64; 3] {
        match self {
            Pose::Screen { position } => *position,
            Pose::Rigid { translation, .. } => *translation,
        }
    }

    pub fn rotation(&self) -> Option<[[f64; 3]; 3]> {
        match self {
            Pose::Screen { .. } => None,
            Pose::Rigid { rotation, .. } => Some(*rotation),
        }
    }

    pub fn distance(&self) -> f64 {
        let [x, y, z] = self.position();
        (x * x + y * y + z * z).sqrt()
    }

    /// `(roll, pitch, yaw)` in radians; `None` for screen-space poses.
    pub fn euler_xyz(&self) -> Option<[f64; 3]> {
        let r = self.rotation()?;
        let (roll, pitch, yaw) = Rotation3::from_matrix_unchecked(to_matrix(&r)).euler_angles();
        Some([roll, pitch, yaw])
    }
}

/// Inverse of [`Pose::euler_xyz`].
pub fn rotation_from_euler_xyz(roll: f64, pitch: f64, yaw: f64) -> [[f64; 3]; 3] {
    from_matrix(Rotation3::from_euler_angles(roll, pitch, yaw).matrix())
}

fn to_matrix(r: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::from_fn(|i, j| r[i][j])
}

fn from_matrix(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    let mut r = [[0.0; 3]; 3];
    for (i, row) in r.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = m[(i, j)];
        }
    }
    r
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseSolver {
    #[default]
    Native,
    /// `solvePnP` with `SOLVEPNP_IPPE_SQUARE`; needs the `opencv` feature.
    Opencv,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseEstimator {
    pub marker_size: f64,
    pub solver: PoseSolver,
}

impl PoseEstimator {
    pub fn new(marker_size: f64) -> Self {
        Self {
            marker_size,
            solver: PoseSolver::Native,
        }
    }

    pub fn with_solver(mut self, solver: PoseSolver) -> Self {
        self.solver = solver;
        self
    }

    /// One pose per marker, in input order. No markers gives an empty list.
    /// Fails if any single marker fails; see [`Self::estimate_each`].
    pub fn estimate(
        &self,
        markers: &[DetectedMarker],
        calibration: Option<&Calibration>,
    ) -> Result<Vec<Pose>> {
        self.estimate_each(markers, calibration)?.into_iter().collect()
    }

    /// Per-marker results. The outer error covers setup problems shared by
    /// every marker (bad marker size, solver not compiled in).
    pub fn estimate_each(
        &self,
        markers: &[DetectedMarker],
        calibration: Option<&Calibration>,
    ) -> Result<Vec<Result<Pose>>> {
        let Some(calib) = calibration else {
            return Ok(markers.iter().map(|m| Ok(screen_pose(&m.corners))).collect());
        };
        if !(self.marker_size.is_finite() && self.marker_size > 0.0) {
            return Err(Error::Config(format!(
                "marker size must be positive, got {}",
                self.marker_size
            )));
        }
        match self.solver {
            PoseSolver::Native => {
                let model = calib.camera_model();
                Ok(markers
                    .iter()
                    .map(|m| solve_square(&m.corners, &model, self.marker_size))
                    .collect())
            }
            #[cfg(feature = "opencv")]
            PoseSolver::Opencv => Ok(markers
                .iter()
                .map(|m| cv::solve_square(&m.corners, calib, self.marker_size))
                .collect()),
            #[cfg(not(feature = "opencv"))]
            PoseSolver::Opencv => Err(Error::Unsupported(
                "OpenCV pose solver requires the `opencv` feature",
            )),
        }
    }
}

/// Shorthand for `PoseEstimator::new(marker_size).estimate(..)`.
pub fn estimate(
    markers: &[DetectedMarker],
    calibration: Option<&Calibration>,
    marker_size: f64,
) -> Result<Vec<Pose>> {
    PoseEstimator::new(marker_size).estimate(markers, calibration)
}

pub fn screen_pose(corners: &[[f64; 2]; 4]) -> Pose {
    let cx = corners.iter().map(|c| c[0]).sum::<f64>() / 4.0;
    let cy = corners.iter().map(|c| c[1]).sum::<f64>() / 4.0;
    let (mut min, mut max) = ([f64::MAX; 2], [f64::MIN; 2]);
    for c in corners {
        for k in 0..2 {
            min[k] = min[k].min(c[k]);
            max[k] = max[k].max(c[k]);
        }
    }
    let size = (max[0] - min[0]).hypot(max[1] - min[1]);
    Pose::Screen {
        position: [cx, cy, -size],
    }
}

/// Marker-plane corners for TL, TR, BR, BL; the marker frame has +y up.
pub fn object_points(marker_size: f64) -> [[f64; 3]; 4] {
    let h = marker_size / 2.0;
    [
        [-h, h, 0.0],
        [h, h, 0.0],
        [h, -h, 0.0],
        [-h, -h, 0.0],
    ]
}

const MAX_ITERS: usize = 50;
const STEP_EPS: f64 = 1e-12;

/// Calibrated square solve: homography init, then damped Gauss-Newton on
/// reprojection error in undistorted normalized coordinates.
pub fn solve_square(
    corners: &[[f64; 2]; 4],
    model: &CameraModel,
    marker_size: f64,
) -> Result<Pose> {
    let obj = object_points(marker_size);
    let img: [[f64; 2]; 4] = corners.map(|c| model.undistort_pixel(c));
    if img.iter().flatten().any(|v| !v.is_finite()) {
        return Err(Error::Pose("corner undistortion diverged".into()));
    }

    let (mut rot, mut t) = initial_pose(&obj, &img)?;
    let mut err = residuals(&rot, &t, &obj, &img);
    let mut cost = err.norm_squared();
    let mut mu = 1e-6;

    for iter in 0..MAX_ITERS {
        let jac = jacobian(&rot, &t, &obj, &img, &err);
        let jtj = jac.transpose() * jac;
        let jte = jac.transpose() * err;
        let damped = jtj + Matrix6::from_diagonal(&(jtj.diagonal() * mu));
        let Some(chol) = damped.cholesky() else {
            break;
        };
        let delta: Vector6<f64> = -chol.solve(&jte);
        let (cand_rot, cand_t) = apply(&rot, &t, &delta);
        let cand_err = residuals(&cand_rot, &cand_t, &obj, &img);
        let cand_cost = cand_err.norm_squared();
        if cand_cost < cost {
            rot = cand_rot;
            t = cand_t;
            err = cand_err;
            cost = cand_cost;
            mu = (mu * 0.1).max(1e-12);
            if delta.norm() < STEP_EPS {
                trace!(iter, cost, "pose refinement converged");
                break;
            }
        } else {
            mu *= 10.0;
            if mu > 1e6 {
                break;
            }
        }
    }

    if t.iter().any(|v| !v.is_finite()) || t.z <= 0.0 {
        return Err(Error::Pose("marker solved behind the camera".into()));
    }
    Ok(Pose::Rigid {
        rotation: from_matrix(rot.matrix()),
        translation: [t.x, t.y, t.z],
    })
}

fn initial_pose(
    obj: &[[f64; 3]; 4],
    img: &[[f64; 2]; 4],
) -> Result<(Rotation3<f64>, Vector3<f64>)> {
    let plane: Vec<[f64; 2]> = obj.iter().map(|p| [p[0], p[1]]).collect();
    let h = estimate_homography(&plane, img)?;
    let h1: Vector3<f64> = h.column(0).into_owned();
    let h2: Vector3<f64> = h.column(1).into_owned();
    let h3: Vector3<f64> = h.column(2).into_owned();
    let (n1, n2, n3) = (h1.norm(), h2.norm(), h3.norm());
    if !(n1 > 1e-12 && n2 > 1e-12 && n3 > 1e-12) {
        return Err(Error::Pose("degenerate marker homography".into()));
    }
    // collinear corners give a rank-deficient homography
    if (h.determinant() / (n1 * n2 * n3)).abs() < 1e-6 {
        return Err(Error::Pose("marker corners are collinear".into()));
    }

    let mut lambda = 2.0 / (n1 + n2);
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let t = h3 * lambda;
    let m = Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]);

    let svd = m.svd(true, true);
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(Error::Pose("rotation orthonormalization failed".into()));
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut last = u.column_mut(2);
        last.neg_mut();
        r = u * v_t;
    }
    Ok((Rotation3::from_matrix_unchecked(r), t))
}

fn residuals(
    rot: &Rotation3<f64>,
    t: &Vector3<f64>,
    obj: &[[f64; 3]; 4],
    img: &[[f64; 2]; 4],
) -> SMatrix<f64, 8, 1> {
    let mut e = SMatrix::<f64, 8, 1>::zeros();
    for (i, (p, q)) in obj.iter().zip(img).enumerate() {
        let c = rot * Vector3::new(p[0], p[1], p[2]) + t;
        let z = if c.z.abs() < 1e-12 { 1e-12 } else { c.z };
        e[2 * i] = c.x / z - q[0];
        e[2 * i + 1] = c.y / z - q[1];
    }
    e
}

fn apply(
    rot: &Rotation3<f64>,
    t: &Vector3<f64>,
    delta: &Vector6<f64>,
) -> (Rotation3<f64>, Vector3<f64>) {
    let dw = Vector3::new(delta[0], delta[1], delta[2]);
    let dt = Vector3::new(delta[3], delta[4], delta[5]);
    (Rotation3::new(dw) * rot, t + dt)
}

fn jacobian(
    rot: &Rotation3<f64>,
    t: &Vector3<f64>,
    obj: &[[f64; 3]; 4],
    img: &[[f64; 2]; 4],
    base: &SMatrix<f64, 8, 1>,
) -> SMatrix<f64, 8, 6> {
    let mut jac = SMatrix::<f64, 8, 6>::zeros();
    let t_scale = t.norm().max(1.0);
    for j in 0..6 {
        let h = if j < 3 { 1e-7 } else { 1e-7 * t_scale };
        let mut delta = Vector6::zeros();
        delta[j] = h;
        let (r2, t2) = apply(rot, t, &delta);
        let col = (residuals(&r2, &t2, obj, img) - base) / h;
        jac.set_column(j, &col);
    }
    jac
}

#[cfg(feature = "opencv")]
mod cv {
    use opencv::{calib3d, core, prelude::*};

    use super::{object_points, Pose};
    use crate::calib::Calibration;
    use crate::Result;

    pub fn solve_square(
        corners: &[[f64; 2]; 4],
        calib: &Calibration,
        marker_size: f64,
    ) -> Result<Pose> {
        let obj = object_points(marker_size);
        let mut obj_pts = core::Mat::zeros(4, 1, core::CV_64FC3)?.to_mat()?;
        for (i, p) in obj.iter().enumerate() {
            let px = obj_pts.at_mut::<core::Vec3d>(i as i32)?;
            *px = core::Vec3d::from(*p);
        }
        let mut img_pts = core::Mat::zeros(4, 1, core::CV_64FC2)?.to_mat()?;
        for (i, c) in corners.iter().enumerate() {
            let px = img_pts.at_mut::<core::Vec2d>(i as i32)?;
            *px = core::Vec2d::from(*c);
        }
        let mut k = core::Mat::zeros(3, 3, core::CV_64F)?.to_mat()?;
        for (r, row) in calib.projection_matrix.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                *k.at_2d_mut::<f64>(r as i32, c as i32)? = *v;
            }
        }
        let mut dist = core::Mat::zeros(5, 1, core::CV_64F)?.to_mat()?;
        for (i, v) in calib.distortion.iter().enumerate() {
            *dist.at_mut::<f64>(i as i32)? = *v;
        }

        let mut rvec = core::Mat::default();
        let mut tvec = core::Mat::default();
        calib3d::solve_pnp(
            &obj_pts,
            &img_pts,
            &k,
            &dist,
            &mut rvec,
            &mut tvec,
            false,
            calib3d::SOLVEPNP_IPPE_SQUARE,
        )?;
        let mut rmat = core::Mat::default();
        calib3d::rodrigues(&rvec, &mut rmat, &mut core::no_array())?;

        let mut rotation = [[0.0f64; 3]; 3];
        for (i, row) in rotation.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = *rmat.at_2d::<f64>(i as i32, j as i32)?;
            }
        }
        let translation = [
            *tvec.at::<f64>(0)?,
            *tvec.at::<f64>(1)?,
            *tvec.at::<f64>(2)?,
        ];
        Ok(Pose::Rigid {
            rotation,
            translation,
        })
    }
}
