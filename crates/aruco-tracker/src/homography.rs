//! Plane-to-image homography via DLT with Hartley normalization.

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};

use crate::{Error, Result};

/// Project a 2D point through H: H * [x, y, 1]^T → [u, v].
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> Option<[f64; 2]> {
    let p = h * Vector3::new(x, y, 1.0);
    if p[2].abs() < 1e-15 {
        return None;
    }
    Some([p[0] / p[2], p[1] / p[2]])
}

fn normalize_points(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| (p[0] - cx).hypot(p[1] - cy))
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();
    (t, normalized)
}

/// Homography H with `dst ≈ project(H, src)` from ≥4 correspondences.
pub fn estimate_homography(src: &[[f64; 2]], dst: &[[f64; 2]]) -> Result<Matrix3<f64>> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return Err(Error::Pose(format!(
            "homography needs >=4 matched points, got {} and {}",
            n,
            dst.len()
        )));
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = (src_n[i][0], src_n[i][1]);
        let (dx, dy) = (dst_n[i][0], dst_n[i][1]);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // Null vector of A = eigenvector of A^T A with the smallest eigenvalue.
    let eig = SymmetricEigen::new(a.transpose() * &a);
    let min_idx = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|x, y| x.1.abs().total_cmp(&y.1.abs()))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let v = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| Error::Pose("degenerate point set".into()))?;
    let h = t_dst_inv * h_norm * t_src;
    if h.iter().any(|x| !x.is_finite()) {
        return Err(Error::Pose("non-finite homography".into()));
    }
    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 {
        Ok(h)
    } else {
        Ok(h / scale)
    }
}
