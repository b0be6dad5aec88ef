// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pose from Orthography and Scaling with ITerations (POSIT),
//! weighted by a soft assignment matrix.
//!
//! The camera is approximated by a scaled orthographic projection
//! with two projection plane vectors
//! $\bm{r_1^T} = [\bm{R_1}, T_x] / T_z$ and $\bm{r_2^T} = [\bm{R_2}, T_y] / T_z$.
//! Each pass fits them by weighted least squares, snaps the rotation rows
//! to the nearest orthonormal pair, and updates the per-point depth correction
//! $w_k = \bm{S_k} \cdot [\bm{R_3}, T_z] / T_z$ which moves the orthographic
//! fit towards the true perspective pose.

use super::Pose;
use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x2, Matrix4, Vector2, Vector3, Vector4};

type Mat4 = Matrix4<f64>;
type Vec2 = Vector2<f64>;
type Vec3 = Vector3<f64>;
type Vec4 = Vector4<f64>;

/// Cap on implicit-shift sweeps of the small SVDs below.
const MAX_SVD_ITERATIONS: usize = 200;

/// Projection plane vectors and per-point depth correction,
/// carried from one POSIT pass to the next.
#[derive(Debug, Clone)]
pub(crate) struct PositState {
    pub r1t: Vec4,
    pub r2t: Vec4,
    pub wk: DVector<f64>,
}

/// Result of one POSIT pass.
#[derive(Debug, Clone)]
pub(crate) struct PositStep {
    pub state: PositState,
    pub pose: Pose,
}

impl PositState {
    /// State of a camera at `pose` observing the homogeneous `world` points.
    pub(crate) fn from_pose(pose: &Pose, world: &[Vec4]) -> Self {
        let r = &pose.rotation;
        let t = &pose.translation;
        let r1t = Vec4::new(r[(0, 0)], r[(0, 1)], r[(0, 2)], t.x) / t.z;
        let r2t = Vec4::new(r[(1, 0)], r[(1, 1)], r[(1, 2)], t.y) / t.z;
        let r3t = Vec4::new(r[(2, 0)] / t.z, r[(2, 1)] / t.z, r[(2, 2)] / t.z, 1.0);
        Self {
            r1t,
            r2t,
            wk: depth_correction(world, &r3t),
        }
    }
}

/// $w_k = \bm{S_k} \cdot \bm{r_3^T}$ where `r3t` is already divided by $T_z$.
fn depth_correction(world: &[Vec4], r3t: &Vec4) -> DVector<f64> {
    DVector::from_iterator(world.len(), world.iter().map(|s| s.dot(r3t)))
}

/// Weighted normal matrix
/// $\bm{L} = \sum_k \left( \sum_j m_{jk} \right) \bm{S_k} \bm{S_k}^T$
/// over the non-slack block of the assignment matrix.
pub(crate) fn normal_matrix(assignment: &DMatrix<f64>, world: &[Vec4]) -> Mat4 {
    let n_image = assignment.nrows().saturating_sub(1);
    world.iter().enumerate().fold(Mat4::zeros(), |acc, (k, s)| {
        let mass = assignment.view((0, k), (n_image, 1)).sum();
        acc + s * s.transpose() * mass
    })
}

/// Ratio of the largest to the smallest singular value.
/// Infinite for singular or non-finite matrices.
pub(crate) fn condition_number(m: Mat4) -> f64 {
    if !m.iter().all(|v| v.is_finite()) {
        return f64::INFINITY;
    }
    match m.try_svd(false, false, f64::EPSILON, MAX_SVD_ITERATIONS) {
        Some(svd) => {
            let smallest = svd.singular_values.min();
            if smallest > 0.0 {
                svd.singular_values.max() / smallest
            } else {
                f64::INFINITY
            }
        }
        None => f64::INFINITY,
    }
}

/// Closest pair of orthonormal columns to `x` (orthogonal Procrustes),
/// with the singular values of `x`.
///
/// With $\bm{X} = \bm{U S V^T}$ (thin), the nearest pair is $\bm{U V^T}$.
fn nearest_orthonormal_pair(x: Matrix3x2<f64>) -> Option<(Matrix3x2<f64>, Vec2)> {
    if !x.iter().all(|v| v.is_finite()) {
        return None;
    }
    let svd = x.try_svd(true, true, f64::EPSILON, MAX_SVD_ITERATIONS)?;
    let u = svd.u?;
    let v_t = svd.v_t?;
    Some((u * v_t, svd.singular_values))
}

/// Right-handed orthonormal frame and depth recovered from
/// unconstrained projection plane vectors.
#[derive(Debug, Clone, Copy)]
struct Frame {
    r1: Vec3,
    r2: Vec3,
    r3: Vec3,
    tz: f64,
}

fn orthonormal_frame(r1t: &Vec4, r2t: &Vec4) -> Option<Frame> {
    let x = Matrix3x2::from_columns(&[r1t.xyz(), r2t.xyz()]);
    let (a, singular_values) = nearest_orthonormal_pair(x)?;
    let scale_sum = singular_values[0] + singular_values[1];
    if !(scale_sum > 0.0 && scale_sum.is_finite()) {
        return None;
    }
    let r1: Vec3 = a.column(0).into_owned();
    let r2: Vec3 = a.column(1).into_owned();
    Some(Frame {
        r3: r1.cross(&r2),
        r1,
        r2,
        tz: 2.0 / scale_sum,
    })
}

/// One POSIT pass.
///
/// `object_mat` is the inverse of the [`normal_matrix`] of the same assignment,
/// `image` holds focal-length-normalized image points.
/// Returns `None` when the fitted projection collapses and no scale can be recovered.
pub(crate) fn refine(
    assignment: &DMatrix<f64>,
    image: &[Vec2],
    world: &[Vec4],
    wk: &DVector<f64>,
    object_mat: &Mat4,
) -> Option<PositStep> {
    let mut weighted_u = Vec4::zeros();
    let mut weighted_v = Vec4::zeros();
    for (j, x) in image.iter().enumerate() {
        for (k, s) in world.iter().enumerate() {
            let w = assignment[(j, k)] * wk[k];
            weighted_u += s * (w * x.x);
            weighted_v += s * (w * x.y);
        }
    }
    let r1t = object_mat * weighted_u;
    let r2t = object_mat * weighted_v;

    let Frame { r1, r2, r3, tz } = orthonormal_frame(&r1t, &r2t)?;
    let tx = r1t.w * tz;
    let ty = r2t.w * tz;

    let state = PositState {
        r1t: Vec4::new(r1.x, r1.y, r1.z, tx) / tz,
        r2t: Vec4::new(r2.x, r2.y, r2.z, ty) / tz,
        wk: depth_correction(world, &(Vec4::new(r3.x, r3.y, r3.z, tz) / tz)),
    };
    let pose = Pose {
        rotation: Matrix3::from_rows(&[r1.transpose(), r2.transpose(), r3.transpose()]),
        translation: Vec3::new(tx, ty, tz),
    };
    Some(PositStep { state, pose })
}

// Tests #######################################################################
