// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Implementation based on
//! "SoftPOSIT: Simultaneous Pose and Correspondence Determination"
//! David, P., DeMenthon, D., Duraiswami, R. and Samet, H. IJCV 2004.
//!
//! Correspondences between image points and world points are not known.
//! A soft assignment matrix between them is estimated together with the pose
//! by deterministic annealing: at each step the assignment is rebuilt from the
//! reprojection distances of the current pose, normalized by a slack-aware
//! Sinkhorn procedure, and used as weights for one POSIT refinement of the pose.
//! The annealing parameter $\beta$ grows geometrically, sharpening the
//! assignment from almost uniform towards a one-to-one matching.

mod assignment;
mod posit;

pub use assignment::{
    max_pos_ratio, num_matches, sinkhorn_slack, DominantPair, SinkhornParams, SinkhornReport,
};

use assignment::{build_assignment, distance_matrix};
use log::{debug, warn};
use nalgebra::{
    DMatrix, Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector2, Vector3,
    Vector4,
};
use posit::{condition_number, normal_matrix, PositState};
use thiserror::Error;

type Iso3 = Isometry3<f64>;
type Mat3 = Matrix3<f64>;
type Vec2 = Vector2<f64>;
type Vec3 = Vector3<f64>;
type Vec4 = Vector4<f64>;

/// Pose of a rigid object relative to the camera.
/// It is the rotation and translation pair satisfying the equation:
/// $$
/// \lambda_i \ \bm{y_i} = \bm{R \ x_i} + \bm{t}
/// $$
///
/// - $\bm{x_i}$ are the 3D point world (object) coordinates.
/// - $\bm{y_i}$ are the normalized image coordinates $\bm{y_i} \ \text{\textasciitilde} \ (u_i, v_i, 1)$.
/// - $\lambda_i$ are the depths of the points in the camera frame.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pose {
    /// Rotation matrix. Its rows are the camera axes expressed in world coordinates.
    pub rotation: Mat3,

    /// Translation.
    pub translation: Vec3,
}

impl Pose {
    /// Create a pose from its rotation matrix and translation.
    pub fn new(rotation: Mat3, translation: Vec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Convert from nalgebra Isometry3 type.
    pub fn from_iso3(iso3: &Iso3) -> Self {
        Self {
            rotation: iso3.rotation.to_rotation_matrix().into_inner(),
            translation: iso3.translation.vector,
        }
    }

    /// Convert to nalgebra Isometry3 type.
    pub fn to_iso3(&self) -> Iso3 {
        let rot = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(
            self.rotation,
        ));
        Iso3::from_parts(Translation3::from(self.translation), rot)
    }

    /// Coordinates of a world point in the camera frame.
    pub fn transform_point(&self, point: &[f64; 3]) -> Vec3 {
        self.rotation * Vec3::from(*point) + self.translation
    }
}

/// Pinhole camera with square pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CameraModel {
    /// Focal length in pixels.
    pub focal_length: f64,
    /// Principal point in pixels.
    pub principal_point: [i32; 2],
}

impl Default for CameraModel {
    fn default() -> Self {
        Self {
            focal_length: 1.0,
            principal_point: [0, 0],
        }
    }
}

impl CameraModel {
    /// Create a camera model.
    pub fn new(focal_length: f64, principal_point: [i32; 2]) -> Self {
        Self {
            focal_length,
            principal_point,
        }
    }

    /// Normalized image coordinates of a pixel.
    pub fn normalize(&self, pixel: &[i32; 2]) -> Vec2 {
        let [cx, cy] = self.principal_point;
        Vec2::new(
            (f64::from(pixel[0]) - f64::from(cx)) / self.focal_length,
            (f64::from(pixel[1]) - f64::from(cy)) / self.focal_length,
        )
    }

    /// Pixel coordinates of a world point seen by a camera at `pose`.
    pub fn project(&self, pose: &Pose, point: &[f64; 3]) -> [f64; 2] {
        let p = pose.transform_point(point);
        [
            self.focal_length * p.x / p.z + f64::from(self.principal_point[0]),
            self.focal_length * p.y / p.z + f64::from(self.principal_point[1]),
        ]
    }
}

/// Parameters of the SoftPOSIT solver.
///
/// Only `beta0` and `noise_std` usually need tuning,
/// the rest are the constants of the annealing schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SoftPositParams {
    /// Initial annealing parameter $\beta_0$.
    /// Distances are in pixels², so it should scale like the inverse squared
    /// reprojection error of the initial pose.
    pub beta0: f64,
    /// Standard deviation of the image noise, in pixels.
    pub noise_std: f64,
    /// Annealing stops once $\beta$ reaches this value.
    pub beta_final: f64,
    /// Geometric growth rate of $\beta$.
    pub beta_update: f64,
    /// Initial bias of the assignment matrix.
    pub epsilon0: f64,
    /// Minimum number of annealing steps before convergence is accepted.
    pub min_beta_count: usize,
    /// Maximum number of POSIT passes per annealing step.
    pub max_count: usize,
    /// Largest acceptable condition number of the weighted normal matrix.
    pub max_condition: f64,
    /// Assignment normalization parameters.
    pub sinkhorn: SinkhornParams,
}

impl Default for SoftPositParams {
    fn default() -> Self {
        Self {
            beta0: 2e-4,
            noise_std: 1.0,
            beta_final: 0.5,
            beta_update: 1.05,
            epsilon0: 0.01,
            min_beta_count: 20,
            max_count: 1,
            max_condition: 1e10,
            sinkhorn: SinkhornParams::default(),
        }
    }
}

impl SoftPositParams {
    /// Default schedule with the given initial annealing parameter and noise level.
    pub fn new(beta0: f64, noise_std: f64) -> Self {
        Self {
            beta0,
            noise_std,
            ..Self::default()
        }
    }

    /// Squared distance (pixels²) below which a match is more likely than an outlier.
    /// 9.21 is the 99% quantile of a chi-square distribution with 2 degrees of freedom.
    pub fn alpha(&self) -> f64 {
        9.21 * self.noise_std * self.noise_std + 1.0
    }

    /// Assignment-weighted RMS error (pixels) under which the pose is considered converged.
    pub fn max_delta(&self) -> f64 {
        self.alpha().sqrt() / 2.0
    }

    /// Upper bound on the number of annealing steps.
    pub fn max_annealing_steps(&self) -> usize {
        if self.beta0 >= self.beta_final {
            return 0;
        }
        ((self.beta_final / self.beta0).ln() / self.beta_update.ln()).ceil() as usize
    }

    fn validate(&self) -> Result<(), SoftPositError> {
        if !(self.beta0 > 0.0 && self.beta0.is_finite()) {
            return Err(invalid("beta0", self.beta0));
        }
        if !(self.beta_update > 1.0 && self.beta_update.is_finite()) {
            return Err(invalid("beta_update", self.beta_update));
        }
        if !self.beta_final.is_finite() {
            return Err(invalid("beta_final", self.beta_final));
        }
        if !self.noise_std.is_finite() {
            return Err(invalid("noise_std", self.noise_std));
        }
        if self.max_count == 0 {
            return Err(invalid("max_count", 0.0));
        }
        Ok(())
    }
}

/// Annealing progress.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnnealingState {
    /// Current annealing parameter.
    pub beta: f64,
    /// Number of annealing steps performed.
    pub beta_count: usize,
    /// Whether the pose converged after at least `min_beta_count` steps.
    pub converged: bool,
}

impl AnnealingState {
    fn new(beta0: f64) -> Self {
        Self {
            beta: beta0,
            beta_count: 0,
            converged: false,
        }
    }

    fn is_running(&self, params: &SoftPositParams) -> bool {
        self.beta < params.beta_final && !self.converged
    }

    fn advance(&mut self, pose_converged: bool, params: &SoftPositParams) {
        self.beta *= params.beta_update;
        self.beta_count += 1;
        self.converged = pose_converged && self.beta_count > params.min_beta_count;
    }
}

/// Diagnostics of one annealing step.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IterationStats {
    /// Annealing parameter used for this step.
    pub beta: f64,
    /// Assignment-weighted RMS reprojection error, in pixels.
    pub delta: f64,
    /// Confident matches per world point.
    pub match_ratio: f64,
    /// Non-slack assignment mass per world point.
    pub non_slack_mass: f64,
    /// Squared change of the projection plane vectors.
    pub pose_shift: f64,
}

/// Result of [`solve`].
#[derive(Debug, Clone)]
pub struct SoftPositEstimate {
    /// Last pose estimate.
    pub pose: Pose,
    /// `(image index, world index)` pairs that dominate their row and column
    /// of the final assignment matrix.
    pub matches: Vec<(usize, usize)>,
    /// `true` when more than `min_beta_count` steps were performed
    /// and the final error is under [`SoftPositParams::max_delta`].
    pub converged: bool,
    /// Final assignment-weighted RMS reprojection error, in pixels.
    pub delta: f64,
    /// Final annealing state.
    pub annealing: AnnealingState,
    /// One record per annealing step, in order.
    pub stats: Vec<IterationStats>,
    /// Final assignment matrix, with slack row and column last.
    pub assignment: DMatrix<f64>,
}

/// Errors of the SoftPOSIT solver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SoftPositError {
    /// The weighted normal matrix is numerically singular, typically because
    /// there are fewer than four world points or they are coplanar.
    #[error("normal matrix is ill-conditioned (condition number {condition:e}) at annealing step {beta_count}")]
    IllConditioned {
        /// Annealing step at which the search stopped.
        beta_count: usize,
        /// Condition number of the normal matrix.
        condition: f64,
    },

    /// All projections collapsed, so no depth can be recovered.
    #[error("scaled orthographic projection collapsed at annealing step {beta_count}")]
    DegenerateProjection {
        /// Annealing step at which the search stopped.
        beta_count: usize,
    },

    /// A parameter, camera or initial pose value makes the search meaningless.
    #[error("invalid value for {name}: {value}")]
    InvalidParameter {
        /// Name of the offending value.
        name: &'static str,
        /// The offending value.
        value: f64,
    },
}

fn invalid(name: &'static str, value: f64) -> SoftPositError {
    SoftPositError::InvalidParameter { name, value }
}

/// Estimate the pose of an object from unmatched image and world points.
///
/// `image_points` are pixel coordinates, `world_points` object coordinates.
/// Any of them may have no counterpart in the other set.
/// Without a `camera`, [`CameraModel::default`] is used.
///
/// The result is `Ok` even if the annealing schedule ends before convergence,
/// check [`SoftPositEstimate::converged`].
/// The search fails with [`SoftPositError::IllConditioned`] as soon as the
/// assignment-weighted geometry cannot determine a pose, and with
/// [`SoftPositError::DegenerateProjection`] when a POSIT pass finds no usable
/// scale, e.g. when every image point falls on the same pixel under a
/// unit focal length.
pub fn solve(
    image_points: &[[i32; 2]],
    world_points: &[[f64; 3]],
    params: &SoftPositParams,
    initial_pose: &Pose,
    camera: Option<&CameraModel>,
) -> Result<SoftPositEstimate, SoftPositError> {
    let camera = camera.copied().unwrap_or_default();
    params.validate()?;
    if !(camera.focal_length > 0.0 && camera.focal_length.is_finite()) {
        return Err(invalid("focal_length", camera.focal_length));
    }
    let tz = initial_pose.translation.z;
    if tz == 0.0 || !tz.is_finite() {
        return Err(invalid("initial translation z", tz));
    }

    let alpha = params.alpha();
    let max_delta = params.max_delta();
    let n_image = image_points.len();
    let n_world = world_points.len();
    // Makes real and slack mass comparable.
    let scale = 1.0 / (n_image.max(n_world) + 1) as f64;

    let image: Vec<Vec2> = image_points.iter().map(|p| camera.normalize(p)).collect();
    let world: Vec<Vec4> = world_points
        .iter()
        .map(|p| Vec4::new(p[0], p[1], p[2], 1.0))
        .collect();

    let mut pose = *initial_pose;
    let mut state = PositState::from_pose(&pose, &world);
    let mut annealing = AnnealingState::new(params.beta0);
    let mut assignment = DMatrix::from_element(n_image + 1, n_world + 1, 1.0 + params.epsilon0);
    let mut delta = f64::INFINITY;
    let mut stats = Vec::new();

    while annealing.is_running(params) {
        let distances = distance_matrix(
            &image,
            &world,
            &state.r1t,
            &state.r2t,
            &state.wk,
            camera.focal_length,
        );
        assignment = build_assignment(&distances, annealing.beta, alpha, scale);
        sinkhorn_slack(&mut assignment, &params.sinkhorn);

        let match_count = num_matches(&assignment);
        let non_slack = assignment.view((0, 0), (n_image, n_world));
        let non_slack_mass = non_slack.sum();

        let normal = normal_matrix(&assignment, &world);
        let condition = condition_number(normal);
        let object_mat = match normal.try_inverse() {
            Some(inverse) if condition <= params.max_condition => inverse,
            _ => {
                warn!(
                    "normal matrix is ill-conditioned ({:e}) at step {}, terminating search",
                    condition, annealing.beta_count
                );
                return Err(SoftPositError::IllConditioned {
                    beta_count: annealing.beta_count,
                    condition,
                });
            }
        };

        // The assignment and distances stay fixed during the POSIT passes.
        delta = (non_slack.component_mul(&distances).sum() / n_world as f64).sqrt();
        let (r1t_prev, r2t_prev) = (state.r1t, state.r2t);
        let mut pose_converged = false;
        let mut passes = 0;
        while !pose_converged && passes < params.max_count {
            let step = match posit::refine(&assignment, &image, &world, &state.wk, &object_mat) {
                Some(step) => step,
                None => {
                    warn!(
                        "projection collapsed at step {}, terminating search",
                        annealing.beta_count
                    );
                    return Err(SoftPositError::DegenerateProjection {
                        beta_count: annealing.beta_count,
                    });
                }
            };
            state = step.state;
            pose = step.pose;
            pose_converged = delta < max_delta;
            passes += 1;
        }

        let pose_shift =
            (state.r1t - r1t_prev).norm_squared() + (state.r2t - r2t_prev).norm_squared();
        stats.push(IterationStats {
            beta: annealing.beta,
            delta,
            match_ratio: match_count as f64 / n_world as f64,
            non_slack_mass: non_slack_mass / n_world as f64,
            pose_shift,
        });
        debug!(
            "step {} (beta {:.3e}): delta {:.4}, {}/{} matches, pose shift {:.3e}",
            annealing.beta_count, annealing.beta, delta, match_count, n_world, pose_shift
        );
        annealing.advance(pose_converged, params);
    }

    let converged = annealing.beta_count > params.min_beta_count && delta < max_delta;
    let matches: Vec<(usize, usize)> = max_pos_ratio(&assignment)
        .into_iter()
        .map(|pair| (pair.row, pair.col))
        .collect();
    debug!(
        "softposit stopped after {} steps: converged {}, delta {:.4}, {} matches",
        annealing.beta_count,
        converged,
        delta,
        matches.len()
    );

    Ok(SoftPositEstimate {
        pose,
        matches,
        converged,
        delta,
        annealing,
        stats,
        assignment,
    })
}

// Tests #######################################################################

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pose_at_depth(z: f64) -> Pose {
        Pose::new(Mat3::identity(), Vec3::new(0.0, 0.0, z))
    }

    #[test]
    fn default_schedule() {
        let params = SoftPositParams::new(1e-4, 1.0);
        assert_relative_eq!(params.alpha(), 10.21);
        assert_relative_eq!(params.max_delta(), 10.21_f64.sqrt() / 2.0);
        assert_eq!(params.beta_final, 0.5);
        assert_eq!(params.min_beta_count, 20);
        // ln(5000) / ln(1.05) = 174.57
        assert_eq!(params.max_annealing_steps(), 175);
        assert_eq!(SoftPositParams::new(0.5, 1.0).max_annealing_steps(), 0);
    }

    #[test]
    fn annealing_needs_min_beta_count() {
        let params = SoftPositParams::default();
        let mut state = AnnealingState::new(params.beta0);
        for _ in 0..params.min_beta_count {
            state.advance(true, &params);
            assert!(!state.converged);
        }
        state.advance(true, &params);
        assert!(state.converged);
        assert!(!state.is_running(&params));
        assert_relative_eq!(
            state.beta,
            params.beta0 * params.beta_update.powi(params.min_beta_count as i32 + 1),
            epsilon = 1e-15
        );
    }

    #[test]
    fn camera_normalize_and_project() {
        let camera = CameraModel::new(800.0, [320, 240]);
        assert_relative_eq!(camera.normalize(&[720, 40]), Vec2::new(0.5, -0.25));
        let [u, v] = camera.project(&pose_at_depth(4.0), &[1.0, -0.5, 0.0]);
        assert_relative_eq!(u, 520.0);
        assert_relative_eq!(v, 140.0);
        assert_eq!(CameraModel::default(), CameraModel::new(1.0, [0, 0]));
    }

    #[test]
    fn pose_iso3_conversion() {
        let iso = Iso3::new(Vec3::new(0.1, 0.2, 3.0), Vec3::new(0.3, -0.2, 0.1));
        let pose = Pose::from_iso3(&iso);
        assert_relative_eq!(pose.to_iso3(), iso, epsilon = 1e-12);
        let p = [0.5, -1.0, 2.0];
        assert_relative_eq!(
            pose.transform_point(&p),
            (iso * nalgebra::Point3::from(p)).coords,
            epsilon = 1e-12
        );
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let pose = pose_at_depth(5.0);
        let image = [[0, 0]];
        let world = [[0.0, 0.0, 0.0]];
        let check = |params: SoftPositParams, camera: CameraModel, pose: Pose, name: &str| {
            match solve(&image, &world, &params, &pose, Some(&camera)) {
                Err(SoftPositError::InvalidParameter { name: n, .. }) => assert_eq!(n, name),
                other => panic!("expected invalid {}, got {:?}", name, other),
            }
        };
        let camera = CameraModel::default();
        check(SoftPositParams::new(0.0, 1.0), camera, pose, "beta0");
        check(SoftPositParams::new(-1e-4, 1.0), camera, pose, "beta0");
        check(
            SoftPositParams {
                beta_update: 1.0,
                ..SoftPositParams::default()
            },
            camera,
            pose,
            "beta_update",
        );
        check(
            SoftPositParams {
                max_count: 0,
                ..SoftPositParams::default()
            },
            camera,
            pose,
            "max_count",
        );
        check(
            SoftPositParams::new(1e-4, f64::NAN),
            camera,
            pose,
            "noise_std",
        );
        check(
            SoftPositParams::default(),
            CameraModel::new(0.0, [0, 0]),
            pose,
            "focal_length",
        );
        check(
            SoftPositParams::default(),
            camera,
            pose_at_depth(0.0),
            "initial translation z",
        );
    }

    #[test]
    fn empty_world_is_ill_conditioned() {
        let result = solve(
            &[[10, 20], [30, 40]],
            &[],
            &SoftPositParams::default(),
            &pose_at_depth(5.0),
            None,
        );
        match result {
            Err(SoftPositError::IllConditioned { beta_count, .. }) => assert_eq!(beta_count, 0),
            other => panic!("expected ill-conditioned, got {:?}", other),
        }
    }

    #[test]
    fn empty_image_is_ill_conditioned() {
        let world = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ];
        let result = solve(
            &[],
            &world,
            &SoftPositParams::default(),
            &pose_at_depth(5.0),
            None,
        );
        assert!(matches!(
            result,
            Err(SoftPositError::IllConditioned { .. })
        ));
    }

    #[test]
    fn slow_schedule_fails_without_preallocating() {
        let params = SoftPositParams {
            beta_update: 1.0 + 1e-12,
            ..SoftPositParams::default()
        };
        assert!(params.max_annealing_steps() > 1_000_000_000_000);
        let result = solve(
            &[[10, 20], [30, 40]],
            &[],
            &params,
            &pose_at_depth(5.0),
            None,
        );
        assert!(matches!(
            result,
            Err(SoftPositError::IllConditioned { beta_count: 0, .. })
        ));
    }

    #[test]
    fn no_annealing_step_returns_initial_pose() {
        let world = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ];
        let params = SoftPositParams::new(0.6, 1.0);
        let pose = pose_at_depth(5.0);
        let estimate = solve(&[[1, 2], [3, 4]], &world, &params, &pose, None).unwrap();
        assert_eq!(estimate.pose, pose);
        assert!(!estimate.converged);
        assert!(estimate.stats.is_empty());
        assert!(estimate.matches.is_empty());
        assert_eq!(estimate.assignment.shape(), (3, 5));
        assert_relative_eq!(estimate.assignment[(0, 0)], 1.0 + params.epsilon0);
    }

    #[test]
    fn error_messages() {
        let err = SoftPositError::IllConditioned {
            beta_count: 3,
            condition: 2e12,
        };
        assert_eq!(
            err.to_string(),
            "normal matrix is ill-conditioned (condition number 2e12) at annealing step 3"
        );
        assert_eq!(
            invalid("beta0", 0.0).to_string(),
            "invalid value for beta0: 0"
        );
    }
}
