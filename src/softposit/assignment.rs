// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Soft assignment between image points (rows) and world points (columns).
//!
//! Every assignment matrix carries one extra row and one extra column,
//! the slack row and slack column, which hold the "no match" mass
//! of outlier image points and occluded world points.
//! They are always the last row and the last column of the matrix.

use log::trace;
use nalgebra::{DMatrix, DVector, Vector2, Vector4};

/// Parameters of the slack-aware Sinkhorn normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SinkhornParams {
    /// Maximum number of normalization rounds (one column pass plus one row pass).
    pub max_iterations: usize,
    /// Stop when the summed absolute change of a round falls below this value.
    pub tolerance: f64,
    /// Re-pin the slack entries of dominant cells after each pass.
    /// Without it the slack entries are simply left out of their own normalization.
    pub pin_slack: bool,
}

impl Default for SinkhornParams {
    fn default() -> Self {
        Self {
            max_iterations: 60,
            tolerance: 1e-3,
            pin_slack: true,
        }
    }
}

/// Outcome of a [`sinkhorn_slack`] normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkhornReport {
    /// Number of rounds performed.
    pub iterations: usize,
    /// Summed absolute change of the last round,
    /// infinite if no round was performed.
    pub change: f64,
}

/// A non-slack cell that is the maximum of its column and
/// strictly the maximum of its row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DominantPair {
    /// Image point index.
    pub row: usize,
    /// World point index.
    pub col: usize,
    /// Ratio of the slack column entry of `row` to the cell.
    pub row_slack_ratio: f64,
    /// Ratio of the slack row entry of `col` to the cell.
    pub col_slack_ratio: f64,
}

/// Find the cells that are maximal in both their column and their row,
/// together with their ratios to the slack entries of that row and column.
///
/// Columns whose maximum lies in the slack row have no candidate.
/// The row test is strict and includes the slack column,
/// so ties never produce a pair. Pairs are ordered by column.
pub fn max_pos_ratio(assignment: &DMatrix<f64>) -> Vec<DominantPair> {
    let (nrows, ncols) = assignment.shape();
    if nrows == 0 || ncols == 0 {
        return Vec::new();
    }
    let (slack_row, slack_col) = (nrows - 1, ncols - 1);
    (0..slack_col)
        .filter_map(|col| {
            let row = mutual_max(assignment, col)?;
            let value = assignment[(row, col)];
            Some(DominantPair {
                row,
                col,
                row_slack_ratio: assignment[(row, slack_col)] / value,
                col_slack_ratio: assignment[(slack_row, col)] / value,
            })
        })
        .collect()
}

/// Number of confident one-to-one matches in an assignment matrix,
/// i.e. non-slack columns whose maximum is also the strict maximum of its row.
///
/// Each counted cell owns its row and its column, so the result never
/// exceeds the number of image points nor the number of world points.
pub fn num_matches(assignment: &DMatrix<f64>) -> usize {
    if assignment.ncols() == 0 {
        return 0;
    }
    (0..assignment.ncols() - 1)
        .filter(|&col| mutual_max(assignment, col).is_some())
        .count()
}

/// Row of the maximum of column `col` if it is not the slack row
/// and is strictly greater than every other entry of its row.
fn mutual_max(assignment: &DMatrix<f64>, col: usize) -> Option<usize> {
    let slack_row = assignment.nrows().checked_sub(1)?;
    // First index wins on ties.
    let (row, vmax) = assignment.column(col).iter().enumerate().fold(
        (0, f64::NEG_INFINITY),
        |(best, vmax), (i, &v)| if v > vmax { (i, v) } else { (best, vmax) },
    );
    if row == slack_row {
        return None;
    }
    let is_row_max = assignment
        .row(row)
        .iter()
        .enumerate()
        .filter(|&(j, _)| j != col)
        .all(|(_, &v)| vmax > v);
    if is_row_max {
        Some(row)
    } else {
        None
    }
}

/// Normalize an assignment matrix in place so that every non-slack row
/// and column sums to (nearly) one.
///
/// Slack entries are not normalized against each other.
/// When [`SinkhornParams::pin_slack`] is set, the dominant cells of the *input*
/// matrix are found once with [`max_pos_ratio`], and after each column pass
/// (resp. row pass) the slack column (resp. slack row) entry of every dominant
/// cell is reset to its original ratio to that cell.
/// This keeps slack mass from competing symmetrically with real candidates.
pub fn sinkhorn_slack(assignment: &mut DMatrix<f64>, params: &SinkhornParams) -> SinkhornReport {
    let pinned = if params.pin_slack {
        max_pos_ratio(assignment)
    } else {
        Vec::new()
    };
    let mut report = SinkhornReport {
        iterations: 0,
        change: f64::INFINITY,
    };
    while report.change > params.tolerance && report.iterations < params.max_iterations {
        report.change = normalize_round(assignment, &pinned);
        report.iterations += 1;
    }
    trace!(
        "sinkhorn: {} rounds, {} pinned cells, last change {:.3e}",
        report.iterations,
        pinned.len(),
        report.change
    );
    report
}

/// One column pass and one row pass. Returns the summed absolute change.
fn normalize_round(assignment: &mut DMatrix<f64>, pinned: &[DominantPair]) -> f64 {
    let (nrows, ncols) = assignment.shape();
    if nrows == 0 || ncols == 0 {
        return 0.0;
    }
    let (slack_row, slack_col) = (nrows - 1, ncols - 1);
    let previous = assignment.clone();

    for (j, mut column) in assignment.column_iter_mut().enumerate() {
        let sum = column.sum();
        if j != slack_col && sum > 0.0 {
            column /= sum;
        }
    }
    for pair in pinned {
        assignment[(pair.row, slack_col)] = pair.row_slack_ratio * assignment[(pair.row, pair.col)];
    }

    for (i, mut row) in assignment.row_iter_mut().enumerate() {
        let sum = row.sum();
        if i != slack_row && sum > 0.0 {
            row /= sum;
        }
    }
    for pair in pinned {
        assignment[(slack_row, pair.col)] = pair.col_slack_ratio * assignment[(pair.row, pair.col)];
    }

    assignment
        .iter()
        .zip(previous.iter())
        .map(|(a, b)| (a - b).abs())
        .sum()
}

/// Squared image distances, in pixels², between every image point `j` and
/// the scaled orthographic projection of every world point `k`:
///
/// $$
/// d_{jk} = f^2 \left( (\bm{S_k} \cdot \bm{r_1^T} - w_k x_j)^2 + (\bm{S_k} \cdot \bm{r_2^T} - w_k y_j)^2 \right)
/// $$
pub(crate) fn distance_matrix(
    image: &[Vector2<f64>],
    world: &[Vector4<f64>],
    r1t: &Vector4<f64>,
    r2t: &Vector4<f64>,
    wk: &DVector<f64>,
    focal_length: f64,
) -> DMatrix<f64> {
    let f2 = focal_length * focal_length;
    let projected: Vec<(f64, f64)> = world.iter().map(|s| (s.dot(r1t), s.dot(r2t))).collect();
    DMatrix::from_fn(image.len(), world.len(), |j, k| {
        let (u, v) = projected[k];
        let du = u - wk[k] * image[j].x;
        let dv = v - wk[k] * image[j].y;
        f2 * (du * du + dv * dv)
    })
}

/// Assignment matrix with an extra slack row and column for the given distances.
/// Cells at distance `alpha` get exactly the slack value `scale`.
pub(crate) fn build_assignment(
    distances: &DMatrix<f64>,
    beta: f64,
    alpha: f64,
    scale: f64,
) -> DMatrix<f64> {
    let (n_image, n_world) = distances.shape();
    DMatrix::from_fn(n_image + 1, n_world + 1, |j, k| {
        if j < n_image && k < n_world {
            scale * (-beta * (distances[(j, k)] - alpha)).exp()
        } else {
            scale
        }
    })
}

// Tests #######################################################################
