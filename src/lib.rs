#![warn(missing_docs)]

//! This package provides functions to estimate the pose of a rigid object
//! relative to a camera, given a set of 2D image points and a set of 3D model points
//! whose correspondences are **unknown**.
//!
//! Classical "Perspective-n-Point" (PnP) solvers need to know which image point
//! is the projection of which model point. Here, the correspondences and the pose
//! are estimated jointly, and some image points (clutter) or model points
//! (occlusion) may have no counterpart at all. In this package, we have implemented:
//!
//!  - SoftPOSIT: Simultaneous Pose and Correspondence Determination.
//!    Philip David, Daniel DeMenthon, Ramani Duraiswami, Hanan Samet. IJCV 2004.
//!
//! It combines the iterative POSIT pose algorithm (DeMenthon and Davis, 1995)
//! with a softassign correspondence matrix refined by deterministic annealing.

pub mod softposit;
