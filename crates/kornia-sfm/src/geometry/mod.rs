//! Multi-view geometry kernels used for verification and mapping.

/// Essential matrix estimation, decomposition and relative pose recovery.
pub mod essential;

/// Homography estimation.
pub mod homography;

/// Generic RANSAC over minimal solvers.
pub mod ransac;

/// Linear triangulation and triangulation angles.
pub mod triangulation;

/// Two-view geometric verification with model selection.
pub mod twoview;

pub use ransac::{ransac, Estimator, RansacOptions, RansacReport};
pub use triangulation::{
    has_positive_depth, triangulate_multiview, triangulate_point, triangulation_angle,
};
pub use twoview::{
    estimate_two_view_geometry, TwoViewConfiguration, TwoViewError, TwoViewGeometry,
    TwoViewGeometryOptions,
};
