//! Perspective-n-Point (PnP) solvers and robust pose estimation.

/// EPnP solver implementation.
pub mod epnp;

/// RANSAC for robust PnP pose estimation.
pub mod ransac;

/// LM-based pose refinement.
pub mod refine;

pub use epnp::solve_epnp;
pub use ransac::{estimate_absolute_pose, AbsolutePoseOptions, AbsolutePoseReport};
pub use refine::{refine_pose, PoseRefineOptions, PoseRefineSummary};

use thiserror::Error;

/// Error types for PnP solvers.
#[derive(Debug, Error)]
pub enum PnPError {
    /// Invalid input data - insufficient correspondences for the specific solver.
    #[error("PnP solver requires at least {required} 2D-3D correspondences, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences required by the solver.
        required: usize,
        /// Actual number of correspondences provided.
        actual: usize,
    },

    /// Invalid input data - mismatched array lengths with descriptive labels.
    #[error("Mismatched array lengths: {left_name} ({left_len}) != {right_name} ({right_len})")]
    MismatchedArrayLengths {
        /// Label for the left-hand slice.
        left_name: &'static str,
        /// Length of the left-hand slice.
        left_len: usize,
        /// Label for the right-hand slice.
        right_name: &'static str,
        /// Length of the right-hand slice.
        right_len: usize,
    },

    /// The correspondences do not determine a pose.
    #[error("Degenerate point configuration")]
    Degenerate,

    /// The robust estimate is supported by too few inliers.
    #[error("Pose supported by {actual} inliers, need {required}")]
    InsufficientInliers {
        /// Minimum number of inliers.
        required: usize,
        /// Number of inliers found.
        actual: usize,
    },
}

pub(crate) fn check_lengths(world: usize, image: usize, required: usize) -> Result<(), PnPError> {
    if world != image {
        return Err(PnPError::MismatchedArrayLengths {
            left_name: "world points",
            left_len: world,
            right_name: "image points",
            right_len: image,
        });
    }
    if world < required {
        return Err(PnPError::InsufficientCorrespondences {
            required,
            actual: world,
        });
    }
    Ok(())
}
