#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Bundle adjustment with Levenberg-Marquardt and a Schur complement solver.
pub mod bundle_adjustment;

/// Camera models and intrinsics.
pub mod camera;

/// Pipeline configuration.
pub mod config;

/// Crate level error type and failure taxonomy.
pub mod error;

/// Feature extraction and matching.
pub mod features;

/// Outlier filtering of 3D points.
pub mod filter;

/// Two-view geometry, RANSAC and triangulation.
pub mod geometry;

/// Reading and writing reconstructions.
pub mod io;

/// Incremental mapping.
pub mod mapper;

/// End-to-end reconstruction of an image directory.
pub mod pipeline;

/// Absolute pose estimation.
pub mod pnp;

/// Rigid transformations.
pub mod pose;

/// Reconstruction state: cameras, images and 3D points.
pub mod reconstruction;

/// Persistence of intermediate results.
pub mod storage;

/// Multi-view correspondence tracks.
pub mod tracks;

/// Identifiers and small shared types.
pub mod types;

/// Verified image pairs.
pub mod view_graph;

mod linalg;

pub use camera::{Camera, CameraModelId, CameraSpec};
pub use config::SfmConfig;
pub use error::{ErrorKind, SfmError};
pub use mapper::{IncrementalMapper, MapperOptions, MapperState};
pub use pipeline::{CameraMode, Dataset, Pipeline};
pub use pose::Rigid3;
pub use reconstruction::Reconstruction;
