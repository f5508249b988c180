use crate::bundle_adjustment::BundleAdjustmentError;
use crate::camera::CameraError;
use crate::config::ConfigError;
use crate::features::ExtractionError;
use crate::geometry::TwoViewError;
use crate::io::{BinaryModelError, ColmapError, PlyError};
use crate::mapper::MapperError;
use crate::pnp::PnPError;
use crate::reconstruction::ReconstructionError;
use crate::storage::StorageError;

/// How a failure affects a reconstruction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or unreadable input; fatal for the affected image, not for the run.
    Input,
    /// An expected geometric failure such as a degenerate pair or a failed registration.
    Geometric,
    /// A numeric failure that is recovered by keeping the previous state.
    Numeric,
    /// A budget ran out; the run ends with a partial result.
    ResourceExhaustion,
}

/// Any error produced by this crate.
#[derive(Debug, thiserror::Error)]
pub enum SfmError {
    /// Camera description error.
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Feature extraction error.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// Two-view estimation error.
    #[error(transparent)]
    TwoView(#[from] TwoViewError),

    /// Absolute pose estimation error.
    #[error(transparent)]
    PnP(#[from] PnPError),

    /// Reconstruction state error.
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),

    /// Bundle adjustment error.
    #[error(transparent)]
    BundleAdjustment(#[from] BundleAdjustmentError),

    /// Incremental mapping error.
    #[error(transparent)]
    Mapper(#[from] MapperError),

    /// Feature storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// COLMAP text model error.
    #[error(transparent)]
    Colmap(#[from] ColmapError),

    /// Binary model error.
    #[error(transparent)]
    BinaryModel(#[from] BinaryModelError),

    /// PLY error.
    #[error(transparent)]
    Ply(#[from] PlyError),

    /// The dataset directory has no usable image.
    #[error("no images found in {0}")]
    NoImages(String),

    /// Generic IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SfmError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SfmError::TwoView(TwoViewError::InvalidMatch { .. }) => ErrorKind::Input,
            SfmError::TwoView(_) => ErrorKind::Geometric,
            SfmError::PnP(PnPError::MismatchedArrayLengths { .. }) => ErrorKind::Input,
            SfmError::PnP(_) => ErrorKind::Geometric,
            SfmError::Mapper(MapperError::NoInitialPair) => ErrorKind::Geometric,
            SfmError::Mapper(MapperError::Reconstruction(_)) => ErrorKind::Input,
            SfmError::BundleAdjustment(BundleAdjustmentError::NoConvergence { .. }) => {
                ErrorKind::ResourceExhaustion
            }
            SfmError::BundleAdjustment(_) => ErrorKind::Numeric,
            SfmError::Camera(_)
            | SfmError::Config(_)
            | SfmError::Extraction(_)
            | SfmError::Reconstruction(_)
            | SfmError::Storage(_)
            | SfmError::Colmap(_)
            | SfmError::BinaryModel(_)
            | SfmError::Ply(_)
            | SfmError::NoImages(_)
            | SfmError::Io(_) => ErrorKind::Input,
        }
    }
}
