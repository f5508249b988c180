use serde::{Deserialize, Serialize};

/// Identifier of a camera (intrinsics) shared by one or more images.
pub type CameraId = u32;

/// Identifier of an image in a dataset.
pub type ImageId = u32;

/// Identifier of a triangulated 3D point in a reconstruction.
pub type Point3DId = u64;

/// Identifier of a multi-view correspondence track.
pub type TrackId = u32;

/// A single keypoint of an image, referenced by index into the image's keypoint list.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct Observation {
    /// Image the keypoint belongs to.
    pub image_id: ImageId,
    /// Index of the keypoint inside the image.
    pub point2d_idx: u32,
}

impl Observation {
    /// Create a new observation.
    pub fn new(image_id: ImageId, point2d_idx: u32) -> Self {
        Self {
            image_id,
            point2d_idx,
        }
    }
}

/// Reference data of an input image: its file name and camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image id.
    pub image_id: ImageId,
    /// File name relative to the image directory.
    pub name: String,
    /// Camera of the image.
    pub camera_id: CameraId,
}
