//! Persistence of features and verified pairs between runs.
//!
//! Entries are written once and reused when a run is repeated on the same
//! storage directory.

use std::fs;
use std::path::{Path, PathBuf};

use glam::{DMat3, DQuat, DVec3};

use crate::features::{FeatureMatch, ImageFeatures};
use crate::geometry::{TwoViewConfiguration, TwoViewGeometry};
use crate::pose::Rigid3;
use crate::types::ImageId;
use crate::view_graph::ImagePair;

/// Error types for feature storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Error reading or writing a file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Error encoding an entry.
    #[error("failed to encode entry: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Error decoding an entry.
    #[error("failed to decode entry: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// The entry was written by an incompatible version.
    #[error("unsupported storage version {0}")]
    UnsupportedVersion(u32),
}

/// Outcome of a stored pair verification.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub enum PairRecord {
    /// The pair failed verification.
    Rejected,
    /// The pair passed verification.
    Verified(TwoViewRecord),
}

/// Serializable form of a [`TwoViewGeometry`].
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct TwoViewRecord {
    planar: bool,
    inlier_matches: Vec<FeatureMatch>,
    essential: [f64; 9],
    fundamental: [f64; 9],
    homography: [f64; 9],
    // qw qx qy qz tx ty tz
    relative_pose: Option<[f64; 7]>,
    tri_angle_deg: f64,
    num_essential_inliers: u64,
    num_homography_inliers: u64,
}

impl From<&TwoViewGeometry> for TwoViewRecord {
    fn from(g: &TwoViewGeometry) -> Self {
        Self {
            planar: g.config == TwoViewConfiguration::Planar,
            inlier_matches: g.inlier_matches.clone(),
            essential: g.essential.to_cols_array(),
            fundamental: g.fundamental.to_cols_array(),
            homography: g.homography.to_cols_array(),
            relative_pose: g.relative_pose.map(|p| {
                let q = p.colmap_quaternion();
                let t = p.translation;
                [q[0], q[1], q[2], q[3], t.x, t.y, t.z]
            }),
            tri_angle_deg: g.tri_angle_deg,
            num_essential_inliers: g.num_essential_inliers as u64,
            num_homography_inliers: g.num_homography_inliers as u64,
        }
    }
}

impl From<TwoViewRecord> for TwoViewGeometry {
    fn from(r: TwoViewRecord) -> Self {
        Self {
            config: if r.planar {
                TwoViewConfiguration::Planar
            } else {
                TwoViewConfiguration::Calibrated
            },
            inlier_matches: r.inlier_matches,
            essential: DMat3::from_cols_array(&r.essential),
            fundamental: DMat3::from_cols_array(&r.fundamental),
            homography: DMat3::from_cols_array(&r.homography),
            relative_pose: r.relative_pose.map(|p| {
                Rigid3::new(DQuat::from_xyzw(p[1], p[2], p[3], p[0]), DVec3::new(p[4], p[5], p[6]))
            }),
            tri_angle_deg: r.tri_angle_deg,
            num_essential_inliers: r.num_essential_inliers as usize,
            num_homography_inliers: r.num_homography_inliers as usize,
        }
    }
}

/// Storage of intermediate results keyed by image id or image pair.
pub trait FeatureStorage: Send + Sync {
    /// Features of an image, if stored.
    fn load_features(&self, image_id: ImageId) -> Result<Option<ImageFeatures>, StorageError>;

    /// Store the features of an image.
    fn save_features(&self, image_id: ImageId, features: &ImageFeatures) -> Result<(), StorageError>;

    /// Verification outcome of a pair, if stored.
    fn load_pair(&self, pair: &ImagePair) -> Result<Option<PairRecord>, StorageError>;

    /// Store the verification outcome of a pair.
    fn save_pair(&self, pair: &ImagePair, record: &PairRecord) -> Result<(), StorageError>;
}

const STORAGE_VERSION: u32 = 1;

#[derive(bincode::Encode, bincode::Decode)]
struct Entry<T> {
    version: u32,
    value: T,
}

/// Bincode files under a directory: `features/<id>.bin` and `pairs/<id1>_<id2>.bin`.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    /// Open a storage directory, creating it if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("features"))?;
        fs::create_dir_all(root.join("pairs"))?;
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn features_path(&self, image_id: ImageId) -> PathBuf {
        self.root.join("features").join(format!("{image_id}.bin"))
    }

    fn pair_path(&self, pair: &ImagePair) -> PathBuf {
        self.root
            .join("pairs")
            .join(format!("{}_{}.bin", pair.image_id1, pair.image_id2))
    }

    fn read<T: bincode::Decode<()>>(path: &Path) -> Result<Option<T>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        let (entry, _): (Entry<T>, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())?;
        if entry.version != STORAGE_VERSION {
            return Err(StorageError::UnsupportedVersion(entry.version));
        }
        Ok(Some(entry.value))
    }

    // write to a temporary file first so readers never see partial entries
    fn write<T: bincode::Encode>(path: &Path, value: T) -> Result<(), StorageError> {
        let entry = Entry {
            version: STORAGE_VERSION,
            value,
        };
        let bytes = bincode::encode_to_vec(&entry, bincode::config::standard())?;
        let tmp = path.with_extension("bin.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl FeatureStorage for DirectoryStorage {
    fn load_features(&self, image_id: ImageId) -> Result<Option<ImageFeatures>, StorageError> {
        Self::read(&self.features_path(image_id))
    }

    fn save_features(&self, image_id: ImageId, features: &ImageFeatures) -> Result<(), StorageError> {
        Self::write(&self.features_path(image_id), features)
    }

    fn load_pair(&self, pair: &ImagePair) -> Result<Option<PairRecord>, StorageError> {
        Self::read(&self.pair_path(pair))
    }

    fn save_pair(&self, pair: &ImagePair, record: &PairRecord) -> Result<(), StorageError> {
        Self::write(&self.pair_path(pair), record)
    }
}
