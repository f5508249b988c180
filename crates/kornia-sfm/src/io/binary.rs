use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use glam::{DVec2, DVec3};

use crate::camera::{Camera, CameraError, CameraModelId};
use crate::pose::Rigid3;
use crate::reconstruction::{Image, Point3D, Reconstruction, ReconstructionError};
use crate::types::{CameraId, ImageId, Observation, Point3DId, TrackId};

const MODEL_MAGIC: [u8; 4] = *b"KSFM";
const MODEL_VERSION: u32 = 1;

/// Error types for the binary model dump.
#[derive(Debug, thiserror::Error)]
pub enum BinaryModelError {
    /// Failed to read or write the file
    #[error("failed to read or write model file")]
    Io(#[from] std::io::Error),

    /// Failed to serialize the model
    #[error("failed to serialize model")]
    Serialize(#[from] bincode::error::EncodeError),

    /// Failed to deserialize the model
    #[error("failed to deserialize model")]
    Deserialize(#[from] bincode::error::DecodeError),

    /// The file is not a model dump or has another version
    #[error("not a model dump of version {MODEL_VERSION}")]
    InvalidHeader,

    /// A camera record is invalid
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// The records reference each other inconsistently
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),
}

#[derive(bincode::Encode, bincode::Decode)]
struct CameraRecord {
    camera_id: CameraId,
    model: i32,
    width: u32,
    height: u32,
    params: Vec<f64>,
}

#[derive(bincode::Encode, bincode::Decode)]
struct ImageRecord {
    image_id: ImageId,
    name: String,
    camera_id: CameraId,
    quaternion: [f64; 4],
    translation: [f64; 3],
    keypoints: Vec<[f64; 2]>,
}

#[derive(bincode::Encode, bincode::Decode)]
struct PointRecord {
    point3d_id: Point3DId,
    xyz: [f64; 3],
    color: [u8; 3],
    error: f64,
    track: Vec<Observation>,
    track_id: Option<TrackId>,
}

#[derive(bincode::Encode, bincode::Decode)]
struct ModelRecord {
    magic: [u8; 4],
    version: u32,
    cameras: Vec<CameraRecord>,
    images: Vec<ImageRecord>,
    registration_order: Vec<ImageId>,
    points3d: Vec<PointRecord>,
}

impl From<&Reconstruction> for ModelRecord {
    fn from(rec: &Reconstruction) -> Self {
        Self {
            magic: MODEL_MAGIC,
            version: MODEL_VERSION,
            cameras: rec
                .cameras()
                .values()
                .map(|c| CameraRecord {
                    camera_id: c.camera_id,
                    model: c.model.colmap_id(),
                    width: c.width,
                    height: c.height,
                    params: c.params().to_vec(),
                })
                .collect(),
            images: rec
                .images()
                .values()
                .map(|image| ImageRecord {
                    image_id: image.image_id,
                    name: image.name.clone(),
                    camera_id: image.camera_id,
                    quaternion: image.pose.colmap_quaternion(),
                    translation: image.pose.translation.to_array(),
                    keypoints: image.points2d.iter().map(|p| p.xy.to_array()).collect(),
                })
                .collect(),
            registration_order: rec.registered_image_ids().to_vec(),
            points3d: rec
                .points3d()
                .iter()
                .map(|(id, p)| PointRecord {
                    point3d_id: *id,
                    xyz: p.xyz.to_array(),
                    color: p.color,
                    error: p.error,
                    track: p.track.clone(),
                    track_id: p.track_id,
                })
                .collect(),
        }
    }
}

impl TryFrom<ModelRecord> for Reconstruction {
    type Error = BinaryModelError;

    fn try_from(record: ModelRecord) -> Result<Self, Self::Error> {
        let cameras = record
            .cameras
            .into_iter()
            .map(|c| {
                let model = CameraModelId::from_colmap_id(c.model)?;
                Camera::new(c.camera_id, model, c.width, c.height, c.params)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let images = record.images.into_iter().map(|r| {
            let mut image = Image::new(
                r.image_id,
                r.name,
                r.camera_id,
                r.keypoints.into_iter().map(DVec2::from_array),
            );
            image.pose = Rigid3::from_colmap(r.quaternion, r.translation);
            image
        });
        let points = record.points3d.into_iter().map(|p| {
            (
                p.point3d_id,
                Point3D {
                    xyz: DVec3::from_array(p.xyz),
                    color: p.color,
                    error: p.error,
                    track: p.track,
                    track_id: p.track_id,
                },
            )
        });
        Ok(Reconstruction::from_parts(
            cameras,
            images,
            points,
            record.registration_order,
        )?)
    }
}

/// Write the whole reconstruction, unregistered images included, as a bincode dump.
pub fn write_model_binary(reconstruction: &Reconstruction, path: impl AsRef<Path>) -> Result<(), BinaryModelError> {
    let mut writer = BufWriter::new(File::create(path)?);
    let record = ModelRecord::from(reconstruction);
    bincode::encode_into_std_write(&record, &mut writer, bincode::config::standard())?;
    writer.flush()?;
    Ok(())
}

/// Read a dump written by [`write_model_binary`].
pub fn read_model_binary(path: impl AsRef<Path>) -> Result<Reconstruction, BinaryModelError> {
    let mut reader = BufReader::new(File::open(path)?);
    let record: ModelRecord = bincode::decode_from_std_read(&mut reader, bincode::config::standard())?;
    if record.magic != MODEL_MAGIC || record.version != MODEL_VERSION {
        return Err(BinaryModelError::InvalidHeader);
    }
    record.try_into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruction::tests::two_view_reconstruction;

    #[test]
    fn test_dump_keeps_everything() -> Result<(), Box<dyn std::error::Error>> {
        let points = [DVec3::new(0.0, 0.0, 10.0), DVec3::new(1.0, 0.5, 9.0)];
        let mut rec = two_view_reconstruction(&points);
        rec.add_image(Image::new(3, "unregistered.png", 1, [DVec2::new(1.0, 2.0)]))?;
        rec.delete_point3d(1)?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.bin");
        write_model_binary(&rec, &path)?;
        let loaded = read_model_binary(&path)?;

        assert_eq!(loaded.cameras(), rec.cameras());
        assert_eq!(loaded.registered_image_ids(), rec.registered_image_ids());
        assert_eq!(loaded.points3d(), rec.points3d());
        assert!(!loaded.image(3)?.is_registered());
        for (id, image) in rec.images() {
            let other = loaded.image(*id)?;
            assert_eq!(other.points2d, image.points2d);
            assert!(other.pose.rotation_angle_to(&image.pose) < 1e-12);
        }

        // ids keep increasing after a reload
        let mut loaded = loaded;
        let new_id = loaded.add_point3d(
            DVec3::new(0.0, 0.0, 10.0),
            vec![Observation::new(1, 0), Observation::new(2, 0)],
            [0; 3],
            None,
        )?;
        assert_eq!(new_id, 3);
        Ok(())
    }

    #[test]
    fn test_rejects_foreign_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.bin");
        std::fs::write(&path, b"not a model")?;
        assert!(read_model_binary(&path).is_err());
        Ok(())
    }
}
