use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use glam::DVec2;

use crate::camera::{Camera, CameraError, CameraModelId};
use crate::pose::Rigid3;
use crate::reconstruction::{Image, Point3D, Reconstruction, ReconstructionError};
use crate::types::{Observation, Point3DId};

/// Error types for the COLMAP module.
#[derive(Debug, thiserror::Error)]
pub enum ColmapError {
    /// Error reading or writing file
    #[error("error reading or writing file")]
    IoError(#[from] std::io::Error),

    /// Invalid number of camera parameters
    #[error("Invalid number of camera parameters")]
    InvalidNumCameraParams(usize),

    /// Parse error
    #[error("Parse error {0}")]
    ParseError(String),

    /// The camera line names an unsupported model or invalid parameters
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// The files reference each other inconsistently
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),
}

/// Write `cameras.txt`, `images.txt` and `points3D.txt` into `dir`.
///
/// Only registered images are written, in registration order.
pub fn write_model_txt(reconstruction: &Reconstruction, dir: impl AsRef<Path>) -> Result<(), ColmapError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    write_cameras_txt(reconstruction, dir.join("cameras.txt"))?;
    write_images_txt(reconstruction, dir.join("images.txt"))?;
    write_points3d_txt(reconstruction, dir.join("points3D.txt"))?;
    Ok(())
}

/// Read a model written by [`write_model_txt`] (or by COLMAP) from `dir`.
///
/// Every image in `images.txt` is registered, in file order.
pub fn read_model_txt(dir: impl AsRef<Path>) -> Result<Reconstruction, ColmapError> {
    let dir = dir.as_ref();
    let cameras = read_cameras_txt(dir.join("cameras.txt"))?;
    let images = read_images_txt(dir.join("images.txt"))?;
    let points = read_points3d_txt(dir.join("points3D.txt"))?;
    let order = images.iter().map(|image| image.image_id).collect();
    Ok(Reconstruction::from_parts(cameras, images, points, order)?)
}

fn write_cameras_txt(reconstruction: &Reconstruction, path: impl AsRef<Path>) -> Result<(), ColmapError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "# Camera list with one line of data per camera:")?;
    writeln!(w, "#   CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[]")?;
    writeln!(w, "# Number of cameras: {}", reconstruction.cameras().len())?;
    for camera in reconstruction.cameras().values() {
        write!(
            w,
            "{} {} {} {}",
            camera.camera_id,
            camera.model.name(),
            camera.width,
            camera.height
        )?;
        for p in camera.params() {
            write!(w, " {p}")?;
        }
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

fn write_images_txt(reconstruction: &Reconstruction, path: impl AsRef<Path>) -> Result<(), ColmapError> {
    let mut w = BufWriter::new(File::create(path)?);
    let stats = reconstruction.stats();
    writeln!(w, "# Image list with two lines of data per image:")?;
    writeln!(w, "#   IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME")?;
    writeln!(w, "#   POINTS2D[] as (X, Y, POINT3D_ID)")?;
    writeln!(
        w,
        "# Number of images: {}, mean observations per image: {}",
        stats.num_registered_images,
        if stats.num_registered_images > 0 {
            stats.num_observations as f64 / stats.num_registered_images as f64
        } else {
            0.0
        }
    )?;
    for &image_id in reconstruction.registered_image_ids() {
        let image = reconstruction.image(image_id)?;
        let q = image.pose.colmap_quaternion();
        let t = image.pose.translation;
        writeln!(
            w,
            "{} {} {} {} {} {} {} {} {} {}",
            image.image_id, q[0], q[1], q[2], q[3], t.x, t.y, t.z, image.camera_id, image.name
        )?;
        let points2d = image
            .points2d
            .iter()
            .map(|p| {
                // COLMAP marks keypoints without a 3D point with -1
                let id = p.point3d_id.map_or(-1, |id| id as i64);
                format!("{} {} {}", p.xy.x, p.xy.y, id)
            })
            .collect::<Vec<_>>();
        writeln!(w, "{}", points2d.join(" "))?;
    }
    w.flush()?;
    Ok(())
}

fn write_points3d_txt(reconstruction: &Reconstruction, path: impl AsRef<Path>) -> Result<(), ColmapError> {
    let mut w = BufWriter::new(File::create(path)?);
    let stats = reconstruction.stats();
    writeln!(w, "# 3D point list with one line of data per point:")?;
    writeln!(w, "#   POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[] as (IMAGE_ID, POINT2D_IDX)")?;
    writeln!(
        w,
        "# Number of points: {}, mean track length: {}",
        stats.num_points3d, stats.mean_track_length
    )?;
    for (id, point) in reconstruction.points3d() {
        let [r, g, b] = point.color;
        write!(
            w,
            "{} {} {} {} {} {} {} {}",
            id, point.xyz.x, point.xyz.y, point.xyz.z, r, g, b, point.error
        )?;
        for obs in &point.track {
            write!(w, " {} {}", obs.image_id, obs.point2d_idx)?;
        }
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

// data lines of a COLMAP text file, without comments
fn data_lines(path: impl AsRef<Path>) -> Result<Vec<String>, ColmapError> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.starts_with('#') {
            continue;
        }
        lines.push(line);
    }
    Ok(lines)
}

fn read_cameras_txt(path: impl AsRef<Path>) -> Result<Vec<Camera>, ColmapError> {
    data_lines(path)?
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_camera_line(line))
        .collect()
}

fn read_images_txt(path: impl AsRef<Path>) -> Result<Vec<Image>, ColmapError> {
    let lines = data_lines(path)?;
    // the points line of an image without keypoints is empty, so blank lines
    // are only trimmed at the end and the last points line restored if needed
    let end = lines
        .iter()
        .rposition(|line| !line.trim().is_empty())
        .map_or(0, |i| i + 1);
    let mut lines = lines[..end].to_vec();
    if lines.len() % 2 == 1 {
        lines.push(String::new());
    }
    lines
        .chunks(2)
        .map(|chunk| match chunk {
            [line1, line2] => parse_image_line(line1, line2),
            _ => Err(ColmapError::ParseError("Invalid number of lines".to_string())),
        })
        .collect()
}

fn read_points3d_txt(path: impl AsRef<Path>) -> Result<Vec<(Point3DId, Point3D)>, ColmapError> {
    data_lines(path)?
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_point3d_line(line))
        .collect()
}

fn parse_part<T: std::str::FromStr>(s: &str) -> Result<T, ColmapError>
where
    T::Err: std::fmt::Display,
{
    s.parse::<T>()
        .map_err(|e| ColmapError::ParseError(format!("{}: {}", s, e)))
}

fn parse_array<T: std::str::FromStr + Copy + Default, const N: usize>(parts: &[&str]) -> Result<[T; N], ColmapError>
where
    T::Err: std::fmt::Display,
{
    if parts.len() != N {
        return Err(ColmapError::ParseError(format!(
            "expected {N} values, got {}",
            parts.len()
        )));
    }
    let mut out = [T::default(); N];
    for (o, s) in out.iter_mut().zip(parts) {
        *o = parse_part(s)?;
    }
    Ok(out)
}

/// CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[0], PARAMS[1], ...
fn parse_camera_line(line: &str) -> Result<Camera, ColmapError> {
    let parts = line.split_whitespace().collect::<Vec<_>>();
    if parts.len() < 5 {
        return Err(ColmapError::ParseError(format!(
            "Invalid number of parts: {}",
            parts.len()
        )));
    }

    let model = CameraModelId::from_name(parts[1])?;
    let params = parts[4..]
        .iter()
        .map(|s| parse_part(s))
        .collect::<Result<Vec<f64>, _>>()?;
    if params.len() != model.num_params() {
        return Err(ColmapError::InvalidNumCameraParams(params.len()));
    }
    Ok(Camera::new(
        parse_part(parts[0])?,
        model,
        parse_part(parts[2])?,
        parse_part(parts[3])?,
        params,
    )?)
}

/// IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME
/// POINTS2D[] as (X, Y, POINT3D_ID)
///
/// Point ids on the second line are ignored; the assignment is rebuilt from
/// the point tracks.
fn parse_image_line(line1: &str, line2: &str) -> Result<Image, ColmapError> {
    let parts1 = line1.split_whitespace().collect::<Vec<_>>();
    let parts2 = line2.split_whitespace().collect::<Vec<_>>();
    if parts1.len() < 10 {
        return Err(ColmapError::ParseError(format!(
            "Invalid number of parts: {}",
            parts1.len()
        )));
    }
    if parts2.len() % 3 != 0 {
        return Err(ColmapError::ParseError(format!(
            "Invalid number of point2d values: {}",
            parts2.len()
        )));
    }

    let q: [f64; 4] = parse_array(&parts1[1..5])?;
    let t: [f64; 3] = parse_array(&parts1[5..8])?;
    let keypoints = parts2
        .chunks_exact(3)
        .map(|chunk| -> Result<DVec2, ColmapError> {
            let _point3d_id: i64 = parse_part(chunk[2])?;
            Ok(DVec2::new(parse_part(chunk[0])?, parse_part(chunk[1])?))
        })
        .collect::<Result<Vec<_>, _>>()?;

    // image names may contain spaces
    let mut image = Image::new(
        parse_part(parts1[0])?,
        parts1[9..].join(" "),
        parse_part(parts1[8])?,
        keypoints,
    );
    image.pose = Rigid3::from_colmap(q, t);
    Ok(image)
}

/// POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[] as (IMAGE_ID, POINT2D_IDX)
fn parse_point3d_line(line: &str) -> Result<(Point3DId, Point3D), ColmapError> {
    let parts = line.split_whitespace().collect::<Vec<_>>();
    if parts.len() < 8 || (parts.len() - 8) % 2 != 0 {
        return Err(ColmapError::ParseError(format!(
            "Invalid number of parts: {}",
            parts.len()
        )));
    }

    let xyz: [f64; 3] = parse_array(&parts[1..4])?;
    let color: [u8; 3] = parse_array(&parts[4..7])?;
    let track = parts[8..]
        .chunks_exact(2)
        .map(|chunk| -> Result<Observation, ColmapError> {
            Ok(Observation::new(parse_part(chunk[0])?, parse_part(chunk[1])?))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((
        parse_part(parts[0])?,
        Point3D {
            xyz: xyz.into(),
            color,
            error: parse_part(parts[7])?,
            track,
            track_id: None,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruction::tests::two_view_reconstruction;
    use approx::assert_relative_eq;
    use glam::DVec3;

    #[test]
    fn test_parse_camera_line() -> Result<(), ColmapError> {
        let camera = parse_camera_line("3 SIMPLE_RADIAL 640 480 500 320 240 0.01")?;
        assert_eq!(camera.camera_id, 3);
        assert_eq!(camera.model, CameraModelId::SimpleRadial);
        assert_eq!(camera.params(), &[500.0, 320.0, 240.0, 0.01]);

        assert!(matches!(
            parse_camera_line("1 PINHOLE 640 480 500 320 240"),
            Err(ColmapError::InvalidNumCameraParams(3))
        ));
        assert!(matches!(
            parse_camera_line("1 OPENCV_FISHEYE 640 480 1 2 3 4 5 6 7 8"),
            Err(ColmapError::Camera(_))
        ));
        assert!(matches!(
            parse_camera_line("1 PINHOLE 640"),
            Err(ColmapError::ParseError(_))
        ));
        Ok(())
    }

    #[test]
    fn test_parse_image_line() -> Result<(), ColmapError> {
        let image = parse_image_line(
            "7 1 0 0 0 0.5 -1 2 1 dir/my image.png",
            "10.5 20 -1 30 40.25 12",
        )?;
        assert_eq!(image.image_id, 7);
        assert_eq!(image.camera_id, 1);
        assert_eq!(image.name, "dir/my image.png");
        assert_eq!(image.points2d.len(), 2);
        assert_relative_eq!(image.points2d[1].xy.y, 40.25);
        assert_relative_eq!(image.pose.translation.z, 2.0);

        assert!(parse_image_line("7 1 0 0 0 0.5 -1 2 1 a.png", "1 2").is_err());
        Ok(())
    }

    #[test]
    fn test_parse_point3d_line() -> Result<(), ColmapError> {
        let (id, point) = parse_point3d_line("12 1.5 -2 3 255 128 0 0.7 1 4 2 9")?;
        assert_eq!(id, 12);
        assert_eq!(point.xyz, DVec3::new(1.5, -2.0, 3.0));
        assert_eq!(point.color, [255, 128, 0]);
        assert_eq!(point.track, vec![Observation::new(1, 4), Observation::new(2, 9)]);
        assert!(parse_point3d_line("12 1.5 -2 3 255 128 0 0.7 1").is_err());
        assert!(parse_point3d_line("12 1.5 -2 3 300 128 0 0.7").is_err());
        Ok(())
    }

    #[test]
    fn test_model_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let points = [
            DVec3::new(0.0, 0.0, 10.0),
            DVec3::new(1.0, 0.5, 9.0),
            DVec3::new(-1.0, 0.25, 11.0),
        ];
        let rec = two_view_reconstruction(&points);
        let dir = tempfile::tempdir()?;
        write_model_txt(&rec, dir.path())?;
        let loaded = read_model_txt(dir.path())?;

        assert_eq!(loaded.cameras(), rec.cameras());
        assert_eq!(loaded.registered_image_ids(), rec.registered_image_ids());
        assert_eq!(loaded.num_points3d(), rec.num_points3d());
        for (id, image) in rec.images() {
            let other = loaded.image(*id)?;
            assert_eq!(other.name, image.name);
            assert_eq!(other.points2d, image.points2d);
            assert!(other.pose.rotation_angle_to(&image.pose) < 1e-9);
            assert_relative_eq!((other.pose.translation - image.pose.translation).length(), 0.0, epsilon = 1e-9);
        }
        for (id, point) in rec.points3d() {
            let other = loaded.point3d(*id)?;
            assert_eq!(other.track, point.track);
            assert_eq!(other.xyz, point.xyz);
        }
        Ok(())
    }
}
