use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::Path,
};

use crate::reconstruction::Reconstruction;

/// Error types for the PLY module.
#[derive(Debug, thiserror::Error)]
pub enum PlyError {
    /// Failed to read or write PLY file
    #[error("Failed to read or write PLY file")]
    Io(#[from] std::io::Error),

    /// Failed to serialize PLY vertex
    #[error("Failed to serialize PLY vertex")]
    Serialize(#[from] bincode::error::EncodeError),

    /// Failed to deserialize PLY vertex
    #[error("Failed to deserialize PLY vertex")]
    Deserialize(#[from] bincode::error::DecodeError),

    /// Unsupported PLY header or property layout
    #[error("Unsupported PLY header: {0}")]
    UnsupportedHeader(String),
}

/// A colored point as stored in a PLY vertex row.
#[derive(Debug, Clone, Copy, PartialEq, bincode::Encode, bincode::Decode)]
pub struct PlyVertex {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
    /// Z coordinate.
    pub z: f32,
    /// Red channel.
    pub red: u8,
    /// Green channel.
    pub green: u8,
    /// Blue channel.
    pub blue: u8,
}

const VERTEX_SIZE: usize = 15;
const PROPERTIES: [&str; 6] = [
    "property float x",
    "property float y",
    "property float z",
    "property uchar red",
    "property uchar green",
    "property uchar blue",
];

fn row_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Collect the 3D points of a reconstruction as PLY vertices.
pub fn vertices_from_reconstruction(reconstruction: &Reconstruction) -> Vec<PlyVertex> {
    reconstruction
        .points3d()
        .values()
        .map(|p| PlyVertex {
            x: p.xyz.x as f32,
            y: p.xyz.y as f32,
            z: p.xyz.z as f32,
            red: p.color[0],
            green: p.color[1],
            blue: p.color[2],
        })
        .collect()
}

/// Write the 3D points of a reconstruction as a binary little-endian PLY file.
pub fn write_ply_binary(reconstruction: &Reconstruction, path: impl AsRef<Path>) -> Result<(), PlyError> {
    write_vertices(&vertices_from_reconstruction(reconstruction), path)
}

/// Write vertices as a binary little-endian PLY file with `x y z red green blue` rows.
pub fn write_vertices(vertices: &[PlyVertex], path: impl AsRef<Path>) -> Result<(), PlyError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "ply")?;
    writeln!(w, "format binary_little_endian 1.0")?;
    writeln!(w, "element vertex {}", vertices.len())?;
    for property in PROPERTIES {
        writeln!(w, "{property}")?;
    }
    writeln!(w, "end_header")?;
    for vertex in vertices {
        bincode::encode_into_std_write(vertex, &mut w, row_config())?;
    }
    w.flush()?;
    Ok(())
}

fn parse_header<R: BufRead>(reader: &mut R) -> Result<usize, PlyError> {
    let mut line = String::new();
    let mut vertex_count = None;
    let mut is_ply = false;
    let mut is_binary_little_endian = false;
    let mut properties = Vec::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(PlyError::UnsupportedHeader("missing end_header".to_string()));
        }
        let trimmed = line.trim();

        if trimmed == "ply" {
            is_ply = true;
        } else if trimmed == "end_header" {
            break;
        } else if trimmed.starts_with("format binary_little_endian") {
            is_binary_little_endian = true;
        } else if let Some(count) = trimmed.strip_prefix("element vertex") {
            vertex_count = Some(
                count
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| PlyError::UnsupportedHeader(format!("vertex count: {e}")))?,
            );
        } else if trimmed.starts_with("property") {
            properties.push(trimmed.split_whitespace().collect::<Vec<_>>().join(" "));
        }
    }

    if !is_ply || !is_binary_little_endian {
        return Err(PlyError::UnsupportedHeader(
            "expected binary_little_endian format".to_string(),
        ));
    }
    if properties != PROPERTIES {
        return Err(PlyError::UnsupportedHeader(format!(
            "unsupported properties: {properties:?}"
        )));
    }
    vertex_count.ok_or_else(|| PlyError::UnsupportedHeader("missing vertex element".to_string()))
}

/// Read a PLY file written by [`write_ply_binary`].
pub fn read_ply_binary(path: impl AsRef<Path>) -> Result<Vec<PlyVertex>, PlyError> {
    let mut reader = BufReader::new(File::open(path)?);
    let vertex_count = parse_header(&mut reader)?;

    let mut buffer = [0u8; VERTEX_SIZE];
    let mut vertices = Vec::with_capacity(vertex_count);
    for _ in 0..vertex_count {
        reader.read_exact(&mut buffer)?;
        let (vertex, _) = bincode::decode_from_slice(&buffer, row_config())?;
        vertices.push(vertex);
    }
    Ok(vertices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruction::tests::two_view_reconstruction;
    use glam::DVec3;

    #[test]
    fn test_parse_header() -> Result<(), PlyError> {
        let header = "ply\nformat binary_little_endian 1.0\nelement vertex 10\nproperty float x\nproperty float y\nproperty float z\nproperty uchar red\nproperty uchar green\nproperty uchar blue\nend_header\n";
        let mut reader = BufReader::new(header.as_bytes());
        assert_eq!(parse_header(&mut reader)?, 10);

        let ascii = "ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nend_header\n";
        let mut reader = BufReader::new(ascii.as_bytes());
        assert!(parse_header(&mut reader).is_err());
        Ok(())
    }

    #[test]
    fn test_vertex_layout() -> Result<(), Box<dyn std::error::Error>> {
        let vertex = PlyVertex {
            x: 1.0,
            y: 2.0,
            z: 3.0,
            red: 255,
            green: 128,
            blue: 0,
        };
        let bytes = bincode::encode_to_vec(vertex, row_config())?;
        let mut expected = Vec::new();
        expected.extend_from_slice(&1.0f32.to_le_bytes());
        expected.extend_from_slice(&2.0f32.to_le_bytes());
        expected.extend_from_slice(&3.0f32.to_le_bytes());
        expected.extend_from_slice(&[255, 128, 0]);
        assert_eq!(bytes, expected);
        Ok(())
    }

    #[test]
    fn test_write_read_reconstruction() -> Result<(), Box<dyn std::error::Error>> {
        let points = [DVec3::new(0.0, 0.0, 10.0), DVec3::new(1.0, 0.5, 9.0)];
        let rec = two_view_reconstruction(&points);
        let file = tempfile::NamedTempFile::new()?;
        write_ply_binary(&rec, file.path())?;

        let vertices = read_ply_binary(file.path())?;
        assert_eq!(vertices, vertices_from_reconstruction(&rec));
        assert_eq!(vertices[1].x, 1.0);
        assert_eq!(vertices[1].red, 128);
        Ok(())
    }
}
