/// Compact bincode dump of a reconstruction.
pub mod binary;

/// COLMAP text model (`cameras.txt`, `images.txt`, `points3D.txt`).
pub mod colmap;

/// Binary little-endian PLY point clouds.
pub mod ply;

pub use binary::{read_model_binary, write_model_binary, BinaryModelError};
pub use colmap::{read_model_txt, write_model_txt, ColmapError};
pub use ply::{read_ply_binary, write_ply_binary, PlyError, PlyVertex};
