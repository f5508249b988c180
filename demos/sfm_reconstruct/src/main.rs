use argh::FromArgs;
use std::path::{Path, PathBuf};

use kornia_sfm::features::{ExtractionError, GrayImage, ImageDecoder};
use kornia_sfm::pipeline::write_report;
use kornia_sfm::storage::DirectoryStorage;
use kornia_sfm::{CameraMode, CameraSpec, Dataset, Pipeline, SfmConfig};

#[derive(FromArgs)]
/// Reconstruct a sparse model from a directory of images
struct Args {
    /// path to the directory with the images
    #[argh(option)]
    image_dir: PathBuf,

    /// path to the camera description json (model, width, height, params)
    #[argh(option)]
    camera: PathBuf,

    /// output directory for the models
    #[argh(option, default = "PathBuf::from(\"output\")")]
    output_dir: PathBuf,

    /// optional directory with `<image name>.png` masks
    #[argh(option)]
    mask_dir: Option<PathBuf>,

    /// optional pipeline configuration json
    #[argh(option)]
    config: Option<PathBuf>,

    /// optional directory to store features and verified pairs between runs
    #[argh(option)]
    storage_dir: Option<PathBuf>,

    /// give every image its own camera
    #[argh(switch)]
    per_image_camera: bool,
}

/// Decodes any format supported by the `image` crate to 8-bit gray.
struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, path: &Path) -> Result<GrayImage, ExtractionError> {
        let img = image::open(path).map_err(|e| ExtractionError::ExtractionFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let gray = img.to_luma8();
        let (width, height) = (gray.width() as usize, gray.height() as usize);
        GrayImage::new(width, height, gray.into_raw())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let camera = CameraSpec::from_json_file(&args.camera)?;
    let config = match &args.config {
        Some(path) => SfmConfig::from_json_file(path)?,
        None => SfmConfig::default(),
    };
    let mode = if args.per_image_camera {
        CameraMode::PerImage
    } else {
        CameraMode::Single
    };

    let dataset = Dataset::from_directory(&args.image_dir, &camera, mode, args.mask_dir.as_deref())?;
    log::info!("found {} images in {}", dataset.images().len(), args.image_dir.display());

    let mut pipeline = Pipeline::new(config);
    if let Some(dir) = &args.storage_dir {
        pipeline = pipeline.with_storage(Box::new(DirectoryStorage::open(dir)?));
    }

    let output = pipeline.run(&dataset, &ImageCrateDecoder)?;
    if output.report.partial {
        log::warn!("mapping stopped early, the models are partial");
    }
    write_report(&output.report, &args.output_dir)?;

    for (i, model) in output.report.models.iter().enumerate() {
        let stats = model.stats();
        println!(
            "model {i}: {} images, {} points, mean track length {:.2}, mean reprojection error {:.3} px",
            stats.num_registered_images,
            stats.num_points3d,
            stats.mean_track_length,
            stats.mean_reprojection_error
        );
    }
    println!("models written to {}", args.output_dir.display());

    Ok(())
}
