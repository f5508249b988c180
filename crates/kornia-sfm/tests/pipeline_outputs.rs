mod common;

use std::path::Path;

use kornia_sfm::features::{
    ExtractionError, FeatureExtractor, FeatureStore, GrayImage, ImageDecoder, ImageFeatures,
};
use kornia_sfm::io::{read_model_binary, read_model_txt, read_ply_binary};
use kornia_sfm::mapper::reconstruct;
use kornia_sfm::pipeline::write_report;
use kornia_sfm::storage::DirectoryStorage;
use kornia_sfm::{CameraMode, CameraSpec, Dataset, MapperOptions, Pipeline, SfmConfig};

// Decodes `image_<id>.png` into a 1-row image whose width is the id.
struct IdDecoder;

impl ImageDecoder for IdDecoder {
    fn decode(&self, path: &Path) -> Result<GrayImage, ExtractionError> {
        let failed = |reason: &str| ExtractionError::ExtractionFailed {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| failed("no file name"))?;
        let id = stem
            .trim_start_matches("image_")
            .parse::<usize>()
            .map_err(|_| failed("no image id"))?;
        GrayImage::new(id, 1, vec![0; id])
    }
}

struct FailingDecoder;

impl ImageDecoder for FailingDecoder {
    fn decode(&self, path: &Path) -> Result<GrayImage, ExtractionError> {
        Err(ExtractionError::ExtractionFailed {
            path: path.display().to_string(),
            reason: "decoder disabled".to_string(),
        })
    }
}

// Returns the precomputed features of the image id encoded by `IdDecoder`.
struct SceneExtractor(FeatureStore);

impl FeatureExtractor for SceneExtractor {
    fn extract(&self, image: &GrayImage, _mask: Option<&GrayImage>) -> Result<ImageFeatures, ExtractionError> {
        Ok(self.0.get(image.width() as u32).cloned().unwrap_or_default())
    }
}

fn dataset(scene: &common::Scene) -> Result<Dataset, Box<dyn std::error::Error>> {
    let spec = CameraSpec {
        model: "PINHOLE".to_string(),
        width: common::WIDTH,
        height: common::HEIGHT,
        params: Some(scene.cameras[&1].params().to_vec()),
    };
    let names = scene.images.values().map(|info| info.name.clone());
    Ok(Dataset::from_names("/images", names, &spec, CameraMode::Single)?)
}

#[test]
fn test_pipeline_reuses_storage() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let scene = common::scene(5, 300, &[]);
    let dataset = dataset(&scene)?;
    let dir = tempfile::tempdir()?;

    let pipeline = Pipeline::new(SfmConfig::default())
        .with_extractor(Box::new(SceneExtractor(scene.features.clone())))
        .with_storage(Box::new(DirectoryStorage::open(dir.path())?));
    let first = pipeline.run(&dataset, &IdDecoder)?;
    assert_eq!(first.features.len(), 5);
    assert_eq!(first.view_graph.len(), scene.view_graph.len());
    assert_eq!(first.report.models[0].num_registered_images(), 5);
    assert_eq!(std::fs::read_dir(dir.path().join("features"))?.count(), 5);
    assert_eq!(std::fs::read_dir(dir.path().join("pairs"))?.count(), 10);

    // everything comes from storage, so decoding is never needed
    let pipeline = Pipeline::new(SfmConfig::default()).with_storage(Box::new(DirectoryStorage::open(dir.path())?));
    let second = pipeline.run(&dataset, &FailingDecoder)?;
    assert_eq!(second.features.len(), 5);
    assert_eq!(second.tracks.tracks(), first.tracks.tracks());
    assert_eq!(second.report.models[0].num_registered_images(), 5);
    Ok(())
}

#[test]
fn test_undecodable_images_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let scene = common::scene(3, 100, &[]);
    let dataset = dataset(&scene)?;
    let pipeline = Pipeline::new(SfmConfig::default());
    let features = pipeline.extract_features(&dataset, &FailingDecoder);
    assert!(features.is_empty());
    assert!(pipeline.run(&dataset, &FailingDecoder).is_err());
    Ok(())
}

#[test]
fn test_exported_models_read_back() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let scene = common::scene(5, 300, &[]);
    let report = reconstruct(scene.inputs(), &MapperOptions::default())?;
    let model = &report.models[0];

    let dir = tempfile::tempdir()?;
    write_report(&report, dir.path())?;

    let text = read_model_txt(dir.path().join("0"))?;
    assert_eq!(text.registered_image_ids(), model.registered_image_ids());
    assert_eq!(text.num_points3d(), model.num_points3d());
    for (id, point) in model.points3d() {
        assert_eq!(text.point3d(*id)?.track, point.track);
        assert!(text.point3d(*id)?.xyz.distance(point.xyz) < 1e-9);
    }

    for &id in model.registered_image_ids() {
        let (expected, loaded) = (&model.image(id)?.pose, &text.image(id)?.pose);
        assert!(loaded.rotation_angle_to(expected) < 1e-6);
        assert!(loaded.translation.distance(expected.translation) < 1e-9);
    }

    let binary = read_model_binary(dir.path().join("0").join("model.bin"))?;
    assert_eq!(binary.points3d(), model.points3d());
    for &id in model.registered_image_ids() {
        let (expected, loaded) = (&model.image(id)?.pose, &binary.image(id)?.pose);
        assert!(loaded.rotation_angle_to(expected) < 1e-6);
        assert!(loaded.translation.distance(expected.translation) < 1e-9);
    }
    assert_eq!(binary.stats().num_observations, model.stats().num_observations);

    let vertices = read_ply_binary(dir.path().join("sparse_model.ply"))?;
    assert_eq!(vertices.len(), model.num_points3d());
    let first = model.points3d().values().next().ok_or("empty model")?;
    assert_eq!(vertices[0].x, first.xyz.x as f32);
    assert_eq!(vertices[0].red, first.color[0]);
    Ok(())
}
