//! End-to-end reconstruction of an image directory.
//!
//! Stages run in order: feature extraction, pair matching and verification,
//! track building and incremental mapping. Extraction and verification run on
//! the rayon pool; their results are collected before the next stage starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::camera::{Camera, CameraSpec};
use crate::config::SfmConfig;
use crate::error::SfmError;
use crate::features::{ExtractionError, FeatureExtractor, FeatureStore, ImageDecoder, ImageFeatures, OrbExtractor};
use crate::io;
use crate::mapper::{reconstruct, MappingInputs, MappingReport};
use crate::storage::{FeatureStorage, PairRecord};
use crate::tracks::TrackSet;
use crate::types::{CameraId, ImageId, ImageInfo};
use crate::view_graph::{candidate_pairs, ImagePair, ViewGraph, ViewInput};

/// File extensions treated as images, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff"];

/// How cameras are assigned to images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraMode {
    /// All images share one camera.
    #[default]
    Single,
    /// Every image has its own camera, initialized from the same description.
    PerImage,
}

/// Images of a directory with their cameras.
#[derive(Debug, Clone)]
pub struct Dataset {
    image_dir: PathBuf,
    mask_dir: Option<PathBuf>,
    cameras: BTreeMap<CameraId, Camera>,
    images: BTreeMap<ImageId, ImageInfo>,
}

impl Dataset {
    /// Collect the images of `image_dir`, sorted by file name, with ids starting at 1.
    ///
    /// Masks are looked up as `<mask_dir>/<image name>.png`.
    pub fn from_directory(
        image_dir: impl AsRef<Path>,
        camera: &CameraSpec,
        mode: CameraMode,
        mask_dir: Option<&Path>,
    ) -> Result<Self, SfmError> {
        let image_dir = image_dir.as_ref();
        let mut names = Vec::new();
        for entry in std::fs::read_dir(image_dir)? {
            let path = entry?.path();
            if !path.is_file() || !has_image_extension(&path) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        if names.is_empty() {
            return Err(SfmError::NoImages(image_dir.display().to_string()));
        }
        names.sort();

        let mut dataset = Self::from_names(image_dir, names, camera, mode)?;
        dataset.mask_dir = mask_dir.map(Path::to_path_buf);
        Ok(dataset)
    }

    /// Build a dataset from image names relative to `image_dir`, in the given order.
    pub fn from_names(
        image_dir: impl AsRef<Path>,
        names: impl IntoIterator<Item = String>,
        camera: &CameraSpec,
        mode: CameraMode,
    ) -> Result<Self, SfmError> {
        let mut cameras = BTreeMap::new();
        let mut images = BTreeMap::new();
        for (image_id, name) in (1..).zip(names) {
            let camera_id = match mode {
                CameraMode::Single => 1,
                CameraMode::PerImage => image_id,
            };
            if !cameras.contains_key(&camera_id) {
                cameras.insert(camera_id, camera.to_camera(camera_id)?);
            }
            images.insert(
                image_id,
                ImageInfo {
                    image_id,
                    name,
                    camera_id,
                },
            );
        }
        Ok(Self {
            image_dir: image_dir.as_ref().to_path_buf(),
            mask_dir: None,
            cameras,
            images,
        })
    }

    /// Cameras by id.
    pub fn cameras(&self) -> &BTreeMap<CameraId, Camera> {
        &self.cameras
    }

    /// Images by id.
    pub fn images(&self) -> &BTreeMap<ImageId, ImageInfo> {
        &self.images
    }

    /// Path of an image file.
    pub fn image_path(&self, image_id: ImageId) -> Option<PathBuf> {
        self.images
            .get(&image_id)
            .map(|info| self.image_dir.join(&info.name))
    }

    /// Path of the mask of an image, if a mask file exists.
    pub fn mask_path(&self, image_id: ImageId) -> Option<PathBuf> {
        let dir = self.mask_dir.as_ref()?;
        let info = self.images.get(&image_id)?;
        let path = dir.join(format!("{}.png", info.name));
        path.is_file().then_some(path)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Intermediate and final results of a run.
#[derive(Debug)]
pub struct PipelineOutput {
    /// Extracted features.
    pub features: FeatureStore,
    /// Verified pairs.
    pub view_graph: ViewGraph,
    /// Correspondence tracks.
    pub tracks: TrackSet,
    /// Ranked models.
    pub report: MappingReport,
}

/// Runs all reconstruction stages with one configuration.
pub struct Pipeline {
    config: SfmConfig,
    extractor: Box<dyn FeatureExtractor>,
    storage: Option<Box<dyn FeatureStorage>>,
}

impl Pipeline {
    /// Create a pipeline using the ORB extractor.
    pub fn new(config: SfmConfig) -> Self {
        let extractor = Box::new(OrbExtractor::new(config.extraction.clone()));
        Self {
            config,
            extractor,
            storage: None,
        }
    }

    /// Replace the feature extractor.
    pub fn with_extractor(mut self, extractor: Box<dyn FeatureExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Persist features and verified pairs, reusing entries already stored.
    pub fn with_storage(mut self, storage: Box<dyn FeatureStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// The configuration.
    pub fn config(&self) -> &SfmConfig {
        &self.config
    }

    /// Run every stage. Fails only when no model could be seeded.
    pub fn run(&self, dataset: &Dataset, decoder: &dyn ImageDecoder) -> Result<PipelineOutput, SfmError> {
        let features = self.extract_features(dataset, decoder);
        let view_graph = self.match_and_verify(dataset, &features);
        let tracks = TrackSet::from_view_graph(&view_graph);
        info!(
            "{} tracks, {} conflicting edges rejected",
            tracks.len(),
            tracks.num_rejected_edges()
        );
        let report = self.reconstruct(dataset, &features, &view_graph, &tracks)?;
        Ok(PipelineOutput {
            features,
            view_graph,
            tracks,
            report,
        })
    }

    /// Extract features of every image in parallel.
    ///
    /// Images that cannot be decoded or have no keypoints are skipped.
    pub fn extract_features(&self, dataset: &Dataset, decoder: &dyn ImageDecoder) -> FeatureStore {
        let extracted = dataset
            .images()
            .keys()
            .copied()
            .collect::<Vec<_>>()
            .into_par_iter()
            .filter_map(|image_id| match self.image_features(dataset, decoder, image_id) {
                Ok(features) => Some((image_id, features)),
                Err(err) => {
                    warn!("skipping image {image_id}: {err}");
                    None
                }
            })
            .collect::<Vec<_>>();

        let mut store = FeatureStore::new();
        for (image_id, features) in extracted {
            store.insert(image_id, features);
        }
        info!("features extracted for {} of {} images", store.len(), dataset.images().len());
        store
    }

    fn image_features(
        &self,
        dataset: &Dataset,
        decoder: &dyn ImageDecoder,
        image_id: ImageId,
    ) -> Result<ImageFeatures, SfmError> {
        if let Some(storage) = &self.storage {
            match storage.load_features(image_id) {
                Ok(Some(features)) => return Ok(features),
                Ok(None) => {}
                Err(err) => warn!("cannot load stored features of image {image_id}: {err}"),
            }
        }

        let path = dataset
            .image_path(image_id)
            .ok_or_else(|| SfmError::NoImages(format!("image {image_id}")))?;
        let image = decoder.decode(&path)?;
        let mask = dataset
            .mask_path(image_id)
            .map(|p| decoder.decode(&p))
            .transpose()?;
        let features = self.extractor.extract(&image, mask.as_ref())?;
        if features.is_empty() {
            return Err(ExtractionError::NoKeypoints.into());
        }

        if let Some(storage) = &self.storage {
            if let Err(err) = storage.save_features(image_id, &features) {
                warn!("cannot store features of image {image_id}: {err}");
            }
        }
        Ok(features)
    }

    /// Match and verify the candidate pairs of the configured pairing mode.
    pub fn match_and_verify(&self, dataset: &Dataset, features: &FeatureStore) -> ViewGraph {
        let mut views = BTreeMap::new();
        for (image_id, image_features) in features.iter() {
            let Some(info) = dataset.images().get(&image_id) else {
                continue;
            };
            let Some(camera) = dataset.cameras().get(&info.camera_id) else {
                continue;
            };
            views.insert(
                image_id,
                ViewInput {
                    image_id,
                    camera,
                    features: image_features,
                },
            );
        }
        let image_ids = views.keys().copied().collect::<Vec<_>>();
        let pairs = candidate_pairs(&image_ids, self.config.pairing);

        let mut stored = BTreeMap::new();
        let mut pending = Vec::new();
        for pair in pairs {
            match self.storage.as_ref().map(|s| s.load_pair(&pair)) {
                Some(Ok(Some(record))) => {
                    stored.insert(pair, record);
                }
                Some(Err(err)) => {
                    warn!("cannot load stored pair {pair:?}: {err}");
                    pending.push(pair);
                }
                _ => pending.push(pair),
            }
        }

        let mut graph = ViewGraph::build(
            &views,
            &pending,
            &self.config.matching,
            &self.config.verification,
            |_| None,
        );
        if let Some(storage) = &self.storage {
            self.store_pairs(storage.as_ref(), &graph, &pending);
        }
        for (pair, record) in stored {
            if let PairRecord::Verified(record) = record {
                graph.insert(pair.image_id1, pair.image_id2, record.into());
            }
        }
        graph
    }

    fn store_pairs(&self, storage: &dyn FeatureStorage, graph: &ViewGraph, pairs: &[ImagePair]) {
        for pair in pairs {
            let record = match graph.get(pair) {
                Some(geometry) => PairRecord::Verified(geometry.into()),
                None => PairRecord::Rejected,
            };
            if let Err(err) = storage.save_pair(pair, &record) {
                warn!("cannot store pair {pair:?}: {err}");
            }
        }
    }

    /// Run incremental mapping on prepared inputs.
    pub fn reconstruct(
        &self,
        dataset: &Dataset,
        features: &FeatureStore,
        view_graph: &ViewGraph,
        tracks: &TrackSet,
    ) -> Result<MappingReport, SfmError> {
        let inputs = MappingInputs {
            cameras: dataset.cameras(),
            images: dataset.images(),
            features,
            view_graph,
            tracks,
        };
        Ok(reconstruct(inputs, &self.config.mapper)?)
    }
}

/// Write every model as `<dir>/<index>/` with the COLMAP text files and a
/// `model.bin` dump, and the first model as `<dir>/sparse_model.ply`.
pub fn write_report(report: &MappingReport, dir: impl AsRef<Path>) -> Result<(), SfmError> {
    let dir = dir.as_ref();
    for (index, model) in report.models.iter().enumerate() {
        let model_dir = dir.join(index.to_string());
        io::write_model_txt(model, &model_dir)?;
        io::write_model_binary(model, model_dir.join("model.bin"))?;
    }
    if let Some(first) = report.models.first() {
        io::write_ply_binary(first, dir.join("sparse_model.ply"))?;
    }
    Ok(())
}
