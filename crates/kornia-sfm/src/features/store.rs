use std::collections::BTreeMap;

use log::debug;

use super::{ExtractionError, FeatureExtractor, GrayImage, ImageFeatures};
use crate::types::ImageId;

/// Per-image keypoints and descriptors, written once per image id.
#[derive(Debug, Clone, Default)]
pub struct FeatureStore {
    features: BTreeMap<ImageId, ImageFeatures>,
}

impl FeatureStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract features for `image_id` and store them.
    ///
    /// Fails with [`ExtractionError::NoKeypoints`] when nothing usable is
    /// detected; the store is left unchanged in that case.
    pub fn extract(
        &mut self,
        image_id: ImageId,
        image: &GrayImage,
        mask: Option<&GrayImage>,
        extractor: &dyn FeatureExtractor,
    ) -> Result<&ImageFeatures, ExtractionError> {
        let features = extractor.extract(image, mask)?;
        if features.is_empty() {
            return Err(ExtractionError::NoKeypoints);
        }
        debug!("image {image_id}: {} keypoints", features.len());
        Ok(self.features.entry(image_id).or_insert(features))
    }

    /// Store precomputed features, replacing nothing that is already present.
    ///
    /// Returns `false` when the image already had features.
    pub fn insert(&mut self, image_id: ImageId, features: ImageFeatures) -> bool {
        if self.features.contains_key(&image_id) {
            return false;
        }
        self.features.insert(image_id, features);
        true
    }

    /// Features of an image.
    pub fn get(&self, image_id: ImageId) -> Option<&ImageFeatures> {
        self.features.get(&image_id)
    }

    /// Whether the image has features.
    pub fn contains(&self, image_id: ImageId) -> bool {
        self.features.contains_key(&image_id)
    }

    /// Number of keypoints of an image, zero when unknown.
    pub fn num_keypoints(&self, image_id: ImageId) -> usize {
        self.features.get(&image_id).map_or(0, ImageFeatures::len)
    }

    /// Ids of all images with features, ascending.
    pub fn image_ids(&self) -> Vec<ImageId> {
        self.features.keys().copied().collect()
    }

    /// Number of images with features.
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Iterate over `(image id, features)` in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (ImageId, &ImageFeatures)> {
        self.features.iter().map(|(&id, f)| (id, f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Keypoint, OrbExtractor};

    fn features(n: usize) -> ImageFeatures {
        ImageFeatures {
            keypoints: (0..n)
                .map(|i| Keypoint {
                    x: i as f32,
                    y: 0.0,
                    scale: 1.0,
                    orientation: 0.0,
                    response: 1.0,
                    intensity: 0,
                })
                .collect(),
            descriptors: vec![[0u8; 32]; n],
        }
    }

    #[test]
    fn test_insert_is_write_once() {
        let mut store = FeatureStore::new();
        assert!(store.insert(1, features(3)));
        assert!(!store.insert(1, features(5)));
        assert_eq!(store.num_keypoints(1), 3);
        assert_eq!(store.num_keypoints(2), 0);
        assert_eq!(store.image_ids(), vec![1]);
    }

    #[test]
    fn test_extract_failure_leaves_store_unchanged() {
        let mut store = FeatureStore::new();
        let blank = GrayImage::from_fn(64, 64, |_, _| 10);
        let res = store.extract(4, &blank, None, &OrbExtractor::default());
        assert!(matches!(res, Err(ExtractionError::NoKeypoints)));
        assert!(store.is_empty());
    }
}
