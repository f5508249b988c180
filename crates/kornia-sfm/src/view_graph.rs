use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::camera::Camera;
use crate::features::{match_descriptors, FeatureMatch, ImageFeatures, MatchingOptions};
use crate::geometry::{
    estimate_two_view_geometry, TwoViewConfiguration, TwoViewGeometry, TwoViewGeometryOptions,
};
use crate::types::ImageId;

/// An unordered image pair, stored with the smaller id first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ImagePair {
    /// Smaller image id.
    pub image_id1: ImageId,
    /// Larger image id.
    pub image_id2: ImageId,
}

impl ImagePair {
    /// Create a pair, ordering the ids.
    pub fn new(a: ImageId, b: ImageId) -> Self {
        Self {
            image_id1: a.min(b),
            image_id2: a.max(b),
        }
    }

    /// The other image of the pair, if `image_id` is part of it.
    pub fn other(&self, image_id: ImageId) -> Option<ImageId> {
        if image_id == self.image_id1 {
            Some(self.image_id2)
        } else if image_id == self.image_id2 {
            Some(self.image_id1)
        } else {
            None
        }
    }
}

/// Strategy to select candidate image pairs for matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingMode {
    /// All pairs of images.
    #[default]
    Exhaustive,
    /// Each image with the next `overlap` images in id order.
    Sequential {
        /// Number of following images to pair with.
        overlap: usize,
    },
}

/// Candidate pairs for the given image ids, in ascending pair order.
pub fn candidate_pairs(image_ids: &[ImageId], mode: PairingMode) -> Vec<ImagePair> {
    let ids = image_ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect::<Vec<_>>();
    let mut pairs = Vec::new();
    for (i, &a) in ids.iter().enumerate() {
        let end = match mode {
            PairingMode::Exhaustive => ids.len(),
            PairingMode::Sequential { overlap } => (i + 1 + overlap).min(ids.len()),
        };
        for &b in &ids[i + 1..end] {
            pairs.push(ImagePair::new(a, b));
        }
    }
    pairs
}

/// The data of one image needed for pair verification.
#[derive(Debug, Clone, Copy)]
pub struct ViewInput<'a> {
    /// Image id.
    pub image_id: ImageId,
    /// Intrinsics of the image.
    pub camera: &'a Camera,
    /// Keypoints and descriptors of the image.
    pub features: &'a ImageFeatures,
}

/// Verify putative matches between two views.
///
/// Returns `None` when the pair fails verification; the reason is logged.
pub fn verify_matches(
    view1: &ViewInput<'_>,
    view2: &ViewInput<'_>,
    matches: &[FeatureMatch],
    options: &TwoViewGeometryOptions,
) -> Option<TwoViewGeometry> {
    let k1 = view1.features.positions();
    let k2 = view2.features.positions();
    match estimate_two_view_geometry(view1.camera, view2.camera, &k1, &k2, matches, options) {
        Ok(geometry) => Some(geometry),
        Err(err) => {
            debug!(
                "pair ({}, {}) rejected: {err}",
                view1.image_id, view2.image_id
            );
            None
        }
    }
}

/// Match descriptors of two views and verify the matches geometrically.
pub fn verify_pair(
    view1: &ViewInput<'_>,
    view2: &ViewInput<'_>,
    matching: &MatchingOptions,
    verification: &TwoViewGeometryOptions,
) -> Option<TwoViewGeometry> {
    let matches = match_descriptors(
        &view1.features.descriptors,
        &view2.features.descriptors,
        matching,
    );
    verify_matches(view1, view2, &matches, verification)
}

/// Verified image pairs with their two-view geometry.
#[derive(Debug, Clone, Default)]
pub struct ViewGraph {
    pairs: BTreeMap<ImagePair, TwoViewGeometry>,
}

impl ViewGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph by verifying the candidate pairs in parallel.
    ///
    /// `raw_matches` supplies precomputed putative matches for a pair (oriented
    /// from the smaller to the larger id); pairs without them are matched here.
    pub fn build<F>(
        views: &BTreeMap<ImageId, ViewInput<'_>>,
        pairs: &[ImagePair],
        matching: &MatchingOptions,
        verification: &TwoViewGeometryOptions,
        raw_matches: F,
    ) -> Self
    where
        F: Fn(&ImagePair) -> Option<Vec<FeatureMatch>> + Sync,
    {
        let verified = pairs
            .par_iter()
            .filter_map(|pair| {
                let v1 = views.get(&pair.image_id1)?;
                let v2 = views.get(&pair.image_id2)?;
                let geometry = match raw_matches(pair) {
                    Some(matches) => verify_matches(v1, v2, &matches, verification),
                    None => verify_pair(v1, v2, matching, verification),
                }?;
                Some((*pair, geometry))
            })
            .collect::<Vec<_>>();

        let mut graph = Self::new();
        for (pair, geometry) in verified {
            graph.insert(pair.image_id1, pair.image_id2, geometry);
        }
        info!(
            "view graph: {} of {} candidate pairs verified",
            graph.len(),
            pairs.len()
        );
        graph
    }

    /// Insert the geometry of `(image_id1, image_id2)`, oriented from the first to the second image.
    pub fn insert(&mut self, image_id1: ImageId, image_id2: ImageId, geometry: TwoViewGeometry) {
        let pair = ImagePair::new(image_id1, image_id2);
        let geometry = if image_id1 <= image_id2 {
            geometry
        } else {
            geometry.inverted()
        };
        self.pairs.insert(pair, geometry);
    }

    /// Geometry of a pair, oriented from the smaller to the larger id.
    pub fn get(&self, pair: &ImagePair) -> Option<&TwoViewGeometry> {
        self.pairs.get(pair)
    }

    /// Inlier matches oriented from `image_id1` to `image_id2`.
    pub fn matches_between(&self, image_id1: ImageId, image_id2: ImageId) -> Option<Vec<FeatureMatch>> {
        let geometry = self.pairs.get(&ImagePair::new(image_id1, image_id2))?;
        if image_id1 <= image_id2 {
            Some(geometry.inlier_matches.clone())
        } else {
            Some(geometry.inlier_matches.iter().map(FeatureMatch::swapped).collect())
        }
    }

    /// Iterate over all verified pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (&ImagePair, &TwoViewGeometry)> {
        self.pairs.iter()
    }

    /// Number of verified pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the graph has no verified pair.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Verified neighbors of an image, ascending.
    pub fn neighbors(&self, image_id: ImageId) -> Vec<ImageId> {
        self.pairs
            .keys()
            .filter_map(|p| p.other(image_id))
            .collect()
    }

    /// Calibrated pairs sorted by decreasing inlier count, ties by pair ids.
    pub fn calibrated_pairs_by_inliers(&self) -> Vec<(ImagePair, &TwoViewGeometry)> {
        let mut pairs = self
            .pairs
            .iter()
            .filter(|(_, g)| g.config == TwoViewConfiguration::Calibrated)
            .map(|(p, g)| (*p, g))
            .collect::<Vec<_>>();
        pairs.sort_by(|a, b| b.1.num_inliers().cmp(&a.1.num_inliers()).then(a.0.cmp(&b.0)));
        pairs
    }

    /// Image ids that appear in at least one verified pair.
    pub fn image_ids(&self) -> BTreeSet<ImageId> {
        self.pairs
            .keys()
            .flat_map(|p| [p.image_id1, p.image_id2])
            .collect()
    }
}
