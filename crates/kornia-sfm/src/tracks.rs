use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{info, warn};

use crate::features::FeatureMatch;
use crate::types::{ImageId, Observation, TrackId};
use crate::view_graph::{ImagePair, ViewGraph};

/// A set of observations of the same scene point, at most one per image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Track id.
    pub track_id: TrackId,
    /// Observations sorted by image id.
    pub observations: Vec<Observation>,
}

impl Track {
    /// Number of observations.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Whether the track is empty.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// The keypoint observed in `image_id`, if any.
    pub fn point2d_idx_in(&self, image_id: ImageId) -> Option<u32> {
        self.observations
            .binary_search_by_key(&image_id, |o| o.image_id)
            .ok()
            .map(|i| self.observations[i].point2d_idx)
    }
}

// Union-find over dense node indices with union by size.
struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[x] != root {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    // Returns (new root, absorbed root).
    fn union_roots(&mut self, a: usize, b: usize) -> (usize, usize) {
        let (big, small) = if self.size[a] >= self.size[b] {
            (a, b)
        } else {
            (b, a)
        };
        self.parent[small] = big;
        self.size[big] += self.size[small];
        (big, small)
    }
}

/// Tracks built from verified matches.
#[derive(Debug, Clone, Default)]
pub struct TrackSet {
    tracks: Vec<Track>,
    lookup: HashMap<Observation, TrackId>,
    by_image: BTreeMap<ImageId, Vec<(u32, TrackId)>>,
    num_rejected_edges: usize,
}

impl TrackSet {
    /// Build tracks from all inlier matches of a view graph.
    pub fn from_view_graph(view_graph: &ViewGraph) -> Self {
        Self::from_matches(
            view_graph
                .iter()
                .map(|(pair, geometry)| (*pair, geometry.inlier_matches.as_slice())),
        )
    }

    /// Build tracks from matches oriented from `image_id1` to `image_id2` of each pair.
    ///
    /// Pairs and matches are processed in sorted order, so the result does not
    /// depend on the input order. A match that would merge two observations of
    /// the same image into one track is rejected and counted.
    pub fn from_matches<'a>(pairs: impl IntoIterator<Item = (ImagePair, &'a [FeatureMatch])>) -> Self {
        let mut pairs = pairs.into_iter().collect::<Vec<_>>();
        pairs.sort_by_key(|(pair, _)| *pair);

        // dense node index = image offset + keypoint index
        let mut num_points: BTreeMap<ImageId, usize> = BTreeMap::new();
        for (pair, matches) in &pairs {
            for m in matches.iter() {
                let n1 = num_points.entry(pair.image_id1).or_default();
                *n1 = (*n1).max(m.point2d_idx1 as usize + 1);
                let n2 = num_points.entry(pair.image_id2).or_default();
                *n2 = (*n2).max(m.point2d_idx2 as usize + 1);
            }
        }
        let mut offsets = BTreeMap::new();
        let mut node_image = Vec::new();
        let mut total = 0usize;
        for (&image_id, &n) in &num_points {
            offsets.insert(image_id, total);
            node_image.extend(std::iter::repeat_n(image_id, n));
            total += n;
        }
        let node = |image_id: ImageId, idx: u32| offsets[&image_id] + idx as usize;

        let mut sets = DisjointSet::new(total);
        // images observed by the component of each root
        let mut members: Vec<BTreeSet<ImageId>> = node_image
            .iter()
            .map(|&image_id| BTreeSet::from([image_id]))
            .collect();
        let mut num_rejected_edges = 0usize;

        for (pair, matches) in &pairs {
            let mut sorted = matches.to_vec();
            sorted.sort();
            sorted.dedup();
            for m in sorted {
                let a = sets.find(node(pair.image_id1, m.point2d_idx1));
                let b = sets.find(node(pair.image_id2, m.point2d_idx2));
                if a == b {
                    continue;
                }
                let conflict = {
                    let (small, large) = if members[a].len() <= members[b].len() {
                        (&members[a], &members[b])
                    } else {
                        (&members[b], &members[a])
                    };
                    small.iter().any(|image_id| large.contains(image_id))
                };
                if conflict {
                    num_rejected_edges += 1;
                    continue;
                }
                let (root, absorbed) = sets.union_roots(a, b);
                let moved = std::mem::take(&mut members[absorbed]);
                members[root].extend(moved);
            }
        }

        let mut components: BTreeMap<usize, Vec<Observation>> = BTreeMap::new();
        for (image_id, &offset) in &offsets {
            for idx in 0..num_points[image_id] {
                let root = sets.find(offset + idx);
                if sets.size[root] < 2 {
                    continue;
                }
                components
                    .entry(root)
                    .or_default()
                    .push(Observation::new(*image_id, idx as u32));
            }
        }

        let mut observations = components.into_values().collect::<Vec<_>>();
        for obs in observations.iter_mut() {
            obs.sort();
        }
        observations.sort();

        let tracks = observations
            .into_iter()
            .enumerate()
            .map(|(i, observations)| Track {
                track_id: i as TrackId,
                observations,
            })
            .collect::<Vec<_>>();

        if num_rejected_edges > 0 {
            warn!("track building rejected {num_rejected_edges} conflicting matches");
        }
        info!("built {} tracks", tracks.len());
        Self::from_tracks(tracks, num_rejected_edges)
    }

    fn from_tracks(tracks: Vec<Track>, num_rejected_edges: usize) -> Self {
        let mut lookup = HashMap::new();
        let mut by_image: BTreeMap<ImageId, Vec<(u32, TrackId)>> = BTreeMap::new();
        for track in &tracks {
            for obs in &track.observations {
                lookup.insert(*obs, track.track_id);
                by_image
                    .entry(obs.image_id)
                    .or_default()
                    .push((obs.point2d_idx, track.track_id));
            }
        }
        for list in by_image.values_mut() {
            list.sort();
        }
        Self {
            tracks,
            lookup,
            by_image,
            num_rejected_edges,
        }
    }

    /// All tracks, ordered by id.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Track by id.
    pub fn get(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks.get(track_id as usize)
    }

    /// Track id of an observation.
    pub fn find(&self, observation: &Observation) -> Option<TrackId> {
        self.lookup.get(observation).copied()
    }

    /// `(keypoint index, track id)` of all tracked keypoints of an image.
    pub fn image_observations(&self, image_id: ImageId) -> &[(u32, TrackId)] {
        self.by_image.get(&image_id).map_or(&[], Vec::as_slice)
    }

    /// Number of tracks.
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Whether no track was built.
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Number of matches dropped because they linked two keypoints of one image.
    pub fn num_rejected_edges(&self) -> usize {
        self.num_rejected_edges
    }
}
