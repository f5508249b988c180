#![allow(dead_code)]

use std::collections::BTreeMap;

use glam::{DQuat, DVec2, DVec3};
use kornia_sfm::features::{Descriptor, FeatureStore, ImageFeatures, Keypoint, MatchingOptions};
use kornia_sfm::geometry::TwoViewGeometryOptions;
use kornia_sfm::mapper::MappingInputs;
use kornia_sfm::tracks::TrackSet;
use kornia_sfm::types::{CameraId, ImageId, ImageInfo};
use kornia_sfm::view_graph::{candidate_pairs, PairingMode, ViewGraph, ViewInput};
use kornia_sfm::{Camera, CameraModelId, Rigid3};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;

/// Synthetic views of a random point cloud seen by cameras on a line.
pub struct Scene {
    pub cameras: BTreeMap<CameraId, Camera>,
    pub images: BTreeMap<ImageId, ImageInfo>,
    pub features: FeatureStore,
    pub points: Vec<DVec3>,
    pub poses: BTreeMap<ImageId, Rigid3>,
    // scene point of every keypoint, `None` for clutter
    pub keypoint_points: BTreeMap<ImageId, Vec<Option<usize>>>,
    pub view_graph: ViewGraph,
    pub tracks: TrackSet,
}

impl Scene {
    pub fn inputs(&self) -> MappingInputs<'_> {
        MappingInputs {
            cameras: &self.cameras,
            images: &self.images,
            features: &self.features,
            view_graph: &self.view_graph,
            tracks: &self.tracks,
        }
    }
}

pub fn camera() -> Camera {
    Camera::new(1, CameraModelId::Pinhole, WIDTH, HEIGHT, vec![500.0, 500.0, 320.0, 240.0])
        .expect("valid camera")
}

/// Camera `k` sits at `x = k - 2` and looks along `+z` with a small yaw.
pub fn pose(k: usize) -> Rigid3 {
    let center = DVec3::new(k as f64 - 2.0, 0.05 * (k as f64).sin(), 0.0);
    let rotation = DQuat::from_rotation_y(0.02 * (k as f64 - 2.0));
    Rigid3::new(rotation, -(rotation * center))
}

fn random_descriptor(rng: &mut StdRng) -> Descriptor {
    let mut d = [0u8; 32];
    for b in d.iter_mut() {
        *b = rng.random::<u8>();
    }
    d
}

/// Build a scene with `num_images` cameras and `num_points` points.
///
/// `extra` lists additional images given as the scene point indices they
/// observe; they are placed at the pose of camera 2.
pub fn scene(num_images: usize, num_points: usize, extra: &[Vec<usize>]) -> Scene {
    let mut rng = StdRng::seed_from_u64(7);
    let camera = camera();
    let points = (0..num_points)
        .map(|_| {
            DVec3::new(
                rng.random_range(-2.5..2.5),
                rng.random_range(-2.0..2.0),
                rng.random_range(8.0..12.0),
            )
        })
        .collect::<Vec<_>>();
    let descriptors = (0..num_points)
        .map(|_| random_descriptor(&mut rng))
        .collect::<Vec<_>>();

    let mut views: Vec<(Rigid3, Vec<usize>)> = Vec::new();
    for k in 0..num_images {
        let pose = pose(k);
        let visible = (0..num_points)
            .filter(|&i| {
                camera
                    .project(pose.transform_point(points[i]))
                    .is_some_and(|uv| uv.x >= 0.0 && uv.y >= 0.0 && uv.x < WIDTH as f64 && uv.y < HEIGHT as f64)
            })
            .collect();
        views.push((pose, visible));
    }
    for observed in extra {
        views.push((pose(2), observed.clone()));
    }

    let mut cameras = BTreeMap::new();
    cameras.insert(1, camera.clone());
    let mut images = BTreeMap::new();
    let mut features = FeatureStore::new();
    let mut poses = BTreeMap::new();
    let mut keypoint_points = BTreeMap::new();

    for (image_id, (pose, visible)) in (1..).zip(views) {
        let mut entries = visible.into_iter().map(Some).collect::<Vec<_>>();
        // clutter without a scene point
        entries.extend((0..10).map(|_| None));
        // keypoint order unrelated to point order
        for i in (1..entries.len()).rev() {
            let j = rng.random_range(0..=i);
            entries.swap(i, j);
        }

        let mut image_features = ImageFeatures::default();
        for entry in &entries {
            let (uv, descriptor) = match entry {
                Some(i) => {
                    let uv = camera
                        .project(pose.transform_point(points[*i]))
                        .unwrap_or(DVec2::ZERO);
                    (uv, descriptors[*i])
                }
                None => (
                    DVec2::new(
                        rng.random_range(0.0..WIDTH as f64),
                        rng.random_range(0.0..HEIGHT as f64),
                    ),
                    random_descriptor(&mut rng),
                ),
            };
            image_features.keypoints.push(Keypoint {
                x: uv.x as f32,
                y: uv.y as f32,
                scale: 1.0,
                orientation: 0.0,
                response: 1.0,
                intensity: rng.random::<u8>(),
            });
            image_features.descriptors.push(descriptor);
        }

        images.insert(
            image_id,
            ImageInfo {
                image_id,
                name: format!("image_{image_id:03}.png"),
                camera_id: 1,
            },
        );
        features.insert(image_id, image_features);
        poses.insert(image_id, pose);
        keypoint_points.insert(image_id, entries);
    }

    let view_graph = verify_all(&cameras, &images, &features);
    let tracks = TrackSet::from_view_graph(&view_graph);
    Scene {
        cameras,
        images,
        features,
        points,
        poses,
        keypoint_points,
        view_graph,
        tracks,
    }
}

/// Mapper inputs assembled from copies of scene images.
pub struct Parts {
    pub cameras: BTreeMap<CameraId, Camera>,
    pub images: BTreeMap<ImageId, ImageInfo>,
    pub features: FeatureStore,
    pub view_graph: ViewGraph,
    pub tracks: TrackSet,
}

impl Parts {
    pub fn inputs(&self) -> MappingInputs<'_> {
        MappingInputs {
            cameras: &self.cameras,
            images: &self.images,
            features: &self.features,
            view_graph: &self.view_graph,
            tracks: &self.tracks,
        }
    }
}

/// Disconnected copies of scene images, each part given as the source image
/// ids and the offset added to them. Pairs are only kept inside a part.
pub fn disjoint_parts(scene: &Scene, parts: &[(&[ImageId], ImageId)]) -> Parts {
    let mut images = BTreeMap::new();
    let mut features = FeatureStore::new();
    let mut view_graph = ViewGraph::new();
    for &(ids, offset) in parts {
        for id in ids {
            let image_id = id + offset;
            images.insert(
                image_id,
                ImageInfo {
                    image_id,
                    name: format!("image_{image_id:03}.png"),
                    camera_id: 1,
                },
            );
            if let Some(f) = scene.features.get(*id) {
                features.insert(image_id, f.clone());
            }
        }
        for (pair, geometry) in scene.view_graph.iter() {
            if ids.contains(&pair.image_id1) && ids.contains(&pair.image_id2) {
                view_graph.insert(pair.image_id1 + offset, pair.image_id2 + offset, geometry.clone());
            }
        }
    }
    let tracks = TrackSet::from_view_graph(&view_graph);
    Parts {
        cameras: scene.cameras.clone(),
        images,
        features,
        view_graph,
        tracks,
    }
}

pub fn verify_all(
    cameras: &BTreeMap<CameraId, Camera>,
    images: &BTreeMap<ImageId, ImageInfo>,
    features: &FeatureStore,
) -> ViewGraph {
    let mut views = BTreeMap::new();
    for (image_id, info) in images {
        let (Some(camera), Some(f)) = (cameras.get(&info.camera_id), features.get(*image_id)) else {
            continue;
        };
        views.insert(
            *image_id,
            ViewInput {
                image_id: *image_id,
                camera,
                features: f,
            },
        );
    }
    let ids = views.keys().copied().collect::<Vec<_>>();
    ViewGraph::build(
        &views,
        &candidate_pairs(&ids, PairingMode::Exhaustive),
        &MatchingOptions::default(),
        &TwoViewGeometryOptions::default(),
        |_| None,
    )
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
