mod common;

use std::collections::BTreeSet;

use approx::assert_relative_eq;
use kornia_sfm::bundle_adjustment::{BundleAdjuster, BundleAdjustmentConfig, BundleAdjustmentOptions};
use kornia_sfm::features::{FeatureMatch, FeatureStore};
use kornia_sfm::mapper::{reconstruct, MapperError, MappingInputs};
use kornia_sfm::reconstruction::Reconstruction;
use kornia_sfm::tracks::TrackSet;
use kornia_sfm::view_graph::{ImagePair, ViewGraph};
use kornia_sfm::{IncrementalMapper, MapperOptions, MapperState};
use rand::{rngs::StdRng, Rng, SeedableRng};

// Distances between camera centers agree with the ground truth up to scale.
fn assert_similar_centers(rec: &Reconstruction, scene: &common::Scene) -> Result<(), Box<dyn std::error::Error>> {
    let ids = rec.registered_image_ids().to_vec();
    let mut ratios = Vec::new();
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            let estimated = rec.image(*a)?.pose.center().distance(rec.image(*b)?.pose.center());
            let expected = scene.poses[a].center().distance(scene.poses[b].center());
            ratios.push(estimated / expected);
        }
    }
    let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
    for ratio in ratios {
        assert_relative_eq!(ratio, mean, max_relative = 1e-2);
    }
    Ok(())
}

#[test]
fn test_state_machine_transitions() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let scene = common::scene(5, 300, &[]);
    let mut mapper = IncrementalMapper::new(scene.inputs(), MapperOptions::default(), BTreeSet::new());
    assert_eq!(mapper.state(), MapperState::Empty);

    assert_eq!(mapper.step(), MapperState::Seeded);
    assert_eq!(mapper.reconstruction().num_registered_images(), 2);
    assert!(mapper.reconstruction().num_points3d() >= 30);

    assert_eq!(mapper.step(), MapperState::Growing);
    assert_eq!(mapper.reconstruction().num_registered_images(), 3);

    assert_eq!(mapper.run(), MapperState::Converged);
    assert_eq!(mapper.step(), MapperState::Converged);
    assert!(!mapper.is_partial());

    let rec = mapper.reconstruction();
    assert_eq!(rec.num_registered_images(), 5);
    let stats = rec.stats();
    assert!(stats.num_points3d > 200);
    assert!(stats.mean_reprojection_error < 0.5);
    assert_similar_centers(rec, &scene)?;
    Ok(())
}

#[test]
fn test_observations_refer_to_one_scene_point() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let scene = common::scene(5, 300, &[]);
    let report = reconstruct(scene.inputs(), &MapperOptions::default())?;
    assert_eq!(report.models.len(), 1);
    assert!(!report.partial);

    let rec = &report.models[0];
    for point in rec.points3d().values() {
        assert!(point.track.len() >= 2);
        let scene_points = point
            .track
            .iter()
            .map(|obs| scene.keypoint_points[&obs.image_id][obs.point2d_idx as usize])
            .collect::<BTreeSet<_>>();
        assert_eq!(scene_points.len(), 1);
        assert!(scene_points.iter().all(Option::is_some));
    }
    for image in rec.images().values() {
        for (idx, p) in image.points2d.iter().enumerate() {
            if let Some(point3d_id) = p.point3d_id {
                let track = &rec.point3d(point3d_id)?.track;
                assert!(track.iter().any(|o| o.image_id == image.image_id && o.point2d_idx as usize == idx));
            }
        }
    }
    Ok(())
}

#[test]
fn test_weakly_connected_image_does_not_block_convergence() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let base = common::scene(5, 300, &[]);
    // twelve points seen by camera 2, too few to verify any pair
    let observed = base.keypoint_points[&3]
        .iter()
        .flatten()
        .copied()
        .take(12)
        .collect::<Vec<_>>();
    let scene = common::scene(5, 300, &[observed]);
    assert_eq!(scene.images.len(), 6);
    assert!(scene.tracks.image_observations(6).is_empty());

    let mut mapper = IncrementalMapper::new(scene.inputs(), MapperOptions::default(), BTreeSet::new());
    assert_eq!(mapper.run(), MapperState::Converged);
    assert_eq!(mapper.reconstruction().num_registered_images(), 5);
    assert!(!mapper.reconstruction().is_registered(6));
    assert!(!mapper.failed_images().contains(&1));

    let report = reconstruct(scene.inputs(), &MapperOptions::default())?;
    assert_eq!(report.models.len(), 1);
    assert!(!report.partial);
    Ok(())
}

#[test]
fn test_disconnected_components_give_ranked_models() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let scene = common::scene(5, 300, &[]);
    // a two image copy takes the lower ids, a full copy sits at 11..=15
    let (small, full): (&[u32], &[u32]) = (&[1, 2], &[1, 2, 3, 4, 5]);
    let dataset = common::disjoint_parts(&scene, &[(small, 0), (full, 10)]);
    assert_eq!(dataset.images.len(), 7);

    let report = reconstruct(dataset.inputs(), &MapperOptions::default())?;
    assert!(!report.partial);
    assert_eq!(report.models.len(), 2);
    assert_eq!(report.models[0].registered_image_ids().len(), 5);
    assert_eq!(report.models[1].registered_image_ids().len(), 2);
    assert!(report.models[0].registered_image_ids().iter().all(|id| *id > 10));
    let mut second = report.models[1].registered_image_ids().to_vec();
    second.sort();
    assert_eq!(second, vec![1, 2]);

    let options = MapperOptions {
        min_model_size: 3,
        ..Default::default()
    };
    let report = reconstruct(dataset.inputs(), &options)?;
    assert_eq!(report.models.len(), 1);
    assert_eq!(report.models[0].num_registered_images(), 5);

    let options = MapperOptions {
        multiple_models: false,
        ..Default::default()
    };
    assert_eq!(reconstruct(dataset.inputs(), &options)?.models.len(), 1);
    Ok(())
}

#[test]
fn test_image_with_few_correspondences_is_never_a_candidate() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let base = common::scene(5, 300, &[]);
    let observed = base.keypoint_points[&3]
        .iter()
        .flatten()
        .copied()
        .take(8)
        .collect::<Vec<_>>();
    let scene = common::scene(5, 300, &[observed]);
    assert!(scene.tracks.image_observations(6).is_empty());

    // link the eight shared keypoints of images 3 and 6 by hand
    let index_in = |image_id: u32, point: usize| {
        scene.keypoint_points[&image_id]
            .iter()
            .position(|p| *p == Some(point))
            .map(|idx| idx as u32)
    };
    let matches = scene.keypoint_points[&6]
        .iter()
        .enumerate()
        .filter_map(|(idx6, point)| Some(FeatureMatch::new(index_in(3, (*point)?)?, idx6 as u32)))
        .collect::<Vec<_>>();
    assert_eq!(matches.len(), 8);
    let mut geometry = scene
        .view_graph
        .get(&ImagePair::new(1, 3))
        .ok_or("pair (1, 3) not verified")?
        .clone();
    geometry.inlier_matches = matches;
    let mut view_graph = scene.view_graph.clone();
    view_graph.insert(3, 6, geometry);
    let tracks = TrackSet::from_view_graph(&view_graph);
    assert_eq!(tracks.image_observations(6).len(), 8);

    let inputs = MappingInputs {
        view_graph: &view_graph,
        tracks: &tracks,
        ..scene.inputs()
    };
    let mut mapper = IncrementalMapper::new(inputs, MapperOptions::default(), BTreeSet::new());
    while !matches!(mapper.step(), MapperState::Converged | MapperState::Failed) {
        assert!(mapper.next_images().iter().all(|(id, _)| *id != 6));
    }
    assert_eq!(mapper.state(), MapperState::Converged);
    assert_eq!(mapper.reconstruction().num_registered_images(), 5);
    assert!(!mapper.reconstruction().is_registered(6));
    assert!(!mapper.failed_images().contains(&6));
    Ok(())
}

#[test]
fn test_unestimable_pose_ends_in_failed_images() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let base = common::scene(5, 300, &[]);
    let observed = base.keypoint_points[&3]
        .iter()
        .flatten()
        .copied()
        .take(60)
        .collect::<Vec<_>>();
    let scene = common::scene(5, 300, &[observed]);
    assert!(scene.tracks.image_observations(6).len() >= 15);

    // keep the tracks but scatter the keypoints of image 6
    let mut rng = StdRng::seed_from_u64(3);
    let mut features = FeatureStore::new();
    for (image_id, f) in scene.features.iter() {
        let mut f = f.clone();
        if image_id == 6 {
            for kp in f.keypoints.iter_mut() {
                kp.x = rng.random_range(0.0..common::WIDTH as f32);
                kp.y = rng.random_range(0.0..common::HEIGHT as f32);
            }
        }
        features.insert(image_id, f);
    }
    let inputs = MappingInputs {
        features: &features,
        ..scene.inputs()
    };

    let mut mapper = IncrementalMapper::new(inputs, MapperOptions::default(), BTreeSet::new());
    assert_eq!(mapper.run(), MapperState::Converged);
    assert_eq!(mapper.reconstruction().num_registered_images(), 5);
    assert!(!mapper.reconstruction().is_registered(6));
    assert!(mapper.failed_images().contains(&6));
    assert!(mapper.next_images().is_empty());
    Ok(())
}

#[test]
fn test_no_verified_pairs_fails() {
    common::init_logger();
    let scene = common::scene(3, 100, &[]);
    let view_graph = ViewGraph::new();
    let tracks = TrackSet::from_view_graph(&view_graph);
    let inputs = MappingInputs {
        view_graph: &view_graph,
        tracks: &tracks,
        ..scene.inputs()
    };
    let mut mapper = IncrementalMapper::new(inputs, MapperOptions::default(), BTreeSet::new());
    assert_eq!(mapper.run(), MapperState::Failed);
    assert!(matches!(
        reconstruct(inputs, &MapperOptions::default()),
        Err(MapperError::NoInitialPair)
    ));
}

#[test]
fn test_step_budget_gives_partial_model() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let scene = common::scene(5, 300, &[]);
    let options = MapperOptions {
        max_registration_steps: 1,
        ..Default::default()
    };
    let report = reconstruct(scene.inputs(), &options)?;
    assert!(report.partial);
    assert_eq!(report.models.len(), 1);
    assert_eq!(report.models[0].num_registered_images(), 3);
    Ok(())
}

#[test]
fn test_tracks_are_deterministic_and_consistent() {
    let scene = common::scene(5, 300, &[]);
    let again = TrackSet::from_view_graph(&scene.view_graph);
    assert_eq!(again.tracks(), scene.tracks.tracks());
    assert_eq!(scene.tracks.num_rejected_edges(), 0);

    for track in scene.tracks.tracks() {
        let images = track.observations.iter().map(|o| o.image_id).collect::<BTreeSet<_>>();
        assert_eq!(images.len(), track.len());
        let points = track
            .observations
            .iter()
            .map(|o| scene.keypoint_points[&o.image_id][o.point2d_idx as usize])
            .collect::<BTreeSet<_>>();
        assert_eq!(points.len(), 1);
    }
}

#[test]
fn test_global_adjustment_reduces_cost() -> Result<(), Box<dyn std::error::Error>> {
    common::init_logger();
    let scene = common::scene(5, 300, &[]);
    let report = reconstruct(scene.inputs(), &MapperOptions::default())?;
    let model = &report.models[0];

    // shift every point so the adjustment has work to do
    let points = model.points3d().iter().enumerate().map(|(i, (id, p))| {
        let mut p = p.clone();
        let s = if i % 2 == 0 { 0.01 } else { -0.01 };
        p.xyz += glam::DVec3::new(s, -s, 2.0 * s);
        (*id, p)
    });
    let mut perturbed = Reconstruction::from_parts(
        model.cameras().values().cloned(),
        model.images().values().cloned(),
        points,
        model.registered_image_ids().to_vec(),
    )?;

    let mut config = BundleAdjustmentConfig::from_images(perturbed.registered_image_ids().iter().copied());
    config.fix_gauge(&perturbed);
    let summary = BundleAdjuster::new(BundleAdjustmentOptions::default()).solve(&mut perturbed, &config)?;
    assert!(summary.final_cost <= summary.initial_cost);
    assert!(summary.final_cost < 1e-2 * summary.initial_cost);
    assert!(perturbed.stats().mean_reprojection_error < 0.5);
    Ok(())
}
