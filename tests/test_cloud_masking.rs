use chrono::{DateTime, Utc};
use ndarray::Array2;

use soilsense::core::cloud_mask::{and_masks, CloudMaskEngine, CloudMaskParams, ShadowParams};
use soilsense::{BandMapping, Raster, Roi, Scene, SceneMetadata, SceneStack};
use soilsense::types::GeoTransform;

fn transform() -> GeoTransform {
    // ~11m pixels at the equator
    GeoTransform::new(0.0, 0.0, 0.0001, -0.0001)
}

fn scene_with_bands(id: &str, bands: Vec<(&str, Array2<f32>)>, metadata: SceneMetadata) -> Scene {
    let (rows, cols) = bands[0].1.dim();
    let mut raster = Raster::new(transform(), rows, cols);
    for (name, grid) in bands {
        raster.add_band(name, grid).unwrap();
    }
    Scene {
        id: id.to_string(),
        timestamp: DateTime::parse_from_rfc3339("2025-06-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
        raster,
        metadata,
    }
}

fn probability_scene(id: &str, prob: Array2<f32>) -> Scene {
    scene_with_bands(id, vec![("probability", prob)], SceneMetadata::default())
}

#[test]
fn test_comprehensive_mask_is_and_of_probability_and_scl() {
    // 2x2: pixel (0,0) clear everywhere, (0,1) cloudy by probability only,
    // (1,0) cloudy by SCL only, (1,1) cloudy by both
    let prob = Array2::from_shape_vec((2, 2), vec![10.0, 80.0, 10.0, 80.0]).unwrap();
    let scl = Array2::from_shape_vec((2, 2), vec![4.0, 4.0, 9.0, 9.0]).unwrap();
    let reflectance = Array2::from_elem((2, 2), 5000.0);

    let scene = scene_with_bands(
        "s1",
        vec![
            ("B8", reflectance.clone()),
            ("SCL", scl),
        ],
        SceneMetadata::default(),
    );
    let stack = SceneStack::new(vec![scene.clone()]);
    let prob_stack = SceneStack::new(vec![probability_scene("s1", prob.clone())]);

    let params = CloudMaskParams {
        mask_shadows: false,
        ..CloudMaskParams::default()
    };
    let engine = CloudMaskEngine::new(params, BandMapping::default());
    let masked = engine.apply_comprehensive_mask(&stack, &prob_stack).unwrap();
    assert_eq!(masked.len(), 1);

    // Independently compute both component masks and AND them
    let mut joined = scene;
    joined.raster.add_band("probability", prob).unwrap();
    let prob_mask = engine.classify_by_probability(&joined, 40.0).unwrap();
    let scl_mask = engine.classify_by_scene_classification(&joined).unwrap();
    let expected = and_masks(&prob_mask, &scl_mask);

    let b8 = masked.scenes()[0].raster.band("B8").unwrap();
    for row in 0..2 {
        for col in 0..2 {
            assert_eq!(
                !b8[(row, col)].is_nan(),
                expected[(row, col)],
                "pixel ({row},{col})"
            );
        }
    }
    // Only (0,0) survives
    assert!(!b8[(0, 0)].is_nan());
    assert!(b8[(0, 1)].is_nan());
    assert!(b8[(1, 0)].is_nan());
    assert!(b8[(1, 1)].is_nan());
}

#[test]
fn test_scene_without_probability_partner_is_dropped() {
    let reflectance = Array2::from_elem((2, 2), 5000.0);
    let scl = Array2::from_elem((2, 2), 4.0);
    let s1 = scene_with_bands(
        "with-prob",
        vec![("B8", reflectance.clone()), ("SCL", scl.clone())],
        SceneMetadata::default(),
    );
    let s2 = scene_with_bands(
        "orphan",
        vec![("B8", reflectance), ("SCL", scl)],
        SceneMetadata::default(),
    );
    let stack = SceneStack::new(vec![s1, s2]);
    let prob_stack = SceneStack::new(vec![probability_scene(
        "with-prob",
        Array2::from_elem((2, 2), 0.0),
    )]);

    let params = CloudMaskParams {
        mask_shadows: false,
        ..CloudMaskParams::default()
    };
    let engine = CloudMaskEngine::new(params, BandMapping::default());
    let masked = engine.apply_comprehensive_mask(&stack, &prob_stack).unwrap();
    assert_eq!(masked.len(), 1);
    assert_eq!(masked.scenes()[0].id, "with-prob");
}

#[test]
fn test_shadow_projection_east_of_cloud() {
    // Sun due north at 45 degrees zenith: shadow azimuth 90, cast eastward
    let rows = 5;
    let cols = 5;
    let mut prob = Array2::from_elem((rows, cols), 0.0f32);
    prob[(2, 0)] = 80.0; // one cloud on the western edge of row 2
    let mut nir = Array2::from_elem((rows, cols), 5000.0f32);
    nir[(2, 2)] = 500.0; // dark pixel east of the cloud
    nir[(0, 4)] = 500.0; // dark pixel in a cloud-free row

    let metadata = SceneMetadata {
        cloud_percent: 5.0,
        solar_azimuth_deg: 0.0,
        solar_zenith_deg: 45.0,
    };
    let scene = scene_with_bands("s1", vec![("B8", nir), ("probability", prob)], metadata);

    let params = CloudMaskParams {
        shadow: ShadowParams::default(),
        ..CloudMaskParams::default()
    };
    let engine = CloudMaskEngine::new(params, BandMapping::default());
    let valid = engine.classify_shadows(&scene).unwrap();

    assert!(!valid[(2, 0)], "cloud pixel must be invalid");
    assert!(!valid[(2, 2)], "dark pixel inside the projection is shadow");
    assert!(valid[(0, 4)], "dark pixel with no upstream cloud stays valid");
    assert!(valid[(4, 4)], "bright pixel stays valid");
}

#[test]
fn test_zero_zenith_casts_no_shadow() {
    let mut prob = Array2::from_elem((3, 3), 0.0f32);
    prob[(1, 0)] = 90.0;
    let nir = Array2::from_elem((3, 3), 500.0f32); // everything dark

    let metadata = SceneMetadata {
        cloud_percent: 0.0,
        solar_azimuth_deg: 0.0,
        solar_zenith_deg: 0.0,
    };
    let scene = scene_with_bands("s1", vec![("B8", nir), ("probability", prob)], metadata);
    let engine = CloudMaskEngine::default();
    let valid = engine.classify_shadows(&scene).unwrap();

    // Only the cloud itself is masked; the projection distance is zero
    assert!(!valid[(1, 0)]);
    assert!(valid[(1, 1)]);
    assert!(valid[(2, 2)]);
}

#[test]
fn test_filter_by_clear_pixels() {
    let roi = Roi::bounding_box(-0.01, -0.01, 0.01, 0.01).unwrap();
    let clear = scene_with_bands(
        "clear",
        vec![("B8", Array2::from_elem((4, 4), 4000.0))],
        SceneMetadata::default(),
    );
    let mut half_masked_grid = Array2::from_elem((4, 4), 4000.0f32);
    for col in 0..4 {
        for row in 0..3 {
            half_masked_grid[(row, col)] = f32::NAN;
        }
    }
    let mostly_masked = scene_with_bands(
        "masked",
        vec![("B8", half_masked_grid)],
        SceneMetadata::default(),
    );

    let engine = CloudMaskEngine::default();
    let stack = SceneStack::new(vec![clear, mostly_masked]);
    let filtered = engine.filter_by_clear_pixels(stack, &roi, 50.0, 10.0);
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered.scenes()[0].id, "clear");
}
