//! Cloud and shadow masking.
//!
//! Classifies pixels as clear/cloud/shadow per scene and applies the
//! resulting validity masks. Mask quality is a correctness precondition
//! for compositing, so a missing required band is fatal for the run.

use ndarray::{Array2, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::BandMapping;
use crate::core::sample_stride;
use crate::types::{
    PixelValue, Roi, Scene, SceneStack, SoilResult, ValidityMask, REFLECTANCE_SCALE,
};

/// Quality band bit flagging opaque clouds
pub const QA_CLOUD_BIT: u32 = 10;

/// Quality band bit flagging cirrus
pub const QA_CIRRUS_BIT: u32 = 11;

/// Scene classification values masked out: cloud shadow, cloud medium
/// probability, cloud high probability, thin cirrus
pub const SCL_MASKED_CLASSES: [u8; 4] = [3, 8, 9, 10];

/// Cloud shadow projection parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShadowParams {
    /// Probability above which a pixel counts as cloud for projection
    pub cloud_prob_threshold: PixelValue,
    /// NIR reflectance (0-1 physical scale) below which a pixel is dark
    pub nir_dark_threshold: PixelValue,
    /// Maximum distance to search for shadows, in meters
    pub max_search_distance_m: f64,
    /// Assumed cloud height for the projection, in meters
    pub cloud_height_m: f64,
}

impl Default for ShadowParams {
    fn default() -> Self {
        Self {
            cloud_prob_threshold: 40.0,
            nir_dark_threshold: 0.15,
            max_search_distance_m: 1000.0,
            cloud_height_m: 1000.0,
        }
    }
}

/// Cloud masking parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudMaskParams {
    /// Cloud probability threshold (0-100); pixels at or above are masked
    pub probability_threshold: PixelValue,
    /// Also apply the scene classification mask as an independent filter
    pub apply_scl: bool,
    /// Also project and mask cloud shadows
    pub mask_shadows: bool,
    pub shadow: ShadowParams,
}

impl Default for CloudMaskParams {
    fn default() -> Self {
        Self {
            probability_threshold: 40.0,
            apply_scl: true,
            mask_shadows: true,
            shadow: ShadowParams::default(),
        }
    }
}

/// Logical AND of two validity masks
pub fn and_masks(a: &ValidityMask, b: &ValidityMask) -> ValidityMask {
    Zip::from(a).and(b).map_collect(|&x, &y| x && y)
}

/// Per-scene cloud/shadow classification and stack masking
#[derive(Debug, Clone, Default)]
pub struct CloudMaskEngine {
    params: CloudMaskParams,
    bands: BandMapping,
}

impl CloudMaskEngine {
    pub fn new(params: CloudMaskParams, bands: BandMapping) -> Self {
        Self { params, bands }
    }

    pub fn params(&self) -> &CloudMaskParams {
        &self.params
    }

    /// Classify by embedded quality-flag bits.
    ///
    /// A pixel is valid iff both the cloud and cirrus bits are unset.
    /// Least accurate method, but needs no joined probability data.
    pub fn classify_by_quality_flags(&self, scene: &Scene) -> SoilResult<ValidityMask> {
        let qa = scene.raster.band(&self.bands.qa)?;
        let cloud_bit = 1u32 << QA_CLOUD_BIT;
        let cirrus_bit = 1u32 << QA_CIRRUS_BIT;
        Ok(qa.mapv(|v| {
            if v.is_nan() {
                return false;
            }
            let flags = v as u32;
            flags & cloud_bit == 0 && flags & cirrus_bit == 0
        }))
    }

    /// Classify by the categorical scene classification band.
    ///
    /// A pixel is valid iff its class is not cloud shadow, medium/high
    /// cloud probability, or thin cirrus.
    pub fn classify_by_scene_classification(&self, scene: &Scene) -> SoilResult<ValidityMask> {
        let scl = scene.raster.band(&self.bands.scl)?;
        Ok(scl.mapv(|v| {
            if v.is_nan() {
                return false;
            }
            let class = v as u8;
            !SCL_MASKED_CLASSES.contains(&class)
        }))
    }

    /// Classify by joined per-pixel cloud probability.
    ///
    /// A pixel is valid iff probability is strictly below the threshold
    /// (0-100). NaN probability is invalid.
    pub fn classify_by_probability(
        &self,
        scene: &Scene,
        threshold: PixelValue,
    ) -> SoilResult<ValidityMask> {
        let prob = scene.raster.band(&self.bands.probability)?;
        Ok(prob.mapv(|p| p < threshold))
    }

    /// Classify cloud shadows by projecting the cloud mask along the
    /// shadow azimuth.
    ///
    /// Clouds are pixels above the shadow cloud-probability threshold;
    /// dark pixels have NIR below the dark threshold (scaled to the
    /// 0-10000 range). The cloud mask is swept in pixel steps along
    /// shadow azimuth = 90° − solar azimuth for a distance of
    /// tan(zenith)·cloud_height, clipped to the search distance. A pixel
    /// is shadow iff it is dark AND inside the projected footprint; the
    /// returned validity excludes both clouds and shadows.
    pub fn classify_shadows(&self, scene: &Scene) -> SoilResult<ValidityMask> {
        let shadow = &self.params.shadow;
        let prob = scene.raster.band(&self.bands.probability)?;
        let nir = scene.raster.band(&self.bands.nir)?;
        let (rows, cols) = scene.raster.dims();

        let is_cloud: ValidityMask = prob.mapv(|p| p > shadow.cloud_prob_threshold);
        let dark_threshold = shadow.nir_dark_threshold * REFLECTANCE_SCALE;
        let is_dark: ValidityMask = nir.mapv(|v| v < dark_threshold);

        let shadow_azimuth_deg = 90.0 - scene.metadata.solar_azimuth_deg;
        let zenith_rad = scene.metadata.solar_zenith_deg.to_radians();
        let distance_m = (zenith_rad.tan() * shadow.cloud_height_m)
            .clamp(0.0, shadow.max_search_distance_m);

        let (px_w_m, px_h_m) = scene.raster.transform().pixel_size_meters();
        let step_m = px_w_m.min(px_h_m).max(1e-6);
        let n_steps = (distance_m / step_m).ceil() as i64;

        // Unit step along the shadow azimuth (clockwise from north) in
        // pixel coordinates; north is negative row
        let az_rad = (shadow_azimuth_deg as f64).to_radians();
        let dcol_px = az_rad.sin() * step_m / px_w_m;
        let drow_px = -az_rad.cos() * step_m / px_h_m;

        let mut projected = Array2::from_elem((rows, cols), false);
        for k in 1..=n_steps {
            let off_r = (k as f64 * drow_px).round() as i64;
            let off_c = (k as f64 * dcol_px).round() as i64;
            for row in 0..rows as i64 {
                let src_r = row - off_r;
                if src_r < 0 || src_r >= rows as i64 {
                    continue;
                }
                for col in 0..cols as i64 {
                    let src_c = col - off_c;
                    if src_c < 0 || src_c >= cols as i64 {
                        continue;
                    }
                    if is_cloud[(src_r as usize, src_c as usize)] {
                        projected[(row as usize, col as usize)] = true;
                    }
                }
            }
        }

        let is_shadow = and_masks(&is_dark, &projected);
        Ok(Zip::from(&is_cloud)
            .and(&is_shadow)
            .map_collect(|&cloud, &shad| !cloud && !shad))
    }

    /// Join probability scenes onto the stack by acquisition identity and
    /// apply the combined probability/classification/shadow masks.
    ///
    /// Scenes with no matching probability acquisition are dropped from
    /// the masked stack, never passed through unmasked.
    pub fn apply_comprehensive_mask(
        &self,
        stack: &SceneStack,
        probability: &SceneStack,
    ) -> SoilResult<SceneStack> {
        let prob_by_id: HashMap<&str, &Scene> =
            probability.iter().map(|s| (s.id.as_str(), s)).collect();

        let masked: SoilResult<Vec<Option<Scene>>> = stack
            .scenes()
            .par_iter()
            .map(|scene| {
                let Some(prob_scene) = prob_by_id.get(scene.id.as_str()) else {
                    log::warn!(
                        "no cloud probability scene for acquisition '{}', dropping it",
                        scene.id
                    );
                    return Ok(None);
                };
                let prob_grid = prob_scene.raster.band(&self.bands.probability)?.clone();
                let mut joined = scene.clone();
                joined
                    .raster
                    .add_band(self.bands.probability.clone(), prob_grid)?;

                let mut mask =
                    self.classify_by_probability(&joined, self.params.probability_threshold)?;
                if self.params.apply_scl {
                    mask = and_masks(&mask, &self.classify_by_scene_classification(&joined)?);
                }
                if self.params.mask_shadows {
                    mask = and_masks(&mask, &self.classify_shadows(&joined)?);
                }
                joined.raster.update_mask(&mask)?;
                Ok(Some(joined))
            })
            .collect();

        let scenes: Vec<Scene> = masked?.into_iter().flatten().collect();
        log::info!(
            "applied cloud masking (threshold: {}%): {} of {} scenes retained",
            self.params.probability_threshold,
            scenes.len(),
            stack.len()
        );
        Ok(SceneStack::new(scenes))
    }

    /// Percentage of unmasked pixels within the ROI for a masked scene.
    ///
    /// Counts validity on the first band in name order, matching the
    /// convention that masking NaNs every band identically.
    pub fn clear_pixel_percentage(&self, scene: &Scene, roi: &Roi, scale_m: f64) -> f64 {
        let names = scene.raster.band_names();
        let Some(first) = names.first() else {
            return 0.0;
        };
        let grid = scene
            .raster
            .band_opt(first)
            .expect("band listed by name exists");
        let (rows, cols) = scene.raster.dims();
        let stride = sample_stride(scene.raster.transform(), scale_m);
        let mut total = 0u64;
        let mut valid = 0u64;
        for row in (0..rows).step_by(stride) {
            for col in (0..cols).step_by(stride) {
                let (lon, lat) = scene.raster.transform().pixel_center(row, col);
                if !roi.contains(lon, lat) {
                    continue;
                }
                total += 1;
                if !grid[(row, col)].is_nan() {
                    valid += 1;
                }
            }
        }
        if total == 0 {
            return 0.0;
        }
        valid as f64 / total as f64 * 100.0
    }

    /// Retain only scenes with at least `min_clear_percent` unmasked
    /// pixels inside the ROI
    pub fn filter_by_clear_pixels(
        &self,
        stack: SceneStack,
        roi: &Roi,
        min_clear_percent: f64,
        scale_m: f64,
    ) -> SceneStack {
        let before = stack.len();
        let scenes: Vec<Scene> = stack
            .into_scenes()
            .into_iter()
            .filter(|scene| {
                let pct = self.clear_pixel_percentage(scene, roi, scale_m);
                if pct < min_clear_percent {
                    log::debug!(
                        "scene '{}' below clear-pixel threshold ({:.1}% < {:.1}%)",
                        scene.id,
                        pct,
                        min_clear_percent
                    );
                    false
                } else {
                    true
                }
            })
            .collect();
        log::info!(
            "clear-pixel filter retained {} of {} scenes",
            scenes.len(),
            before
        );
        SceneStack::new(scenes)
    }
}
