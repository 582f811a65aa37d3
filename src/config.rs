//! Analysis configuration.
//!
//! Explicit value objects passed into the engines; there is no
//! process-wide mutable configuration. Defaults match the Sentinel-2
//! surface reflectance products the pipeline was built for.

use serde::{Deserialize, Serialize};

use crate::core::composite::CompositeMethod;
use crate::core::indices::SoilIndex;

/// Logical-to-physical band name mapping for the imagery product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandMapping {
    pub blue: String,
    pub green: String,
    pub red: String,
    pub nir: String,
    pub swir1: String,
    pub swir2: String,
    /// Embedded quality-flag bit band
    pub qa: String,
    /// Categorical scene classification band
    pub scl: String,
    /// Joined per-pixel cloud probability band
    pub probability: String,
}

impl Default for BandMapping {
    fn default() -> Self {
        Self {
            blue: "B2".to_string(),
            green: "B3".to_string(),
            red: "B4".to_string(),
            nir: "B8".to_string(),
            swir1: "B11".to_string(),
            swir2: "B12".to_string(),
            qa: "QA60".to_string(),
            scl: "SCL".to_string(),
            probability: "probability".to_string(),
        }
    }
}

impl BandMapping {
    /// The reflectance bands used for soil analysis, in a fixed order
    pub fn soil_analysis_bands(&self) -> Vec<String> {
        vec![
            self.blue.clone(),
            self.green.clone(),
            self.red.clone(),
            self.nir.clone(),
            self.swir1.clone(),
            self.swir2.clone(),
        ]
    }
}

/// Top-level analysis parameters with documented defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Per-pixel cloud probability threshold (0-100); pixels at or above are masked
    pub cloud_probability_threshold: f32,
    /// Maximum scene-level cloud percentage admitted into the stack
    pub max_scene_cloud_percent: f64,
    /// Temporal reduction strategy for compositing
    pub composite_method: CompositeMethod,
    /// Soil indices computed and summarized per run
    pub soil_indices: Vec<SoilIndex>,
    /// Sampling resolution for zonal statistics, in meters
    pub statistics_scale_m: f64,
    /// Sampling resolution for histograms, in meters
    pub histogram_scale_m: f64,
    /// Equal-width bucket count per histogram
    pub histogram_buckets: usize,
    /// Band names for the imagery product
    pub bands: BandMapping,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cloud_probability_threshold: 40.0,
            max_scene_cloud_percent: 70.0,
            composite_method: CompositeMethod::Median,
            soil_indices: vec![
                SoilIndex::Ndsi,
                SoilIndex::Bi,
                SoilIndex::Ci,
                SoilIndex::Ndmi,
                SoilIndex::Bsi,
            ],
            statistics_scale_m: 10.0,
            histogram_scale_m: 30.0,
            histogram_buckets: 50,
            bands: BandMapping::default(),
        }
    }
}
