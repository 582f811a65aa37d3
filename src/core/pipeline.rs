//! Analysis pipeline orchestration.
//!
//! Runs the linear stage chain: retrieve -> mask -> composite -> indices
//! -> {statistics, histograms}. Fatal errors abort the run tagged with
//! the stage they occurred in; statistics and histograms read the same
//! immutable indexed composite and run concurrently.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::AnalysisConfig;
use crate::core::cloud_mask::{CloudMaskEngine, CloudMaskParams};
use crate::core::composite::CompositeEngine;
use crate::core::histogram::HistogramBuilder;
use crate::core::indices::{
    self, IndexCalculator, SoilIndex, DEFAULT_BARE_SOIL_BSI_THRESHOLD,
    DEFAULT_BARE_SOIL_NDVI_THRESHOLD,
};
use crate::core::statistics::ZonalStatisticsEngine;
use crate::io::source::{ImagerySource, ScenePredicates};
use crate::types::{
    CancellationToken, Histogram, PixelValue, Raster, Roi, SoilError, SoilResult,
    StatisticsReport, ValidityMask,
};

/// One analysis request: region, period, and optional overrides of the
/// configured defaults
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub roi: Roi,
    /// Inclusive start of the analysis period
    pub start_date: NaiveDate,
    /// Exclusive end of the analysis period
    pub end_date: NaiveDate,
    /// Override of the configured cloud probability threshold
    pub cloud_probability_threshold: Option<PixelValue>,
    /// Override of the configured scene-level cloud limit
    pub max_scene_cloud_percent: Option<f64>,
    /// Index names to compute; unrecognized names are skipped with a
    /// warning. None uses the configured index set.
    pub indices: Option<Vec<String>>,
}

impl AnalysisRequest {
    pub fn new(roi: Roi, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            roi,
            start_date,
            end_date,
            cloud_probability_threshold: None,
            max_scene_cloud_percent: None,
            indices: None,
        }
    }
}

/// Request parameters echoed back with the results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub roi: Roi,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub images_used: usize,
    pub cloud_threshold: PixelValue,
}

/// Complete output of one pipeline run
#[derive(Debug, Clone)]
pub struct AnalysisResults {
    /// Scenes retrieved before masking
    pub image_count: usize,
    /// ROI-clipped composite carrying the requested index bands
    pub composite: Raster,
    /// Per-pixel bare soil indicator derived from NDVI and BSI
    pub bare_soil_mask: ValidityMask,
    pub statistics: StatisticsReport,
    pub histograms: BTreeMap<String, Histogram>,
    /// Rule-based readings of the statistics, keyed by soil aspect
    pub interpretations: BTreeMap<String, String>,
    pub metadata: AnalysisMetadata,
}

/// End-to-end soil analysis engine
#[derive(Debug, Clone, Default)]
pub struct SoilAnalysisEngine {
    config: AnalysisConfig,
}

impl SoilAnalysisEngine {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Run the full pipeline against an imagery source.
    ///
    /// Returns either a complete result set or the first fatal error,
    /// tagged with the stage it occurred in. Non-fatal conditions
    /// (unknown index names, empty regions per index) degrade into
    /// warnings and typed null entries instead.
    pub fn run(
        &self,
        source: &dyn ImagerySource,
        request: &AnalysisRequest,
        token: Option<&CancellationToken>,
    ) -> SoilResult<AnalysisResults> {
        let cloud_threshold = request
            .cloud_probability_threshold
            .unwrap_or(self.config.cloud_probability_threshold);
        let max_scene_cloud = request
            .max_scene_cloud_percent
            .unwrap_or(self.config.max_scene_cloud_percent);

        // Stage 1: retrieval
        log::info!(
            "retrieving imagery for {} to {} (max scene cloud {}%)",
            request.start_date,
            request.end_date,
            max_scene_cloud
        );
        let stack = source
            .query(
                &request.roi,
                request.start_date,
                request.end_date,
                &ScenePredicates {
                    max_cloud_percent: Some(max_scene_cloud),
                },
            )
            .map_err(|e| e.in_stage("retrieval"))?;
        if stack.is_empty() {
            return Err(SoilError::EmptyStack.in_stage("retrieval"));
        }
        let image_count = stack.len();
        let probability = source
            .query_probability(&request.roi, request.start_date, request.end_date)
            .map_err(|e| e.in_stage("retrieval"))?;

        if let Some(token) = token {
            token.check()?;
        }

        // Stage 2: cloud and shadow masking
        let mask_engine = CloudMaskEngine::new(
            CloudMaskParams {
                probability_threshold: cloud_threshold,
                ..CloudMaskParams::default()
            },
            self.config.bands.clone(),
        );
        let masked = mask_engine
            .apply_comprehensive_mask(&stack, &probability)
            .map_err(|e| e.in_stage("cloud_mask"))?;
        if masked.is_empty() {
            return Err(SoilError::EmptyStack.in_stage("cloud_mask"));
        }

        if let Some(token) = token {
            token.check()?;
        }

        // Stage 3: temporal composite, clipped to the ROI
        let composite_engine = CompositeEngine::new(self.config.bands.clone());
        let composite = composite_engine
            .create_composite(&masked, self.config.composite_method, None)
            .map_err(|e| e.in_stage("composite"))?;
        let composite = composite.clip(&request.roi);

        if let Some(token) = token {
            token.check()?;
        }

        // Stage 4: spectral indices and bare soil mask
        let selected: Vec<SoilIndex> = match &request.indices {
            Some(names) => SoilIndex::parse_names(names),
            None => self.config.soil_indices.clone(),
        };
        let calculator = IndexCalculator::new(self.config.bands.clone());
        let composite_with_indices = calculator
            .calculate_selected(&composite, &selected)
            .map_err(|e| e.in_stage("indices"))?;
        let bare_soil_mask = calculator
            .create_bare_soil_mask(
                &composite_with_indices,
                DEFAULT_BARE_SOIL_NDVI_THRESHOLD,
                DEFAULT_BARE_SOIL_BSI_THRESHOLD,
            )
            .map_err(|e| e.in_stage("indices"))?;

        if let Some(token) = token {
            token.check()?;
        }

        // Stage 5: region summaries; both readers of the same immutable
        // composite, run concurrently
        let index_names: Vec<String> = selected
            .iter()
            .map(|i| i.band_name().to_string())
            .collect();
        let stats_engine = ZonalStatisticsEngine::new();
        let histogram_builder = HistogramBuilder::new();
        let (statistics, histograms) = rayon::join(
            || {
                stats_engine.compute(
                    &composite_with_indices,
                    &request.roi,
                    &index_names,
                    self.config.statistics_scale_m,
                    token,
                )
            },
            || {
                histogram_builder.build(
                    &composite_with_indices,
                    &request.roi,
                    &index_names,
                    self.config.histogram_scale_m,
                    self.config.histogram_buckets,
                    token,
                )
            },
        );
        let statistics = statistics.map_err(|e| e.in_stage("statistics"))?;
        let histograms = histograms.map_err(|e| e.in_stage("histograms"))?;
        let interpretations = indices::interpret_statistics(&statistics);

        log::info!(
            "analysis complete: {} scenes, {} indices, {} histograms",
            image_count,
            index_names.len(),
            histograms.len()
        );

        Ok(AnalysisResults {
            image_count,
            composite: composite_with_indices,
            bare_soil_mask,
            statistics,
            histograms,
            interpretations,
            metadata: AnalysisMetadata {
                roi: request.roi.clone(),
                start_date: request.start_date,
                end_date: request.end_date,
                images_used: image_count,
                cloud_threshold,
            },
        })
    }
}
