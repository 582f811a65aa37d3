//! Zonal statistics.
//!
//! Summary statistics over all valid pixels of each index band inside
//! the ROI. Failures are isolated per index: a missing band or an empty
//! region yields a typed null entry instead of aborting the report.

use rayon::prelude::*;
use std::collections::BTreeMap;

use crate::core::sample_stride;
use crate::types::{
    BandStatistics, CancellationToken, IndexStatsEntry, Raster, Roi, SoilResult, StatisticsReport,
    StatsFailure,
};

/// Computes per-index zonal statistics over the ROI
#[derive(Debug, Clone, Copy, Default)]
pub struct ZonalStatisticsEngine;

impl ZonalStatisticsEngine {
    pub fn new() -> Self {
        Self
    }

    /// Compute {mean, min, max, stdDev} per requested index band.
    ///
    /// Pixels are sampled at a stride derived from `scale_m` and the
    /// raster resolution; invalid (NaN) pixels are excluded from the
    /// reduction, never treated as zero. Cancellation aborts the whole
    /// call with `SoilError::Cancelled` rather than returning partials.
    pub fn compute(
        &self,
        raster: &Raster,
        roi: &Roi,
        index_names: &[String],
        scale_m: f64,
        token: Option<&CancellationToken>,
    ) -> SoilResult<StatisticsReport> {
        let (rows, cols) = raster.dims();
        let stride = sample_stride(raster.transform(), scale_m);
        let coverage = roi.coverage_mask(raster.transform(), rows, cols);
        log::debug!(
            "zonal statistics over {} indices at scale {}m (stride {})",
            index_names.len(),
            scale_m,
            stride
        );

        let entries: SoilResult<Vec<(String, IndexStatsEntry)>> = index_names
            .par_iter()
            .map(|name| {
                if let Some(token) = token {
                    token.check()?;
                }
                let Some(grid) = raster.band_opt(name) else {
                    log::warn!(
                        "index band '{}' absent from composite, reporting null statistics",
                        name
                    );
                    return Ok((
                        name.clone(),
                        IndexStatsEntry::Unavailable(StatsFailure::MissingBand),
                    ));
                };

                let mut count = 0u64;
                let mut sum = 0.0f64;
                let mut sum_sq = 0.0f64;
                let mut min = f64::INFINITY;
                let mut max = f64::NEG_INFINITY;
                for row in (0..rows).step_by(stride) {
                    if let Some(token) = token {
                        token.check()?;
                    }
                    for col in (0..cols).step_by(stride) {
                        if !coverage[(row, col)] {
                            continue;
                        }
                        let value = grid[(row, col)] as f64;
                        if value.is_nan() {
                            continue;
                        }
                        count += 1;
                        sum += value;
                        sum_sq += value * value;
                        min = min.min(value);
                        max = max.max(value);
                    }
                }

                if count == 0 {
                    log::warn!("no valid pixels for index '{}' in region", name);
                    return Ok((
                        name.clone(),
                        IndexStatsEntry::Unavailable(StatsFailure::EmptyRegion),
                    ));
                }
                let mean = sum / count as f64;
                let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
                Ok((
                    name.clone(),
                    IndexStatsEntry::Computed(BandStatistics {
                        mean,
                        min,
                        max,
                        std_dev: variance.sqrt(),
                    }),
                ))
            })
            .collect();

        Ok(StatisticsReport {
            entries: entries?.into_iter().collect::<BTreeMap<_, _>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoTransform, SoilError};
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn raster_with(name: &str, values: Vec<f32>, rows: usize, cols: usize) -> Raster {
        let transform = GeoTransform::new(0.0, 0.0, 0.0001, -0.0001);
        let mut raster = Raster::new(transform, rows, cols);
        raster
            .add_band(name, Array2::from_shape_vec((rows, cols), values).unwrap())
            .unwrap();
        raster
    }

    fn whole_grid_roi() -> Roi {
        Roi::bounding_box(-1.0, -1.0, 1.0, 1.0).unwrap()
    }

    #[test]
    fn test_statistics_exclude_nan_pixels() {
        let raster = raster_with("NDVI", vec![0.2, 0.4, f32::NAN, 0.6], 2, 2);
        let engine = ZonalStatisticsEngine::new();
        let report = engine
            .compute(&raster, &whole_grid_roi(), &["NDVI".to_string()], 10.0, None)
            .unwrap();
        let stats = report.computed("NDVI").unwrap();
        assert_relative_eq!(stats.mean, 0.4, epsilon = 1e-6);
        assert_relative_eq!(stats.min, 0.2, epsilon = 1e-6);
        assert_relative_eq!(stats.max, 0.6, epsilon = 1e-6);
    }

    #[test]
    fn test_missing_band_yields_typed_null_entry() {
        let raster = raster_with("NDVI", vec![0.1; 4], 2, 2);
        let engine = ZonalStatisticsEngine::new();
        let report = engine
            .compute(&raster, &whole_grid_roi(), &["BSI".to_string()], 10.0, None)
            .unwrap();
        assert_eq!(
            report.get("BSI").unwrap().failure(),
            Some(StatsFailure::MissingBand)
        );
    }

    #[test]
    fn test_all_nan_band_yields_empty_region() {
        let raster = raster_with("CI", vec![f32::NAN; 4], 2, 2);
        let engine = ZonalStatisticsEngine::new();
        let report = engine
            .compute(&raster, &whole_grid_roi(), &["CI".to_string()], 10.0, None)
            .unwrap();
        assert_eq!(
            report.get("CI").unwrap().failure(),
            Some(StatsFailure::EmptyRegion)
        );
    }

    #[test]
    fn test_cancellation_aborts_without_partial_results() {
        let raster = raster_with("NDVI", vec![0.1; 4], 2, 2);
        let engine = ZonalStatisticsEngine::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = engine
            .compute(
                &raster,
                &whole_grid_roi(),
                &["NDVI".to_string()],
                10.0,
                Some(&token),
            )
            .unwrap_err();
        assert!(matches!(err, SoilError::Cancelled));
    }
}
