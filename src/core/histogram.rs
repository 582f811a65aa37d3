//! Index histograms.
//!
//! Bins valid pixel values into fixed-range, equal-width buckets per
//! index. Ranges come from a fixed per-index lookup so histograms are
//! comparable across runs and regions.

use rayon::prelude::*;
use std::collections::BTreeMap;

use crate::core::sample_stride;
use crate::types::{CancellationToken, Histogram, Raster, Roi, SoilResult};

/// Default number of equal-width buckets
pub const DEFAULT_BUCKET_COUNT: usize = 50;

/// Fixed histogram value range for an index band name.
///
/// Unlisted indices default to [-1, 1].
pub fn index_value_range(name: &str) -> (f64, f64) {
    match name {
        "BSI" => (0.0, 200.0),
        "Brightness" => (0.0, 15000.0),
        "ClayIndex" => (0.0, 3.0),
        "SOM_Index" => (-2.0, 2.0),
        // NDVI, NDSI, NDMI, BI, CI, SSI and anything unlisted
        _ => (-1.0, 1.0),
    }
}

/// Builds fixed-range histograms of index bands over the ROI
#[derive(Debug, Clone, Copy, Default)]
pub struct HistogramBuilder;

impl HistogramBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build one histogram per requested index.
    ///
    /// Valid pixels outside the fixed range clamp into the edge buckets,
    /// so bucket counts always sum to the number of valid sampled
    /// pixels. Indices whose band is absent are skipped with a warning
    /// and omitted from the result.
    pub fn build(
        &self,
        raster: &Raster,
        roi: &Roi,
        index_names: &[String],
        scale_m: f64,
        num_buckets: usize,
        token: Option<&CancellationToken>,
    ) -> SoilResult<BTreeMap<String, Histogram>> {
        let num_buckets = num_buckets.max(1);
        let (rows, cols) = raster.dims();
        let stride = sample_stride(raster.transform(), scale_m);
        let coverage = roi.coverage_mask(raster.transform(), rows, cols);

        let histograms: SoilResult<Vec<Option<(String, Histogram)>>> = index_names
            .par_iter()
            .map(|name| {
                if let Some(token) = token {
                    token.check()?;
                }
                let Some(grid) = raster.band_opt(name) else {
                    log::warn!("index band '{}' absent from composite, skipping histogram", name);
                    return Ok(None);
                };

                let (min, max) = index_value_range(name);
                let width = (max - min) / num_buckets as f64;
                let mut counts = vec![0u64; num_buckets];
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
                        let bucket = ((value - min) / width).floor() as i64;
                        let bucket = bucket.clamp(0, num_buckets as i64 - 1) as usize;
                        counts[bucket] += 1;
                    }
                }

                let bucket_means: Vec<f64> = (0..num_buckets)
                    .map(|i| min + (i as f64 + 0.5) * width)
                    .collect();
                Ok(Some((
                    name.clone(),
                    Histogram {
                        band: name.clone(),
                        bucket_means,
                        counts,
                        min,
                        max,
                    },
                )))
            })
            .collect();

        let out: BTreeMap<String, Histogram> = histograms?.into_iter().flatten().collect();
        log::info!("generated {} index histograms", out.len());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
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
    fn test_counts_sum_to_valid_pixels() {
        let raster = raster_with("NDVI", vec![0.1, -0.4, f32::NAN, 0.9], 2, 2);
        let builder = HistogramBuilder::new();
        let histograms = builder
            .build(&raster, &whole_grid_roi(), &["NDVI".to_string()], 10.0, 50, None)
            .unwrap();
        assert_eq!(histograms["NDVI"].total_count(), 3);
    }

    #[test]
    fn test_bucket_centers_ascend_over_fixed_range() {
        let raster = raster_with("BSI", vec![120.0; 4], 2, 2);
        let builder = HistogramBuilder::new();
        let histograms = builder
            .build(&raster, &whole_grid_roi(), &["BSI".to_string()], 10.0, 50, None)
            .unwrap();
        let hist = &histograms["BSI"];
        assert_eq!(hist.min, 0.0);
        assert_eq!(hist.max, 200.0);
        assert_relative_eq!(hist.bucket_means[0], 2.0);
        assert!(hist
            .bucket_means
            .windows(2)
            .all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_out_of_range_values_clamp_into_edge_buckets() {
        let raster = raster_with("NDVI", vec![-5.0, 5.0, 0.0, 0.0], 2, 2);
        let builder = HistogramBuilder::new();
        let histograms = builder
            .build(&raster, &whole_grid_roi(), &["NDVI".to_string()], 10.0, 10, None)
            .unwrap();
        let hist = &histograms["NDVI"];
        assert_eq!(hist.counts[0], 1);
        assert_eq!(hist.counts[9], 1);
        assert_eq!(hist.total_count(), 4);
    }

    #[test]
    fn test_missing_band_is_omitted() {
        let raster = raster_with("NDVI", vec![0.1; 4], 2, 2);
        let builder = HistogramBuilder::new();
        let histograms = builder
            .build(&raster, &whole_grid_roi(), &["FOO".to_string()], 10.0, 50, None)
            .unwrap();
        assert!(histograms.is_empty());
    }
}
