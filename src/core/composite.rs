//! Temporal compositing.
//!
//! Collapses a masked scene stack into one representative raster.
//! Statistical reductions operate band-by-band and ignore NaN pixels;
//! quality mosaics select the full band vector of the winning scene per
//! pixel with a deterministic timestamp tie-break.

use chrono::{Months, NaiveDate};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::BandMapping;
use crate::core::indices::normalized_difference;
use crate::types::{
    BandGrid, PixelValue, Raster, Scene, SceneMetadata, SceneStack, SoilError, SoilResult,
};

/// Temporal reduction strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeMethod {
    Median,
    Mean,
    Min,
    Max,
    /// Per-pixel percentile (0-100); 50 is equivalent to median
    Percentile(u8),
    /// Quality mosaic keeping the scene with maximum vegetation index per pixel
    Greenest,
    /// Quality mosaic keeping the scene with minimum moisture index per pixel
    Driest,
}

impl CompositeMethod {
    /// Resolve a method name at the configuration boundary.
    ///
    /// Unknown names fall back to median with a warning rather than an
    /// error; `percentile` picks up the supplied percentile value.
    pub fn parse(name: &str, percentile: u8) -> CompositeMethod {
        match name {
            "median" => CompositeMethod::Median,
            "mean" => CompositeMethod::Mean,
            "min" => CompositeMethod::Min,
            "max" => CompositeMethod::Max,
            "percentile" => CompositeMethod::Percentile(percentile.min(100)),
            "greenest" => CompositeMethod::Greenest,
            "driest" => CompositeMethod::Driest,
            other => {
                log::warn!("unknown composite method '{}', defaulting to median", other);
                CompositeMethod::Median
            }
        }
    }
}

impl std::fmt::Display for CompositeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompositeMethod::Median => write!(f, "median"),
            CompositeMethod::Mean => write!(f, "mean"),
            CompositeMethod::Min => write!(f, "min"),
            CompositeMethod::Max => write!(f, "max"),
            CompositeMethod::Percentile(p) => write!(f, "p{}", p),
            CompositeMethod::Greenest => write!(f, "greenest"),
            CompositeMethod::Driest => write!(f, "driest"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Reduction {
    Mean,
    Min,
    Max,
    Percentile(f64),
}

/// Reduce a non-empty set of valid observations to one value
fn reduce_values(values: &mut [PixelValue], reduction: Reduction) -> PixelValue {
    match reduction {
        Reduction::Mean => {
            let sum: f64 = values.iter().map(|&v| v as f64).sum();
            (sum / values.len() as f64) as PixelValue
        }
        Reduction::Min => values.iter().cloned().fold(PixelValue::INFINITY, PixelValue::min),
        Reduction::Max => values
            .iter()
            .cloned()
            .fold(PixelValue::NEG_INFINITY, PixelValue::max),
        Reduction::Percentile(p) => {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let n = values.len();
            if n == 1 {
                return values[0];
            }
            // Linear interpolation between closest ranks; p=50 matches median
            let rank = (n - 1) as f64 * p / 100.0;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = (rank - lo as f64) as PixelValue;
            values[lo] + (values[hi] - values[lo]) * frac
        }
    }
}

/// Collapses masked scene stacks into composite rasters
#[derive(Debug, Clone, Default)]
pub struct CompositeEngine {
    bands: BandMapping,
}

impl CompositeEngine {
    pub fn new(bands: BandMapping) -> Self {
        Self { bands }
    }

    /// Create a composite with the given strategy.
    ///
    /// `bands` restricts the input band set before reduction; None keeps
    /// every band of the first scene's schema. A pixel with zero valid
    /// observations across the stack stays NaN in the composite.
    pub fn create_composite(
        &self,
        stack: &SceneStack,
        method: CompositeMethod,
        bands: Option<&[String]>,
    ) -> SoilResult<Raster> {
        if stack.is_empty() {
            return Err(SoilError::EmptyStack);
        }
        let first = &stack.scenes()[0];
        let (rows, cols) = first.raster.dims();
        for scene in stack.iter().skip(1) {
            let (r, c) = scene.raster.dims();
            if (r, c) != (rows, cols) {
                return Err(SoilError::ShapeMismatch {
                    expected_rows: rows,
                    expected_cols: cols,
                    rows: r,
                    cols: c,
                });
            }
        }
        let band_names: Vec<String> = match bands {
            Some(names) => names.to_vec(),
            None => first.raster.band_names().iter().map(|s| s.to_string()).collect(),
        };

        log::info!(
            "creating {} composite from {} scenes ({} bands)",
            method,
            stack.len(),
            band_names.len()
        );

        let composite = match method {
            CompositeMethod::Median => {
                self.reduce_statistical(stack, &band_names, Reduction::Percentile(50.0))?
            }
            CompositeMethod::Mean => self.reduce_statistical(stack, &band_names, Reduction::Mean)?,
            CompositeMethod::Min => self.reduce_statistical(stack, &band_names, Reduction::Min)?,
            CompositeMethod::Max => self.reduce_statistical(stack, &band_names, Reduction::Max)?,
            CompositeMethod::Percentile(p) => {
                self.reduce_statistical(stack, &band_names, Reduction::Percentile(p as f64))?
            }
            CompositeMethod::Greenest => self.quality_mosaic(stack, &band_names, false)?,
            CompositeMethod::Driest => self.quality_mosaic(stack, &band_names, true)?,
        };
        Ok(composite)
    }

    /// Partition the stack into calendar-month buckets and composite each.
    ///
    /// The bucket count is the elapsed fractional months between start
    /// and end, rounded half-up, with a minimum of one. Buckets with no
    /// scenes are skipped with a warning.
    pub fn create_monthly_composites(
        &self,
        stack: &SceneStack,
        start: NaiveDate,
        end: NaiveDate,
        method: CompositeMethod,
    ) -> SoilResult<SceneStack> {
        if stack.is_empty() {
            return Err(SoilError::EmptyStack);
        }
        let n_months = elapsed_months_rounded(start, end);
        log::info!("creating {} monthly composites using {}", n_months, method);

        let mut monthly = SceneStack::empty();
        for offset in 0..n_months {
            let bucket_start = start
                .checked_add_months(Months::new(offset))
                .ok_or_else(|| SoilError::Processing("month bucket overflow".to_string()))?;
            let bucket_end = start
                .checked_add_months(Months::new(offset + 1))
                .ok_or_else(|| SoilError::Processing("month bucket overflow".to_string()))?;
            let bucket = stack.filter_date_range(bucket_start, bucket_end);
            if bucket.is_empty() {
                log::warn!("no scenes in month starting {}, skipping bucket", bucket_start);
                continue;
            }
            let composite = self.create_composite(&bucket, method, None)?;
            monthly.push(Scene {
                id: bucket_start.format("%Y-%m").to_string(),
                timestamp: bucket_start.and_hms_opt(0, 0, 0).expect("midnight").and_utc(),
                raster: composite,
                metadata: SceneMetadata::default(),
            });
        }
        Ok(monthly)
    }

    /// The fixed comparison set of composites used for method selection
    pub fn create_multi_composite(
        &self,
        stack: &SceneStack,
    ) -> SoilResult<BTreeMap<String, Raster>> {
        let variants = [
            ("median", CompositeMethod::Median),
            ("mean", CompositeMethod::Mean),
            ("p25", CompositeMethod::Percentile(25)),
            ("p75", CompositeMethod::Percentile(75)),
            ("greenest", CompositeMethod::Greenest),
            ("driest", CompositeMethod::Driest),
        ];
        let mut composites = BTreeMap::new();
        for (name, method) in variants {
            composites.insert(name.to_string(), self.create_composite(stack, method, None)?);
        }
        log::info!("created {} composite variants", composites.len());
        Ok(composites)
    }

    fn reduce_statistical(
        &self,
        stack: &SceneStack,
        band_names: &[String],
        reduction: Reduction,
    ) -> SoilResult<Raster> {
        let first = &stack.scenes()[0];
        let (rows, cols) = first.raster.dims();

        let reduced: SoilResult<Vec<(String, BandGrid)>> = band_names
            .par_iter()
            .map(|name| {
                let grids: Vec<&BandGrid> = stack
                    .iter()
                    .map(|scene| scene.raster.band(name))
                    .collect::<SoilResult<_>>()?;
                let mut out = BandGrid::from_elem((rows, cols), PixelValue::NAN);
                let mut values: Vec<PixelValue> = Vec::with_capacity(grids.len());
                for row in 0..rows {
                    for col in 0..cols {
                        values.clear();
                        values.extend(grids.iter().map(|g| g[(row, col)]).filter(|v| !v.is_nan()));
                        if !values.is_empty() {
                            out[(row, col)] = reduce_values(&mut values, reduction);
                        }
                    }
                }
                Ok((name.clone(), out))
            })
            .collect();

        let mut composite = Raster::new(*first.raster.transform(), rows, cols);
        for (name, grid) in reduced? {
            composite.add_band(name, grid)?;
        }
        Ok(composite)
    }

    /// Per-pixel selection of the full band vector from the scene with
    /// the best quality score (NDVI, or negated NDMI when `driest`).
    fn quality_mosaic(
        &self,
        stack: &SceneStack,
        band_names: &[String],
        driest: bool,
    ) -> SoilResult<Raster> {
        let scenes = stack.scenes();
        let first = &scenes[0];
        let (rows, cols) = first.raster.dims();

        // Fixed evaluation order: earliest acquisition wins ties under
        // any parallel schedule
        let mut order: Vec<usize> = (0..scenes.len()).collect();
        order.sort_by(|&a, &b| {
            scenes[a]
                .timestamp
                .cmp(&scenes[b].timestamp)
                .then_with(|| scenes[a].id.cmp(&scenes[b].id))
        });

        let scores: Vec<BandGrid> = order
            .par_iter()
            .map(|&i| {
                let raster = &scenes[i].raster;
                let nir = raster.band(&self.bands.nir)?;
                let score = if driest {
                    let ndmi = normalized_difference(nir, raster.band(&self.bands.swir1)?);
                    ndmi.mapv(|v| -v)
                } else {
                    normalized_difference(nir, raster.band(&self.bands.red)?)
                };
                Ok(score)
            })
            .collect::<SoilResult<_>>()?;

        const NO_WINNER: usize = usize::MAX;
        let mut winner = ndarray::Array2::from_elem((rows, cols), NO_WINNER);
        let mut best = BandGrid::from_elem((rows, cols), PixelValue::NAN);
        for (pos, &scene_idx) in order.iter().enumerate() {
            let score = &scores[pos];
            for row in 0..rows {
                for col in 0..cols {
                    let s = score[(row, col)];
                    if s.is_nan() {
                        continue;
                    }
                    let b = best[(row, col)];
                    if b.is_nan() || s > b {
                        best[(row, col)] = s;
                        winner[(row, col)] = scene_idx;
                    }
                }
            }
        }

        let mut composite = Raster::new(*first.raster.transform(), rows, cols);
        for name in band_names {
            let grids: Vec<&BandGrid> = scenes
                .iter()
                .map(|scene| scene.raster.band(name))
                .collect::<SoilResult<_>>()?;
            let grid = BandGrid::from_shape_fn((rows, cols), |(row, col)| {
                match winner[(row, col)] {
                    NO_WINNER => PixelValue::NAN,
                    idx => grids[idx][(row, col)],
                }
            });
            composite.add_band(name.clone(), grid)?;
        }
        Ok(composite)
    }
}

/// Elapsed months between two dates, rounded half-up, minimum one.
///
/// Whole months are stepped on the calendar from the start date; the
/// fractional tail is remaining days over the length of the month they
/// fall in.
fn elapsed_months_rounded(start: NaiveDate, end: NaiveDate) -> u32 {
    let mut whole: u32 = 0;
    while start
        .checked_add_months(Months::new(whole + 1))
        .map_or(false, |d| d <= end)
    {
        whole += 1;
    }
    let tail_start = start
        .checked_add_months(Months::new(whole))
        .unwrap_or(start);
    let tail_end = start
        .checked_add_months(Months::new(whole + 1))
        .unwrap_or(tail_start);
    let span_days = (tail_end - tail_start).num_days().max(1) as f64;
    let tail_days = (end - tail_start).num_days().max(0) as f64;
    let months = if tail_days / span_days >= 0.5 { whole + 1 } else { whole };
    months.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use approx::assert_relative_eq;
    use chrono::{DateTime, Utc};
    use ndarray::Array2;

    fn scene(id: &str, day: u32, nir: PixelValue, red: PixelValue) -> Scene {
        let transform = GeoTransform::new(0.0, 0.0, 0.0001, -0.0001);
        let mut raster = Raster::new(transform, 2, 2);
        raster.add_band("B8", Array2::from_elem((2, 2), nir)).unwrap();
        raster.add_band("B4", Array2::from_elem((2, 2), red)).unwrap();
        Scene {
            id: id.to_string(),
            timestamp: DateTime::parse_from_rfc3339(&format!("2025-06-{day:02}T10:00:00Z"))
                .unwrap()
                .with_timezone(&Utc),
            raster,
            metadata: SceneMetadata::default(),
        }
    }

    #[test]
    fn test_median_of_three() {
        let stack = SceneStack::new(vec![
            scene("a", 1, 1000.0, 100.0),
            scene("b", 2, 3000.0, 300.0),
            scene("c", 3, 2000.0, 200.0),
        ]);
        let engine = CompositeEngine::default();
        let composite = engine
            .create_composite(&stack, CompositeMethod::Median, None)
            .unwrap();
        assert_relative_eq!(composite.band("B8").unwrap()[(0, 0)], 2000.0);
        assert_relative_eq!(composite.band("B4").unwrap()[(0, 0)], 200.0);
    }

    #[test]
    fn test_empty_stack_is_fatal() {
        let engine = CompositeEngine::default();
        let err = engine
            .create_composite(&SceneStack::empty(), CompositeMethod::Median, None)
            .unwrap_err();
        assert!(matches!(err, SoilError::EmptyStack));
    }

    #[test]
    fn test_unknown_method_falls_back_to_median() {
        assert_eq!(CompositeMethod::parse("mosaic", 50), CompositeMethod::Median);
        assert_eq!(
            CompositeMethod::parse("percentile", 25),
            CompositeMethod::Percentile(25)
        );
    }

    #[test]
    fn test_month_rounding_half_up() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        // Exactly three calendar months
        assert_eq!(elapsed_months_rounded(d(2025, 10, 22), d(2026, 1, 22)), 3);
        // Three months and twenty days rounds up
        assert_eq!(elapsed_months_rounded(d(2025, 10, 22), d(2026, 2, 11)), 4);
        // Ten days rounds down to the one-bucket minimum
        assert_eq!(elapsed_months_rounded(d(2025, 10, 1), d(2025, 10, 11)), 1);
    }

    #[test]
    fn test_greenest_tie_breaks_to_earliest() {
        // Identical NDVI in both scenes; red differs so the winner is observable
        let stack = SceneStack::new(vec![
            scene("later", 20, 8000.0, 4000.0),
            scene("earlier", 10, 4000.0, 2000.0),
        ]);
        let engine = CompositeEngine::default();
        let composite = engine
            .create_composite(&stack, CompositeMethod::Greenest, None)
            .unwrap();
        // Same NDVI of 1/3; the earlier acquisition must win
        assert_relative_eq!(composite.band("B4").unwrap()[(0, 0)], 2000.0);
    }
}
