use chrono::{DateTime, NaiveDate, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Scalar pixel value for all raster bands
pub type PixelValue = f32;

/// Single-band pixel grid (rows x cols); missing data is NaN
pub type BandGrid = Array2<PixelValue>;

/// Per-pixel validity indicator (true = clear/usable)
pub type ValidityMask = Array2<bool>;

/// Nominal integer scaling of surface reflectance bands (0..=10000 maps to 0.0..=1.0)
pub const REFLECTANCE_SCALE: PixelValue = 10000.0;

/// Meters per degree of latitude (spherical approximation)
pub const METERS_PER_DEG_LAT: f64 = 110_540.0;

/// Meters per degree of longitude at the equator
pub const METERS_PER_DEG_LON: f64 = 111_320.0;

/// Geospatial transformation parameters (north-up, no rotation)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_lon: f64,
    pub top_left_lat: f64,
    /// Pixel width in degrees (positive, eastward)
    pub pixel_width: f64,
    /// Pixel height in degrees (negative, north-up)
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(top_left_lon: f64, top_left_lat: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_lon,
            top_left_lat,
            pixel_width,
            pixel_height,
        }
    }

    /// Geographic coordinates of the center of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let lon = self.top_left_lon + (col as f64 + 0.5) * self.pixel_width;
        let lat = self.top_left_lat + (row as f64 + 0.5) * self.pixel_height;
        (lon, lat)
    }

    /// Approximate pixel size in meters (width, height) at the grid origin latitude
    pub fn pixel_size_meters(&self) -> (f64, f64) {
        let lat_rad = self.top_left_lat.to_radians();
        let width_m = self.pixel_width.abs() * METERS_PER_DEG_LON * lat_rad.cos().abs().max(1e-6);
        let height_m = self.pixel_height.abs() * METERS_PER_DEG_LAT;
        (width_m, height_m)
    }

    /// Nominal ground resolution in meters (smaller of the two pixel dimensions)
    pub fn resolution_meters(&self) -> f64 {
        let (w, h) = self.pixel_size_meters();
        w.min(h)
    }
}

/// Great-circle distance between two lon/lat points in meters (haversine)
pub fn haversine_distance_m(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Region of interest scoping all spatial filtering and aggregation.
///
/// Created once per analysis request and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Roi {
    /// Circular region: center point plus radius in meters
    Circle { lat: f64, lon: f64, radius_m: f64 },
    /// Axis-aligned geographic rectangle
    BoundingBox {
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
    },
}

impl Roi {
    pub fn circle(lat: f64, lon: f64, radius_m: f64) -> SoilResult<Self> {
        if radius_m <= 0.0 {
            return Err(SoilError::InvalidGeometry(format!(
                "ROI radius must be positive, got {radius_m}"
            )));
        }
        Ok(Roi::Circle { lat, lon, radius_m })
    }

    pub fn bounding_box(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> SoilResult<Self> {
        if min_lon >= max_lon || min_lat >= max_lat {
            return Err(SoilError::InvalidGeometry(format!(
                "degenerate bounding box [{min_lon}, {min_lat}, {max_lon}, {max_lat}]"
            )));
        }
        Ok(Roi::BoundingBox {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    /// Whether a lon/lat point falls inside the region
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        match *self {
            Roi::Circle {
                lat: clat,
                lon: clon,
                radius_m,
            } => haversine_distance_m(clon, clat, lon, lat) <= radius_m,
            Roi::BoundingBox {
                min_lon,
                min_lat,
                max_lon,
                max_lat,
            } => lon >= min_lon && lon <= max_lon && lat >= min_lat && lat <= max_lat,
        }
    }

    /// Geographic extent as (min_lon, min_lat, max_lon, max_lat)
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        match *self {
            Roi::Circle { lat, lon, radius_m } => {
                let dlat = radius_m / METERS_PER_DEG_LAT;
                let dlon = radius_m / (METERS_PER_DEG_LON * lat.to_radians().cos().abs().max(1e-6));
                (lon - dlon, lat - dlat, lon + dlon, lat + dlat)
            }
            Roi::BoundingBox {
                min_lon,
                min_lat,
                max_lon,
                max_lat,
            } => (min_lon, min_lat, max_lon, max_lat),
        }
    }

    /// Per-pixel coverage mask over a grid (true = pixel center inside the ROI)
    pub fn coverage_mask(&self, transform: &GeoTransform, rows: usize, cols: usize) -> ValidityMask {
        Array2::from_shape_fn((rows, cols), |(row, col)| {
            let (lon, lat) = transform.pixel_center(row, col);
            self.contains(lon, lat)
        })
    }

    /// Whether the region overlaps a geographic extent
    pub fn intersects_bounds(&self, other: (f64, f64, f64, f64)) -> bool {
        let (a_min_lon, a_min_lat, a_max_lon, a_max_lat) = self.bounds();
        let (b_min_lon, b_min_lat, b_max_lon, b_max_lat) = other;
        a_min_lon <= b_max_lon
            && b_min_lon <= a_max_lon
            && a_min_lat <= b_max_lat
            && b_min_lat <= a_max_lat
    }
}

/// Multi-band raster over a single geographic grid.
///
/// All bands share the same dimensions and transform; the invariant is
/// enforced by `add_band`. Missing/masked pixels are NaN.
#[derive(Debug, Clone)]
pub struct Raster {
    rows: usize,
    cols: usize,
    transform: GeoTransform,
    bands: BTreeMap<String, BandGrid>,
}

impl Raster {
    pub fn new(transform: GeoTransform, rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            transform,
            bands: BTreeMap::new(),
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn band_names(&self) -> Vec<&str> {
        self.bands.keys().map(String::as_str).collect()
    }

    pub fn has_band(&self, name: &str) -> bool {
        self.bands.contains_key(name)
    }

    /// Add or replace a band; the grid must match the raster dimensions
    pub fn add_band(&mut self, name: impl Into<String>, grid: BandGrid) -> SoilResult<()> {
        let (rows, cols) = grid.dim();
        if rows != self.rows || cols != self.cols {
            return Err(SoilError::ShapeMismatch {
                expected_rows: self.rows,
                expected_cols: self.cols,
                rows,
                cols,
            });
        }
        self.bands.insert(name.into(), grid);
        Ok(())
    }

    /// Access a band by name, failing with the missing band named
    pub fn band(&self, name: &str) -> SoilResult<&BandGrid> {
        self.bands
            .get(name)
            .ok_or_else(|| SoilError::MissingBand(name.to_string()))
    }

    pub fn band_opt(&self, name: &str) -> Option<&BandGrid> {
        self.bands.get(name)
    }

    pub fn iter_bands(&self) -> impl Iterator<Item = (&str, &BandGrid)> {
        self.bands.iter().map(|(name, grid)| (name.as_str(), grid))
    }

    /// New raster restricted to the named bands
    pub fn select(&self, names: &[String]) -> SoilResult<Raster> {
        let mut out = Raster::new(self.transform, self.rows, self.cols);
        for name in names {
            let grid = self.band(name)?.clone();
            out.add_band(name.clone(), grid)?;
        }
        Ok(out)
    }

    /// NaN-out every band where the mask is false (GEE updateMask semantics)
    pub fn update_mask(&mut self, mask: &ValidityMask) -> SoilResult<()> {
        let (rows, cols) = mask.dim();
        if rows != self.rows || cols != self.cols {
            return Err(SoilError::ShapeMismatch {
                expected_rows: self.rows,
                expected_cols: self.cols,
                rows,
                cols,
            });
        }
        for grid in self.bands.values_mut() {
            for ((r, c), value) in grid.indexed_iter_mut() {
                if !mask[(r, c)] {
                    *value = PixelValue::NAN;
                }
            }
        }
        Ok(())
    }

    /// New raster with all pixels outside the ROI masked out
    pub fn clip(&self, roi: &Roi) -> Raster {
        let coverage = roi.coverage_mask(&self.transform, self.rows, self.cols);
        let mut out = self.clone();
        out.update_mask(&coverage).expect("coverage mask matches raster grid");
        out
    }

    /// Geographic extent as (min_lon, min_lat, max_lon, max_lat)
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let t = &self.transform;
        let east = t.top_left_lon + self.cols as f64 * t.pixel_width;
        let south = t.top_left_lat + self.rows as f64 * t.pixel_height;
        (
            t.top_left_lon.min(east),
            t.top_left_lat.min(south),
            t.top_left_lon.max(east),
            t.top_left_lat.max(south),
        )
    }
}

/// Scene-level metadata carried alongside each acquisition
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SceneMetadata {
    /// Scene-level cloudy pixel percentage (0-100)
    pub cloud_percent: f64,
    /// Mean solar azimuth angle in degrees (clockwise from north)
    pub solar_azimuth_deg: f64,
    /// Mean solar zenith angle in degrees
    pub solar_zenith_deg: f64,
}

/// One timestamped multi-band acquisition. Immutable once retrieved.
#[derive(Debug, Clone)]
pub struct Scene {
    /// Acquisition identity used for joining against probability scenes
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub raster: Raster,
    pub metadata: SceneMetadata,
}

impl Scene {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Ordered collection of scenes sharing a band schema and grid
#[derive(Debug, Clone, Default)]
pub struct SceneStack {
    scenes: Vec<Scene>,
}

impl SceneStack {
    pub fn new(scenes: Vec<Scene>) -> Self {
        Self { scenes }
    }

    pub fn empty() -> Self {
        Self { scenes: Vec::new() }
    }

    pub fn push(&mut self, scene: Scene) {
        self.scenes.push(scene);
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn into_scenes(self) -> Vec<Scene> {
        self.scenes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Scene> {
        self.scenes.iter()
    }

    /// Scenes acquired within [start, end): inclusive start, exclusive end
    pub fn filter_date_range(&self, start: NaiveDate, end: NaiveDate) -> SceneStack {
        let scenes = self
            .scenes
            .iter()
            .filter(|s| {
                let d = s.date();
                d >= start && d < end
            })
            .cloned()
            .collect();
        SceneStack::new(scenes)
    }

    /// Sorted, de-duplicated acquisition dates
    pub fn acquisition_dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.scenes.iter().map(Scene::date).collect();
        dates.sort();
        dates.dedup();
        dates
    }

    /// Summary metadata for the stack (count, date range, cloud stats)
    pub fn summary(&self) -> StackSummary {
        let dates = self.acquisition_dates();
        let clouds: Vec<f64> = self.scenes.iter().map(|s| s.metadata.cloud_percent).collect();
        let (cloud_min, cloud_max, cloud_mean) = if clouds.is_empty() {
            (None, None, None)
        } else {
            let min = clouds.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = clouds.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mean = clouds.iter().sum::<f64>() / clouds.len() as f64;
            (Some(min), Some(max), Some(mean))
        };
        StackSummary {
            count: self.scenes.len(),
            first_date: dates.first().copied(),
            last_date: dates.last().copied(),
            cloud_min,
            cloud_max,
            cloud_mean,
        }
    }
}

impl<'a> IntoIterator for &'a SceneStack {
    type Item = &'a Scene;
    type IntoIter = std::slice::Iter<'a, Scene>;

    fn into_iter(self) -> Self::IntoIter {
        self.scenes.iter()
    }
}

/// Summary metadata for a scene stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSummary {
    pub count: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub cloud_min: Option<f64>,
    pub cloud_max: Option<f64>,
    pub cloud_mean: Option<f64>,
}

/// Aggregate statistics over valid pixels of one index band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandStatistics {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    #[serde(rename = "stdDev")]
    pub std_dev: f64,
}

/// Reason a per-index statistics entry could not be computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsFailure {
    /// The requested index band is absent from the composite
    MissingBand,
    /// The ROI contains zero valid pixels for this index
    EmptyRegion,
    /// The reduction was cancelled before completion
    Cancelled,
}

/// Per-index outcome: either computed statistics or a typed failure reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexStatsEntry {
    Computed(BandStatistics),
    Unavailable(StatsFailure),
}

impl IndexStatsEntry {
    pub fn statistics(&self) -> Option<&BandStatistics> {
        match self {
            IndexStatsEntry::Computed(stats) => Some(stats),
            IndexStatsEntry::Unavailable(_) => None,
        }
    }

    pub fn failure(&self) -> Option<StatsFailure> {
        match self {
            IndexStatsEntry::Computed(_) => None,
            IndexStatsEntry::Unavailable(reason) => Some(*reason),
        }
    }
}

/// Zonal statistics report: one entry per requested index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub entries: BTreeMap<String, IndexStatsEntry>,
}

impl StatisticsReport {
    pub fn get(&self, index: &str) -> Option<&IndexStatsEntry> {
        self.entries.get(index)
    }

    /// Computed statistics for an index, if present and valid
    pub fn computed(&self, index: &str) -> Option<&BandStatistics> {
        self.entries.get(index).and_then(IndexStatsEntry::statistics)
    }
}

/// Fixed-range histogram of one index band over the ROI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    pub band: String,
    /// Bucket centers in ascending value order
    pub bucket_means: Vec<f64>,
    /// Pixel counts aligned with `bucket_means`
    pub counts: Vec<u64>,
    pub min: f64,
    pub max: f64,
}

impl Histogram {
    pub fn total_count(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Mean derived from histogram data alone (weighted bucket centers).
    ///
    /// Fallback for when direct statistics are unavailable; None when the
    /// histogram holds no pixels.
    pub fn mean(&self) -> Option<f64> {
        let total = self.total_count();
        if total == 0 {
            return None;
        }
        let weighted: f64 = self
            .bucket_means
            .iter()
            .zip(&self.counts)
            .map(|(center, &count)| center * count as f64)
            .sum();
        Some(weighted / total as f64)
    }
}

/// Cooperative cancellation handle for long-running region reductions
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out if cancellation was requested
    pub fn check(&self) -> SoilResult<()> {
        if self.is_cancelled() {
            Err(SoilError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Error types for soil analysis processing
#[derive(Debug, thiserror::Error)]
pub enum SoilError {
    #[error("required band '{0}' is missing")]
    MissingBand(String),

    #[error("no scenes available after spatial/temporal/quality filtering")]
    EmptyStack,

    #[error("band shape mismatch: expected {expected_rows}x{expected_cols}, got {rows}x{cols}")]
    ShapeMismatch {
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("imagery source error: {0}")]
    Source(String),

    #[error("processing error: {0}")]
    Processing(String),

    #[error("pipeline stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<SoilError>,
    },
}

impl SoilError {
    /// Wrap an error with the pipeline stage it occurred in
    pub fn in_stage(self, stage: &str) -> SoilError {
        SoilError::Stage {
            stage: stage.to_string(),
            source: Box::new(self),
        }
    }
}

/// Result type for soil analysis operations
pub type SoilResult<T> = Result<T, SoilError>;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_transform() -> GeoTransform {
        // 0.0001 degree pixels (~11m) anchored at the origin
        GeoTransform::new(0.0, 0.0, 0.0001, -0.0001)
    }

    #[test]
    fn test_add_band_shape_check() {
        let mut raster = Raster::new(unit_transform(), 4, 4);
        assert!(raster.add_band("B4", Array2::zeros((4, 4))).is_ok());
        let err = raster.add_band("B8", Array2::zeros((3, 4))).unwrap_err();
        assert!(matches!(err, SoilError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_missing_band_error_names_band() {
        let raster = Raster::new(unit_transform(), 2, 2);
        let err = raster.band("B11").unwrap_err();
        assert_eq!(err.to_string(), "required band 'B11' is missing");
    }

    #[test]
    fn test_update_mask_writes_nan_everywhere() {
        let mut raster = Raster::new(unit_transform(), 2, 2);
        raster.add_band("B4", Array2::from_elem((2, 2), 5.0)).unwrap();
        raster.add_band("B8", Array2::from_elem((2, 2), 7.0)).unwrap();
        let mut mask = Array2::from_elem((2, 2), true);
        mask[(0, 1)] = false;
        raster.update_mask(&mask).unwrap();
        assert!(raster.band("B4").unwrap()[(0, 1)].is_nan());
        assert!(raster.band("B8").unwrap()[(0, 1)].is_nan());
        assert_eq!(raster.band("B4").unwrap()[(0, 0)], 5.0);
    }

    #[test]
    fn test_roi_circle_contains_center() {
        let roi = Roi::circle(-1.84, -80.74, 5000.0).unwrap();
        assert!(roi.contains(-80.74, -1.84));
        // A point one degree of latitude away is well outside a 5km buffer
        assert!(!roi.contains(-80.74, -0.84));
    }

    #[test]
    fn test_roi_rejects_degenerate_inputs() {
        assert!(Roi::circle(0.0, 0.0, 0.0).is_err());
        assert!(Roi::bounding_box(1.0, 0.0, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_filter_date_range_is_inclusive_exclusive() {
        let transform = unit_transform();
        let make = |day: u32| Scene {
            id: format!("scene-{day}"),
            timestamp: DateTime::parse_from_rfc3339(&format!("2025-06-{day:02}T10:00:00Z"))
                .unwrap()
                .with_timezone(&Utc),
            raster: Raster::new(transform, 1, 1),
            metadata: SceneMetadata::default(),
        };
        let stack = SceneStack::new(vec![make(1), make(10), make(20)]);
        let filtered = stack.filter_date_range(
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, 20).unwrap(),
        );
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_histogram_mean_fallback() {
        let hist = Histogram {
            band: "NDVI".to_string(),
            bucket_means: vec![-0.5, 0.0, 0.5],
            counts: vec![1, 0, 3],
            min: -1.0,
            max: 1.0,
        };
        assert_eq!(hist.total_count(), 4);
        assert_relative_eq!(hist.mean().unwrap(), (-0.5 + 1.5) / 4.0);
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(SoilError::Cancelled)));
    }
}
