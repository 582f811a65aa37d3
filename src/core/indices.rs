//! Soil spectral indices.
//!
//! Each index is a pure per-pixel function of composite reflectance
//! bands (nominal 0-10000 scale). Division by zero yields NaN at that
//! pixel so downstream reductions treat it as missing data.

use ndarray::Zip;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::BandMapping;
use crate::types::{
    BandGrid, PixelValue, Raster, SoilResult, StatisticsReport, ValidityMask, REFLECTANCE_SCALE,
};

/// Default maximum NDVI for a pixel to count as bare soil
pub const DEFAULT_BARE_SOIL_NDVI_THRESHOLD: PixelValue = 0.3;

/// Default minimum BSI for a pixel to count as bare soil
pub const DEFAULT_BARE_SOIL_BSI_THRESHOLD: PixelValue = 100.0;

/// The soil spectral indices this engine can compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SoilIndex {
    /// Normalized Difference Soil Index: (SWIR1 - NIR) / (SWIR1 + NIR)
    Ndsi,
    /// Bare Soil Index: ((SWIR1+Red) - (NIR+Blue)) / ((SWIR1+Red) + (NIR+Blue))
    Bi,
    /// Bare Soil Index, SWIR2 variant rescaled to ~[0, 200]
    Bsi,
    /// Soil Color Index: (Red - Green) / (Red + Green)
    Ci,
    /// Normalized Difference Moisture Index: (NIR - SWIR1) / (NIR + SWIR1)
    Ndmi,
    /// Normalized Difference Vegetation Index: (NIR - Red) / (NIR + Red)
    Ndvi,
    /// Soil Saturation Index: (Red - Green) / (Red + Green + Blue)
    Ssi,
    /// Soil brightness: sqrt(Red^2 + NIR^2)
    Brightness,
    /// Clay minerals proxy: SWIR1 / SWIR2
    ClayIndex,
    /// Soil organic matter proxy from normalized visible bands
    SomIndex,
}

impl SoilIndex {
    pub const ALL: [SoilIndex; 10] = [
        SoilIndex::Ndsi,
        SoilIndex::Bi,
        SoilIndex::Bsi,
        SoilIndex::Ci,
        SoilIndex::Ndmi,
        SoilIndex::Ndvi,
        SoilIndex::Ssi,
        SoilIndex::Brightness,
        SoilIndex::ClayIndex,
        SoilIndex::SomIndex,
    ];

    /// Band name the index is stored under when appended to a composite
    pub fn band_name(&self) -> &'static str {
        match self {
            SoilIndex::Ndsi => "NDSI",
            SoilIndex::Bi => "BI",
            SoilIndex::Bsi => "BSI",
            SoilIndex::Ci => "CI",
            SoilIndex::Ndmi => "NDMI",
            SoilIndex::Ndvi => "NDVI",
            SoilIndex::Ssi => "SSI",
            SoilIndex::Brightness => "Brightness",
            SoilIndex::ClayIndex => "ClayIndex",
            SoilIndex::SomIndex => "SOM_Index",
        }
    }

    /// Resolve an index name; None for unrecognized names
    pub fn parse(name: &str) -> Option<SoilIndex> {
        SoilIndex::ALL.iter().copied().find(|i| i.band_name() == name)
    }

    /// Resolve a list of index names at the configuration boundary.
    ///
    /// Unrecognized names are skipped with a warning, never fatal.
    pub fn parse_names(names: &[String]) -> Vec<SoilIndex> {
        let mut out = Vec::new();
        for name in names {
            match SoilIndex::parse(name) {
                Some(index) => {
                    if !out.contains(&index) {
                        out.push(index);
                    }
                }
                None => log::warn!("unknown soil index '{}', skipping", name),
            }
        }
        out
    }
}

impl std::fmt::Display for SoilIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.band_name())
    }
}

/// Normalized difference of two bands: (a - b) / (a + b).
///
/// Zero denominators and NaN inputs produce NaN.
pub fn normalized_difference(a: &BandGrid, b: &BandGrid) -> BandGrid {
    Zip::from(a).and(b).map_collect(|&x, &y| {
        let denom = x + y;
        if denom == 0.0 {
            PixelValue::NAN
        } else {
            (x - y) / denom
        }
    })
}

/// Computes soil spectral indices from composite reflectance bands
#[derive(Debug, Clone, Default)]
pub struct IndexCalculator {
    bands: BandMapping,
}

impl IndexCalculator {
    pub fn new(bands: BandMapping) -> Self {
        Self { bands }
    }

    /// Compute a single index band from the raster's reflectance bands
    pub fn compute(&self, raster: &Raster, index: SoilIndex) -> SoilResult<BandGrid> {
        let b = &self.bands;
        let grid = match index {
            SoilIndex::Ndsi => normalized_difference(raster.band(&b.swir1)?, raster.band(&b.nir)?),
            SoilIndex::Ndmi => normalized_difference(raster.band(&b.nir)?, raster.band(&b.swir1)?),
            SoilIndex::Ndvi => normalized_difference(raster.band(&b.nir)?, raster.band(&b.red)?),
            SoilIndex::Ci => normalized_difference(raster.band(&b.red)?, raster.band(&b.green)?),
            SoilIndex::Bi => {
                let swir1 = raster.band(&b.swir1)?;
                let red = raster.band(&b.red)?;
                let nir = raster.band(&b.nir)?;
                let blue = raster.band(&b.blue)?;
                Zip::from(swir1)
                    .and(red)
                    .and(nir)
                    .and(blue)
                    .map_collect(|&s1, &r, &n, &bl| {
                        let denom = s1 + r + n + bl;
                        if denom == 0.0 {
                            PixelValue::NAN
                        } else {
                            ((s1 + r) - (n + bl)) / denom
                        }
                    })
            }
            SoilIndex::Bsi => {
                let swir2 = raster.band(&b.swir2)?;
                let red = raster.band(&b.red)?;
                let nir = raster.band(&b.nir)?;
                let blue = raster.band(&b.blue)?;
                Zip::from(swir2)
                    .and(red)
                    .and(nir)
                    .and(blue)
                    .map_collect(|&s2, &r, &n, &bl| {
                        let denom = s2 + r + n + bl;
                        if denom == 0.0 {
                            PixelValue::NAN
                        } else {
                            ((s2 + r) - (n + bl)) / denom * 100.0 + 100.0
                        }
                    })
            }
            SoilIndex::Ssi => {
                let red = raster.band(&b.red)?;
                let green = raster.band(&b.green)?;
                let blue = raster.band(&b.blue)?;
                Zip::from(red).and(green).and(blue).map_collect(|&r, &g, &bl| {
                    let denom = r + g + bl;
                    if denom == 0.0 {
                        PixelValue::NAN
                    } else {
                        (r - g) / denom
                    }
                })
            }
            SoilIndex::Brightness => {
                let red = raster.band(&b.red)?;
                let nir = raster.band(&b.nir)?;
                Zip::from(red)
                    .and(nir)
                    .map_collect(|&r, &n| (r * r + n * n).sqrt())
            }
            SoilIndex::ClayIndex => {
                let swir1 = raster.band(&b.swir1)?;
                let swir2 = raster.band(&b.swir2)?;
                Zip::from(swir1).and(swir2).map_collect(|&s1, &s2| {
                    if s2 == 0.0 {
                        PixelValue::NAN
                    } else {
                        s1 / s2
                    }
                })
            }
            SoilIndex::SomIndex => {
                let red = raster.band(&b.red)?;
                let green = raster.band(&b.green)?;
                Zip::from(red).and(green).map_collect(|&r, &g| {
                    let rn = r / REFLECTANCE_SCALE;
                    let gn = g / REFLECTANCE_SCALE;
                    let denom = rn + gn;
                    if denom == 0.0 {
                        PixelValue::NAN
                    } else {
                        1.0 - (2.5 * rn - gn) / denom
                    }
                })
            }
        };
        Ok(grid)
    }

    /// Append the requested index bands to a copy of the composite
    pub fn calculate_selected(&self, raster: &Raster, indices: &[SoilIndex]) -> SoilResult<Raster> {
        let mut out = raster.clone();
        let mut calculated = Vec::with_capacity(indices.len());
        for &index in indices {
            let grid = self.compute(raster, index)?;
            out.add_band(index.band_name(), grid)?;
            calculated.push(index.band_name());
        }
        log::info!("calculated indices: {}", calculated.join(", "));
        Ok(out)
    }

    /// Append every supported index band
    pub fn calculate_all(&self, raster: &Raster) -> SoilResult<Raster> {
        self.calculate_selected(raster, &SoilIndex::ALL)
    }

    /// Per-pixel bare soil mask: NDVI strictly below the vegetation
    /// threshold AND BSI strictly above the bare soil threshold.
    ///
    /// NDVI and BSI are computed on the fly when the raster does not
    /// already carry them. NaN in either index yields false.
    pub fn create_bare_soil_mask(
        &self,
        raster: &Raster,
        ndvi_threshold: PixelValue,
        bsi_threshold: PixelValue,
    ) -> SoilResult<ValidityMask> {
        let ndvi = match raster.band_opt(SoilIndex::Ndvi.band_name()) {
            Some(grid) => grid.clone(),
            None => self.compute(raster, SoilIndex::Ndvi)?,
        };
        let bsi = match raster.band_opt(SoilIndex::Bsi.band_name()) {
            Some(grid) => grid.clone(),
            None => self.compute(raster, SoilIndex::Bsi)?,
        };
        Ok(Zip::from(&ndvi)
            .and(&bsi)
            .map_collect(|&v, &s| v < ndvi_threshold && s > bsi_threshold))
    }
}

/// Rule-based interpretation of index statistics.
///
/// Maps mean values to soil condition descriptions; entries are only
/// produced for indices present in the report with computed statistics.
pub fn interpret_statistics(report: &StatisticsReport) -> BTreeMap<String, String> {
    let mut interpretations = BTreeMap::new();

    if let Some(stats) = report.computed("NDVI") {
        let text = if stats.mean < 0.2 {
            "sparse/bare - good for soil analysis"
        } else if stats.mean < 0.4 {
            "moderate vegetation cover"
        } else {
            "dense vegetation - soil may be obscured"
        };
        interpretations.insert("vegetation".to_string(), text.to_string());
    }

    if let Some(stats) = report.computed("NDMI") {
        let text = if stats.mean < 0.0 {
            "dry conditions"
        } else if stats.mean < 0.2 {
            "moderate moisture"
        } else {
            "high moisture content"
        };
        interpretations.insert("moisture".to_string(), text.to_string());
    }

    if let Some(stats) = report.computed("CI") {
        let text = if stats.mean > 0.1 {
            "reddish soil - possible iron oxidation"
        } else if stats.mean < -0.1 {
            "greenish/dark soil"
        } else {
            "neutral soil color"
        };
        interpretations.insert("soil_color".to_string(), text.to_string());
    }

    if let Some(stats) = report.computed("BSI") {
        let text = if stats.mean > 120.0 {
            "high bare soil exposure"
        } else if stats.mean > 100.0 {
            "moderate bare soil"
        } else {
            "low bare soil index"
        };
        interpretations.insert("bare_soil".to_string(), text.to_string());
    }

    if let Some(stats) = report.computed("ClayIndex") {
        let text = if stats.mean > 1.5 {
            "potentially high clay content"
        } else if stats.mean > 1.2 {
            "moderate clay indicators"
        } else {
            "lower clay indicators"
        };
        interpretations.insert("clay_content".to_string(), text.to_string());
    }

    interpretations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn reflectance_raster(values: &[(&str, PixelValue)]) -> Raster {
        let transform = GeoTransform::new(0.0, 0.0, 0.0001, -0.0001);
        let mut raster = Raster::new(transform, 2, 2);
        for (name, value) in values {
            raster
                .add_band(*name, Array2::from_elem((2, 2), *value))
                .unwrap();
        }
        raster
    }

    #[test]
    fn test_ndvi_formula() {
        let raster = reflectance_raster(&[("B8", 8000.0), ("B4", 4000.0)]);
        let calc = IndexCalculator::default();
        let ndvi = calc.compute(&raster, SoilIndex::Ndvi).unwrap();
        assert_relative_eq!(ndvi[(0, 0)], (8000.0 - 4000.0) / (8000.0 + 4000.0));
    }

    #[test]
    fn test_zero_denominator_yields_nan() {
        let raster = reflectance_raster(&[("B8", 0.0), ("B4", 0.0)]);
        let calc = IndexCalculator::default();
        let ndvi = calc.compute(&raster, SoilIndex::Ndvi).unwrap();
        assert!(ndvi[(0, 0)].is_nan());
    }

    #[test]
    fn test_som_index_value() {
        // Red 2000, Green 1000: rn=0.2, gn=0.1 -> 1 - (0.5-0.1)/0.3
        let raster = reflectance_raster(&[("B4", 2000.0), ("B3", 1000.0)]);
        let calc = IndexCalculator::default();
        let som = calc.compute(&raster, SoilIndex::SomIndex).unwrap();
        assert_relative_eq!(som[(0, 0)], 1.0 - (0.5 - 0.1) / 0.3, epsilon = 1e-6);
    }

    #[test]
    fn test_parse_names_skips_unknown() {
        let names = vec![
            "NDVI".to_string(),
            "FOO".to_string(),
            "BSI".to_string(),
            "NDVI".to_string(),
        ];
        let parsed = SoilIndex::parse_names(&names);
        assert_eq!(parsed, vec![SoilIndex::Ndvi, SoilIndex::Bsi]);
    }

    #[test]
    fn test_missing_band_is_fatal() {
        let raster = reflectance_raster(&[("B8", 8000.0)]);
        let calc = IndexCalculator::default();
        assert!(calc.compute(&raster, SoilIndex::Ndvi).is_err());
    }
}
