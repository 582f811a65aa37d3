//! soilsense: A Fast, Modular Sentinel-2 Soil Spectral Analysis Engine
//!
//! This library derives soil-quality indicators from time series of
//! multi-band optical satellite imagery: cloud/shadow masking, temporal
//! compositing, spectral index computation, and region-scoped
//! statistics and histograms. All processing operates on in-memory
//! rasters; scene retrieval sits behind the [`io::ImagerySource`] trait.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::{AnalysisConfig, BandMapping};
pub use core::{
    AnalysisRequest, AnalysisResults, CloudMaskEngine, CloudMaskParams, CompositeEngine,
    CompositeMethod, HistogramBuilder, IndexCalculator, SoilAnalysisEngine, SoilIndex,
    ZonalStatisticsEngine,
};
pub use io::{ImagerySource, InMemorySource, ScenePredicates};
pub use types::{
    BandStatistics, CancellationToken, GeoTransform, Histogram, IndexStatsEntry, Raster, Roi,
    Scene, SceneMetadata, SceneStack, SoilError, SoilResult, StatisticsReport, StatsFailure,
    ValidityMask,
};
