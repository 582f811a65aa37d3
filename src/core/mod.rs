//! Core raster processing modules

pub mod cloud_mask;
pub mod composite;
pub mod histogram;
pub mod indices;
pub mod pipeline;
pub mod statistics;

pub use cloud_mask::{CloudMaskEngine, CloudMaskParams, ShadowParams};
pub use composite::{CompositeEngine, CompositeMethod};
pub use histogram::{HistogramBuilder, DEFAULT_BUCKET_COUNT};
pub use indices::{IndexCalculator, SoilIndex};
pub use pipeline::{AnalysisRequest, AnalysisResults, SoilAnalysisEngine};
pub use statistics::ZonalStatisticsEngine;

use crate::types::GeoTransform;

/// Sampling stride for region reductions at a target scale in meters.
///
/// One pixel per `scale_m / resolution` in each direction, never below
/// one (native resolution).
pub(crate) fn sample_stride(transform: &GeoTransform, scale_m: f64) -> usize {
    let resolution = transform.resolution_meters().max(1e-6);
    ((scale_m / resolution).round() as usize).max(1)
}
