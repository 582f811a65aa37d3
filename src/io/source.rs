//! Imagery source collaborator.
//!
//! Scene retrieval is external to the core pipeline; the engines only
//! ever see in-memory scene stacks. `InMemorySource` is the reference
//! implementation of the query contract, used by tests and demos.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{Roi, Scene, SceneStack, SoilResult};

/// Metadata predicates applied when querying scenes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScenePredicates {
    /// Maximum scene-level cloud percentage admitted (None = no limit)
    pub max_cloud_percent: Option<f64>,
}

/// Abstract provider of dated, geo-referenced, multi-band scenes.
///
/// Implementations must return scenes geo-aligned to a common grid and
/// carry acquisition identities usable for joining base imagery with
/// probability imagery. Date ranges are inclusive start, exclusive end.
pub trait ImagerySource {
    /// Scenes intersecting the ROI within [start, end) passing the predicates
    fn query(
        &self,
        roi: &Roi,
        start: NaiveDate,
        end: NaiveDate,
        predicates: &ScenePredicates,
    ) -> SoilResult<SceneStack>;

    /// Per-pixel cloud probability scenes for the same region and range
    fn query_probability(&self, roi: &Roi, start: NaiveDate, end: NaiveDate)
        -> SoilResult<SceneStack>;
}

/// Deterministic in-memory imagery source
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    scenes: Vec<Scene>,
    probability: Vec<Scene>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scenes(mut self, scenes: Vec<Scene>) -> Self {
        self.scenes = scenes;
        self
    }

    pub fn with_probability(mut self, probability: Vec<Scene>) -> Self {
        self.probability = probability;
        self
    }

    pub fn push_scene(&mut self, scene: Scene) {
        self.scenes.push(scene);
    }

    pub fn push_probability(&mut self, scene: Scene) {
        self.probability.push(scene);
    }

    fn filter(
        scenes: &[Scene],
        roi: &Roi,
        start: NaiveDate,
        end: NaiveDate,
        predicates: &ScenePredicates,
    ) -> SceneStack {
        let selected: Vec<Scene> = scenes
            .iter()
            .filter(|scene| {
                let date = scene.date();
                if date < start || date >= end {
                    return false;
                }
                if !roi.intersects_bounds(scene.raster.bounds()) {
                    return false;
                }
                if let Some(max_cloud) = predicates.max_cloud_percent {
                    if scene.metadata.cloud_percent >= max_cloud {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        SceneStack::new(selected)
    }
}

impl ImagerySource for InMemorySource {
    fn query(
        &self,
        roi: &Roi,
        start: NaiveDate,
        end: NaiveDate,
        predicates: &ScenePredicates,
    ) -> SoilResult<SceneStack> {
        let stack = Self::filter(&self.scenes, roi, start, end, predicates);
        log::info!(
            "retrieved {} scenes for {} to {} (max cloud {:?})",
            stack.len(),
            start,
            end,
            predicates.max_cloud_percent
        );
        Ok(stack)
    }

    fn query_probability(
        &self,
        roi: &Roi,
        start: NaiveDate,
        end: NaiveDate,
    ) -> SoilResult<SceneStack> {
        let stack = Self::filter(
            &self.probability,
            roi,
            start,
            end,
            &ScenePredicates::default(),
        );
        log::info!("retrieved {} probability scenes", stack.len());
        Ok(stack)
    }
}
