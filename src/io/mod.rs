//! Collaborator interfaces for scene retrieval

pub mod source;

pub use source::{ImagerySource, InMemorySource, ScenePredicates};
