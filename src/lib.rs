// THEORY:
// This file is the main entry point for the `shape_vision` library crate.
// It defines the public API exposed to the command-line front end and to any other
// consumer that wants to classify images against trained shape templates.
//
// The high-level interfaces are `ShapePipeline` (one image at a time, synchronous)
// and `BatchRunner` (whole directories on a tokio worker pool). Both are driven by a
// `ClassifierConfig`. The algorithmic units they compose live in `core_modules`:
// the feature extractor, the similarity analyzer, the verdict engine and the
// reference store they share.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use config::{ClassifierConfig, ImageConfig};
pub use core_modules::reference_store::{JsonFileStore, MemoryStore, ReferenceStore, StoreSession};
pub use core_modules::verdict::{DecisionRule, Label, Verdict, VerdictEngine, VerdictPolicy};
pub use error::{Result, ShapeVisionError};
pub use parallel_pipeline::BatchRunner;
pub use pipeline::ShapePipeline;
