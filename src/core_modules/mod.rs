pub mod feature_extractor;
pub mod grid;
pub mod kernel;
pub mod metrics;
pub mod reference_store;
pub mod shape;
pub mod similarity_analyzer;
pub mod utils;
pub mod verdict;
