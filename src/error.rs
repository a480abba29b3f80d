use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShapeVisionError {
    /// A kernel or pooling window does not fit the grid it is applied to.
    #[error("dimension error: {0}")]
    Dimension(String),

    #[error("comparison error: row of length {actual} compared against reference of length {expected}")]
    Comparison { expected: usize, actual: usize },

    #[error("no reference rows stored for kernel '{0}'")]
    MissingReferences(String),

    #[error("no pooled map was produced for kernel '{0}'")]
    MissingPooledMap(String),

    #[error("pooling made no progress: {0}")]
    NoPoolingProgress(String),

    #[error("verdict requested without any candidate shapes")]
    EmptyCandidates,

    #[error("cosine and euclidian scores disagree on candidate shapes: {0}")]
    MismatchedCandidates(String),

    #[error("unknown shape '{0}'")]
    UnknownShape(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("worker pool error: {0}")]
    WorkerPool(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("worker task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ShapeVisionError>;
