//! Error types for leafcare

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a classifier backend while processing an image
#[derive(Error, Debug)]
pub enum ClassificationError {
    #[error("Image is empty: {}", .0.display())]
    EmptyImage(PathBuf),

    #[error("Unsupported image type: {}", .0.display())]
    UnsupportedImage(PathBuf),

    #[error("Image too large: {} ({size} bytes, max {max})", .path.display())]
    ImageTooLarge { path: PathBuf, size: u64, max: u64 },

    #[error("Failed to read image {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Model server error: {0}")]
    Server(String),

    #[error("Embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Top-level error type for leafcare
#[derive(Error, Debug)]
pub enum LeafcareError {
    #[error("Classification failed: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Invalid feedback: {0}")]
    InvalidFeedback(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capacity invariant violated in {store}: {len} > {capacity}")]
    CapacityInvariant {
        store: &'static str,
        len: usize,
        capacity: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, LeafcareError>;
