// Licensed under the Apache-2.0 license

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImageError>;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("File {0} is not found")]
    MissingFile(String),
    #[error("Component {component} size {size:#x} exceeds partition {partition} size {part_size:#x}")]
    ComponentExceedsPartition {
        component: String,
        partition: String,
        size: u64,
        part_size: u64,
    },
    #[error("Component {0} is too large: {1}")]
    ComponentTooLarge(String, String),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Checksum is error: {0:#010x}")]
    ChecksumMismatch(u32),
    #[error("Loader {0} is too large: {1} bytes, limit is 4 MiB")]
    LoaderTooLarge(String, usize),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Tool {tool} failed: {reason}")]
    Tool { tool: String, reason: String },
    #[error("Failed to access {}: {source}", path.display())]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

impl ImageError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ImageError::Config(msg.into())
    }

    /// Wraps an I/O error with the path it happened on.
    pub(crate) fn file(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ImageError::File { path, source }
    }
}
