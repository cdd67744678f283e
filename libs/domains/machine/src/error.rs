use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while deriving the machine structure.
#[derive(Error, Debug)]
pub enum MachineError {
    /// `WORKERS` was empty or contained no usable entries.
    #[error("WORKERS is empty; expected 'type:count,...' (e.g. \"comfyui:1,ollama:1\")")]
    MissingWorkers,

    /// A worker type that the service mapping does not know about.
    #[error("Unknown worker type '{requested}' (available: {})", .available.join(", "))]
    UnknownWorkerType {
        requested: String,
        available: Vec<String>,
    },

    /// A `WORKERS` entry that could not be parsed.
    #[error("Invalid WORKERS entry '{entry}': {details}")]
    InvalidWorkerSpec { entry: String, details: String },

    /// The process descriptor file does not exist.
    #[error("Process descriptor not found at {}", .0.display())]
    DescriptorMissing(PathBuf),

    /// The process descriptor file exists but could not be parsed.
    #[error("Failed to parse process descriptor: {0}")]
    DescriptorMalformed(#[source] serde_json::Error),

    /// I/O failure while reading the descriptor.
    #[error("Failed to read process descriptor: {0}")]
    DescriptorUnreadable(#[source] std::io::Error),
}
