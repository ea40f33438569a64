use thiserror::Error;

/// Errors that can occur while preparing or running column-type training.
#[derive(Debug, Error)]
pub enum CtaError {
    /// Filesystem failure (config, dataset or checkpoint I/O).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON document could not be parsed or produced.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The training configuration is missing a value or holds an invalid one.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Candle ML framework error.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// The tokenizer could not be loaded or failed to encode.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// A dataset record is malformed.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// A label or prediction is not a valid class index.
    #[error("label {label} out of range for {num_classes} classes")]
    LabelOutOfRange {
        /// Offending class index.
        label: u32,
        /// Configured number of classes.
        num_classes: usize,
    },

    /// Two sequences or tensors that must agree in shape do not.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A checkpoint file is incomplete or inconsistent with the running model.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

/// Result type alias for column-type training operations.
pub type Result<T> = std::result::Result<T, CtaError>;
