use thiserror::Error;

/// boxroot error types
#[derive(Error, Debug)]
pub enum BoxError {
    /// External HTTP client could not be launched or exited abnormally
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Registry answered with a non-2xx status
    #[error("Registry error: {registry} {status} - {message}")]
    RegistryError {
        registry: String,
        status: u16,
        message: String,
    },

    /// No manifest in an index matches the requested platform
    #[error(
        "No image for architecture '{architecture}' in manifest list (available: {})",
        available.join(", ")
    )]
    ResolutionError {
        architecture: String,
        available: Vec<String>,
    },

    /// OCI layout could not be assembled
    #[error("Assembly error: {0}")]
    AssemblyError(String),

    /// Downloaded blob content does not hash to its digest
    #[error("Digest mismatch for {digest}: content hashes to {actual}")]
    DigestMismatch { digest: String, actual: String },

    /// Every extraction strategy failed for a layer
    #[error("Extraction error: {layer} - {message}")]
    ExtractionError { layer: String, message: String },

    /// Rootfs is missing required content
    #[error("Rootfs validation failed: missing {}", .0.join("; "))]
    ValidationError(Vec<String>),

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Rootfs cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for BoxError {
    fn from(err: serde_json::Error) -> Self {
        BoxError::SerializationError(err.to_string())
    }
}

/// Result type alias for boxroot operations
pub type Result<T> = std::result::Result<T, BoxError>;
