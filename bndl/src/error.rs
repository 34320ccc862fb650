//! Error types for bundle assembly.

/// Alias for `Result<T, bndl::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by bundle assembly operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The bundle definition violates its schema (missing architecture,
    /// package with neither repository nor path, duplicate names).
    #[error("configuration: {0}")]
    Config(String),

    /// A manifest, index, or package metadata document is malformed.
    #[error("format: {0}")]
    Format(String),

    /// A package archive failed to extract cleanly.
    #[error("corrupt package archive: {0}")]
    Integrity(String),

    /// The archival pipeline failed.
    #[error("archive: {0}")]
    Archive(String),

    /// Assembly was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Content store or registry failure.
    #[error(transparent)]
    Oci(#[from] bndl_oci::Error),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML serialization error.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}
