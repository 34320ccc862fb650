//! OCI primitives for the bndl bundler.
//!
//! Provides the two leaf components every bundle assembly runs on: a local
//! content-addressable [`Store`] laid out as an OCI image layout, and a
//! [`Registry`] client speaking the OCI distribution protocol. Powered by
//! [`oci_client`].
//!
//! # Architecture
//!
//! ```text
//! Store (content-addressable OCI image layout)
//!  ├── oci-layout          — layout version marker
//!  ├── index.json          — single-entry image index
//!  └── blobs/sha256/{hex}  — manifests, configs, and layer blobs
//! Registry (oci_client::Client)
//!  ├── resolve / fetch     — manifests and blobs, streamed to disk
//!  └── push                — blobs and tagged manifests
//! ```

#![allow(clippy::missing_docs_in_private_items)]

mod registry;
mod store;

use sha2::{Digest, Sha256};

pub use registry::Registry;
pub use store::{PathMap, Store};

// Re-export the client crate; its manifest types are the wire vocabulary
// of every public API in this workspace.
pub use oci_client;
pub use oci_client::Reference;
pub use oci_client::secrets::RegistryAuth;

/// Result type for bndl-oci operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from content store and registry operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The image reference string could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// The registry denied authentication (401/403).
    #[error("registry authentication denied: {0}")]
    Auth(String),

    /// The referenced manifest does not exist at the registry.
    #[error("manifest not found: {0}")]
    NotFound(String),

    /// Transport-level failure talking to the registry. Retryable.
    #[error("registry transport: {0}")]
    Network(String),

    /// OCI distribution protocol error.
    #[error("registry: {0}")]
    Registry(String),

    /// Blob content did not match its descriptor.
    #[error("integrity: expected {expected}, got {actual}")]
    Integrity {
        /// Digest or size the descriptor promised.
        expected: String,
        /// Digest or size actually observed.
        actual: String,
    },

    /// Malformed manifest, index, or digest.
    #[error("format: {0}")]
    Format(String),

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if the operation may succeed on a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Media type of an OCI image manifest.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// Media type of an OCI image config blob.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
/// Media type of an OCI image index.
pub const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// Media type of an opaque package layer blob inside a bundle.
pub const PACKAGE_BLOB_MEDIA_TYPE: &str = "application/vnd.zarf.layer.v1.blob";

/// Standard OCI annotation key for a human-readable title.
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";
/// Standard OCI annotation key for a human-readable description.
pub const DESCRIPTION_ANNOTATION: &str = "org.opencontainers.image.description";
/// Standard OCI annotation key for the project URL.
pub const URL_ANNOTATION: &str = "org.opencontainers.image.url";
/// Standard OCI annotation key for the authors list.
pub const AUTHORS_ANNOTATION: &str = "org.opencontainers.image.authors";
/// Standard OCI annotation key for the documentation URL.
pub const DOCUMENTATION_ANNOTATION: &str = "org.opencontainers.image.documentation";
/// Standard OCI annotation key for the source URL.
pub const SOURCE_ANNOTATION: &str = "org.opencontainers.image.source";
/// Standard OCI annotation key for the vendor name.
pub const VENDOR_ANNOTATION: &str = "org.opencontainers.image.vendor";

/// Computes the `sha256:{hex}` digest of a byte slice.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

/// Extracts the hex portion of a `sha256:{hex}` digest string.
///
/// Fails with [`Error::Format`] unless the algorithm is sha256 and the hex
/// part is 64 lowercase hex characters — the only digest form accepted
/// anywhere in this workspace.
pub fn digest_hex(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| Error::Format(format!("unsupported digest: {digest}")))?;
    if hex.len() != 64 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(Error::Format(format!("malformed digest: {digest}")));
    }
    Ok(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_empty_input() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn digest_hex_accepts_canonical_form() {
        let digest = sha256_digest(b"blob");
        let hex = digest_hex(&digest).unwrap();
        assert_eq!(hex.len(), 64);
        assert!(digest.ends_with(hex));
    }

    #[test]
    fn digest_hex_rejects_other_algorithms() {
        assert!(digest_hex("sha512:abcd").is_err());
        assert!(digest_hex("e3b0c44298fc1c149afbf4c8996fb924").is_err());
        assert!(digest_hex("sha256:XYZ").is_err());
    }
}
