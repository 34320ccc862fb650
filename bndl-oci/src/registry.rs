//! OCI distribution client: resolve, fetch, and push.
//!
//! Thin wrapper over [`oci_client::Client`] that classifies protocol errors
//! into the workspace taxonomy and retries transport failures with
//! exponential backoff. Digest verification of downloaded blobs happens in
//! the content store, not here; the transport check inside `oci_client` is
//! treated as advisory.

use std::path::Path;
use std::time::Duration;

use oci_client::Reference;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::errors::{DigestError, OciDistributionError};
use oci_client::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use oci_client::RegistryOperation;
use tracing::debug;

use crate::{Error, MANIFEST_MEDIA_TYPE, Result};

/// Manifest media types accepted when resolving a reference.
const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    MANIFEST_MEDIA_TYPE,
    "application/vnd.docker.distribution.manifest.v2+json",
];

/// Transport retry attempts per operation.
const MAX_ATTEMPTS: u32 = 3;

/// Client for one remote repository connection.
///
/// Created per child package and released at child completion; the
/// underlying HTTP client pools connections internally.
pub struct Registry {
    /// OCI distribution HTTP client.
    client: oci_client::Client,
    /// Registry authentication credentials.
    auth: RegistryAuth,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    /// Creates a client with explicit credentials.
    ///
    /// `insecure` switches the distribution endpoint to plain HTTP, for
    /// local development registries.
    pub fn new(auth: RegistryAuth, insecure: bool) -> Self {
        let protocol = if insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = oci_client::Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });
        Self { client, auth }
    }

    /// Creates an anonymous HTTPS client.
    pub fn anonymous() -> Self {
        Self::new(RegistryAuth::Anonymous, false)
    }

    /// Parses an image reference string.
    pub fn parse_reference(image: &str) -> Result<Reference> {
        image
            .parse()
            .map_err(|e: oci_client::ParseError| Error::InvalidReference(e.to_string()))
    }

    /// Resolves a reference to the descriptor of the manifest it names.
    pub async fn resolve(&self, reference: &Reference) -> Result<OciDescriptor> {
        let (_, desc) = self.fetch_manifest(reference).await?;
        Ok(desc)
    }

    /// Fetches the raw manifest bytes a reference names, plus the
    /// descriptor computed from those bytes (digest-stable).
    pub async fn fetch_manifest(
        &self,
        reference: &Reference,
    ) -> Result<(Vec<u8>, OciDescriptor)> {
        let mut attempt = 0;
        let (bytes, digest) = loop {
            match self
                .client
                .pull_manifest_raw(reference, &self.auth, ACCEPTED_MANIFEST_TYPES)
                .await
            {
                Ok(v) => break v,
                Err(e) => retry_or_fail(&mut attempt, e, "fetch manifest").await?,
            }
        };
        let media_type = manifest_media_type(&bytes);
        let desc = OciDescriptor {
            media_type,
            digest,
            size: i64::try_from(bytes.len()).unwrap_or(i64::MAX),
            urls: None,
            annotations: None,
        };
        Ok((bytes.to_vec(), desc))
    }

    /// Streams the blob named by `layer` into the file at `dest`.
    ///
    /// The file is truncated and re-fetched on transport retries, so a
    /// partial download never survives into the committed blob.
    pub async fn pull_blob(
        &self,
        reference: &Reference,
        layer: &OciDescriptor,
        dest: &Path,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            let mut file = tokio::fs::File::create(dest).await?;
            match self.client.pull_blob(reference, layer, &mut file).await {
                Ok(()) => return Ok(()),
                Err(e) => retry_or_fail(&mut attempt, e, "pull blob").await?,
            }
        }
    }

    /// Uploads a blob to the repository named by `reference`.
    ///
    /// Registries treat blob uploads as idempotent by digest, so retrying
    /// after a transport failure is safe.
    pub async fn push_blob(
        &self,
        reference: &Reference,
        data: Vec<u8>,
        digest: &str,
    ) -> Result<()> {
        self.authenticate(reference, RegistryOperation::Push).await?;
        let mut attempt = 0;
        loop {
            match self
                .client
                .push_blob(reference, data.clone(), digest)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => retry_or_fail(&mut attempt, e, "push blob").await?,
            }
        }
    }

    /// Uploads a manifest and tags it with the reference's tag.
    pub async fn push_manifest(
        &self,
        reference: &Reference,
        manifest: &OciImageManifest,
    ) -> Result<String> {
        self.authenticate(reference, RegistryOperation::Push).await?;
        let mut attempt = 0;
        loop {
            match self
                .client
                .push_manifest(reference, &OciManifest::Image(manifest.clone()))
                .await
            {
                Ok(url) => return Ok(url),
                Err(e) => retry_or_fail(&mut attempt, e, "push manifest").await?,
            }
        }
    }

    /// Performs the auth handshake for an operation on a repository.
    async fn authenticate(
        &self,
        reference: &Reference,
        operation: RegistryOperation,
    ) -> Result<()> {
        self.client
            .auth(reference, &self.auth, operation)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// Reads the `mediaType` field out of raw manifest bytes.
fn manifest_media_type(bytes: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct MediaTypeOnly {
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
    }
    serde_json::from_slice::<MediaTypeOnly>(bytes)
        .ok()
        .and_then(|m| m.media_type)
        .unwrap_or_else(|| MANIFEST_MEDIA_TYPE.to_string())
}

/// Maps a client error into the workspace taxonomy.
fn classify(err: OciDistributionError) -> Error {
    match err {
        OciDistributionError::UnauthorizedError { url } => Error::Auth(url),
        OciDistributionError::AuthenticationFailure(msg) => Error::Auth(msg),
        OciDistributionError::ImageManifestNotFoundError(msg) => Error::NotFound(msg),
        OciDistributionError::DigestError(DigestError::VerificationError { expected, actual }) => {
            Error::Integrity { expected, actual }
        }
        OciDistributionError::RequestError(e) => Error::Network(e.to_string()),
        OciDistributionError::IoError(e) => Error::Io(e),
        other => Error::Registry(other.to_string()),
    }
}

/// Classifies `err`; sleeps and returns `Ok` if another attempt is allowed,
/// otherwise surfaces the classified error.
async fn retry_or_fail(
    attempt: &mut u32,
    err: OciDistributionError,
    op: &str,
) -> Result<()> {
    let err = classify(err);
    *attempt += 1;
    if *attempt >= MAX_ATTEMPTS || !err.is_retryable() {
        return Err(err);
    }
    let delay = backoff_delay(*attempt);
    debug!(op, attempt, ?delay, "transport failure, retrying");
    tokio::time::sleep(delay).await;
    Ok(())
}

/// Exponential backoff: 250ms, 500ms, 1s, ...
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(250u64.saturating_mul(1 << attempt.min(6)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn media_type_read_from_manifest_bytes() {
        let bytes = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json"}"#;
        assert_eq!(manifest_media_type(bytes), MANIFEST_MEDIA_TYPE);
        // Absent field falls back to the OCI manifest type.
        assert_eq!(manifest_media_type(br#"{"schemaVersion":2}"#), MANIFEST_MEDIA_TYPE);
    }

    #[test]
    fn parse_reference_rejects_garbage() {
        assert!(Registry::parse_reference("not a ref!").is_err());
        assert!(Registry::parse_reference("registry.example/repo:1.0").is_ok());
    }
}
