//! Bundler for OCI-packaged deployment units.
//!
//! Assembles previously built deployment packages — each an OCI image
//! manifest with its own layer blobs — into one higher-level OCI artifact,
//! and serializes that artifact either as a `tar.zst` image layout on disk
//! or straight to a remote registry.
//!
//! # Dataflow
//!
//! ```text
//! Bundler (public API)
//!  ├── assemble   — per-package mirroring into a scratch content store
//!  │    ├── PackageMirror::Remote  (registry → store)
//!  │    └── PackageMirror::Local   (tar.zst archive → store)
//!  ├── compose    — root manifest + config over the mirrored descriptors
//!  └── sink
//!       ├── archive  — tar+zstd image layout tarball
//!       └── publish  — blobs + tagged manifest at a remote reference
//! ```
//!
//! Assembly is sequential over the declared package order; blob identity is
//! the sha256 digest everywhere, and the store deduplicates across
//! packages. All state lives in scratch directories owned by the call —
//! there are no process globals, and progress is reported through an
//! injected [`ProgressSink`].

#![allow(clippy::missing_docs_in_private_items)]

mod archive;
mod assemble;
mod bundle;
mod compose;
mod error;
mod inspect;
mod mirror;
mod progress;
mod publish;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bndl_oci::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;

use assemble::Mode;

pub use bndl_oci::{Reference, RegistryAuth, Store};
pub use bundle::{
    BUNDLE_FILE, BuildMetadata, Bundle, BundleMetadata, PACKAGE_FILE, Package, SIGNATURE_FILE,
};
pub use error::{Error, Result};
pub use inspect::{ArchiveSummary, inspect_archive, summarize_layout};
pub use mirror::PackageMirror;
pub use progress::{NoProgress, ProgressSink};

/// Result of a successful tarball creation.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct CreateOutput {
    /// Path of the produced `tar.zst` archive.
    pub path: PathBuf,
    /// Digest of the bundle root manifest.
    pub digest: String,
    /// Per-invocation log of what was assembled.
    pub log: Vec<String>,
}

/// Result of a successful publish.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct PublishOutput {
    /// The destination reference the bundle was tagged at.
    pub reference: String,
    /// Digest of the bundle root manifest.
    pub digest: String,
    /// Per-invocation log, ending with follow-up command hints.
    pub log: Vec<String>,
}

/// Assembles bundles from a bundle definition.
///
/// Construction is cheap; one `Bundler` can run many assemblies. Progress
/// reporting and cancellation are injected so the engine stays free of
/// terminal and signal concerns.
pub struct Bundler {
    /// Sink for progress events.
    progress: Arc<dyn ProgressSink>,
    /// Cooperative cancellation for in-flight assemblies.
    cancel: CancellationToken,
    /// Registry credentials for remote packages and publishing.
    auth: RegistryAuth,
    /// Use plain HTTP toward registries (local development only).
    insecure: bool,
}

impl std::fmt::Debug for Bundler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundler")
            .field("insecure", &self.insecure)
            .finish_non_exhaustive()
    }
}

impl Default for Bundler {
    fn default() -> Self {
        Self::new()
    }
}

impl Bundler {
    /// Creates a bundler with no progress output and anonymous registry
    /// access.
    pub fn new() -> Self {
        Self {
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
            auth: RegistryAuth::Anonymous,
            insecure: false,
        }
    }

    /// Installs a progress sink.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Installs a cancellation token observed at every suspension point.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Installs registry credentials.
    #[must_use]
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Switches registry traffic to plain HTTP.
    #[must_use]
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Assembles the bundle and writes it as
    /// `uds-bundle-<name>-<arch>-<version>.tar.zst` under `dest_dir`.
    ///
    /// Local package refs in `bundle` are rewritten to embed their mirrored
    /// manifest digests. A provided `signature` is embedded verbatim as the
    /// final layer.
    pub async fn create(
        &self,
        bundle: &mut Bundle,
        dest_dir: &Path,
        signature: Option<&[u8]>,
    ) -> Result<CreateOutput> {
        let assembly = assemble::assemble(
            bundle,
            signature,
            &self.auth,
            self.insecure,
            self.progress.as_ref(),
            &self.cancel,
            Mode::Create,
        )
        .await?;

        let paths = assembly.store.enumerate()?;
        let path = dest_dir.join(bundle.archive_name());
        archive::archive(&paths, &path, self.progress.as_ref(), &self.cancel).await?;

        let digest = assembly.root.manifest_desc.digest.clone();
        let mut log = assembly.log.clone();
        log.push(format!("Created {}", path.display()));
        info!(path = %path.display(), %digest, "created bundle");
        self.progress
            .success(&format!("Created bundle {}", path.display()));

        Ok(CreateOutput { path, digest, log })
    }

    /// Assembles the bundle and publishes it to `destination`
    /// (`repository:tag`).
    ///
    /// Remote packages are referenced in place; local packages are uploaded
    /// in full. The tagged root manifest is pushed last, so the reference
    /// only ever points at a complete bundle.
    pub async fn publish(
        &self,
        bundle: &mut Bundle,
        destination: &str,
        signature: Option<&[u8]>,
    ) -> Result<PublishOutput> {
        let reference = Registry::parse_reference(destination)?;
        let assembly = assemble::assemble(
            bundle,
            signature,
            &self.auth,
            self.insecure,
            self.progress.as_ref(),
            &self.cancel,
            Mode::Publish,
        )
        .await?;

        let plan = publish::plan(&assembly);
        let registry = Registry::new(self.auth.clone(), self.insecure);
        let summary = publish::push(
            &assembly,
            &plan,
            &registry,
            &reference,
            self.progress.as_ref(),
            &self.cancel,
        )
        .await?;

        let digest = assembly.root.manifest_desc.digest.clone();
        let mut log = assembly.log.clone();
        log.extend(summary);

        Ok(PublishOutput {
            reference: reference.to_string(),
            digest,
            log,
        })
    }
}
