//! Package mirroring into the bundle content store.
//!
//! One [`PackageMirror`] exists per package being assembled. The two
//! variants differ only in where bytes come from: [`RemoteMirror`] streams
//! from a registry, [`LocalMirror`] reads an extracted `tar.zst` archive.
//! Both land everything in the shared [`Store`] and hand back descriptors,
//! so the orchestrator never branches on source kind after construction.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use bndl_oci::oci_client::manifest::{OciDescriptor, OciImageIndex, OciImageManifest};
use bndl_oci::{
    MANIFEST_MEDIA_TYPE, PACKAGE_BLOB_MEDIA_TYPE, Reference, Registry, RegistryAuth, Store,
    TITLE_ANNOTATION, digest_hex,
};
use serde::Deserialize;
use tempfile::TempDir;
use tracing::debug;

use crate::bundle::{PACKAGE_FILE, Package};
use crate::progress::ProgressSink;
use crate::{Error, Result};

/// Mirrors one package into the bundle content store.
#[derive(Debug)]
pub enum PackageMirror<'a> {
    /// Package streamed from a remote registry.
    Remote(RemoteMirror<'a>),
    /// Package read from a local archive.
    Local(LocalMirror<'a>),
}

impl<'a> PackageMirror<'a> {
    /// Opens the mirror variant matching the package's declared source.
    ///
    /// Remote packages resolve and fetch their manifest here; local
    /// packages extract their archive and load their metadata here. Either
    /// way, construction failure is fatal for the bundle.
    pub async fn open(
        store: &'a Store,
        pkg: &Package,
        auth: RegistryAuth,
        insecure: bool,
    ) -> Result<PackageMirror<'a>> {
        match (&pkg.repository, &pkg.path) {
            (Some(repository), None) => Ok(Self::Remote(
                RemoteMirror::connect(store, &pkg.name, repository, &pkg.reference, auth, insecure)
                    .await?,
            )),
            (None, Some(path)) => {
                Ok(Self::Local(LocalMirror::open(store, &pkg.name, path).await?))
            }
            _ => Err(Error::Config(format!(
                "package {}: exactly one of repository or path is required",
                pkg.name
            ))),
        }
    }

    /// Pushes the package's OCI manifest into the store and returns its
    /// descriptor as stored, always typed as an OCI image manifest.
    pub fn push_manifest(&mut self) -> Result<OciDescriptor> {
        match self {
            Self::Remote(m) => m.push_manifest(),
            Self::Local(m) => m.push_manifest(),
        }
    }

    /// Pushes every blob the package manifest references (config first,
    /// then layers in manifest-declared order) and returns their
    /// descriptors. `index`/`total` position the package in the assembly
    /// for progress reporting.
    pub async fn push_layers(
        &mut self,
        progress: &dyn ProgressSink,
        index: usize,
        total: usize,
    ) -> Result<Vec<OciDescriptor>> {
        match self {
            Self::Remote(m) => m.push_layers(progress, index, total).await,
            Self::Local(m) => m.push_layers(progress, index, total),
        }
    }
}

/// Mirror variant streaming a package out of a remote registry.
#[derive(Debug)]
pub struct RemoteMirror<'a> {
    store: &'a Store,
    registry: Registry,
    reference: Reference,
    name: String,
    manifest: OciImageManifest,
    manifest_bytes: Vec<u8>,
    manifest_desc: OciDescriptor,
}

impl<'a> RemoteMirror<'a> {
    /// Resolves the package reference and fetches its manifest.
    async fn connect(
        store: &'a Store,
        name: &str,
        repository: &str,
        tag: &str,
        auth: RegistryAuth,
        insecure: bool,
    ) -> Result<RemoteMirror<'a>> {
        let registry = Registry::new(auth, insecure);
        let reference = Registry::parse_reference(&format!("{repository}:{tag}"))?;
        let (manifest_bytes, fetched) = registry.fetch_manifest(&reference).await?;
        let manifest: OciImageManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| Error::Format(format!("package {name}: manifest: {e}")))?;

        // The descriptor the bundle publishes is always an OCI image
        // manifest, whatever the source registry labelled it.
        let manifest_desc = OciDescriptor {
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            digest: fetched.digest,
            size: fetched.size,
            urls: None,
            annotations: Some(title_annotation(name)),
        };
        debug!(package = name, digest = %manifest_desc.digest, "resolved package manifest");

        Ok(RemoteMirror {
            store,
            registry,
            reference,
            name: name.to_string(),
            manifest,
            manifest_bytes,
            manifest_desc,
        })
    }

    fn push_manifest(&mut self) -> Result<OciDescriptor> {
        // Bytes are kept verbatim so the digest stays stable across the
        // source registry, the store, and any republish.
        self.store
            .put(&self.manifest_desc, &mut &self.manifest_bytes[..])?;
        Ok(self.manifest_desc.clone())
    }

    async fn push_layers(
        &mut self,
        progress: &dyn ProgressSink,
        index: usize,
        total: usize,
    ) -> Result<Vec<OciDescriptor>> {
        let blobs: Vec<OciDescriptor> = std::iter::once(self.manifest.config.clone())
            .chain(self.manifest.layers.iter().cloned())
            .collect();
        progress.start(blobs.len() as u64);

        for desc in &blobs {
            if self.store.contains(&desc.digest) {
                debug!(package = %self.name, digest = %desc.digest, "blob already mirrored");
                progress.advance(1);
                continue;
            }
            let staging = tempfile::NamedTempFile::new_in(self.store.root())?;
            self.registry
                .pull_blob(&self.reference, desc, staging.path())
                .await?;
            let mut file = fs::File::open(staging.path())?;
            self.store.put(desc, &mut file)?;
            progress.advance(1);
        }

        progress.success(&format!(
            "Fetched package {} ({index}/{total})",
            self.name
        ));
        Ok(blobs)
    }
}

/// Mirror variant reading a package from a local `tar.zst` archive.
///
/// The archive is a package export: an OCI image layout (single-manifest
/// `index.json` plus `blobs/sha256/*`) with the package's `zarf.yaml` at
/// the root. It is extracted into a scratch directory that lives exactly
/// as long as this mirror.
#[derive(Debug)]
pub struct LocalMirror<'a> {
    store: &'a Store,
    name: String,
    scratch: TempDir,
    manifest: OciImageManifest,
    meta: PackageMeta,
}

/// The slice of a package's `zarf.yaml` the bundler cares about.
#[derive(Debug, Clone, Default, Deserialize)]
struct PackageMeta {
    #[serde(default)]
    metadata: PackageMetaInner,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PackageMetaInner {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
}

impl<'a> LocalMirror<'a> {
    /// Extracts the package archive and loads its manifest and metadata.
    async fn open(store: &'a Store, name: &str, path: &str) -> Result<LocalMirror<'a>> {
        let scratch = TempDir::new()?;
        let archive = PathBuf::from(path);
        let dest = scratch.path().to_path_buf();

        // Extraction is blocking tar+zstd work; keep it off the runtime.
        tokio::task::spawn_blocking(move || crate::archive::unpack_archive(&archive, &dest))
            .await
            .map_err(|e| Error::Archive(format!("extraction task: {e}")))??;

        let meta = load_package_meta(scratch.path())?;
        let manifest = load_layout_manifest(scratch.path(), name)?;
        if !meta.metadata.name.is_empty() && meta.metadata.name != name {
            debug!(
                package = name,
                declared = %meta.metadata.name,
                "bundle entry name differs from package metadata name"
            );
        }
        debug!(package = name, layers = manifest.layers.len(), "loaded local package");

        Ok(LocalMirror {
            store,
            name: name.to_string(),
            scratch,
            manifest,
            meta,
        })
    }

    /// Rewrites the package manifest for bundle consumers and stores it.
    ///
    /// Layer and config descriptors are re-typed as opaque package blobs
    /// (digests untouched), so the stored manifest has a new digest of its
    /// own — the one embedded into the package's `ref` by the caller.
    fn push_manifest(&mut self) -> Result<OciDescriptor> {
        let mut manifest = self.manifest.clone();
        manifest.media_type = Some(MANIFEST_MEDIA_TYPE.to_string());
        manifest.config.media_type = PACKAGE_BLOB_MEDIA_TYPE.to_string();
        for layer in &mut manifest.layers {
            layer.media_type = PACKAGE_BLOB_MEDIA_TYPE.to_string();
        }
        let mut annotations = title_annotation(&self.name);
        if !self.meta.metadata.description.is_empty() {
            annotations.insert(
                bndl_oci::DESCRIPTION_ANNOTATION.to_string(),
                self.meta.metadata.description.clone(),
            );
        }
        manifest.annotations = Some(annotations.clone());

        let bytes = serde_json::to_vec(&manifest)?;
        let desc = self
            .store
            .write_blob(MANIFEST_MEDIA_TYPE, Some(annotations), &bytes)?;
        Ok(desc)
    }

    fn push_layers(
        &mut self,
        progress: &dyn ProgressSink,
        index: usize,
        total: usize,
    ) -> Result<Vec<OciDescriptor>> {
        let blobs: Vec<OciDescriptor> = std::iter::once(self.manifest.config.clone())
            .chain(self.manifest.layers.iter().cloned())
            .map(|mut d| {
                d.media_type = PACKAGE_BLOB_MEDIA_TYPE.to_string();
                d
            })
            .collect();
        progress.start(blobs.len() as u64);

        for desc in &blobs {
            if self.store.contains(&desc.digest) {
                progress.advance(1);
                continue;
            }
            let source = self
                .scratch
                .path()
                .join("blobs/sha256")
                .join(digest_hex(&desc.digest)?);
            let mut file = fs::File::open(&source).map_err(|e| {
                Error::Format(format!(
                    "package {}: missing blob {}: {e}",
                    self.name, desc.digest
                ))
            })?;
            self.store.put(desc, &mut file)?;
            progress.advance(1);
        }

        progress.success(&format!(
            "Loaded package {} ({index}/{total})",
            self.name
        ));
        Ok(blobs)
    }
}

/// Builds the standard title annotation map for a package.
fn title_annotation(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(TITLE_ANNOTATION.to_string(), name.to_string())])
}

/// Parses the package's `zarf.yaml` metadata document.
fn load_package_meta(root: &Path) -> Result<PackageMeta> {
    let path = root.join(PACKAGE_FILE);
    let yaml = fs::read_to_string(&path)
        .map_err(|e| Error::Format(format!("{PACKAGE_FILE}: {e}")))?;
    serde_yaml::from_str(&yaml).map_err(|e| Error::Format(format!("{PACKAGE_FILE}: {e}")))
}

/// Reads the single manifest out of an extracted OCI image layout.
fn load_layout_manifest(root: &Path, name: &str) -> Result<OciImageManifest> {
    let index_bytes = fs::read(root.join("index.json"))
        .map_err(|e| Error::Format(format!("package {name}: index.json: {e}")))?;
    let index: OciImageIndex = serde_json::from_slice(&index_bytes)
        .map_err(|e| Error::Format(format!("package {name}: index.json: {e}")))?;
    let entry = match index.manifests.as_slice() {
        [entry] => entry,
        entries => {
            return Err(Error::Format(format!(
                "package {name}: expected exactly 1 manifest in index, found {}",
                entries.len()
            )));
        }
    };
    let hex = digest_hex(&entry.digest)?;
    let manifest_bytes = fs::read(root.join("blobs/sha256").join(hex))
        .map_err(|e| Error::Format(format!("package {name}: manifest blob: {e}")))?;
    serde_json::from_slice(&manifest_bytes)
        .map_err(|e| Error::Format(format!("package {name}: manifest: {e}")))
}
