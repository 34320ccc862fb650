//! Reading back a produced bundle archive.
//!
//! Unpacks the tarball into a scratch directory, walks `index.json` to the
//! root manifest, and recovers the embedded bundle definition. Also
//! verifies that every descriptor reachable from the index resolves to a
//! stored blob of the promised size, so `inspect` doubles as a consistency
//! check.

use std::fs;
use std::path::Path;

use bndl_oci::oci_client::manifest::OciImageManifest;
use bndl_oci::{Store, TITLE_ANNOTATION};
use tempfile::TempDir;

use crate::archive::unpack_archive;
use crate::bundle::{BUNDLE_FILE, Bundle};
use crate::{Error, Result};

/// What a bundle archive contains.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    /// Digest of the bundle root manifest.
    pub digest: String,
    /// The embedded (ref-rewritten) bundle definition.
    pub bundle: Bundle,
    /// Number of blobs present in the archive.
    pub blobs: usize,
}

/// Opens a produced `tar.zst` bundle archive and summarizes it.
pub fn inspect_archive(path: &Path) -> Result<ArchiveSummary> {
    let scratch = TempDir::new()?;
    unpack_archive(path, scratch.path())?;
    summarize_layout(scratch.path())
}

/// Summarizes an unpacked bundle image layout.
pub fn summarize_layout(root: &Path) -> Result<ArchiveSummary> {
    let store = Store::open(root)?;
    let index = store.read_index()?;
    let root_desc = match index.manifests.as_slice() {
        [entry] => entry,
        entries => {
            return Err(Error::Format(format!(
                "expected exactly 1 manifest in index, found {}",
                entries.len()
            )));
        }
    };

    let manifest_bytes = store.read_blob(&root_desc.digest)?;
    let manifest: OciImageManifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| Error::Format(format!("root manifest: {e}")))?;

    // Every directly referenced blob must be present at its declared size.
    let mut blobs = 1usize;
    for desc in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
        let blob_path = store.blob_path(&desc.digest)?;
        let len = fs::metadata(&blob_path)
            .map_err(|_| Error::Format(format!("missing blob {}", desc.digest)))?
            .len();
        if i64::try_from(len).unwrap_or(i64::MAX) != desc.size {
            return Err(Error::Format(format!(
                "blob {} has size {len}, descriptor says {}",
                desc.digest, desc.size
            )));
        }
        blobs += 1;
    }

    let yaml_desc = manifest
        .layers
        .iter()
        .find(|l| {
            l.annotations
                .as_ref()
                .and_then(|a| a.get(TITLE_ANNOTATION))
                .is_some_and(|t| t == BUNDLE_FILE)
        })
        .ok_or_else(|| Error::Format(format!("no {BUNDLE_FILE} layer in root manifest")))?;
    let yaml = store.read_blob(&yaml_desc.digest)?;
    let bundle = Bundle::from_yaml(
        std::str::from_utf8(&yaml)
            .map_err(|e| Error::Format(format!("{BUNDLE_FILE}: {e}")))?,
    )?;

    Ok(ArchiveSummary {
        digest: root_desc.digest.clone(),
        bundle,
        blobs,
    })
}
