//! Top-level bundle assembly.
//!
//! Drives the ordered package list from the bundle definition: each
//! package is fully mirrored into a scratch content store before the next
//! begins, then the bundle definition, signature, config, and root
//! manifest are composed on top and the index is rewritten exactly once.

use std::collections::BTreeMap;

use bndl_oci::oci_client::manifest::OciDescriptor;
use bndl_oci::{PACKAGE_BLOB_MEDIA_TYPE, RegistryAuth, Store, TITLE_ANNOTATION};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bundle::{BUNDLE_FILE, Bundle, SIGNATURE_FILE};
use crate::compose::{self, RootManifest};
use crate::mirror::PackageMirror;
use crate::progress::ProgressSink;
use crate::{Error, Result};

/// What the assembled store is destined for.
///
/// A tarball must be transitively complete, so remote packages get their
/// layer blobs mirrored. A published bundle references remote packages in
/// their source registries, so only their manifests are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Producing a local tarball.
    Create,
    /// Publishing to a remote registry.
    Publish,
}

/// One mirrored package: its manifest descriptor as stored, the blobs
/// mirrored alongside it, and whether it came from a local archive.
#[derive(Debug)]
pub(crate) struct ChildArtifact {
    pub name: String,
    pub manifest: OciDescriptor,
    pub layers: Vec<OciDescriptor>,
    pub local: bool,
}

/// A fully assembled bundle content store plus everything needed to
/// serialize it to either sink.
#[derive(Debug)]
pub(crate) struct Assembly {
    /// Owns the scratch directory backing the store; dropped after the
    /// archiver or publisher has consumed the contents.
    pub _scratch: TempDir,
    pub store: Store,
    pub children: Vec<ChildArtifact>,
    pub yaml_desc: OciDescriptor,
    pub signature_desc: Option<OciDescriptor>,
    pub root: RootManifest,
    pub log: Vec<String>,
}

/// Assembles the bundle into a fresh scratch content store.
///
/// Mutates `bundle`: local package refs are rewritten to embed their
/// mirrored manifest digests, and build provenance inherits the bundle
/// architecture — the serialized definition inside the bundle is the
/// rewritten, self-describing one.
pub(crate) async fn assemble(
    bundle: &mut Bundle,
    signature: Option<&[u8]>,
    auth: &RegistryAuth,
    insecure: bool,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
    mode: Mode,
) -> Result<Assembly> {
    bundle.validate()?;

    let scratch = TempDir::new()?;
    let store = Store::create(scratch.path())?;
    let arch = bundle.metadata.architecture.clone();
    let total = bundle.packages.len();
    let mut children = Vec::with_capacity(total);
    let mut log = Vec::new();

    for (i, pkg) in bundle.packages.iter_mut().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let local = pkg.is_local();
        let mut mirror = PackageMirror::open(&store, pkg, auth.clone(), insecure).await?;
        let manifest = mirror.push_manifest()?;
        let layers = if mode == Mode::Create || local {
            mirror.push_layers(progress, i + 1, total).await?
        } else {
            debug!(package = %pkg.name, "publish mode: leaving remote package layers at source");
            Vec::new()
        };
        drop(mirror);

        if local {
            pkg.reference = format!("{}-{arch}@{}", pkg.reference, manifest.digest);
        }
        info!(package = %pkg.name, digest = %manifest.digest, "mirrored package");
        log.push(format!(
            "Mirrored package {} ({}/{total}) -> {}",
            pkg.name,
            i + 1,
            manifest.digest
        ));
        children.push(ChildArtifact {
            name: pkg.name.clone(),
            manifest,
            layers,
            local,
        });
    }

    if bundle.build.architecture.is_empty() {
        bundle.build.architecture = arch;
    }

    let yaml = bundle.to_yaml()?;
    let yaml_desc = store.write_blob(
        PACKAGE_BLOB_MEDIA_TYPE,
        Some(annotation(TITLE_ANNOTATION, BUNDLE_FILE)),
        yaml.as_bytes(),
    )?;

    let signature_desc = signature
        .map(|bytes| {
            store.write_blob(
                PACKAGE_BLOB_MEDIA_TYPE,
                Some(annotation(TITLE_ANNOTATION, SIGNATURE_FILE)),
                bytes,
            )
        })
        .transpose()?;

    let child_manifests: Vec<OciDescriptor> =
        children.iter().map(|c| c.manifest.clone()).collect();
    let root = compose::build(bundle, &child_manifests, &yaml_desc, signature_desc.as_ref())?;
    store.put(&root.config_desc, &mut &root.config_bytes[..])?;
    store.put(&root.manifest_desc, &mut &root.manifest_bytes[..])?;

    // Single final rewrite: intermediate store states never reach the index.
    store.rewrite_index(std::slice::from_ref(&root.manifest_desc))?;
    log.push(format!("Built bundle manifest {}", root.manifest_desc.digest));

    Ok(Assembly {
        _scratch: scratch,
        store,
        children,
        yaml_desc,
        signature_desc,
        root,
        log,
    })
}

/// Single-entry annotation map.
fn annotation(key: &str, value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), value.to_string())])
}
