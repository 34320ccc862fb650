//! Publishing an assembled bundle to a remote registry.
//!
//! The publisher is the remote counterpart of the archiver: it drains the
//! assembled content store into a destination repository. Blob order is
//! fixed — package blobs and manifests in assembly order, the bundle
//! definition, the optional signature, the config — and the tagged root
//! manifest goes last so the reference never points at a partial bundle.

use std::collections::BTreeSet;

use bndl_oci::oci_client::manifest::OciDescriptor;
use bndl_oci::{Reference, Registry, Store};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::assemble::Assembly;
use crate::progress::ProgressSink;
use crate::{Error, Result};

/// The ordered push plan derived from an assembly.
#[derive(Debug)]
pub(crate) struct PushPlan {
    /// Blobs to upload, in order, deduplicated by digest.
    pub blobs: Vec<OciDescriptor>,
}

/// Derives the blob upload order from an assembly.
///
/// Remote packages stay in their source registries — the root manifest
/// references only their manifests — so their layer blobs are never
/// uploaded. Local packages have no remote home, so their layer blobs go
/// first, then every package manifest, the bundle definition, the
/// signature if present, and the config.
pub(crate) fn plan(assembly: &Assembly) -> PushPlan {
    let mut blobs = Vec::new();
    let mut seen = BTreeSet::new();
    let mut push = |desc: &OciDescriptor| {
        if seen.insert(desc.digest.clone()) {
            blobs.push(desc.clone());
        }
    };

    for child in &assembly.children {
        if child.local {
            for layer in &child.layers {
                push(layer);
            }
        }
        push(&child.manifest);
    }
    push(&assembly.yaml_desc);
    if let Some(signature) = &assembly.signature_desc {
        push(signature);
    }
    push(&assembly.root.config_desc);

    PushPlan { blobs }
}

/// Uploads the planned blobs and the tagged root manifest.
///
/// Returns the human-readable summary of what was pushed, including
/// follow-up commands — the caller owns presentation.
pub(crate) async fn push(
    assembly: &Assembly,
    plan: &PushPlan,
    registry: &Registry,
    reference: &Reference,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let store: &Store = &assembly.store;
    progress.start(plan.blobs.len() as u64 + 1);

    for desc in &plan.blobs {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let data = store.read_blob(&desc.digest)?;
        registry.push_blob(reference, data, &desc.digest).await?;
        progress.advance(1);
    }

    let url = registry
        .push_manifest(reference, &assembly.root.manifest)
        .await?;
    progress.advance(1);
    info!(%url, "published bundle manifest");
    progress.success(&format!("Published {reference}"));

    Ok(vec![
        format!(
            "Pushed {} blobs and tagged {} ({})",
            plan.blobs.len(),
            reference,
            assembly.root.manifest_desc.digest
        ),
        format!("To inspect: bndl inspect oci://{reference}"),
        format!("To deploy: bndl deploy oci://{reference}"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::{Assembly, ChildArtifact};
    use crate::bundle::Bundle;
    use crate::compose;
    use bndl_oci::{PACKAGE_BLOB_MEDIA_TYPE, sha256_digest};

    fn descriptor(tag: &str) -> OciDescriptor {
        OciDescriptor {
            media_type: PACKAGE_BLOB_MEDIA_TYPE.to_string(),
            digest: sha256_digest(tag.as_bytes()),
            size: tag.len() as i64,
            urls: None,
            annotations: None,
        }
    }

    fn assembly(children: Vec<ChildArtifact>, signature: bool) -> Assembly {
        let scratch = tempfile::tempdir().unwrap();
        let store = Store::create(scratch.path()).unwrap();
        let bundle = Bundle::from_yaml(
            "\
metadata:
  name: demo
  version: 0.1.0
  architecture: amd64
zarfPackages: []
",
        )
        .unwrap();
        let yaml_desc = descriptor("bundle-yaml");
        let signature_desc = signature.then(|| descriptor("signature"));
        let manifests: Vec<OciDescriptor> = children.iter().map(|c| c.manifest.clone()).collect();
        let root =
            compose::build(&bundle, &manifests, &yaml_desc, signature_desc.as_ref()).unwrap();
        Assembly {
            _scratch: scratch,
            store,
            children,
            yaml_desc,
            signature_desc,
            root,
            log: Vec::new(),
        }
    }

    fn remote_child(name: &str) -> ChildArtifact {
        ChildArtifact {
            name: name.to_string(),
            manifest: descriptor(name),
            layers: Vec::new(),
            local: false,
        }
    }

    #[test]
    fn remote_children_plan_n_plus_two_blobs() {
        let assembly = assembly(vec![remote_child("a"), remote_child("b")], false);
        let plan = plan(&assembly);

        // Two package manifests, the bundle definition, and the config.
        assert_eq!(plan.blobs.len(), 4);
        assert_eq!(plan.blobs[0].digest, assembly.children[0].manifest.digest);
        assert_eq!(plan.blobs[1].digest, assembly.children[1].manifest.digest);
        assert_eq!(plan.blobs[2].digest, assembly.yaml_desc.digest);
        assert_eq!(plan.blobs[3].digest, assembly.root.config_desc.digest);
    }

    #[test]
    fn local_child_layers_precede_its_manifest() {
        let local = ChildArtifact {
            name: "local".to_string(),
            manifest: descriptor("local-manifest"),
            layers: vec![descriptor("layer-1"), descriptor("layer-2")],
            local: true,
        };
        let assembly = assembly(vec![local, remote_child("remote")], true);
        let plan = plan(&assembly);

        // layer-1, layer-2, local manifest, remote manifest, yaml, sig, config.
        assert_eq!(plan.blobs.len(), 7);
        assert_eq!(plan.blobs[0].digest, sha256_digest(b"layer-1"));
        assert_eq!(plan.blobs[2].digest, assembly.children[0].manifest.digest);
        assert_eq!(plan.blobs[5].digest, assembly.signature_desc.as_ref().unwrap().digest);
        assert_eq!(plan.blobs[6].digest, assembly.root.config_desc.digest);
    }

    #[test]
    fn duplicate_digests_are_pushed_once() {
        let shared = descriptor("shared-layer");
        let child = |name: &str| ChildArtifact {
            name: name.to_string(),
            manifest: descriptor(name),
            layers: vec![shared.clone()],
            local: true,
        };
        let assembly = assembly(vec![child("a"), child("b")], false);
        let plan = plan(&assembly);

        let shared_count = plan
            .blobs
            .iter()
            .filter(|d| d.digest == shared.digest)
            .count();
        assert_eq!(shared_count, 1);
    }
}
