//! Bundle root manifest and config construction.
//!
//! The root manifest is the single entry of the produced bundle's index:
//! its layers are the mirrored package manifests in assembly order, then
//! the bundle definition blob, then the optional signature blob.

use std::collections::BTreeMap;

use bndl_oci::oci_client::manifest::{OciDescriptor, OciImageManifest};
use bndl_oci::{
    AUTHORS_ANNOTATION, CONFIG_MEDIA_TYPE, DESCRIPTION_ANNOTATION, DOCUMENTATION_ANNOTATION,
    MANIFEST_MEDIA_TYPE, SOURCE_ANNOTATION, TITLE_ANNOTATION, URL_ANNOTATION, VENDOR_ANNOTATION,
    sha256_digest,
};
use serde::Serialize;

use crate::Result;
use crate::bundle::Bundle;

/// OCI image spec version recorded in the bundle config blob.
const OCI_VERSION: &str = "1.0.1";

/// A fully built root manifest: serialized bytes plus their descriptors.
///
/// Construction is pure; the caller stores the bytes and rewrites the
/// index.
#[derive(Debug, Clone)]
pub struct RootManifest {
    /// The root manifest document.
    pub manifest: OciImageManifest,
    /// Canonical serialized manifest bytes.
    pub manifest_bytes: Vec<u8>,
    /// Descriptor of the manifest bytes.
    pub manifest_desc: OciDescriptor,
    /// Serialized config blob bytes.
    pub config_bytes: Vec<u8>,
    /// Descriptor of the config blob.
    pub config_desc: OciDescriptor,
}

/// The bundle config blob: architecture plus identifying annotations.
#[derive(Debug, Serialize)]
struct BundleConfig<'a> {
    architecture: &'a str,
    #[serde(rename = "ociVersion")]
    oci_version: &'a str,
    annotations: BTreeMap<&'a str, &'a str>,
}

/// Builds the bundle root manifest and its config blob.
///
/// `children` must be the package manifest descriptors in assembly order;
/// layer ordering in the result is `children ++ [bundle_yaml] ++
/// [signature?]`.
pub fn build(
    bundle: &Bundle,
    children: &[OciDescriptor],
    bundle_yaml: &OciDescriptor,
    signature: Option<&OciDescriptor>,
) -> Result<RootManifest> {
    let metadata = &bundle.metadata;

    let config = BundleConfig {
        architecture: &metadata.architecture,
        oci_version: OCI_VERSION,
        annotations: BTreeMap::from([
            ("title", metadata.name.as_str()),
            ("description", metadata.description.as_str()),
        ]),
    };
    let config_bytes = serde_json::to_vec(&config)?;
    let config_desc = OciDescriptor {
        media_type: CONFIG_MEDIA_TYPE.to_string(),
        digest: sha256_digest(&config_bytes),
        size: i64::try_from(config_bytes.len()).unwrap_or(i64::MAX),
        urls: None,
        annotations: Some(BTreeMap::from([(
            TITLE_ANNOTATION.to_string(),
            metadata.name.clone(),
        )])),
    };

    let mut layers: Vec<OciDescriptor> = children.to_vec();
    layers.push(bundle_yaml.clone());
    if let Some(signature) = signature {
        layers.push(signature.clone());
    }

    let mut annotations = BTreeMap::from([(
        DESCRIPTION_ANNOTATION.to_string(),
        metadata.description.clone(),
    )]);
    for (key, value) in [
        (URL_ANNOTATION, &metadata.url),
        (AUTHORS_ANNOTATION, &metadata.authors),
        (DOCUMENTATION_ANNOTATION, &metadata.documentation),
        (SOURCE_ANNOTATION, &metadata.source),
        (VENDOR_ANNOTATION, &metadata.vendor),
    ] {
        if let Some(value) = value
            && !value.is_empty()
        {
            annotations.insert(key.to_string(), value.clone());
        }
    }

    let manifest = OciImageManifest {
        schema_version: 2,
        media_type: Some(MANIFEST_MEDIA_TYPE.to_string()),
        config: config_desc.clone(),
        layers,
        subject: None,
        artifact_type: None,
        annotations: Some(annotations),
    };
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let manifest_desc = OciDescriptor {
        media_type: MANIFEST_MEDIA_TYPE.to_string(),
        digest: sha256_digest(&manifest_bytes),
        size: i64::try_from(manifest_bytes.len()).unwrap_or(i64::MAX),
        urls: None,
        annotations: None,
    };

    Ok(RootManifest {
        manifest,
        manifest_bytes,
        manifest_desc,
        config_bytes,
        config_desc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bndl_oci::PACKAGE_BLOB_MEDIA_TYPE;

    fn descriptor(tag: &str) -> OciDescriptor {
        let bytes = tag.as_bytes();
        OciDescriptor {
            media_type: PACKAGE_BLOB_MEDIA_TYPE.to_string(),
            digest: sha256_digest(bytes),
            size: bytes.len() as i64,
            urls: None,
            annotations: None,
        }
    }

    fn bundle() -> Bundle {
        Bundle::from_yaml(
            "\
metadata:
  name: demo
  description: a demo bundle
  version: 0.1.0
  architecture: amd64
  url: https://demo.example
zarfPackages: []
",
        )
        .unwrap()
    }

    #[test]
    fn layers_are_children_then_yaml_then_signature() {
        let children = [descriptor("child-a"), descriptor("child-b")];
        let yaml = descriptor("bundle-yaml");
        let sig = descriptor("signature");

        let root = build(&bundle(), &children, &yaml, Some(&sig)).unwrap();
        let digests: Vec<&str> = root.manifest.layers.iter().map(|l| l.digest.as_str()).collect();
        assert_eq!(
            digests,
            vec![
                children[0].digest.as_str(),
                children[1].digest.as_str(),
                yaml.digest.as_str(),
                sig.digest.as_str()
            ]
        );
    }

    #[test]
    fn signature_layer_is_absent_without_signature() {
        let children = [descriptor("child-a")];
        let root = build(&bundle(), &children, &descriptor("bundle-yaml"), None).unwrap();
        assert_eq!(root.manifest.layers.len(), 2);
    }

    #[test]
    fn config_records_architecture_and_title() {
        let root = build(&bundle(), &[], &descriptor("bundle-yaml"), None).unwrap();
        let config: serde_json::Value = serde_json::from_slice(&root.config_bytes).unwrap();
        assert_eq!(config["architecture"], "amd64");
        assert_eq!(config["ociVersion"], "1.0.1");
        assert_eq!(config["annotations"]["title"], "demo");
        assert_eq!(config["annotations"]["description"], "a demo bundle");
        assert_eq!(root.config_desc.media_type, CONFIG_MEDIA_TYPE);
    }

    #[test]
    fn metadata_annotations_skip_empty_fields() {
        let root = build(&bundle(), &[], &descriptor("bundle-yaml"), None).unwrap();
        let annotations = root.manifest.annotations.as_ref().unwrap();
        assert_eq!(annotations[DESCRIPTION_ANNOTATION], "a demo bundle");
        assert_eq!(annotations[URL_ANNOTATION], "https://demo.example");
        assert!(!annotations.contains_key(VENDOR_ANNOTATION));
    }

    #[test]
    fn manifest_descriptor_matches_serialized_bytes() {
        let root = build(&bundle(), &[], &descriptor("bundle-yaml"), None).unwrap();
        assert_eq!(root.manifest_desc.digest, sha256_digest(&root.manifest_bytes));
        assert_eq!(root.manifest_desc.size as usize, root.manifest_bytes.len());
        let reparsed: OciImageManifest = serde_json::from_slice(&root.manifest_bytes).unwrap();
        assert_eq!(reparsed.schema_version, 2);
    }
}
