//! Bundle definition data model.
//!
//! A bundle is declared in a `uds-bundle.yaml` document: metadata, build
//! provenance, and an ordered list of packages to aggregate. Parsing is
//! plain serde; everything schema-shaped beyond YAML well-formedness is
//! enforced by [`Bundle::validate`] so misconfiguration surfaces before any
//! network call.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// File name of the bundle definition inside a produced bundle.
pub const BUNDLE_FILE: &str = "uds-bundle.yaml";
/// File name of the detached bundle signature inside a produced bundle.
pub const SIGNATURE_FILE: &str = "uds-bundle.yaml.sig";
/// File name of the package metadata document inside a package archive.
pub const PACKAGE_FILE: &str = "zarf.yaml";

/// A bundle definition: metadata plus the ordered packages it aggregates.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    /// Human-facing bundle metadata.
    pub metadata: BundleMetadata,
    /// Build provenance.
    #[serde(default)]
    pub build: BuildMetadata,
    /// Packages to aggregate, in assembly order.
    #[serde(rename = "zarfPackages")]
    pub packages: Vec<Package>,
}

/// Bundle metadata block.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleMetadata {
    /// Bundle name; becomes the `title` annotation and part of the archive
    /// file name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Bundle version.
    pub version: String,
    /// Target architecture; required for assembly.
    #[serde(default)]
    pub architecture: String,
    /// Project URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Authors list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<String>,
    /// Documentation URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    /// Source repository URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Vendor name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
}

/// Build provenance block.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildMetadata {
    /// Architecture the bundle was assembled for.
    #[serde(default)]
    pub architecture: String,
    /// RFC 3339 timestamp of the build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// User or system that performed the build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
}

/// One package entry in the bundle definition.
///
/// Exactly one of `repository` (remote locator) or `path` (local archive)
/// must be set. For local packages [`Package::reference`] is rewritten
/// after mirroring to embed the digest of the manifest as stored in the
/// bundle, making the serialized bundle self-describing.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    /// Package name, unique within the bundle.
    pub name: String,
    /// Remote repository the package is pulled from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Tag or version identifier of the package.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Path to a local `tar.zst` package archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Package {
    /// Returns `true` if this package is read from a local archive.
    pub fn is_local(&self) -> bool {
        self.path.is_some()
    }
}

impl Bundle {
    /// Parses a bundle definition from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serializes the bundle definition back to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Checks the schema rules YAML alone cannot express.
    ///
    /// Runs before any network or filesystem work; every violation is a
    /// [`Error::Config`] naming the offending field or package.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.architecture.is_empty() {
            return Err(Error::Config("architecture is required".to_string()));
        }
        if self.metadata.name.is_empty() {
            return Err(Error::Config("name is required".to_string()));
        }
        if self.metadata.version.is_empty() {
            return Err(Error::Config("version is required".to_string()));
        }
        let mut seen = BTreeSet::new();
        for pkg in &self.packages {
            if pkg.repository.is_some() == pkg.path.is_some() {
                return Err(Error::Config(format!(
                    "package {}: exactly one of repository or path is required",
                    pkg.name
                )));
            }
            if !seen.insert(pkg.name.as_str()) {
                return Err(Error::Config(format!(
                    "package {}: duplicate package name",
                    pkg.name
                )));
            }
        }
        Ok(())
    }

    /// File name of the tarball produced for this bundle.
    pub fn archive_name(&self) -> String {
        format!(
            "uds-bundle-{}-{}-{}.tar.zst",
            self.metadata.name, self.metadata.architecture, self.metadata.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\
metadata:
  name: demo
  version: 0.1.0
  architecture: amd64
zarfPackages:
  - name: a
    repository: registry.example/a
    ref: \"1.0\"
";

    #[test]
    fn parses_minimal_definition() {
        let bundle = Bundle::from_yaml(MINIMAL).unwrap();
        assert_eq!(bundle.metadata.name, "demo");
        assert_eq!(bundle.packages.len(), 1);
        assert_eq!(bundle.packages[0].reference, "1.0");
        assert!(!bundle.packages[0].is_local());
        bundle.validate().unwrap();
    }

    #[test]
    fn missing_architecture_is_a_configuration_error() {
        let mut bundle = Bundle::from_yaml(MINIMAL).unwrap();
        bundle.metadata.architecture.clear();
        let err = bundle.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg == "architecture is required"));
    }

    #[test]
    fn package_without_source_names_the_offender() {
        let mut bundle = Bundle::from_yaml(MINIMAL).unwrap();
        bundle.packages[0].repository = None;
        let err = bundle.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("package a")));
    }

    #[test]
    fn package_with_both_sources_is_rejected() {
        let mut bundle = Bundle::from_yaml(MINIMAL).unwrap();
        bundle.packages[0].path = Some("a.tar.zst".to_string());
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn duplicate_package_names_are_rejected() {
        let mut bundle = Bundle::from_yaml(MINIMAL).unwrap();
        let dup = bundle.packages[0].clone();
        bundle.packages.push(dup);
        let err = bundle.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("duplicate")));
    }

    #[test]
    fn archive_name_embeds_name_arch_version() {
        let bundle = Bundle::from_yaml(MINIMAL).unwrap();
        assert_eq!(bundle.archive_name(), "uds-bundle-demo-amd64-0.1.0.tar.zst");
    }

    #[test]
    fn yaml_round_trip_preserves_ref_spelling() {
        let bundle = Bundle::from_yaml(MINIMAL).unwrap();
        let yaml = bundle.to_yaml().unwrap();
        assert!(yaml.contains("ref: '1.0'") || yaml.contains("ref: \"1.0\"") || yaml.contains("ref: 1.0"));
        assert!(yaml.contains("zarfPackages"));
    }
}
