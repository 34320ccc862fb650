//! Content-addressable blob store laid out as an OCI image layout.
//!
//! Layout:
//! ```text
//! {root}/
//!   oci-layout           — `{"imageLayoutVersion":"1.0.0"}`
//!   index.json           — OCI image index; exactly one entry after assembly
//!   blobs/sha256/{hex}   — content-addressed blobs
//! ```
//!
//! Writes are verified: every blob streamed through [`Store::put`] is hashed
//! on the way to disk and committed with an atomic rename only if digest and
//! size match the descriptor.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use oci_client::manifest::{ImageIndexEntry, OciDescriptor, OciImageIndex};
use sha2::{Digest, Sha256};

use crate::{Error, INDEX_MEDIA_TYPE, Result, digest_hex};

/// Source path → relative archive path, in deterministic (sorted) order.
pub type PathMap = BTreeMap<PathBuf, String>;

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs/sha256";

/// Write-through content-addressable store on the local filesystem.
///
/// Deduplicates by digest: a `put` of an already-present blob is a no-op.
/// The store is the single shared resource of an assembly; all writes go
/// through one orchestration task, so no internal locking is needed.
#[derive(Debug)]
pub struct Store {
    /// Root directory of the image layout.
    root: PathBuf,
}

impl Store {
    /// Creates an empty image layout at `root` (created if missing).
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(BLOB_DIR))?;
        fs::write(root.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT)?;
        Ok(Self { root })
    }

    /// Opens an existing image layout at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.join(OCI_LAYOUT_FILE).is_file() {
            return Err(Error::Format(format!(
                "{} is not an OCI image layout",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Root directory of the layout.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the blob named by `digest`.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.root.join(BLOB_DIR).join(digest_hex(digest)?))
    }

    /// Returns `true` if a blob with this digest is already stored.
    pub fn contains(&self, digest: &str) -> bool {
        self.blob_path(digest).is_ok_and(|p| p.is_file())
    }

    /// Streams `reader` into the store under `desc.digest`.
    ///
    /// Idempotent: if the blob is already present with the descriptor's
    /// size, this is a no-op. Digest or size mismatch fails with
    /// [`Error::Integrity`] and leaves no partial blob behind.
    pub fn put(&self, desc: &OciDescriptor, reader: &mut impl Read) -> Result<()> {
        let path = self.blob_path(&desc.digest)?;
        if path.is_file() {
            let found = i64::try_from(fs::metadata(&path)?.len()).unwrap_or(i64::MAX);
            if found != desc.size {
                return Err(Error::Integrity {
                    expected: format!("{} ({} bytes)", desc.digest, desc.size),
                    actual: format!("{} ({found} bytes)", desc.digest),
                });
            }
            return Ok(());
        }

        let tmp = path.with_extension("tmp");
        let mut out = fs::File::create(&tmp)?;
        let copied = hash_copy(reader, &mut out).and_then(|r| {
            out.sync_all()?;
            Ok(r)
        });
        let (digest, size) = match copied {
            Ok(v) => v,
            Err(e) => {
                drop(out);
                fs::remove_file(&tmp).ok();
                return Err(e);
            }
        };

        if digest != desc.digest || size != desc.size {
            fs::remove_file(&tmp).ok();
            return Err(Error::Integrity {
                expected: format!("{} ({} bytes)", desc.digest, desc.size),
                actual: format!("{digest} ({size} bytes)"),
            });
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Digests `bytes` and stores them, returning the resulting descriptor.
    ///
    /// Used for blobs the bundler synthesizes itself: manifests, configs,
    /// the bundle definition, and signatures.
    pub fn write_blob(
        &self,
        media_type: &str,
        annotations: Option<BTreeMap<String, String>>,
        bytes: &[u8],
    ) -> Result<OciDescriptor> {
        let desc = OciDescriptor {
            media_type: media_type.to_string(),
            digest: crate::sha256_digest(bytes),
            size: i64::try_from(bytes.len()).unwrap_or(i64::MAX),
            urls: None,
            annotations,
        };
        self.put(&desc, &mut &bytes[..])?;
        Ok(desc)
    }

    /// Reads a stored blob fully into memory.
    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        Ok(fs::read(path)?)
    }

    /// Atomically replaces `index.json` with an index listing exactly the
    /// given descriptors, in order.
    ///
    /// Called once at the end of assembly with the bundle root manifest as
    /// the sole entry; intermediate states never reach the index.
    pub fn rewrite_index(&self, descriptors: &[OciDescriptor]) -> Result<()> {
        let index = OciImageIndex {
            schema_version: 2,
            media_type: Some(INDEX_MEDIA_TYPE.to_string()),
            manifests: descriptors
                .iter()
                .map(|d| ImageIndexEntry {
                    media_type: d.media_type.clone(),
                    digest: d.digest.clone(),
                    size: d.size,
                    platform: None,
                    annotations: d.annotations.clone(),
                })
                .collect(),
            artifact_type: None,
            annotations: None,
        };
        atomic_write(
            &self.root.join(INDEX_FILE),
            &serde_json::to_vec(&index)?,
        )?;
        Ok(())
    }

    /// Parses the current `index.json`.
    pub fn read_index(&self) -> Result<OciImageIndex> {
        let bytes = fs::read(self.root.join(INDEX_FILE))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Format(format!("index.json: {e}")))
    }

    /// Returns the canonical archival layout: every blob plus the
    /// `index.json` and `oci-layout` metadata files, mapped to their
    /// layout-relative paths.
    pub fn enumerate(&self) -> Result<PathMap> {
        let mut map = PathMap::new();
        map.insert(self.root.join(OCI_LAYOUT_FILE), OCI_LAYOUT_FILE.to_string());
        map.insert(self.root.join(INDEX_FILE), INDEX_FILE.to_string());
        for entry in fs::read_dir(self.root.join(BLOB_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let hex = file_name.to_str().ok_or_else(|| {
                Error::Format(format!("non-UTF-8 blob name: {file_name:?}"))
            })?;
            map.insert(entry.path(), format!("{BLOB_DIR}/{hex}"));
        }
        Ok(map)
    }
}

/// Copies `reader` to `writer`, returning the sha256 digest and byte count.
fn hash_copy(reader: &mut impl Read, writer: &mut impl Write) -> Result<(String, i64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size: i64 = 0;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        size += i64::try_from(n).unwrap_or(i64::MAX);
    }
    Ok((format!("sha256:{:x}", hasher.finalize()), size))
}

/// Writes data to a file atomically (write to .tmp, then rename).
fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(data)?;
    f.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
