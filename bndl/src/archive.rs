//! Concurrent tar+zstd archival pipeline.
//!
//! One bounded channel carries jobs to a single blocking archival task
//! that owns the `tar::Builder` over a `zstd::Encoder`. The dispatcher
//! enqueues every entry of the path map and closes the channel; a
//! collector awaits one result channel per job, advancing the progress
//! bar per success and counting dispatched vs collected explicitly so the
//! pipeline only reports success when every job was both written and
//! acknowledged.

use std::fs;
use std::path::{Path, PathBuf};

use bndl_oci::PathMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::progress::ProgressSink;
use crate::{Error, Result};

/// One archive entry: source file, destination path, result channel.
struct Job {
    src: PathBuf,
    dest: String,
    done: oneshot::Sender<std::result::Result<u64, String>>,
}

/// Writes every entry of `paths` into a zstd-compressed tar stream at
/// `output`, in path-map enumeration order.
///
/// Entry metadata is taken from the source files as they exist now, so
/// archives are not byte-reproducible across runs.
pub async fn archive(
    paths: &PathMap,
    output: &Path,
    progress: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let total = paths.len();
    let (tx, rx) = mpsc::channel::<Job>(total.max(1));
    let out = fs::File::create(output)?;

    // Single archival task: the tar builder is not shareable, and a lone
    // writer keeps entry order deterministic.
    let writer = tokio::task::spawn_blocking(move || write_entries(out, rx));

    // Dispatch every job up front; capacity equals the job count, so the
    // sends complete without waiting on the consumer.
    let mut results = Vec::with_capacity(total);
    for (src, dest) in paths {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (done, result) = oneshot::channel();
        let job = Job {
            src: src.clone(),
            dest: dest.clone(),
            done,
        };
        tx.send(job)
            .await
            .map_err(|_| Error::Archive("archival task stopped accepting jobs".to_string()))?;
        results.push(result);
    }
    drop(tx);

    // Collect exactly as many acknowledgements as were dispatched.
    progress.start(total as u64);
    let mut collected = 0usize;
    for result in results {
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = result => outcome,
        };
        match outcome {
            Ok(Ok(size)) => {
                debug!(size, "archived entry");
                progress.advance(1);
                collected += 1;
            }
            Ok(Err(msg)) => {
                progress.fail(&msg);
                return Err(Error::Archive(msg));
            }
            // Task died before acknowledging; its join error has the cause.
            Err(_) => break,
        }
    }

    writer
        .await
        .map_err(|e| Error::Archive(format!("archival task panicked: {e}")))?
        .map_err(Error::Archive)?;

    if collected != total {
        return Err(Error::Archive(format!(
            "archived {collected} of {total} files"
        )));
    }
    Ok(())
}

/// Extracts a `tar.zst` archive into `dest`.
///
/// The inverse of [`archive`]; also used to open package archives and to
/// inspect produced bundles. Blocking — callers on the runtime wrap it in
/// `spawn_blocking`.
pub(crate) fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive)?;
    let decoder = zstd::Decoder::new(file)
        .map_err(|e| Error::Integrity(format!("{}: {e}", archive.display())))?;
    tar::Archive::new(decoder)
        .unpack(dest)
        .map_err(|e| Error::Integrity(format!("{}: {e}", archive.display())))?;
    Ok(())
}

/// Blocking body of the archival task: drains the job channel into the
/// tar stream, then finishes the zstd frame.
fn write_entries(
    out: fs::File,
    mut rx: mpsc::Receiver<Job>,
) -> std::result::Result<(), String> {
    let encoder = zstd::Encoder::new(out, 0).map_err(|e| format!("zstd: {e}"))?;
    let mut builder = tar::Builder::new(encoder);

    while let Some(job) = rx.blocking_recv() {
        let appended = builder
            .append_path_with_name(&job.src, &job.dest)
            .and_then(|()| fs::metadata(&job.src).map(|m| m.len()))
            .map_err(|e| format!("{}: {e}", job.src.display()));
        let failed = appended.is_err();
        // A dropped receiver means the collector already gave up; keep
        // draining so the dispatcher never blocks.
        let _ = job.done.send(appended);
        if failed {
            return Err(format!("failed to archive {}", job.src.display()));
        }
    }

    let encoder = builder.into_inner().map_err(|e| format!("tar: {e}"))?;
    encoder.finish().map_err(|e| format!("zstd: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::io::Read;

    fn path_map(dir: &Path, files: &[(&str, &[u8])]) -> PathMap {
        let mut map = PathMap::new();
        for (name, contents) in files {
            let path = dir.join(name);
            fs::write(&path, contents).unwrap();
            map.insert(path, format!("blobs/sha256/{name}"));
        }
        map
    }

    fn unpack(archive: &Path, dest: &Path) {
        let file = fs::File::open(archive).unwrap();
        let decoder = zstd::Decoder::new(file).unwrap();
        tar::Archive::new(decoder).unpack(dest).unwrap();
    }

    #[tokio::test]
    async fn round_trips_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let map = path_map(dir.path(), &[("aaaa", b"first blob"), ("bbbb", b"second blob")]);
        let output = dir.path().join("bundle.tar.zst");

        archive(&map, &output, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();

        let unpacked = tempfile::tempdir().unwrap();
        unpack(&output, unpacked.path());
        let mut contents = Vec::new();
        fs::File::open(unpacked.path().join("blobs/sha256/aaaa"))
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents, b"first blob");
        assert!(unpacked.path().join("blobs/sha256/bbbb").is_file());
    }

    #[tokio::test]
    async fn missing_source_fails_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = path_map(dir.path(), &[("aaaa", b"present")]);
        map.insert(dir.path().join("missing"), "missing".to_string());
        let output = dir.path().join("bundle.tar.zst");

        let err = archive(&map, &output, &NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let map = path_map(dir.path(), &[("aaaa", b"blob")]);
        let output = dir.path().join("bundle.tar.zst");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = archive(&map, &output, &NoProgress, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn empty_path_map_produces_an_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("bundle.tar.zst");

        archive(&PathMap::new(), &output, &NoProgress, &CancellationToken::new())
            .await
            .unwrap();

        let unpacked = tempfile::tempdir().unwrap();
        unpack(&output, unpacked.path());
        assert_eq!(fs::read_dir(unpacked.path()).unwrap().count(), 0);
    }
}
