//! Batch work over composite slices
//!
//! Slices are grouped into pools by storage file. One worker owns a pool at
//! a time and maps its storage file once. Workers poll a shared
//! [`CancellationFlag`] every `poll_interval` items; cancelling stops new
//! work but keeps whatever was already written. Failures of single items
//! are collected in the [`BatchReport`] instead of aborting the batch.

use crate::composite::{CompositeEntry, CompositeIndex};
use crate::error::{GpkError, Result};
use crate::header::PackageSummary;
use crate::stream::{ByteSource, Stream};
use crate::version::FormatVersion;
use crossbeam::channel;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives progress of long-running operations; called from worker threads
pub trait ProgressSink: Send + Sync {
    fn started(&self, _total: usize) {}
    fn advanced(&self, _done: usize, _total: usize, _item: &str) {}
    fn finished(&self, _done: usize, _failed: usize) {}
}

/// Ignores all progress
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {}

/// Cooperative cancellation shared between the caller and workers
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        CancellationFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GpkError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One failed item of a batch
#[derive(Debug)]
pub struct ItemError {
    pub item: String,
    pub error: GpkError,
}

#[derive(Debug)]
pub struct BatchReport<T> {
    pub output: Vec<T>,
    pub errors: Vec<ItemError>,
    pub cancelled: bool,
}

impl<T> BatchReport<T> {
    pub fn processed(&self) -> usize {
        self.output.len() + self.errors.len()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }
}

/// Worker and polling settings for a batch
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub workers: usize,
    pub poll_interval: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            workers: 4,
            poll_interval: 32,
        }
    }
}

/// Storage file for a section filename, trying `.gpk` when the bare name
/// does not exist
pub fn storage_path(storage_dir: &Path, filename: &str) -> PathBuf {
    let bare = storage_dir.join(filename);
    if bare.exists() || Path::new(filename).extension().is_some() {
        bare
    } else {
        storage_dir.join(format!("{}.gpk", filename))
    }
}

/// Slice of `storage` described by `entry`
pub fn slice_entry(storage: &ByteSource, entry: &CompositeEntry) -> Result<ByteSource> {
    let offset = usize::try_from(entry.offset).map_err(|_| out_of_file(entry))?;
    let size = usize::try_from(entry.size).map_err(|_| out_of_file(entry))?;
    storage.slice(offset, size).map_err(|_| out_of_file(entry))
}

fn out_of_file(entry: &CompositeEntry) -> GpkError {
    GpkError::corrupt(
        format!("composite {}", entry.composite_name),
        format!(
            "slice {}+{} lies outside {}",
            entry.offset, entry.size, entry.filename
        ),
    )
}

enum Outcome<T> {
    Done(T),
    Failed(ItemError),
}

/// Run `work` on every slice of the index, one storage file per worker
pub(crate) fn for_each_slice<T, F>(
    index: &CompositeIndex,
    storage_dir: &Path,
    options: BatchOptions,
    cancel: &CancellationFlag,
    progress: &dyn ProgressSink,
    work: F,
) -> Result<BatchReport<T>>
where
    T: Send,
    F: Fn(&CompositeEntry, ByteSource) -> Result<T> + Sync,
{
    let mut pools: BTreeMap<String, Vec<&CompositeEntry>> = BTreeMap::new();
    for entry in index.entries() {
        pools
            .entry(entry.filename.to_ascii_lowercase())
            .or_default()
            .push(entry);
    }
    let total = index.len();
    let poll_interval = options.poll_interval.max(1);
    let workers = options.workers.clamp(1, pools.len().max(1));
    progress.started(total);
    info!(slices = total, pools = pools.len(), workers, "batch started");

    let (pool_tx, pool_rx) = channel::unbounded();
    for pool in pools.into_values() {
        let _ = pool_tx.send(pool);
    }
    drop(pool_tx);
    let (out_tx, out_rx) = channel::unbounded();
    let done = AtomicUsize::new(0);
    let stopped = AtomicBool::new(false);

    crossbeam::scope(|scope| {
        for _ in 0..workers {
            let pool_rx = pool_rx.clone();
            let out_tx = out_tx.clone();
            let (work, done, stopped) = (&work, &done, &stopped);
            scope.spawn(move |_| {
                let mut seen = 0usize;
                for pool in pool_rx.iter() {
                    let filename = pool[0].filename.clone();
                    let path = storage_path(storage_dir, &filename);
                    let storage = match ByteSource::map_file(&path) {
                        Ok(storage) => Some(storage),
                        Err(error) => {
                            warn!(file = %path.display(), %error, "storage file unavailable");
                            None
                        }
                    };
                    for entry in pool {
                        if seen % poll_interval == 0 && cancel.is_cancelled() {
                            stopped.store(true, Ordering::SeqCst);
                            return;
                        }
                        seen += 1;
                        let result = match &storage {
                            Some(storage) => {
                                slice_entry(storage, entry).and_then(|slice| work(entry, slice))
                            }
                            None => Err(GpkError::MissingPackage(path.display().to_string())),
                        };
                        let outcome = match result {
                            Ok(value) => Outcome::Done(value),
                            Err(error) => {
                                warn!(composite = %entry.composite_name, %error, "batch item failed");
                                Outcome::Failed(ItemError {
                                    item: entry.composite_name.clone(),
                                    error,
                                })
                            }
                        };
                        let _ = out_tx.send(outcome);
                        let count = done.fetch_add(1, Ordering::SeqCst) + 1;
                        progress.advanced(count, total, &entry.composite_name);
                    }
                }
            });
        }
    })
    .map_err(|_| GpkError::WorkerPanicked("composite batch"))?;
    drop(out_tx);

    let mut report = BatchReport {
        output: Vec::new(),
        errors: Vec::new(),
        cancelled: stopped.load(Ordering::SeqCst),
    };
    for outcome in out_rx.iter() {
        match outcome {
            Outcome::Done(value) => report.output.push(value),
            Outcome::Failed(error) => report.errors.push(error),
        }
    }
    progress.finished(report.processed(), report.errors.len());
    info!(
        processed = report.processed(),
        failed = report.errors.len(),
        cancelled = report.cancelled,
        "batch finished"
    );
    Ok(report)
}

/// Write every composite slice to `out_dir/<composite name>.gpk`
///
/// Each slice must start with a valid package summary.
pub fn unpack_composites(
    index: &CompositeIndex,
    storage_dir: &Path,
    out_dir: &Path,
    options: BatchOptions,
    cancel: &CancellationFlag,
    progress: &dyn ProgressSink,
) -> Result<BatchReport<PathBuf>> {
    std::fs::create_dir_all(out_dir)?;
    for_each_slice(index, storage_dir, options, cancel, progress, |entry, slice| {
        let mut stream = Stream::reader(slice.clone(), FormatVersion::Legacy);
        PackageSummary::read(&mut stream)
            .map_err(|e| e.context(entry.composite_name.clone()))?;
        let path = out_dir.join(format!("{}.gpk", entry.composite_name));
        std::fs::write(&path, slice.as_slice())?;
        debug!(composite = %entry.composite_name, path = %path.display(), "slice unpacked");
        Ok(path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PackageBuilder;
    use crate::directory::PackageIndex;
    use crate::composite::CompositeSection;
    use parking_lot::Mutex;

    fn package_bytes(name: &str) -> Vec<u8> {
        let mut builder = PackageBuilder::new(FormatVersion::Modern);
        builder
            .object("Core", "Package", PackageIndex::NULL, name)
            .unwrap();
        builder.build().unwrap()
    }

    /// Two storage files; the second slice of `b.gpk` is garbage
    fn fixture(dir: &Path) -> CompositeIndex {
        let mut sections = Vec::new();
        for (file, names) in [("a", vec!["one", "two"]), ("b", vec!["three", "junk"])] {
            let mut blob = Vec::new();
            let mut entries = Vec::new();
            for name in names {
                let bytes = if name == "junk" {
                    vec![0xAB; 64]
                } else {
                    package_bytes(name)
                };
                entries.push(CompositeEntry {
                    filename: file.to_string(),
                    object_path: format!("Pkg_{}", name),
                    composite_name: format!("{}_{}", file, name),
                    offset: blob.len() as u64,
                    size: bytes.len() as u64,
                });
                blob.extend_from_slice(&bytes);
            }
            std::fs::write(dir.join(format!("{}.gpk", file)), blob).unwrap();
            sections.push(CompositeSection {
                filename: file.to_string(),
                entries,
            });
        }
        CompositeIndex::from_sections(sections)
    }

    #[derive(Default)]
    struct Recorder {
        items: Mutex<Vec<String>>,
    }

    impl ProgressSink for Recorder {
        fn advanced(&self, _done: usize, _total: usize, item: &str) {
            self.items.lock().push(item.to_string());
        }
    }

    #[test]
    fn test_unpack_collects_item_errors() {
        let storage = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let index = fixture(storage.path());
        let recorder = Recorder::default();
        let report = unpack_composites(
            &index,
            storage.path(),
            out.path(),
            BatchOptions::default(),
            &CancellationFlag::new(),
            &recorder,
        )
        .unwrap();
        assert_eq!(report.output.len(), 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].item, "b_junk");
        assert!(!report.cancelled);
        assert!(out.path().join("a_two.gpk").exists());
        assert_eq!(recorder.items.lock().len(), 4);
    }

    #[test]
    fn test_cancelled_before_start() {
        let storage = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let index = fixture(storage.path());
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let report = unpack_composites(
            &index,
            storage.path(),
            out.path(),
            BatchOptions::default(),
            &cancel,
            &NullProgress,
        )
        .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processed(), 0);
    }

    #[test]
    fn test_missing_storage_file_is_item_error() {
        let storage = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let index = fixture(storage.path());
        std::fs::remove_file(storage.path().join("b.gpk")).unwrap();
        let report = unpack_composites(
            &index,
            storage.path(),
            out.path(),
            BatchOptions { workers: 1, poll_interval: 1 },
            &CancellationFlag::new(),
            &NullProgress,
        )
        .unwrap();
        assert_eq!(report.output.len(), 2);
        assert_eq!(report.errors.len(), 2);
    }
}
