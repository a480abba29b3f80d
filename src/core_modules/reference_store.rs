// THEORY:
// The reference store is the only memory the classifier has. "Training" never touches
// kernel weights; it only appends more pooled rows under each kernel's identifier.
// Classification then scans every stored row of every kernel exhaustively.
//
// Key architectural principles:
// 1.  **Append-Only**: rows are never mutated. A kernel's rows can be dropped as a
//     whole (`reset`) before a fresh training run, but never edited one by one.
// 2.  **Concurrent Appends**: training over a directory appends from many worker
//     tasks at once, one batch of rows per kernel per image, with no cross-image
//     coordination. Readers get a cheap `Arc` snapshot and never block writers
//     for longer than a pointer swap.
// 3.  **Scoped Acquisition**: the file-backed store is held through a
//     `StoreSession` guard that flushes on every exit path, including errors.

use crate::error::{Result, ShapeVisionError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// One previously captured, flattened pooled-map row.
pub type ReferenceRow = Vec<f64>;

/// Keyed store mapping a kernel identifier to its captured rows.
pub trait ReferenceStore: Send + Sync {
    /// All rows stored for a kernel, or `None` if the kernel was never trained.
    fn get(&self, kernel_id: &str) -> Option<Arc<Vec<ReferenceRow>>>;

    fn append(&self, kernel_id: &str, row: ReferenceRow) -> Result<()>;

    fn append_rows(&self, kernel_id: &str, rows: Vec<ReferenceRow>) -> Result<()> {
        for row in rows {
            self.append(kernel_id, row)?;
        }
        Ok(())
    }

    /// Appends rows for several kernels at once. Every row length is checked
    /// before anything is written, so a rejected batch leaves all kernels as they were.
    fn append_batch(&self, batch: BTreeMap<String, Vec<ReferenceRow>>) -> Result<()> {
        for (kernel_id, rows) in &batch {
            check_row_lengths(self.get(kernel_id).as_deref().map(Vec::as_slice), rows)?;
        }
        for (kernel_id, rows) in batch {
            self.append_rows(&kernel_id, rows)?;
        }
        Ok(())
    }

    /// Drops every row stored for a kernel.
    fn reset(&self, kernel_id: &str) -> Result<()>;

    fn kernel_ids(&self) -> Vec<String>;
}

/// New rows must match the length of the rows already stored, or of the first new
/// row when the kernel is empty.
fn check_row_lengths(existing: Option<&[ReferenceRow]>, new_rows: &[ReferenceRow]) -> Result<()> {
    let expected = existing
        .and_then(|rows| rows.first())
        .or_else(|| new_rows.first())
        .map(Vec::len)
        .unwrap_or(0);
    if let Some(bad) = new_rows.iter().find(|row| row.len() != expected) {
        return Err(ShapeVisionError::Comparison {
            expected,
            actual: bad.len(),
        });
    }
    Ok(())
}

/// In-memory store. Cloning rows out is avoided by handing out `Arc` snapshots.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<String, Arc<Vec<ReferenceRow>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_map(map: BTreeMap<String, Vec<ReferenceRow>>) -> Self {
        let rows = map
            .into_iter()
            .map(|(kernel_id, rows)| (kernel_id, Arc::new(rows)))
            .collect();
        Self {
            rows: RwLock::new(rows),
        }
    }

    fn snapshot(&self) -> BTreeMap<String, Vec<ReferenceRow>> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.iter()
            .map(|(kernel_id, rows)| (kernel_id.clone(), rows.as_ref().clone()))
            .collect()
    }

    pub fn row_count(&self, kernel_id: &str) -> usize {
        self.get(kernel_id).map(|rows| rows.len()).unwrap_or(0)
    }
}

impl ReferenceStore for MemoryStore {
    fn get(&self, kernel_id: &str) -> Option<Arc<Vec<ReferenceRow>>> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.get(kernel_id).cloned()
    }

    fn append(&self, kernel_id: &str, row: ReferenceRow) -> Result<()> {
        self.append_rows(kernel_id, vec![row])
    }

    fn append_rows(&self, kernel_id: &str, new_rows: Vec<ReferenceRow>) -> Result<()> {
        if new_rows.is_empty() {
            return Ok(());
        }
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        check_row_lengths(rows.get(kernel_id).map(|r| r.as_slice()), &new_rows)?;
        let entry = rows.entry(kernel_id.to_string()).or_default();
        Arc::make_mut(entry).extend(new_rows);
        Ok(())
    }

    fn append_batch(&self, batch: BTreeMap<String, Vec<ReferenceRow>>) -> Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        for (kernel_id, new_rows) in &batch {
            check_row_lengths(rows.get(kernel_id).map(|r| r.as_slice()), new_rows)?;
        }
        for (kernel_id, new_rows) in batch {
            if new_rows.is_empty() {
                continue;
            }
            Arc::make_mut(rows.entry(kernel_id).or_default()).extend(new_rows);
        }
        Ok(())
    }

    fn reset(&self, kernel_id: &str) -> Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        rows.remove(kernel_id);
        Ok(())
    }

    fn kernel_ids(&self) -> Vec<String> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = rows.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// On-disk layout of a `JsonFileStore`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    kernels: BTreeMap<String, Vec<ReferenceRow>>,
}

const STORE_FILE_VERSION: u32 = 1;

/// A `MemoryStore` persisted to a JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
    dirty: AtomicBool,
}

impl JsonFileStore {
    /// Loads the store at `path`, or starts empty if the file does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: StoreFile = serde_json::from_str(&raw)?;
            if file.version != STORE_FILE_VERSION {
                return Err(ShapeVisionError::InvalidConfig(format!(
                    "reference store {} has version {}, expected {}",
                    path.display(),
                    file.version,
                    STORE_FILE_VERSION
                )));
            }
            info!(
                "Loaded {} kernels of reference rows from {}",
                file.kernels.len(),
                path.display()
            );
            MemoryStore::from_map(file.kernels)
        } else {
            debug!("No reference store at {}, starting empty", path.display());
            MemoryStore::new()
        };
        Ok(Self {
            path,
            inner,
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row_count(&self, kernel_id: &str) -> usize {
        self.inner.row_count(kernel_id)
    }

    /// Writes the store if anything changed since the last flush. The file is
    /// replaced atomically through a temporary sibling.
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let file = StoreFile {
            version: STORE_FILE_VERSION,
            kernels: self.inner.snapshot(),
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let write = std::fs::write(&tmp, serde_json::to_vec(&file)?)
            .and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(e) = write {
            self.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        debug!("Flushed reference store to {}", self.path.display());
        Ok(())
    }
}

impl ReferenceStore for JsonFileStore {
    fn get(&self, kernel_id: &str) -> Option<Arc<Vec<ReferenceRow>>> {
        self.inner.get(kernel_id)
    }

    fn append(&self, kernel_id: &str, row: ReferenceRow) -> Result<()> {
        self.inner.append(kernel_id, row)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn append_rows(&self, kernel_id: &str, rows: Vec<ReferenceRow>) -> Result<()> {
        self.inner.append_rows(kernel_id, rows)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn append_batch(&self, batch: BTreeMap<String, Vec<ReferenceRow>>) -> Result<()> {
        self.inner.append_batch(batch)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn reset(&self, kernel_id: &str) -> Result<()> {
        self.inner.reset(kernel_id)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn kernel_ids(&self) -> Vec<String> {
        self.inner.kernel_ids()
    }
}

/// Holds a file-backed store for the length of a batch and flushes it when
/// dropped, whichever way the batch ends.
pub struct StoreSession {
    store: Arc<JsonFileStore>,
    finished: bool,
}

impl StoreSession {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            store: Arc::new(JsonFileStore::open(path)?),
            finished: false,
        })
    }

    /// A shared handle for worker tasks.
    pub fn handle(&self) -> Arc<JsonFileStore> {
        Arc::clone(&self.store)
    }

    /// Flushes and reports the outcome instead of leaving it to `Drop`.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.store.flush()
    }
}

impl std::ops::Deref for StoreSession {
    type Target = JsonFileStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl Drop for StoreSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.store.flush() {
            warn!("Failed to flush reference store {}: {}", self.store.path().display(), e);
        }
    }
}
