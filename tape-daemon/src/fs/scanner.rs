//! Recursive directory enumeration feeding the packer.
//!
//! Traversal is depth-unbounded and breadth-parallel: a fixed-size worker
//! pool drains a shared queue of directories, emitting one file source per
//! discovered entry. The backup root itself is emitted first; sibling order
//! is unspecified but stable within a run. Every source carries the scan id
//! of its parent directory, so the emitted sequence encodes the tree as
//! indices rather than owning pointers.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::utils::errors::{EngineError, Result};
use super::source::FileSource;

/// Default size of the scan worker pool.
pub const DEFAULT_SCAN_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub workers: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_SCAN_WORKERS,
        }
    }
}

struct DirTask {
    path: PathBuf,
    scan_id: usize,
}

struct ScanState {
    queue: VecDeque<DirTask>,
    /// Directories currently being read by a worker.
    active: usize,
    next_id: usize,
    failure: Option<EngineError>,
    /// Set when the consumer went away; workers stop submitting.
    closed: bool,
}

impl ScanState {
    fn done(&self) -> bool {
        self.queue.is_empty() && self.active == 0
    }
}

pub struct DirectoryScanner {
    opts: ScanOptions,
}

impl DirectoryScanner {
    pub fn new(opts: ScanOptions) -> Self {
        Self { opts }
    }

    /// Walk the tree under `root`, calling `emit` for every discovered
    /// entry. `emit` returns false when the consumer is gone, which stops
    /// the scan. Returns the number of sources emitted.
    ///
    /// Cancellation refuses new directory submissions and waits for the
    /// directories already being read to finish.
    pub fn scan(
        &self,
        root: &Path,
        cancel: &CancellationToken,
        emit: &(dyn Fn(FileSource) -> bool + Sync),
    ) -> Result<usize> {
        let root_meta = std::fs::metadata(root).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                EngineError::PathMissing(root.to_path_buf())
            } else {
                EngineError::Io(err)
            }
        })?;

        // The root is always scan id 0 and always the first emission.
        let root_source = FileSource::new(root.to_path_buf(), 0, None);
        if !emit(root_source) {
            return Err(EngineError::Cancelled);
        }
        if !root_meta.is_dir() {
            return Ok(1);
        }

        let state = Mutex::new(ScanState {
            queue: VecDeque::from([DirTask {
                path: root.to_path_buf(),
                scan_id: 0,
            }]),
            active: 0,
            next_id: 1,
            failure: None,
            closed: false,
        });
        let cvar = Condvar::new();

        std::thread::scope(|scope| {
            for _ in 0..self.opts.workers.max(1) {
                scope.spawn(|| self.worker(&state, &cvar, cancel, emit));
            }
        });

        let mut state = state.into_inner().unwrap();
        if let Some(err) = state.failure.take() {
            return Err(err);
        }
        if cancel.is_cancelled() || state.closed {
            return Err(EngineError::Cancelled);
        }
        Ok(state.next_id)
    }

    fn worker(
        &self,
        state: &Mutex<ScanState>,
        cvar: &Condvar,
        cancel: &CancellationToken,
        emit: &(dyn Fn(FileSource) -> bool + Sync),
    ) {
        loop {
            let task = {
                let mut guard = state.lock().unwrap();
                loop {
                    let stop = guard.failure.is_some()
                        || guard.closed
                        || cancel.is_cancelled();
                    if stop || guard.done() {
                        cvar.notify_all();
                        return;
                    }
                    if let Some(task) = guard.queue.pop_front() {
                        guard.active += 1;
                        break task;
                    }
                    guard = cvar.wait(guard).unwrap();
                }
            };

            self.read_directory(&task, state, cvar, emit);

            let mut guard = state.lock().unwrap();
            guard.active -= 1;
            if guard.done() {
                cvar.notify_all();
            }
        }
    }

    fn read_directory(
        &self,
        task: &DirTask,
        state: &Mutex<ScanState>,
        cvar: &Condvar,
        emit: &(dyn Fn(FileSource) -> bool + Sync),
    ) {
        let entries = match std::fs::read_dir(&task.path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %task.path.display(), %err, "failed to read directory");
                let mut guard = state.lock().unwrap();
                guard.failure.get_or_insert(EngineError::Io(err));
                cvar.notify_all();
                return;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let mut guard = state.lock().unwrap();
                    guard.failure.get_or_insert(EngineError::Io(err));
                    cvar.notify_all();
                    return;
                }
            };

            let path = entry.path();
            // Recurse into real directories only; a symlinked directory is
            // still materialized as a source for its target.
            let descend = entry
                .file_type()
                .map(|t| t.is_dir() && !t.is_symlink())
                .unwrap_or(false);

            let scan_id = {
                let mut guard = state.lock().unwrap();
                if guard.closed || guard.failure.is_some() {
                    return;
                }
                let id = guard.next_id;
                guard.next_id += 1;
                if descend {
                    guard.queue.push_back(DirTask {
                        path: path.clone(),
                        scan_id: id,
                    });
                    cvar.notify_one();
                }
                id
            };

            let source = FileSource::new(path, scan_id, Some(task.scan_id));
            if !emit(source) {
                debug!("scan consumer went away, stopping enumeration");
                let mut guard = state.lock().unwrap();
                guard.closed = true;
                cvar.notify_all();
                return;
            }
        }
    }
}
