//! Heap snapshots taken from a tracking [`GlobalAlloc`].
//!
//! Install [`SnapshotAlloc`] as the global allocator to enable the
//! [`Backend::Snapshot`](crate::Backend::Snapshot) memory backend.
//!
//! ```no_run
//! use hala_mprof::SnapshotAlloc;
//!
//! #[global_allocator]
//! static ALLOC: SnapshotAlloc = SnapshotAlloc(32);
//! ```

use std::{
    alloc::{GlobalAlloc, Layout, System},
    collections::HashMap,
    ffi::c_void,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

use serde::{Deserialize, Serialize};

use crate::{helper::Reentrancy, sampler::TWO_20};

/// Innermost frames of every captured stack, they belong to the unwinder
/// and the allocator.
const ALLOCATOR_FRAMES: usize = 4;

const DEFAULT_MAX_FRAMES: usize = 32;

/// Function start addresses of the calling stack, innermost first, with the
/// allocator's own frames dropped.
///
/// # Safety
///
/// Callers hold the tracker lock: the unsynchronized API is the only one
/// usable from inside the allocator.
unsafe fn capture_frames(max_frames: usize) -> Vec<usize> {
    let mut frames = Vec::with_capacity(max_frames);
    let mut depth = 0;

    backtrace::trace_unsynchronized(|frame| {
        depth += 1;

        if depth > ALLOCATOR_FRAMES {
            frames.push(frame.symbol_address() as usize);
        }

        frames.len() < max_frames
    });

    frames
}

/// Source file of the function starting at `addr`.
///
/// # Safety
///
/// Callers hold the tracker lock.
unsafe fn frame_file(addr: usize) -> Option<PathBuf> {
    let mut file = None;

    backtrace::resolve_unsynchronized(addr as *mut c_void, |symbol| {
        if file.is_none() {
            file = symbol.filename().map(Path::to_path_buf);
        }
    });

    file
}

/// Live bytes attributed to one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
    pub file: PathBuf,
    pub size: usize,
    pub blocks: usize,
}

impl FileStat {
    /// Size in MiB.
    pub fn mib(&self) -> f64 {
        self.size as f64 / TWO_20
    }
}

/// A point-in-time view of the live heap, grouped by source file.
///
/// A block counts toward every distinct file that appears on its allocation
/// backtrace, so nested callers all see the memory they caused.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Sorted by size, largest first.
    pub files: Vec<FileStat>,
}

impl Snapshot {
    /// Take a snapshot of the tracked heap.
    ///
    /// Returns `None` when [`SnapshotAlloc`] is not the global allocator.
    pub fn take() -> Option<Snapshot> {
        if !is_installed() {
            return None;
        }

        let _guard = Reentrancy::new();

        Some(heap_tracker(DEFAULT_MAX_FRAMES).snapshot())
    }

    /// Returns the statistic of the first (largest) file matching `path`.
    ///
    /// Paths match when either one is a suffix of the other, component-wise,
    /// so `src/lib.rs` finds the absolute path recorded in debug info.
    pub fn stat_for(&self, path: &Path) -> Option<&FileStat> {
        self.files
            .iter()
            .find(|stat| stat.file.ends_with(path) || path.ends_with(&stat.file))
    }

    /// Live bytes attributed to `path`, zero when nothing matches.
    pub fn size_for(&self, path: &Path) -> usize {
        self.stat_for(path).map(|stat| stat.size).unwrap_or_default()
    }
}

struct LiveBlock {
    size: usize,
    frames: Vec<usize>,
}

#[derive(Default)]
struct Tables {
    /// Live blocks by address.
    blocks: HashMap<usize, LiveBlock>,
    /// Resolved source files by frame address.
    files: HashMap<usize, Option<PathBuf>>,
}

/// Live blocks of the tracking allocator.
///
/// The lock also serializes every backtrace call.
struct HeapTracker {
    max_frames: usize,
    tables: Mutex<Tables>,
}

impl HeapTracker {
    fn new(max_frames: usize) -> Self {
        Self {
            max_frames,
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, ptr: *mut u8, layout: Layout) {
        let mut tables = self.lock();

        let frames = unsafe { capture_frames(self.max_frames) };

        tables.blocks.insert(
            ptr as usize,
            LiveBlock {
                size: layout.size(),
                frames,
            },
        );
    }

    fn unregister(&self, ptr: *mut u8) {
        self.lock().blocks.remove(&(ptr as usize));
    }

    fn snapshot(&self) -> Snapshot {
        let mut tables = self.lock();
        let Tables { blocks, files } = &mut *tables;

        for addr in blocks.values().flat_map(|block| &block.frames) {
            files
                .entry(*addr)
                .or_insert_with(|| unsafe { frame_file(*addr) });
        }

        let files = &*files;
        let mut by_file: HashMap<&Path, FileStat> = HashMap::new();

        for block in blocks.values() {
            let mut seen: Vec<&Path> = vec![];

            let block_files = block
                .frames
                .iter()
                .filter_map(|addr| files.get(addr).and_then(|file| file.as_deref()));

            for file in block_files {
                if seen.contains(&file) {
                    continue;
                }

                seen.push(file);

                let stat = by_file.entry(file).or_insert_with(|| FileStat {
                    file: file.to_path_buf(),
                    size: 0,
                    blocks: 0,
                });

                stat.size += block.size;
                stat.blocks += 1;
            }
        }

        let mut stats = by_file.into_values().collect::<Vec<_>>();

        stats.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.file.cmp(&b.file)));

        Snapshot { files: stats }
    }
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// The process wide tracker, created by the first caller with its frame limit.
fn heap_tracker(max_frames: usize) -> &'static HeapTracker {
    static TRACKER: OnceLock<HeapTracker> = OnceLock::new();

    TRACKER.get_or_init(|| HeapTracker::new(max_frames))
}

/// Returns true once [`SnapshotAlloc`] has served an allocation.
pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Relaxed)
}

/// A [`GlobalAlloc`] over [`System`] that tracks live blocks and their
/// allocation backtraces, the inner value is the maximum number of frames kept
/// per block.
pub struct SnapshotAlloc(pub usize);

unsafe impl GlobalAlloc for SnapshotAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);

        let guard = Reentrancy::new();

        if guard.is_ok() && !ptr.is_null() {
            INSTALLED.store(true, Ordering::Relaxed);
            heap_tracker(self.0).register(ptr, layout);
        }

        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        {
            let guard = Reentrancy::new();

            // forget the block before the address can be handed out again
            if guard.is_ok() {
                heap_tracker(self.0).unregister(ptr);
            }
        }

        System.dealloc(ptr, layout);
    }
}
