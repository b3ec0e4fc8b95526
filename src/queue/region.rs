//! The fixed-size shared mapping that backs a task queue.
//!
//! A region is either anonymous (private to one process and its threads) or
//! backed by a file, usually under `/dev/shm`, so that separate worker
//! processes can map the same bytes. The first process to create the file
//! initializes it; everyone else attaches and adopts the geometry recorded
//! in the header.

use super::layout::{
    INIT_READY, LAYOUT_VERSION, MAGIC, RegionHeader, RegionLayout, SlotHeader,
};
use super::now_millis;
use crate::config::{MAX_BUFFER_CAPACITY, MAX_SLOT_COUNT, QueueConfig};
use crate::error::{BufferKind, Result, ShmtaskError};
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

/// How long an attacher waits for the creator to finish initializing.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);
const ATTACH_POLL: Duration = Duration::from_millis(5);

/// A mapped task-queue region.
pub struct SharedRegion {
    // Keeps the mapping alive; all access goes through `base`.
    _mmap: MmapMut,
    base: NonNull<u8>,
    layout: RegionLayout,
    path: Option<PathBuf>,
    created: bool,
}

// SAFETY: every header field is atomic, and buffer bytes are only touched
// while the owning slot's lock is held.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("layout", &self.layout)
            .field("path", &self.path)
            .field("created", &self.created)
            .finish()
    }
}

impl SharedRegion {
    /// Create a private region that only this process (and its threads) can see.
    pub fn anonymous(config: &QueueConfig) -> Result<Self> {
        config.validate()?;
        let layout = RegionLayout::from_config(config);
        let mmap = MmapMut::map_anon(layout.total_size())?;
        let region = Self::from_mmap(mmap, layout, None, true)?;
        region.initialize(config);
        Ok(region)
    }

    /// Create the region at `path`, or attach to it if another process got there first.
    ///
    /// Creation is decided by an exclusive file create, so concurrent
    /// callers agree on exactly one creator.
    pub fn create_or_attach(path: &Path, config: &QueueConfig) -> Result<Self> {
        config.validate()?;

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let region = Self::attach(path)?;
                let recorded = region.layout;
                let wanted = RegionLayout::from_config(config);
                if recorded != wanted {
                    tracing::warn!(
                        path = %path.display(),
                        ?recorded,
                        ?wanted,
                        "Region already exists with a different geometry; using the recorded one"
                    );
                }
                return Ok(region);
            }
            Err(e) => {
                return Err(ShmtaskError::Region(format!(
                    "cannot create {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let layout = RegionLayout::from_config(config);
        file.set_len(layout.total_size() as u64)?;

        // SAFETY: the file was created above and sized to the layout; other
        // processes only read it after `init_state` is published.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let region = Self::from_mmap(mmap, layout, Some(path.to_path_buf()), true)?;
        region.initialize(config);

        tracing::info!(
            path = %path.display(),
            slots = layout.slot_count,
            bytes = layout.total_size(),
            "Created shared region"
        );
        Ok(region)
    }

    /// Attach to an existing region, waiting briefly for its creator to finish.
    pub fn attach(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                ShmtaskError::Region(format!("cannot open {}: {}", path.display(), e))
            })?;

        let started = Instant::now();
        loop {
            if let Some(region) = Self::try_attach(&file, path)? {
                tracing::debug!(
                    path = %path.display(),
                    slots = region.layout.slot_count,
                    "Attached to shared region"
                );
                return Ok(region);
            }
            if started.elapsed() >= ATTACH_TIMEOUT {
                return Err(ShmtaskError::Region(format!(
                    "{} was never initialized (creator may have crashed); remove it and retry",
                    path.display()
                )));
            }
            thread::sleep(ATTACH_POLL);
        }
    }

    /// One attach attempt. `None` means the creator is not done yet.
    fn try_attach(file: &File, path: &Path) -> Result<Option<Self>> {
        let len = file.metadata()?.len() as usize;
        if len < std::mem::size_of::<RegionHeader>() {
            return Ok(None);
        }

        // SAFETY: the file is at least one header long; contents are
        // validated before use.
        let mmap = unsafe { MmapMut::map_mut(file)? };
        // SAFETY: mapping is page aligned and large enough for the header.
        let header = unsafe { &*(mmap.as_ptr() as *const RegionHeader) };

        if header.init_state.load(Ordering::Acquire) != INIT_READY {
            return Ok(None);
        }

        let magic = header.magic.load(Ordering::Relaxed);
        if magic != MAGIC {
            return Err(ShmtaskError::Region(format!(
                "{} is not a shmtask region (magic {:#018x})",
                path.display(),
                magic
            )));
        }
        let version = header.version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(ShmtaskError::Region(format!(
                "{} has layout version {}, expected {}",
                path.display(),
                version,
                LAYOUT_VERSION
            )));
        }

        let layout = RegionLayout {
            slot_count: header.slot_count.load(Ordering::Relaxed),
            input_capacity: header.input_capacity.load(Ordering::Relaxed),
            operation_capacity: header.operation_capacity.load(Ordering::Relaxed),
            result_capacity: header.result_capacity.load(Ordering::Relaxed),
        };
        let max_cap = MAX_BUFFER_CAPACITY.as_bytes();
        let sane = (1..=MAX_SLOT_COUNT).contains(&layout.slot_count)
            && [
                layout.input_capacity,
                layout.operation_capacity,
                layout.result_capacity,
            ]
            .iter()
            .all(|c| (1..=max_cap).contains(c));
        if !sane || len < layout.total_size() {
            return Err(ShmtaskError::Region(format!(
                "{} has a corrupt header ({:?}, {} bytes on disk)",
                path.display(),
                layout,
                len
            )));
        }

        Self::from_mmap(mmap, layout, Some(path.to_path_buf()), false).map(Some)
    }

    fn from_mmap(
        mut mmap: MmapMut,
        layout: RegionLayout,
        path: Option<PathBuf>,
        created: bool,
    ) -> Result<Self> {
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| ShmtaskError::Region("mapping returned a null pointer".to_string()))?;
        Ok(Self {
            _mmap: mmap,
            base,
            layout,
            path,
            created,
        })
    }

    /// Write the header of a freshly zeroed region and publish it.
    fn initialize(&self, config: &QueueConfig) {
        let header = self.header();
        header.magic.store(MAGIC, Ordering::Relaxed);
        header.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        header.slot_count.store(self.layout.slot_count, Ordering::Relaxed);
        header
            .input_capacity
            .store(self.layout.input_capacity, Ordering::Relaxed);
        header
            .operation_capacity
            .store(self.layout.operation_capacity, Ordering::Relaxed);
        header
            .result_capacity
            .store(self.layout.result_capacity, Ordering::Relaxed);
        let lease_ms = u32::try_from(config.lease.as_millis()).unwrap_or(u32::MAX);
        header.lease_ms.store(lease_ms, Ordering::Relaxed);
        header.created_at_ms.store(now_millis(), Ordering::Relaxed);
        header.init_state.store(INIT_READY, Ordering::Release);
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Backing file, `None` for anonymous regions.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether this handle created (rather than attached to) the region.
    pub fn is_creator(&self) -> bool {
        self.created
    }

    pub fn header(&self) -> &RegionHeader {
        // SAFETY: offset 0 always holds an initialized, aligned header.
        unsafe { &*(self.base.as_ptr() as *const RegionHeader) }
    }

    pub fn slot_header(&self, index: u32) -> &SlotHeader {
        assert!(index < self.layout.slot_count, "slot index out of range");
        let offset = self.layout.slot_offset(index);
        // SAFETY: offset is in bounds and cache-line aligned per the layout.
        unsafe { &*(self.base.as_ptr().add(offset) as *const SlotHeader) }
    }

    fn buffer_span(&self, index: u32, kind: BufferKind) -> (usize, usize) {
        assert!(index < self.layout.slot_count, "slot index out of range");
        match kind {
            BufferKind::Input => (
                self.layout.input_offset(index),
                self.layout.input_capacity as usize,
            ),
            BufferKind::Operation => (
                self.layout.operation_offset(index),
                self.layout.operation_capacity as usize,
            ),
            BufferKind::Result => (
                self.layout.result_offset(index),
                self.layout.result_capacity as usize,
            ),
        }
    }

    /// Copy `data` to the start of a slot buffer. Caller holds the slot lock.
    pub(crate) fn write_buffer(&self, index: u32, kind: BufferKind, data: &[u8]) {
        let (offset, capacity) = self.buffer_span(index, kind);
        assert!(data.len() <= capacity, "write past {} buffer", kind);
        // SAFETY: bounds checked above; the slot lock excludes other writers.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.as_ptr().add(offset), data.len());
        }
    }

    /// Copy the first `len` bytes of a slot buffer. Caller holds the slot lock.
    pub(crate) fn read_buffer(&self, index: u32, kind: BufferKind, len: usize) -> Vec<u8> {
        let (offset, capacity) = self.buffer_span(index, kind);
        let len = len.min(capacity);
        let mut out = vec![0u8; len];
        // SAFETY: bounds clamped above; the slot lock excludes writers.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }

    /// Zero the first `len` bytes of a slot buffer. Caller holds the slot lock.
    pub(crate) fn zero_buffer(&self, index: u32, kind: BufferKind, len: usize) {
        let (offset, capacity) = self.buffer_span(index, kind);
        let len = len.min(capacity);
        // SAFETY: bounds clamped above; the slot lock excludes other access.
        unsafe {
            std::ptr::write_bytes(self.base.as_ptr().add(offset), 0, len);
        }
    }

    /// Remove the backing file if this handle created it.
    ///
    /// Processes that still have the region mapped keep working on it;
    /// new attachers will no longer find it.
    pub fn unlink(&self) -> Result<bool> {
        match (&self.path, self.created) {
            (Some(path), true) => match fs::remove_file(path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Removed shared region");
                    Ok(true)
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            },
            _ => Ok(false),
        }
    }
}
