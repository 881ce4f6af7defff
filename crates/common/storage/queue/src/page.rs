// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A single memory-mapped page backed by one file.
//!
//! Every read and write names its own `(position, length)`, so threads never
//! share cursor state and may touch disjoint regions of the same page
//! concurrently. The 64-bit counter accessors operate directly on the mapped
//! memory with hardware atomics, which keeps them consistent even when the
//! same file is mapped by another handle.
//!
//! ## Lifecycle
//!
//! The mapping sits behind a `RwLock<Option<_>>`. Accessors hold the read
//! guard for the duration of one call; [`MappedPage::close`] takes the write
//! guard, flushes if dirty and drops the mapping. Any access after that fails
//! with [`QueueError::PageClosed`](crate::QueueError::PageClosed).

#[cfg(target_has_atomic = "64")]
use std::sync::atomic::AtomicU64;
use std::{
    fmt,
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use bytes::Bytes;
use mmap_io::MemoryMappedFile;
#[cfg(not(target_has_atomic = "64"))]
use parking_lot::Mutex;
use parking_lot::RwLock;
use snafu::{OptionExt, ResultExt, ensure};
use tracing::debug;

use crate::{
    Result,
    error::{IoSnafu, MisalignedSnafu, MmapSnafu, PageClosedSnafu, PageInUseSnafu, PageOutOfBoundsSnafu},
};

/// Width of the embedded counters in bytes.
const COUNTER_SIZE: u64 = 8;

/// One fixed-size mapped region of a page file.
pub struct MappedPage {
    /// Backing page file.
    path:         PathBuf,
    /// Page index within its factory.
    index:        u64,
    /// Usable length in bytes.
    page_size:    u64,
    /// The mapping; `None` once closed.
    mmap:         RwLock<Option<MemoryMappedFile>>,
    /// Set by every write, cleared by flush.
    dirty:        AtomicBool,
    /// Outstanding acquisitions through the page factory.
    ref_count:    AtomicUsize,
    /// Serializes counter updates where 64-bit atomics are unavailable.
    #[cfg(not(target_has_atomic = "64"))]
    counter_lock: Mutex<()>,
}

impl MappedPage {
    /// Map `page_size` bytes of the file at `path`, creating the file or
    /// growing it when it is shorter than a page. Existing content is kept.
    pub(crate) fn map<P: AsRef<Path>>(path: P, index: u64, page_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(IoSnafu { path: &path })?;
        let len = file.metadata().context(IoSnafu { path: &path })?.len();
        if len < page_size {
            file.set_len(page_size).context(IoSnafu { path: &path })?;
        }
        drop(file);

        let mmap = MemoryMappedFile::open_rw(&path).context(MmapSnafu { path: &path })?;

        debug!(path = ?path, index, page_size, "Mapped page");

        Ok(Self {
            path,
            index,
            page_size,
            mmap: RwLock::new(Some(mmap)),
            dirty: AtomicBool::new(false),
            ref_count: AtomicUsize::new(0),
            #[cfg(not(target_has_atomic = "64"))]
            counter_lock: Mutex::new(()),
        })
    }

    /// Read `len` bytes starting at `position`.
    pub fn read_at(&self, position: u64, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.read_into(position, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Fill `buf` with the bytes starting at `position`.
    pub fn read_into(&self, position: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(position, buf.len() as u64)?;
        self.with_mmap(|mmap| {
            mmap.read_into(position, buf)
                .context(MmapSnafu { path: &self.path })
        })
    }

    /// Write `data` at `position` and mark the page dirty.
    pub fn write_at(&self, position: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(position, data.len() as u64)?;
        self.with_mmap(|mmap| {
            mmap.update_region(position, data)
                .context(MmapSnafu { path: &self.path })
        })?;
        self.mark_dirty();
        Ok(())
    }

    /// Whether the page has unflushed writes.
    pub fn is_dirty(&self) -> bool { self.dirty.load(Ordering::Acquire) }

    /// Force dirty content to the backing file. No-op once closed.
    pub fn flush(&self) -> Result<()> {
        let guard = self.mmap.read();
        let Some(mmap) = guard.as_ref() else {
            return Ok(());
        };

        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = mmap.flush() {
                self.dirty.store(true, Ordering::Release);
                return Err(e).context(MmapSnafu { path: &self.path });
            }
            debug!(path = ?self.path, index = self.index, "Flushed page");
        }
        Ok(())
    }

    /// Flush and unmap the page.
    ///
    /// Idempotent. Fails with
    /// [`QueueError::PageInUse`](crate::QueueError::PageInUse) while the page
    /// still has outstanding acquisitions.
    pub fn close(&self) -> Result<()> {
        let ref_count = self.ref_count();
        ensure!(
            ref_count == 0,
            PageInUseSnafu {
                index: self.index,
                ref_count,
            }
        );
        self.force_close()
    }

    /// Close regardless of outstanding acquisitions.
    ///
    /// The mapping is dropped even when the final flush fails; the flush error
    /// is still returned.
    pub(crate) fn force_close(&self) -> Result<()> {
        let mut guard = self.mmap.write();
        let Some(mmap) = guard.take() else {
            return Ok(());
        };

        let flushed = if self.dirty.swap(false, Ordering::AcqRel) {
            mmap.flush().context(MmapSnafu { path: &self.path })
        } else {
            Ok(())
        };
        drop(mmap);

        debug!(path = ?self.path, index = self.index, "Closed page");
        flushed
    }

    pub fn is_closed(&self) -> bool { self.mmap.read().is_none() }

    pub fn index(&self) -> u64 { self.index }

    pub fn path(&self) -> &Path { &self.path }

    pub fn page_size(&self) -> u64 { self.page_size }

    /// Number of outstanding acquisitions.
    pub fn ref_count(&self) -> usize { self.ref_count.load(Ordering::Acquire) }

    pub(crate) fn retain(&self) -> usize { self.ref_count.fetch_add(1, Ordering::AcqRel) + 1 }

    /// Drop one acquisition. Unbalanced releases leave the count at zero.
    pub(crate) fn release(&self) -> usize {
        match self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => {
                debug!(index = self.index, "Release of an unreferenced page");
                0
            }
        }
    }

    fn mark_dirty(&self) { self.dirty.store(true, Ordering::Release); }

    fn with_mmap<T>(&self, f: impl FnOnce(&MemoryMappedFile) -> Result<T>) -> Result<T> {
        let guard = self.mmap.read();
        let mmap = guard
            .as_ref()
            .context(PageClosedSnafu { index: self.index })?;
        f(mmap)
    }

    fn check_bounds(&self, position: u64, len: u64) -> Result<()> {
        ensure!(
            position
                .checked_add(len)
                .is_some_and(|end| end <= self.page_size),
            PageOutOfBoundsSnafu {
                index: self.index,
                position,
                len,
                page_size: self.page_size,
            }
        );
        Ok(())
    }

    fn check_counter(&self, position: u64) -> Result<()> {
        ensure!(position % COUNTER_SIZE == 0, MisalignedSnafu { position });
        self.check_bounds(position, COUNTER_SIZE)
    }
}

#[cfg(target_has_atomic = "64")]
impl MappedPage {
    /// Load the counter at `position` with acquire ordering.
    pub fn get_u64_at(&self, position: u64) -> Result<u64> {
        self.with_counter(position, |counter| counter.load(Ordering::Acquire))
    }

    /// Store `value` at `position` with release ordering.
    pub fn set_u64_at(&self, position: u64, value: u64) -> Result<()> {
        self.with_counter(position, |counter| counter.store(value, Ordering::Release))?;
        self.mark_dirty();
        Ok(())
    }

    /// Atomically add one (wrapping at `u64::MAX`) and return the previous
    /// value.
    pub fn increment_u64_at(&self, position: u64) -> Result<u64> {
        let previous = self.with_counter(position, |counter| {
            let mut current = counter.load(Ordering::Acquire);
            loop {
                match counter.compare_exchange_weak(
                    current,
                    current.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(previous) => return previous,
                    Err(actual) => current = actual,
                }
            }
        })?;
        self.mark_dirty();
        Ok(previous)
    }

    fn with_counter<T>(&self, position: u64, f: impl FnOnce(&AtomicU64) -> T) -> Result<T> {
        self.check_counter(position)?;
        self.with_mmap(|mmap| {
            let counter = mmap
                .atomic_u64(position)
                .context(MmapSnafu { path: &self.path })?;
            Ok(f(&counter))
        })
    }
}

#[cfg(not(target_has_atomic = "64"))]
impl MappedPage {
    /// Load the counter at `position`.
    pub fn get_u64_at(&self, position: u64) -> Result<u64> {
        self.check_counter(position)?;
        let _guard = self.counter_lock.lock();
        self.load_counter(position)
    }

    /// Store `value` at `position`.
    pub fn set_u64_at(&self, position: u64, value: u64) -> Result<()> {
        self.check_counter(position)?;
        let _guard = self.counter_lock.lock();
        self.write_at(position, &value.to_ne_bytes())
    }

    /// Add one (wrapping at `u64::MAX`) and return the previous value.
    pub fn increment_u64_at(&self, position: u64) -> Result<u64> {
        self.check_counter(position)?;
        let _guard = self.counter_lock.lock();
        let previous = self.load_counter(position)?;
        self.write_at(position, &previous.wrapping_add(1).to_ne_bytes())?;
        Ok(previous)
    }

    fn load_counter(&self, position: u64) -> Result<u64> {
        let mut buf = [0u8; COUNTER_SIZE as usize];
        self.read_into(position, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

impl fmt::Debug for MappedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedPage")
            .field("path", &self.path)
            .field("index", &self.index)
            .field("page_size", &self.page_size)
            .field("ref_count", &self.ref_count())
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}
