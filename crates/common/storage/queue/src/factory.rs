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

//! Page cache that maps page files on demand.
//!
//! A [`PageFactory`] owns one directory of equally sized page files
//! (`page-<n>.dat`). Pages are mapped lazily on first acquisition and shared
//! between all acquirers of the same index; each acquisition bumps the page's
//! reference count and must be paired with a release.
//!
//! ## Eviction
//!
//! With [`CachePolicy::Evict`] a background sweeper thread wakes every
//! `sweep_interval` and uncaches, flushes and closes pages that have no
//! outstanding acquisitions and have been idle for at least `ttl`. Idle
//! pages are selected and removed under the cache write lock, which
//! acquirers take (shared) to bump a reference count, so a referenced page
//! is never selected. The flush happens after the lock is released. [`CachePolicy::Pinned`] keeps every page resident until the
//! factory is closed.

use std::{
    collections::HashMap,
    fmt,
    ops::Deref,
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use snafu::{ResultExt, ensure};
use tracing::{debug, error, info, warn};

use crate::{
    Result,
    error::{FactoryClosedSnafu, InternalSnafu, IoSnafu},
    page::MappedPage,
    path::{page_file_path, scan_page_files},
};

/// Residency policy for a [`PageFactory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Pages stay mapped until the factory is closed.
    Pinned,
    /// Unreferenced pages idle for `ttl` are evicted by a sweeper running
    /// every `sweep_interval`.
    Evict {
        ttl:            Duration,
        sweep_interval: Duration,
    },
}

struct CacheEntry {
    page:        Arc<MappedPage>,
    /// Milliseconds since the factory epoch.
    last_access: AtomicU64,
}

struct FactoryInner {
    dir:         PathBuf,
    page_size:   u64,
    ttl:         Option<Duration>,
    epoch:       Instant,
    cache:       RwLock<HashMap<u64, CacheEntry>>,
    /// Serializes page creation so each index is mapped once.
    create_lock: Mutex<()>,
    closed:      AtomicBool,
}

impl FactoryInner {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Retain a cached page, refreshing its access time.
    fn retain_cached(&self, index: u64) -> Option<Arc<MappedPage>> {
        let cache = self.cache.read();
        let entry = cache.get(&index)?;
        entry.page.retain();
        entry.last_access.store(self.now_millis(), Ordering::Release);
        Some(entry.page.clone())
    }

    fn release(&self, page: &Arc<MappedPage>) {
        let cache = self.cache.read();
        if let Some(entry) = cache.get(&page.index())
            && Arc::ptr_eq(&entry.page, page)
        {
            entry.last_access.store(self.now_millis(), Ordering::Release);
        }
        page.release();
    }

    /// Close and uncache idle, unreferenced pages. Returns how many were
    /// evicted.
    fn evict_idle(&self) -> Result<usize> {
        let Some(ttl) = self.ttl else {
            return Ok(0);
        };
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let now = self.now_millis();

        // Only the selection runs under the write lock. A removed page has
        // no references and can no longer be found, so it is closed after
        // the lock is dropped and cached lookups never wait on its flush.
        let evicted: Vec<(u64, CacheEntry)> = {
            let mut cache = self.cache.write();
            let idle: Vec<u64> = cache
                .iter()
                .filter(|(_, entry)| {
                    entry.page.ref_count() == 0
                        && now.saturating_sub(entry.last_access.load(Ordering::Acquire))
                            >= ttl_millis
                })
                .map(|(index, _)| *index)
                .collect();
            idle.into_iter()
                .filter_map(|index| cache.remove(&index).map(|entry| (index, entry)))
                .collect()
        };

        let mut first_error = None;
        for (index, entry) in &evicted {
            debug!(dir = ?self.dir, index, "Evicting idle page");
            if let Err(e) = entry.page.force_close() {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(evicted.len()), Err)
    }

    fn release_cached_pages(&self) -> Result<()> {
        let mut cache = self.cache.write();
        let mut first_error = None;
        for (_, entry) in cache.drain() {
            if let Err(e) = entry.page.force_close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Handle to the background eviction thread.
struct Sweeper {
    /// Dropping the sender disconnects the channel and stops the thread.
    stop_tx: Sender<()>,
    handle:  JoinHandle<()>,
}

impl Sweeper {
    fn spawn(inner: Weak<FactoryInner>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("page-sweeper".into())
            .spawn(move || Self::run(&inner, &stop_rx, interval))
            .map_err(|e| {
                InternalSnafu {
                    message: format!("failed to spawn page sweeper: {e}"),
                }
                .build()
            })?;
        Ok(Self { stop_tx, handle })
    }

    fn run(inner: &Weak<FactoryInner>, stop_rx: &Receiver<()>, interval: Duration) {
        loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    match inner.evict_idle() {
                        Ok(0) => {}
                        Ok(evicted) => debug!(dir = ?inner.dir, evicted, "Swept page cache"),
                        Err(e) => error!(dir = ?inner.dir, error = ?e, "Failed to evict idle pages"),
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn stop(self) -> Result<()> {
        drop(self.stop_tx);
        self.handle.join().map_err(|_| {
            InternalSnafu {
                message: "page sweeper thread panicked".to_string(),
            }
            .build()
        })
    }
}

/// Cache of mapped pages over one directory of page files.
pub struct PageFactory {
    inner:   Arc<FactoryInner>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl PageFactory {
    /// Create a factory over `dir`, creating the directory if needed.
    pub fn new<P: Into<PathBuf>>(dir: P, page_size: u64, policy: CachePolicy) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;

        let ttl = match policy {
            CachePolicy::Pinned => None,
            CachePolicy::Evict { ttl, .. } => Some(ttl),
        };
        let inner = Arc::new(FactoryInner {
            dir,
            page_size,
            ttl,
            epoch: Instant::now(),
            cache: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let sweeper = match policy {
            CachePolicy::Pinned => None,
            CachePolicy::Evict { sweep_interval, .. } => {
                Some(Sweeper::spawn(Arc::downgrade(&inner), sweep_interval)?)
            }
        };

        Ok(Self {
            inner,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Acquire the page at `index`, mapping it if it is not cached.
    ///
    /// Every successful call must be balanced by [`release_page`] or by
    /// dropping a [`PageGuard`] from [`acquire`].
    ///
    /// [`release_page`]: Self::release_page
    /// [`acquire`]: Self::acquire
    pub fn acquire_page(&self, index: u64) -> Result<Arc<MappedPage>> {
        if let Some(page) = self.inner.retain_cached(index) {
            return Ok(page);
        }

        let _create = self.inner.create_lock.lock();
        ensure!(
            !self.inner.closed.load(Ordering::Acquire),
            FactoryClosedSnafu {
                dir: &self.inner.dir,
            }
        );
        if let Some(page) = self.inner.retain_cached(index) {
            return Ok(page);
        }

        let page = Arc::new(MappedPage::map(
            self.page_file_path(index),
            index,
            self.inner.page_size,
        )?);
        page.retain();

        self.inner.cache.write().insert(index, CacheEntry {
            page:        page.clone(),
            last_access: AtomicU64::new(self.inner.now_millis()),
        });

        Ok(page)
    }

    /// Acquire the page at `index` behind a guard that releases it on drop.
    pub fn acquire(&self, index: u64) -> Result<PageGuard<'_>> {
        let page = self.acquire_page(index)?;
        Ok(PageGuard {
            factory: self,
            page,
        })
    }

    /// Release one acquisition of `page`, as returned by [`acquire_page`].
    ///
    /// The page becomes eligible for eviction once its count reaches zero.
    /// Releasing a page that was since deleted or evicted only touches that
    /// page, never a newer mapping cached at the same index.
    ///
    /// [`acquire_page`]: Self::acquire_page
    pub fn release_page(&self, page: &Arc<MappedPage>) { self.inner.release(page); }

    /// Flush all dirty cached pages without closing them.
    pub fn flush(&self) -> Result<()> {
        let cache = self.inner.cache.read();
        let mut first_error = None;
        for entry in cache.values() {
            if let Err(e) = entry.page.flush() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flush and close every cached page, referenced or not.
    pub fn release_cached_pages(&self) -> Result<()> { self.inner.release_cached_pages() }

    /// Close the page at `index` if cached and delete its file.
    pub fn delete_page(&self, index: u64) -> Result<()> {
        let entry = self.inner.cache.write().remove(&index);
        if let Some(entry) = entry {
            entry.page.force_close()?;
        }

        let path = self.page_file_path(index);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = ?path, index, "Deleted page file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(IoSnafu { path }),
        }
    }

    /// Delete every page, cached or on disk, whose index is below `index`.
    pub fn delete_pages_before(&self, index: u64) -> Result<()> {
        for page_index in self.known_page_indexes()? {
            if page_index < index {
                self.delete_page(page_index)?;
            }
        }
        Ok(())
    }

    /// Delete every page, cached or on disk.
    pub fn delete_all_pages(&self) -> Result<()> {
        for page_index in self.known_page_indexes()? {
            self.delete_page(page_index)?;
        }
        Ok(())
    }

    /// Indexes of the page files present on disk.
    pub fn existing_page_indexes(&self) -> Result<Vec<u64>> {
        Ok(scan_page_files(&self.inner.dir)?
            .into_iter()
            .map(|(index, _)| index)
            .collect())
    }

    /// Total size in bytes of the page files present on disk.
    pub fn back_file_size(&self) -> Result<u64> {
        let mut total = 0;
        for (_, path) in scan_page_files(&self.inner.dir)? {
            total += std::fs::metadata(&path).context(IoSnafu { path })?.len();
        }
        Ok(total)
    }

    /// Number of currently mapped pages.
    pub fn cache_size(&self) -> usize { self.inner.cache.read().len() }

    pub fn page_file_path(&self, index: u64) -> PathBuf { page_file_path(&self.inner.dir, index) }

    pub fn dir(&self) -> &Path { &self.inner.dir }

    pub fn page_size(&self) -> u64 { self.inner.page_size }

    /// Stop the sweeper and release every cached page. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let sweeper = self.sweeper.lock().take();
        let stopped = sweeper.map_or(Ok(()), Sweeper::stop);

        let _create = self.inner.create_lock.lock();
        self.inner.release_cached_pages()?;
        info!(dir = ?self.inner.dir, "Page factory closed");
        stopped
    }

    /// Run one eviction pass immediately.
    #[cfg(test)]
    fn sweep(&self) -> Result<usize> { self.inner.evict_idle() }

    fn known_page_indexes(&self) -> Result<Vec<u64>> {
        let mut indexes = self.existing_page_indexes()?;
        indexes.extend(self.inner.cache.read().keys().copied());
        indexes.sort_unstable();
        indexes.dedup();
        Ok(indexes)
    }
}

impl fmt::Debug for PageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFactory")
            .field("dir", &self.inner.dir)
            .field("page_size", &self.inner.page_size)
            .field("ttl", &self.inner.ttl)
            .field("cached", &self.cache_size())
            .finish()
    }
}

impl Drop for PageFactory {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(dir = ?self.inner.dir, error = ?e, "Failed to close page factory");
        }
    }
}

/// An acquired page, released back to its factory on drop.
pub struct PageGuard<'a> {
    factory: &'a PageFactory,
    page:    Arc<MappedPage>,
}

impl Deref for PageGuard<'_> {
    type Target = MappedPage;

    fn deref(&self) -> &MappedPage { &self.page }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) { self.factory.inner.release(&self.page); }
}
