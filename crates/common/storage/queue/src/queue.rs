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

//! Queue engine and lifecycle management.
//!
//! A [`BigQueue`] is a FIFO view over a [`BackingArray`]. The array owns the
//! payloads and the head index; the queue owns a single persisted counter,
//! the front index, kept in an 8-byte pinned page under `front_index/`.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueBuilder::new("/path/to/queues", "orders").build()?;
//!
//! queue.enqueue(b"hello")?;
//! while let Some(payload) = queue.dequeue()? {
//!     println!("{payload:?}");
//! }
//!
//! // Reclaim disk for consumed items, then shut down.
//! queue.gc()?;
//! queue.close()?;
//! ```
//!
//! ## Locking
//!
//! `enqueue` never takes the front lock. Operations that move the front
//! (`dequeue`, `remove_n`, `remove_all`) and those that need a stable front
//! (`apply_for_each`, `flush`) serialize on it. Pending waiters are completed
//! under a separate waiter lock after each enqueue.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use snafu::ensure;
use tracing::{debug, info, warn};

use crate::{
    QueueConfig, QueueError, Result,
    array::{BackingArray, BigArray},
    error::QueueClosedSnafu,
    factory::{CachePolicy, PageFactory, PageGuard},
    path::FRONT_INDEX_DIR,
    waiter::{Waiter, WaiterSlot},
};

const FRONT_PAGE_SIZE: u64 = 8;
const FRONT_PAGE_INDEX: u64 = 0;
const FRONT_POSITION: u64 = 0;

#[derive(Default)]
struct Waiters {
    dequeue: Option<Arc<WaiterSlot>>,
    peek:    Option<Arc<WaiterSlot>>,
}

/// Return the pending slot in `current`, installing a fresh one if there is
/// none or the previous one already completed.
fn pending_slot(current: &mut Option<Arc<WaiterSlot>>) -> Arc<WaiterSlot> {
    match current {
        Some(slot) if !slot.is_done() => slot.clone(),
        _ => {
            let slot = WaiterSlot::new();
            *current = Some(slot.clone());
            slot
        }
    }
}

/// Complete `slot` with `outcome`. An empty outcome leaves it pending.
fn settle(slot: &WaiterSlot, outcome: Result<Option<Bytes>>) {
    match outcome {
        Ok(Some(payload)) => {
            slot.resolve(payload);
        }
        Ok(None) => {}
        Err(e) => {
            slot.fail(e);
        }
    }
}

/// A persistent FIFO queue of byte payloads.
///
/// All operations take `&self` and are safe to call from many threads.
/// Indexes live on a circular 64-bit space, so the queue keeps working after
/// the front or head wraps past `u64::MAX`.
pub struct BigQueue<A: BackingArray = BigArray> {
    dir:           PathBuf,
    array:         A,
    front_factory: PageFactory,
    /// Serializes front mutations and reads that need a stable front.
    front_lock:    Mutex<()>,
    waiters:       Mutex<Waiters>,
    closed:        AtomicBool,
}

impl BigQueue<BigArray> {
    /// Open the queue described by `config`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConfig`] for a rejected configuration and
    /// an I/O or mapping error if the queue files cannot be opened.
    pub fn open(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let dir = config.queue_dir();
        let array = BigArray::open(&dir, config.data_page_size, config.cache_policy())?;
        Self::with_array(dir, array)
    }
}

impl<A: BackingArray> BigQueue<A> {
    /// Build a queue over an already opened backing array.
    ///
    /// The front index is kept under `dir`. A persisted front that lies
    /// outside the array's `[tail, head]` window is reset to the tail.
    ///
    /// # Errors
    ///
    /// Returns an error if the front index page cannot be created or mapped.
    pub fn with_array<P: Into<PathBuf>>(dir: P, array: A) -> Result<Self> {
        let dir = dir.into();
        let front_factory = PageFactory::new(
            dir.join(FRONT_INDEX_DIR),
            FRONT_PAGE_SIZE,
            CachePolicy::Pinned,
        )?;

        let head = array.head_index();
        let tail = array.tail_index();
        let front = {
            let page = front_factory.acquire(FRONT_PAGE_INDEX)?;
            let front = page.get_u64_at(FRONT_POSITION)?;
            if front.wrapping_sub(tail) > head.wrapping_sub(tail) {
                warn!(path = ?dir, front, tail, head, "Front index outside retained window, resetting to tail");
                page.set_u64_at(FRONT_POSITION, tail)?;
                tail
            } else {
                front
            }
        };

        info!(path = ?dir, front, head, tail, "Queue initialized");

        Ok(Self {
            dir,
            array,
            front_factory,
            front_lock: Mutex::new(()),
            waiters: Mutex::new(Waiters::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether no item is waiting to be dequeued.
    pub fn is_empty(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.front()? == self.array.head_index())
    }

    /// Number of items waiting to be dequeued.
    pub fn size(&self) -> Result<u64> {
        self.ensure_open()?;
        // Front before head: a concurrent dequeue never moves front past a
        // head read later.
        let front = self.front()?;
        Ok(self.array.head_index().wrapping_sub(front))
    }

    /// Index of the next item to dequeue.
    pub fn front_index(&self) -> Result<u64> {
        self.ensure_open()?;
        self.front()
    }

    /// Index the next enqueued item will receive.
    pub fn head_index(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.array.head_index())
    }

    /// Append a payload to the back of the queue, then complete any pending
    /// waiters.
    pub fn enqueue(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.ensure_open()?;
        self.array.append(payload.as_ref())?;
        self.complete_waiters();
        Ok(())
    }

    /// Remove and return the item at the front, or `None` if the queue is
    /// empty.
    ///
    /// The persisted front advances before the payload is read. If that read
    /// fails, the error is returned and the item is not delivered again.
    pub fn dequeue(&self) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let _front = self.front_lock.lock();
        let page = self.front_page()?;
        if page.get_u64_at(FRONT_POSITION)? == self.array.head_index() {
            return Ok(None);
        }
        let index = page.increment_u64_at(FRONT_POSITION)?;
        self.array.get(index).map(Some)
    }

    /// Return the item at the front without removing it.
    pub fn peek(&self) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let front = self.front()?;
        if front == self.array.head_index() {
            return Ok(None);
        }
        self.array.get(front).map(Some)
    }

    /// Return the item `offset` positions behind the front without removing
    /// anything. Negative offsets and offsets at or past the size yield
    /// `None`.
    pub fn peek_at_offset(&self, offset: i64) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let Ok(offset) = u64::try_from(offset) else {
            return Ok(None);
        };
        let front = self.front()?;
        if offset >= self.array.head_index().wrapping_sub(front) {
            return Ok(None);
        }
        self.array.get(front.wrapping_add(offset)).map(Some)
    }

    /// Discard up to `n` items from the front. Never moves past the head;
    /// non-positive `n` does nothing.
    pub fn remove_n(&self, n: i64) -> Result<()> {
        self.ensure_open()?;
        let Ok(n) = u64::try_from(n) else {
            return Ok(());
        };
        let _front = self.front_lock.lock();
        let page = self.front_page()?;
        let front = page.get_u64_at(FRONT_POSITION)?;
        let size = self.array.head_index().wrapping_sub(front);
        page.set_u64_at(FRONT_POSITION, front.wrapping_add(n.min(size)))
    }

    /// Discard every item and reset the front to zero.
    pub fn remove_all(&self) -> Result<()> {
        self.ensure_open()?;
        let _front = self.front_lock.lock();
        self.array.remove_all()?;
        self.front_page()?.set_u64_at(FRONT_POSITION, 0)
    }

    /// Visit every waiting item in FIFO order without consuming any.
    ///
    /// The visitor runs under the front lock, which is not reentrant. It may
    /// call the read-only operations (`peek`, `peek_at_offset`, `size`) but
    /// must not call `dequeue`, `remove_n`, `remove_all`, `flush` or `close`
    /// on the same queue, and must not `enqueue` while a `dequeue_async`
    /// waiter is pending. Any of those deadlocks.
    pub fn apply_for_each<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(Bytes),
    {
        self.ensure_open()?;
        let _front = self.front_lock.lock();
        let head = self.array.head_index();
        let mut index = self.front()?;
        while index != head {
            visitor(self.array.get(index)?);
            index = index.wrapping_add(1);
        }
        Ok(())
    }

    /// Reclaim storage for items that were already dequeued.
    ///
    /// The item just before the front is retained. Nothing happens when
    /// there is nothing to reclaim.
    pub fn gc(&self) -> Result<()> {
        self.ensure_open()?;
        let front = self.front()?;
        let before = if front == 0 { u64::MAX } else { front - 1 };
        match self.array.remove_before_index(before) {
            Ok(()) => {
                debug!(path = ?self.dir, before, "Garbage collected consumed items");
                Ok(())
            }
            Err(QueueError::IndexOutOfRange { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Flush the front index and the backing array to disk.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let _front = self.front_lock.lock();
        self.front_factory.flush()?;
        self.array.flush()
    }

    /// Register interest in the next item, consuming it when it arrives.
    ///
    /// If an item is available now the waiter completes immediately. A
    /// second call while the first is still pending returns a waiter on the
    /// same slot.
    pub fn dequeue_async(&self) -> Result<Waiter> {
        self.ensure_open()?;
        let mut waiters = self.waiters.lock();
        let slot = pending_slot(&mut waiters.dequeue);
        settle(&slot, self.dequeue());
        Ok(Waiter::new(slot))
    }

    /// Register interest in the front item without consuming it.
    pub fn peek_async(&self) -> Result<Waiter> {
        self.ensure_open()?;
        let mut waiters = self.waiters.lock();
        let slot = pending_slot(&mut waiters.peek);
        settle(&slot, self.peek());
        Ok(Waiter::new(slot))
    }

    /// Flush and release every page, cancel pending waiters and close the
    /// backing array. Closing twice is a no-op.
    ///
    /// Every other operation fails with [`QueueError::QueueClosed`] after
    /// this returns.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // The waiter lock is taken before the front lock elsewhere, so the two
        // are never held together here.
        let front_result = {
            let _front = self.front_lock.lock();
            self.front_factory.close()
        };

        {
            let mut waiters = self.waiters.lock();
            for slot in [waiters.dequeue.take(), waiters.peek.take()]
                .into_iter()
                .flatten()
            {
                slot.cancel();
            }
        }

        let array_result = self.array.close();
        info!(path = ?self.dir, "Queue closed");
        front_result.and(array_result)
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Directory holding the queue's files.
    pub fn dir(&self) -> &Path { &self.dir }

    /// The backing array.
    pub const fn array(&self) -> &A { &self.array }

    fn ensure_open(&self) -> Result<()> {
        ensure!(!self.closed.load(Ordering::Acquire), QueueClosedSnafu);
        Ok(())
    }

    fn front_page(&self) -> Result<PageGuard<'_>> { self.front_factory.acquire(FRONT_PAGE_INDEX) }

    fn front(&self) -> Result<u64> { self.front_page()?.get_u64_at(FRONT_POSITION) }

    fn complete_waiters(&self) {
        let waiters = self.waiters.lock();
        if let Some(slot) = waiters.peek.as_ref().filter(|slot| !slot.is_done()) {
            settle(slot, self.peek());
        }
        if let Some(slot) = waiters.dequeue.as_ref().filter(|slot| !slot.is_done()) {
            settle(slot, self.dequeue());
        }
    }
}

impl<A: BackingArray> Drop for BigQueue<A> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = ?self.dir, error = ?e, "Failed to close queue");
        }
    }
}

impl<A: BackingArray> fmt::Debug for BigQueue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueue")
            .field("dir", &self.dir)
            .field("head", &self.array.head_index())
            .field("tail", &self.array.tail_index())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
