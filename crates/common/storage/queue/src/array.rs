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

//! Append-only array of variable-length items stored in mapped pages.
//!
//! [`BigArray`] is the default [`BackingArray`] behind a
//! [`BigQueue`](crate::BigQueue). It is built from three page factories:
//!
//! - **meta**: one 16-byte pinned page holding the head and tail indexes
//! - **index**: fixed 32-byte items, `2^17` per page, addressed by array index
//! - **data**: packed payloads; an item that does not fit in the remaining
//!   space of the current data page starts the next one
//!
//! ## Index Item Format
//!
//! ```text
//! ┌──────────────────┬──────────────┬──────────────┬─────────────────┬────────────┬──────────┐
//! │ data page (8B)   │ offset (4B)  │ length (4B)  │ timestamp (8B)  │ crc32 (4B) │ rsvd (4B)│
//! └──────────────────┴──────────────┴──────────────┴─────────────────┴────────────┴──────────┘
//! ```
//!
//! All fields are little-endian. The timestamp is Unix nanoseconds at append.
//!
//! ## Concurrency
//!
//! Appends are serialized by an append cursor mutex. `get` and `append` hold
//! the array lock shared; `remove_all` and `remove_before_index` hold it
//! exclusively, so page deletion never races a read of the deleted page.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use snafu::ensure;
use tracing::{debug, info};

use crate::{
    Result,
    crc::{item_crc, verify_item_crc},
    error::{CorruptedItemSnafu, IndexOutOfRangeSnafu, InvalidConfigSnafu, ItemTooLargeSnafu},
    factory::{CachePolicy, PageFactory},
    path::{DATA_DIR, INDEX_DIR, META_DATA_DIR},
};

/// Storage the queue engine reads payloads from and appends them to.
///
/// Indexes are positions on a circular 64-bit space; the retained window is
/// `[tail_index, head_index)`.
pub trait BackingArray: Send + Sync {
    /// Append a payload and return its index. Advances the head by one.
    fn append(&self, payload: &[u8]) -> Result<u64>;

    /// Read the payload at `index`. Fails with
    /// [`QueueError::IndexOutOfRange`](crate::QueueError::IndexOutOfRange)
    /// outside `[tail, head)`.
    fn get(&self, index: u64) -> Result<Bytes>;

    /// Index the next append will receive.
    fn head_index(&self) -> u64;

    /// Oldest retained index.
    fn tail_index(&self) -> u64;

    /// Number of retained items.
    fn size(&self) -> u64 { self.head_index().wrapping_sub(self.tail_index()) }

    /// Drop every item and reset head and tail to zero.
    fn remove_all(&self) -> Result<()>;

    /// Discard storage for items before `index`. Fails with
    /// [`QueueError::IndexOutOfRange`](crate::QueueError::IndexOutOfRange)
    /// outside `[tail, head)`.
    fn remove_before_index(&self, index: u64) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Bits of an array index addressing an item within one index page.
const INDEX_ITEMS_PER_PAGE_BITS: u32 = 17;
/// Index items per index page.
pub const INDEX_ITEMS_PER_PAGE: u64 = 1 << INDEX_ITEMS_PER_PAGE_BITS;
const INDEX_ITEM_LENGTH: u64 = 32;
/// Size of an index page in bytes (4 MiB).
pub const INDEX_PAGE_SIZE: u64 = INDEX_ITEM_LENGTH * INDEX_ITEMS_PER_PAGE;

const META_PAGE_SIZE: u64 = 16;
const META_PAGE_INDEX: u64 = 0;
const HEAD_POSITION: u64 = 0;
const TAIL_POSITION: u64 = 8;

/// One decoded index item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexItem {
    data_page_index: u64,
    offset:          u32,
    length:          u32,
    timestamp:       i64,
    crc:             u32,
}

impl IndexItem {
    fn encode(&self) -> [u8; INDEX_ITEM_LENGTH as usize] {
        let mut buf = [0u8; INDEX_ITEM_LENGTH as usize];
        buf[0..8].copy_from_slice(&self.data_page_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[24..28].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; INDEX_ITEM_LENGTH as usize]) -> Self {
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            bytes
        };
        let u32_at = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[at..at + 4]);
            u32::from_le_bytes(bytes)
        };
        Self {
            data_page_index: u64::from_le_bytes(u64_at(0)),
            offset:          u32_at(8),
            length:          u32_at(12),
            timestamp:       i64::from_le_bytes(u64_at(16)),
            crc:             u32_at(24),
        }
    }

    /// End of this item's payload within its data page.
    fn end(&self) -> u64 { u64::from(self.offset) + u64::from(self.length) }
}

/// Position of the next append.
#[derive(Debug, Default, Clone, Copy)]
struct AppendCursor {
    data_page_index: u64,
    data_offset:     u64,
}

/// Paged, append-only array of byte items.
pub struct BigArray {
    dir:            PathBuf,
    data_page_size: u64,
    index_factory:  PageFactory,
    data_factory:   PageFactory,
    meta_factory:   PageFactory,
    head:           AtomicU64,
    tail:           AtomicU64,
    cursor:         Mutex<AppendCursor>,
    array_lock:     RwLock<()>,
}

impl BigArray {
    /// Open the array stored under `dir`, creating it if absent.
    ///
    /// `policy` applies to the index and data page caches; the meta page is
    /// always pinned.
    pub fn open<P: Into<PathBuf>>(dir: P, data_page_size: u64, policy: CachePolicy) -> Result<Self> {
        let dir = dir.into();
        ensure!(
            data_page_size > 0 && data_page_size <= u64::from(u32::MAX),
            InvalidConfigSnafu {
                message: format!("data page size {data_page_size} must be in 1..=u32::MAX"),
            }
        );

        let index_factory = PageFactory::new(dir.join(INDEX_DIR), INDEX_PAGE_SIZE, policy)?;
        let data_factory = PageFactory::new(dir.join(DATA_DIR), data_page_size, policy)?;
        let meta_factory =
            PageFactory::new(dir.join(META_DATA_DIR), META_PAGE_SIZE, CachePolicy::Pinned)?;

        let (head, tail) = {
            let meta = meta_factory.acquire(META_PAGE_INDEX)?;
            (meta.get_u64_at(HEAD_POSITION)?, meta.get_u64_at(TAIL_POSITION)?)
        };

        let array = Self {
            dir,
            data_page_size,
            index_factory,
            data_factory,
            meta_factory,
            head: AtomicU64::new(head),
            tail: AtomicU64::new(tail),
            cursor: Mutex::new(AppendCursor::default()),
            array_lock: RwLock::new(()),
        };
        *array.cursor.lock() = array.recover_cursor(head, tail)?;

        info!(path = ?array.dir, head, tail, "Array opened");
        Ok(array)
    }

    /// Append time of the item at `index`.
    pub fn item_timestamp(&self, index: u64) -> Result<DateTime<Utc>> {
        let _shared = self.array_lock.read();
        self.check_index(index)?;
        let item = self.read_index_item(index)?;
        Ok(DateTime::from_timestamp_nanos(item.timestamp))
    }

    pub fn is_empty(&self) -> bool { self.size() == 0 }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn data_page_size(&self) -> u64 { self.data_page_size }

    /// Total bytes of index, data and meta page files on disk.
    pub fn disk_usage(&self) -> Result<u64> {
        Ok(self.index_factory.back_file_size()?
            + self.data_factory.back_file_size()?
            + self.meta_factory.back_file_size()?)
    }

    /// Indexes of the data pages present on disk.
    pub fn data_page_indexes(&self) -> Result<Vec<u64>> {
        self.data_factory.existing_page_indexes()
    }

    fn recover_cursor(&self, head: u64, tail: u64) -> Result<AppendCursor> {
        if head == tail {
            let next_page = self
                .data_factory
                .existing_page_indexes()?
                .last()
                .map_or(0, |last| last + 1);
            return Ok(AppendCursor {
                data_page_index: next_page,
                data_offset:     0,
            });
        }

        let last = self.read_index_item(head.wrapping_sub(1))?;
        Ok(AppendCursor {
            data_page_index: last.data_page_index,
            data_offset:     last.end(),
        })
    }

    fn check_index(&self, index: u64) -> Result<()> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        ensure!(
            index.wrapping_sub(tail) < head.wrapping_sub(tail),
            IndexOutOfRangeSnafu { index, tail, head }
        );
        Ok(())
    }

    fn index_position(index: u64) -> (u64, u64) {
        let page = index >> INDEX_ITEMS_PER_PAGE_BITS;
        let slot = index & (INDEX_ITEMS_PER_PAGE - 1);
        (page, slot * INDEX_ITEM_LENGTH)
    }

    fn read_index_item(&self, index: u64) -> Result<IndexItem> {
        let (page_index, position) = Self::index_position(index);
        let page = self.index_factory.acquire(page_index)?;
        let mut buf = [0u8; INDEX_ITEM_LENGTH as usize];
        page.read_into(position, &mut buf)?;
        Ok(IndexItem::decode(&buf))
    }

    fn write_index_item(&self, index: u64, item: &IndexItem) -> Result<()> {
        let (page_index, position) = Self::index_position(index);
        let page = self.index_factory.acquire(page_index)?;
        page.write_at(position, &item.encode())
    }

    fn publish(&self, position: u64, value: u64) -> Result<()> {
        let meta = self.meta_factory.acquire(META_PAGE_INDEX)?;
        meta.set_u64_at(position, value)
    }
}

impl BackingArray for BigArray {
    fn append(&self, payload: &[u8]) -> Result<u64> {
        let len = payload.len() as u64;
        ensure!(
            len <= self.data_page_size,
            ItemTooLargeSnafu {
                len: payload.len(),
                max: self.data_page_size,
            }
        );

        let _shared = self.array_lock.read();
        let mut cursor = self.cursor.lock();

        if cursor.data_offset + len > self.data_page_size {
            cursor.data_page_index += 1;
            cursor.data_offset = 0;
        }

        {
            let page = self.data_factory.acquire(cursor.data_page_index)?;
            page.write_at(cursor.data_offset, payload)?;
        }

        let index = self.head.load(Ordering::Acquire);
        #[allow(clippy::cast_possible_truncation)]
        let item = IndexItem {
            data_page_index: cursor.data_page_index,
            offset:          cursor.data_offset as u32,
            length:          payload.len() as u32,
            timestamp:       Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            crc:             item_crc(payload),
        };
        self.write_index_item(index, &item)?;
        cursor.data_offset += len;

        let next = index.wrapping_add(1);
        self.publish(HEAD_POSITION, next)?;
        self.head.store(next, Ordering::Release);

        Ok(index)
    }

    fn get(&self, index: u64) -> Result<Bytes> {
        let _shared = self.array_lock.read();
        self.check_index(index)?;

        let item = self.read_index_item(index)?;
        let page = self.data_factory.acquire(item.data_page_index)?;
        let payload = page.read_at(u64::from(item.offset), item.length as usize)?;

        ensure!(
            verify_item_crc(&payload, item.crc),
            CorruptedItemSnafu { index }
        );
        Ok(payload)
    }

    fn head_index(&self) -> u64 { self.head.load(Ordering::Acquire) }

    fn tail_index(&self) -> u64 { self.tail.load(Ordering::Acquire) }

    fn remove_all(&self) -> Result<()> {
        let _exclusive = self.array_lock.write();
        let mut cursor = self.cursor.lock();

        self.index_factory.delete_all_pages()?;
        self.data_factory.delete_all_pages()?;

        self.publish(HEAD_POSITION, 0)?;
        self.publish(TAIL_POSITION, 0)?;
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        *cursor = AppendCursor::default();

        debug!(path = ?self.dir, "Removed all items");
        Ok(())
    }

    fn remove_before_index(&self, index: u64) -> Result<()> {
        let _exclusive = self.array_lock.write();
        self.check_index(index)?;

        let (index_page, _) = Self::index_position(index);
        let item = self.read_index_item(index)?;

        self.index_factory.delete_pages_before(index_page)?;
        self.data_factory.delete_pages_before(item.data_page_index)?;

        self.publish(TAIL_POSITION, index)?;
        self.tail.store(index, Ordering::Release);

        debug!(
            path = ?self.dir,
            index,
            index_page,
            data_page = item.data_page_index,
            "Removed items before index"
        );
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.index_factory.flush()?;
        self.data_factory.flush()?;
        self.meta_factory.flush()
    }

    fn close(&self) -> Result<()> {
        let results = [
            self.index_factory.close(),
            self.data_factory.close(),
            self.meta_factory.close(),
        ];
        info!(path = ?self.dir, "Array closed");
        results.into_iter().collect()
    }
}

impl fmt::Debug for BigArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigArray")
            .field("dir", &self.dir)
            .field("data_page_size", &self.data_page_size)
            .field("head", &self.head_index())
            .field("tail", &self.tail_index())
            .finish_non_exhaustive()
    }
}
