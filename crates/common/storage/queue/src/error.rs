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

use std::{io, path::PathBuf, sync::Arc};

use snafu::Snafu;

/// Queue operation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error on {}", path.display()))]
    Io { path: PathBuf, source: io::Error },

    /// Memory mapping operation failed.
    #[snafu(display("Mmap operation failed on {}", path.display()))]
    Mmap {
        path:   PathBuf,
        source: mmap_io::MmapIoError,
    },

    /// Access to a page after it was closed.
    #[snafu(display("Page {index} is closed"))]
    PageClosed { index: u64 },

    /// Explicit close of a page that still has outstanding acquisitions.
    #[snafu(display("Page {index} is still referenced {ref_count} time(s)"))]
    PageInUse { index: u64, ref_count: usize },

    /// Page acquisition from a factory that was closed.
    #[snafu(display("Page factory for {} is closed", dir.display()))]
    FactoryClosed { dir: PathBuf },

    /// Positional access past the end of a page.
    #[snafu(display(
        "Access at {position}+{len} is outside page {index} of {page_size} bytes"
    ))]
    PageOutOfBounds {
        index:     u64,
        position:  u64,
        len:       u64,
        page_size: u64,
    },

    /// 64-bit counter access at an offset that is not 8-byte aligned.
    #[snafu(display("Position {position} is not 8-byte aligned"))]
    Misaligned { position: u64 },

    /// Array index outside the retained `[tail, head)` window.
    #[snafu(display("Index {index} is out of range [{tail}, {head})"))]
    IndexOutOfRange { index: u64, tail: u64, head: u64 },

    /// Payload does not fit in a single data page.
    #[snafu(display("Item of {len} bytes exceeds the {max} byte data page"))]
    ItemTooLarge { len: usize, max: u64 },

    /// Checksum mismatch detected during read.
    #[snafu(display("Corrupted item at index {index}"))]
    CorruptedItem { index: u64 },

    /// Rejected configuration value.
    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfig { message: String },

    /// Operation on a queue that was already closed.
    #[snafu(display("Queue is closed"))]
    QueueClosed,

    /// Waiter was cancelled because its queue closed.
    #[snafu(display("Waiter was cancelled"))]
    Cancelled,

    /// Waiter was resolved with the error of the operation it waited on.
    #[snafu(display("Waiter resolved with an error"))]
    WaiterFailed { source: Arc<QueueError> },

    /// Internal invariant or thread management failure.
    #[snafu(display("Internal error: {message}"))]
    Internal { message: String },
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
