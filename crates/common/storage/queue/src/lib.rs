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

//! Persistent FIFO queue over memory-mapped page files.
//!
//! Items are appended to a paged, append-only [`BigArray`]; a [`BigQueue`]
//! tracks the consumption point in a separate persisted front index. Both
//! survive process restarts, and consumed storage is reclaimed by
//! [`BigQueue::gc`].

pub mod array;
pub mod builder;
pub mod config;
mod crc;
pub mod error;
pub mod factory;
pub mod page;
pub mod path;
pub mod queue;
pub mod waiter;

pub use array::{BackingArray, BigArray};
pub use builder::QueueBuilder;
pub use config::QueueConfig;
pub use error::{QueueError, Result};
pub use factory::{CachePolicy, PageFactory, PageGuard};
pub use page::MappedPage;
pub use queue::BigQueue;
pub use waiter::Waiter;
