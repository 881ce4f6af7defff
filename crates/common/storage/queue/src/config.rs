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

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::{Result, error::InvalidConfigSnafu, factory::CachePolicy, path::queue_dir};

/// Default size of a data page: 128 MiB.
pub const DEFAULT_DATA_PAGE_SIZE: u64 = 128 * 1024 * 1024;

/// Smallest data page a queue may be configured with: 32 MiB.
pub const MINIMUM_DATA_PAGE_SIZE: u64 = 32 * 1024 * 1024;

/// How long an unreferenced page stays mapped after its last use.
pub const DEFAULT_PAGE_TTL: Duration = Duration::from_secs(10);

/// How often the background sweeper looks for idle pages.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Options for opening a [`BigQueue`](crate::BigQueue).
///
/// Every field has a default, so a partial section of an application config
/// file deserializes into a usable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory that holds one sub-directory per named queue.
    #[default(_code = "PathBuf::from(\"./queue_data\")")]
    pub base_path: PathBuf,

    /// Queue name; also the name of the queue's sub-directory.
    #[default = "default"]
    pub name: String,

    /// Size of each data page of the backing array.
    #[default(DEFAULT_DATA_PAGE_SIZE)]
    pub data_page_size: u64,

    /// Idle time after which an unreferenced index or data page is unmapped.
    #[default(DEFAULT_PAGE_TTL)]
    pub page_ttl: Duration,

    /// Period of the page sweeper.
    #[default(DEFAULT_SWEEP_INTERVAL)]
    pub sweep_interval: Duration,
}

impl QueueConfig {
    /// Directory holding this queue's files: `<base_path>/<name>`.
    #[must_use]
    pub fn queue_dir(&self) -> PathBuf { queue_dir(&self.base_path, &self.name) }

    /// Cache policy for the backing array's index and data pages.
    #[must_use]
    pub const fn cache_policy(&self) -> CachePolicy {
        CachePolicy::Evict {
            ttl:            self.page_ttl,
            sweep_interval: self.sweep_interval,
        }
    }

    /// Reject values a queue cannot be opened with.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConfig`](crate::QueueError::InvalidConfig)
    /// when the name is empty or contains a path separator, the data page
    /// size is below [`MINIMUM_DATA_PAGE_SIZE`] or above `u32::MAX`, or the
    /// sweep interval is zero.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.name.is_empty() && Path::new(&self.name).components().count() == 1,
            InvalidConfigSnafu {
                message: format!("queue name {:?} must be a single path component", self.name),
            }
        );
        ensure!(
            self.data_page_size >= MINIMUM_DATA_PAGE_SIZE,
            InvalidConfigSnafu {
                message: format!(
                    "data page size {} is below the minimum of {MINIMUM_DATA_PAGE_SIZE}",
                    self.data_page_size
                ),
            }
        );
        ensure!(
            self.data_page_size <= u64::from(u32::MAX),
            InvalidConfigSnafu {
                message: format!(
                    "data page size {} does not fit a 32-bit item offset",
                    self.data_page_size
                ),
            }
        );
        ensure!(
            !self.sweep_interval.is_zero(),
            InvalidConfigSnafu {
                message: "sweep interval must be nonzero".to_string(),
            }
        );
        Ok(())
    }
}
