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

use std::{path::PathBuf, time::Duration};

use crate::{BigQueue, QueueConfig, Result};

pub struct QueueBuilder {
    config: QueueConfig,
}

impl QueueBuilder {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(base_path: P, name: S) -> Self {
        Self {
            config: QueueConfig {
                base_path: base_path.into(),
                name: name.into(),
                ..Default::default()
            },
        }
    }

    #[must_use]
    pub fn data_page_size(mut self, size: u64) -> Self {
        self.config.data_page_size = size;
        self
    }

    #[must_use]
    pub fn page_ttl(mut self, ttl: Duration) -> Self {
        self.config.page_ttl = ttl;
        self
    }

    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig { &self.config }

    /// Validate the configuration and open the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConfig`](crate::QueueError::InvalidConfig)
    /// for a rejected configuration, or the error from opening the queue
    /// files.
    pub fn build(self) -> Result<BigQueue> { BigQueue::open(self.config) }
}

impl From<QueueConfig> for QueueBuilder {
    fn from(config: QueueConfig) -> Self { Self { config } }
}
