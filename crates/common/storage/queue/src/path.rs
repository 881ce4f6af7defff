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

//! On-disk layout of a queue directory.
//!
//! ```text
//! <base>/<name>/
//! ├── front_index/page-0.dat    front index counter (8 bytes)
//! ├── meta_data/page-0.dat      array head and tail (16 bytes)
//! ├── index/page-<n>.dat        index items, 32 bytes each
//! └── data/page-<n>.dat         packed payloads
//! ```

use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::{Result, error::IoSnafu};

/// Directory holding the queue's front index page.
pub const FRONT_INDEX_DIR: &str = "front_index";
/// Directory holding the backing array's head/tail page.
pub const META_DATA_DIR: &str = "meta_data";
/// Directory holding the backing array's index pages.
pub const INDEX_DIR: &str = "index";
/// Directory holding the backing array's payload pages.
pub const DATA_DIR: &str = "data";

const PAGE_FILE_PREFIX: &str = "page-";
const PAGE_FILE_SUFFIX: &str = ".dat";

/// Returns the queue directory: `base/name`.
pub fn queue_dir<P: AsRef<Path>>(base: P, name: &str) -> PathBuf { base.as_ref().join(name) }

/// Generates a page file name: `page-<index>.dat`.
pub fn page_file_name(index: u64) -> String {
    format!("{PAGE_FILE_PREFIX}{index}{PAGE_FILE_SUFFIX}")
}

/// Returns full path to a page file: `dir/page-<index>.dat`.
pub fn page_file_path<P: AsRef<Path>>(dir: P, index: u64) -> PathBuf {
    dir.as_ref().join(page_file_name(index))
}

/// Extracts the page index from a page file name.
pub fn parse_page_index(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(PAGE_FILE_PREFIX)?
        .strip_suffix(PAGE_FILE_SUFFIX)?
        .parse()
        .ok()
}

/// Scans a page directory for page files, sorted by page index.
pub fn scan_page_files<P: AsRef<Path>>(dir: P) -> Result<Vec<(u64, PathBuf)>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut pages = Vec::new();
    for entry in std::fs::read_dir(dir).context(IoSnafu { path: dir })? {
        let path = entry.context(IoSnafu { path: dir })?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(index) = parse_page_index(&path) {
            pages.push((index, path));
        }
    }

    pages.sort_unstable_by_key(|(index, _)| *index);
    Ok(pages)
}
