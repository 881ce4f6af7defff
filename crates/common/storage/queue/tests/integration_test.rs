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
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use bigqueue::{
    BackingArray, BigArray, BigQueue, CachePolicy, QueueBuilder, QueueError,
    config::MINIMUM_DATA_PAGE_SIZE,
};
use bytes::Bytes;
use futures::executor::block_on;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Queue over a `BigArray` with tiny data pages, so tests roll and reclaim
/// many pages quickly.
fn small_page_queue(dir: &Path, data_page_size: u64, policy: CachePolicy) -> BigQueue {
    let array = BigArray::open(dir, data_page_size, policy).unwrap();
    BigQueue::with_array(dir, array).unwrap()
}

fn enqueue_all(queue: &BigQueue, payloads: &[&str]) {
    for payload in payloads {
        queue.enqueue(payload).unwrap();
    }
}

#[test]
fn test_queue_basic_scenario() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let queue = QueueBuilder::new(temp_dir.path(), "basic")
        .data_page_size(MINIMUM_DATA_PAGE_SIZE)
        .build()
        .unwrap();

    enqueue_all(&queue, &["a", "b", "c"]);
    assert_eq!(queue.size().unwrap(), 3);
    assert_eq!(queue.dequeue().unwrap().unwrap(), Bytes::from("a"));
    assert_eq!(queue.peek().unwrap().unwrap(), Bytes::from("b"));
    assert_eq!(queue.peek_at_offset(1).unwrap().unwrap(), Bytes::from("c"));

    queue.remove_n(1).unwrap();
    assert_eq!(queue.size().unwrap(), 1);
    assert_eq!(queue.dequeue().unwrap().unwrap(), Bytes::from("c"));
    assert!(queue.is_empty().unwrap());

    queue.close().unwrap();
}

#[test]
fn test_remove_n_clamps_to_head() {
    let temp_dir = TempDir::new().unwrap();
    let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);

    enqueue_all(&queue, &["a", "b", "c"]);
    queue.dequeue().unwrap();

    queue.remove_n(2).unwrap();
    assert_eq!(queue.size().unwrap(), 0);
    assert!(queue.dequeue().unwrap().is_none());

    queue.remove_n(5).unwrap();
    assert_eq!(queue.front_index().unwrap(), queue.head_index().unwrap());

    queue.remove_n(-3).unwrap();
    assert_eq!(queue.front_index().unwrap(), 3);
}

#[test]
fn test_dequeue_async_waits_for_enqueue() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let queue = Arc::new(small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned));

    let waiter = queue.dequeue_async().unwrap();
    assert!(!waiter.is_done());
    assert!(waiter.wait_timeout(Duration::from_millis(20)).is_none());

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            queue.enqueue("x").unwrap();
        })
    };

    assert_eq!(block_on(waiter).unwrap(), Bytes::from("x"));
    producer.join().unwrap();
    assert_eq!(queue.size().unwrap(), 0);
}

#[test]
fn test_peek_async_sees_item_without_consuming() {
    let temp_dir = TempDir::new().unwrap();
    let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);

    let waiter = queue.peek_async().unwrap();
    queue.enqueue("peeked").unwrap();

    assert_eq!(waiter.wait().unwrap(), Bytes::from("peeked"));
    assert_eq!(queue.dequeue().unwrap().unwrap(), Bytes::from("peeked"));
}

#[test]
fn test_close_cancels_pending_waiter() {
    let temp_dir = TempDir::new().unwrap();
    let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);

    let waiter = queue.dequeue_async().unwrap();
    queue.close().unwrap();

    assert!(matches!(block_on(waiter), Err(QueueError::Cancelled)));
}

#[test]
fn test_concurrent_producers_and_consumers() {
    init_tracing();
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: usize = 500;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let temp_dir = TempDir::new().unwrap();
    let queue = Arc::new(small_page_queue(
        temp_dir.path(),
        16 * 1024,
        CachePolicy::Evict {
            ttl:            Duration::from_millis(5),
            sweep_interval: Duration::from_millis(2),
        },
    ));
    let consumed = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let queue = queue.clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.enqueue(format!("{producer}:{seq}")).unwrap();
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = queue.clone();
            let consumed = consumed.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while consumed.load(Ordering::Acquire) < TOTAL {
                    match queue.dequeue().unwrap() {
                        Some(payload) => {
                            consumed.fetch_add(1, Ordering::AcqRel);
                            seen.push(String::from_utf8(payload.to_vec()).unwrap());
                        }
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        })
        .collect();

    for handle in producers {
        handle.join().unwrap();
    }

    let mut all = HashSet::new();
    for handle in consumers {
        let mut last_seq: HashMap<usize, usize> = HashMap::new();
        for item in handle.join().unwrap() {
            let (producer, seq) = item.split_once(':').unwrap();
            let (producer, seq): (usize, usize) = (producer.parse().unwrap(), seq.parse().unwrap());
            if let Some(previous) = last_seq.insert(producer, seq) {
                assert!(previous < seq, "producer {producer} reordered");
            }
            assert!(all.insert(item), "duplicate delivery");
        }
    }

    assert_eq!(all.len(), TOTAL);
    assert!(queue.is_empty().unwrap());
}

#[test]
fn test_queue_recovery() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().to_path_buf();

    {
        let queue = QueueBuilder::new(&path, "durable")
            .data_page_size(MINIMUM_DATA_PAGE_SIZE)
            .build()
            .unwrap();
        for i in 0..10 {
            queue.enqueue(format!("msg-{i}")).unwrap();
        }
        for _ in 0..3 {
            queue.dequeue().unwrap();
        }
        queue.flush().unwrap();
        queue.close().unwrap();
    }

    {
        let queue = QueueBuilder::new(&path, "durable")
            .data_page_size(MINIMUM_DATA_PAGE_SIZE)
            .build()
            .unwrap();
        assert_eq!(queue.size().unwrap(), 7);
        assert_eq!(queue.front_index().unwrap(), 3);
        assert_eq!(queue.dequeue().unwrap().unwrap(), Bytes::from("msg-3"));

        queue.enqueue("msg-10").unwrap();
        assert_eq!(queue.head_index().unwrap(), 11);
    }

    // The second handle was dropped without an explicit close.
    let queue = QueueBuilder::new(&path, "durable")
        .data_page_size(MINIMUM_DATA_PAGE_SIZE)
        .build()
        .unwrap();
    let mut remaining = Vec::new();
    queue.apply_for_each(|item| remaining.push(item)).unwrap();
    assert_eq!(remaining.len(), 7);
    assert_eq!(remaining.first().unwrap(), &Bytes::from("msg-4"));
    assert_eq!(remaining.last().unwrap(), &Bytes::from("msg-10"));
}

#[test]
fn test_recovery_continues_after_rolled_pages() {
    let temp_dir = TempDir::new().unwrap();
    let payload = vec![7u8; 1000];

    {
        let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);
        for _ in 0..10 {
            queue.enqueue(&payload).unwrap();
        }
    }

    let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);
    queue.enqueue(b"tail").unwrap();
    assert_eq!(queue.size().unwrap(), 11);
    assert_eq!(queue.peek_at_offset(10).unwrap().unwrap(), Bytes::from("tail"));
    for _ in 0..10 {
        assert_eq!(queue.dequeue().unwrap().unwrap(), Bytes::from(payload.clone()));
    }
}

#[test]
fn test_gc_bounds_disk_usage() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);
    let payload = vec![1u8; 1000];

    let mut usage_after_gc = Vec::new();
    for _round in 0..3 {
        for _ in 0..400 {
            queue.enqueue(&payload).unwrap();
        }
        assert!(queue.array().data_page_indexes().unwrap().len() >= 100);

        while queue.dequeue().unwrap().is_some() {}
        queue.gc().unwrap();

        assert!(queue.array().data_page_indexes().unwrap().len() <= 2);
        usage_after_gc.push(queue.array().disk_usage().unwrap());
    }

    assert!(usage_after_gc.windows(2).all(|w| w[0] == w[1]));
    assert!(queue.is_empty().unwrap());
}

#[test]
fn test_gc_keeps_unconsumed_items() {
    let temp_dir = TempDir::new().unwrap();
    let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);

    for i in 0..40 {
        queue.enqueue(format!("{i:0>1000}")).unwrap();
    }
    for _ in 0..20 {
        queue.dequeue().unwrap();
    }
    queue.gc().unwrap();

    assert_eq!(queue.size().unwrap(), 20);
    assert_eq!(queue.array().tail_index(), 19);
    for i in 20..40 {
        assert_eq!(
            queue.dequeue().unwrap().unwrap(),
            Bytes::from(format!("{i:0>1000}"))
        );
    }
}

#[test]
fn test_peek_at_offset_matches_dequeue_order() {
    let temp_dir = TempDir::new().unwrap();
    let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);

    for i in 0..50 {
        queue.enqueue(format!("item-{i}")).unwrap();
    }
    let size = i64::try_from(queue.size().unwrap()).unwrap();

    let peeked: Vec<_> = (0..size)
        .map(|k| queue.peek_at_offset(k).unwrap().unwrap())
        .collect();
    assert!(queue.peek_at_offset(size).unwrap().is_none());
    assert!(queue.peek_at_offset(-1).unwrap().is_none());

    let dequeued: Vec<_> = std::iter::from_fn(|| queue.dequeue().unwrap()).collect();
    assert_eq!(peeked, dequeued);
}

#[test]
fn test_remove_all_then_reuse() {
    let temp_dir = TempDir::new().unwrap();
    let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);

    for i in 0..20 {
        queue.enqueue(format!("{i:0>500}")).unwrap();
    }
    queue.dequeue().unwrap();
    queue.remove_all().unwrap();

    assert!(queue.is_empty().unwrap());
    assert_eq!(queue.front_index().unwrap(), 0);
    assert_eq!(queue.head_index().unwrap(), 0);
    assert!(queue.array().data_page_indexes().unwrap().is_empty());

    queue.enqueue("fresh").unwrap();
    assert_eq!(queue.dequeue().unwrap().unwrap(), Bytes::from("fresh"));
}

#[test]
fn test_operations_after_close() {
    let temp_dir = TempDir::new().unwrap();
    let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);
    queue.enqueue("kept").unwrap();

    queue.close().unwrap();
    queue.close().unwrap();

    assert!(matches!(queue.enqueue("x"), Err(QueueError::QueueClosed)));
    assert!(matches!(queue.dequeue(), Err(QueueError::QueueClosed)));
    assert!(matches!(queue.peek(), Err(QueueError::QueueClosed)));
    assert!(matches!(queue.peek_at_offset(0), Err(QueueError::QueueClosed)));
    assert!(matches!(queue.remove_n(1), Err(QueueError::QueueClosed)));
    assert!(matches!(queue.remove_all(), Err(QueueError::QueueClosed)));
    assert!(matches!(queue.gc(), Err(QueueError::QueueClosed)));
    assert!(matches!(queue.flush(), Err(QueueError::QueueClosed)));
    assert!(matches!(queue.size(), Err(QueueError::QueueClosed)));
    assert!(matches!(queue.peek_async(), Err(QueueError::QueueClosed)));
    drop(queue);

    let reopened = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);
    assert_eq!(reopened.dequeue().unwrap().unwrap(), Bytes::from("kept"));
}

#[test]
fn test_front_repaired_when_outside_window() {
    let temp_dir = TempDir::new().unwrap();
    {
        let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);
        enqueue_all(&queue, &["a", "b", "c"]);
        queue.remove_n(3).unwrap();
    }

    // Rebuild the array from scratch while keeping the stale front page.
    std::fs::remove_dir_all(temp_dir.path().join("index")).unwrap();
    std::fs::remove_dir_all(temp_dir.path().join("data")).unwrap();
    std::fs::remove_dir_all(temp_dir.path().join("meta_data")).unwrap();

    let queue = small_page_queue(temp_dir.path(), 4096, CachePolicy::Pinned);
    assert_eq!(queue.front_index().unwrap(), 0);
    queue.enqueue("after-repair").unwrap();
    assert_eq!(queue.dequeue().unwrap().unwrap(), Bytes::from("after-repair"));
}
