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

//! Single-assignment result slots for "notify me when data arrives".
//!
//! A [`Waiter`] is handed out by
//! [`BigQueue::dequeue_async`](crate::BigQueue::dequeue_async) and
//! [`BigQueue::peek_async`](crate::BigQueue::peek_async). The slot behind it
//! moves from pending to exactly one of resolved, failed or cancelled, and
//! never changes after that. Callers may block on it ([`Waiter::wait`]) or
//! `.await` it from any executor.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::{QueueError, Result};

enum SlotState {
    Pending(Vec<Waker>),
    Resolved(Bytes),
    Failed(Arc<QueueError>),
    Cancelled,
}

impl SlotState {
    fn outcome(&self) -> Option<Result<Bytes>> {
        match self {
            Self::Pending(_) => None,
            Self::Resolved(payload) => Some(Ok(payload.clone())),
            Self::Failed(source) => Some(Err(QueueError::WaiterFailed {
                source: source.clone(),
            })),
            Self::Cancelled => Some(Err(QueueError::Cancelled)),
        }
    }
}

/// Shared state between the queue and every [`Waiter`] handed out for it.
pub(crate) struct WaiterSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl WaiterSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Pending(Vec::new())),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn is_done(&self) -> bool {
        !matches!(*self.state.lock(), SlotState::Pending(_))
    }

    pub(crate) fn resolve(&self, payload: Bytes) -> bool {
        self.finish(SlotState::Resolved(payload))
    }

    pub(crate) fn fail(&self, error: QueueError) -> bool {
        self.finish(SlotState::Failed(Arc::new(error)))
    }

    pub(crate) fn cancel(&self) -> bool { self.finish(SlotState::Cancelled) }

    /// Move a pending slot to `next`. Returns `false` if it was already done.
    fn finish(&self, next: SlotState) -> bool {
        let wakers = {
            let mut state = self.state.lock();
            let SlotState::Pending(wakers) = &mut *state else {
                return false;
            };
            let wakers = std::mem::take(wakers);
            *state = next;
            wakers
        };

        self.ready.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

/// Handle to the eventual result of an asynchronous dequeue or peek.
///
/// Clones observe the same slot. Cancellation by
/// [`BigQueue::close`](crate::BigQueue::close) yields
/// [`QueueError::Cancelled`].
#[derive(Clone)]
pub struct Waiter {
    slot: Arc<WaiterSlot>,
}

impl Waiter {
    pub(crate) const fn new(slot: Arc<WaiterSlot>) -> Self { Self { slot } }

    /// Whether the result is available.
    pub fn is_done(&self) -> bool { self.slot.is_done() }

    /// The result if available, without blocking.
    pub fn try_result(&self) -> Option<Result<Bytes>> { self.slot.state.lock().outcome() }

    /// Block the current thread until the result is available.
    pub fn wait(&self) -> Result<Bytes> {
        let mut state = self.slot.state.lock();
        loop {
            if let Some(outcome) = state.outcome() {
                return outcome;
            }
            self.slot.ready.wait(&mut state);
        }
    }

    /// Block for at most `timeout`. Returns `None` if the slot is still
    /// pending when it expires.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Bytes>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        loop {
            if let Some(outcome) = state.outcome() {
                return Some(outcome);
            }
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                return state.outcome();
            }
        }
    }
}

impl Future for Waiter {
    type Output = Result<Bytes>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.state.lock();
        match &mut *state {
            SlotState::Pending(wakers) => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            done => Poll::Ready(done.outcome().unwrap_or(Err(QueueError::Cancelled))),
        }
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("done", &self.is_done())
            .finish()
    }
}
