// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Measurement queue: a bounded FIFO shared by every probe adapter of one
//! analyzer and drained by any number of consumers.
//!
//! Each sample is handed to exactly one consumer. Samples pushed by one
//! producer keep their order; there is no ordering across producers beyond
//! the order in which they took the lock.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Deserialize;

use crate::Pid;

/// Duration between two consecutive frame completions of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSample {
    pub pid: Pid,
    pub frame_time_ns: u64,
}

/// What happens to a push when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the incoming sample.
    #[default]
    DropNewest,
    /// Evict the oldest queued sample to make room.
    DropOldest,
    /// Wait up to `block_timeout` for room, then discard the incoming sample.
    Block,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    pub block_timeout: Duration,
}

/// Fate of the sample handed to [`MeasurementQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued. Under `DropOldest` an older sample may have been evicted.
    Accepted,
    /// Discarded by the overflow policy.
    Dropped,
    /// The queue was closed; nothing will ever be delivered.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    Timeout,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

struct Inner {
    samples: VecDeque<FrameSample>,
    closed: bool,
    dropped: u64,
}

pub struct MeasurementQueue {
    inner: Mutex<Inner>,
    // Signalled when a sample is pushed or the queue closes.
    available: Condvar,
    // Signalled when a sample is popped or the queue closes.
    space: Condvar,
    options: QueueOptions,
}

impl MeasurementQueue {
    pub fn new(options: QueueOptions) -> Self {
        let options = QueueOptions {
            capacity: options.capacity.max(1),
            ..options
        };
        Self {
            inner: Mutex::new(Inner {
                samples: VecDeque::with_capacity(options.capacity.min(1024)),
                closed: false,
                dropped: 0,
            }),
            available: Condvar::new(),
            space: Condvar::new(),
            options,
        }
    }

    pub fn push(&self, sample: FrameSample) -> PushOutcome {
        let mut inner = self.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }

        if inner.samples.len() >= self.options.capacity {
            match self.options.overflow {
                OverflowPolicy::DropNewest => {
                    count_drop(&mut inner, sample);
                    return PushOutcome::Dropped;
                }
                OverflowPolicy::DropOldest => {
                    if let Some(evicted) = inner.samples.pop_front() {
                        count_drop(&mut inner, evicted);
                    }
                }
                OverflowPolicy::Block => {
                    let deadline = Instant::now() + self.options.block_timeout;
                    while inner.samples.len() >= self.options.capacity && !inner.closed {
                        let now = Instant::now();
                        if now >= deadline {
                            count_drop(&mut inner, sample);
                            return PushOutcome::Dropped;
                        }
                        let (guard, _) = self
                            .space
                            .wait_timeout(inner, deadline - now)
                            .unwrap_or_else(|e| e.into_inner());
                        inner = guard;
                    }
                    if inner.closed {
                        return PushOutcome::Closed;
                    }
                }
            }
        }

        inner.samples.push_back(sample);
        drop(inner);
        self.available.notify_one();
        PushOutcome::Accepted
    }

    /// Pop the next sample, waiting up to `timeout` (`None` waits forever).
    pub fn recv(&self, timeout: Option<Duration>) -> Result<FrameSample, RecvError> {
        // A deadline too far away to represent is the same as no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        let mut inner = self.lock();
        loop {
            if let Some(sample) = inner.samples.pop_front() {
                drop(inner);
                self.space.notify_one();
                return Ok(sample);
            }
            if inner.closed {
                return Err(RecvError::Closed);
            }

            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RecvError::Timeout);
                    }
                    self.available
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self
                    .available
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner()),
            };
        }
    }

    pub fn try_recv(&self) -> Result<FrameSample, TryRecvError> {
        let mut inner = self.lock();
        match inner.samples.pop_front() {
            Some(sample) => {
                drop(inner);
                self.space.notify_one();
                Ok(sample)
            }
            None if inner.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Close the queue, discard pending samples and wake every waiter.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let discarded = inner.samples.len();
        inner.samples.clear();
        drop(inner);

        if discarded > 0 {
            debug!("measurement queue closed, discarded {discarded} pending sample(s)");
        }
        self.available.notify_all();
        self.space.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.options.capacity
    }

    /// Number of samples discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves `Inner` consistent, so a panic in
        // another holder does not invalidate it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn count_drop(inner: &mut Inner, sample: FrameSample) {
    inner.dropped += 1;
    if inner.dropped.is_power_of_two() {
        warn!(
            "measurement queue full, {} sample(s) dropped so far (latest from pid {})",
            inner.dropped, sample.pid
        );
    } else {
        debug!("[pid {}] dropped sample {}ns", sample.pid, sample.frame_time_ns);
    }
}
