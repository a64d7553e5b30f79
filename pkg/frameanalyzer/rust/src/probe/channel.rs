// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! In-process probe transport, for instrumentation hooks that live in the
//! same address space as the analyzer.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{FrameSource, ProbeConnector, ProbeEvent};
use crate::Pid;
use crate::errors::ProbeError;

struct Slot {
    token: u64,
    // Present while an adapter is connected.
    tx: Option<Sender<u64>>,
}

#[derive(Default)]
struct Feeds {
    slots: HashMap<Pid, Slot>,
    next_token: u64,
}

#[derive(Clone, Default)]
pub struct ChannelProbe {
    feeds: Arc<Mutex<Feeds>>,
}

impl ChannelProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `pid` attachable. Registering a pid again supersedes the earlier
    /// feed, whose stream then ends.
    pub fn register(&self, pid: Pid) -> FrameFeed {
        let mut feeds = lock(&self.feeds);
        feeds.next_token += 1;
        let token = feeds.next_token;
        feeds.slots.insert(pid, Slot { token, tx: None });
        FrameFeed {
            pid,
            token,
            feeds: Arc::clone(&self.feeds),
        }
    }

    pub fn is_registered(&self, pid: Pid) -> bool {
        lock(&self.feeds).slots.contains_key(&pid)
    }
}

impl ProbeConnector for ChannelProbe {
    fn connect(&self, pid: Pid) -> Result<Box<dyn FrameSource>, ProbeError> {
        let mut feeds = lock(&self.feeds);
        let slot = feeds
            .slots
            .get_mut(&pid)
            .ok_or_else(|| ProbeError::Unavailable {
                pid,
                reason: "no instrumentation registered".to_string(),
            })?;

        let (tx, rx) = mpsc::channel();
        slot.tx = Some(tx);
        Ok(Box::new(ChannelSource { rx }))
    }
}

/// Producer side of one registered pid. Dropping it ends the stream.
pub struct FrameFeed {
    pid: Pid,
    token: u64,
    feeds: Arc<Mutex<Feeds>>,
}

impl FrameFeed {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Report a frame completed at `timestamp_ns`. Returns false when no
    /// adapter is attached to this pid.
    pub fn emit(&self, timestamp_ns: u64) -> bool {
        let mut feeds = lock(&self.feeds);
        let Some(slot) = feeds.slots.get_mut(&self.pid) else {
            return false;
        };
        if slot.token != self.token {
            return false;
        }
        match &slot.tx {
            Some(tx) if tx.send(timestamp_ns).is_ok() => true,
            Some(_) => {
                // The adapter went away.
                slot.tx = None;
                false
            }
            None => false,
        }
    }

    /// End the stream, as if the process exited.
    pub fn close(self) {}
}

impl Drop for FrameFeed {
    fn drop(&mut self) {
        let mut feeds = lock(&self.feeds);
        if feeds
            .slots
            .get(&self.pid)
            .is_some_and(|slot| slot.token == self.token)
        {
            feeds.slots.remove(&self.pid);
        }
    }
}

struct ChannelSource {
    rx: Receiver<u64>,
}

impl FrameSource for ChannelSource {
    fn next_event(&mut self, wait: Duration) -> Result<ProbeEvent, ProbeError> {
        match self.rx.recv_timeout(wait) {
            Ok(ts) => Ok(ProbeEvent::Frame(ts)),
            Err(RecvTimeoutError::Timeout) => Ok(ProbeEvent::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(ProbeEvent::Ended),
        }
    }
}

fn lock(feeds: &Mutex<Feeds>) -> MutexGuard<'_, Feeds> {
    feeds.lock().unwrap_or_else(|e| e.into_inner())
}
