// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Probe adapter: one observation thread per attached pid, turning frame
//! completion timestamps into frame-time samples.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::Pid;
use crate::errors::ProbeError;
use crate::probe::{FrameSource, ProbeEvent};
use crate::queue::{FrameSample, MeasurementQueue, PushOutcome};

/// Last-timestamp bookkeeping of one frame stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameClock {
    last: Option<u64>,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next completion timestamp. Returns the elapsed time since
    /// the previous frame, or `None` for the first frame and for duplicate
    /// or out-of-order timestamps, which leave the clock untouched.
    pub fn observe(&mut self, ts: u64) -> Option<u64> {
        match self.last {
            None => {
                self.last = Some(ts);
                None
            }
            Some(last) if ts > last => {
                self.last = Some(ts);
                Some(ts - last)
            }
            Some(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterOptions {
    /// Upper bound on how long the thread waits on its source before
    /// re-checking the stop flag.
    pub poll_interval: Duration,
}

/// How an adapter thread went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The thread exited within the grace period.
    Clean,
    /// The grace period expired; the thread was left to exit on its own.
    Forced,
}

pub struct ProbeAdapter {
    pid: Pid,
    stop: Arc<AtomicBool>,
    // Disconnected once the thread has released its source.
    exited: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl ProbeAdapter {
    /// Start observing `source`. `on_end` runs on the adapter thread when the
    /// stream ends on its own (process exit, closed subscription or source
    /// error), never after [`ProbeAdapter::stop`].
    pub fn spawn<F>(
        pid: Pid,
        source: Box<dyn FrameSource>,
        queue: Arc<MeasurementQueue>,
        options: AdapterOptions,
        on_end: F,
    ) -> Result<Self, ProbeError>
    where
        F: FnOnce() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited) = mpsc::channel::<()>();

        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("frame-probe-{pid}"))
            .spawn(move || {
                let _exited = exited_tx;
                let ended = observe(pid, source, &queue, options, &thread_stop);
                if ended && !thread_stop.load(Ordering::Acquire) {
                    on_end();
                }
            })?;

        Ok(Self {
            pid,
            stop,
            exited,
            handle: Some(handle),
        })
    }

    /// Raise the stop flag without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Ask the thread to stop and wait up to `grace` for it to let go of its
    /// source.
    pub fn stop(mut self, grace: Duration) -> Teardown {
        self.request_stop();

        match self.exited.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take()
                    && handle.join().is_err()
                {
                    warn!("[pid {}] adapter thread panicked", self.pid);
                }
                Teardown::Clean
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "[pid {}] adapter did not exit within {}ms, giving up",
                    self.pid,
                    grace.as_millis()
                );
                // Dropping the handle detaches the thread; the stop flag
                // stays raised so it exits at its next wake-up.
                self.handle.take();
                Teardown::Forced
            }
        }
    }
}

impl Drop for ProbeAdapter {
    fn drop(&mut self) {
        // Never join here: the last owner may be the adapter thread itself.
        self.request_stop();
    }
}

/// Pump `source` into `queue` until stopped or the stream ends. Returns true
/// when the stream ended on its own.
fn observe(
    pid: Pid,
    mut source: Box<dyn FrameSource>,
    queue: &MeasurementQueue,
    options: AdapterOptions,
    stop: &AtomicBool,
) -> bool {
    let mut clock = FrameClock::new();

    let ended = loop {
        if stop.load(Ordering::Acquire) {
            break false;
        }
        match source.next_event(options.poll_interval) {
            Ok(ProbeEvent::Frame(ts)) => {
                let Some(frame_time_ns) = clock.observe(ts) else {
                    debug!("[pid {pid}] no sample for timestamp {ts}");
                    continue;
                };
                if stop.load(Ordering::Acquire) {
                    break false;
                }
                if queue.push(FrameSample { pid, frame_time_ns }) == PushOutcome::Closed {
                    break false;
                }
            }
            Ok(ProbeEvent::Idle) => {}
            Ok(ProbeEvent::Ended) => {
                info!("[pid {pid}] frame stream ended");
                break true;
            }
            Err(e) => {
                warn!("[pid {pid}] probe error, ending stream: {e}");
                break true;
            }
        }
    };

    drop(source);
    ended
}
