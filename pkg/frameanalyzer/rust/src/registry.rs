// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Process registry: which pids an analyzer is monitoring and the adapter
//! serving each of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::Pid;
use crate::adapter::{AdapterOptions, ProbeAdapter, Teardown};
use crate::errors::AnalyzerError;
use crate::probe::ProbeConnector;
use crate::queue::MeasurementQueue;
use crate::state::AttachmentState;

struct Attachment {
    state: AttachmentState,
    // Distinguishes successive attachments of the same pid.
    generation: u64,
    // Taken by the detaching caller.
    adapter: Option<ProbeAdapter>,
}

#[derive(Default)]
struct Entries {
    attachments: HashMap<Pid, Attachment>,
    next_generation: u64,
}

impl Entries {
    /// Forget `pid` if its entry still belongs to `generation`.
    fn remove_current(&mut self, pid: Pid, generation: u64) -> bool {
        let current = self
            .attachments
            .get(&pid)
            .is_some_and(|a| a.generation == generation);
        if current {
            self.attachments.remove(&pid);
        }
        current
    }
}

#[derive(Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<Entries>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to the probe of `pid` and start feeding `queue`.
    ///
    /// The pid is reserved as `Connecting` before the connection is opened
    /// and the lock is released while connecting, so a concurrent attach of
    /// the same pid fails with `AlreadyAttached` and other pids stay
    /// reachable.
    pub fn attach(
        &self,
        pid: Pid,
        connector: &dyn ProbeConnector,
        queue: &Arc<MeasurementQueue>,
        options: AdapterOptions,
    ) -> Result<(), AnalyzerError> {
        let generation = self.reserve(pid)?;

        let source = match connector.connect(pid) {
            Ok(source) => source,
            Err(e) => {
                self.lock().remove_current(pid, generation);
                return Err(AnalyzerError::probe(pid, &e));
            }
        };

        // Spawned under the lock so that an immediate end of stream finds
        // the pid attached.
        let mut entries = self.lock();
        let registry = Arc::downgrade(&self.entries);
        let adapter = match ProbeAdapter::spawn(pid, source, Arc::clone(queue), options, move || {
            release(&registry, pid, generation);
        }) {
            Ok(adapter) => adapter,
            Err(e) => {
                entries.remove_current(pid, generation);
                return Err(AnalyzerError::InternalFailure(format!(
                    "cannot start adapter for pid {pid}: {e}"
                )));
            }
        };

        entries.attachments.insert(
            pid,
            Attachment {
                state: AttachmentState::Attached,
                generation,
                adapter: Some(adapter),
            },
        );
        info!("[pid {pid}] attached");
        Ok(())
    }

    /// Stop the adapter of `pid`, waiting up to `grace`, and forget the pid.
    ///
    /// A pid that is still connecting or already detaching is reported as
    /// not attached.
    pub fn detach(&self, pid: Pid, grace: Duration) -> Result<Teardown, AnalyzerError> {
        let (generation, adapter) = self.begin_detach(pid)?;
        let teardown = match adapter {
            Some(adapter) => adapter.stop(grace),
            None => Teardown::Clean,
        };
        self.finish_detach(pid, generation);
        Ok(teardown)
    }

    /// Detach every tracked pid. All adapters are signalled first, then
    /// awaited against one shared deadline.
    pub fn detach_all(&self, grace: Duration) -> Vec<(Pid, Teardown)> {
        let pending: Vec<(Pid, u64, Option<ProbeAdapter>)> = {
            let mut entries = self.lock();
            entries
                .attachments
                .iter_mut()
                .filter(|(_, a)| a.state.can_transition_to(AttachmentState::Detaching))
                .map(|(pid, a)| {
                    a.state = AttachmentState::Detaching;
                    if let Some(adapter) = &a.adapter {
                        adapter.request_stop();
                    }
                    (*pid, a.generation, a.adapter.take())
                })
                .collect()
        };

        let deadline = Instant::now() + grace;
        pending
            .into_iter()
            .map(|(pid, generation, adapter)| {
                let teardown = match adapter {
                    Some(adapter) => adapter.stop(deadline.saturating_duration_since(Instant::now())),
                    None => Teardown::Clean,
                };
                self.finish_detach(pid, generation);
                (pid, teardown)
            })
            .collect()
    }

    pub fn is_monitoring(&self, pid: Pid) -> bool {
        self.state(pid).is_some_and(AttachmentState::is_monitoring)
    }

    pub fn state(&self, pid: Pid) -> Option<AttachmentState> {
        self.lock().attachments.get(&pid).map(|a| a.state)
    }

    /// Sorted snapshot of the monitored pids.
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self
            .lock()
            .attachments
            .iter()
            .filter(|(_, a)| a.state.is_monitoring())
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Number of tracked pids, connecting and detaching ones included.
    pub fn len(&self) -> usize {
        self.lock().attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reserve(&self, pid: Pid) -> Result<u64, AnalyzerError> {
        let mut entries = self.lock();
        if let Some(existing) = entries.attachments.get(&pid) {
            debug!("[pid {pid}] attach refused, pid is {}", existing.state);
            return Err(AnalyzerError::AlreadyAttached(pid));
        }
        entries.next_generation += 1;
        let generation = entries.next_generation;
        entries.attachments.insert(
            pid,
            Attachment {
                state: AttachmentState::Connecting,
                generation,
                adapter: None,
            },
        );
        Ok(generation)
    }

    fn begin_detach(&self, pid: Pid) -> Result<(u64, Option<ProbeAdapter>), AnalyzerError> {
        let mut entries = self.lock();
        let attachment = entries
            .attachments
            .get_mut(&pid)
            .filter(|a| a.state.can_transition_to(AttachmentState::Detaching))
            .ok_or(AnalyzerError::NotAttached(pid))?;
        attachment.state = AttachmentState::Detaching;
        Ok((attachment.generation, attachment.adapter.take()))
    }

    fn finish_detach(&self, pid: Pid, generation: u64) {
        if self.lock().remove_current(pid, generation) {
            info!("[pid {pid}] detached");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        lock(&self.entries)
    }
}

/// End-of-stream hook of one attachment. Leaves newer attachments of the
/// same pid alone, and leaves detaching ones to their detacher.
fn release(entries: &Weak<Mutex<Entries>>, pid: Pid, generation: u64) {
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let mut entries = lock(&entries);
    if entries
        .attachments
        .get(&pid)
        .is_some_and(|a| a.generation == generation && a.state.is_monitoring())
    {
        entries.attachments.remove(&pid);
        info!("[pid {pid}] no longer monitored, stream ended");
    }
}

fn lock(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::errors::{ErrorCode, ProbeError};
    use crate::probe::{ChannelProbe, FrameSource, ProbeEvent};
    use crate::queue::{OverflowPolicy, QueueOptions};
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;

    const OPTIONS: AdapterOptions = AdapterOptions {
        poll_interval: Duration::from_millis(10),
    };
    const GRACE: Duration = Duration::from_secs(5);

    fn queue() -> Arc<MeasurementQueue> {
        Arc::new(MeasurementQueue::new(QueueOptions {
            capacity: 64,
            overflow: OverflowPolicy::DropNewest,
            block_timeout: Duration::from_millis(5),
        }))
    }

    /// Connector whose sources ignore the stop flag for a while. Each source
    /// reports its pid once it is inside `next_event`.
    struct SlowProbe {
        entered: Sender<Pid>,
    }

    struct SlowSource {
        pid: Pid,
        entered: Sender<Pid>,
    }

    impl FrameSource for SlowSource {
        fn next_event(&mut self, _wait: Duration) -> Result<ProbeEvent, ProbeError> {
            let _ = self.entered.send(self.pid);
            thread::sleep(Duration::from_secs(2));
            Ok(ProbeEvent::Idle)
        }
    }

    impl ProbeConnector for SlowProbe {
        fn connect(&self, pid: Pid) -> Result<Box<dyn FrameSource>, ProbeError> {
            Ok(Box::new(SlowSource {
                pid,
                entered: self.entered.clone(),
            }))
        }
    }

    fn slow_probe() -> (SlowProbe, Receiver<Pid>) {
        let (entered, rx) = mpsc::channel();
        (SlowProbe { entered }, rx)
    }

    /// Connector whose `connect` holds until the gate opens.
    struct GatedProbe {
        inner: ChannelProbe,
        connecting: Sender<Pid>,
        gate: Mutex<Receiver<()>>,
    }

    impl ProbeConnector for GatedProbe {
        fn connect(&self, pid: Pid) -> Result<Box<dyn FrameSource>, ProbeError> {
            let _ = self.connecting.send(pid);
            let _ = self.gate.lock().unwrap().recv();
            self.inner.connect(pid)
        }
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + GRACE;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_attach_detach_reattach() {
        let probe = ChannelProbe::new();
        let _feed = probe.register(1);
        let registry = ProcessRegistry::new();
        let q = queue();

        registry.attach(1, &probe, &q, OPTIONS).unwrap();
        assert!(registry.is_monitoring(1));
        assert_eq!(registry.pids(), vec![1]);

        assert_eq!(registry.detach(1, GRACE).unwrap(), Teardown::Clean);
        assert!(!registry.is_monitoring(1));
        assert!(registry.is_empty());

        registry.attach(1, &probe, &q, OPTIONS).unwrap();
        assert!(registry.is_monitoring(1));
    }

    #[test]
    fn test_double_attach_is_refused() {
        let probe = ChannelProbe::new();
        let _feed = probe.register(1);
        let registry = ProcessRegistry::new();
        let q = queue();

        registry.attach(1, &probe, &q, OPTIONS).unwrap();
        let err = registry.attach(1, &probe, &q, OPTIONS).unwrap_err();
        assert_eq!(err, AnalyzerError::AlreadyAttached(1));
        assert!(registry.is_monitoring(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_detach_unknown_pid() {
        let registry = ProcessRegistry::new();
        assert_eq!(
            registry.detach(5, GRACE).unwrap_err(),
            AnalyzerError::NotAttached(5)
        );
    }

    #[test]
    fn test_unreachable_probe() {
        let registry = ProcessRegistry::new();
        let err = registry
            .attach(5, &ChannelProbe::new(), &queue(), OPTIONS)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProbeUnavailable);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_end_of_stream_forgets_pid() {
        let probe = ChannelProbe::new();
        let feed = probe.register(1);
        let registry = ProcessRegistry::new();

        registry.attach(1, &probe, &queue(), OPTIONS).unwrap();
        feed.close();
        wait_until(|| !registry.is_monitoring(1));
        assert_eq!(
            registry.detach(1, GRACE).unwrap_err(),
            AnalyzerError::NotAttached(1)
        );
    }

    #[test]
    fn test_stale_end_of_stream_keeps_newer_attachment() {
        let probe = ChannelProbe::new();
        let _feed = probe.register(1);
        let registry = ProcessRegistry::new();
        let q = queue();

        registry.attach(1, &probe, &q, OPTIONS).unwrap();
        registry.detach(1, GRACE).unwrap();
        registry.attach(1, &probe, &q, OPTIONS).unwrap();

        // End-of-stream of the first attachment arriving late.
        release(&Arc::downgrade(&registry.entries), 1, 1);
        assert!(registry.is_monitoring(1));

        release(&Arc::downgrade(&registry.entries), 1, 2);
        assert!(!registry.is_monitoring(1));
    }

    #[test]
    fn test_detaching_pid_is_neither_attachable_nor_detachable() {
        let (probe, entered) = slow_probe();
        let registry = Arc::new(ProcessRegistry::new());
        registry.attach(8, &probe, &queue(), OPTIONS).unwrap();
        assert_eq!(entered.recv_timeout(GRACE).unwrap(), 8);

        let detacher = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.detach(8, Duration::from_millis(300)))
        };
        wait_until(|| registry.state(8) == Some(AttachmentState::Detaching));

        assert!(!registry.is_monitoring(8));
        assert!(registry.pids().is_empty());
        assert_eq!(
            registry.detach(8, GRACE).unwrap_err(),
            AnalyzerError::NotAttached(8)
        );
        assert_eq!(
            registry.attach(8, &probe, &queue(), OPTIONS).unwrap_err(),
            AnalyzerError::AlreadyAttached(8)
        );

        assert_eq!(detacher.join().unwrap().unwrap(), Teardown::Forced);
        assert_eq!(registry.state(8), None);
    }

    #[test]
    fn test_detach_all() {
        let probe = ChannelProbe::new();
        let _a = probe.register(1);
        let _b = probe.register(2);
        let registry = ProcessRegistry::new();
        let q = queue();
        registry.attach(1, &probe, &q, OPTIONS).unwrap();
        registry.attach(2, &probe, &q, OPTIONS).unwrap();

        let mut outcomes = registry.detach_all(GRACE);
        outcomes.sort_unstable_by_key(|(pid, _)| *pid);
        assert_eq!(outcomes, vec![(1, Teardown::Clean), (2, Teardown::Clean)]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_detach_all_shares_one_deadline() {
        let (probe, entered) = slow_probe();
        let registry = ProcessRegistry::new();
        let q = queue();
        for pid in 1..=3 {
            registry.attach(pid, &probe, &q, OPTIONS).unwrap();
        }
        let mut busy = HashSet::new();
        while busy.len() < 3 {
            busy.insert(entered.recv_timeout(GRACE).unwrap());
        }

        let start = Instant::now();
        let outcomes = registry.detach_all(Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(1500));
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|(_, t)| *t == Teardown::Forced));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_slow_connect_leaves_registry_usable() {
        let (connecting_tx, connecting) = mpsc::channel();
        let (open, gate) = mpsc::channel();
        let probe = Arc::new(GatedProbe {
            inner: ChannelProbe::new(),
            connecting: connecting_tx,
            gate: Mutex::new(gate),
        });
        let _feed = probe.inner.register(1);
        let registry = Arc::new(ProcessRegistry::new());
        let q = queue();

        let attacher = {
            let (registry, probe, q) = (Arc::clone(&registry), Arc::clone(&probe), Arc::clone(&q));
            thread::spawn(move || registry.attach(1, probe.as_ref(), &q, OPTIONS))
        };
        assert_eq!(connecting.recv_timeout(GRACE).unwrap(), 1);

        assert_eq!(registry.state(1), Some(AttachmentState::Connecting));
        assert!(!registry.is_monitoring(1));
        assert!(!registry.is_monitoring(2));
        assert!(registry.pids().is_empty());
        assert_eq!(
            registry.attach(1, probe.as_ref(), &q, OPTIONS).unwrap_err(),
            AnalyzerError::AlreadyAttached(1)
        );
        assert_eq!(
            registry.detach(1, GRACE).unwrap_err(),
            AnalyzerError::NotAttached(1)
        );
        assert!(registry.detach_all(GRACE).is_empty());

        open.send(()).unwrap();
        attacher.join().unwrap().unwrap();
        assert!(registry.is_monitoring(1));
        assert_eq!(registry.detach(1, GRACE).unwrap(), Teardown::Clean);
    }

    #[test]
    fn test_concurrent_attaches_have_one_winner() {
        const THREADS: usize = 4;

        let probe = ChannelProbe::new();
        let _feed = probe.register(1);
        let registry = ProcessRegistry::new();
        let q = queue();

        for _ in 0..50 {
            let barrier = Barrier::new(THREADS);
            let results: Vec<Result<(), AnalyzerError>> = thread::scope(|s| {
                let attachers: Vec<_> = (0..THREADS)
                    .map(|_| {
                        s.spawn(|| {
                            barrier.wait();
                            registry.attach(1, &probe, &q, OPTIONS)
                        })
                    })
                    .collect();
                attachers.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(
                results
                    .iter()
                    .filter_map(|r| r.as_ref().err())
                    .all(|e| *e == AnalyzerError::AlreadyAttached(1))
            );
            assert_eq!(registry.len(), 1);
            registry.detach(1, GRACE).unwrap();
        }
    }
}
