// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Analyzer handle: the registry, the measurement queue and the error record
//! of one monitoring session.

use std::ffi::c_char;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};

use crate::Pid;
use crate::adapter::Teardown;
use crate::config::AnalyzerConfig;
use crate::error_state::{ErrorRecord, ErrorState};
use crate::errors::AnalyzerError;
use crate::probe::{ProbeConnector, SocketProbe};
use crate::queue::{FrameSample, MeasurementQueue, RecvError, TryRecvError};
use crate::registry::ProcessRegistry;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct Analyzer {
    config: AnalyzerConfig,
    connector: Box<dyn ProbeConnector>,
    registry: ProcessRegistry,
    queue: Arc<MeasurementQueue>,
    errors: ErrorState,
    destroyed: AtomicBool,
}

impl Analyzer {
    /// Analyzer reading frames from the probe sockets under
    /// `config.probe_dir`.
    pub fn new(config: AnalyzerConfig) -> Self {
        let probe =
            SocketProbe::new(config.probe_dir.clone()).with_connect_timeout(config.detach_grace());
        Self::with_connector(config, probe)
    }

    pub fn with_connector(config: AnalyzerConfig, connector: impl ProbeConnector + 'static) -> Self {
        let queue = Arc::new(MeasurementQueue::new(config.queue_options()));
        debug!(
            "analyzer created (queue capacity {}, overflow {:?})",
            queue.capacity(),
            config.overflow_policy
        );
        Self {
            config,
            connector: Box::new(connector),
            registry: ProcessRegistry::new(),
            queue,
            errors: ErrorState::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn attach(&self, pid: Pid) -> Result<(), AnalyzerError> {
        let result = self.ensure_alive().and_then(|()| {
            self.registry.attach(
                pid,
                self.connector.as_ref(),
                &self.queue,
                self.config.adapter_options(),
            )
        });
        if result.is_ok() && self.is_destroyed() {
            // Lost a race with shutdown, which may have missed this pid.
            let rollback = self.registry.detach(pid, self.config.detach_grace());
            let result = self.track(Err(AnalyzerError::InvalidHandle));
            if let Ok(teardown) = rollback {
                self.note_teardown(pid, teardown);
            }
            return result;
        }
        self.track(result)
    }

    /// Stop monitoring `pid`. Samples it already queued stay deliverable.
    pub fn detach(&self, pid: Pid) -> Result<(), AnalyzerError> {
        let result = self
            .ensure_alive()
            .and_then(|()| self.registry.detach(pid, self.config.detach_grace()))
            .map(|teardown| self.note_teardown(pid, teardown));
        self.track(result)
    }

    /// Detach every pid. Forced teardowns are recorded in the error record
    /// without failing the call.
    pub fn detach_all(&self) -> Result<(), AnalyzerError> {
        self.track(self.ensure_alive())?;
        self.detach_everything();
        Ok(())
    }

    pub fn is_monitoring(&self, pid: Pid) -> Result<bool, AnalyzerError> {
        let result = self
            .ensure_alive()
            .map(|()| self.registry.is_monitoring(pid));
        self.track(result)
    }

    pub fn monitored_pids(&self) -> Result<Vec<Pid>, AnalyzerError> {
        let result = self.ensure_alive().map(|()| self.registry.pids());
        self.track(result)
    }

    /// Next sample, waiting up to `timeout` (`None` waits forever).
    /// `Ok(None)` means the wait timed out.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Option<FrameSample>, AnalyzerError> {
        let result = self.ensure_alive().and_then(|()| match self.queue.recv(timeout) {
            Ok(sample) => Ok(Some(sample)),
            Err(RecvError::Timeout) => Ok(None),
            Err(RecvError::Closed) => Err(AnalyzerError::InvalidHandle),
        });
        self.track(result)
    }

    /// Next sample if one is queued. `Ok(None)` means there is none.
    pub fn try_recv(&self) -> Result<Option<FrameSample>, AnalyzerError> {
        let result = self.ensure_alive().and_then(|()| match self.queue.try_recv() {
            Ok(sample) => Ok(Some(sample)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(AnalyzerError::InvalidHandle),
        });
        self.track(result)
    }

    /// Samples discarded because the queue was full.
    pub fn dropped_samples(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.errors.last()
    }

    pub(crate) fn last_error_ptr(&self) -> *const c_char {
        self.errors.message_ptr()
    }

    /// Detach everything and close the queue. Blocked receivers return
    /// [`AnalyzerError::InvalidHandle`], as does every later call.
    pub fn shutdown(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.close();
        self.detach_everything();
        info!("analyzer destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn detach_everything(&self) {
        for (pid, teardown) in self.registry.detach_all(self.config.detach_grace()) {
            self.note_teardown(pid, teardown);
        }
    }

    fn note_teardown(&self, pid: Pid, teardown: Teardown) {
        if teardown == Teardown::Forced {
            let err = AnalyzerError::InternalFailure(format!(
                "adapter for pid {pid} did not stop within {}ms",
                self.config.detach_grace_ms
            ));
            warn!("[pid {pid}] {err}");
            self.errors.record(&err);
        }
    }

    fn ensure_alive(&self) -> Result<(), AnalyzerError> {
        if self.is_destroyed() {
            return Err(AnalyzerError::InvalidHandle);
        }
        Ok(())
    }

    fn track<T>(&self, result: Result<T, AnalyzerError>) -> Result<T, AnalyzerError> {
        if let Err(e) = &result {
            debug!("analyzer call failed: {e}");
            self.errors.record(e);
        }
        result
    }
}

impl Drop for Analyzer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
