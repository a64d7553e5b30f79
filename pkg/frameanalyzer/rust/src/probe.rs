// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Seam between the analyzer and the instrumentation that reports frame
//! completions of a target process.
//!
//! A [`ProbeConnector`] opens one [`FrameSource`] per attached pid. A source
//! yields strictly increasing nanosecond timestamps, one per completed frame,
//! and ends when the process exits or the source is dropped.

pub mod channel;
pub mod socket;

use std::time::Duration;

use crate::Pid;
use crate::errors::ProbeError;

pub use channel::{ChannelProbe, FrameFeed};
pub use socket::SocketProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEvent {
    /// A frame completed at this timestamp (ns).
    Frame(u64),
    /// Nothing arrived within the wait window.
    Idle,
    /// The stream is over, usually because the process exited.
    Ended,
}

pub trait FrameSource: Send {
    /// Wait up to `wait` for the next event.
    fn next_event(&mut self, wait: Duration) -> Result<ProbeEvent, ProbeError>;
}

pub trait ProbeConnector: Send + Sync {
    fn connect(&self, pid: Pid) -> Result<Box<dyn FrameSource>, ProbeError>;
}
