// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

//! Frame-time monitoring core.
//!
//! An [`Analyzer`] attaches to running processes, turns the frame completion
//! timestamps reported by each process's probe into frame-time samples, and
//! hands them out through one shared queue. [`ffi`] exposes the same handle
//! over a C ABI.

pub mod adapter;
pub mod analyzer;
pub mod config;
mod error_state;
pub mod errors;
pub mod ffi;
pub mod probe;
pub mod procfs;
pub mod queue;
pub mod registry;
pub mod state;

/// Operating-system process identifier.
pub type Pid = i32;

pub use analyzer::{Analyzer, version};
pub use config::AnalyzerConfig;
pub use error_state::ErrorRecord;
pub use errors::{AnalyzerError, ErrorCode, ProbeError};
pub use probe::{ChannelProbe, FrameFeed, FrameSource, ProbeConnector, ProbeEvent, SocketProbe};
pub use queue::{FrameSample, OverflowPolicy};
pub use state::AttachmentState;
