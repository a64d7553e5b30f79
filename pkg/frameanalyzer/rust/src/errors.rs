// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Error types and the result codes exchanged over the C ABI.

use std::fmt;

use thiserror::Error;

use crate::Pid;

/// Result codes returned by the exported C functions.
///
/// `NoData` and `Timeout` are signals, not failures: they never end up in a
/// handle's error record.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Operation completed successfully.
    Ok = 0,
    /// `try_recv` found the queue empty.
    NoData = 1,
    /// `recv` reached its deadline without a sample.
    Timeout = -1,
    /// The pid is already attached (or still detaching).
    AlreadyAttached = -2,
    /// The pid is not attached.
    NotAttached = -3,
    /// The instrumentation source for the pid cannot be reached.
    ProbeUnavailable = -4,
    /// Unexpected adapter or queue fault.
    InternalFailure = -5,
    /// Null, unknown or destroyed handle, or a null output pointer.
    InvalidHandle = -100,
}

impl ErrorCode {
    /// Returns a human-readable description of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "success",
            ErrorCode::NoData => "no data",
            ErrorCode::Timeout => "timed out",
            ErrorCode::AlreadyAttached => "already attached",
            ErrorCode::NotAttached => "not attached",
            ErrorCode::ProbeUnavailable => "probe unavailable",
            ErrorCode::InternalFailure => "internal failure",
            ErrorCode::InvalidHandle => "invalid handle",
        }
    }

    /// Numeric value as seen by C callers.
    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure of a handle operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerError {
    #[error("invalid handle: analyzer has been destroyed")]
    InvalidHandle,

    #[error("pid {0} is already attached")]
    AlreadyAttached(Pid),

    #[error("pid {0} is not attached")]
    NotAttached(Pid),

    #[error("probe unavailable for pid {pid}: {reason}")]
    ProbeUnavailable { pid: Pid, reason: String },

    #[error("internal failure: {0}")]
    InternalFailure(String),
}

impl AnalyzerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AnalyzerError::InvalidHandle => ErrorCode::InvalidHandle,
            AnalyzerError::AlreadyAttached(_) => ErrorCode::AlreadyAttached,
            AnalyzerError::NotAttached(_) => ErrorCode::NotAttached,
            AnalyzerError::ProbeUnavailable { .. } => ErrorCode::ProbeUnavailable,
            AnalyzerError::InternalFailure(_) => ErrorCode::InternalFailure,
        }
    }

    pub(crate) fn probe(pid: Pid, err: &ProbeError) -> Self {
        AnalyzerError::ProbeUnavailable {
            pid,
            reason: err.to_string(),
        }
    }
}

/// Failure raised by a probe connector or frame source.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("process {0} not found")]
    ProcessNotFound(Pid),

    #[error("probe for pid {pid} unavailable: {reason}")]
    Unavailable { pid: Pid, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
