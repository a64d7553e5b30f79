// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::ffi::{CStr, CString, c_char};
use std::sync::{Mutex, MutexGuard};

use crate::errors::{AnalyzerError, ErrorCode};

pub(crate) const NO_ERROR: &CStr = c"no error";

/// Most recent failure recorded on a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub message: String,
}

struct Slot {
    record: ErrorRecord,
    // NUL-terminated copy of `record.message`, handed out over the C ABI.
    c_message: CString,
}

/// Last-error record of one analyzer. Overwritten by every failing
/// operation, never cleared by a successful one.
#[derive(Default)]
pub struct ErrorState {
    slot: Mutex<Option<Slot>>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, err: &AnalyzerError) {
        let message = err.to_string();
        let c_message = to_c_message(&message);
        *self.lock() = Some(Slot {
            record: ErrorRecord {
                code: err.code(),
                message,
            },
            c_message,
        });
    }

    pub fn last(&self) -> Option<ErrorRecord> {
        self.lock().as_ref().map(|slot| slot.record.clone())
    }

    /// Pointer to the current message, or to `"no error"`.
    ///
    /// The pointer stays valid until the next failing operation on the same
    /// analyzer overwrites the record, or until the analyzer is dropped.
    /// Reading it while another thread fails an operation on the same handle
    /// is a data race the caller must prevent.
    pub(crate) fn message_ptr(&self) -> *const c_char {
        match self.lock().as_ref() {
            Some(slot) => slot.c_message.as_ptr(),
            None => NO_ERROR.as_ptr(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Slot>> {
        // A poisoned record is still a valid record.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn to_c_message(message: &str) -> CString {
    let bytes: Vec<u8> = message
        .bytes()
        .map(|b| if b == 0 { b'?' } else { b })
        .collect();
    CString::new(bytes).unwrap_or_default()
}
