// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! C ABI interface, declared in `include/frame_analyzer.h`.
//!
//! A handle is an opaque non-zero token naming a live analyzer in a
//! process-wide table. Destroying a handle retires its token for good: any
//! later call with it returns `FRAME_ANALYZER_INVALID_HANDLE` instead of
//! touching freed memory. The table holds nothing but the analyzers.
//!
//! Strings returned by `frame_analyzer_get_last_error` stay valid until the
//! next failing call on the same handle or until the handle is destroyed.
//! Reading one while another thread drives the same handle needs external
//! synchronization.

use std::ffi::{CStr, c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use log::error;

use crate::Pid;
use crate::analyzer::Analyzer;
use crate::config::AnalyzerConfig;
use crate::errors::{AnalyzerError, ErrorCode};
use crate::queue::FrameSample;

pub type FrameAnalyzerHandle = u64;

pub const NULL_HANDLE: FrameAnalyzerHandle = 0;

const NO_INSTANCE: &CStr = c"no analyzer instance";

const VERSION: &CStr =
    match CStr::from_bytes_with_nul(concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes()) {
        Ok(v) => v,
        Err(_) => c"unknown",
    };

static HANDLES: Mutex<HandleTable> = Mutex::new(HandleTable::new());

struct Slot {
    generation: u32,
    analyzer: Option<Arc<Analyzer>>,
}

/// Slot vector with free-list reuse. A token is
/// `(generation << 32) | (index + 1)`, so it is never zero.
struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl HandleTable {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, analyzer: Arc<Analyzer>) -> Option<FrameAnalyzerHandle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    analyzer: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = self.slots.get_mut(index)?;
        slot.analyzer = Some(analyzer);
        encode(index, slot.generation)
    }

    fn get(&self, handle: FrameAnalyzerHandle) -> Option<Arc<Analyzer>> {
        let (index, generation) = decode(handle)?;
        let slot = self.slots.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.analyzer.clone()
    }

    fn remove(&mut self, handle: FrameAnalyzerHandle) -> Option<Arc<Analyzer>> {
        let (index, generation) = decode(handle)?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let analyzer = slot.analyzer.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        Some(analyzer)
    }
}

fn encode(index: usize, generation: u32) -> Option<FrameAnalyzerHandle> {
    let low = u32::try_from(index.checked_add(1)?).ok()?;
    Some((u64::from(generation) << 32) | u64::from(low))
}

fn decode(handle: FrameAnalyzerHandle) -> Option<(usize, u32)> {
    let low = u32::try_from(handle & 0xffff_ffff).ok()?;
    let generation = u32::try_from(handle >> 32).ok()?;
    let index = usize::try_from(low).ok()?.checked_sub(1)?;
    Some((index, generation))
}

fn handles() -> MutexGuard<'static, HandleTable> {
    HANDLES.lock().unwrap_or_else(|e| e.into_inner())
}

fn lookup(handle: FrameAnalyzerHandle) -> Option<Arc<Analyzer>> {
    handles().get(handle)
}

/// Make `analyzer` reachable from C. Returns [`NULL_HANDLE`] when the table
/// is exhausted.
pub fn register(analyzer: Analyzer) -> FrameAnalyzerHandle {
    handles().insert(Arc::new(analyzer)).unwrap_or(NULL_HANDLE)
}

/// Run `f` and turn a panic into `fallback`.
fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => v,
        Err(_) => {
            error!("panic caught at the C boundary");
            fallback
        }
    }
}

fn with_analyzer(handle: FrameAnalyzerHandle, f: impl FnOnce(&Analyzer) -> c_int) -> c_int {
    guarded(ErrorCode::InternalFailure.as_raw(), || match lookup(handle) {
        Some(analyzer) => f(&analyzer),
        None => ErrorCode::InvalidHandle.as_raw(),
    })
}

fn status(result: Result<(), AnalyzerError>) -> c_int {
    match result {
        Ok(()) => ErrorCode::Ok.as_raw(),
        Err(e) => e.code().as_raw(),
    }
}

/// Copy `sample` out.
///
/// # Safety
/// Both pointers must be non-null, aligned and valid for writes.
unsafe fn write_sample(sample: FrameSample, out_pid: *mut Pid, out_frametime_ns: *mut u64) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        out_pid.write(sample.pid);
        out_frametime_ns.write(sample.frame_time_ns);
    }
}

/// Create an analyzer configured from the environment.
///
/// Returns `0` only if the handle table is exhausted or creation panicked.
#[unsafe(no_mangle)]
pub extern "C" fn frame_analyzer_create() -> FrameAnalyzerHandle {
    guarded(NULL_HANDLE, || register(Analyzer::new(AnalyzerConfig::from_env())))
}

/// Detach every process and release the analyzer. Blocked receivers on other
/// threads return `FRAME_ANALYZER_INVALID_HANDLE`. A zero, unknown or already
/// destroyed handle is a no-op.
#[unsafe(no_mangle)]
pub extern "C" fn frame_analyzer_destroy(handle: FrameAnalyzerHandle) {
    guarded((), || {
        let Some(analyzer) = handles().remove(handle) else {
            return;
        };
        // Outside the table lock: teardown may wait on adapters.
        analyzer.shutdown();
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn frame_analyzer_attach_app(handle: FrameAnalyzerHandle, pid: Pid) -> c_int {
    with_analyzer(handle, |a| status(a.attach(pid)))
}

#[unsafe(no_mangle)]
pub extern "C" fn frame_analyzer_detach_app(handle: FrameAnalyzerHandle, pid: Pid) -> c_int {
    with_analyzer(handle, |a| status(a.detach(pid)))
}

#[unsafe(no_mangle)]
pub extern "C" fn frame_analyzer_detach_all(handle: FrameAnalyzerHandle) {
    with_analyzer(handle, |a| status(a.detach_all()));
}

/// Wait up to `timeout_ms` for the next sample; `timeout_ms <= 0` waits until
/// a sample arrives or the handle is destroyed.
///
/// Returns `0` with both outputs written, `-1` on timeout, or a negative
/// error code. Outputs are left untouched unless `0` is returned.
///
/// # Safety
/// `out_pid` and `out_frametime_ns` must be NULL or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frame_analyzer_recv(
    handle: FrameAnalyzerHandle,
    out_pid: *mut Pid,
    out_frametime_ns: *mut u64,
    timeout_ms: c_int,
) -> c_int {
    with_analyzer(handle, |a| {
        if out_pid.is_null() || out_frametime_ns.is_null() {
            return ErrorCode::InvalidHandle.as_raw();
        }
        let timeout = u64::try_from(timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(std::time::Duration::from_millis);
        match a.recv(timeout) {
            Ok(Some(sample)) => {
                // SAFETY: both pointers checked non-null; validity is the caller's contract.
                unsafe { write_sample(sample, out_pid, out_frametime_ns) };
                ErrorCode::Ok.as_raw()
            }
            Ok(None) => ErrorCode::Timeout.as_raw(),
            Err(e) => e.code().as_raw(),
        }
    })
}

/// Take the next sample without waiting.
///
/// Returns `0` with both outputs written, `1` if the queue is empty, or a
/// negative error code.
///
/// # Safety
/// `out_pid` and `out_frametime_ns` must be NULL or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frame_analyzer_try_recv(
    handle: FrameAnalyzerHandle,
    out_pid: *mut Pid,
    out_frametime_ns: *mut u64,
) -> c_int {
    with_analyzer(handle, |a| {
        if out_pid.is_null() || out_frametime_ns.is_null() {
            return ErrorCode::InvalidHandle.as_raw();
        }
        match a.try_recv() {
            Ok(Some(sample)) => {
                // SAFETY: both pointers checked non-null; validity is the caller's contract.
                unsafe { write_sample(sample, out_pid, out_frametime_ns) };
                ErrorCode::Ok.as_raw()
            }
            Ok(None) => ErrorCode::NoData.as_raw(),
            Err(e) => e.code().as_raw(),
        }
    })
}

/// `1` if `pid` is attached, `0` if not (detaching counts as not), or a
/// negative error code.
#[unsafe(no_mangle)]
pub extern "C" fn frame_analyzer_is_monitoring(handle: FrameAnalyzerHandle, pid: Pid) -> c_int {
    with_analyzer(handle, |a| match a.is_monitoring(pid) {
        Ok(monitoring) => c_int::from(monitoring),
        Err(e) => e.code().as_raw(),
    })
}

/// Message of the most recent failure on `handle`, `"no error"` if there is
/// none, or `"no analyzer instance"` for a zero, unknown or destroyed handle.
/// Never NULL. The caller must not free it.
#[unsafe(no_mangle)]
pub extern "C" fn frame_analyzer_get_last_error(handle: FrameAnalyzerHandle) -> *const c_char {
    guarded(NO_INSTANCE.as_ptr(), || match lookup(handle) {
        Some(analyzer) => analyzer.last_error_ptr(),
        None => NO_INSTANCE.as_ptr(),
    })
}

/// Library version as a static string. Never NULL.
#[unsafe(no_mangle)]
pub extern "C" fn frame_analyzer_get_version() -> *const c_char {
    VERSION.as_ptr()
}
