// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Unix-socket probe transport.
//!
//! The injected probe of process `pid` listens on `<probe_dir>/<pid>.sock`
//! and writes one 8-byte little-endian nanosecond timestamp per completed
//! frame. Closing the connection ends the stream.

use std::io::{self, ErrorKind, Read};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};

use super::{FrameSource, ProbeConnector, ProbeEvent};
use crate::Pid;
use crate::errors::ProbeError;
use crate::procfs;

const TIMESTAMP_LEN: usize = 8;
// A zero read timeout is rejected by the OS.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SocketProbe {
    probe_dir: PathBuf,
    proc_root: PathBuf,
    connect_timeout: Duration,
}

impl SocketProbe {
    pub fn new(probe_dir: impl Into<PathBuf>) -> Self {
        Self {
            probe_dir: probe_dir.into(),
            proc_root: procfs::root_path().to_path_buf(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// How long `connect` waits for a probe that is not accepting.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use another procfs mount to decide whether a target is alive.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    pub fn socket_path(&self, pid: Pid) -> PathBuf {
        self.probe_dir.join(format!("{pid}.sock"))
    }
}

impl ProbeConnector for SocketProbe {
    fn connect(&self, pid: Pid) -> Result<Box<dyn FrameSource>, ProbeError> {
        if !procfs::process_exists_in(&self.proc_root, pid) {
            return Err(ProbeError::ProcessNotFound(pid));
        }

        let path = self.socket_path(pid);
        let stream = connect_within(&path, self.connect_timeout).map_err(|e| ProbeError::Unavailable {
            pid,
            reason: format!("cannot connect to {}: {e}", path.display()),
        })?;
        debug!("[pid {pid}] connected to probe socket {}", path.display());

        Ok(Box::new(SocketSource {
            pid,
            stream,
            proc_root: self.proc_root.clone(),
            buf: [0; TIMESTAMP_LEN],
            filled: 0,
        }))
    }
}

/// Connect to `path` without ever blocking past `timeout`. A listener whose
/// backlog is full refuses non-blocking connects with `EAGAIN`; those are
/// retried until the deadline.
fn connect_within(path: &Path, timeout: Duration) -> io::Result<UnixStream> {
    let addr = UnixAddr::new(path)?;
    let deadline = Instant::now() + timeout;
    loop {
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        match socket::connect(fd.as_raw_fd(), &addr) {
            Ok(()) => {
                let stream = UnixStream::from(fd);
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(Errno::EAGAIN) => {}
            Err(e) => return Err(e.into()),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(io::Error::new(
                ErrorKind::TimedOut,
                format!("timed out after {}ms, probe is not accepting", timeout.as_millis()),
            ));
        }
        thread::sleep(CONNECT_RETRY.min(deadline - now));
    }
}

struct SocketSource {
    pid: Pid,
    stream: UnixStream,
    proc_root: PathBuf,
    // Partial timestamp carried over between reads.
    buf: [u8; TIMESTAMP_LEN],
    filled: usize,
}

impl FrameSource for SocketSource {
    fn next_event(&mut self, wait: Duration) -> Result<ProbeEvent, ProbeError> {
        self.stream.set_read_timeout(Some(wait.max(MIN_READ_TIMEOUT)))?;

        loop {
            let Some(rest) = self.buf.get_mut(self.filled..) else {
                self.filled = 0;
                continue;
            };
            match self.stream.read(rest) {
                Ok(0) => return Ok(ProbeEvent::Ended),
                Ok(n) => {
                    self.filled += n;
                    if self.filled == TIMESTAMP_LEN {
                        self.filled = 0;
                        return Ok(ProbeEvent::Frame(u64::from_le_bytes(self.buf)));
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    // A crashed target may leave the probe end open.
                    if procfs::process_exists_in(&self.proc_root, self.pid) {
                        return Ok(ProbeEvent::Idle);
                    }
                    return Ok(ProbeEvent::Ended);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for SocketSource {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("[pid {}] probe socket closed", self.pid);
    }
}
