// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A live process with a fake probe endpoint in `probe_dir`.
pub struct Target {
    child: Child,
    listener: UnixListener,
    socket_path: PathBuf,
    reaped: bool,
}

impl Target {
    /// Start `/bin/sleep` and listen on `<probe_dir>/<pid>.sock` for it.
    pub fn start(probe_dir: &Path) -> Self {
        let child = Command::new("/bin/sleep")
            .arg("300")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to start /bin/sleep");
        let socket_path = probe_dir.join(format!("{}.sock", child.id()));
        let listener = UnixListener::bind(&socket_path)
            .unwrap_or_else(|e| panic!("failed to bind {}: {e}", socket_path.display()));
        Self {
            child,
            listener,
            socket_path,
            reaped: false,
        }
    }

    pub fn pid(&self) -> i32 {
        i32::try_from(self.child.id()).expect("pid out of range")
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept the analyzer's connection. Call after a successful attach.
    pub fn accept(&self) -> ProbeConn {
        let (stream, _) = self.listener.accept().expect("no probe connection");
        stream
            .set_read_timeout(Some(DEFAULT_TIMEOUT))
            .expect("failed to set read timeout");
        ProbeConn { stream }
    }

    /// SIGKILL and reap the process, so it vanishes from /proc.
    pub fn kill(&mut self) {
        if self.reaped {
            return;
        }
        self.reaped = true;
        let _ = signal::kill(NixPid::from_raw(self.pid()), Signal::SIGKILL);
        let _ = self.child.wait();
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        self.kill();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Probe side of one analyzer connection.
pub struct ProbeConn {
    stream: UnixStream,
}

impl ProbeConn {
    pub fn emit(&mut self, timestamp_ns: u64) {
        self.stream
            .write_all(&timestamp_ns.to_le_bytes())
            .expect("failed to write timestamp");
    }

    /// True once the analyzer has closed its end.
    pub fn wait_closed(&mut self) -> bool {
        let mut buf = [0u8; 8];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }
}

/// Poll `cond` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Check if a PID is still alive.
pub fn pid_is_alive(pid: i32) -> bool {
    signal::kill(NixPid::from_raw(pid), None).is_ok()
}
