// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::Pid;

static PROC_ROOT: OnceLock<PathBuf> = OnceLock::new();

pub fn root_path() -> &'static Path {
    PROC_ROOT.get_or_init(|| {
        if let Ok(v) = env::var("HOST_PROC") {
            return v.into();
        }
        "/proc".into()
    })
}

/// True if `<root>/<pid>` exists. Non-positive pids never exist.
pub fn process_exists_in(root: &Path, pid: Pid) -> bool {
    pid > 0 && root.join(pid.to_string()).exists()
}

pub fn process_exists(pid: Pid) -> bool {
    process_exists_in(root_path(), pid)
}
