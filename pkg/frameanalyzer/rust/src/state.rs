// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;

/// Attachment state of a tracked pid. An untracked pid has no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    /// Pid reserved while its probe connection is being opened.
    Connecting,
    /// Probe adapter is running and feeding the queue.
    Attached,
    /// Stop requested, waiting for the adapter to exit.
    Detaching,
}

impl AttachmentState {
    pub fn is_monitoring(self) -> bool {
        self == AttachmentState::Attached
    }

    pub(crate) fn can_transition_to(self, next: AttachmentState) -> bool {
        use AttachmentState::*;
        matches!((self, next), (Connecting, Attached) | (Attached, Detaching))
    }
}

impl fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachmentState::Connecting => write!(f, "connecting"),
            AttachmentState::Attached => write!(f, "attached"),
            AttachmentState::Detaching => write!(f, "detaching"),
        }
    }
}
