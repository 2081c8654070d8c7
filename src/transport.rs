// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Seam to the virtqueue transport.

use std::fmt;

use crate::command::PendingCommand;

/// The two queues the device exposes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// Bulk and 3d commands, completed asynchronously in fence order.
    Command,
    /// Administrative commands the caller waits on.
    Control,
}

/// A submission the transport refused. The command is handed back so it can be unwound.
pub struct SubmitError {
    pub command: PendingCommand,
    pub error: anyhow::Error,
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("command", &self.command)
            .field("error", &self.error)
            .finish()
    }
}

/// Moves commands to the host.
///
/// On success the transport owns the command until the host completes it, then passes it back to
/// `VgpuDevice::process_completion` after recording the reply length with
/// `PendingCommand::set_received`. Implementations must not call back into the device from inside
/// `submit`.
pub trait Transport: Send + Sync {
    fn submit(&self, queue: QueueId, command: PendingCommand) -> Result<(), SubmitError>;
}
