// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The state of one in-flight command.
//!
//! A `PendingCommand` is built at submission time, moved into the transport and handed back,
//! still owned, when the host completes it. Everything the completion needs travels with it.

use std::fmt;
use std::sync::Arc;

use sync::Promise;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::context::ContextKey;
use crate::fence::FenceEvent;
use crate::memory::MemoryBlock;
use crate::protocol::response_header;
use crate::protocol::virtio_gpu_cmd_str;
use crate::protocol::virtio_gpu_ctrl_hdr;

/// One driver-readable piece of an outbound command.
#[derive(Debug, PartialEq, Eq)]
pub enum OutSegment<'a> {
    /// Bytes held in the command itself.
    Bytes(&'a [u8]),
    /// A physically contiguous range of arena memory.
    Physical { address: u64, len: u64 },
}

pub struct PendingCommand {
    hdr: virtio_gpu_ctrl_hdr,
    message: Vec<u8>,
    payload: Option<(MemoryBlock, u64)>,
    response: Vec<u8>,
    received: usize,
    resource_ids: Vec<u32>,
    reply: Option<Promise<Vec<u8>>>,
    out_fence: Option<Arc<FenceEvent>>,
}

impl PendingCommand {
    /// Wraps a wire command. Its header decides the type, context and fence of the command.
    pub fn new<T: IntoBytes + Immutable>(cmd: &T) -> Self {
        let message = cmd.as_bytes().to_vec();
        let hdr = response_header(&message).unwrap_or_default();
        PendingCommand {
            hdr,
            message,
            payload: None,
            response: Vec::new(),
            received: 0,
            resource_ids: Vec::new(),
            reply: None,
            out_fence: None,
        }
    }

    /// Appends the first `len` bytes of `block` to the outbound segments.
    ///
    /// The block stays allocated until the command is dropped after completion.
    pub fn with_payload(mut self, block: MemoryBlock, len: u64) -> Self {
        self.payload = Some((block, len));
        self
    }

    /// Reserves `len` bytes for the host's reply.
    pub fn with_response(mut self, len: usize) -> Self {
        self.response = vec![0; len];
        self
    }

    pub fn with_resources(mut self, resource_ids: Vec<u32>) -> Self {
        self.resource_ids = resource_ids;
        self
    }

    pub fn with_reply(mut self, reply: Promise<Vec<u8>>) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn with_out_fence(mut self, out_fence: Arc<FenceEvent>) -> Self {
        self.out_fence = Some(out_fence);
        self
    }

    pub fn command_type(&self) -> u32 {
        self.hdr.type_
    }

    pub fn name(&self) -> &'static str {
        virtio_gpu_cmd_str(self.hdr.type_)
    }

    pub fn ctx_id(&self) -> ContextKey {
        self.hdr.ctx_id
    }

    pub fn fence_id(&self) -> u64 {
        self.hdr.fence_id
    }

    /// The serialized command, header first.
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn resource_ids(&self) -> &[u32] {
        &self.resource_ids
    }

    /// Everything the host reads, in order.
    pub fn out_segments(&self) -> Vec<OutSegment<'_>> {
        let mut segments = vec![OutSegment::Bytes(&self.message)];
        if let Some((block, len)) = &self.payload {
            segments.push(OutSegment::Physical {
                address: block.physical_address(),
                len: *len,
            });
        }
        segments
    }

    /// The buffer the host writes its reply into. Empty when no reply is expected.
    pub fn response_mut(&mut self) -> &mut [u8] {
        &mut self.response
    }

    /// Records how many reply bytes the host wrote.
    pub fn set_received(&mut self, len: usize) {
        self.received = len.min(self.response.len());
    }

    /// The reply bytes the host wrote.
    pub fn response(&self) -> &[u8] {
        &self.response[..self.received]
    }

    pub(crate) fn take_reply(&mut self) -> Option<Promise<Vec<u8>>> {
        self.reply.take()
    }

    pub(crate) fn take_out_fence(&mut self) -> Option<Arc<FenceEvent>> {
        self.out_fence.take()
    }

    pub(crate) fn take_response(&mut self) -> Vec<u8> {
        let mut response = std::mem::take(&mut self.response);
        response.truncate(self.received);
        self.received = 0;
        response
    }
}

impl fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PendingCommand")
            .field("type", &self.name())
            .field("ctx_id", &self.hdr.ctx_id)
            .field("fence_id", &self.hdr.fence_id)
            .field("resource_ids", &self.resource_ids)
            .field("payload", &self.payload)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use sync::create_promise_and_waitable;

    use super::*;
    use crate::protocol::virtio_gpu_resource_unref;
    use crate::protocol::VIRTIO_GPU_CMD_RESOURCE_UNREF;

    fn unref() -> PendingCommand {
        PendingCommand::new(&virtio_gpu_resource_unref {
            hdr: virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_RESOURCE_UNREF, 3, 9),
            resource_id: 17,
            padding: 0,
        })
    }

    #[test]
    fn header_fields() {
        let cmd = unref();
        assert_eq!(cmd.command_type(), VIRTIO_GPU_CMD_RESOURCE_UNREF);
        assert_eq!(cmd.ctx_id(), 3);
        assert_eq!(cmd.fence_id(), 9);
        assert_eq!(cmd.name(), "VIRTIO_GPU_CMD_RESOURCE_UNREF");
        assert_eq!(cmd.out_segments().len(), 1);
    }

    #[test]
    fn response_is_clamped() {
        let mut cmd = unref().with_response(8);
        cmd.response_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        cmd.set_received(100);
        assert_eq!(cmd.response().len(), 8);
        cmd.set_received(4);
        assert_eq!(cmd.take_response(), vec![1, 2, 3, 4]);
        assert!(cmd.response().is_empty());
    }

    #[test]
    fn reply_travels_with_command() {
        let (promise, waitable) = create_promise_and_waitable();
        let mut cmd = unref().with_reply(promise);
        let reply = cmd.take_reply().unwrap();
        reply.fulfill(vec![5]);
        assert_eq!(waitable.wait(None), Ok(vec![5]));
        assert!(cmd.take_reply().is_none());
    }
}
