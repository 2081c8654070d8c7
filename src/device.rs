// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The device service: owns every registry and turns client requests into host commands.
//!
//! One `VgpuDevice` exists per device, created by [`VgpuDevice::start`] and passed by reference
//! to every caller. Completions come back through [`VgpuDevice::process_completion`], which may
//! run concurrently with any other method.
//!
//! No lock is held while a command is handed to the transport or while a caller blocks.

use std::sync::Arc;

use anyhow::anyhow;
use log::debug;
use log::error;
use log::info;
use log::warn;
use resources::IdAllocator;
use resources::IdPolicy;
use sync::create_promise_and_waitable;
use sync::Mutex;
use sync::WaitError;
use zerocopy::FromBytes;

use crate::command::PendingCommand;
use crate::context::Context;
use crate::context::ContextKey;
use crate::context::ContextParams;
use crate::context::ContextRegistry;
use crate::context::SharedAllocation;
use crate::error::VgpuError;
use crate::error::VgpuResult;
use crate::fence::FenceEvent;
use crate::fence::ResourceState;
use crate::fence::WaitMode;
use crate::memory::MemoryBlock;
use crate::memory::MemoryProvider;
use crate::memory::VgpuMemory;
use crate::parameters::DeviceConfig;
use crate::parameters::VgpuParameters;
use crate::protocol::*;
use crate::resource::Backing;
use crate::resource::Resource;
use crate::resource::ResourceKind;
use crate::share::ShareMapper;
use crate::share::ShareSource;
use crate::share::UserMapping;
use crate::transport::QueueId;
use crate::transport::Transport;

pub const VIRTGPU_PARAM_3D_FEATURES: u32 = 1;
pub const VIRTGPU_PARAM_CAPSET_QUERY_FIX: u32 = 2;
pub const VIRTGPU_PARAM_RESOURCE_BLOB: u32 = 3;
pub const VIRTGPU_PARAM_HOST_VISIBLE: u32 = 4;
pub const VIRTGPU_PARAM_CROSS_DEVICE: u32 = 5;
pub const VIRTGPU_PARAM_CONTEXT_INIT: u32 = 6;
pub const VIRTGPU_PARAM_SUPPORTED_CAPSET_IDS: u32 = 7;

pub const VIRTGPU_EXECBUF_FENCE_FD_IN: u32 = 0x01;
pub const VIRTGPU_EXECBUF_FENCE_FD_OUT: u32 = 0x02;
pub const VIRTGPU_EXECBUF_RING_IDX: u32 = 0x04;

/// `bind` flag of the resources mesa creates purely to carry a fence.
const PIPE_BIND_CUSTOM: u32 = 1 << 17;
const MAX_RINGS: u32 = 64;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CapsetInfo {
    pub id: u32,
    pub max_version: u32,
    pub max_size: u32,
}

/// Arguments of a 3d resource creation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceCreate3D {
    pub target: u32,
    pub format: u32,
    pub bind: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub last_level: u32,
    pub nr_samples: u32,
    pub flags: u32,
    /// Bytes of backing memory wanted.
    pub size: u64,
}

impl ResourceCreate3D {
    /// Fence carriers and copy-transfer sources (size 1) are tracked on the host only.
    fn needs_backing(&self) -> bool {
        let fence_placeholder = self.target == 0 && self.bind == PIPE_BIND_CUSTOM && self.size == 8;
        !fence_placeholder && self.size != 1
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceCreateBlob {
    pub blob_mem: u32,
    pub blob_flags: u32,
    pub blob_id: u64,
    pub size: u64,
    pub format: u32,
    pub bind: u32,
    pub target: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub last_level: u32,
    pub nr_samples: u32,
    pub flags: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Transfer3D {
    pub resource_id: u32,
    pub box_: virtio_gpu_box,
    pub level: u32,
    pub offset: u64,
    pub stride: u32,
    pub layer_stride: u32,
}

/// A command buffer submission.
#[derive(Clone, Debug, Default)]
pub struct ExecBuffer<'a> {
    /// `VIRTGPU_EXECBUF_*` flags.
    pub flags: u32,
    pub command: &'a [u8],
    /// Resources the command reads or writes.
    pub resource_ids: &'a [u32],
    /// Waited on before submission when `VIRTGPU_EXECBUF_FENCE_FD_IN` is set.
    pub in_fence: Option<Arc<FenceEvent>>,
    pub ring_idx: u32,
}

#[derive(Clone)]
pub struct SubmitReceipt {
    pub fence_id: u64,
    /// Signaled on completion when `VIRTGPU_EXECBUF_FENCE_FD_OUT` was requested.
    pub out_fence: Option<Arc<FenceEvent>>,
}

/// Notifications from the process lifecycle notifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    Created(ContextKey),
    Exited(ContextKey),
}

pub struct VgpuDevice {
    config: DeviceConfig,
    params: VgpuParameters,
    transport: Box<dyn Transport>,
    share: Box<dyn ShareMapper>,
    contexts: ContextRegistry,
    memory: VgpuMemory,
    resource_ids: Mutex<IdAllocator>,
    fence_ids: Mutex<IdAllocator>,
    capsets: Mutex<Option<Arc<Vec<CapsetInfo>>>>,
}

impl VgpuDevice {
    /// Brings the device up: obtains the shared region and lays the arena over it.
    pub fn start(
        config: DeviceConfig,
        params: VgpuParameters,
        provider: &dyn MemoryProvider,
        transport: Box<dyn Transport>,
        share: Box<dyn ShareMapper>,
    ) -> VgpuResult<VgpuDevice> {
        params.validate()?;
        if config.memory_size == 0 {
            return Err(VgpuError::InvalidParameter("device reports no memory"));
        }
        let region = provider
            .allocate_contiguous(config.memory_size)
            .map_err(VgpuError::Memory)?;
        let memory = VgpuMemory::new(region)?;
        let resource_policy = if params.recycle_resource_ids {
            IdPolicy::Recycle
        } else {
            IdPolicy::Monotonic
        };
        info!(
            "vgpu started: {:#x} bytes of shared memory, {} capsets",
            config.memory_size, config.num_capsets
        );
        Ok(VgpuDevice {
            config,
            params,
            transport,
            share,
            contexts: ContextRegistry::new(),
            memory,
            resource_ids: Mutex::new(IdAllocator::new(resource_policy)),
            fence_ids: Mutex::new(IdAllocator::new(IdPolicy::Monotonic)),
            capsets: Mutex::new(None),
        })
    }

    /// Tears down every context that is still alive.
    pub fn shutdown(&self) {
        let contexts = self.contexts.drain();
        if !contexts.is_empty() {
            warn!("vgpu stopping with {} live contexts", contexts.len());
        }
        for context in contexts {
            self.teardown_context(&context);
        }
        info!("vgpu stopped");
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn params(&self) -> &VgpuParameters {
        &self.params
    }

    pub fn memory(&self) -> &VgpuMemory {
        &self.memory
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    /// Answers a `VIRTGPU_PARAM_*` query from the capabilities the device reported.
    pub fn get_param(&self, param: u32) -> VgpuResult<bool> {
        match param {
            VIRTGPU_PARAM_3D_FEATURES..=VIRTGPU_PARAM_SUPPORTED_CAPSET_IDS => {
                Ok(self.config.capabilities & (1 << (param - 1)) != 0)
            }
            _ => Err(VgpuError::InvalidParameter("unknown param")),
        }
    }

    /// Queries the host for its capsets once and caches the answer.
    pub fn capset_infos(&self) -> VgpuResult<Arc<Vec<CapsetInfo>>> {
        if let Some(infos) = &*self.capsets.lock() {
            return Ok(Arc::clone(infos));
        }

        let mut infos = Vec::with_capacity(self.config.num_capsets as usize);
        for capset_index in 0..self.config.num_capsets {
            let cmd = virtio_gpu_get_capset_info {
                hdr: virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_GET_CAPSET_INFO, 0, 0),
                capset_index,
                padding: 0,
            };
            let response = self.round_trip(
                QueueId::Control,
                PendingCommand::new(&cmd),
                std::mem::size_of::<virtio_gpu_resp_capset_info>(),
                VIRTIO_GPU_RESP_OK_CAPSET_INFO,
            )?;
            let (info, _) = virtio_gpu_resp_capset_info::read_from_prefix(&response)
                .map_err(|_| VgpuError::ShortResponse("VIRTIO_GPU_CMD_GET_CAPSET_INFO"))?;
            debug!(
                "capset {}: id {} version {} size {}",
                capset_index, info.capset_id, info.capset_max_version, info.capset_max_size
            );
            infos.push(CapsetInfo {
                id: info.capset_id,
                max_version: info.capset_max_version,
                max_size: info.capset_max_size,
            });
        }

        // A concurrent query may have won the race. Both answers are identical.
        let infos = Arc::new(infos);
        *self.capsets.lock() = Some(Arc::clone(&infos));
        Ok(infos)
    }

    /// Bitmask with bit `id` set for every capset the host offers.
    pub fn supported_capset_ids(&self) -> VgpuResult<u64> {
        Ok(self
            .capset_infos()?
            .iter()
            .filter(|info| info.id < 64)
            .fold(0, |mask, info| mask | (1 << info.id)))
    }

    /// Copies the capset data for `capset_id` into `out`, which must be exactly the capset's
    /// advertised size. Returns the number of bytes copied.
    pub fn get_caps(&self, capset_id: u32, version: u32, out: &mut [u8]) -> VgpuResult<usize> {
        let info = self
            .capset_infos()?
            .iter()
            .find(|info| info.id == capset_id && info.max_version >= version)
            .copied()
            .ok_or(VgpuError::InvalidCapset {
                id: capset_id,
                version,
            })?;
        if out.len() != info.max_size as usize {
            return Err(VgpuError::BufferSizeMismatch {
                expected: info.max_size as usize,
                actual: out.len(),
            });
        }

        let cmd = virtio_gpu_get_capset {
            hdr: virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_GET_CAPSET, 0, 0),
            capset_id,
            capset_version: version,
        };
        let hdr_len = std::mem::size_of::<virtio_gpu_ctrl_hdr>();
        let response = self.round_trip(
            QueueId::Control,
            PendingCommand::new(&cmd),
            hdr_len + out.len(),
            VIRTIO_GPU_RESP_OK_CAPSET,
        )?;
        let data = &response[hdr_len..];
        out[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    /// Creates the context of process `key`.
    pub fn create_context(&self, key: ContextKey, params: ContextParams) -> VgpuResult<()> {
        if params.num_rings > MAX_RINGS {
            return Err(VgpuError::InvalidParameter("too many rings"));
        }
        self.contexts.create(key, params)?;

        let cmd = virtio_gpu_ctx_create::new(
            virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_CTX_CREATE, key, 0),
            params.capset_id & VIRTIO_GPU_CONTEXT_INIT_CAPSET_ID_MASK,
            &self.params.debug_name,
        );
        if let Err(e) = self.submit(QueueId::Control, PendingCommand::new(&cmd)) {
            self.contexts.remove(key);
            return Err(e);
        }
        info!("created context {} with capset {}", key, params.capset_id);
        Ok(())
    }

    /// Destroys the context of process `key` along with everything it owns.
    pub fn destroy_context(&self, key: ContextKey) -> VgpuResult<()> {
        let context = self
            .contexts
            .remove(key)
            .ok_or(VgpuError::InvalidContext(key))?;
        self.teardown_context(&context);
        Ok(())
    }

    pub fn on_process_event(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Created(_) => {}
            ProcessEvent::Exited(key) => {
                if let Some(context) = self.contexts.remove(key) {
                    info!("process {} exited with a live context", key);
                    self.teardown_context(&context);
                }
            }
        }
    }

    /// Creates a 3d resource. Returns its id, which is also the handle given to the client.
    pub fn create_resource(&self, key: ContextKey, create: &ResourceCreate3D) -> VgpuResult<u32> {
        let context = self.context(key)?;
        let block = if create.needs_backing() {
            Some(self.memory.allocate(self.params.page_align(create.size)?)?)
        } else {
            None
        };
        let resource_id = self.next_resource_id()?;

        let cmd = virtio_gpu_resource_create_3d {
            hdr: virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_RESOURCE_CREATE_3D, key, self.next_fence()),
            resource_id,
            target: create.target,
            format: create.format,
            bind: create.bind,
            width: create.width,
            height: create.height,
            depth: create.depth,
            array_size: create.array_size,
            last_level: create.last_level,
            nr_samples: create.nr_samples,
            flags: create.flags,
            padding: 0,
        };
        if let Err(e) = self.submit(QueueId::Command, PendingCommand::new(&cmd)) {
            self.release_resource_id(resource_id);
            return Err(e);
        }

        let attached = match &block {
            Some(block) => self.attach_backing(key, resource_id, block.physical_address(), block.size()),
            None => Ok(()),
        }
        .and_then(|_| self.ctx_resource(VIRTIO_GPU_CMD_CTX_ATTACH_RESOURCE, key, resource_id));
        if let Err(e) = attached {
            self.unref(key, resource_id);
            return Err(e);
        }

        let (kind, backing) = match block {
            Some(block) => (ResourceKind::Buffer, Backing::Arena(block)),
            None => (ResourceKind::Placeholder, Backing::None),
        };
        debug!(
            "context {} created resource {} ({:?})",
            key, resource_id, kind
        );
        self.register(
            &context,
            Arc::new(Resource::new(resource_id, kind, backing, ResourceState::Idle)),
        )?;
        Ok(resource_id)
    }

    /// Creates a blob resource whose memory the host places.
    ///
    /// A mappable blob is busy until the host reports where it mapped the blob.
    pub fn create_blob_resource(
        &self,
        key: ContextKey,
        create: &ResourceCreateBlob,
    ) -> VgpuResult<u32> {
        match create.blob_mem {
            VIRTIO_GPU_BLOB_MEM_HOST3D | VIRTIO_GPU_BLOB_MEM_HOST3D_GUEST => {}
            VIRTIO_GPU_BLOB_MEM_GUEST => return Err(VgpuError::Unsupported("guest blob memory")),
            _ => return Err(VgpuError::InvalidParameter("unknown blob_mem")),
        }
        let context = self.context(key)?;
        let resource_id = self.next_resource_id()?;

        let cmd = virtio_gpu_resource_create_blob {
            hdr: virtio_gpu_ctrl_hdr::new(
                VIRTIO_GPU_CMD_RESOURCE_CREATE_BLOB,
                key,
                self.next_fence(),
            ),
            resource_id,
            blob_mem: create.blob_mem,
            blob_flags: create.blob_flags,
            nr_entries: 0,
            blob_id: create.blob_id,
            size: create.size,
            format: create.format,
            bind: create.bind,
            target: create.target,
            width: create.width,
            height: create.height,
            depth: create.depth,
            array_size: create.array_size,
            last_level: create.last_level,
            nr_samples: create.nr_samples,
            flags: create.flags,
        };
        if let Err(e) = self.submit(QueueId::Command, PendingCommand::new(&cmd)) {
            self.release_resource_id(resource_id);
            return Err(e);
        }
        if let Err(e) = self.ctx_resource(VIRTIO_GPU_CMD_CTX_ATTACH_RESOURCE, key, resource_id) {
            self.unref(key, resource_id);
            return Err(e);
        }

        let mappable = create.blob_flags & VIRTIO_GPU_BLOB_FLAG_USE_MAPPABLE != 0;
        let state = if mappable {
            ResourceState::Busy
        } else {
            ResourceState::Idle
        };
        let resource = Arc::new(Resource::new(
            resource_id,
            ResourceKind::Blob { mappable },
            Backing::None,
            state,
        ));
        // Registered before the map is sent so the completion can find it.
        self.register(&context, Arc::clone(&resource))?;

        if mappable {
            let fence_id = self.next_fence();
            resource.signal().mark_busy(fence_id);
            let cmd = virtio_gpu_resource_map_blob {
                hdr: virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_RESOURCE_MAP_BLOB, key, fence_id),
                resource_id,
                padding: 0,
                offset: 0,
            };
            let pending = PendingCommand::new(&cmd)
                .with_response(std::mem::size_of::<virtio_gpu_resp_map_info>())
                .with_resources(vec![resource_id]);
            if let Err(e) = self.submit(QueueId::Command, pending) {
                if let Some(resource) = context.resources().remove(resource_id) {
                    self.teardown_resource(key, &resource);
                }
                return Err(e);
            }
        }
        debug!(
            "context {} created blob {} (mappable: {})",
            key, resource_id, mappable
        );
        Ok(resource_id)
    }

    /// Releases resource `id` of context `key`, on the host and locally.
    pub fn close_resource(&self, key: ContextKey, id: u32) -> VgpuResult<()> {
        let context = self.context(key)?;
        let resource = context
            .resources()
            .remove(id)
            .ok_or(VgpuError::InvalidResource { ctx: key, id })?;
        self.teardown_resource(key, &resource);
        Ok(())
    }

    /// Shares the memory of resource `id` into process `key` and returns its user address.
    ///
    /// Repeated calls return the same address. A mappable blob whose map is still in flight is
    /// waited on first.
    pub fn map_resource(&self, key: ContextKey, id: u32) -> VgpuResult<u64> {
        let resource = self.resource(key, id)?;
        if resource.kind() == (ResourceKind::Blob { mappable: true })
            && resource.share_source().is_none()
            && resource.wait(WaitMode::Timeout(self.params.wait_timeout())) == ResourceState::Busy
        {
            return Err(VgpuError::Timeout("blob mapping"));
        }
        let source = resource.share_source().ok_or(VgpuError::NotMappable(id))?;
        resource
            .share_with(|| self.share.share(key, source))
            .map_err(VgpuError::Share)
    }

    /// Reports whether resource `id` is idle, blocking up to the configured timeout unless
    /// `nowait` is set.
    pub fn wait_resource(&self, key: ContextKey, id: u32, nowait: bool) -> VgpuResult<ResourceState> {
        let mode = if nowait {
            WaitMode::NoWait
        } else {
            WaitMode::Timeout(self.params.wait_timeout())
        };
        self.wait_resource_with(key, id, mode)
    }

    /// Like `wait_resource` with an explicit mode. A blocking wait that ends busy is a timeout.
    pub fn wait_resource_with(
        &self,
        key: ContextKey,
        id: u32,
        mode: WaitMode,
    ) -> VgpuResult<ResourceState> {
        let resource = self.resource(key, id)?;
        match (mode, resource.wait(mode)) {
            (WaitMode::NoWait, state) => Ok(state),
            (_, ResourceState::Idle) => Ok(ResourceState::Idle),
            (_, ResourceState::Busy) => Err(VgpuError::Timeout("resource")),
        }
    }

    /// Sends a command buffer to the host on a fresh fence.
    pub fn submit_command(&self, key: ContextKey, exec: &ExecBuffer) -> VgpuResult<SubmitReceipt> {
        let context = self.context(key)?;
        if exec.flags & VIRTGPU_EXECBUF_RING_IDX != 0 && exec.ring_idx >= context.params().num_rings
        {
            return Err(VgpuError::InvalidParameter("ring_idx out of range"));
        }
        if exec.flags & VIRTGPU_EXECBUF_FENCE_FD_IN != 0 {
            let in_fence = exec
                .in_fence
                .as_ref()
                .ok_or(VgpuError::InvalidParameter("missing in-fence"))?;
            if !in_fence.wait(self.params.fence_timeout()) {
                return Err(VgpuError::Timeout("in-fence"));
            }
        }
        let size = u32::try_from(exec.command.len())
            .map_err(|_| VgpuError::InvalidParameter("command too large"))?;

        let block = self.memory.allocate(self.params.page_align(size.into())?)?;
        block.write(0, exec.command)?;

        let fence_id = self.next_fence();
        let mut hdr = virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_SUBMIT_3D, key, fence_id);
        if exec.flags & VIRTGPU_EXECBUF_RING_IDX != 0 {
            hdr = hdr.with_ring_idx(exec.ring_idx as u8);
        }
        let cmd = virtio_gpu_cmd_submit {
            hdr,
            size,
            padding: 0,
        };
        let out_fence = (exec.flags & VIRTGPU_EXECBUF_FENCE_FD_OUT != 0)
            .then(|| Arc::new(FenceEvent::new(fence_id)));
        let mut pending = PendingCommand::new(&cmd)
            .with_payload(block, size.into())
            .with_resources(exec.resource_ids.to_vec());
        if let Some(out_fence) = &out_fence {
            pending = pending.with_out_fence(Arc::clone(out_fence));
        }

        let changed = context.resources().mark_busy(exec.resource_ids, fence_id);
        if let Err(e) = self.submit(QueueId::Command, pending) {
            context.resources().revert_busy(fence_id, &changed);
            return Err(e);
        }
        debug!(
            "context {} submitted {} bytes on fence {} touching {:?}",
            key, size, fence_id, exec.resource_ids
        );
        Ok(SubmitReceipt {
            fence_id,
            out_fence,
        })
    }

    pub fn transfer_to_host(&self, key: ContextKey, transfer: &Transfer3D) -> VgpuResult<u64> {
        self.transfer(VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D, key, transfer)
    }

    pub fn transfer_from_host(&self, key: ContextKey, transfer: &Transfer3D) -> VgpuResult<u64> {
        self.transfer(VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D, key, transfer)
    }

    fn transfer(&self, type_: u32, key: ContextKey, transfer: &Transfer3D) -> VgpuResult<u64> {
        let context = self.context(key)?;
        let id = transfer.resource_id;
        if context.resources().find(id).is_none() {
            return Err(VgpuError::InvalidResource { ctx: key, id });
        }
        let fence_id = self.next_fence();
        let cmd = virtio_gpu_transfer_host_3d {
            hdr: virtio_gpu_ctrl_hdr::new(type_, key, fence_id),
            box_: transfer.box_,
            offset: transfer.offset,
            resource_id: id,
            level: transfer.level,
            stride: transfer.stride,
            layer_stride: transfer.layer_stride,
        };
        let changed = context.resources().mark_busy(&[id], fence_id);
        if let Err(e) = self.submit(
            QueueId::Command,
            PendingCommand::new(&cmd).with_resources(vec![id]),
        ) {
            context.resources().revert_busy(fence_id, &changed);
            return Err(e);
        }
        Ok(fence_id)
    }

    /// Allocates zeroed arena memory outside of any resource and shares it into process `key`.
    pub fn allocate_memory(&self, key: ContextKey, size: u64) -> VgpuResult<u64> {
        let context = self.context(key)?;
        let block = self.memory.allocate(self.params.page_align(size)?)?;
        let mapping = self.share_block(key, &block, block.size())?;
        self.keep_allocation(&context, SharedAllocation::new(mapping, block))
    }

    pub fn free_memory(&self, key: ContextKey, user_address: u64) -> VgpuResult<()> {
        let context = self.context(key)?;
        context
            .take_allocation(user_address)
            .ok_or(VgpuError::InvalidParameter("no allocation at address"))?;
        Ok(())
    }

    /// Shrinks an allocation in place and shares it again at its new size. Returns the new user
    /// address. On failure the allocation is left as it was.
    pub fn shrink_memory(&self, key: ContextKey, user_address: u64, new_size: u64) -> VgpuResult<u64> {
        let context = self.context(key)?;
        let new_size = self.params.page_align(new_size)?;
        let (mapping, mut block) = context
            .take_allocation(user_address)
            .ok_or(VgpuError::InvalidParameter("no allocation at address"))?
            .into_parts();
        let reshared = block
            .check_shrink(new_size)
            .and_then(|()| self.share_block(key, &block, new_size));
        let new_mapping = match reshared {
            Ok(new_mapping) => new_mapping,
            Err(e) => {
                self.keep_allocation(&context, SharedAllocation::new(mapping, block))?;
                return Err(e);
            }
        };
        // The old alias must be gone before its tail returns to the arena.
        drop(mapping);
        if let Err(e) = block.shrink(new_size) {
            error!("failed to shrink allocation at {:#x}: {}", user_address, e);
            self.keep_allocation(&context, SharedAllocation::new(new_mapping, block))?;
            return Err(e);
        }
        self.keep_allocation(&context, SharedAllocation::new(new_mapping, block))
    }

    /// Shares the first `size` bytes of `block` into process `key`.
    fn share_block(
        &self,
        key: ContextKey,
        block: &MemoryBlock,
        size: u64,
    ) -> VgpuResult<Box<dyn UserMapping>> {
        self.share
            .share(
                key,
                ShareSource {
                    virtual_address: Some(block.virtual_address()),
                    physical_address: block.physical_address(),
                    size,
                },
            )
            .map_err(VgpuError::Share)
    }

    /// Tracks `allocation` in `context` and returns its user address. Fails, releasing the
    /// allocation, if the context was destroyed meanwhile.
    fn keep_allocation(
        &self,
        context: &Arc<Context>,
        allocation: SharedAllocation,
    ) -> VgpuResult<u64> {
        let user_address = allocation.user_address();
        context.insert_allocation(allocation);
        if !self.is_live(context) {
            drop(context.take_allocation(user_address));
            return Err(VgpuError::InvalidContext(context.key()));
        }
        Ok(user_address)
    }

    /// Handles a command the host has finished with.
    pub fn process_completion(&self, mut command: PendingCommand) {
        let fence_id = command.fence_id();
        debug!("completed {:?}", command);

        if let Some(reply) = command.take_reply() {
            reply.fulfill(command.take_response());
            return;
        }

        match command.command_type() {
            VIRTIO_GPU_CMD_SUBMIT_3D => {
                if let Some(context) = self.contexts.find(command.ctx_id()) {
                    context
                        .resources()
                        .mark_idle(command.resource_ids(), fence_id);
                }
                if let Some(out_fence) = command.take_out_fence() {
                    out_fence.signal();
                }
            }
            VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D | VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D => {
                match self.contexts.find(command.ctx_id()) {
                    Some(context) => {
                        context
                            .resources()
                            .mark_idle(command.resource_ids(), fence_id);
                    }
                    None => debug!("transfer completed for gone context {}", command.ctx_id()),
                }
            }
            VIRTIO_GPU_CMD_RESOURCE_MAP_BLOB => self.complete_map(&command),
            _ => {}
        }
        // Dropping the command returns any command buffer to the arena.
    }

    fn complete_map(&self, command: &PendingCommand) {
        let ctx = command.ctx_id();
        let Some(&id) = command.resource_ids().first() else {
            return;
        };
        let Some(resource) = self
            .contexts
            .find(ctx)
            .and_then(|context| context.resources().find(id))
        else {
            debug!("map completed for gone resource {} of context {}", id, ctx);
            return;
        };
        match virtio_gpu_resp_map_info::read_from_prefix(command.response()) {
            Ok((info, _)) if info.hdr.type_ == VIRTIO_GPU_RESP_OK_MAP_INFO => {
                resource.set_host_range(info.gpa, info.size);
            }
            Ok((info, _)) => error!(
                "failed to map blob {}: host answered {}",
                id,
                virtio_gpu_cmd_str(info.hdr.type_)
            ),
            Err(_) => error!("failed to map blob {}: short response", id),
        }
        resource.signal().mark_idle(command.fence_id());
    }

    fn context(&self, key: ContextKey) -> VgpuResult<Arc<Context>> {
        self.contexts
            .find(key)
            .ok_or(VgpuError::InvalidContext(key))
    }

    fn resource(&self, key: ContextKey, id: u32) -> VgpuResult<Arc<Resource>> {
        self.context(key)?
            .resources()
            .find(id)
            .ok_or(VgpuError::InvalidResource { ctx: key, id })
    }

    /// Adds `resource` to `context`, undoing it if the context was destroyed meanwhile.
    fn register(&self, context: &Arc<Context>, resource: Arc<Resource>) -> VgpuResult<()> {
        let key = context.key();
        let id = resource.id();
        if !context.resources().insert(Arc::clone(&resource)) {
            resource.release_memory();
            return Err(VgpuError::Arena(resources::Error::InternalInvariant(format!(
                "resource id {} issued twice",
                id
            ))));
        }
        if !self.is_live(context) {
            if let Some(resource) = context.resources().remove(id) {
                self.teardown_resource(key, &resource);
            }
            return Err(VgpuError::InvalidContext(key));
        }
        Ok(())
    }

    /// True while `context` is the registered context of its process.
    fn is_live(&self, context: &Arc<Context>) -> bool {
        self.contexts
            .find(context.key())
            .map_or(false, |live| Arc::ptr_eq(&live, context))
    }

    fn teardown_context(&self, context: &Context) {
        let key = context.key();
        for resource in context.resources().drain() {
            self.teardown_resource(key, &resource);
        }
        let allocations = context.drain_allocations();
        debug!("context {} released {} allocations", key, allocations.len());
        drop(allocations);

        let cmd = virtio_gpu_ctx_destroy {
            hdr: virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_CTX_DESTROY, key, 0),
        };
        if let Err(e) = self.submit(QueueId::Control, PendingCommand::new(&cmd)) {
            error!("failed to destroy context {} on the host: {}", key, e);
        }
        info!("destroyed context {}", key);
    }

    /// Releases a resource already removed from its registry. Failures are logged and skipped.
    fn teardown_resource(&self, key: ContextKey, resource: &Resource) {
        let id = resource.id();
        if let Err(e) = self.ctx_resource(VIRTIO_GPU_CMD_CTX_DETACH_RESOURCE, key, id) {
            error!("failed to detach resource {}: {}", id, e);
        }
        if resource.has_arena_backing() {
            let cmd = virtio_gpu_resource_detach_backing {
                hdr: virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING, key, 0),
                resource_id: id,
                padding: 0,
            };
            if let Err(e) = self.submit(QueueId::Command, PendingCommand::new(&cmd)) {
                error!("failed to detach backing of resource {}: {}", id, e);
            }
        }
        if resource.has_host_range() {
            let cmd = virtio_gpu_resource_unmap_blob {
                hdr: virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_RESOURCE_UNMAP_BLOB, key, 0),
                resource_id: id,
                padding: 0,
            };
            if let Err(e) = self.submit(QueueId::Command, PendingCommand::new(&cmd)) {
                error!("failed to unmap blob {}: {}", id, e);
            }
        }
        resource.release_memory();
        self.unref(key, id);
    }

    fn attach_backing(&self, key: ContextKey, id: u32, gpa: u64, size: u64) -> VgpuResult<()> {
        let size = u32::try_from(size)
            .map_err(|_| VgpuError::InvalidParameter("backing too large"))?;
        let cmd = virtio_gpu_resource_attach_backing {
            hdr: virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING, key, 0),
            resource_id: id,
            nr_entries: 1,
            gpa,
            size,
        };
        self.submit(QueueId::Command, PendingCommand::new(&cmd))
    }

    fn ctx_resource(&self, type_: u32, key: ContextKey, id: u32) -> VgpuResult<()> {
        let cmd = virtio_gpu_ctx_resource {
            hdr: virtio_gpu_ctrl_hdr::new(type_, key, 0),
            resource_id: id,
            padding: 0,
        };
        self.submit(QueueId::Command, PendingCommand::new(&cmd))
    }

    /// Drops the host's reference to resource `id` and retires the id.
    fn unref(&self, key: ContextKey, id: u32) {
        let cmd = virtio_gpu_resource_unref {
            hdr: virtio_gpu_ctrl_hdr::new(VIRTIO_GPU_CMD_RESOURCE_UNREF, key, 0),
            resource_id: id,
            padding: 0,
        };
        if let Err(e) = self.submit(QueueId::Command, PendingCommand::new(&cmd)) {
            error!("failed to unref resource {}: {}", id, e);
        }
        self.release_resource_id(id);
    }

    fn submit(&self, queue: QueueId, command: PendingCommand) -> VgpuResult<()> {
        self.transport
            .submit(queue, command)
            .map_err(|e| VgpuError::Transport {
                command: e.command.name(),
                error: e.error,
            })
    }

    /// Submits `command` and blocks until the host replies with `expected`.
    fn round_trip(
        &self,
        queue: QueueId,
        command: PendingCommand,
        response_len: usize,
        expected: u32,
    ) -> VgpuResult<Vec<u8>> {
        let name = command.name();
        let (promise, waitable) = create_promise_and_waitable();
        self.submit(
            queue,
            command.with_response(response_len).with_reply(promise),
        )?;
        let response = match waitable.wait(self.params.reply_timeout()) {
            Ok(response) => response,
            Err(WaitError::TimedOut) => return Err(VgpuError::Timeout(name)),
            Err(WaitError::Abandoned) => {
                warn!("{} was dropped without a reply", name);
                return Err(VgpuError::Transport {
                    command: name,
                    error: anyhow!("command dropped without a reply"),
                });
            }
        };
        let hdr = response_header(&response).ok_or(VgpuError::ShortResponse(name))?;
        if hdr.type_ != expected {
            return Err(VgpuError::ResponseMismatch {
                command: name,
                expected,
                actual: hdr.type_,
            });
        }
        Ok(response)
    }

    fn next_fence(&self) -> u64 {
        self.fence_ids.lock().next_fresh()
    }

    fn next_resource_id(&self) -> VgpuResult<u32> {
        let id = self.resource_ids.lock().next_id();
        u32::try_from(id).map_err(|_| VgpuError::Unsupported("resource ids exhausted"))
    }

    fn release_resource_id(&self, id: u32) {
        self.resource_ids.lock().release(id.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backing_rules() {
        let placeholder = ResourceCreate3D {
            bind: PIPE_BIND_CUSTOM,
            size: 8,
            ..Default::default()
        };
        assert!(!placeholder.needs_backing());
        let copy_source = ResourceCreate3D {
            size: 1,
            ..Default::default()
        };
        assert!(!copy_source.needs_backing());
        let buffer = ResourceCreate3D {
            target: 2,
            bind: PIPE_BIND_CUSTOM,
            size: 8,
            ..Default::default()
        };
        assert!(buffer.needs_backing());
        assert!(ResourceCreate3D::default().needs_backing());
    }
}
