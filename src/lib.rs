// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest side control plane of a paravirtualized 3d GPU.
//!
//! Tracks per-process contexts and the resources they own, carves host visible memory out of a
//! shared arena, and relays commands to the host renderer with fence ordered busy/idle tracking.

pub mod command;
pub mod context;
pub mod device;
pub mod error;
pub mod fence;
pub mod memory;
pub mod parameters;
pub mod protocol;
pub mod resource;
pub mod share;
pub mod transport;

pub use crate::command::OutSegment;
pub use crate::command::PendingCommand;
pub use crate::context::ContextKey;
pub use crate::context::ContextParams;
pub use crate::device::CapsetInfo;
pub use crate::device::ExecBuffer;
pub use crate::device::ProcessEvent;
pub use crate::device::ResourceCreate3D;
pub use crate::device::ResourceCreateBlob;
pub use crate::device::SubmitReceipt;
pub use crate::device::Transfer3D;
pub use crate::device::VgpuDevice;
pub use crate::error::VgpuError;
pub use crate::error::VgpuResult;
pub use crate::fence::FenceEvent;
pub use crate::fence::ResourceState;
pub use crate::fence::WaitMode;
pub use crate::memory::HeapMemory;
pub use crate::memory::HeapMemoryProvider;
pub use crate::memory::MemoryProvider;
pub use crate::memory::MemoryRegion;
pub use crate::parameters::DeviceConfig;
pub use crate::parameters::VgpuParameters;
pub use crate::share::ShareMapper;
pub use crate::share::ShareSource;
pub use crate::share::UserMapping;
pub use crate::transport::QueueId;
pub use crate::transport::SubmitError;
pub use crate::transport::Transport;
