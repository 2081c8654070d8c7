// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Definitions and utilities for vgpu related parameters.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::error::VgpuError;
use crate::error::VgpuResult;

pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_FENCE_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_PAGE_SIZE: u64 = 4096;
pub const DEFAULT_DEBUG_NAME: &str = "vgpu";

/// Tunables of the driver, loadable from a JSON configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "kebab-case")]
pub struct VgpuParameters {
    /// How long a blocking resource wait lasts before reporting a timeout.
    pub wait_timeout_ms: u64,
    /// How long a synchronous host round trip may take. `None` waits forever.
    pub reply_timeout_ms: Option<u64>,
    /// How long to wait for a caller supplied in-fence before submitting.
    pub fence_timeout_ms: u64,
    pub page_size: u64,
    pub debug_name: String,
    /// Hand closed resource ids out again. Off by default: a recycled id can alias host state
    /// that is still being migrated.
    pub recycle_resource_ids: bool,
}

impl Default for VgpuParameters {
    fn default() -> Self {
        VgpuParameters {
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            reply_timeout_ms: Some(DEFAULT_REPLY_TIMEOUT_MS),
            fence_timeout_ms: DEFAULT_FENCE_TIMEOUT_MS,
            page_size: DEFAULT_PAGE_SIZE,
            debug_name: DEFAULT_DEBUG_NAME.to_string(),
            recycle_resource_ids: false,
        }
    }
}

impl VgpuParameters {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let params: VgpuParameters = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> VgpuResult<()> {
        if !self.page_size.is_power_of_two() {
            return Err(VgpuError::InvalidParameter(
                "page-size must be a power of two",
            ));
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    /// Rounds `size` up to whole pages. Zero becomes one page.
    pub fn page_align(&self, size: u64) -> VgpuResult<u64> {
        let mask = self.page_size - 1;
        size.max(1)
            .checked_add(mask)
            .map(|size| size & !mask)
            .ok_or(VgpuError::InvalidParameter("size overflows"))
    }
}

/// Layout of the device configuration space.
#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes)]
#[repr(C, packed)]
pub struct virtio_vgpu_config {
    pub staging: u8,
    pub num_queues: u8,
    pub num_capsets: u32,
    pub memory_size: u64,
    pub capabilities: u64,
}

/// What the device reports about itself at start.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub staging: bool,
    pub num_queues: u8,
    pub num_capsets: u32,
    /// Size of the contiguous region to share with the host.
    pub memory_size: u64,
    /// Bit `n - 1` set means parameter `n` is supported.
    pub capabilities: u64,
}

impl DeviceConfig {
    /// Decodes the raw configuration space.
    pub fn from_config_space(bytes: &[u8]) -> VgpuResult<Self> {
        let (config, _) = virtio_vgpu_config::read_from_prefix(bytes)
            .map_err(|_| VgpuError::ShortResponse("device config"))?;
        Ok(DeviceConfig {
            staging: config.staging != 0,
            num_queues: config.num_queues,
            num_capsets: config.num_capsets,
            memory_size: config.memory_size,
            capabilities: config.capabilities,
        })
    }
}
