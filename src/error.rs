// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use remain::sorted;
use thiserror::Error;

use crate::context::ContextKey;

/// An error produced by a vgpu operation.
#[sorted]
#[derive(Error, Debug)]
pub enum VgpuError {
    #[error("arena allocation failed: {0}")]
    Arena(resources::Error),
    #[error("caller buffer holds {actual} bytes but capset needs {expected}")]
    BufferSizeMismatch { expected: usize, actual: usize },
    #[error("a context already exists for process {0}")]
    ContextExists(ContextKey),
    #[error("no capset with id {id} supports version {version}")]
    InvalidCapset { id: u32, version: u32 },
    #[error("no context for process {0}")]
    InvalidContext(ContextKey),
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("context {ctx} has no resource {id}")]
    InvalidResource { ctx: ContextKey, id: u32 },
    #[error("host-visible memory access failed: {0:#}")]
    Memory(anyhow::Error),
    #[error("resource {0} has no memory to map")]
    NotMappable(u32),
    #[error("host answered {command} with {actual:#x}, expected {expected:#x}")]
    ResponseMismatch {
        command: &'static str,
        expected: u32,
        actual: u32,
    },
    #[error("failed to share memory with the process: {0:#}")]
    Share(anyhow::Error),
    #[error("response to {0} was too short")]
    ShortResponse(&'static str),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("failed to submit {command}: {error:#}")]
    Transport {
        command: &'static str,
        error: anyhow::Error,
    },
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl From<resources::Error> for VgpuError {
    fn from(e: resources::Error) -> Self {
        VgpuError::Arena(e)
    }
}

pub type VgpuResult<T> = std::result::Result<T, VgpuError>;
