// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Post-processing filter seam.
//!
//! When the hardware's native decode format differs from the output format
//! the pipeline asked for, a color-conversion/scaling stage is inserted
//! between the decoder and the caller. The stage itself lives outside this
//! crate; the decoder only needs the contract below.

use std::sync::Arc;

use thiserror::Error;

use crate::backend::SurfaceRequest;
use crate::surface_pool::PoolError;
use crate::surface_pool::SurfacePool;
use crate::surface_pool::SurfaceProxy;
use crate::DecodedFormat;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter could not be started")]
    InitFailed,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Color-format conversion / scaling stage.
///
/// A started filter owns the surface pool the decoder writes into, so that
/// decode targets and filter inputs share one set of hardware buffers.
pub trait VideoFilter {
    /// Configures the stage for the decoder's allocation `request` and the
    /// requested output `format`, returning the shared input pool.
    fn start(
        &mut self,
        request: &SurfaceRequest,
        format: DecodedFormat,
    ) -> Result<Arc<SurfacePool>, FilterError>;

    /// Runs one decoded surface through the stage, yielding the converted
    /// output surface.
    fn process(&mut self, input: &SurfaceProxy) -> Result<SurfaceProxy, FilterError>;
}
