//! Stub for platforms without shared memory support.
//!
//! Mirrors the interface of the unix `shm` module so the pool compiles
//! everywhere; requesting shared backing reports
//! [`PoolError::ShmUnsupported`].

#![allow(dead_code)]

use std::convert::Infallible;
use std::ptr::NonNull;

use crate::error::PoolError;

pub(crate) fn page_size() -> usize {
    4096
}

pub(crate) struct ShmRegion {
    never: Infallible,
}

impl ShmRegion {
    pub(crate) fn create(
        _len: usize,
        _application_group_id: Option<&str>,
    ) -> Result<Self, PoolError> {
        Err(PoolError::ShmUnsupported)
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        match self.never {}
    }

    pub(crate) fn len(&self) -> usize {
        match self.never {}
    }
}
