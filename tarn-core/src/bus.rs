// vim: tw=80
//! Block-storage transport boundary
//!
//! The transport framework itself (provider enumeration, request queuing,
//! dispatch to hardware) lives outside this crate.  [`Bus`] is the seam: the
//! production transport, the mock used by unit tests, and the RAM-backed
//! transport used by the functional tests all implement it.

#[cfg(test)] use mockall::automock;
use std::{
    fmt,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicI32, Ordering}
    }
};

use crate::types::*;

/// Largest byte count the transport will move in a single request.  Larger
/// transfers must be split by the caller.
pub const MAX_TRANSFER: usize = 128 * 1024;

/// Name of the physical-path provider attribute.
pub const PHYSPATH: &str = "physpath";

#[derive(Debug)]
struct Inner {
    name: String,
    sectorsize: u32,
    mediasize: u64,
    /// Nonzero once the transport has marked the provider as failing.
    error: AtomicI32,
}

/// Shared handle to one block-storage device exposed by the transport.
///
/// Equality is identity: two handles are equal iff they refer to the same
/// underlying device, regardless of name.
#[derive(Clone)]
pub struct Provider(Arc<Inner>);

impl Provider {
    pub fn new<S: Into<String>>(name: S, sectorsize: u32, mediasize: u64)
        -> Self
    {
        Provider(Arc::new(Inner {
            name: name.into(),
            sectorsize,
            mediasize,
            error: AtomicI32::new(0)
        }))
    }

    /// The transport-assigned name.  Stable for the life of the handle, but a
    /// device that departs and returns may reappear under a different name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn sectorsize(&self) -> u32 {
        self.0.sectorsize
    }

    pub fn mediasize(&self) -> u64 {
        self.0.mediasize
    }

    /// The transport's error indicator.  Nonzero means the provider is being
    /// withdrawn and all further I/O will fail.
    pub fn error(&self) -> i32 {
        self.0.error.load(Ordering::Relaxed)
    }

    /// Called by the transport when it begins withdrawing the provider.
    pub fn set_error(&self, error: i32) {
        self.0.error.store(error, Ordering::Relaxed);
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for Provider {
    fn eq(&self, other: &Provider) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Provider {}

/// Primitive request type
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BioCmd {
    Read,
    Write,
    /// Write-cache barrier.  Carries no data payload.
    Flush,
    /// Discard a byte range.  Carries no data payload.
    Delete,
}

/// Data payload of a [`Bio`]
pub enum BioData {
    None,
    Read(IoVecMut),
    Write(IoVec),
}

impl BioData {
    pub fn is_none(&self) -> bool {
        matches!(self, BioData::None)
    }
}

/// A single primitive I/O request.
///
/// The caller's completion token is the future returned by [`Bus::submit`]:
/// the transport delivers exactly one [`Completion`] per submitted `Bio`, on
/// its own completion context.
pub struct Bio {
    pub cmd: BioCmd,
    pub offset: u64,
    pub length: u64,
    pub data: BioData,
}

/// Final status of one [`Bio`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Completion {
    pub result: Result<()>,
    /// Bytes requested but not transferred.
    pub resid: u64,
}

impl Completion {
    pub fn ok() -> Self {
        Completion { result: Ok(()), resid: 0 }
    }

    pub fn error(e: Error) -> Self {
        Completion { result: Err(e), resid: 0 }
    }

    pub fn short(resid: u64) -> Self {
        Completion { result: Ok(()), resid }
    }
}

/// Future delivering a [`Bio`]'s unique completion.
pub type BioFut = Pin<Box<dyn futures::Future<Output = Completion> + Send>>;

/// Operations this layer requires of the block-storage transport
#[cfg_attr(test, automock)]
pub trait Bus: Send + Sync {
    /// Look up a provider by its transport name.
    fn provider_by_name(&self, name: &str) -> Option<Provider>;

    /// Enumerate every provider the transport currently exposes.  This
    /// driver exports no providers of its own, so the result never includes
    /// anything it created.
    fn providers(&self) -> Vec<Provider>;

    /// Adjust the caller's access to `pp` by the given read, write, and
    /// exclusive deltas.  Fails if the requested mode conflicts with another
    /// opener, or if the provider is being withdrawn.
    fn access(&self, pp: &Provider, dr: i32, dw: i32, de: i32) -> Result<()>;

    /// Submit one primitive request against `pp`.
    fn submit(&self, pp: &Provider, bio: Bio) -> BioFut;

    /// Metadata-only fetch of `pp`'s physical path attribute.
    fn physpath(&self, pp: &Provider) -> Result<String>;
}

// LCOV_EXCL_STOP
