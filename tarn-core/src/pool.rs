// vim: tw=80
//! Pool-side collaborator boundary
//!
//! The driver never calls back into the pool synchronously: everything it
//! needs to tell the pool travels either through flags on the
//! [`Device`](crate::vdev::Device) record or through the fire-and-forget
//! methods here.

#[cfg(test)] use mockall::automock;

use crate::types::*;

/// Kinds of deferred work this layer may request from the pool.
///
/// Requests are fire-and-forget and are coalesced by the pool's async task
/// machinery; requesting the same kind twice before it runs is harmless.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AsyncTask {
    /// Close and remove a device whose provider has departed.
    Remove,
    /// Rewrite the cached pool configuration.
    ConfigUpdate,
}

/// The storage pool, as visible from the leaf driver
#[cfg_attr(test, automock)]
pub trait Pool: Send + Sync {
    /// The pool's on-disk identity.
    fn guid(&self) -> Guid;

    /// True while an existing pool configuration is being reloaded, as
    /// opposed to devices being added to a new or running pool.
    fn loading(&self) -> bool;

    /// True while this pool is the new half of an in-progress split.
    fn splitting(&self) -> bool;

    /// True if the pool is opened read-write, in which case providers must be
    /// opened for writing too.
    fn writeable(&self) -> bool;

    /// Queue deferred work.  May be called from any context, including I/O
    /// completion.
    fn request_async(&self, task: AsyncTask);

    /// Post a fault event for the device identified by `guid` to the pool's
    /// diagnostics engine.
    fn post_fault(&self, guid: Guid);

    /// Does the calling context already hold the pool configuration lock as
    /// writer?
    fn config_held_as_writer(&self) -> bool;

    /// Acquire the configuration lock as writer.  The topology lock must not
    /// be held; see the lock ordering notes in
    /// [`vdev_disk`](crate::vdev_disk).
    fn config_enter_writer(&self);

    /// Release the configuration lock.
    fn config_exit(&self);
}
