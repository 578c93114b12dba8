// vim: tw=80
//! Virtual device records
//!
//! A [`Device`] is one logical disk slot inside a pool, independent of which
//! provider currently backs it.  The pool creates and destroys these; the
//! driver in [`vdev_disk`](crate::vdev_disk) fills in the binding and the
//! capability/status flags.

use atomic_enum::atomic_enum;
use std::{
    path::PathBuf,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, Ordering}
    }
};

use crate::{
    pool::Pool,
    types::*,
    vdev_disk::Consumer,
};

/// Health of a device slot as last recorded by the pool.
///
/// The driver only ever consults [`DeviceState::Unknown`], which marks a slot
/// that has never been successfully opened; the rest exist for the pool's
/// bookkeeping.
#[atomic_enum]
#[derive(Eq, PartialEq)]
pub enum DeviceState {
    /// Never opened since the pool came up.
    Unknown,
    Closed,
    Healthy,
    Faulted,
}

/// One logical disk slot inside a pool
///
/// The sticky capability flags are monotonic once set and reset only by a
/// successful open, so each physical (re)open gets a fresh chance to detect
/// capabilities.
pub struct Device {
    pool: Arc<dyn Pool>,
    guid: Guid,
    /// Pathname by which the pool expects to find this device.  Rewritten
    /// when an identity scan locates the device under a new name.
    path: Mutex<Option<PathBuf>>,
    /// Physical location of the backing provider, if the transport reports
    /// one.
    physpath: Mutex<Option<String>>,
    /// State this slot held before the current open attempt.
    prev_state: AtomicDeviceState,
    /// The provider cannot flush its write cache; don't ask again.
    nowritecache: AtomicBool,
    /// The provider cannot discard; don't ask again.
    notrim: AtomicBool,
    /// The provider has departed; the pool should close this slot.
    remove_wanted: AtomicBool,
    /// A transient error suggested closing this slot, without forcing
    /// removal.
    delayed_close: AtomicBool,
    binding: Mutex<Option<Arc<Consumer>>>,
}

impl Device {
    pub fn new(
        pool: Arc<dyn Pool>,
        guid: Guid,
        path: Option<PathBuf>,
        prev_state: DeviceState
    ) -> Arc<Self>
    {
        Arc::new(Device {
            pool,
            guid,
            path: Mutex::new(path),
            physpath: Mutex::new(None),
            prev_state: AtomicDeviceState::new(prev_state),
            nowritecache: AtomicBool::new(false),
            notrim: AtomicBool::new(false),
            remove_wanted: AtomicBool::new(false),
            delayed_close: AtomicBool::new(false),
            binding: Mutex::new(None),
        })
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn pool(&self) -> &Arc<dyn Pool> {
        &self.pool
    }

    pub fn pool_guid(&self) -> Guid {
        self.pool.guid()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().unwrap().clone()
    }

    pub fn set_path(&self, path: PathBuf) {
        *self.path.lock().unwrap() = Some(path);
    }

    pub fn physpath(&self) -> Option<String> {
        self.physpath.lock().unwrap().clone()
    }

    /// Store a new physical path, returning the old one.  The caller is
    /// responsible for freeing the old value under the pool configuration
    /// lock.
    pub(crate) fn replace_physpath(&self, physpath: String) -> Option<String> {
        self.physpath.lock().unwrap().replace(physpath)
    }

    pub fn prev_state(&self) -> DeviceState {
        self.prev_state.load(Ordering::Relaxed)
    }

    pub fn set_prev_state(&self, state: DeviceState) {
        self.prev_state.store(state, Ordering::Relaxed);
    }

    pub fn nowritecache(&self) -> bool {
        self.nowritecache.load(Ordering::Relaxed)
    }

    pub fn set_nowritecache(&self, v: bool) {
        self.nowritecache.store(v, Ordering::Relaxed);
    }

    pub fn notrim(&self) -> bool {
        self.notrim.load(Ordering::Relaxed)
    }

    pub fn set_notrim(&self, v: bool) {
        self.notrim.store(v, Ordering::Relaxed);
    }

    pub fn remove_wanted(&self) -> bool {
        self.remove_wanted.load(Ordering::Relaxed)
    }

    pub fn set_remove_wanted(&self, v: bool) {
        self.remove_wanted.store(v, Ordering::Relaxed);
    }

    /// Set `remove_wanted`, returning its previous value.  Completions race
    /// on this flag; only the winner may signal the pool.
    pub(crate) fn test_and_set_remove_wanted(&self) -> bool {
        self.remove_wanted.swap(true, Ordering::Relaxed)
    }

    pub fn delayed_close(&self) -> bool {
        self.delayed_close.load(Ordering::Relaxed)
    }

    pub fn set_delayed_close(&self, v: bool) {
        self.delayed_close.store(v, Ordering::Relaxed);
    }

    /// The live binding, if this device is open.
    pub fn binding(&self) -> Option<Arc<Consumer>> {
        self.binding.lock().unwrap().clone()
    }

    pub(crate) fn set_binding(&self, cp: Arc<Consumer>) {
        *self.binding.lock().unwrap() = Some(cp);
    }

    pub(crate) fn take_binding(&self) -> Option<Arc<Consumer>> {
        self.binding.lock().unwrap().take()
    }

    pub(crate) fn clear_binding(&self) {
        *self.binding.lock().unwrap() = None;
    }
}
