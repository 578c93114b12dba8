// vim: tw=80
//! Leaf-device driver
//!
//! Binds pool [`Device`]s to block-storage [`Provider`]s, verifying each
//! binding by on-disk identity rather than by name, and translates pool-level
//! I/O into primitive transport requests.  Completions feed error
//! classification back into the pool's recovery machinery: sticky capability
//! downgrades for flush and trim, removal signaling for departed providers.
//!
//! # Lock ordering
//!
//! Two lock domains exist.  The driver-wide topology lock guards the
//! attachment group and every consumer's open-mode counts; attach, detach,
//! identity resolution, and the orphan and attribute handlers all run under
//! it, but label reads and retry sleeps drop it around real I/O.  The
//! per-pool configuration lock belongs to the [`Pool`](crate::pool::Pool)
//! collaborator and must never be acquired while the topology lock is held;
//! [`DiskDriver::attr_changed`] is the one operation that needs both and it
//! releases the topology lock first.  I/O submission and completion take
//! neither lock.

use std::{
    path::PathBuf,
    pin::Pin,
    sync::{
        Arc,
        Mutex,
        Weak,
        atomic::{AtomicI32, Ordering}
    },
    time::Duration,
};

use divbuf::DivBufShared;
use futures::{Future, FutureExt, future};
use futures_locks::MutexGuard;

use crate::{
    bus::{self, Bio, BioCmd, BioData, Bus, Completion, MAX_TRANSFER, Provider},
    label,
    pool::AsyncTask,
    types::*,
    util::*,
    vdev::{Device, DeviceState},
};

/// Smallest transfer alignment the pool will ever use, even on providers with
/// smaller sectors.
const MIN_TRANSFER_SIZE: u32 = 512;

/// Attempts to acquire write access before giving up.
const WRITE_RETRIES: u32 = 5;

const WRITE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Future representing one pool-level I/O operation.
pub type IoFut = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type TopoGuard = MutexGuard<Topology>;

/// Runtime knobs, fixed at driver construction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Tunables {
    /// Complete flush requests immediately instead of issuing them.
    pub flush_disable: bool,
    /// Complete delete requests immediately instead of issuing them.
    pub trim_disable: bool,
}

/// A pool-level operation against an open device
pub enum Op {
    Read { buf: IoVecMut, offset: u64 },
    Write { buf: IoVec, offset: u64 },
    /// Flush the provider's volatile write cache.
    FlushWriteCache,
    /// Discard a byte range.
    Trim { offset: u64, length: u64 },
    /// Any other control request, identified by its raw command code.
    Control(u64),
}

/// What [`DiskDriver::open`] reports back to the pool
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// Usable size of the provider in bytes.
    pub size: u64,
    /// Largest size the provider could grow to.
    pub max_size: u64,
    /// log2 of the smallest supported transfer.
    pub min_alignment: u32,
}

/// Live binding between one [`Device`] and one [`Provider`]
///
/// Exactly one device owns a consumer at a time, and a consumer's existence
/// implies its provider is open for at least read access.
pub struct Consumer {
    provider: Provider,
    /// Open-mode refcounts (read, write, exclusive).  Only mutated with the
    /// topology lock held.
    acr: AtomicI32,
    acw: AtomicI32,
    ace: AtomicI32,
    /// Owning device.  Cleared first during detach, so completions and
    /// orphan events can tell an unbound consumer from a live one.
    device: Mutex<Option<Arc<Device>>>,
}

impl Consumer {
    fn new(provider: Provider) -> Arc<Self> {
        Arc::new(Consumer {
            provider,
            acr: AtomicI32::new(0),
            acw: AtomicI32::new(0),
            ace: AtomicI32::new(0),
            device: Mutex::new(None),
        })
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// The owning device, if this consumer is still bound.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.lock().unwrap().clone()
    }

    fn acw(&self) -> i32 {
        self.acw.load(Ordering::Relaxed)
    }
}

/// The shared grouping node collecting every consumer this driver created.
#[derive(Default)]
struct Group {
    consumers: Vec<Arc<Consumer>>,
}

/// Attachment topology.  At most one group exists at a time, with at most one
/// consumer per provider.
#[derive(Default)]
struct Topology {
    group: Option<Group>,
}

/// Providers are named without the "/dev/" prefix that pool paths carry.
fn provider_name(path: &str) -> &str {
    path.strip_prefix("/dev/").unwrap_or(path)
}

/// The leaf-device driver
///
/// Owns the attachment topology for the life of the process.  All methods are
/// safe to call concurrently.
pub struct DiskDriver {
    bus: Arc<dyn Bus>,
    tunables: Tunables,
    topology: futures_locks::Mutex<Topology>,
}

impl DiskDriver {
    pub fn new(bus: Arc<dyn Bus>, tunables: Tunables) -> Self {
        DiskDriver {
            bus,
            tunables,
            topology: futures_locks::Mutex::new(Topology::default()),
        }
    }

    /// Attach to `pp` on behalf of `dev`, reusing the group's existing
    /// consumer for this provider if there is one.
    async fn attach(&self, mut topo: TopoGuard, pp: &Provider,
                    dev: &Arc<Device>)
        -> (TopoGuard, Result<Arc<Consumer>>)
    {
        tracing::debug!("Attaching to {}", pp.name());
        let existing = topo.group.as_ref()
            .and_then(|g| {
                g.consumers.iter()
                    .find(|cp| cp.provider() == pp)
                    .cloned()
            });
        let cp = match (existing, self.bus.access(pp, 1, 0, 1)) {
            (Some(cp), Ok(())) => {
                tracing::debug!("Used existing consumer for {}", pp.name());
                cp
            },
            (None, Ok(())) => {
                let cp = Consumer::new(pp.clone());
                topo.group.get_or_insert_with(Group::default)
                    .consumers.push(cp.clone());
                tracing::debug!("Created consumer for {}", pp.name());
                cp
            },
            (_, Err(e)) => return (topo, Err(e)),
        };
        cp.acr.fetch_add(1, Ordering::Relaxed);
        cp.ace.fetch_add(1, Ordering::Relaxed);
        *cp.device.lock().unwrap() = Some(dev.clone());

        // Fetch initial physical path information for this device.
        let topo = self.refresh_physpath(topo, &cp, dev).await;
        (topo, Ok(cp))
    }

    /// Drop one open reference to `cp`, destroying the consumer on last close
    /// and the group along with its last consumer.
    ///
    /// Unbinds before releasing, so that this is safe to call from a
    /// different context than the one that attached, even with completions
    /// or a hot-removal notification in flight.
    fn detach(&self, topo: &mut Topology, cp: &Arc<Consumer>) {
        tracing::debug!("Closing access to {}", cp.provider().name());
        if let Some(dev) = cp.device.lock().unwrap().take() {
            dev.clear_binding();
        }
        let _ = self.bus.access(cp.provider(), -1, 0, -1);
        cp.acr.fetch_sub(1, Ordering::Relaxed);
        cp.ace.fetch_sub(1, Ordering::Relaxed);
        // Destroy the consumer on last close.
        if cp.acr.load(Ordering::Relaxed) == 0 &&
            cp.ace.load(Ordering::Relaxed) == 0
        {
            let acw = cp.acw.swap(0, Ordering::Relaxed);
            if acw > 0 {
                let _ = self.bus.access(cp.provider(), 0, -acw, 0);
            }
            tracing::debug!("Destroyed consumer for {}", cp.provider().name());
            let empty = topo.group.as_mut()
                .map(|g| {
                    g.consumers.retain(|c| !Arc::ptr_eq(c, cp));
                    g.consumers.is_empty()
                }).unwrap_or(false);
            // Destroy the group if there are no consumers left.
            if empty {
                tracing::debug!("Destroyed attachment group");
                topo.group = None;
            }
        }
    }

    /// Record/update physical path information for `dev`.
    ///
    /// May drop and reacquire the topology lock: the old path may still be
    /// visible to readers of the pool configuration, so it may only be freed
    /// while the configuration lock is held as writer, and that lock must
    /// never be acquired with the topology lock held.
    async fn refresh_physpath(&self, mut topo: TopoGuard, cp: &Arc<Consumer>,
                              dev: &Arc<Device>)
        -> TopoGuard
    {
        let pp = cp.provider();
        if self.bus.access(pp, 1, 0, 0).is_err() {
            return topo;
        }
        let r = self.bus.physpath(pp);
        let _ = self.bus.access(pp, -1, 0, 0);
        let physpath = match r {
            Ok(physpath) => physpath,
            Err(_) => return topo,
        };
        let old = dev.replace_physpath(physpath);
        dev.pool().request_async(AsyncTask::ConfigUpdate);
        if let Some(old) = old {
            if dev.pool().config_held_as_writer() {
                drop(old);
            } else {
                drop(topo);
                dev.pool().config_enter_writer();
                drop(old);
                dev.pool().config_exit();
                topo = self.topology.lock().await;
            }
        }
        topo
    }

    /// Synchronously read from `pp`, splitting transfers larger than the
    /// transport maximum into sequential sub-requests, each completing before
    /// the next is issued.
    ///
    /// Must be called without the topology lock held.
    async fn read_sync(&self, pp: &Provider, mut buf: IoVecMut, offset: u64)
        -> Result<()>
    {
        let sectorsize = u64::from(pp.sectorsize());
        debug_assert_eq!(offset % sectorsize, 0);
        debug_assert_eq!(buf.len() as u64 % sectorsize, 0);
        let maxio = MAX_TRANSFER as u64 - MAX_TRANSFER as u64 % sectorsize;
        let mut off = offset;
        while !buf.is_empty() {
            let len = (buf.len() as u64).min(maxio);
            let chunk = buf.split_to(len as usize);
            let bio = Bio {
                cmd: BioCmd::Read,
                offset: off,
                length: len,
                data: BioData::Read(chunk),
            };
            self.bus.submit(pp, bio).await.result?;
            off += len;
        }
        Ok(())
    }

    /// Read the identity guids from `pp`'s redundant label slots, stopping at
    /// the first slot that yields both.
    ///
    /// Returns zero guids if no slot decodes.  Must be called without the
    /// topology lock held; blocks the calling task until the reads complete.
    async fn read_guids(&self, pp: &Provider) -> (Guid, Guid) {
        tracing::debug!("Reading guids from {}...", pp.name());
        let mut pguid = Guid::default();
        let mut vguid = Guid::default();
        let psize = p2align(pp.mediasize(), label::LABEL_SIZE);
        if psize < label::LABEL_COUNT as u64 * label::LABEL_SIZE {
            // Too small to carry a full complement of labels.
            return (pguid, vguid);
        }
        let sectorsize = u64::from(pp.sectorsize());
        let size = roundup(label::LABEL_SIZE, sectorsize);
        for l in 0..label::LABEL_COUNT {
            let offset = label::offset(psize, l);
            if offset % sectorsize != 0 {
                continue;
            }
            let dbs = DivBufShared::from(vec![0u8; size as usize]);
            let buf = dbs.try_mut().unwrap();
            if self.read_sync(pp, buf, offset).await.is_err() {
                continue;
            }
            let db = dbs.try_const().unwrap();
            let lr = match label::LabelReader::new(&db[..]) {
                Ok(lr) => lr,
                Err(_) => continue,
            };
            let (p, v) = lr.guids();
            pguid = p;
            vguid = v;
            if !pguid.is_zero() && !vguid.is_zero() {
                break;
            }
        }
        if !pguid.is_zero() && !vguid.is_zero() {
            tracing::debug!("guids for {} are {}:{}", pp.name(), pguid, vguid);
        }
        (pguid, vguid)
    }

    /// Try to attach to the provider named by `dev`'s recorded path.
    ///
    /// With `check_guid`, accept the provider only if its label data carries
    /// the expected guids.
    async fn open_by_path(&self, topo: TopoGuard, dev: &Arc<Device>,
                          check_guid: bool)
        -> (TopoGuard, Option<Arc<Consumer>>)
    {
        let path = match dev.path() {
            Some(path) => path,
            None => return (topo, None),
        };
        let path = path.to_string_lossy().into_owned();
        let pp = match self.bus.provider_by_name(provider_name(&path)) {
            Some(pp) => pp,
            None => return (topo, None),
        };
        tracing::debug!("Found provider by name {}", path);
        let (mut topo, r) = self.attach(topo, &pp, dev).await;
        let cp = match r {
            Ok(cp) => cp,
            Err(_) => return (topo, None),
        };
        if check_guid && is_pow2(u64::from(pp.sectorsize())) &&
            pp.sectorsize() <= label::MAX_SECTOR_SIZE
        {
            drop(topo);
            let (pguid, vguid) = self.read_guids(&pp).await;
            topo = self.topology.lock().await;
            if pguid != dev.pool_guid() || vguid != dev.guid() {
                tracing::debug!(
                    "guid mismatch for provider {}: {}:{} != {}:{}",
                    path, dev.pool_guid(), dev.guid(), pguid, vguid);
                self.detach(&mut topo, &cp);
                return (topo, None);
            } else {
                tracing::debug!("guids match for provider {}", path);
            }
        }
        (topo, Some(cp))
    }

    /// Exhaustively taste every provider the transport knows, attaching to
    /// the first whose label carries `dev`'s identity.  This is the fallback
    /// used when the recorded path no longer names the right device.
    async fn open_by_guids(&self, mut topo: TopoGuard, dev: &Arc<Device>)
        -> (TopoGuard, Option<Arc<Consumer>>)
    {
        let pguid = dev.pool_guid();
        let vguid = dev.guid();
        tracing::debug!("Searching by guids [{}:{}]", pguid, vguid);
        for pp in self.bus.providers() {
            // Probe with a transient read open; attach only on a match.
            if self.bus.access(&pp, 1, 0, 0).is_err() {
                continue;
            }
            drop(topo);
            let guids = self.read_guids(&pp).await;
            topo = self.topology.lock().await;
            let _ = self.bus.access(&pp, -1, 0, 0);
            if guids != (pguid, vguid) {
                continue;
            }
            let (t, r) = self.attach(topo, &pp, dev).await;
            topo = t;
            match r {
                Ok(cp) => {
                    // The disk moved; remember where it is now.
                    let path = format!("/dev/{}", pp.name());
                    dev.set_path(PathBuf::from(&path));
                    tracing::debug!(
                        "Attach by guids [{}:{}] succeeded, provider {}",
                        pguid, vguid, path);
                    return (topo, Some(cp));
                },
                Err(_) => {
                    tracing::warn!("Unable to attach to {}", pp.name());
                    continue;
                }
            }
        }
        tracing::debug!("Search by guids [{}:{}] failed", pguid, vguid);
        (topo, None)
    }

    /// Open `dev`'s backing provider and bind to it.
    ///
    /// Tries the recorded path first, accepting it only if its label carries
    /// the expected identity; then a full identity scan of every provider;
    /// and finally, only for devices that cannot yet have a comparison target
    /// on disk, the recorded path with no identity check at all.
    pub async fn open(&self, dev: &Arc<Device>) -> Result<Geometry> {
        // We must have a pathname, and it must be absolute.
        match dev.path() {
            Some(path) if path.is_absolute() => (),
            _ => return Err(Error::EINVAL),
        }
        dev.clear_binding();

        let topo = self.topology.lock().await;
        // Try using the recorded path for this device, but only accept it if
        // its label data contains the expected guids.
        let (mut topo, mut cp) = self.open_by_path(topo, dev, true).await;
        if cp.is_none() {
            // The device at the recorded path doesn't have the expected
            // guids.  The disks might have merely moved around, so taste all
            // other providers to find one with the right guids.
            let (t, c) = self.open_by_guids(topo, dev).await;
            topo = t;
            cp = c;
        }
        if cp.is_none() &&
            ((dev.prev_state() == DeviceState::Unknown &&
              !dev.pool().loading()) ||
             dev.pool().splitting())
        {
            // This device has never been opened and no existing pool
            // configuration is being loaded (it is being added to a new or
            // existing pool), or the pool is in the process of splitting.
            // Find the provider by its name, ignoring guid mismatches.
            //
            // XXPOLICY: It would be safer to only allow a device that is
            // unlabeled, or labeled but missing guid information, to be
            // opened in this fashion.
            let (t, c) = self.open_by_path(topo, dev, false).await;
            topo = t;
            cp = c;
        }

        let cp = match cp {
            Some(cp) => cp,
            None => {
                tracing::debug!("Provider for {:?} not found", dev.path());
                return Err(Error::ENOENT);
            }
        };
        let pp = cp.provider().clone();
        if pp.sectorsize() > label::MAX_SECTOR_SIZE ||
            !is_pow2(u64::from(pp.sectorsize()))
        {
            tracing::debug!("Provider {} has unsupported sectorsize",
                            pp.name());
            self.detach(&mut topo, &cp);
            return Err(Error::EINVAL);
        }
        if cp.acw() == 0 && dev.pool().writeable() {
            let mut r = Ok(());
            for i in 0..WRITE_RETRIES {
                r = self.bus.access(&pp, 0, 1, 0);
                if r.is_ok() {
                    cp.acw.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                if i + 1 < WRITE_RETRIES {
                    // Another opener may hold a transient exclusive claim.
                    drop(topo);
                    tokio::time::sleep(WRITE_RETRY_DELAY).await;
                    topo = self.topology.lock().await;
                }
            }
            if let Err(e) = r {
                tracing::warn!("Unable to open {} for writing (error={})",
                               pp.name(), e);
                self.detach(&mut topo, &cp);
                return Err(e);
            }
        }
        drop(topo);

        dev.set_binding(cp);
        // Clear the nowritecache and notrim settings, so that on a reopen we
        // will try again.
        dev.set_nowritecache(false);
        dev.set_notrim(false);

        Ok(Geometry {
            size: pp.mediasize(),
            max_size: pp.mediasize(),
            min_alignment:
                highbit64(u64::from(pp.sectorsize().max(MIN_TRANSFER_SIZE)))
                - 1,
        })
    }

    /// Release `dev`'s binding, if any.  Idempotent.
    pub async fn close(&self, dev: &Arc<Device>) {
        let cp = match dev.take_binding() {
            Some(cp) => cp,
            None => return,
        };
        let mut topo = self.topology.lock().await;
        self.detach(&mut topo, &cp);
    }

    /// Submit one pool-level operation against `dev`'s bound provider.
    ///
    /// The returned future is the completion token; it resolves once, on the
    /// transport's completion context, after the completion rules have been
    /// applied.  Operations on an unbound device fail immediately with
    /// `ENXIO`.
    pub fn submit(&self, dev: &Arc<Device>, op: Op) -> IoFut {
        match op {
            Op::Read { buf, offset } => {
                let length = buf.len() as u64;
                self.start_bio(dev, BioCmd::Read, BioData::Read(buf), offset,
                               length)
            },
            Op::Write { buf, offset } => {
                let length = buf.len() as u64;
                self.start_bio(dev, BioCmd::Write, BioData::Write(buf), offset,
                               length)
            },
            Op::FlushWriteCache => {
                if dev.binding().is_none() {
                    return Box::pin(future::err(Error::ENXIO));
                }
                if self.tunables.flush_disable {
                    // Disabled by the administrator; succeed without issuing.
                    return Box::pin(future::ok(()));
                }
                if dev.nowritecache() {
                    return Box::pin(future::err(Error::ENOTSUP));
                }
                self.start_bio(dev, BioCmd::Flush, BioData::None, 0, 0)
            },
            Op::Trim { offset, length } => {
                if dev.binding().is_none() {
                    return Box::pin(future::err(Error::ENXIO));
                }
                if self.tunables.trim_disable {
                    return Box::pin(future::ok(()));
                }
                if dev.notrim() {
                    return Box::pin(future::err(Error::ENOTSUP));
                }
                self.start_bio(dev, BioCmd::Delete, BioData::None, offset,
                               length)
            },
            Op::Control(cmd) => {
                if dev.binding().is_none() {
                    Box::pin(future::err(Error::ENXIO))
                } else {
                    tracing::debug!("Rejecting control request {:#x}", cmd);
                    Box::pin(future::err(Error::ENOTSUP))
                }
            }
        }
    }

    fn start_bio(&self, dev: &Arc<Device>, cmd: BioCmd, data: BioData,
                 offset: u64, length: u64)
        -> IoFut
    {
        let cp = match dev.binding() {
            Some(cp) => cp,
            None => return Box::pin(future::err(Error::ENXIO)),
        };
        let pp = cp.provider().clone();
        // A flush addresses the whole device; by convention it carries the
        // media size as its offset.
        let offset = if cmd == BioCmd::Flush { pp.mediasize() } else { offset };
        let bio = Bio { cmd, offset, length, data };
        let fut = self.bus.submit(&pp, bio);
        let devw = Arc::downgrade(dev);
        Box::pin(fut.map(move |completion| {
            Self::io_done(cmd, completion, &devw, &cp)
        }))
    }

    /// Apply the completion rules to one finished bio.
    ///
    /// Runs on the transport's completion context.  The owning device may
    /// have been torn down concurrently, and any fault action must reach the
    /// pool asynchronously: this context may already hold locks incompatible
    /// with the pool's locking order.
    fn io_done(cmd: BioCmd, completion: Completion, dev: &Weak<Device>,
               cp: &Consumer)
        -> Result<()>
    {
        let mut r = completion.result;
        if r.is_ok() && completion.resid != 0 {
            // A short transfer with no error code is still an error.
            r = Err(Error::EIO);
        }
        let dev = match dev.upgrade() {
            Some(dev) => dev,
            None => return r,
        };
        if cmd == BioCmd::Flush && r == Err(Error::ENOTSUP) {
            // No future attempt will ever succeed.  Set a persistent bit so
            // that we don't bother with the request in the future.
            dev.set_nowritecache(true);
        }
        if cmd == BioCmd::Delete && r == Err(Error::ENOTSUP) {
            dev.set_notrim(true);
        }
        if r == Err(Error::EIO) && !dev.remove_wanted() {
            if cp.provider().error() != 0 {
                // If the provider's error is set we assume it is being
                // removed.  Post the fault immediately, rather than when the
                // async removal happens: the diagnosis engine uses it to
                // discard previous I/O errors.
                if !dev.test_and_set_remove_wanted() {
                    dev.pool().post_fault(dev.guid());
                    dev.pool().request_async(AsyncTask::Remove);
                }
            } else if !dev.delayed_close() {
                dev.set_delayed_close(true);
            }
        }
        r
    }

    /// Transport notification that `cp`'s provider has vanished while bound.
    ///
    /// Teardown cannot happen here: in-flight requests referencing this
    /// consumer must drain first, and draining requires taking the pool
    /// configuration lock before detaching, which this context may not do.
    /// Ask the pool to close the device once it is safe.
    pub async fn orphan(&self, cp: &Arc<Consumer>) {
        let _topo = self.topology.lock().await;
        let dev = match cp.device() {
            Some(dev) => dev,
            // Device close in progress.  Ignore the event.
            None => return,
        };
        dev.set_remove_wanted(true);
        dev.pool().request_async(AsyncTask::Remove);
    }

    /// Transport notification that one of `cp`'s provider attributes
    /// changed.
    pub async fn attr_changed(&self, cp: &Arc<Consumer>, attr: &str) {
        if attr != bus::PHYSPATH {
            return;
        }
        let dev = match cp.device() {
            Some(dev) => dev,
            None => return,
        };
        let topo = self.topology.lock().await;
        let topo = self.refresh_physpath(topo, cp, &dev).await;
        drop(topo);
    }
}

// LCOV_EXCL_STOP
