// vim: tw=80
//! Test doubles shared by the functional tests: a RAM-backed transport and a
//! minimal pool.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU32, Ordering}
    },
};

use futures::future;

use tarn_core::{
    Error,
    Guid,
    Result,
    bus::{Bio, BioCmd, BioData, BioFut, Bus, Completion, Provider},
    label,
    p2align,
    pool::{AsyncTask, Pool},
};

struct RamDisk {
    provider: Provider,
    data: Mutex<Vec<u8>>,
    /// Open-mode counters, as maintained through `Bus::access`.
    counts: Mutex<(i32, i32, i32)>,
    flush_unsupported: Mutex<bool>,
}

/// A RAM-backed block-storage transport.
///
/// Every submitted request is recorded, so tests can assert on exactly what
/// reached the "hardware".
#[derive(Default)]
pub struct RamBus {
    disks: Mutex<BTreeMap<String, Arc<RamDisk>>>,
    log: Mutex<Vec<(String, BioCmd, u64, u64)>>,
}

impl RamBus {
    pub fn new() -> Arc<Self> {
        Arc::new(RamBus::default())
    }

    pub fn add_disk(&self, name: &str, sectorsize: u32, mediasize: u64)
        -> Provider
    {
        let provider = Provider::new(name, sectorsize, mediasize);
        let disk = Arc::new(RamDisk {
            provider: provider.clone(),
            data: Mutex::new(vec![0u8; mediasize as usize]),
            counts: Mutex::new((0, 0, 0)),
            flush_unsupported: Mutex::new(false),
        });
        self.disks.lock().unwrap().insert(name.to_owned(), disk);
        provider
    }

    /// Write a valid identity label into every slot of `name`.
    pub fn format(&self, name: &str, pool_guid: Guid, device_guid: Guid) {
        let disk = self.disk(name);
        let mut data = disk.data.lock().unwrap();
        let psize = p2align(data.len() as u64, label::LABEL_SIZE);
        for l in 0..label::LABEL_COUNT {
            let mut lw = label::LabelWriter::new();
            lw.insert(label::POOL_GUID_KEY, pool_guid.0);
            lw.insert(label::DEVICE_GUID_KEY, device_guid.0);
            let bytes = lw.finish();
            let off = label::offset(psize, l) as usize;
            data[off..off + bytes.len()].copy_from_slice(&bytes);
        }
    }

    pub fn set_flush_unsupported(&self, name: &str) {
        *self.disk(name).flush_unsupported.lock().unwrap() = true;
    }

    pub fn access_counts(&self, name: &str) -> (i32, i32, i32) {
        *self.disk(name).counts.lock().unwrap()
    }

    pub fn requests(&self) -> Vec<(String, BioCmd, u64, u64)> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_requests(&self) {
        self.log.lock().unwrap().clear();
    }

    fn disk(&self, name: &str) -> Arc<RamDisk> {
        self.disks.lock().unwrap().get(name).unwrap().clone()
    }
}

impl Bus for RamBus {
    fn provider_by_name(&self, name: &str) -> Option<Provider> {
        self.disks.lock().unwrap()
            .get(name)
            .map(|disk| disk.provider.clone())
    }

    fn providers(&self) -> Vec<Provider> {
        self.disks.lock().unwrap()
            .values()
            .map(|disk| disk.provider.clone())
            .collect()
    }

    fn access(&self, pp: &Provider, dr: i32, dw: i32, de: i32) -> Result<()> {
        let disk = self.disk(pp.name());
        let mut counts = disk.counts.lock().unwrap();
        let new = (counts.0 + dr, counts.1 + dw, counts.2 + de);
        assert!(new.0 >= 0 && new.1 >= 0 && new.2 >= 0,
                "access count underflow on {}", pp.name());
        *counts = new;
        Ok(())
    }

    fn submit(&self, pp: &Provider, bio: Bio) -> BioFut {
        self.log.lock().unwrap()
            .push((pp.name().to_owned(), bio.cmd, bio.offset, bio.length));
        let disk = self.disk(pp.name());
        let mut data = disk.data.lock().unwrap();
        let completion = match (bio.cmd, bio.data) {
            (BioCmd::Read, BioData::Read(mut buf)) => {
                let start = bio.offset as usize;
                let end = start + buf.len();
                if end > data.len() {
                    Completion::error(Error::EIO)
                } else {
                    buf[..].copy_from_slice(&data[start..end]);
                    Completion::ok()
                }
            },
            (BioCmd::Write, BioData::Write(buf)) => {
                let start = bio.offset as usize;
                let end = start + buf.len();
                if end > data.len() {
                    Completion::error(Error::EIO)
                } else {
                    data[start..end].copy_from_slice(&buf[..]);
                    Completion::ok()
                }
            },
            (BioCmd::Flush, BioData::None) => {
                if *disk.flush_unsupported.lock().unwrap() {
                    Completion::error(Error::ENOTSUP)
                } else {
                    Completion::ok()
                }
            },
            (BioCmd::Delete, BioData::None) => {
                let start = bio.offset as usize;
                let end = start + bio.length as usize;
                if end > data.len() {
                    Completion::error(Error::EIO)
                } else {
                    data[start..end].fill(0);
                    Completion::ok()
                }
            },
            _ => Completion::error(Error::EINVAL),
        };
        Box::pin(future::ready(completion))
    }

    fn physpath(&self, pp: &Provider) -> Result<String> {
        Ok(format!("ram@{}", pp.name()))
    }
}

/// A minimal pool that just records the driver's signals.
pub struct TestPool {
    guid: Guid,
    writeable: bool,
    pub removes: AtomicU32,
    pub config_updates: AtomicU32,
    pub faults: Mutex<Vec<Guid>>,
    pub config_enters: AtomicU32,
}

impl TestPool {
    pub fn new(guid: Guid, writeable: bool) -> Arc<Self> {
        Arc::new(TestPool {
            guid,
            writeable,
            removes: AtomicU32::new(0),
            config_updates: AtomicU32::new(0),
            faults: Mutex::new(Vec::new()),
            config_enters: AtomicU32::new(0),
        })
    }
}

impl Pool for TestPool {
    fn guid(&self) -> Guid {
        self.guid
    }

    fn loading(&self) -> bool {
        false
    }

    fn splitting(&self) -> bool {
        false
    }

    fn writeable(&self) -> bool {
        self.writeable
    }

    fn request_async(&self, task: AsyncTask) {
        match task {
            AsyncTask::Remove => self.removes.fetch_add(1, Ordering::Relaxed),
            AsyncTask::ConfigUpdate =>
                self.config_updates.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn post_fault(&self, guid: Guid) {
        self.faults.lock().unwrap().push(guid);
    }

    fn config_held_as_writer(&self) -> bool {
        false
    }

    fn config_enter_writer(&self) {
        self.config_enters.fetch_add(1, Ordering::Relaxed);
    }

    fn config_exit(&self) {
    }
}
