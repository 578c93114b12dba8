// vim: tw=80
//! On-disk identity labels
//!
//! The label container format is owned by the pool's label machinery; this
//! layer only decodes the self-describing key/value area and extracts the two
//! identity guids.  Labels are stored redundantly because any single slot may
//! be stale or corrupt.

use byteorder::{BigEndian, ByteOrder};
use metrohash::MetroHash64;
use std::hash::{Hash, Hasher};

use crate::{types::*, util::*};

/*
 * On-disk Label Format:
 *
 * Magic:       16 bytes
 * Checksum:    8 bytes     MetroHash64.  Covers all of Length and Contents.
 * Length:      8 bytes     Length of Contents in bytes
 * Contents:    variable    bincode-encoded (key, value) pairs
 * Pad:         variable    undefined, fills the remainder of the slot
 */
/// The label magic is "TARN Label\0\0\0\0\0\0"
const MAGIC: &[u8; MAGIC_LEN] = b"TARN Label\0\0\0\0\0\0";
const MAGIC_LEN: usize = 16;
const CHECKSUM_LEN: usize = 8;
const LENGTH_LEN: usize = 8;

/// Number of redundant label slots on every provider: two at the front of the
/// device and two at the back.
pub const LABEL_COUNT: usize = 4;
/// Size of one label slot in bytes.
pub const LABEL_SIZE: u64 = 1 << 18;
/// Largest sector size at which a label can still be located and decoded.
pub const MAX_SECTOR_SIZE: u32 = 8192;

/// Well-known keys of the two identity fields.
pub const POOL_GUID_KEY: &str = "pool_guid";
pub const DEVICE_GUID_KEY: &str = "device_guid";

/// Byte offset of the `l`th label slot on a provider whose usable size is
/// `psize`.  `psize` must already be aligned down to a multiple of
/// [`LABEL_SIZE`].
pub fn offset(psize: u64, l: usize) -> u64 {
    debug_assert!(l < LABEL_COUNT);
    debug_assert_eq!(psize, p2align(psize, LABEL_SIZE));
    let half = (LABEL_COUNT / 2) as u64;
    let l = l as u64;
    l * LABEL_SIZE + if l < half {
        0
    } else {
        psize - LABEL_COUNT as u64 * LABEL_SIZE
    }
}

/// Read-only view of one decoded label slot
#[derive(Debug)]
pub struct LabelReader {
    pairs: Vec<(String, u64)>
}

impl LabelReader {
    /// Attempt to decode a label from the raw buffer read from disk
    pub fn new(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < MAGIC_LEN + CHECKSUM_LEN + LENGTH_LEN {
            return Err(Error::EINVAL);
        }
        if MAGIC[..] != buffer[0..MAGIC_LEN] {
            return Err(Error::EINVAL);
        }

        let checksum = BigEndian::read_u64(
            &buffer[MAGIC_LEN..MAGIC_LEN + CHECKSUM_LEN]);
        let length_start = MAGIC_LEN + CHECKSUM_LEN;
        let contents_start = length_start + LENGTH_LEN;
        let contents_len = BigEndian::read_u64(
            &buffer[length_start..contents_start]) as usize;
        if contents_len > buffer.len() - contents_start {
            return Err(Error::EINVAL);
        }
        let contents = &buffer[contents_start..contents_start + contents_len];
        let mut hasher = MetroHash64::new();
        (contents_len as u64).to_be().hash(&mut hasher);
        hasher.write(contents);
        if checksum != hasher.finish() {
            return Err(Error::EBADMSG);
        }

        bincode::deserialize(contents)
            .map(|pairs| LabelReader { pairs })
            .map_err(|_| Error::EINVAL)
    }

    /// Look up a single value by key
    pub fn get(&self, key: &str) -> Option<u64> {
        self.pairs.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    /// Extract the pool and device guids.
    ///
    /// Either guid is zero if the label does not carry it.
    pub fn guids(&self) -> (Guid, Guid) {
        let mut pguid = Guid::default();
        let mut vguid = Guid::default();
        for (k, v) in self.pairs.iter() {
            match k.as_str() {
                POOL_GUID_KEY => pguid = Guid(*v),
                DEVICE_GUID_KEY => vguid = Guid(*v),
                _ => ()
            }
            if !pguid.is_zero() && !vguid.is_zero() {
                break;
            }
        }
        (pguid, vguid)
    }
}

/// Successively collects key/value pairs and encodes them into a label slot
#[derive(Clone, Debug, Default)]
pub struct LabelWriter {
    pairs: Vec<(String, u64)>
}

impl LabelWriter {
    pub fn new() -> Self {
        LabelWriter::default()
    }

    /// Add one pair to the label.  Duplicate keys are retained; readers take
    /// the first occurrence.
    pub fn insert<K: Into<String>>(&mut self, key: K, value: u64) {
        self.pairs.push((key.into(), value));
    }

    /// Consume the `LabelWriter` and return bytes suitable for writing to the
    /// start of a label slot.
    pub fn finish(self) -> Vec<u8> {
        let contents = bincode::serialize(&self.pairs).unwrap();
        let mut hasher = MetroHash64::new();
        (contents.len() as u64).to_be().hash(&mut hasher);
        hasher.write(&contents);
        let mut buffer =
            Vec::with_capacity(MAGIC_LEN + CHECKSUM_LEN + LENGTH_LEN +
                               contents.len());
        buffer.extend(&MAGIC[..]);
        buffer.resize(MAGIC_LEN + CHECKSUM_LEN, 0);
        BigEndian::write_u64(&mut buffer[MAGIC_LEN..], hasher.finish());
        buffer.resize(MAGIC_LEN + CHECKSUM_LEN + LENGTH_LEN, 0);
        BigEndian::write_u64(&mut buffer[MAGIC_LEN + CHECKSUM_LEN..],
                             contents.len() as u64);
        buffer.extend(contents);
        buffer
    }
}

// LCOV_EXCL_STOP
