// vim: tw=80
//! tarn-core: the leaf-device driver layer of the tarn storage pool manager.
//!
//! This crate binds a pool's virtual devices to concrete block-storage
//! providers, verifies every binding by on-disk identity, and translates pool
//! I/O into primitive transport requests.  The transport framework and the
//! pool itself are external collaborators, reached through the traits in
//! [`bus`] and [`pool`].

pub mod bus;
pub mod label;
pub mod pool;
pub mod types;
pub mod util;
pub mod vdev;
pub mod vdev_disk;

pub use crate::types::*;
pub use crate::util::*;
