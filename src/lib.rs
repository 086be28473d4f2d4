//! Installer for signed update blobs: verifies a blob delivered to a staging partition and
//! writes its entries, sparse or raw, to their partitions, keeping the redundant bootloaders
//! and the BCT consistent along the way.

pub mod bct;
pub mod blob;
pub mod bootloader;
pub mod checksum;
pub mod config;
pub mod crypto;
pub mod dtb;
pub mod error;
pub mod installer;
pub mod recovery;
pub mod sparse;
pub mod storage;
pub mod util;
pub mod verify;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
