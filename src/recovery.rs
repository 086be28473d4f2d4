//! Deciding at boot whether to install a pending update or enter recovery.
//!
//! Requests arrive through the misc partition, which the OS writes a bootloader message to.
//! Older OS releases don't write one, so when there is no request the staging partitions are
//! probed for a signed blob as well.

use std::io::{Read, Write};

use crate::blob::SIGNED_MAGIC;
use crate::bootloader::BootContext;
use crate::error::{try_alloc, Result};
use crate::installer::{InstallReport, Installer};
use crate::storage::{OpenMode, Storage};
use crate::util::align_up;

const COMMAND_LEN: usize = 32;
const STATUS_LEN: usize = 32;
const RECOVERY_LEN: usize = 1024;
pub const BOOTLOADER_MESSAGE_LEN: usize = COMMAND_LEN + STATUS_LEN + RECOVERY_LEN;

/// The misc area spans this many pages...
const MISC_PAGES: u64 = 3;
/// ...and the message goes into this one
const MISC_MESSAGE_PAGE: u64 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MiscCommand {
    None,
    Recovery,
    Update,
}

/// The message exchanged with the OS through the misc partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootloaderMessage {
    pub command: String,
    pub status: String,
    pub recovery: String,
}

fn put_field(buf: &mut Vec<u8>, value: &str, len: usize) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(len);
    buf.extend_from_slice(&bytes[..n]);
    buf.resize(buf.len() + len - n, 0);
}

fn get_field(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

impl BootloaderMessage {
    /// Encode the message, truncating overlong fields
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BOOTLOADER_MESSAGE_LEN);
        put_field(&mut buf, &self.command, COMMAND_LEN);
        put_field(&mut buf, &self.status, STATUS_LEN);
        put_field(&mut buf, &self.recovery, RECOVERY_LEN);
        buf
    }

    pub fn parse(bytes: &[u8; BOOTLOADER_MESSAGE_LEN]) -> Self {
        let (command, rest) = bytes.split_at(COMMAND_LEN);
        let (status, recovery) = rest.split_at(STATUS_LEN);
        Self {
            command: get_field(command),
            status: get_field(status),
            recovery: get_field(recovery),
        }
    }
}

/// Read the request the OS left in the misc partition
pub fn read_misc_command<S: Storage>(storage: &S, misc: &str) -> Result<MiscCommand> {
    let mut command = [0u8; COMMAND_LEN];
    storage.open(misc, OpenMode::Read)?.read_exact(&mut command)?;

    Ok(if command.starts_with(b"boot-recovery") {
        MiscCommand::Recovery
    } else if command.starts_with(b"update") {
        MiscCommand::Update
    } else {
        MiscCommand::None
    })
}

/// Does `partition` start with a signed blob? Unreadable partitions don't.
fn holds_blob<S: Storage>(storage: &S, partition: &str) -> bool {
    let mut magic = [0u8; 20];
    let read = storage
        .open(partition, OpenMode::Read)
        .and_then(|mut file| Ok(file.read_exact(&mut magic)?));
    match read {
        Ok(()) => &magic == SIGNED_MAGIC,
        Err(error) => {
            log::debug!("Cannot probe {partition}: {error:#}");
            false
        }
    }
}

/// The first of `partitions` holding a blob, if any
pub fn probe_staging<S: Storage>(storage: &S, partitions: &[String]) -> Option<String> {
    partitions
        .iter()
        .find(|partition| holds_blob(storage, partition))
        .cloned()
}

/// Write `message` into the misc partition, clearing the rest of the misc area
pub fn write_bootloader_message<S: Storage>(
    storage: &S,
    misc: &str,
    message: &BootloaderMessage,
) -> Result<()> {
    let id = storage
        .partition_id(misc)
        .ok_or_else(|| anyhow::anyhow!("no partition named {misc}"))?;
    let page = u64::from(storage.partition_info(id)?.bytes_per_sector);

    let offset = page * MISC_MESSAGE_PAGE;
    let len = (page * MISC_PAGES).max(align_up(offset + BOOTLOADER_MESSAGE_LEN as u64, page));
    let mut area = try_alloc(len as usize)?;
    area[offset as usize..offset as usize + BOOTLOADER_MESSAGE_LEN]
        .copy_from_slice(&message.to_bytes());

    storage.open(misc, OpenMode::Write)?.write_all(&area)?;
    Ok(())
}

#[derive(Debug)]
pub enum RecoveryOutcome {
    /// Nothing to do
    ContinueBoot,
    /// The OS asked for the recovery image to be booted
    Recovery,
    /// A blob was installed from `staging`, which has been cleared since
    Updated {
        staging: String,
        report: Result<InstallReport>,
    },
}

/// Check for a pending update or recovery request, installing the update if there is one.
///
/// The staging partition is cleared after an install attempt whether or not it worked, so a
/// bad blob is never retried. The device should be reset after an update.
pub fn check_for_update<S: Storage>(
    installer: &Installer<S>,
    boot: Option<&mut BootContext>,
) -> Result<RecoveryOutcome> {
    let storage = installer.storage();
    let config = installer.config();

    let staging = match read_misc_command(storage, &config.misc_partition)? {
        MiscCommand::Recovery => return Ok(RecoveryOutcome::Recovery),
        MiscCommand::Update => config.primary_staging()?.to_owned(),
        MiscCommand::None => match probe_staging(storage, &config.staging_partitions) {
            Some(staging) => staging,
            None => return Ok(RecoveryOutcome::ContinueBoot),
        },
    };

    log::info!("Installing update from {staging}");
    let report = installer.install_blob(&staging, boot);
    match &report {
        Ok(report) => log::info!(
            "Blob update done: {} installed, {} rejected, {} skipped",
            report.installed.len(),
            report.rejected.len(),
            report.skipped.len()
        ),
        Err(error) => log::warn!("Blob update failed: {error}"),
    }

    if let Err(error) = storage.format(&staging) {
        log::warn!("Cannot clear {staging}: {error:#}");
    }

    Ok(RecoveryOutcome::Updated { staging, report })
}
