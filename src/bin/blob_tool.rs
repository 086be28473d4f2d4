//! A tool for inspecting blobs and exercising the installer against partition images.
//!
//! Partitions are plain files in a directory, named after the partition, so the results can be
//! checked with the usual tools afterwards.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use blob_installer::{
    bct::SimBct,
    blob::Catalog,
    bootloader::{BootContext, BootloaderSlot},
    config::{FuseMode, InstallerConfig},
    crypto::{SoftCrypto, AES_BLOCK_SIZE},
    dtb::BoardId,
    installer::{InstallReport, Installer},
    recovery::{check_for_update, RecoveryOutcome},
    sparse::SparseDecoder,
    storage::{dir::DirStorage, OpenMode, Storage},
    verify::SignatureVerifier,
};

fn read_modulus(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("cannot read modulus from {}", path.display()))
}

fn parse_key(s: &str) -> Result<[u8; AES_BLOCK_SIZE]> {
    let bytes = hex::decode(s)?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("key must be {AES_BLOCK_SIZE} bytes"))
}

/// A bootloader slot, as `PARTITION:VERSION`
#[derive(Debug, Clone)]
struct SlotArg {
    partition: String,
    version: u32,
}

impl std::str::FromStr for SlotArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (partition, version) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("expected PARTITION:VERSION"))?;
        Ok(Self {
            partition: partition.into(),
            version: version.parse()?,
        })
    }
}

#[derive(Args, Debug)]
struct DeviceOptions {
    /// Directory holding one file per partition
    #[clap(long)]
    dir: PathBuf,

    /// File holding the big-endian RSA modulus blobs are signed with
    #[clap(long)]
    modulus: PathBuf,

    /// The secure boot key, in hex
    #[clap(long, value_parser = parse_key)]
    sbk: Option<[u8; AES_BLOCK_SIZE]>,

    /// The user key, in hex
    #[clap(long, value_parser = parse_key)]
    user_key: Option<[u8; AES_BLOCK_SIZE]>,

    /// preproduction, nv-production, odm-open, odm-secure or odm-secure-pkc
    #[clap(long, default_value = "preproduction")]
    fuse_mode: FuseMode,

    /// How many bytes of a payload to read at a time
    #[clap(long)]
    window_size: Option<usize>,

    /// Skip checking sparse image checksums
    #[clap(long)]
    no_sparse_checksum: bool,

    /// Bootloader slots in boot order; without any, bootloaders and the BCT are installed like
    /// any other partition
    #[clap(long = "bootloader")]
    bootloaders: Vec<SlotArg>,

    /// Board modules to match DTBs against, as ID:SKU:FAB
    #[clap(long = "board")]
    boards: Vec<BoardId>,
}

impl DeviceOptions {
    fn config(&self) -> Result<InstallerConfig> {
        let mut config = InstallerConfig::new(read_modulus(&self.modulus)?)
            .fuse_mode(self.fuse_mode)
            .verify_sparse_checksum(!self.no_sparse_checksum);
        if let Some(window_size) = self.window_size {
            config = config.window_size(window_size);
        }
        Ok(config)
    }

    fn crypto(&self) -> SoftCrypto {
        let crypto = SoftCrypto::new(self.sbk.unwrap_or_default());
        match self.user_key {
            Some(key) => crypto.user_key(key),
            None => crypto,
        }
    }

    /// Rebuild the boot ROM's view of the device from the partitions
    fn boot_context(
        &self,
        storage: &DirStorage,
        config: &InstallerConfig,
        crypto: &SoftCrypto,
    ) -> Result<Option<BootContext>> {
        if self.bootloaders.is_empty() {
            return Ok(None);
        }

        let mut order = Vec::new();
        for slot in &self.bootloaders {
            let partition_id = storage
                .partition_id(&slot.partition)
                .ok_or_else(|| anyhow!("no partition named {}", slot.partition))?;
            order.push(BootloaderSlot {
                partition_id,
                version: slot.version,
            });
        }

        let bct_partition_id = storage
            .partition_id(&config.bct_partition)
            .ok_or_else(|| anyhow!("no partition named {}", config.bct_partition))?;
        let mut sealed = Vec::new();
        storage
            .open(&config.bct_partition, OpenMode::Read)?
            .read_to_end(&mut sealed)?;
        let bct = SimBct::unseal(&sealed, config.fuse_mode, crypto).context("cannot load BCT")?;

        Ok(Some(BootContext::new(order, bct_partition_id, Box::new(bct))))
    }
}

fn print_report(report: &InstallReport) {
    println!("Installed: {:?}", report.installed);
    println!("Rejected:  {:?}", report.rejected);
    println!("Skipped:   {:?}", report.skipped);
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the entry table of a blob; the signature is not checked
    Inspect {
        /// The blob to inspect
        path: PathBuf,
    },

    /// Check the signature of a blob
    Verify {
        /// The blob to check
        path: PathBuf,

        /// File holding the big-endian RSA modulus
        #[clap(long)]
        modulus: PathBuf,
    },

    /// Expand a sparse image
    Unsparse {
        /// The sparse image
        input: PathBuf,

        /// Where to write the expanded image
        output: PathBuf,

        /// Skip checking CRC32 chunks and the image checksum
        #[clap(long)]
        no_checksum: bool,
    },

    /// Install the blob found in a staging partition
    Install {
        #[clap(flatten)]
        device: DeviceOptions,

        /// The staging partition holding the blob
        #[clap(long, default_value = "USP")]
        staging: String,
    },

    /// Act as the bootloader would at boot: install a pending update, or report a recovery
    /// request
    Recover {
        #[clap(flatten)]
        device: DeviceOptions,
    },
}

impl Command {
    fn execute(self) -> Result<()> {
        match self {
            Command::Inspect { path } => {
                let catalog = Catalog::read(&mut File::open(path)?)?;

                println!(
                    "Blob of {} bytes, signature of {} bytes",
                    catalog.header.actual_blob_size, catalog.header.signature_size
                );
                for entry in &catalog.entries {
                    println!(
                        "{:3} {:4} offset={:#010x} length={:#010x} version={}{}",
                        entry.index,
                        entry.name,
                        entry.offset,
                        entry.length,
                        entry.version,
                        if entry.encrypted { " (encrypted)" } else { "" }
                    );
                }
            }

            Command::Verify { path, modulus } => {
                let modulus = read_modulus(&modulus)?;
                let crypto = SoftCrypto::default();
                let verifier = SignatureVerifier::new(&crypto, &modulus, 65537);

                verifier.verify(&mut File::open(path)?)?;
                println!("Signature OK");
            }

            Command::Unsparse {
                input,
                output,
                no_checksum,
            } => {
                let mut input = BufReader::new(File::open(input)?);
                let mut output = File::create(output)?;

                SparseDecoder::new(!no_checksum).decode_all(
                    &mut input,
                    &mut output,
                    InstallerConfig::default().window_size,
                )?;
            }

            Command::Install { device, staging } => {
                let storage = DirStorage::open(&device.dir)?;
                let config = device.config()?;
                let crypto = device.crypto();
                let mut boot = device.boot_context(&storage, &config, &crypto)?;

                let installer = Installer::new(&storage, &crypto, &device.boards, &config);
                let report = installer.install_blob(&staging, boot.as_mut())?;
                print_report(&report);
            }

            Command::Recover { device } => {
                let storage = DirStorage::open(&device.dir)?;
                let config = device.config()?;
                let crypto = device.crypto();
                let mut boot = device.boot_context(&storage, &config, &crypto)?;

                let installer = Installer::new(&storage, &crypto, &device.boards, &config);
                match check_for_update(&installer, boot.as_mut())? {
                    RecoveryOutcome::ContinueBoot => println!("Nothing to do"),
                    RecoveryOutcome::Recovery => println!("Recovery requested"),
                    RecoveryOutcome::Updated { staging, report } => {
                        println!("Updated from {staging}");
                        print_report(&report?);
                    }
                }
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The command to run
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let result = args.cmd.execute();
    howudoin::disable();
    result
}
