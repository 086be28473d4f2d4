//! Installer settings and the security mode of the part being updated.

use std::str::FromStr;

use anyhow::{anyhow, bail};

use crate::crypto::KeySlot;

/// How the part's security fuses are burned, which decides how bootloaders are signed and
/// whether encrypted payloads may be installed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum FuseMode {
    #[default]
    Preproduction,
    NvProduction,
    /// Customer-fused, secure boot key present but not enforced
    OdmOpen,
    /// Customer-fused and secured with the secure boot key
    OdmSecure,
    /// Customer-fused and secured with a public key (PKC) rather than the secure boot key
    OdmSecurePkc,
}

impl FuseMode {
    /// The key bootloader hashes are computed with
    pub fn key_slot(self) -> KeySlot {
        match self {
            Self::OdmOpen | Self::OdmSecure => KeySlot::SecureBootKey,
            Self::Preproduction | Self::NvProduction | Self::OdmSecurePkc => KeySlot::User,
        }
    }

    /// Whether bootloaders and the BCT are stored encrypted
    pub fn encrypts(self) -> bool {
        self == Self::OdmSecure
    }

    pub fn is_pkc(self) -> bool {
        self == Self::OdmSecurePkc
    }

    /// Blobs may carry pre-encrypted payloads only for parts that can decrypt them
    pub fn allows_encrypted_payloads(self) -> bool {
        self == Self::OdmSecure
    }
}

impl FromStr for FuseMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "preproduction" => Self::Preproduction,
            "nv-production" => Self::NvProduction,
            "odm-open" => Self::OdmOpen,
            "odm-secure" => Self::OdmSecure,
            "odm-secure-pkc" => Self::OdmSecurePkc,
            _ => bail!("unknown fuse mode {s:?}"),
        })
    }
}

/// Everything the installer needs to know beyond the blob itself
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    pub fuse_mode: FuseMode,

    /// How much of a payload is read from the staging partition at once. Anything smaller than
    /// a sparse image header is rounded up to one.
    pub window_size: usize,

    /// Check CRC32 chunks and image checksums of sparse payloads
    pub verify_sparse_checksum: bool,

    /// The blob signing key, big-endian
    pub public_modulus: Vec<u8>,
    pub public_exponent: u32,

    pub dtb_partition: String,
    pub bct_partition: String,

    /// Number of BCT copies written to the start of the BCT partition
    pub bct_copies: u32,

    /// Pad bootloaders whose padded length lands exactly on a page boundary with one extra
    /// AES block. Some boot ROMs misread such images.
    pub pad_page_aligned_bootloader: bool,

    /// Partitions probed, in order, for a blob when no update was requested
    pub staging_partitions: Vec<String>,

    /// The partition holding the bootloader message
    pub misc_partition: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            fuse_mode: FuseMode::default(),
            window_size: 10 * 1024 * 1024,
            verify_sparse_checksum: true,
            public_modulus: Vec::new(),
            public_exponent: 65537,
            dtb_partition: "DTB".into(),
            bct_partition: "BCT".into(),
            bct_copies: 2,
            pad_page_aligned_bootloader: false,
            staging_partitions: vec!["USP".into(), "CAC".into()],
            misc_partition: "MSC".into(),
        }
    }
}

impl InstallerConfig {
    pub fn new(public_modulus: Vec<u8>) -> Self {
        Self {
            public_modulus,
            ..Default::default()
        }
    }

    pub fn fuse_mode(mut self, fuse_mode: FuseMode) -> Self {
        self.fuse_mode = fuse_mode;
        self
    }

    pub fn window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn verify_sparse_checksum(mut self, verify: bool) -> Self {
        self.verify_sparse_checksum = verify;
        self
    }

    pub fn public_exponent(mut self, exponent: u32) -> Self {
        self.public_exponent = exponent;
        self
    }

    pub fn bct_copies(mut self, copies: u32) -> Self {
        self.bct_copies = copies;
        self
    }

    pub fn pad_page_aligned_bootloader(mut self, pad: bool) -> Self {
        self.pad_page_aligned_bootloader = pad;
        self
    }

    pub fn staging_partitions(mut self, partitions: &[&str]) -> Self {
        self.staging_partitions = partitions.iter().map(|&p| p.to_owned()).collect();
        self
    }

    /// The staging partition an explicitly requested update is read from
    pub fn primary_staging(&self) -> anyhow::Result<&str> {
        self.staging_partitions
            .first()
            .map(String::as_str)
            .ok_or_else(|| anyhow!("no staging partitions configured"))
    }
}

#[test]
fn test_fuse_mode() -> anyhow::Result<()> {
    assert_eq!("odm-secure".parse::<FuseMode>()?, FuseMode::OdmSecure);
    assert_eq!("nv-production".parse::<FuseMode>()?, FuseMode::NvProduction);
    assert!("secure".parse::<FuseMode>().is_err());

    assert_eq!(FuseMode::OdmOpen.key_slot(), KeySlot::SecureBootKey);
    assert_eq!(FuseMode::OdmSecurePkc.key_slot(), KeySlot::User);
    assert!(FuseMode::OdmSecure.encrypts());
    assert!(!FuseMode::OdmOpen.encrypts());
    assert!(!FuseMode::OdmSecurePkc.allows_encrypted_payloads());
    Ok(())
}

#[test]
fn test_config_defaults() -> anyhow::Result<()> {
    let config = InstallerConfig::new(vec![1; 256]).bct_copies(4);
    assert_eq!(config.window_size, 10 * 1024 * 1024);
    assert_eq!(config.public_exponent, 65537);
    assert_eq!(config.bct_copies, 4);
    assert_eq!(config.primary_staging()?, "USP");

    let config = config.staging_partitions(&[]);
    assert!(config.primary_staging().is_err());
    Ok(())
}
