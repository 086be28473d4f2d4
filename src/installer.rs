//! Installing a blob: authenticate it, plan the order of the writes, then carry them out.
//!
//! Ordinary entries are streamed from the staging partition to their destination, going
//! through the sparse decoder when the payload turns out to be a sparse image. Bootloader and
//! BCT entries get special treatment when the boot ROM's view of the device is known, see
//! [InstallPlan].

use std::io::{Seek, SeekFrom, Write};

use anyhow::anyhow;

use crate::blob::{classify, Catalog, Entry, EntryClass};
use crate::bootloader::{BootContext, BootloaderSlot, BootloaderUpdater};
use crate::config::InstallerConfig;
use crate::crypto::CryptoService;
use crate::dtb::{select_dtb, BoardQuery};
use crate::error::{Error, Result};
use crate::sparse::{is_sparse, SparseDecoder, SPARSE_HEADER_LEN};
use crate::storage::{OpenMode, PartitionFile, Storage};
use crate::util::ReadExt;
use crate::verify::SignatureVerifier;

/// What happened to the entries of a blob
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: Vec<String>,
    /// Refused by the version policy
    pub rejected: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PhaseKind {
    /// First, third... bootloader slots
    OddSlots,
    Bct,
    /// Second, fourth... bootloader slots
    EvenSlots,
    Remaining,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The destination partition doesn't exist
    NoPartition,
    /// A DTB meant for another board
    UnselectedDtb,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    Bootloader { slot: usize },
    Bct,
    Generic,
    Skip(SkipReason),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Step {
    /// Index of the entry in the catalog
    pub entry: usize,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub kind: PhaseKind,
    pub steps: Vec<Step>,
}

/// The ordered list of everything an install will do.
///
/// Without a boot context, every entry is written as is, in catalog order. With one, in legacy
/// mode, bootloader and BCT entries go through the bootloader updater but the order stays the
/// same. In PKC mode, a blob updating every bootloader slot and the BCT is installed in phases
/// that keep a bootable slot at all times: odd slots, then the BCT, then even slots, then the
/// rest. PKC blobs that don't cover all of them are written as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub phases: Vec<Phase>,
}

impl InstallPlan {
    /// Plan the install of `entries`.
    ///
    /// `partition_ids` holds the destination of each entry, if it exists, and `unselected_dtbs`
    /// the catalog indices of DTB entries meant for other boards. `boot` is the bootloader
    /// order and BCT partition id.
    pub fn build(
        entries: &[Entry],
        partition_ids: &[Option<u32>],
        unselected_dtbs: &[usize],
        boot: Option<(&[BootloaderSlot], u32)>,
        pkc: bool,
    ) -> Self {
        let skip = |index: usize| {
            if unselected_dtbs.contains(&index) {
                Some(SkipReason::UnselectedDtb)
            } else if partition_ids[index].is_none() {
                Some(SkipReason::NoPartition)
            } else {
                None
            }
        };
        let generic = |index: usize| Step {
            entry: index,
            action: skip(index).map_or(Action::Generic, Action::Skip),
        };

        let Some((order, bct_id)) = boot else {
            return Self::single((0..entries.len()).map(generic).collect());
        };

        let classes: Vec<EntryClass> = partition_ids
            .iter()
            .map(|id| match id {
                Some(id) => classify(*id, order, bct_id),
                None => EntryClass::Ordinary,
            })
            .collect();

        if !pkc {
            let steps = (0..entries.len())
                .map(|index| match classes[index] {
                    EntryClass::Bootloader { slot } => Step {
                        entry: index,
                        action: Action::Bootloader { slot },
                    },
                    EntryClass::Bct => Step {
                        entry: index,
                        action: Action::Bct,
                    },
                    EntryClass::Ordinary => generic(index),
                })
                .collect();
            return Self::single(steps);
        }

        let covers_all = (0..order.len())
            .all(|slot| classes.contains(&EntryClass::Bootloader { slot }))
            && classes.contains(&EntryClass::Bct);
        if !covers_all {
            return Self::single((0..entries.len()).map(generic).collect());
        }

        let slots = |first: usize| -> Vec<Step> {
            let mut steps = Vec::new();
            for slot in (first..order.len()).step_by(2) {
                for (index, class) in classes.iter().enumerate() {
                    if *class == (EntryClass::Bootloader { slot }) {
                        steps.push(Step {
                            entry: index,
                            action: Action::Bootloader { slot },
                        });
                    }
                }
            }
            steps
        };
        let bct = (0..entries.len())
            .filter(|&index| classes[index] == EntryClass::Bct)
            .map(|index| Step {
                entry: index,
                action: Action::Bct,
            })
            .collect();
        let remaining = (0..entries.len())
            .filter(|&index| classes[index] == EntryClass::Ordinary)
            .map(generic)
            .collect();

        Self {
            phases: vec![
                Phase {
                    kind: PhaseKind::OddSlots,
                    steps: slots(0),
                },
                Phase {
                    kind: PhaseKind::Bct,
                    steps: bct,
                },
                Phase {
                    kind: PhaseKind::EvenSlots,
                    steps: slots(1),
                },
                Phase {
                    kind: PhaseKind::Remaining,
                    steps: remaining,
                },
            ],
        }
    }

    fn single(steps: Vec<Step>) -> Self {
        Self {
            phases: vec![Phase {
                kind: PhaseKind::Remaining,
                steps,
            }],
        }
    }

    /// All steps, in execution order
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.phases.iter().flat_map(|phase| phase.steps.iter())
    }

    pub fn len(&self) -> usize {
        self.phases.iter().map(|phase| phase.steps.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Installer<'a, S: Storage> {
    storage: &'a S,
    crypto: &'a dyn CryptoService,
    board: &'a dyn BoardQuery,
    config: &'a InstallerConfig,
}

impl<'a, S: Storage> Installer<'a, S> {
    pub fn new(
        storage: &'a S,
        crypto: &'a dyn CryptoService,
        board: &'a dyn BoardQuery,
        config: &'a InstallerConfig,
    ) -> Self {
        Self {
            storage,
            crypto,
            board,
            config,
        }
    }

    pub fn storage(&self) -> &'a S {
        self.storage
    }

    pub fn config(&self) -> &'a InstallerConfig {
        self.config
    }

    /// Verify and install the blob in the `staging` partition.
    ///
    /// Version rejections are reported, not raised. Any other failure stops the install
    /// where it is; entries already written stay written.
    pub fn install_blob(
        &self,
        staging: &str,
        mut boot: Option<&mut BootContext>,
    ) -> Result<InstallReport> {
        let mut blob = self.storage.open(staging, OpenMode::Read)?;
        SignatureVerifier::new(
            self.crypto,
            &self.config.public_modulus,
            self.config.public_exponent,
        )
        .verify(&mut blob)?;

        let catalog = Catalog::read(&mut blob)?;
        let partition_ids: Vec<Option<u32>> = catalog
            .entries
            .iter()
            .map(|entry| self.storage.partition_id(&entry.name))
            .collect();
        let unselected = self.unselected_dtbs(&catalog, &mut blob);

        let plan = InstallPlan::build(
            &catalog.entries,
            &partition_ids,
            &unselected,
            boot.as_deref()
                .map(|ctx| (&ctx.order[..], ctx.bct_partition_id)),
            self.config.fuse_mode.is_pkc(),
        );
        log::debug!("Install plan: {plan:?}");

        let rpt = howudoin::new().label("Installing blob");
        rpt.set_len(Some(plan.len() as u64));

        let mut report = InstallReport::default();
        for phase in &plan.phases {
            log::debug!("Install phase {:?}", phase.kind);
            for step in &phase.steps {
                let entry = &catalog.entries[step.entry];
                rpt.desc(format!("Updating {}", entry.name));
                rpt.inc();

                if entry.encrypted && !self.config.fuse_mode.allows_encrypted_payloads() {
                    return Err(Error::UpdateNotAllowed(format!(
                        "{} is encrypted, which {:?} parts cannot install",
                        entry.name, self.config.fuse_mode
                    )));
                }

                let result = match step.action {
                    Action::Skip(reason) => {
                        match reason {
                            SkipReason::NoPartition => {
                                log::info!("Non existing partition {}", entry.name)
                            }
                            SkipReason::UnselectedDtb => {
                                log::info!("Skipping DTB entry {} for another board", entry.index)
                            }
                        }
                        report.skipped.push(entry.name.clone());
                        continue;
                    }
                    Action::Generic => self.install_generic(entry, &mut blob),
                    Action::Bootloader { slot } => {
                        let ctx = boot.as_deref_mut().ok_or_else(|| anyhow!("no boot context"))?;
                        self.install_bootloader(ctx, slot, entry, &mut blob)
                    }
                    Action::Bct => {
                        let ctx = boot.as_deref_mut().ok_or_else(|| anyhow!("no boot context"))?;
                        BootloaderUpdater::new(self.storage, self.crypto, self.config)
                            .install_bct(ctx, entry, &mut blob)
                    }
                };

                match result {
                    Ok(()) => report.installed.push(entry.name.clone()),
                    Err(error) if error.is_soft() => {
                        log::warn!("{error}");
                        report.rejected.push(entry.name.clone());
                    }
                    Err(error) => {
                        log::warn!("Update of {} failed: {error}", entry.name);
                        return Err(error);
                    }
                }
            }
        }

        rpt.close();
        Ok(report)
    }

    /// Catalog indices of the DTB entries not to install
    fn unselected_dtbs(&self, catalog: &Catalog, blob: &mut S::File) -> Vec<usize> {
        let candidates: Vec<&Entry> = catalog.entries_named(&self.config.dtb_partition).collect();
        if candidates.len() <= 1 {
            return Vec::new();
        }

        let chosen = select_dtb(
            self.storage,
            &self.config.dtb_partition,
            blob,
            &candidates,
            self.board,
        )
        .unwrap_or_else(|error| {
            log::warn!("DTB selection failed: {error}");
            None
        });
        if chosen.is_none() {
            log::warn!("No DTB entry matches this board");
        }

        candidates
            .iter()
            .map(|entry| entry.index)
            .filter(|&index| Some(index) != chosen)
            .collect()
    }

    fn install_bootloader(
        &self,
        ctx: &mut BootContext,
        slot: usize,
        entry: &Entry,
        blob: &mut S::File,
    ) -> Result<()> {
        ctx.check_version(slot, entry)?;

        if self.config.fuse_mode.is_pkc() {
            // Signed images go down as they are, even if they happen to look sparse
            self.copy_entry(entry, blob, false)?;
        } else {
            BootloaderUpdater::new(self.storage, self.crypto, self.config)
                .install_bootloader(ctx, slot, entry, blob)?;
        }

        ctx.record_version(slot, entry.version);
        Ok(())
    }

    fn install_generic(&self, entry: &Entry, blob: &mut S::File) -> Result<()> {
        self.copy_entry(entry, blob, true)
    }

    /// Copy an entry to the partition it names, with write-verify on
    fn copy_entry(&self, entry: &Entry, blob: &mut S::File, detect_sparse: bool) -> Result<()> {
        log::info!("Start updating {}", entry.name);
        let mut out = self.storage.open(&entry.name, OpenMode::Write)?;
        out.set_write_verify(true)?;
        let streamed = self.stream_payload(entry, blob, &mut out, detect_sparse);
        let disabled = out.set_write_verify(false);
        streamed?;
        disabled?;
        Ok(())
    }

    fn stream_payload<W: Write + Seek>(
        &self,
        entry: &Entry,
        blob: &mut S::File,
        out: &mut W,
        detect_sparse: bool,
    ) -> Result<()> {
        blob.seek(SeekFrom::Start(entry.blob_offset()))?;
        // The first window has to hold a whole sparse header to be recognized
        let window_size = self.config.window_size.max(SPARSE_HEADER_LEN);

        let mut remaining = u64::from(entry.length);
        let mut decoder: Option<SparseDecoder> = None;
        let mut is_first = true;
        let mut window = Vec::new();
        while remaining > 0 {
            let n = remaining.min(window_size as u64) as usize;
            window.clear();
            blob.read_to_vec(&mut window, n)?;
            if window.len() != n {
                return Err(anyhow!("staging partition ends inside {}", entry.name).into());
            }
            remaining -= n as u64;

            if is_first && detect_sparse && is_sparse(&window) {
                log::debug!("{} is a sparse image", entry.name);
                decoder = Some(SparseDecoder::new(self.config.verify_sparse_checksum));
            }

            match decoder.as_mut() {
                Some(decoder) => decoder.decode(out, &window, is_first, remaining == 0)?,
                None => out.write_all(&window)?,
            }
            is_first = false;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bct::SimBct;
    use crate::blob::{ImageEntry, UpdateHeader};
    use crate::config::FuseMode;
    use crate::crypto::SoftCrypto;
    use crate::dtb::{BoardId, PROP_BOARD_IDS};
    use crate::storage::SimStorage;
    use crate::testutil::{fdt, modulus, sign_blob, string_list, BlobBuilder, SparseBuilder};
    use deku::DekuContainerWrite;

    fn entries(names: &[&str]) -> Vec<Entry> {
        names
            .iter()
            .enumerate()
            .map(|(index, name)| Entry {
                index,
                name: name.to_string(),
                offset: 0,
                length: 0,
                version: 0,
                encrypted: false,
            })
            .collect()
    }

    fn order(ids: &[u32]) -> Vec<BootloaderSlot> {
        ids.iter()
            .map(|&partition_id| BootloaderSlot {
                partition_id,
                version: 0,
            })
            .collect()
    }

    fn step(entry: usize, action: Action) -> Step {
        Step { entry, action }
    }

    #[test]
    fn test_plan_pkc() {
        let entries = entries(&["APP", "BL3", "BL2", "BL1", "BL0", "BCT", "DTB"]);
        let ids = [Some(6), Some(4), Some(3), Some(2), Some(1), Some(5), Some(7)];
        let order = order(&[1, 2, 3, 4]);

        let plan = InstallPlan::build(&entries, &ids, &[], Some((&order[..], 5)), true);
        let kinds: Vec<PhaseKind> = plan.phases.iter().map(|phase| phase.kind).collect();
        assert_eq!(
            kinds,
            [
                PhaseKind::OddSlots,
                PhaseKind::Bct,
                PhaseKind::EvenSlots,
                PhaseKind::Remaining
            ]
        );
        assert_eq!(
            plan.phases[0].steps,
            [
                step(4, Action::Bootloader { slot: 0 }),
                step(2, Action::Bootloader { slot: 2 })
            ]
        );
        assert_eq!(plan.phases[1].steps, [step(5, Action::Bct)]);
        assert_eq!(
            plan.phases[2].steps,
            [
                step(3, Action::Bootloader { slot: 1 }),
                step(1, Action::Bootloader { slot: 3 })
            ]
        );
        assert_eq!(
            plan.phases[3].steps,
            [step(0, Action::Generic), step(6, Action::Generic)]
        );
        assert_eq!(plan.len(), 7);
    }

    #[test]
    fn test_plan_pkc_partial() {
        // BL3 missing: everything goes in catalog order, as plain writes
        let entries = entries(&["BL2", "BL1", "BL0", "BCT", "XYZ"]);
        let ids = [Some(3), Some(2), Some(1), Some(5), None];
        let order = order(&[1, 2, 3, 4]);

        let plan = InstallPlan::build(&entries, &ids, &[], Some((&order[..], 5)), true);
        assert_eq!(plan.phases.len(), 1);
        let actions: Vec<Action> = plan.steps().map(|step| step.action).collect();
        assert_eq!(
            actions,
            [
                Action::Generic,
                Action::Generic,
                Action::Generic,
                Action::Generic,
                Action::Skip(SkipReason::NoPartition)
            ]
        );
    }

    #[test]
    fn test_plan_legacy() {
        let entries = entries(&["BL1", "APP", "BCT", "DTB", "DTB"]);
        let ids = [Some(2), Some(6), Some(5), Some(7), Some(7)];
        let order = order(&[1, 2]);

        let plan = InstallPlan::build(&entries, &ids, &[3], Some((&order[..], 5)), false);
        let steps: Vec<Step> = plan.steps().copied().collect();
        assert_eq!(
            steps,
            [
                step(0, Action::Bootloader { slot: 1 }),
                step(1, Action::Generic),
                step(2, Action::Bct),
                step(3, Action::Skip(SkipReason::UnselectedDtb)),
                step(4, Action::Generic),
            ]
        );

        // No boot context: nothing is special
        let plan = InstallPlan::build(&entries, &ids, &[], None, false);
        assert!(plan.steps().all(|step| step.action == Action::Generic));
    }

    struct Device {
        storage: SimStorage,
        crypto: SoftCrypto,
        config: InstallerConfig,
        board: Vec<BoardId>,
    }

    impl Device {
        fn new(partitions: &[(&str, u64)]) -> Self {
            let storage = SimStorage::new();
            storage.add_partition("USP", 1 << 20);
            for &(name, size) in partitions {
                storage.add_partition(name, size);
            }
            Self {
                storage,
                crypto: SoftCrypto::new([3; 16]),
                config: InstallerConfig::new(modulus()),
                board: Vec::new(),
            }
        }

        fn stage(&self, blob: &[u8]) {
            self.storage.load("USP", blob).unwrap();
        }

        fn install(&self, boot: Option<&mut BootContext>) -> Result<InstallReport> {
            Installer::new(&self.storage, &self.crypto, &self.board, &self.config)
                .install_blob("USP", boot)
        }
    }

    #[test]
    fn test_end_to_end() -> Result<()> {
        let mut payload = vec![0u8; 1024];
        payload[..60].copy_from_slice(&UpdateHeader::new(60, 1, 1024).to_bytes()?);
        payload[60..76].copy_from_slice(&ImageEntry::new("APP1", 80, 512, 1, false).to_bytes()?);
        for (i, byte) in payload[80..592].iter_mut().enumerate() {
            *byte = i as u8 ^ 0x5a;
        }
        let blob = sign_blob(&payload);
        assert_eq!(&blob[20..28], &[0, 4, 0, 0, 0, 1, 0, 0]);

        let device = Device::new(&[("APP1", 1024)]);
        device.stage(&blob);
        let report = device.install(None)?;
        assert_eq!(report.installed, ["APP1"]);

        let app = device.storage.contents("APP1")?;
        assert_eq!(app[..512], blob[108..620]);
        assert!(app[512..].iter().all(|&b| b == 0));
        assert_eq!(device.storage.written_bytes("APP1")?, (512, 0));
        assert!(!device.storage.verify_enabled("APP1")?);
        Ok(())
    }

    #[test]
    fn test_windows_and_sparse() -> Result<()> {
        let raw: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let sparse = SparseBuilder::new(512)
            .raw(&[0xab; 1024])
            .dont_care(2)
            .fill([1, 2, 3, 4], 3)
            .crc32(None);
        let blob = BlobBuilder::new()
            .entry("RAW", &raw, 1)
            .entry("IMG", &sparse.build(), 1)
            .build();

        let mut device = Device::new(&[("RAW", 8192), ("IMG", 8192)]);
        device.config = device.config.clone().window_size(700);
        device.stage(&blob);
        let report = device.install(None)?;
        assert_eq!(report.installed, ["RAW", "IMG"]);

        assert_eq!(device.storage.contents("RAW")?[..5000], raw[..]);
        let expanded = sparse.expanded();
        assert_eq!(device.storage.contents("IMG")?[..expanded.len()], expanded[..]);
        // Holes are not written
        assert_eq!(device.storage.written_bytes("IMG")?, (1024 + 1536, 0));
        Ok(())
    }

    #[test]
    fn test_tiny_windows() -> Result<()> {
        let sparse = SparseBuilder::new(512).raw(&[0xab; 512]).fill([9; 4], 2);
        let blob = BlobBuilder::new()
            .entry("RAW", &[0x5a; 100], 1)
            .entry("IMG", &sparse.build(), 1)
            .build();

        for window_size in [0, 1, 16] {
            let mut device = Device::new(&[("RAW", 4096), ("IMG", 4096)]);
            device.config = device.config.clone().window_size(window_size);
            device.stage(&blob);
            let report = device.install(None)?;
            assert_eq!(report.installed, ["RAW", "IMG"]);

            assert_eq!(device.storage.contents("RAW")?[..100], [0x5a; 100]);
            let expanded = sparse.expanded();
            assert_eq!(device.storage.contents("IMG")?[..expanded.len()], expanded[..]);
        }
        Ok(())
    }

    #[test]
    fn test_bad_sparse_payload() -> Result<()> {
        let image = SparseBuilder::new(512).raw(&[7; 512]).build_with_checksum(0xdead);
        let blob = BlobBuilder::new().entry("IMG", &image, 1).build();

        let device = Device::new(&[("IMG", 4096)]);
        device.stage(&blob);
        assert!(matches!(device.install(None), Err(Error::Checksum(_))));
        assert!(!device.storage.verify_enabled("IMG")?);
        Ok(())
    }

    #[test]
    fn test_unsigned_blob() {
        let mut blob = BlobBuilder::new().entry("APP", &[1; 64], 1).build();
        blob[100] ^= 0xff;

        let device = Device::new(&[("APP", 4096)]);
        device.stage(&blob);
        assert!(matches!(device.install(None), Err(Error::Checksum(_))));
        assert_eq!(device.storage.write_opens("APP").unwrap(), 0);
    }

    #[test]
    fn test_skip_and_encrypted() -> Result<()> {
        let blob = BlobBuilder::new()
            .entry("APP", &[1; 64], 1)
            .entry("NOPE", &[2; 64], 1)
            .build();
        let device = Device::new(&[("APP", 4096)]);
        device.stage(&blob);
        let report = device.install(None)?;
        assert_eq!(report.installed, ["APP"]);
        assert_eq!(report.skipped, ["NOPE"]);

        // Encrypted payloads are refused, even for a partition that doesn't exist
        let blob = BlobBuilder::new()
            .entry("APP", &[1; 64], 1)
            .encrypted_entry("NOPE", &[2; 64], 1)
            .build();
        device.stage(&blob);
        assert!(matches!(device.install(None), Err(Error::UpdateNotAllowed(_))));

        let mut device = Device::new(&[("APP", 4096)]);
        device.config = device.config.clone().fuse_mode(FuseMode::OdmSecure);
        device.stage(&blob);
        assert_eq!(device.install(None)?.skipped, ["NOPE"]);
        Ok(())
    }

    fn boot_context(device: &Device, slots: &[(&str, u32)]) -> BootContext {
        let order = slots
            .iter()
            .map(|&(name, version)| BootloaderSlot {
                partition_id: device.storage.partition_id(name).unwrap(),
                version,
            })
            .collect();
        BootContext::new(
            order,
            device.storage.partition_id("BCT").unwrap(),
            Box::new(SimBct::new(12, 9)),
        )
    }

    #[test]
    fn test_bootloader_versions() -> Result<()> {
        let device = Device::new(&[("BL0", 8192), ("BL1", 8192), ("BCT", 8192)]);
        let mut ctx = boot_context(&device, &[("BL0", 3), ("BL1", 5)]);

        let blob = BlobBuilder::new()
            .entry("BL0", &[0x10; 300], 2)
            .entry("BL1", &[0x11; 300], 6)
            .build();
        device.stage(&blob);
        let report = device.install(Some(&mut ctx))?;
        assert_eq!(report.installed, ["BL1"]);
        assert_eq!(report.rejected, ["BL0"]);

        assert_eq!(device.storage.write_opens("BL0")?, 0);
        assert_eq!(device.storage.write_opens("BCT")?, 1);
        let live = SimBct::unseal(
            &device.storage.contents("BCT")?,
            FuseMode::Preproduction,
            &device.crypto,
        )?;
        assert_eq!(live.slots[1].version, 6);
        assert_eq!(live.slots[1].length, 304);
        assert_eq!(ctx.order[1].version, 6);

        // Installing the same blob again changes nothing
        let report = device.install(Some(&mut ctx))?;
        assert!(report.installed.is_empty());
        assert_eq!(device.storage.write_opens("BCT")?, 1);
        Ok(())
    }

    #[test]
    fn test_pkc_phases() -> Result<()> {
        let mut device = Device::new(&[
            ("BL0", 8192),
            ("BL1", 8192),
            ("BCT", 8192),
            ("APP", 8192),
        ]);
        device.config = device.config.clone().fuse_mode(FuseMode::OdmSecurePkc);
        let mut ctx = boot_context(&device, &[("BL0", 1), ("BL1", 1)]);

        let mut bct = SimBct::new(12, 9);
        bct.slots[0].version = 42;
        let blob = BlobBuilder::new()
            .entry("APP", &[0xaa; 100], 1)
            .entry("BL1", &[0x11; 100], 2)
            .entry("BCT", &bct.to_bytes(), 2)
            .entry("BL0", &[0x10; 100], 2)
            .build();
        device.stage(&blob);

        let report = device.install(Some(&mut ctx))?;
        assert_eq!(report.installed, ["BL0", "BCT", "BL1", "APP"]);

        // Bootloaders are written as is
        let bl0 = device.storage.contents("BL0")?;
        assert_eq!(bl0[..100], [0x10; 100]);
        assert_eq!(bl0[100], 0);
        let live = SimBct::unseal(
            &device.storage.contents("BCT")?,
            FuseMode::OdmSecurePkc,
            &device.crypto,
        )?;
        assert_eq!(live.slots[0].version, 42);
        Ok(())
    }

    #[test]
    fn test_pkc_bootloader_verbatim() -> Result<()> {
        let mut device = Device::new(&[("BL0", 8192), ("BCT", 8192)]);
        device.config = device.config.clone().fuse_mode(FuseMode::OdmSecurePkc);
        let mut ctx = boot_context(&device, &[("BL0", 1)]);

        // A bootloader that happens to start with the sparse magic
        let image = SparseBuilder::new(512).raw(&[0x10; 512]).build();
        let blob = BlobBuilder::new()
            .entry("BL0", &image, 2)
            .entry("BCT", &SimBct::new(12, 9).to_bytes(), 2)
            .build();
        device.stage(&blob);

        let report = device.install(Some(&mut ctx))?;
        assert_eq!(report.installed, ["BL0", "BCT"]);
        assert_eq!(device.storage.contents("BL0")?[..image.len()], image[..]);
        Ok(())
    }

    #[test]
    fn test_dtb_selection() -> Result<()> {
        let device_tree = |ids: &[&str]| fdt(&[(PROP_BOARD_IDS, &string_list(ids))]);
        let first = device_tree(&["100:0:1", "500:0:1"]);
        let second = device_tree(&["100:0:1", "600:0:1"]);
        let blob = BlobBuilder::new()
            .entry("DTB", &first, 1)
            .entry("DTB", &second, 1)
            .build();

        let mut device = Device::new(&[("DTB", 4096)]);
        device.storage.load("DTB", &device_tree(&["100:0:1"]))?;
        device.board = vec!["600:0:1".parse()?];
        device.stage(&blob);

        let report = device.install(None)?;
        assert_eq!(report.installed, ["DTB"]);
        assert_eq!(report.skipped, ["DTB"]);
        assert_eq!(device.storage.contents("DTB")?[..second.len()], second[..]);

        // Nothing matches: no DTB is written at all
        device.board = Vec::new();
        device.storage.load("DTB", &device_tree(&["100:0:1"]))?;
        let report = device.install(None)?;
        assert!(report.installed.is_empty());
        assert_eq!(report.skipped.len(), 2);
        Ok(())
    }
}
