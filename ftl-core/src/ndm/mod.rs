//! NDM (NAND Device Manager): bad-block remapping over a raw device.
//!
//! Presents a contiguous virtual block address space over
//! a physical device with factory-bad and runtime-bad blocks. Persists its
//! remap tables redundantly in two control blocks and guarantees forward
//! progress under power failure during bad-block relocation.

pub mod control;
pub mod relocate;

use crate::error::{NdmError, NdmResult};
use bitflags::bitflags;
use ftl_driver::{BadBlockQuery, Driver, EraseResult, Geometry, ReadResult, WriteResult};

pub use control::{ControlFormatVersion, ControlRecord, PartitionEntry, NDM_PART_NAME_LEN};

/// Sentinel meaning "no block"/"no transfer in progress".
pub const NONE_BLOCK: u32 = u32::MAX;

/// An entry in the running bad-block list: `from_block` (a
/// post-initial-remap virtual block number) went bad and was substituted by
/// `to_block`, or by nothing yet if `to_block` is `None` (the replacement
/// itself went bad before the transfer completed, and a further entry with
/// a non-`None` `to_block` resolves the chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningBad {
    pub from_block: u32,
    pub to_block: Option<u32>,
}

/// Bad-block relocation in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub from_block: u32,
    pub to_block: u32,
    pub bad_page_offset: u32,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NdmFlags: u32 {
        /// Mounted read-only: refuse writes, refuse relocation resume, never
        /// silently corrupt media.
        const READ_ONLY = 1 << 0;
        /// Unrecoverable I/O failure observed; the device is dead until
        /// re-mounted.
        const FATAL_ERR = 1 << 1;
    }
}

/// Tallies of driver calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCounters {
    pub write_page: u64,
    pub read_page: u64,
    pub erase_block: u64,
    pub read_spare: u64,
    pub page_check: u64,
    pub transfer_page: u64,
}

/// The NAND Device Manager. Generic over the driver it talks to.
pub struct Ndm<D: Driver> {
    pub(crate) driver: D,
    pub(crate) geometry: Geometry,
    pub(crate) num_virtual_blocks: u32,
    pub(crate) initial_bad: Vec<u32>,
    pub(crate) running_bad: Vec<RunningBad>,
    pub(crate) ctrl_blk0: u32,
    pub(crate) ctrl_blk1: u32,
    /// Which of ctrl_blk0/ctrl_blk1 currently holds the newest record.
    pub(crate) active_ctrl_is_blk0: bool,
    pub(crate) free_reserve_ptr: u32,
    pub(crate) free_control_ptr: u32,
    pub(crate) transfer: Option<Transfer>,
    pub(crate) high_block_count: u32,
    pub(crate) format_version: ControlFormatVersion,
    pub(crate) partitions: Vec<PartitionEntry>,
    pub(crate) flags: NdmFlags,
    pub(crate) counters: DriverCounters,
    /// Two-slot translation cache: (last-read vbn, pbn), (last-write vbn, pbn).
    pub(crate) xlate_cache: [Option<(u32, u32)>; 2],
}

impl<D: Driver> Ndm<D> {
    /// `num_virtual_blocks = num_device_blocks - max_bad_blocks - 2`.
    pub fn num_virtual_blocks(&self) -> u32 {
        self.num_virtual_blocks
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(NdmFlags::READ_ONLY)
    }

    pub fn is_fatal(&self) -> bool {
        self.flags.contains(NdmFlags::FATAL_ERR)
    }

    pub fn num_bad_blocks(&self) -> u32 {
        self.initial_bad.len() as u32
            + self
                .running_bad
                .iter()
                .filter(|e| e.to_block.is_some())
                .count() as u32
    }

    pub fn counters(&self) -> DriverCounters {
        self.counters
    }

    /// Format a fresh device: scan for factory-bad blocks, lay out the two
    /// control blocks at the top of the device, and write the first control
    /// record. `read_only` devices cannot be formatted.
    pub fn format(driver: D, geometry: Geometry, version: ControlFormatVersion) -> NdmResult<Self> {
        let mut driver = driver;
        let num_virtual_blocks = geometry.num_virtual_blocks_capacity();
        let mut initial_bad = Vec::new();
        for b in 0..geometry.num_device_blocks {
            let first_page = geometry.first_page_of_block(b);
            if driver.is_bad_block(first_page) == BadBlockQuery::Bad {
                initial_bad.push(b);
            }
        }
        if initial_bad.len() as u32 > geometry.max_bad_blocks {
            return Err(NdmError::TooManyBadBlocks);
        }

        let ctrl_blk1 = geometry.num_device_blocks - 1;
        let ctrl_blk0 = geometry.num_device_blocks - 2;
        let free_reserve_ptr = num_virtual_blocks + initial_bad.len() as u32;
        let free_control_ptr = ctrl_blk0;

        let mut ndm = Ndm {
            driver,
            geometry,
            num_virtual_blocks,
            initial_bad,
            running_bad: Vec::new(),
            ctrl_blk0,
            ctrl_blk1,
            active_ctrl_is_blk0: true,
            free_reserve_ptr,
            free_control_ptr,
            transfer: None,
            high_block_count: 0,
            format_version: version,
            partitions: vec![PartitionEntry::whole_device(num_virtual_blocks)],
            flags: NdmFlags::empty(),
            counters: DriverCounters::default(),
            xlate_cache: [None; 2],
        };
        ndm.erase_and_write_control(ndm.ctrl_blk0)?;
        Ok(ndm)
    }

    /// Mount: discover the current control record, restore
    /// in-RAM state, and resume any interrupted relocation.
    pub fn mount(mut driver: D, geometry: Geometry, read_only: bool) -> NdmResult<Self> {
        let record = control::discover_control_record(&mut driver, &geometry, &mut DriverCounters::default())?;
        record.validate(&geometry)?;

        let num_virtual_blocks = geometry.num_virtual_blocks_capacity();
        let mut ndm = Ndm {
            driver,
            geometry,
            num_virtual_blocks,
            initial_bad: record.initial_bad.clone(),
            running_bad: record.running_bad.clone(),
            ctrl_blk0: record.ctrl_blk0,
            ctrl_blk1: record.ctrl_blk1,
            active_ctrl_is_blk0: record.found_on_blk0,
            free_reserve_ptr: record.free_reserve_ptr,
            free_control_ptr: record.free_control_ptr,
            transfer: record.transfer,
            high_block_count: record.sequence_number,
            format_version: record.version,
            partitions: record.partitions.clone(),
            flags: if read_only {
                NdmFlags::READ_ONLY
            } else {
                NdmFlags::empty()
            },
            counters: DriverCounters::default(),
            xlate_cache: [None; 2],
        };

        if ndm.transfer.is_some() {
            if ndm.is_read_only() {
                // A read-only mount must not touch media even with a
                // relocation pending. Surface an error instead of silently
                // resuming or silently ignoring it.
                return Err(NdmError::ReadOnly);
            }
            relocate::resume_relocation(&mut ndm)?;
        }

        Ok(ndm)
    }

    /// Maps a virtual block number to its current physical block, folding in
    /// both the initial factory-bad remap and any subsequent relocations.
    pub fn physical_block_of(&self, v: u32) -> u32 {
        let mut p = v;
        for (i, &ib) in self.initial_bad.iter().enumerate() {
            if ib <= p + i as u32 {
                p += 1;
            }
        }
        for entry in &self.running_bad {
            if entry.from_block == p {
                if let Some(to) = entry.to_block {
                    p = to;
                }
            }
        }
        p
    }

    fn xlate_cached(&mut self, v: u32, slot: usize) -> u32 {
        if let Some((cv, cp)) = self.xlate_cache[slot] {
            if cv == v {
                return cp;
            }
        }
        let p = self.physical_block_of(v);
        self.xlate_cache[slot] = Some((v, p));
        p
    }

    /// Read a page at virtual page `vpn` (vbn = vpn / pages_per_block).
    pub fn read_page(
        &mut self,
        vpn: u32,
        data: Option<&mut [u8]>,
        spare: Option<&mut [u8]>,
    ) -> NdmResult<ReadResult> {
        let vbn = self.geometry.block_of_page(vpn);
        let offset = self.geometry.page_offset_in_block(vpn);
        let pbn = self.xlate_cached(vbn, 0);
        let pn = self.geometry.first_page_of_block(pbn) + offset;
        self.counters.read_page += 1;
        let result = self.driver.read_page(pn, data, spare);
        if result == ReadResult::Fatal {
            self.flags.insert(NdmFlags::FATAL_ERR);
        }
        Ok(result)
    }

    /// Write a page at virtual page `vpn`; transparently relocates the
    /// owning virtual block if the driver reports the physical block bad.
    pub fn write_page(&mut self, vpn: u32, data: &[u8], spare: &[u8]) -> NdmResult<WriteResult> {
        if self.is_read_only() {
            return Err(NdmError::ReadOnly);
        }
        let vbn = self.geometry.block_of_page(vpn);
        loop {
            let pbn = self.xlate_cached(vbn, 1);
            let offset = self.geometry.page_offset_in_block(vpn);
            let pn = self.geometry.first_page_of_block(pbn) + offset;
            self.counters.write_page += 1;
            match self.driver.write_page(pn, data, spare) {
                WriteResult::Ok => return Ok(WriteResult::Ok),
                WriteResult::Fatal => {
                    self.flags.insert(NdmFlags::FATAL_ERR);
                    return Ok(WriteResult::Fatal);
                }
                WriteResult::BlockFailed => {
                    relocate::mark_bad_block(self, vbn, offset)?;
                    // retry the whole virtual page write against the new mapping
                }
            }
        }
    }

    /// Erase the virtual block `vbn`; transparently relocates on failure.
    pub fn erase_block(&mut self, vbn: u32) -> NdmResult<()> {
        if self.is_read_only() {
            return Err(NdmError::ReadOnly);
        }
        loop {
            let pbn = self.xlate_cached(vbn, 1);
            let pn = self.geometry.first_page_of_block(pbn);
            self.counters.erase_block += 1;
            match self.driver.erase_block(pn) {
                EraseResult::Ok => return Ok(()),
                EraseResult::Fatal => {
                    self.flags.insert(NdmFlags::FATAL_ERR);
                    return Ok(());
                }
                EraseResult::BlockFailed => {
                    relocate::mark_bad_block(self, vbn, 0)?;
                }
            }
        }
    }

    /// Write (rotate) the control record onto `target_block`.
    pub(crate) fn erase_and_write_control(&mut self, target_block: u32) -> NdmResult<()> {
        control::write_control_record(self, target_block)
    }

    pub(crate) fn persist(&mut self) -> NdmResult<()> {
        let target = if self.active_ctrl_is_blk0 {
            self.ctrl_blk1
        } else {
            self.ctrl_blk0
        };
        self.erase_and_write_control(target)?;
        self.active_ctrl_is_blk0 = !self.active_ctrl_is_blk0;
        Ok(())
    }

    /// First physical block of the reserve pool: `physical_block_of` only
    /// ever touches blocks below this (it advances by one for every
    /// factory-bad block at or below the position it's walked so far, so
    /// `num_virtual_blocks + len(initial_bad)` is always high enough to be
    /// clear of it).
    pub(crate) fn first_reserved(&self) -> u32 {
        self.num_virtual_blocks + self.initial_bad.len() as u32
    }
}
