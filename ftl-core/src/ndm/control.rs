//! NDM control-block engine: on-media layout, write rotation,
//! and read/discover protocol.

use super::{DriverCounters, Ndm, RunningBad, Transfer, NONE_BLOCK};
use crate::error::{NdmError, NdmResult};
use crc::{Crc, CRC_32_ISO_HDLC};
use ftl_driver::spare::{encode_control_signature, is_control_signature, CONTROL_PAGE_MARK};
use ftl_driver::{BadBlockQuery, Driver, Geometry, ReadResult, WriteResult};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Length in characters of a partition name (including NUL padding).
pub const NDM_PART_NAME_LEN: usize = 16;

/// On-media control-record format. v2 always carries transfer-in-progress
/// fields and a per-partition user-data blob; v1 carries the former only
/// when a transfer is actually in progress and never the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFormatVersion {
    V1,
    V2,
}

impl ControlFormatVersion {
    /// Bytes of fixed per-page header before the CRC field.
    fn pre_crc_len(self) -> usize {
        match self {
            ControlFormatVersion::V1 => 8,  // current(2) + last(2) + sequence(4)
            ControlFormatVersion::V2 => 12, // major(1) + minor(1) + pad(2) + current(2) + last(2) + sequence(4)
        }
    }

    /// Total bytes of header (including CRC) before the payload starts.
    fn header_len(self) -> usize {
        self.pre_crc_len() + 4
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub first_block: u32,
    pub num_blocks: u32,
    pub name: [u8; NDM_PART_NAME_LEN],
    pub partition_type: u8,
    /// v2 only; empty under v1.
    pub user_data: Vec<u8>,
}

impl PartitionEntry {
    pub fn whole_device(num_virtual_blocks: u32) -> Self {
        let mut name = [0u8; NDM_PART_NAME_LEN];
        let label = b"ftln";
        name[..label.len()].copy_from_slice(label);
        PartitionEntry {
            first_block: 0,
            num_blocks: num_virtual_blocks,
            name,
            partition_type: 1,
            user_data: Vec::new(),
        }
    }
}

/// A fully assembled, validated control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub version: ControlFormatVersion,
    pub num_device_blocks: u32,
    pub block_size: u32,
    pub ctrl_blk0: u32,
    pub ctrl_blk1: u32,
    pub free_reserve_ptr: u32,
    pub free_control_ptr: u32,
    pub transfer: Option<Transfer>,
    pub initial_bad: Vec<u32>,
    pub running_bad: Vec<RunningBad>,
    pub partitions: Vec<PartitionEntry>,
    pub sequence_number: u32,
    /// Physical block this record was read from (discovery only).
    pub found_on_blk0: bool,
}

impl ControlRecord {
    /// Sanity-check a record against the device geometry.
    pub fn validate(&self, geometry: &Geometry) -> NdmResult<()> {
        if self.num_device_blocks != geometry.num_device_blocks {
            return Err(NdmError::BadMetaData);
        }
        let num_bad = self.initial_bad.len() as u32
            + self
                .running_bad
                .iter()
                .filter(|e| e.to_block.is_some())
                .count() as u32;
        if num_bad > geometry.max_bad_blocks {
            return Err(NdmError::BadMetaData);
        }
        for entry in &self.running_bad {
            if let Some(to) = entry.to_block {
                if to == self.ctrl_blk0 || to == self.ctrl_blk1 {
                    return Err(NdmError::BadMetaData);
                }
            }
        }
        let mut sorted: Vec<(u32, u32)> = self
            .partitions
            .iter()
            .map(|p| (p.first_block, p.first_block + p.num_blocks))
            .collect();
        sorted.sort_unstable();
        for w in sorted.windows(2) {
            if w[0].1 > w[1].0 {
                return Err(NdmError::BadMetaData);
            }
        }
        Ok(())
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.num_device_blocks.to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&self.ctrl_blk0.to_le_bytes());
        out.extend_from_slice(&self.ctrl_blk1.to_le_bytes());
        out.extend_from_slice(&self.free_reserve_ptr.to_le_bytes());
        out.extend_from_slice(&self.free_control_ptr.to_le_bytes());
        let xfr_to = self.transfer.map(|t| t.to_block).unwrap_or(NONE_BLOCK);
        out.extend_from_slice(&xfr_to.to_le_bytes());

        let carries_xfr_detail =
            matches!(self.version, ControlFormatVersion::V2) || self.transfer.is_some();
        if carries_xfr_detail {
            let (from, bad_po) = match self.transfer {
                Some(t) => (t.from_block, t.bad_page_offset),
                None => (NONE_BLOCK, NONE_BLOCK),
            };
            out.extend_from_slice(&from.to_le_bytes());
            out.extend_from_slice(&bad_po.to_le_bytes());
            if matches!(self.version, ControlFormatVersion::V1) {
                out.push(0); // legacy partial-scan byte, unused
            }
        }

        out.extend_from_slice(&(self.partitions.len() as u32).to_le_bytes());

        for &b in &self.initial_bad {
            out.extend_from_slice(&b.to_le_bytes());
        }
        out.extend_from_slice(&self.num_device_blocks.to_le_bytes()); // sentinel

        for entry in &self.running_bad {
            out.extend_from_slice(&(entry.from_block as i32).to_le_bytes());
            let to = entry.to_block.map(|t| t as i32).unwrap_or(-1);
            out.extend_from_slice(&to.to_le_bytes());
        }
        out.extend_from_slice(&(-1i32).to_le_bytes());
        out.extend_from_slice(&(-1i32).to_le_bytes());

        for part in &self.partitions {
            out.extend_from_slice(&part.first_block.to_le_bytes());
            out.extend_from_slice(&part.num_blocks.to_le_bytes());
            out.extend_from_slice(&part.name);
            out.push(part.partition_type);
            if matches!(self.version, ControlFormatVersion::V2) {
                out.extend_from_slice(&(part.user_data.len() as u32).to_le_bytes());
                out.extend_from_slice(&part.user_data);
            }
        }
        out
    }

    fn decode_payload(
        data: &[u8],
        version: ControlFormatVersion,
        sequence_number: u32,
    ) -> NdmResult<Self> {
        let mut r = Reader::new(data);
        let num_device_blocks = r.u32()?;
        let block_size = r.u32()?;
        let ctrl_blk0 = r.u32()?;
        let ctrl_blk1 = r.u32()?;
        let free_reserve_ptr = r.u32()?;
        let free_control_ptr = r.u32()?;
        let xfr_to = r.u32()?;

        let carries_xfr_detail = matches!(version, ControlFormatVersion::V2) || xfr_to != NONE_BLOCK;
        let transfer = if carries_xfr_detail {
            let from = r.u32()?;
            let bad_po = r.u32()?;
            if matches!(version, ControlFormatVersion::V1) {
                r.u8()?; // legacy partial-scan byte
            }
            if xfr_to == NONE_BLOCK {
                None
            } else {
                Some(Transfer {
                    from_block: from,
                    to_block: xfr_to,
                    bad_page_offset: bad_po,
                })
            }
        } else {
            None
        };

        let num_partitions = r.u32()? as usize;

        let mut initial_bad = Vec::new();
        loop {
            let b = r.u32()?;
            if b == num_device_blocks {
                break;
            }
            initial_bad.push(b);
        }

        let mut running_bad = Vec::new();
        loop {
            let from = r.i32()?;
            let to = r.i32()?;
            if from == -1 && to == -1 {
                break;
            }
            running_bad.push(RunningBad {
                from_block: from as u32,
                to_block: if to < 0 { None } else { Some(to as u32) },
            });
        }

        let mut partitions = Vec::with_capacity(num_partitions);
        for _ in 0..num_partitions {
            let first_block = r.u32()?;
            let num_blocks = r.u32()?;
            let mut name = [0u8; NDM_PART_NAME_LEN];
            name.copy_from_slice(r.bytes(NDM_PART_NAME_LEN)?);
            let partition_type = r.u8()?;
            let user_data = if matches!(version, ControlFormatVersion::V2) {
                let len = r.u32()? as usize;
                r.bytes(len)?.to_vec()
            } else {
                Vec::new()
            };
            partitions.push(PartitionEntry {
                first_block,
                num_blocks,
                name,
                partition_type,
                user_data,
            });
        }

        Ok(ControlRecord {
            version,
            num_device_blocks,
            block_size,
            ctrl_blk0,
            ctrl_blk1,
            free_reserve_ptr,
            free_control_ptr,
            transfer,
            initial_bad,
            running_bad,
            partitions,
            sequence_number,
            found_on_blk0: false,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }
    fn bytes(&mut self, n: usize) -> NdmResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(NdmError::BadMetaData);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
    fn u32(&mut self) -> NdmResult<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }
    fn i32(&mut self) -> NdmResult<i32> {
        Ok(i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }
    fn u8(&mut self) -> NdmResult<u8> {
        Ok(self.bytes(1)?[0])
    }
}

fn page_header_write(
    version: ControlFormatVersion,
    current_page_number: u16,
    last_page_number: u16,
    sequence_number: u32,
    page: &mut [u8],
) {
    match version {
        ControlFormatVersion::V1 => {
            page[0..2].copy_from_slice(&current_page_number.to_le_bytes());
            page[2..4].copy_from_slice(&last_page_number.to_le_bytes());
            page[4..8].copy_from_slice(&sequence_number.to_le_bytes());
            page[8..12].copy_from_slice(&0u32.to_le_bytes());
        }
        ControlFormatVersion::V2 => {
            page[0] = 2;
            page[1] = 0;
            page[2..4].copy_from_slice(&0u16.to_le_bytes());
            page[4..6].copy_from_slice(&current_page_number.to_le_bytes());
            page[6..8].copy_from_slice(&last_page_number.to_le_bytes());
            page[8..12].copy_from_slice(&sequence_number.to_le_bytes());
            page[12..16].copy_from_slice(&0u32.to_le_bytes());
        }
    }
    let crc = CRC32.checksum(page);
    let crc_off = version.pre_crc_len();
    page[crc_off..crc_off + 4].copy_from_slice(&crc.to_le_bytes());
}

struct ParsedHeader {
    current_page_number: u16,
    last_page_number: u16,
    sequence_number: u32,
    crc_ok: bool,
}

fn page_header_read(version: ControlFormatVersion, page: &[u8]) -> ParsedHeader {
    let (current_page_number, last_page_number, sequence_number, crc_stored) = match version {
        ControlFormatVersion::V1 => (
            u16::from_le_bytes([page[0], page[1]]),
            u16::from_le_bytes([page[2], page[3]]),
            u32::from_le_bytes([page[4], page[5], page[6], page[7]]),
            u32::from_le_bytes([page[8], page[9], page[10], page[11]]),
        ),
        ControlFormatVersion::V2 => (
            u16::from_le_bytes([page[4], page[5]]),
            u16::from_le_bytes([page[6], page[7]]),
            u32::from_le_bytes([page[8], page[9], page[10], page[11]]),
            u32::from_le_bytes([page[12], page[13], page[14], page[15]]),
        ),
    };
    let mut check = page.to_vec();
    let crc_off = version.pre_crc_len();
    check[crc_off..crc_off + 4].copy_from_slice(&0u32.to_le_bytes());
    let computed = CRC32.checksum(&check);
    ParsedHeader {
        current_page_number,
        last_page_number,
        sequence_number,
        crc_ok: computed == crc_stored,
    }
}

/// Write-protocol: rotate the control record onto `target_block`.
pub fn write_control_record<D: Driver>(ndm: &mut Ndm<D>, target_block: u32) -> NdmResult<()> {
    loop {
        let record = ControlRecord {
            version: ndm.format_version,
            num_device_blocks: ndm.geometry.num_device_blocks,
            block_size: ndm.geometry.block_size() as u32,
            ctrl_blk0: ndm.ctrl_blk0,
            ctrl_blk1: ndm.ctrl_blk1,
            free_reserve_ptr: ndm.free_reserve_ptr,
            free_control_ptr: ndm.free_control_ptr,
            transfer: ndm.transfer,
            initial_bad: ndm.initial_bad.clone(),
            running_bad: ndm.running_bad.clone(),
            partitions: ndm.partitions.clone(),
            sequence_number: 0,
            found_on_blk0: false,
        };
        let payload = record.encode_payload();
        let header_len = ndm.format_version.header_len();
        let page_size = ndm.geometry.page_size as usize;
        let capacity = page_size.saturating_sub(header_len);
        let total_pages = payload.len().div_ceil(capacity).max(1) as u16;

        let first_page = ndm.geometry.first_page_of_block(target_block);
        ndm.counters.erase_block += 1;
        match ndm.driver.erase_block(first_page) {
            ftl_driver::EraseResult::Ok => {}
            ftl_driver::EraseResult::Fatal => return Err(NdmError::Fatal),
            ftl_driver::EraseResult::BlockFailed => {
                let new_target = handle_control_block_failure(ndm, target_block)?;
                return write_control_record(ndm, new_target);
            }
        }

        let sequence_number = ndm.high_block_count + 1;
        let mut spare = vec![0xFFu8; ndm.geometry.spare_size as usize];
        let mut failed = false;
        for page_idx in 0..total_pages {
            let start = page_idx as usize * capacity;
            let end = (start + capacity).min(payload.len());
            let mut page = vec![0xFFu8; page_size];
            if start < payload.len() {
                page[header_len..header_len + (end - start)].copy_from_slice(&payload[start..end]);
            }
            page_header_write(
                ndm.format_version,
                page_idx + 1,
                total_pages,
                sequence_number,
                &mut page,
            );
            encode_control_signature(&mut spare);
            ndm.counters.write_page += 1;
            match ndm
                .driver
                .write_page(first_page + page_idx as u32, &page, &spare)
            {
                WriteResult::Ok => {}
                WriteResult::Fatal => return Err(NdmError::Fatal),
                WriteResult::BlockFailed => {
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            let new_target = handle_control_block_failure(ndm, target_block)?;
            return write_control_record(ndm, new_target);
        }

        ndm.high_block_count = sequence_number;
        return Ok(());
    }
}

fn handle_control_block_failure<D: Driver>(ndm: &mut Ndm<D>, failed_block: u32) -> NdmResult<u32> {
    let other = if failed_block == ndm.ctrl_blk0 {
        ndm.ctrl_blk1
    } else {
        ndm.ctrl_blk0
    };
    let mut candidate = ndm.free_control_ptr;
    loop {
        let first_page = ndm.geometry.first_page_of_block(candidate);
        let is_bad = ndm.initial_bad.contains(&candidate)
            || candidate == other
            || ndm.driver.is_bad_block(first_page) == BadBlockQuery::Bad;
        if !is_bad {
            break;
        }
        if candidate == 0 {
            return Err(NdmError::TooManyBadBlocks);
        }
        candidate -= 1;
    }
    ndm.running_bad.push(RunningBad {
        from_block: failed_block,
        to_block: Some(candidate),
    });
    if ndm.num_bad_blocks() > ndm.geometry.max_bad_blocks {
        return Err(NdmError::TooManyBadBlocks);
    }
    ndm.free_control_ptr = candidate.saturating_sub(1);
    if failed_block == ndm.ctrl_blk0 {
        ndm.ctrl_blk0 = candidate;
    } else {
        ndm.ctrl_blk1 = candidate;
    }
    Ok(candidate)
}

/// Read/discover protocol: find the current control record by
/// scanning the top region of the device for the highest `sequence_number`
/// complete record.
pub fn discover_control_record<D: Driver>(
    driver: &mut D,
    geometry: &Geometry,
    counters: &mut DriverCounters,
) -> NdmResult<ControlRecord> {
    let low = geometry.num_virtual_blocks_capacity();
    let high = geometry.num_device_blocks;
    let mut best: Option<ControlRecord> = None;
    let mut saw_signature = false;

    for block in (low..high).rev() {
        let first_page = geometry.first_page_of_block(block);
        let mut spare = vec![0u8; geometry.spare_size as usize];
        let mut first_main = vec![0u8; geometry.page_size as usize];
        counters.read_spare += 1;
        let r = driver.read_page(first_page, Some(&mut first_main), Some(&mut spare));
        if r == ReadResult::Fatal {
            return Err(NdmError::Fatal);
        }
        if !is_control_signature(&spare) || spare[15] != CONTROL_PAGE_MARK {
            continue;
        }
        saw_signature = true;

        if let Some(record) = try_assemble_record(driver, geometry, block, counters) {
            let better = match &best {
                None => true,
                Some(b) => record.sequence_number > b.sequence_number,
            };
            if better {
                best = Some(record);
            }
        }
    }

    match best {
        Some(mut record) => {
            record.found_on_blk0 = true; // recomputed precisely by caller if needed
            Ok(record)
        }
        None if saw_signature => Err(NdmError::NoMetaData),
        None => Err(NdmError::NoMetaBlock),
    }
}

fn try_assemble_record<D: Driver>(
    driver: &mut D,
    geometry: &Geometry,
    block: u32,
    counters: &mut DriverCounters,
) -> Option<ControlRecord> {
    let first_page = geometry.first_page_of_block(block);
    let page_size = geometry.page_size as usize;
    let mut page0 = vec![0u8; page_size];
    counters.read_page += 1;
    if driver.read_page(first_page, Some(&mut page0), None) != ReadResult::Ok {
        return None;
    }
    // try v2 first: its header happens to overlap v1's layout only in that
    // both start with small integers, so validate via CRC for whichever
    // version parses consistently.
    for version in [ControlFormatVersion::V2, ControlFormatVersion::V1] {
        let hdr = page_header_read(version, &page0);
        if !hdr.crc_ok || hdr.current_page_number != 1 || hdr.last_page_number == 0 {
            continue;
        }
        let header_len = version.header_len();
        let mut payload = page0[header_len..].to_vec();
        let mut ok = true;
        for page_idx in 1..hdr.last_page_number {
            let mut page = vec![0u8; page_size];
            counters.read_page += 1;
            if driver.read_page(first_page + page_idx as u32, Some(&mut page), None) != ReadResult::Ok {
                ok = false;
                break;
            }
            let this_hdr = page_header_read(version, &page);
            if !this_hdr.crc_ok
                || this_hdr.current_page_number != page_idx + 1
                || this_hdr.last_page_number != hdr.last_page_number
                || this_hdr.sequence_number != hdr.sequence_number
            {
                ok = false;
                break;
            }
            payload.extend_from_slice(&page[header_len..]);
        }
        if !ok {
            continue;
        }
        if let Ok(record) = ControlRecord::decode_payload(&payload, version, hdr.sequence_number) {
            return Some(record);
        }
    }
    None
}
