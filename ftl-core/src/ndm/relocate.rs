//! Bad-block relocation: move a failing physical block's
//! contents to a fresh one from the reserve pool, crash-safely.
//!
//! The protocol always persists the transfer's *intent* before touching the
//! source block's replacement, so a crash mid-copy leaves enough state in
//! the control record for [`resume_relocation`] to redo the copy from
//! scratch at the next mount. The copy itself is idempotent: it always
//! restarts from page offset 0 regardless of how far a previous attempt
//! got, and never copies past the page offset where the source block
//! failed.

use super::{Ndm, RunningBad, Transfer};
use crate::error::NdmResult;
use ftl_driver::{BadBlockQuery, Driver};
use log::warn;

/// Called when the driver reports `BlockFailed` while writing or erasing
/// virtual block `vbn`. Picks a replacement from the reserve pool, records
/// the transfer as in-progress, and copies the block over.
pub fn mark_bad_block<D: Driver>(ndm: &mut Ndm<D>, vbn: u32, bad_page_offset: u32) -> NdmResult<()> {
    let failed_pbn = ndm.physical_block_of(vbn);
    warn!("ndm: physical block {failed_pbn} (vbn {vbn}) failed at page offset {bad_page_offset}, relocating");

    loop {
        let to_block = allocate_reserve_block(ndm)?;
        ndm.transfer = Some(Transfer {
            from_block: failed_pbn,
            to_block,
            bad_page_offset,
        });
        // Persist intent before copying: if we crash here, resume_relocation
        // redoes the whole copy against the same `to_block`.
        ndm.persist()?;

        if copy_block(ndm, failed_pbn, to_block, bad_page_offset)? {
            ndm.running_bad.push(RunningBad {
                from_block: failed_pbn,
                to_block: Some(to_block),
            });
            ndm.transfer = None;
            ndm.xlate_cache = [None; 2];
            ndm.persist()?;
            return Ok(());
        }
        warn!("ndm: relocation target block {to_block} also failed, picking another");
    }
}

/// Mount-time resumption: a transfer
/// record with no matching `running_bad` completion means the copy was
/// interrupted. Redo it and commit.
pub fn resume_relocation<D: Driver>(ndm: &mut Ndm<D>) -> NdmResult<()> {
    let Some(transfer) = ndm.transfer else {
        return Ok(());
    };
    warn!(
        "ndm: resuming interrupted relocation {} -> {}",
        transfer.from_block, transfer.to_block
    );
    let from_block = transfer.from_block;
    let bad_page_offset = transfer.bad_page_offset;
    let mut to_block = transfer.to_block;
    loop {
        if copy_block(ndm, from_block, to_block, bad_page_offset)? {
            ndm.running_bad.push(RunningBad {
                from_block,
                to_block: Some(to_block),
            });
            ndm.transfer = None;
            ndm.xlate_cache = [None; 2];
            ndm.persist()?;
            return Ok(());
        }
        warn!("ndm: relocation target block {to_block} also failed, picking another");
        to_block = allocate_reserve_block(ndm)?;
        ndm.transfer = Some(Transfer {
            from_block,
            to_block,
            bad_page_offset: transfer.bad_page_offset,
        });
        ndm.persist()?;
    }
}

/// Walk the reserve pool upward from `free_reserve_ptr`, skipping factory-bad
/// blocks and the two control blocks, and claim the first good one.
fn allocate_reserve_block<D: Driver>(ndm: &mut Ndm<D>) -> NdmResult<u32> {
    let mut candidate = ndm.free_reserve_ptr;
    loop {
        if candidate >= ndm.geometry.num_device_blocks {
            return Err(crate::error::NdmError::TooManyBadBlocks);
        }
        let first_page = ndm.geometry.first_page_of_block(candidate);
        let unusable = candidate == ndm.ctrl_blk0
            || candidate == ndm.ctrl_blk1
            || ndm.initial_bad.contains(&candidate)
            || ndm.driver.is_bad_block(first_page) == BadBlockQuery::Bad;
        if !unusable {
            break;
        }
        candidate += 1;
    }
    if ndm.num_bad_blocks() + 1 > ndm.geometry.max_bad_blocks {
        return Err(crate::error::NdmError::TooManyBadBlocks);
    }
    ndm.free_reserve_ptr = candidate + 1;
    Ok(candidate)
}

/// Copy the known-good prefix of `from_block` (page offsets below
/// `bad_page_offset`; offsets at or past it were never reliably written,
/// since writes to a block proceed strictly in offset order) into
/// `to_block`. Pages the driver reports as empty are skipped; pages that
/// fail to read are left empty on the destination rather than aborting the
/// whole relocation, since the source block is already known bad and
/// partial data loss there is unavoidable. Returns `Ok(false)` if
/// `to_block` itself turns out to be bad partway through, so the caller can
/// pick another destination and retry rather than silently accepting a
/// half-copied block.
fn copy_block<D: Driver>(
    ndm: &mut Ndm<D>,
    from_block: u32,
    to_block: u32,
    bad_page_offset: u32,
) -> NdmResult<bool> {
    let pages_per_block = ndm.geometry.pages_per_block;
    let from_first = ndm.geometry.first_page_of_block(from_block);
    let to_first = ndm.geometry.first_page_of_block(to_block);

    ndm.counters.erase_block += 1;
    match ndm.driver.erase_block(to_first) {
        ftl_driver::EraseResult::Ok => {}
        ftl_driver::EraseResult::Fatal => return Err(crate::error::NdmError::Fatal),
        ftl_driver::EraseResult::BlockFailed => return Ok(false),
    }

    let page_size = ndm.geometry.page_size as usize;
    let spare_size = ndm.geometry.spare_size as usize;
    let mut data = vec![0u8; page_size];
    let mut spare = vec![0u8; spare_size];

    let copy_limit = bad_page_offset.min(pages_per_block);
    for offset in 0..copy_limit {
        let old_pn = from_first + offset;
        let new_pn = to_first + offset;

        ndm.counters.read_page += 1;
        match ndm.driver.read_page(old_pn, Some(&mut data), Some(&mut spare)) {
            ftl_driver::ReadResult::Fatal => return Err(crate::error::NdmError::Fatal),
            ftl_driver::ReadResult::Uncorrectable => {
                // Source page unreadable: leave the destination page empty
                // rather than failing the whole relocation.
                continue;
            }
            ftl_driver::ReadResult::Ok | ftl_driver::ReadResult::UnsafeEcc => {}
        }
        if ndm.driver.is_empty_page(&data, &spare) {
            continue;
        }

        ndm.counters.transfer_page += 1;
        match ndm.driver.transfer_page(old_pn, new_pn, &mut data, &spare) {
            Ok(ftl_driver::WriteResult::Ok) => {}
            Ok(ftl_driver::WriteResult::Fatal) => return Err(crate::error::NdmError::Fatal),
            Ok(ftl_driver::WriteResult::BlockFailed) => return Ok(false),
            Err(_) => {
                // Source became unreadable between the emptiness check and
                // the transfer: leave the destination page empty.
                continue;
            }
        }
    }
    Ok(true)
}
