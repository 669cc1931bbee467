//! Recycle / wear-leveling victim selection and execution.

use super::bdata::BlockData;
use super::{io_ctx, Ftln};
use crate::error::{FtlError, FtlResult};
use ftl_driver::spare::UNMAPPED_PN;
use ftl_driver::Driver;
use log::{debug, trace};

/// Penalty/bonus constants from the priority formula.
const FREE_PAGE_WEIGHT: u32 = 256;
const LOW_WEAR_BOOST_BONUS: u32 = 0x0010_0000;
const READ_WEAR_BONUS: u32 = 0x0020_0000;

/// Pick a free block to put into service: prefer the *highest*-wear free
/// block once the volume is low on free space (levels wear up toward the
/// average), otherwise the *lowest*-wear one.
pub(crate) fn choose_free_block(
    bdata: &mut [BlockData],
    blk_wc_lag: &[u8],
    prefer_high_wear: bool,
) -> Option<u32> {
    let mut best: Option<(u32, u8)> = None;
    for (i, b) in bdata.iter().enumerate() {
        if !b.is_free() {
            continue;
        }
        let lag = blk_wc_lag[i];
        let better = match best {
            None => true,
            Some((_, best_lag)) => {
                if prefer_high_wear {
                    lag < best_lag // lower lag = higher wear
                } else {
                    lag > best_lag // higher lag = lower wear
                }
            }
        };
        if better {
            best = Some((i as u32, lag));
        }
    }
    best.map(|(i, _)| i)
}

/// True if a recycle pass should run before the next `pending_user_pages`
/// are written: a block is flagged for read-wear, or free space is tight
/// enough that the pending write (plus safety margin) wouldn't fit.
pub(crate) fn is_recycle_needed<D: Driver>(ftln: &Ftln<D>, pending_user_pages: u32) -> bool {
    if ftln.max_rc_blk.is_some() {
        return true;
    }
    let pages_per_block = ftln.ndm.geometry().pages_per_block;

    let mut required = 1u32; // one-block safety margin for powerfail resume (step: "plus a margin")

    let free_in_vpn_block = match ftln.free_vpn {
        Some(ppn) => pages_per_block - ftln.ndm.geometry().page_offset_in_block(ppn),
        None => 0,
    };
    if free_in_vpn_block < pending_user_pages {
        let deficit = pending_user_pages - free_in_vpn_block;
        required += deficit.div_ceil(pages_per_block);
    }

    let free_in_mpn_block = match ftln.free_mpn {
        Some(ppn) => pages_per_block - ftln.ndm.geometry().page_offset_in_block(ppn),
        None => 0,
    };
    let dirty_map_pages = ftln.map_cache.num_dirty() as u32;
    if free_in_mpn_block < dirty_map_pages {
        let deficit = dirty_map_pages - free_in_mpn_block;
        required += deficit.div_ceil(pages_per_block);
    }

    ftln.num_free_blks < ftln.config.min_free_blks || ftln.num_free_blks < required
}

/// Compute the recycle priority of block `b`.
fn priority<D: Driver>(ftln: &Ftln<D>, b: u32, boost_low_wear: bool) -> u32 {
    let pages_per_block = ftln.ndm.geometry().pages_per_block;
    let used = ftln.bdata[b as usize].num_used_pages();
    let mut p = (pages_per_block - used.min(pages_per_block)) * FREE_PAGE_WEIGHT;
    p += ftln.blk_wc_lag[b as usize] as u32;
    if boost_low_wear {
        let cur_max_lag = ftln.blk_wc_lag.iter().copied().max().unwrap_or(0) as u32;
        if ftln.blk_wc_lag[b as usize] as u32 + ftln.config.low_wear_boost >= cur_max_lag {
            p += LOW_WEAR_BOOST_BONUS;
        }
    }
    if ftln.bdata[b as usize].read_count() >= ftln.config.max_rc {
        p += READ_WEAR_BONUS;
    }
    p
}

/// Choose which used block to reclaim next. Returns `None`
/// only when there is truly nothing eligible to recycle.
fn choose_victim<D: Driver>(ftln: &Ftln<D>) -> Option<u32> {
    let boost_low_wear = ftln.recycle_cnt & 1 == 0;
    let mut best: Option<(u32, u32, bool)> = None; // (block, priority, is_map_block)
    for (i, b) in ftln.bdata.iter().enumerate() {
        if b.is_free() {
            continue;
        }
        let i = i as u32;
        if Some(ftln.ndm.geometry().block_of_page(ftln.free_vpn.unwrap_or(u32::MAX))) == Some(i) {
            continue;
        }
        if Some(ftln.ndm.geometry().block_of_page(ftln.free_mpn.unwrap_or(u32::MAX))) == Some(i) {
            continue;
        }
        let pr = priority(ftln, i, boost_low_wear);
        let is_map = b.is_map_block();
        let better = match &best {
            None => true,
            Some((_, best_pr, best_is_map)) => {
                pr > *best_pr || (pr == *best_pr && *best_is_map && !is_map)
            }
        };
        if better {
            best = Some((i, pr, is_map));
        }
    }
    best.map(|(i, _, _)| i)
}

/// Erase `vbn`, bumping its wear-count lag and, if it was the device-wide
/// minimum, `high_wc` and every other block's lag.
fn erase_and_update_wear<D: Driver>(ftln: &mut Ftln<D>, vbn: u32) -> FtlResult<()> {
    ftln.ndm.erase_block(vbn).map_err(FtlError::from)?;
    if ftln.blk_wc_lag[vbn as usize] == 0 {
        ftln.high_wc += 1;
        for lag in ftln.blk_wc_lag.iter_mut() {
            *lag = lag.saturating_add(1);
        }
    } else {
        ftln.blk_wc_lag[vbn as usize] -= 1;
    }
    ftln.bdata[vbn as usize].mark_free_erased();
    ftln.num_free_blks += 1;
    Ok(())
}

/// Relocate every live page off `victim` and erase it.
fn recycle_volume_block<D: Driver>(ftln: &mut Ftln<D>, victim: u32) -> FtlResult<()> {
    let geometry = *ftln.ndm.geometry();
    let first_page = geometry.first_page_of_block(victim);
    let mut data = vec![0u8; geometry.page_size as usize];
    let mut spare = vec![0u8; geometry.spare_size as usize];

    for offset in 0..geometry.pages_per_block {
        let old_ppn = first_page + offset;
        match ftln.ndm.read_page(old_ppn, Some(&mut data), Some(&mut spare)).map_err(FtlError::from)? {
            ftl_driver::ReadResult::Ok | ftl_driver::ReadResult::UnsafeEcc => {}
            ftl_driver::ReadResult::Uncorrectable => continue,
            ftl_driver::ReadResult::Fatal => return Err(FtlError::Fatal),
        }
        if ftln.ndm.driver.is_empty_page(&data, &spare) {
            continue;
        }
        let meta = ftl_driver::spare::SpareMeta::decode(&spare);
        if meta.is_control_page {
            continue;
        }
        let vpn = meta.virtual_page;
        if vpn == UNMAPPED_PN || vpn >= ftln.num_vpages {
            continue;
        }
        if ftln.lookup_ppn(vpn)? != old_ppn {
            continue; // stale copy, already superseded
        }

        let low_on_free = ftln.num_free_blks < ftln.config.min_free_blks;
        let new_ppn = allocate_from_free_vpn(ftln, low_on_free)?;
        let new_block = geometry.block_of_page(new_ppn);
        let wear_count = ftln.high_wc.saturating_sub(ftln.blk_wc_lag[new_block as usize] as u32);
        let new_meta = ftl_driver::spare::SpareMeta::for_page(vpn, ftl_driver::spare::NO_BLOCK_COUNT, wear_count);
        let mut new_spare = vec![0u8; geometry.spare_size as usize];
        new_meta.encode(&mut new_spare);

        match ftln.ndm.write_page(new_ppn, &data, &new_spare).map_err(FtlError::from)? {
            ftl_driver::WriteResult::Ok => {}
            ftl_driver::WriteResult::Fatal => return Err(FtlError::Fatal),
            ftl_driver::WriteResult::BlockFailed => unreachable!("Ndm resolves BlockFailed internally"),
        }
        ftln.set_ppn(vpn, new_ppn)?;
        advance_free_vpn_cursor(ftln, new_ppn);
    }

    let mut io = io_ctx!(ftln);
    ftln.map_cache.flush_all(&mut io)?;
    erase_and_update_wear(ftln, victim)?;
    ftln.recycle_cnt += 1;
    debug!("ndm: recycled volume block {victim}");
    Ok(())
}

fn allocate_from_free_vpn<D: Driver>(ftln: &mut Ftln<D>, low_on_free: bool) -> FtlResult<u32> {
    if let Some(ppn) = ftln.free_vpn {
        return Ok(ppn);
    }
    let vbn = choose_free_block(&mut ftln.bdata, &ftln.blk_wc_lag, low_on_free).ok_or(FtlError::NoSpace)?;
    ftln.bdata[vbn as usize].mark_used(false);
    ftln.num_free_blks -= 1;
    let first_page = ftln.ndm.geometry().first_page_of_block(vbn);
    ftln.free_vpn = Some(first_page);
    Ok(first_page)
}

fn advance_free_vpn_cursor<D: Driver>(ftln: &mut Ftln<D>, just_written: u32) {
    let pages_per_block = ftln.ndm.geometry().pages_per_block;
    ftln.free_vpn = if (just_written + 1) % pages_per_block == 0 {
        None
    } else {
        Some(just_written + 1)
    };
}

/// Relocate every live map page off `victim` and erase it.
fn recycle_map_block<D: Driver>(ftln: &mut Ftln<D>, victim: u32) -> FtlResult<()> {
    let geometry = *ftln.ndm.geometry();
    for (mpn, &ppn) in ftln.mpns.clone().iter().enumerate() {
        if ppn == UNMAPPED_PN || geometry.block_of_page(ppn) != victim {
            continue;
        }
        // Faulting the page in for a write relocates it through the normal
        // map-cache write-back path the next time it is flushed.
        let mut io = io_ctx!(ftln);
        let slot = ftln.map_cache.access(mpn as u32, true, &mut io)?;
        let _ = slot;
    }
    let mut io = io_ctx!(ftln);
    ftln.map_cache.flush_all(&mut io)?;
    erase_and_update_wear(ftln, victim)?;
    ftln.recycle_cnt += 1;
    debug!("ndm: recycled map block {victim}");
    Ok(())
}

/// Run one recycle pass: choose a victim and reclaim it. Returns
/// `Err(FtlError::Stop)` when there is nothing left eligible.
pub fn recycle_one<D: Driver>(ftln: &mut Ftln<D>) -> FtlResult<()> {
    let victim = choose_victim(ftln).ok_or(FtlError::Stop)?;
    trace!("ndm: recycling victim block {victim}");
    if ftln.bdata[victim as usize].is_map_block() {
        recycle_map_block(ftln, victim)
    } else {
        recycle_volume_block(ftln, victim)
    }
}

/// Run recycles until `is_recycle_needed` is satisfied for `pending_user_pages`.
pub(crate) fn recycle_until_satisfied<D: Driver>(
    ftln: &mut Ftln<D>,
    pending_user_pages: u32,
) -> FtlResult<()> {
    while is_recycle_needed(ftln, pending_user_pages) {
        match recycle_one(ftln) {
            Ok(()) => continue,
            Err(FtlError::Stop) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
