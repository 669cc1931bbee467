//! FTL-N init / mount / power-fail resume.

use super::bdata::BlockData;
use super::map_cache::MapCache;
use super::meta::MetaPageBody;
use super::{io_ctx, recycle, Ftln};
use crate::config::VolumeConfig;
use crate::error::{FtlError, FtlResult};
use crate::ndm::Ndm;
use ftl_driver::spare::{SpareMeta, NO_BLOCK_COUNT, UNMAPPED_PN};
use ftl_driver::{Driver, Geometry, ReadResult, WriteResult};
use log::{debug, info, warn};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Free,
    Map,
    Volume,
}

/// Iteratively converge on `(num_vpages, num_map_pgs, mappings_per_mpg)`:
/// the map needs enough pages to cover `num_vpages`, but the blocks spent on
/// the map (plus free-pool headroom) come out of the same virtual-block
/// budget that `num_vpages` is computed from. A handful of iterations always
/// converges since both sides move monotonically with block counts.
fn compute_layout(
    geometry: &Geometry,
    config: &VolumeConfig,
    num_virtual_blocks: u32,
) -> FtlResult<(u32, u32, u32)> {
    let pages_per_block = geometry.pages_per_block;
    let mappings_per_mpg = geometry.page_size / 4;
    if mappings_per_mpg == 0 {
        return Err(FtlError::InvalidArgs);
    }

    let reserved_free = config.min_free_blks;
    let mut map_blocks = 1u32;
    for _ in 0..8 {
        let usable_blocks = num_virtual_blocks.saturating_sub(reserved_free + map_blocks);
        let extra_free = usable_blocks * config.extra_free_percent / 100;
        let volume_blocks = usable_blocks.saturating_sub(extra_free);
        let num_vpages = volume_blocks.saturating_mul(pages_per_block);
        let num_map_pgs = num_vpages.div_ceil(mappings_per_mpg) + 1; // +1 for the meta-page
        let needed_map_blocks = num_map_pgs.div_ceil(pages_per_block).max(1);
        if needed_map_blocks == map_blocks {
            if num_vpages == 0 {
                return Err(FtlError::InvalidArgs);
            }
            return Ok((num_vpages, num_map_pgs, mappings_per_mpg));
        }
        map_blocks = needed_map_blocks;
    }
    Err(FtlError::InvalidArgs)
}

impl<D: Driver> Ftln<D> {
    /// Format a fresh volume: format NDM underneath, then lay out an empty
    /// FTL-N volume (every virtual block free+erased, no map pages written).
    pub fn format(driver: D, geometry: Geometry, config: VolumeConfig) -> FtlResult<Self> {
        let ndm = Ndm::format(driver, geometry, config.write_format).map_err(FtlError::from)?;
        let num_virtual_blocks = ndm.num_virtual_blocks();
        let (num_vpages, num_map_pgs, mappings_per_mpg) =
            compute_layout(&geometry, &config, num_virtual_blocks)?;

        info!("ftln: formatted {num_vpages} vpages over {num_virtual_blocks} virtual blocks");

        Ok(Ftln {
            ndm,
            config,
            mappings_per_mpg,
            num_vpages,
            num_map_pgs,
            mpns: vec![UNMAPPED_PN; num_map_pgs as usize],
            bdata: vec![BlockData::free_erased(); num_virtual_blocks as usize],
            blk_wc_lag: vec![0; num_virtual_blocks as usize],
            high_wc: 0,
            high_bc: 0,
            free_vpn: None,
            free_mpn: None,
            num_free_blks: num_virtual_blocks,
            max_rc_blk: None,
            recycle_cnt: 0,
            map_cache: MapCache::new(config.map_cache_capacity as usize, geometry.page_size as usize),
            last_error: None,
            torn_writes: Vec::new(),
        })
    }

    /// Mount an existing volume: mount NDM (which resumes any interrupted
    /// bad-block relocation on its own), then rebuild all RAM-resident FTL-N
    /// state by scanning every virtual block's spare areas.
    pub fn mount(driver: D, geometry: Geometry, config: VolumeConfig, read_only: bool) -> FtlResult<Self> {
        let ndm = Ndm::mount(driver, geometry, read_only).map_err(FtlError::from)?;
        let num_virtual_blocks = ndm.num_virtual_blocks();
        let (num_vpages, num_map_pgs, mappings_per_mpg) =
            compute_layout(&geometry, &config, num_virtual_blocks)?;

        let mut ftln = Ftln {
            ndm,
            config,
            mappings_per_mpg,
            num_vpages,
            num_map_pgs,
            mpns: vec![UNMAPPED_PN; num_map_pgs as usize],
            bdata: vec![BlockData::free_erased(); num_virtual_blocks as usize],
            blk_wc_lag: vec![0; num_virtual_blocks as usize],
            high_wc: 0,
            high_bc: 0,
            free_vpn: None,
            free_mpn: None,
            num_free_blks: 0,
            max_rc_blk: None,
            recycle_cnt: 0,
            map_cache: MapCache::new(config.map_cache_capacity as usize, geometry.page_size as usize),
            last_error: None,
            torn_writes: Vec::new(),
        };
        rebuild_from_scan(&mut ftln)?;
        info!(
            "ftln: mounted, {} free blocks of {num_virtual_blocks}, high_wc={}",
            ftln.num_free_blks, ftln.high_wc
        );
        Ok(ftln)
    }
}

/// Classify every virtual block, find every map page's
/// latest copy, and recompute every volume block's live-page count from the
/// map's actual contents (not from a raw volume-block scan, which cannot by
/// itself disambiguate which copy of a vpn is current).
fn rebuild_from_scan<D: Driver>(ftln: &mut Ftln<D>) -> FtlResult<()> {
    let geometry = *ftln.ndm.geometry();
    let num_virtual_blocks = ftln.bdata.len() as u32;

    let mut kind = vec![BlockKind::Free; num_virtual_blocks as usize];
    let mut wear = vec![0u32; num_virtual_blocks as usize];
    let mut highest_offset = vec![None::<u32>; num_virtual_blocks as usize];
    let mut max_wear_count = 0u32;
    // mpn -> (ppn, block_count); highest block_count wins.
    let mut latest_map: HashMap<u32, (u32, u32)> = HashMap::new();

    let mut spare = vec![0u8; geometry.spare_size as usize];

    for vbn in 0..num_virtual_blocks {
        let first_page = geometry.first_page_of_block(vbn);
        let mut saw_map_page = false;
        for offset in 0..geometry.pages_per_block {
            let pn = first_page + offset;
            if ftln.ndm.read_page(pn, None, Some(&mut spare)).map_err(FtlError::from)? == ReadResult::Fatal {
                return Err(FtlError::Fatal);
            }
            if spare.iter().all(|&b| b == 0xFF) {
                continue;
            }
            let meta = SpareMeta::decode(&spare);
            if meta.is_control_page {
                continue; // shouldn't occur on a virtual block; ignore defensively
            }
            if !meta.is_valid() {
                // A torn write. Treat the block as
                // suspect and force it into the recycle set early by
                // leaving its classification as whatever earlier pages
                // established, but do not trust this page's own fields.
                warn!("ftln: torn write detected at pn {pn} (block {vbn}), recycling block early");
                ftln.torn_writes.push((vbn, offset));
                continue;
            }
            wear[vbn as usize] = meta.wear_count;
            max_wear_count = max_wear_count.max(meta.wear_count);
            highest_offset[vbn as usize] = Some(offset);
            if meta.block_count != NO_BLOCK_COUNT {
                saw_map_page = true;
                let m = meta.virtual_page;
                let better = match latest_map.get(&m) {
                    None => true,
                    Some(&(_, bc)) => meta.block_count > bc,
                };
                if better {
                    latest_map.insert(m, (pn, meta.block_count));
                }
            }
        }
        kind[vbn as usize] = if highest_offset[vbn as usize].is_none() {
            BlockKind::Free
        } else if saw_map_page {
            BlockKind::Map
        } else {
            BlockKind::Volume
        };
    }

    ftln.high_wc = max_wear_count;
    for vbn in 0..num_virtual_blocks as usize {
        ftln.blk_wc_lag[vbn] = max_wear_count.saturating_sub(wear[vbn]).min(255) as u8;
        ftln.bdata[vbn] = match kind[vbn] {
            BlockKind::Free => BlockData::free_erased(),
            BlockKind::Map => BlockData::new_used(true),
            BlockKind::Volume => BlockData::new_used(false),
        };
    }
    ftln.num_free_blks = kind.iter().filter(|k| **k == BlockKind::Free).count() as u32;

    let mut high_bc = 0u32;
    for (&m, &(ppn, bc)) in latest_map.iter() {
        if (m as usize) < ftln.mpns.len() {
            ftln.mpns[m as usize] = ppn;
        }
        high_bc = high_bc.max(bc);
    }
    ftln.high_bc = high_bc;

    // Recompute num_used_pages from the map's contents, not from a raw
    // per-block scan. The meta page is decoded separately below: it never
    // holds vpn -> ppn translations, so it never contributes used-page counts.
    let meta_page = ftln.num_map_pgs.saturating_sub(1);
    let page_size = geometry.page_size as usize;
    let mut page_buf = vec![0u8; page_size];
    for m in 0..ftln.num_map_pgs {
        if m == meta_page {
            continue;
        }
        let ppn = ftln.mpns[m as usize];
        if ppn == UNMAPPED_PN {
            continue;
        }
        if ftln.ndm.read_page(ppn, Some(&mut page_buf), None).map_err(FtlError::from)? == ReadResult::Fatal {
            return Err(FtlError::Fatal);
        }
        let mappings = ftln.mappings_per_mpg;
        for i in 0..mappings {
            let vpn = m * mappings + i;
            if vpn >= ftln.num_vpages {
                break;
            }
            let start = i as usize * 4;
            let entry_ppn = u32::from_le_bytes(page_buf[start..start + 4].try_into().unwrap());
            if entry_ppn == UNMAPPED_PN {
                continue;
            }
            let block = geometry.block_of_page(entry_ppn);
            if (block as usize) < ftln.bdata.len() {
                ftln.bdata[block as usize].inc_used();
            }
        }
    }

    apply_meta_page(ftln, meta_page, max_wear_count, &mut page_buf)?;

    debug!(
        "ftln: scan found {} map blocks, {} free blocks",
        kind.iter().filter(|k| **k == BlockKind::Map).count(),
        ftln.num_free_blks
    );

    // Find the resume candidates: the volume block and the newest map block
    // with the lowest highest-written offset, i.e. the ones a prior recycle
    // was most likely still relocating when power was lost.
    let mut resume_vblk = None;
    let mut resume_po = 0u32;
    for vbn in 0..num_virtual_blocks {
        if kind[vbn as usize] != BlockKind::Volume || ftln.bdata[vbn as usize].num_used_pages() == 0 {
            continue;
        }
        if let Some(po) = highest_offset[vbn as usize] {
            if resume_vblk.is_none() || po < resume_po {
                resume_vblk = Some(vbn);
                resume_po = po;
            }
        }
    }

    let mut high_bc_mblk = None;
    let mut high_bc_po = 0u32;
    for (&m, &(ppn, bc)) in latest_map.iter() {
        if m == meta_page || bc != high_bc {
            continue;
        }
        let block = geometry.block_of_page(ppn);
        if let Some(po) = highest_offset[block as usize] {
            high_bc_mblk = Some(block);
            high_bc_po = po;
        }
    }

    if ftln.num_free_blks < ftln.config.min_free_blks {
        if let Some(vblk) = resume_vblk {
            resume_volume_block(ftln, vblk, resume_po)?;
        }
        if let Some(mblk) = high_bc_mblk {
            resume_map_block(ftln, mblk, high_bc_po)?;
        }
    }

    Ok(())
}

/// Decode the meta page (if one has ever been written) and apply it.
/// `ErasedList` entries correct the wear-count lag of blocks the main scan
/// could only classify as free without ever seeing a wear-stamped page on
/// them; `ContFormat` means a block's format pass never completed, so it
/// cannot be trusted as erased until it is re-erased.
fn apply_meta_page<D: Driver>(
    ftln: &mut Ftln<D>,
    meta_page: u32,
    max_wear_count: u32,
    page_buf: &mut [u8],
) -> FtlResult<()> {
    let ppn = ftln.mpns[meta_page as usize];
    if ppn == UNMAPPED_PN {
        return Ok(());
    }
    if ftln.ndm.read_page(ppn, Some(page_buf), None).map_err(FtlError::from)? == ReadResult::Fatal {
        return Err(FtlError::Fatal);
    }
    match MetaPageBody::decode(page_buf) {
        Some(MetaPageBody::ErasedList(entries)) => {
            let mut trusted = 0;
            for (block, wc) in entries {
                if (block as usize) < ftln.bdata.len() && ftln.bdata[block as usize].is_free() {
                    ftln.bdata[block as usize].mark_free_erased();
                    ftln.blk_wc_lag[block as usize] = max_wear_count.saturating_sub(wc).min(255) as u8;
                    trusted += 1;
                }
            }
            debug!("ftln: meta page corrected wear lag for {trusted} free blocks");
        }
        Some(MetaPageBody::ContFormat { block }) => {
            if (block as usize) < ftln.bdata.len() {
                warn!("ftln: meta page reports format of block {block} was interrupted, marking unerased");
                if !ftln.bdata[block as usize].is_free() {
                    ftln.num_free_blks += 1;
                }
                ftln.bdata[block as usize] = BlockData::free_unerased();
            }
        }
        None => {}
    }
    Ok(())
}

/// Stage an `ErasedList` meta page covering the currently free+erased
/// blocks, so a future mount can correct their wear lag without needing to
/// see a stamped page on them. Called from [`Ftln::flush`].
pub(crate) fn stage_erased_list_meta_page<D: Driver>(ftln: &mut Ftln<D>) -> FtlResult<()> {
    let meta_mpn = ftln.num_map_pgs.saturating_sub(1);
    let page_size = ftln.ndm.geometry().page_size as usize;
    let mut entries = Vec::new();
    for (b, bd) in ftln.bdata.iter().enumerate() {
        if bd.is_erased() {
            let wear = ftln.high_wc.saturating_sub(ftln.blk_wc_lag[b] as u32);
            entries.push((b as u32, wear));
        }
    }
    let max_entries = page_size.saturating_sub(12) / 8;
    if entries.len() > max_entries {
        debug!("ftln: erased-block list capped at {max_entries} of {} free blocks for the meta page", entries.len());
        entries.truncate(max_entries);
    }
    let body = MetaPageBody::ErasedList(entries);
    let encoded = body.encode(page_size);
    let mut io = io_ctx!(ftln);
    let slot = ftln.map_cache.access(meta_mpn, true, &mut io)?;
    ftln.map_cache.data_mut(slot).copy_from_slice(&encoded);
    Ok(())
}

/// Bump `vbn`'s wear-count lag for one more erase cycle, without touching
/// its `bdata` free/used classification: callers that erase a block as part
/// of a larger state transition own that bookkeeping themselves.
fn erase_and_bump_wear<D: Driver>(ftln: &mut Ftln<D>, vbn: u32) -> FtlResult<()> {
    ftln.ndm.erase_block(vbn).map_err(FtlError::from)?;
    if ftln.blk_wc_lag[vbn as usize] == 0 {
        ftln.high_wc += 1;
        for lag in ftln.blk_wc_lag.iter_mut() {
            *lag = lag.saturating_add(1);
        }
    } else {
        ftln.blk_wc_lag[vbn as usize] -= 1;
    }
    Ok(())
}

/// Copy pages `0..=po_inclusive` from `src_block` to `dst_block` verbatim
/// (data and spare both unchanged): the spare's vpn/block-count metadata
/// describes the page's logical identity, not its physical location, so a
/// straight copy is enough to relocate it. Pages the driver reports as
/// untouched are skipped.
fn resume_copy_range<D: Driver>(
    ftln: &mut Ftln<D>,
    src_block: u32,
    dst_block: u32,
    po_inclusive: u32,
) -> FtlResult<()> {
    let geometry = *ftln.ndm.geometry();
    let src_first = geometry.first_page_of_block(src_block);
    let dst_first = geometry.first_page_of_block(dst_block);
    let mut data = vec![0u8; geometry.page_size as usize];
    let mut spare = vec![0u8; geometry.spare_size as usize];
    for offset in 0..=po_inclusive {
        let old_pn = src_first + offset;
        let new_pn = dst_first + offset;
        match ftln.ndm.read_page(old_pn, Some(&mut data), Some(&mut spare)).map_err(FtlError::from)? {
            ReadResult::Fatal => return Err(FtlError::Fatal),
            ReadResult::Uncorrectable => continue,
            ReadResult::Ok | ReadResult::UnsafeEcc => {}
        }
        if ftln.ndm.driver.is_empty_page(&data, &spare) {
            continue;
        }
        match ftln.ndm.write_page(new_pn, &data, &spare).map_err(FtlError::from)? {
            WriteResult::Ok => {}
            WriteResult::Fatal => return Err(FtlError::Fatal),
            WriteResult::BlockFailed => unreachable!("Ndm::write_page resolves BlockFailed internally"),
        }
    }
    Ok(())
}

/// Protect a volume block a prior recycle may have been mid-copy on: copy
/// its live prefix out to a scratch block, erase the original, then copy it
/// straight back. By the time this returns, `vblk` holds exactly what it
/// held before the crash and the scratch block is free again, so a second
/// crash during an in-progress recycle never costs more than one retry.
fn resume_volume_block<D: Driver>(ftln: &mut Ftln<D>, vblk: u32, po: u32) -> FtlResult<()> {
    let pages_per_block = ftln.ndm.geometry().pages_per_block;
    if po >= pages_per_block - 1 {
        return Ok(()); // nothing past the last offset to protect
    }
    let used_pages = ftln.bdata[vblk as usize].num_used_pages();

    let scratch = recycle::choose_free_block(&mut ftln.bdata, &ftln.blk_wc_lag, false).ok_or(FtlError::NoSpace)?;
    let scratch_needs_erase = !ftln.bdata[scratch as usize].is_erased();
    ftln.bdata[scratch as usize].mark_used(false);
    ftln.num_free_blks -= 1;
    if scratch_needs_erase {
        erase_and_bump_wear(ftln, scratch)?;
    }

    resume_copy_range(ftln, vblk, scratch, po)?;
    erase_and_bump_wear(ftln, vblk)?;
    resume_copy_range(ftln, scratch, vblk, po)?;
    erase_and_bump_wear(ftln, scratch)?;

    ftln.bdata[vblk as usize].mark_used(false);
    for _ in 0..used_pages {
        ftln.bdata[vblk as usize].inc_used();
    }
    ftln.bdata[scratch as usize].mark_free_erased();
    ftln.num_free_blks += 1;
    ftln.free_vpn = Some(ftln.ndm.geometry().first_page_of_block(vblk) + po + 1);
    info!("ftln: resumed interrupted recycle of volume block {vblk}, {used_pages} pages preserved via scratch block {scratch}");
    Ok(())
}

/// Same protection as [`resume_volume_block`], but for the newest map block,
/// which stays classified as a map block (not volume) once restored.
fn resume_map_block<D: Driver>(ftln: &mut Ftln<D>, mblk: u32, po: u32) -> FtlResult<()> {
    let pages_per_block = ftln.ndm.geometry().pages_per_block;
    if po >= pages_per_block - 1 {
        return Ok(());
    }
    let used_pages = ftln.bdata[mblk as usize].num_used_pages();

    let scratch = recycle::choose_free_block(&mut ftln.bdata, &ftln.blk_wc_lag, false).ok_or(FtlError::NoSpace)?;
    let scratch_needs_erase = !ftln.bdata[scratch as usize].is_erased();
    ftln.bdata[scratch as usize].mark_used(true);
    ftln.num_free_blks -= 1;
    if scratch_needs_erase {
        erase_and_bump_wear(ftln, scratch)?;
    }

    resume_copy_range(ftln, mblk, scratch, po)?;
    erase_and_bump_wear(ftln, mblk)?;
    resume_copy_range(ftln, scratch, mblk, po)?;
    erase_and_bump_wear(ftln, scratch)?;

    ftln.bdata[mblk as usize].mark_used(true);
    for _ in 0..used_pages {
        ftln.bdata[mblk as usize].inc_used();
    }
    ftln.bdata[scratch as usize].mark_free_erased();
    ftln.num_free_blks += 1;
    ftln.free_mpn = Some(ftln.ndm.geometry().first_page_of_block(mblk) + po + 1);
    info!("ftln: resumed interrupted recycle of map block {mblk}, {used_pages} pages preserved via scratch block {scratch}");
    Ok(())
}
