//! FTL-N: the log-structured translator built on top of NDM.

pub mod bdata;
pub mod io;
pub mod map_cache;
pub(crate) mod meta;
pub mod mount;
pub mod recycle;
pub mod stats;

use crate::config::VolumeConfig;
use crate::error::{FtlError, FtlResult};
use crate::ndm::Ndm;
use bdata::BlockData;
use ftl_driver::spare::{SpareMeta, UNMAPPED_PN};
use ftl_driver::{Driver, ReadResult, WriteResult};
use map_cache::{MapCache, MapPageIo};
use std::collections::HashSet;

/// The FTL-N translator. Generic over the same driver as the [`Ndm`] it sits on.
pub struct Ftln<D: Driver> {
    pub(crate) ndm: Ndm<D>,
    pub(crate) config: VolumeConfig,
    pub(crate) mappings_per_mpg: u32,
    pub(crate) num_vpages: u32,
    pub(crate) num_map_pgs: u32,
    /// Physical page number holding each map page, or [`UNMAPPED_PN`].
    pub(crate) mpns: Vec<u32>,
    pub(crate) bdata: Vec<BlockData>,
    /// `high_wc - blk_wc_lag[b]` is block `b`'s erase count.
    pub(crate) blk_wc_lag: Vec<u8>,
    pub(crate) high_wc: u32,
    pub(crate) high_bc: u32,
    pub(crate) free_vpn: Option<u32>,
    pub(crate) free_mpn: Option<u32>,
    pub(crate) num_free_blks: u32,
    pub(crate) max_rc_blk: Option<u32>,
    pub(crate) recycle_cnt: u64,
    pub(crate) map_cache: MapCache,
    pub(crate) last_error: Option<FtlError>,
    /// `(block, page_offset)` pairs where the mount scan found a torn write
    ///, kept for `DiagnoseKnownIssues`.
    pub(crate) torn_writes: Vec<(u32, u32)>,
}

/// Borrows the disjoint fields of [`Ftln`] that [`MapCache`] needs in order
/// to fault map pages in and out, without borrowing `map_cache` itself.
pub(crate) struct IoCtx<'a, D: Driver> {
    pub(crate) ndm: &'a mut Ndm<D>,
    pub(crate) mpns: &'a mut Vec<u32>,
    pub(crate) bdata: &'a mut Vec<BlockData>,
    pub(crate) blk_wc_lag: &'a [u8],
    pub(crate) high_wc: u32,
    pub(crate) high_bc: &'a mut u32,
    pub(crate) free_mpn: &'a mut Option<u32>,
    pub(crate) num_free_blks: &'a mut u32,
    pub(crate) min_free_blks: u32,
    pub(crate) pages_per_block: u32,
}

impl<D: Driver> MapPageIo for IoCtx<'_, D> {
    fn write_map_page(&mut self, mpn: u32, data: &[u8]) -> FtlResult<()> {
        let low_on_free = *self.num_free_blks < self.min_free_blks;
        let new_ppn = alloc_page(
            self.ndm,
            self.bdata,
            self.blk_wc_lag,
            self.free_mpn,
            self.num_free_blks,
            low_on_free,
            true,
        )?;
        *self.high_bc += 1;
        let new_block = self.ndm.geometry().block_of_page(new_ppn);
        let wear_count = self.high_wc.saturating_sub(self.blk_wc_lag[new_block as usize] as u32);
        let meta = SpareMeta::for_page(mpn, *self.high_bc, wear_count);
        let mut spare = vec![0u8; self.ndm.geometry().spare_size as usize];
        meta.encode(&mut spare);
        match self
            .ndm
            .write_page(new_ppn, data, &spare)
            .map_err(FtlError::from)?
        {
            WriteResult::Ok => {}
            WriteResult::Fatal => return Err(FtlError::Fatal),
            WriteResult::BlockFailed => unreachable!("Ndm::write_page resolves BlockFailed internally"),
        }
        let old_ppn = self.mpns[mpn as usize];
        if old_ppn != UNMAPPED_PN {
            let old_block = self.ndm.geometry().block_of_page(old_ppn);
            self.bdata[old_block as usize].dec_used();
        }
        self.bdata[new_block as usize].inc_used();
        self.mpns[mpn as usize] = new_ppn;
        *self.free_mpn = if (new_ppn + 1) % self.pages_per_block == 0 {
            None
        } else {
            Some(new_ppn + 1)
        };
        Ok(())
    }

    fn read_map_page(&mut self, mpn: u32, data: &mut [u8]) -> FtlResult<bool> {
        let ppn = self.mpns[mpn as usize];
        if ppn == UNMAPPED_PN {
            return Ok(false);
        }
        match self.ndm.read_page(ppn, Some(data), None).map_err(FtlError::from)? {
            ReadResult::Ok | ReadResult::UnsafeEcc => Ok(true),
            ReadResult::Uncorrectable => {
                // An unreadable map page makes the vpages it covers
                // implicitly unmapped rather than failing the mount.
                Ok(false)
            }
            ReadResult::Fatal => Err(FtlError::Fatal),
        }
    }
}

/// Allocate the next physical page from a rolling block cursor (`free_vpn`/
/// `free_mpn`), pulling a fresh block from the free pool when the cursor is
/// empty. Wear-leveling block choice lives in [`recycle::choose_free_block`];
/// this just drives the cursor once a block is in hand.
pub(crate) fn alloc_page<D: Driver>(
    ndm: &mut Ndm<D>,
    bdata: &mut [BlockData],
    blk_wc_lag: &[u8],
    cursor: &mut Option<u32>,
    num_free_blks: &mut u32,
    low_on_free: bool,
    is_map_block: bool,
) -> FtlResult<u32> {
    if let Some(ppn) = *cursor {
        return Ok(ppn);
    }
    let vbn = recycle::choose_free_block(bdata, blk_wc_lag, low_on_free).ok_or(FtlError::NoSpace)?;
    bdata[vbn as usize].mark_used(is_map_block);
    *num_free_blks -= 1;
    let first_page = ndm.geometry().first_page_of_block(vbn);
    *cursor = Some(first_page);
    Ok(first_page)
}

/// Borrow the disjoint fields of `$self: &mut Ftln<D>` that `IoCtx` needs,
/// leaving `$self.map_cache` free to be borrowed separately at the call
/// site. Must expand directly against a `self`/`ftln` binding, not a method
/// call, so the borrow checker sees the field projections.
macro_rules! io_ctx {
    ($self:ident) => {{
        let pages_per_block = $self.ndm.geometry().pages_per_block;
        let high_wc = $self.high_wc;
        IoCtx {
            ndm: &mut $self.ndm,
            mpns: &mut $self.mpns,
            bdata: &mut $self.bdata,
            blk_wc_lag: &$self.blk_wc_lag,
            high_wc,
            high_bc: &mut $self.high_bc,
            free_mpn: &mut $self.free_mpn,
            num_free_blks: &mut $self.num_free_blks,
            min_free_blks: $self.config.min_free_blks,
            pages_per_block,
        }
    }};
}
pub(crate) use io_ctx;

impl<D: Driver> Ftln<D> {
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn num_vpages(&self) -> u32 {
        self.num_vpages
    }

    pub fn last_error(&self) -> Option<FtlError> {
        self.last_error
    }

    /// `mpn`/offset-within-map-page for virtual page `vpn`.
    pub(crate) fn map_coords(&self, vpn: u32) -> (u32, u32) {
        (vpn / self.mappings_per_mpg, vpn % self.mappings_per_mpg)
    }

    /// Current physical page number mapped to `vpn`, or [`UNMAPPED_PN`].
    pub(crate) fn lookup_ppn(&mut self, vpn: u32) -> FtlResult<u32> {
        let (mpn, off) = self.map_coords(vpn);
        let mut io = io_ctx!(self);
        let slot = self.map_cache.access(mpn, false, &mut io)?;
        let bytes = self.map_cache.data(slot);
        let start = off as usize * 4;
        Ok(u32::from_le_bytes(bytes[start..start + 4].try_into().unwrap()))
    }

    /// Point `vpn` at `new_ppn` (or unmap it), keeping `bdata` live-page
    /// counts in sync with the old and new physical pages.
    pub(crate) fn set_ppn(&mut self, vpn: u32, new_ppn: u32) -> FtlResult<()> {
        let (mpn, off) = self.map_coords(vpn);
        let mut io = io_ctx!(self);
        let slot = self.map_cache.access(mpn, true, &mut io)?;
        let bytes = self.map_cache.data_mut(slot);
        let start = off as usize * 4;
        let old_ppn = u32::from_le_bytes(bytes[start..start + 4].try_into().unwrap());
        bytes[start..start + 4].copy_from_slice(&new_ppn.to_le_bytes());
        if old_ppn != UNMAPPED_PN {
            let old_block = self.ndm.geometry().block_of_page(old_ppn);
            self.bdata[old_block as usize].dec_used();
        }
        if new_ppn != UNMAPPED_PN {
            let new_block = self.ndm.geometry().block_of_page(new_ppn);
            self.bdata[new_block as usize].inc_used();
        }
        Ok(())
    }

    pub fn flush(&mut self) -> FtlResult<()> {
        mount::stage_erased_list_meta_page(self)?;
        let mut io = io_ctx!(self);
        self.map_cache.flush_all(&mut io)?;
        self.ndm.persist().map_err(FtlError::from)
    }

    /// Distinct virtual blocks currently free+erased. Exposed for stats/tests.
    pub(crate) fn free_block_set(&self) -> HashSet<u32> {
        self.bdata
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_free())
            .map(|(i, _)| i as u32)
            .collect()
    }
}
