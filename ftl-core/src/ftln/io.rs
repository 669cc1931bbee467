//! FTL-N read/write/trim paths.

use super::recycle::recycle_until_satisfied;
use super::Ftln;
use crate::error::{FtlError, FtlResult};
use ftl_driver::spare::{SpareMeta, NO_BLOCK_COUNT, UNMAPPED_PN};
use ftl_driver::{Driver, ReadResult, WriteResult};
use log::warn;

impl<D: Driver> Ftln<D> {
    /// Read `count` vpages starting at `first_vpn`, following each through
    /// the map cache to its current physical page.
    pub fn read_pages(&mut self, first_vpn: u32, count: u32, out: &mut [u8]) -> FtlResult<()> {
        if self.last_error == Some(FtlError::Fatal) {
            return Err(FtlError::Fatal);
        }
        if first_vpn.checked_add(count).map_or(true, |end| end > self.num_vpages) {
            return Err(FtlError::InvalidArgs);
        }

        if self.max_rc_blk.is_some() {
            recycle_until_satisfied(self, 0)?;
        }

        let page_size = self.ndm.geometry().page_size as usize;
        if out.len() < count as usize * page_size {
            return Err(FtlError::InvalidArgs);
        }

        for i in 0..count {
            let vpn = first_vpn + i;
            let buf = &mut out[i as usize * page_size..(i as usize + 1) * page_size];
            let ppn = self.lookup_ppn(vpn)?;
            if ppn == UNMAPPED_PN {
                buf.fill(0xFF);
                continue;
            }
            match self.ndm.read_page(ppn, Some(buf), None).map_err(FtlError::from)? {
                ReadResult::Ok => {}
                ReadResult::UnsafeEcc => {
                    let block = self.ndm.geometry().block_of_page(ppn);
                    self.bdata[block as usize].set_read_count(self.config.max_rc);
                    self.max_rc_blk = Some(block);
                    warn!("ftln: unsafe ECC on vpn {vpn}, block {block} flagged for recycle");
                }
                ReadResult::Uncorrectable => {
                    self.last_error = Some(FtlError::Ndm(crate::error::NdmError::BadMetaData));
                    return Err(FtlError::Ndm(crate::error::NdmError::BadMetaData));
                }
                ReadResult::Fatal => {
                    self.last_error = Some(FtlError::Fatal);
                    return Err(FtlError::Fatal);
                }
            }
        }
        Ok(())
    }

    /// Copy-on-write `count` vpages starting at `first_vpn`: each lands on a
    /// fresh physical page and the map is updated to point at it.
    pub fn write_pages(&mut self, first_vpn: u32, count: u32, data: &[u8]) -> FtlResult<()> {
        if self.last_error == Some(FtlError::Fatal) {
            return Err(FtlError::Fatal);
        }
        if first_vpn.checked_add(count).map_or(true, |end| end > self.num_vpages) {
            return Err(FtlError::InvalidArgs);
        }
        let page_size = self.ndm.geometry().page_size as usize;
        if data.len() < count as usize * page_size {
            return Err(FtlError::InvalidArgs);
        }

        recycle_until_satisfied(self, count)?;

        for i in 0..count {
            let vpn = first_vpn + i;
            let buf = &data[i as usize * page_size..(i as usize + 1) * page_size];

            let low_on_free = self.num_free_blks < self.config.min_free_blks;
            let new_ppn = super::alloc_page(
                &mut self.ndm,
                &mut self.bdata,
                &self.blk_wc_lag,
                &mut self.free_vpn,
                &mut self.num_free_blks,
                low_on_free,
                false,
            )?;
            let new_block = self.ndm.geometry().block_of_page(new_ppn);
            let wear_count = self.high_wc.saturating_sub(self.blk_wc_lag[new_block as usize] as u32);
            let meta = SpareMeta::for_page(vpn, NO_BLOCK_COUNT, wear_count);
            let mut spare = vec![0u8; self.ndm.geometry().spare_size as usize];
            meta.encode(&mut spare);

            match self.ndm.write_page(new_ppn, buf, &spare).map_err(FtlError::from)? {
                WriteResult::Ok => {}
                WriteResult::Fatal => {
                    self.last_error = Some(FtlError::Fatal);
                    return Err(FtlError::Fatal);
                }
                WriteResult::BlockFailed => unreachable!("Ndm::write_page resolves BlockFailed internally"),
            }

            self.set_ppn(vpn, new_ppn)?;
            let pages_per_block = self.ndm.geometry().pages_per_block;
            self.free_vpn = if (new_ppn + 1) % pages_per_block == 0 {
                None
            } else {
                Some(new_ppn + 1)
            };
        }
        Ok(())
    }

    /// Unmap without touching media. A subsequent read returns all-ones;
    /// the physical page is reclaimed at the next recycle of its block.
    pub fn trim_pages(&mut self, first_vpn: u32, count: u32) -> FtlResult<()> {
        if self.last_error == Some(FtlError::Fatal) {
            return Err(FtlError::Fatal);
        }
        if first_vpn.checked_add(count).map_or(true, |end| end > self.num_vpages) {
            return Err(FtlError::InvalidArgs);
        }
        for i in 0..count {
            let vpn = first_vpn + i;
            self.set_ppn(vpn, UNMAPPED_PN)?;
        }
        Ok(())
    }
}
