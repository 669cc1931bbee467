//! Statistics and known-issue diagnostics.

use super::Ftln;
use crate::error::FtlResult;
use crate::ndm::DriverCounters;
use ftl_driver::spare::UNMAPPED_PN;
use ftl_driver::Driver;
use core::fmt;

const WEAR_HISTOGRAM_BUCKETS: usize = 20;

/// Volume-wide statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Approximate bytes of RAM the in-memory state occupies.
    pub ram_used: u64,
    /// Highest wear count observed across any virtual block.
    pub wear_count: u32,
    /// Percentage (0..99) of pages in non-free blocks that are garbage.
    pub garbage_level: u32,
    /// Total virtual blocks on the volume.
    pub num_blocks: u32,
    /// Block counts bucketed by `wear_count * 20 / (high_wc + 1)`.
    pub wear_histogram: [u32; WEAR_HISTOGRAM_BUCKETS],
}

/// A known corruption symptom found while inspecting the volume (grounded
/// in `ftln/diagnose.cc`'s enumeration).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    /// A block's live-page counter exceeds its actual page capacity.
    OverfullBlock { block: u32, used_pages: u32, pages_per_block: u32 },
    /// A live map entry points at a page whose block has since been erased.
    StaleVpnPointer { vpn: u32, ppn: u32 },
    /// Free-block count is at or below the configured minimum: the volume is
    /// one write away from refusing new data.
    ExhaustedSpareBudget { num_free_blks: u32, min_free_blks: u32 },
    /// A torn write was found and excluded from the map during mount.
    PartialPageWrite { block: u32, page_offset: u32 },
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnosis::OverfullBlock { block, used_pages, pages_per_block } => {
                write!(f, "block {block} reports {used_pages} used pages but holds only {pages_per_block}")
            }
            Diagnosis::StaleVpnPointer { vpn, ppn } => {
                write!(f, "vpn {vpn} maps to ppn {ppn} whose block has already been erased")
            }
            Diagnosis::ExhaustedSpareBudget { num_free_blks, min_free_blks } => {
                write!(f, "only {num_free_blks} free blocks left, at or below the minimum of {min_free_blks}")
            }
            Diagnosis::PartialPageWrite { block, page_offset } => {
                write!(f, "partial (torn) write at block {block} offset {page_offset}")
            }
        }
    }
}

impl<D: Driver> Ftln<D> {
    pub fn get_counters(&self) -> DriverCounters {
        self.ndm.counters()
    }

    pub fn get_stats(&self) -> Stats {
        let pages_per_block = self.ndm.geometry().pages_per_block;
        let num_blocks = self.bdata.len() as u32;

        let mut live_pages: u64 = 0;
        let mut used_block_capacity: u64 = 0;
        for b in self.bdata.iter() {
            if b.is_free() {
                continue;
            }
            live_pages += b.num_used_pages().min(pages_per_block) as u64;
            used_block_capacity += pages_per_block as u64;
        }
        let garbage_level = if used_block_capacity == 0 {
            0
        } else {
            let garbage = used_block_capacity.saturating_sub(live_pages);
            ((garbage * 100) / used_block_capacity).min(99) as u32
        };

        let mut wear_histogram = [0u32; WEAR_HISTOGRAM_BUCKETS];
        for &lag in &self.blk_wc_lag {
            let wear = self.high_wc.saturating_sub(lag as u32);
            let bucket = (wear as u64 * WEAR_HISTOGRAM_BUCKETS as u64 / (self.high_wc as u64 + 1)) as usize;
            wear_histogram[bucket.min(WEAR_HISTOGRAM_BUCKETS - 1)] += 1;
        }

        let ram_used = (self.bdata.len() * core::mem::size_of::<super::bdata::BlockData>()
            + self.mpns.len() * 4
            + self.blk_wc_lag.len()
            + self.map_cache.capacity() * self.ndm.geometry().page_size as usize) as u64;

        Stats {
            ram_used,
            wear_count: self.high_wc,
            garbage_level,
            num_blocks,
            wear_histogram,
        }
    }

    /// Inspect the volume for known corruption symptoms. Requires read
    /// access to the media (map pages are re-read to check for stale
    /// pointers).
    pub fn diagnose_known_issues(&mut self) -> FtlResult<Vec<Diagnosis>> {
        let mut findings = Vec::new();
        let pages_per_block = self.ndm.geometry().pages_per_block;

        for (i, b) in self.bdata.iter().enumerate() {
            if !b.is_free() && b.num_used_pages() > pages_per_block {
                findings.push(Diagnosis::OverfullBlock {
                    block: i as u32,
                    used_pages: b.num_used_pages(),
                    pages_per_block,
                });
            }
        }

        if self.num_free_blks <= self.config.min_free_blks {
            findings.push(Diagnosis::ExhaustedSpareBudget {
                num_free_blks: self.num_free_blks,
                min_free_blks: self.config.min_free_blks,
            });
        }

        for &(block, page_offset) in &self.torn_writes {
            findings.push(Diagnosis::PartialPageWrite { block, page_offset });
        }

        let meta_page = self.num_map_pgs.saturating_sub(1);
        let page_size = self.ndm.geometry().page_size as usize;
        let mut page_buf = vec![0u8; page_size];
        for m in 0..self.num_map_pgs {
            if m == meta_page {
                continue;
            }
            let ppn = self.mpns[m as usize];
            if ppn == UNMAPPED_PN {
                continue;
            }
            if self.ndm.read_page(ppn, Some(&mut page_buf), None).map_err(crate::error::FtlError::from)?
                == ftl_driver::ReadResult::Fatal
            {
                return Err(crate::error::FtlError::Fatal);
            }
            for i in 0..self.mappings_per_mpg {
                let vpn = m * self.mappings_per_mpg + i;
                if vpn >= self.num_vpages {
                    break;
                }
                let start = i as usize * 4;
                let entry_ppn = u32::from_le_bytes(page_buf[start..start + 4].try_into().unwrap());
                if entry_ppn == UNMAPPED_PN {
                    continue;
                }
                let block = self.ndm.geometry().block_of_page(entry_ppn);
                if self.bdata[block as usize].is_free() {
                    findings.push(Diagnosis::StaleVpnPointer { vpn, ppn: entry_ppn });
                }
            }
        }

        Ok(findings)
    }
}
